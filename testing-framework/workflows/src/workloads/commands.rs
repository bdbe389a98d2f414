//! Command documents shared by the sample workloads.

use fsm_framework_core::scenario::{DynError, ServerError, ServerHandle};
use serde_json::{Value, json};

/// Database the sample workloads create their collections in.
pub const DATABASE: &str = "fsm_test";

pub async fn create_collection(server: &dyn ServerHandle, collection: &str) -> Result<(), DynError> {
    run(server, json!({ "create": collection })).await?;
    Ok(())
}

pub async fn drop_collection(server: &dyn ServerHandle, collection: &str) -> Result<(), DynError> {
    run(server, json!({ "drop": collection })).await?;
    Ok(())
}

pub async fn insert_one(
    server: &dyn ServerHandle,
    collection: &str,
    document: Value,
) -> Result<(), DynError> {
    let reply = run(server, json!({ "insert": collection, "documents": [document] })).await?;
    match reply.get("n").and_then(Value::as_u64) {
        Some(1) => Ok(()),
        other => Err(format!("insert into '{collection}' reported n = {other:?}").into()),
    }
}

pub async fn count_documents(server: &dyn ServerHandle, collection: &str) -> Result<u64, DynError> {
    let reply = run(server, json!({ "count": collection })).await?;
    reply
        .get("n")
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("count of '{collection}' returned no 'n': {reply}").into())
}

pub async fn kill_all_sessions(server: &dyn ServerHandle) -> Result<(), DynError> {
    server
        .run_command("admin", json!({ "killAllSessions": [] }))
        .await
        .and_then(ServerError::check_reply)?;
    Ok(())
}

async fn run(server: &dyn ServerHandle, command: Value) -> Result<Value, ServerError> {
    server
        .run_command(DATABASE, command)
        .await
        .and_then(ServerError::check_reply)
}
