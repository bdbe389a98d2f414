use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, RwLock},
};

use rand::{Rng as _, thread_rng};

use crate::scenario::ServerHandle;

/// Named groups of direct server connections (for example `"routers"` and
/// `"shards"`) shared by every worker of a run.
#[derive(Clone, Default)]
pub struct ConnectionCache {
    inner: Arc<RwLock<BTreeMap<String, Vec<Arc<dyn ServerHandle>>>>>,
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut map = f.debug_map();
        for (group, connections) in guard.iter() {
            let addresses: Vec<&str> = connections.iter().map(|c| c.address()).collect();
            map.entry(group, &addresses);
        }
        map.finish()
    }
}

impl ConnectionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_group(self, group: impl Into<String>, connections: Vec<Arc<dyn ServerHandle>>) -> Self {
        self.insert_group(group, connections);
        self
    }

    /// Replace the connections of `group`.
    pub fn insert_group(&self, group: impl Into<String>, connections: Vec<Arc<dyn ServerHandle>>) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        guard.insert(group.into(), connections);
    }

    #[must_use]
    pub fn group(&self, group: &str) -> Vec<Arc<dyn ServerHandle>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    /// Choose a random connection from `group` if present.
    pub fn random(&self, group: &str) -> Option<Arc<dyn ServerHandle>> {
        let connections = self.group(group);
        if connections.is_empty() {
            return None;
        }
        let idx = thread_rng().gen_range(0..connections.len());
        connections.get(idx).cloned()
    }
}
