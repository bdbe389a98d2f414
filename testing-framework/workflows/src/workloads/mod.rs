pub mod chaos;
pub mod commands;
pub mod insert_count;
pub mod kill_sessions;
