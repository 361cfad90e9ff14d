//! Local durable cache: a small key-value store that lets the node restart without
//! waiting for the center.

mod cache;
mod libsql_backend;
mod migrations;
mod traits;

pub use cache::{KEY_CENTER_HOST, KEY_NODE_ID, KEY_TASKS, LocalCache};
pub use libsql_backend::LibSqlStore;
pub use traits::KvStore;
