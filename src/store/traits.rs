//! Backend-agnostic key-value interface.

use async_trait::async_trait;

use crate::error::StoreError;

/// String key-value persistence.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Insert or replace the value under `key`.
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
}
