//! Document-store seam used as the signalling relay.
//!
//! Paths are `/`-separated: even segments name collections, odd segments
//! name records (`calls/{id}/offerCandidates`).

pub mod memory;

pub use memory::MemoryStore;

use crate::error::CallError;
use crate::subscription::Subscription;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Record or entry payload.
pub type Fields = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("malformed document: {0}")]
    Malformed(String),
}

impl From<StoreError> for CallError {
    fn from(e: StoreError) -> Self {
        CallError::Channel(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Malformed(e.to_string())
    }
}

/// One change in a watched collection.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionChange {
    Added { id: String, data: Fields },
    Modified { id: String, data: Fields },
    Removed { id: String },
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Allocates and creates an empty record, returning its id.
    async fn create_record(&self, collection: &str) -> Result<String, StoreError>;

    /// Path of a sub-collection scoped under a record.
    fn subcollection(&self, record_path: &str, name: &str) -> String {
        format!("{record_path}/{name}")
    }

    /// Create-or-merge write.
    async fn write_record(&self, path: &str, fields: Fields) -> Result<(), StoreError>;

    async fn read_record(&self, path: &str) -> Result<Option<Fields>, StoreError>;

    async fn append_to_collection(&self, path: &str, payload: Fields)
        -> Result<String, StoreError>;

    /// Current snapshot immediately, then one per change.
    async fn watch_record(&self, path: &str)
        -> Result<Subscription<Option<Fields>>, StoreError>;

    /// Existing entries first (as `Added`, in insertion order), then live changes.
    async fn watch_collection(
        &self,
        path: &str,
    ) -> Result<Subscription<CollectionChange>, StoreError>;
}

pub(crate) fn check_path(path: &str) -> Result<(), StoreError> {
    if path.is_empty() || path.split('/').any(|segment| segment.trim().is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}
