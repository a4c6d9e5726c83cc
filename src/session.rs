//! Session directory: allocation and lookup of call records.

use crate::error::{CallError, Result};
use crate::peer::types::CandidateRole;
use crate::store::{DocumentStore, Fields};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

const MAX_SESSION_ID_LEN: usize = 128;

/// Opaque identifier of a call record, shared out of band.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Validates an id pasted by the joining party.
    pub fn parse(raw: &str) -> Result<Self> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(CallError::channel("malformed session id: empty"));
        }
        if id.len() > MAX_SESSION_ID_LEN {
            return Err(CallError::channel("malformed session id: too long"));
        }
        if id.contains('/') || id.chars().any(char::is_whitespace) {
            return Err(CallError::channel(format!("malformed session id: {id:?}")));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct SessionDirectory {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl SessionDirectory {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub fn record_path(&self, id: &SessionId) -> String {
        format!("{}/{}", self.collection, id)
    }

    pub fn candidates_path(&self, id: &SessionId, role: CandidateRole) -> String {
        self.store.subcollection(&self.record_path(id), role.collection())
    }

    /// Allocates a fresh call record.
    pub async fn create_session(&self) -> Result<SessionId> {
        let raw = self.store.create_record(&self.collection).await?;
        let id = SessionId::parse(&raw)?;

        let mut stamp = Fields::new();
        stamp.insert(
            "createdAt".into(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
        self.store.write_record(&self.record_path(&id), stamp).await?;

        info!("created call session {}", id);
        Ok(id)
    }

    /// True iff a (non-expired) record exists for `id`.
    pub async fn resolve_session(&self, id: &SessionId) -> Result<bool> {
        let exists = self
            .store
            .read_record(&self.record_path(id))
            .await?
            .is_some();
        debug!("resolve session {} -> {}", id, exists);
        Ok(exists)
    }

    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}
