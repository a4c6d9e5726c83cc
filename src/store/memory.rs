use super::{check_path, CollectionChange, DocumentStore, Fields, StoreError};
use crate::subscription::{self, Publisher, Subscription};
use crate::utils::random_id;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

struct StoredRecord {
    fields: Fields,
    created: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, StoredRecord>,
    collections: HashMap<String, Vec<(String, Fields)>>,
    record_watchers: HashMap<String, Vec<Publisher<Option<Fields>>>>,
    collection_watchers: HashMap<String, Vec<Publisher<CollectionChange>>>,
}

impl Inner {
    /// Drops cancelled watchers on every path, and paths left with none.
    fn prune_watchers(&mut self) {
        fn prune<T>(watchers: &mut HashMap<String, Vec<Publisher<T>>>) {
            watchers.retain(|_, list| {
                list.retain(|w| !w.is_closed());
                !list.is_empty()
            });
        }
        prune(&mut self.record_watchers);
        prune(&mut self.collection_watchers);
    }
}

/// In-process document store.
///
/// Every write and its fan-out to watchers happen under one lock, so each
/// watcher observes changes to a path in the order they were made.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
    retention: Option<TimeDelta>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records older than `retention` read as absent.
    pub fn with_retention(retention: TimeDelta) -> Self {
        Self {
            retention: Some(retention),
            ..Self::default()
        }
    }

    /// Simulates losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::Release);
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn is_expired(&self, record: &StoredRecord) -> bool {
        match self.retention {
            Some(retention) => Utc::now() - record.created >= retention,
            None => false,
        }
    }

    fn live_fields(&self, inner: &Inner, path: &str) -> Option<Fields> {
        inner
            .records
            .get(path)
            .filter(|record| !self.is_expired(record))
            .map(|record| record.fields.clone())
    }

    fn notify_record(inner: &mut Inner, path: &str, snapshot: Option<Fields>) {
        if let Some(watchers) = inner.record_watchers.get_mut(path) {
            watchers.retain(|w| w.publish(snapshot.clone()));
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_record(&self, collection: &str) -> Result<String, StoreError> {
        self.ensure_online()?;
        check_path(collection)?;

        let mut inner = self.inner.lock();
        let mut id = random_id();
        while inner.records.contains_key(&format!("{collection}/{id}")) {
            id = random_id();
        }
        let path = format!("{collection}/{id}");
        inner.records.insert(
            path.clone(),
            StoredRecord {
                fields: Fields::new(),
                created: Utc::now(),
            },
        );
        Self::notify_record(&mut inner, &path, Some(Fields::new()));
        debug!("created record {}", path);
        Ok(id)
    }

    async fn write_record(&self, path: &str, fields: Fields) -> Result<(), StoreError> {
        self.ensure_online()?;
        check_path(path)?;

        let mut inner = self.inner.lock();
        let expired = inner
            .records
            .get(path)
            .map(|record| self.is_expired(record))
            .unwrap_or(false);
        if expired {
            inner.records.remove(path);
        }
        let record = inner
            .records
            .entry(path.to_string())
            .or_insert_with(|| StoredRecord {
                fields: Fields::new(),
                created: Utc::now(),
            });
        for (key, value) in fields {
            record.fields.insert(key, value);
        }
        let snapshot = record.fields.clone();
        Self::notify_record(&mut inner, path, Some(snapshot));
        Ok(())
    }

    async fn read_record(&self, path: &str) -> Result<Option<Fields>, StoreError> {
        self.ensure_online()?;
        check_path(path)?;
        let inner = self.inner.lock();
        Ok(self.live_fields(&inner, path))
    }

    async fn append_to_collection(
        &self,
        path: &str,
        payload: Fields,
    ) -> Result<String, StoreError> {
        self.ensure_online()?;
        check_path(path)?;

        let mut inner = self.inner.lock();
        let id = random_id();
        inner
            .collections
            .entry(path.to_string())
            .or_default()
            .push((id.clone(), payload.clone()));
        if let Some(watchers) = inner.collection_watchers.get_mut(path) {
            watchers.retain(|w| {
                w.publish(CollectionChange::Added {
                    id: id.clone(),
                    data: payload.clone(),
                })
            });
        }
        Ok(id)
    }

    async fn watch_record(&self, path: &str) -> Result<Subscription<Option<Fields>>, StoreError> {
        self.ensure_online()?;
        check_path(path)?;

        let (tx, rx) = subscription::channel();
        let mut inner = self.inner.lock();
        inner.prune_watchers();
        tx.publish(self.live_fields(&inner, path));
        inner
            .record_watchers
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn watch_collection(
        &self,
        path: &str,
    ) -> Result<Subscription<CollectionChange>, StoreError> {
        self.ensure_online()?;
        check_path(path)?;

        let (tx, rx) = subscription::channel();
        let mut inner = self.inner.lock();
        inner.prune_watchers();
        if let Some(entries) = inner.collections.get(path) {
            for (id, data) in entries {
                tx.publish(CollectionChange::Added {
                    id: id.clone(),
                    data: data.clone(),
                });
            }
        }
        inner
            .collection_watchers
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
