//! Signalling channel over the shared call record.
//!
//! The initiator owns `offer` and `offerCandidates`, the joiner owns `answer`
//! and `answerCandidates`. Each field has a single writer, so no locking is
//! needed beyond refusing to overwrite a published description.

use crate::error::{CallError, Result};
use crate::peer::types::{
    CandidateEntry, CandidateRole, IceCandidate, SessionDescription, SessionRecord,
};
use crate::session::{SessionDirectory, SessionId};
use crate::store::{CollectionChange, Fields};
use crate::subscription::Subscription;
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct SignallingChannel {
    directory: SessionDirectory,
}

impl SignallingChannel {
    pub fn new(directory: SessionDirectory) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    /// One-shot read of the call record.
    pub async fn read_session(&self, id: &SessionId) -> Result<SessionRecord> {
        let path = self.directory.record_path(id);
        let fields = self
            .directory
            .store()
            .read_record(&path)
            .await?
            .ok_or_else(|| CallError::session_not_found(id))?;
        decode_record(fields)
    }

    pub async fn publish_offer(&self, id: &SessionId, offer: &SessionDescription) -> Result<()> {
        let record = self.read_session(id).await?;
        if let Some(existing) = record.offer {
            if existing == *offer {
                debug!("offer for {} already published", id);
                return Ok(());
            }
            return Err(CallError::channel(format!(
                "session {id} already has a different offer"
            )));
        }
        self.write_description(id, "offer", offer).await?;
        info!("published offer for session {}", id);
        Ok(())
    }

    pub async fn publish_answer(&self, id: &SessionId, answer: &SessionDescription) -> Result<()> {
        let record = self.read_session(id).await?;
        if record.offer.is_none() {
            return Err(CallError::session_not_found(format!(
                "{id} has no offer to answer"
            )));
        }
        if let Some(existing) = record.answer {
            if existing == *answer {
                debug!("answer for {} already published", id);
                return Ok(());
            }
            return Err(CallError::channel(format!("session {id} is already answered")));
        }
        self.write_description(id, "answer", answer).await?;
        info!("published answer for session {}", id);
        Ok(())
    }

    /// Appends a locally gathered candidate to `role`'s collection.
    pub async fn append_candidate(
        &self,
        id: &SessionId,
        role: CandidateRole,
        candidate: &IceCandidate,
    ) -> Result<String> {
        let path = self.directory.candidates_path(id, role);
        let payload = match serde_json::to_value(candidate) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(CallError::channel("candidate did not encode to an object")),
            Err(e) => return Err(CallError::channel(e)),
        };
        let entry_id = self
            .directory
            .store()
            .append_to_collection(&path, payload)
            .await?;
        debug!("appended {} candidate {} to {}", role, entry_id, id);
        Ok(entry_id)
    }

    pub async fn watch_session(&self, id: &SessionId) -> Result<SessionWatch> {
        let path = self.directory.record_path(id);
        let inner = self.directory.store().watch_record(&path).await?;
        Ok(SessionWatch {
            session: id.clone(),
            inner,
        })
    }

    pub async fn watch_candidates(
        &self,
        id: &SessionId,
        role: CandidateRole,
    ) -> Result<CandidateWatch> {
        let path = self.directory.candidates_path(id, role);
        let inner = self.directory.store().watch_collection(&path).await?;
        Ok(CandidateWatch {
            session: id.clone(),
            role,
            inner,
        })
    }

    async fn write_description(
        &self,
        id: &SessionId,
        field: &str,
        desc: &SessionDescription,
    ) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert(
            field.to_string(),
            serde_json::to_value(desc).map_err(CallError::channel)?,
        );
        self.directory
            .store()
            .write_record(&self.directory.record_path(id), fields)
            .await?;
        Ok(())
    }
}

fn decode_record(fields: Fields) -> Result<SessionRecord> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| CallError::channel(format!("malformed session record: {e}")))
}

/// Snapshots of one call record.
#[derive(Debug)]
pub struct SessionWatch {
    session: SessionId,
    inner: Subscription<Option<Fields>>,
}

impl SessionWatch {
    /// Next decodable snapshot. A deleted/expired record yields an empty one.
    pub async fn next(&mut self) -> Option<SessionRecord> {
        loop {
            let snapshot = self.inner.next().await?;
            match snapshot {
                None => return Some(SessionRecord::default()),
                Some(fields) => match decode_record(fields) {
                    Ok(record) => return Some(record),
                    Err(e) => warn!("skipping snapshot of {}: {}", self.session, e),
                },
            }
        }
    }

    pub fn cancel(&mut self) {
        self.inner.cancel();
    }
}

/// Candidates added to one role's collection, in insertion order.
#[derive(Debug)]
pub struct CandidateWatch {
    session: SessionId,
    role: CandidateRole,
    inner: Subscription<CollectionChange>,
}

impl CandidateWatch {
    pub async fn next(&mut self) -> Option<CandidateEntry> {
        loop {
            match self.inner.next().await? {
                CollectionChange::Added { id, data } => {
                    match serde_json::from_value::<IceCandidate>(Value::Object(data)) {
                        Ok(candidate) => return Some(CandidateEntry { id, candidate }),
                        Err(e) => warn!(
                            "skipping malformed {} candidate {} in {}: {}",
                            self.role, id, self.session, e
                        ),
                    }
                }
                CollectionChange::Modified { id, .. } | CollectionChange::Removed { id } => {
                    debug!("ignoring change to {} candidate {}", self.role, id)
                }
            }
        }
    }

    pub fn role(&self) -> CandidateRole {
        self.role
    }

    pub fn cancel(&mut self) {
        self.inner.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, MemoryStore};
    use std::sync::Arc;

    async fn channel_with_session() -> (SignallingChannel, SessionId, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let directory = SessionDirectory::new(store.clone(), "calls");
        let id = directory.create_session().await.unwrap();
        (SignallingChannel::new(directory), id, store)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_offer_then_answer_roundtrip() {
        let (ch, id, _) = channel_with_session().await;
        ch.publish_offer(&id, &SessionDescription::offer("A"))
            .await
            .unwrap();
        ch.publish_answer(&id, &SessionDescription::answer("B"))
            .await
            .unwrap();

        let record = ch.read_session(&id).await.unwrap();
        assert_eq!(record.offer, Some(SessionDescription::offer("A")));
        assert_eq!(record.answer, Some(SessionDescription::answer("B")));
        assert!(record.created_at.is_some());
    }

    #[tokio::test]
    async fn test_republishing_identical_offer_is_noop() {
        let (ch, id, _) = channel_with_session().await;
        let offer = SessionDescription::offer("A");
        ch.publish_offer(&id, &offer).await.unwrap();
        ch.publish_offer(&id, &offer).await.unwrap();
        let err = ch
            .publish_offer(&id, &SessionDescription::offer("other"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Channel);
    }

    #[tokio::test]
    async fn test_answer_requires_offer() {
        let (ch, id, _) = channel_with_session().await;
        let err = ch
            .publish_answer(&id, &SessionDescription::answer("B"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn test_second_joiner_rejected() {
        let (ch, id, _) = channel_with_session().await;
        ch.publish_offer(&id, &SessionDescription::offer("A"))
            .await
            .unwrap();
        ch.publish_answer(&id, &SessionDescription::answer("B"))
            .await
            .unwrap();
        assert!(ch
            .publish_answer(&id, &SessionDescription::answer("C"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_watch_session_sees_answer() {
        let (ch, id, _) = channel_with_session().await;
        ch.publish_offer(&id, &SessionDescription::offer("A"))
            .await
            .unwrap();

        let mut watch = ch.watch_session(&id).await.unwrap();
        let first = watch.next().await.unwrap();
        assert!(first.answer.is_none());

        ch.publish_answer(&id, &SessionDescription::answer("B"))
            .await
            .unwrap();
        let second = watch.next().await.unwrap();
        assert_eq!(second.answer, Some(SessionDescription::answer("B")));
    }

    #[tokio::test]
    async fn test_candidates_delivered_fifo_across_interleavings() {
        let (ch, id, _) = channel_with_session().await;
        // two entries before the watch starts, three after
        for n in 0..2 {
            ch.append_candidate(&id, CandidateRole::Offer, &candidate(n))
                .await
                .unwrap();
        }
        let mut watch = ch
            .watch_candidates(&id, CandidateRole::Offer)
            .await
            .unwrap();
        let producer = {
            let ch = ch.clone();
            let id = id.clone();
            tokio::spawn(async move {
                for n in 2..5 {
                    ch.append_candidate(&id, CandidateRole::Offer, &candidate(n))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        for n in 0..5 {
            let entry = watch.next().await.unwrap();
            assert_eq!(entry.candidate, candidate(n));
        }
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_roles_are_isolated() {
        let (ch, id, _) = channel_with_session().await;
        ch.append_candidate(&id, CandidateRole::Answer, &candidate(1))
            .await
            .unwrap();
        let mut offers = ch
            .watch_candidates(&id, CandidateRole::Offer)
            .await
            .unwrap();
        ch.append_candidate(&id, CandidateRole::Offer, &candidate(2))
            .await
            .unwrap();
        assert_eq!(offers.next().await.unwrap().candidate, candidate(2));
    }

    #[tokio::test]
    async fn test_malformed_candidate_skipped() {
        let (ch, id, store) = channel_with_session().await;
        let path = ch.directory().candidates_path(&id, CandidateRole::Offer);
        let mut junk = Fields::new();
        junk.insert("nope".into(), Value::from(1));
        store.append_to_collection(&path, junk).await.unwrap();
        ch.append_candidate(&id, CandidateRole::Offer, &candidate(3))
            .await
            .unwrap();

        let mut watch = ch
            .watch_candidates(&id, CandidateRole::Offer)
            .await
            .unwrap();
        assert_eq!(watch.next().await.unwrap().candidate, candidate(3));
    }

    #[tokio::test]
    async fn test_offline_store_surfaces_channel_error() {
        let (ch, id, store) = channel_with_session().await;
        store.set_available(false);
        let err = ch
            .append_candidate(&id, CandidateRole::Offer, &candidate(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Channel);
    }
}
