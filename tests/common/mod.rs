#![allow(dead_code)]

use async_trait::async_trait;
use mindcall_lib::error::{CallError, Result};
use mindcall_lib::peer::media::{LocalStream, LocalTrack, MediaConstraints, MediaSource, TrackKind};
use mindcall_lib::peer::transport::{
    LinkState, PeerTransport, TransportEvent, TransportEvents, TransportFactory,
};
use mindcall_lib::peer::types::{IceCandidate, SdpType, SessionDescription};
use mindcall_lib::{CallConfig, CallState, ClientContext, MemoryStore, VideoCall};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Records what the state machine does to the peer connection.
#[derive(Default)]
pub struct FakeState {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub remote_sets: usize,
    pub queued: Vec<IceCandidate>,
    pub applied: Vec<IceCandidate>,
    pub closed: bool,
}

pub struct FakeTransport {
    pub events: TransportEvents,
    pub state: Mutex<FakeState>,
    pub offer_sdp: String,
    pub answer_sdp: String,
}

impl FakeTransport {
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_candidate(&self, line: &str) {
        self.emit(TransportEvent::LocalCandidate(candidate(line)));
    }

    pub fn emit_link(&self, link: LinkState) {
        self.emit(TransportEvent::LinkState(link));
    }

    pub fn remote_sets(&self) -> usize {
        self.state.lock().remote_sets
    }

    pub fn applied(&self) -> Vec<String> {
        self.state
            .lock()
            .applied
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, _track: &LocalTrack) -> Result<()> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(self.offer_sdp.clone()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(self.answer_sdp.clone()))
            }
            _ => Err(CallError::negotiation("no remote offer")),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.state.lock().local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::negotiation("peer connection closed"));
        }
        state.remote = Some(desc);
        state.remote_sets += 1;
        let queued = std::mem::take(&mut state.queued);
        state.applied.extend(queued);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::negotiation("peer connection closed"));
        }
        if state.remote.is_none() {
            state.queued.push(candidate);
        } else {
            state.applied.push(candidate);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.queued.clear();
        Ok(())
    }
}

/// Hands out [`FakeTransport`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakeFactory {
    pub created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn last(&self) -> Arc<FakeTransport> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no transport created yet")
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let n = self.created.lock().len();
        let transport = Arc::new(FakeTransport {
            events,
            state: Mutex::new(FakeState::default()),
            offer_sdp: format!("v=0 offer-{n}"),
            answer_sdp: format!("v=0 answer-{n}"),
        });
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Camera that can be switched to "permission denied".
#[derive(Default)]
pub struct FakeMedia {
    pub deny: AtomicBool,
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CallError::permission("camera access denied"));
        }
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, "fake"));
        }
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, "fake"));
        }
        Ok(LocalStream::new("fake", tracks))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub media: Arc<FakeMedia>,
    pub factory: Arc<FakeFactory>,
    pub ctx: Arc<ClientContext>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CallConfig::default())
    }

    pub fn with_config(config: CallConfig) -> Self {
        Self::with_store(config, MemoryStore::new())
    }

    pub fn with_store(config: CallConfig, store: MemoryStore) -> Self {
        let store = Arc::new(store);
        let media = Arc::new(FakeMedia::default());
        let factory = Arc::new(FakeFactory::default());
        let ctx = ClientContext::initialize(config, store.clone(), media.clone(), factory.clone())
            .expect("valid config");
        Self {
            store,
            media,
            factory,
            ctx,
        }
    }

    pub fn call(&self) -> VideoCall {
        VideoCall::new(self.ctx.clone())
    }
}

pub fn candidate(line: &str) -> IceCandidate {
    IceCandidate {
        candidate: line.to_string(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub async fn wait_for_state(call: &VideoCall, wanted: CallState) {
    let mut rx = call.subscribe();
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *rx.borrow_and_update() == wanted {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "expected {wanted}, still {}", call.state());
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
