//! Connection state machine for one side of a video call.
//!
//! ```text
//! Idle -> MediaAcquired -> (Offering | Answering) -> Connected -> Closed
//!                     \______________ any ______________/ -> Failed
//! ```
//!
//! Every background task (event pump, answer watch, remote-candidate watch,
//! grace timer) captures the [`Liveness`] of the attempt that spawned it and
//! re-checks it before touching call state, because unsubscribing and an
//! in-flight delivery can race.

use crate::context::ClientContext;
use crate::error::{CallError, Result};
use crate::peer::ice::{analyze_candidates, AppliedCandidates};
use crate::peer::media::{LocalStream, RemoteStream};
use crate::peer::state::{Affordances, CallState};
use crate::peer::transport::{LinkState, PeerTransport, TransportEvent};
use crate::peer::types::{CandidateRole, IceCandidate, SdpType, SessionDescription};
use crate::session::SessionId;
use crate::signaling::{CandidateWatch, SessionWatch, SignallingChannel};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-attempt liveness flag. Killed on hang-up or failure.
#[derive(Clone, Debug)]
struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }

    fn same(&self, other: &Liveness) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(CallError::Closed)
        }
    }
}

#[derive(Debug, Clone)]
struct Binding {
    session: SessionId,
    role: CandidateRole,
}

enum PumpCommand {
    Bind(Binding),
}

/// Everything owned by one media acquisition.
struct ActiveCall {
    live: Liveness,
    transport: Arc<dyn PeerTransport>,
    local: LocalStream,
    remote: RemoteStream,
    pump_tx: mpsc::UnboundedSender<PumpCommand>,
    session: Option<SessionId>,
    answer_applied: bool,
    applied: AppliedCandidates,
    link: LinkState,
    tasks: Vec<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
    }
}

struct CallInner {
    ctx: Arc<ClientContext>,
    state: watch::Sender<CallState>,
    active: Mutex<Option<ActiveCall>>,
    actions: tokio::sync::Mutex<()>,
}

impl Drop for CallInner {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.get_mut().take() {
            active.live.kill();
            active.abort_tasks();
            active.local.stop();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let transport = active.transport.clone();
                handle.spawn(async move {
                    let _ = transport.close().await;
                });
            }
        }
    }
}

/// One side of a call. Cheap to clone; clones share the same call.
#[derive(Clone)]
pub struct VideoCall {
    inner: Arc<CallInner>,
}

impl VideoCall {
    pub fn new(ctx: Arc<ClientContext>) -> Self {
        let (state, _) = watch::channel(CallState::Idle);
        Self {
            inner: Arc::new(CallInner {
                ctx,
                state,
                active: Mutex::new(None),
                actions: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> CallState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.inner.state.subscribe()
    }

    pub fn affordances(&self) -> Affordances {
        self.state().affordances()
    }

    /// Id to share out of band (initiator) or the one being answered.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner
            .active
            .lock()
            .as_ref()
            .and_then(|a| a.session.clone())
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.inner.active.lock().as_ref().map(|a| a.local.clone())
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.inner.active.lock().as_ref().map(|a| a.remote.clone())
    }

    /// "Start camera": acquires local media and prepares a fresh peer connection.
    pub async fn start_media(&self) -> Result<LocalStream> {
        let _action = self.inner.actions.lock().await;
        self.check_enabled("start camera", |a| a.start_camera)?;
        let ctx = self.inner.ctx.clone();
        ctx.ensure_open()?;

        let local = match ctx.media().acquire(ctx.config().media).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("media acquisition failed: {}", e);
                self.inner.state.send_replace(CallState::Failed(e.kind()));
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match ctx.transports().create(events_tx).await {
            Ok(t) => t,
            Err(e) => {
                local.stop();
                self.inner.state.send_replace(CallState::Failed(e.kind()));
                return Err(e);
            }
        };
        for track in local.tracks() {
            if let Err(e) = transport.add_track(track).await {
                error!("failed to attach local {:?} track: {}", track.kind(), e);
                local.stop();
                let _ = transport.close().await;
                self.inner.state.send_replace(CallState::Failed(e.kind()));
                return Err(e);
            }
        }

        let live = Liveness::new();
        let (pump_tx, pump_rx) = mpsc::unbounded_channel();

        {
            let mut slot = self.inner.active.lock();
            // the pump must not observe an empty slot
            let pump = tokio::spawn(run_pump(
                Arc::downgrade(&self.inner),
                live.clone(),
                ctx.signalling().clone(),
                ctx.config().grace_period,
                events_rx,
                pump_rx,
            ));
            *slot = Some(ActiveCall {
                live,
                transport,
                local: local.clone(),
                remote: RemoteStream::new(),
                pump_tx,
                session: None,
                answer_applied: false,
                applied: AppliedCandidates::default(),
                link: LinkState::New,
                tasks: vec![pump],
                grace: None,
            });
            self.inner.state.send_replace(CallState::MediaAcquired);
        }
        info!("local media ready: {} track(s)", local.tracks().len());
        Ok(local)
    }

    /// "Call": creates a session, publishes the offer and waits for an answer
    /// in the background. Returns the id to share with the other party.
    pub async fn call(&self) -> Result<SessionId> {
        let _action = self.inner.actions.lock().await;
        self.check_enabled("call", |a| a.call)?;
        let (live, transport) = self.current()?;
        let signalling = self.inner.ctx.signalling().clone();

        let session = match signalling.directory().create_session().await {
            Ok(id) => id,
            Err(e) => return Err(self.fail(&live, e).await),
        };
        if !self.bind(&live, &session, CandidateRole::Offer) {
            return Err(CallError::Closed);
        }
        self.transition(&live, CallState::MediaAcquired, CallState::Offering);

        let setup = async {
            let offer = transport.create_offer().await?;
            transport.set_local_description(offer.clone()).await?;
            live.ensure_alive()?;
            signalling.publish_offer(&session, &offer).await?;
            live.ensure_alive()?;

            let answers = signalling.watch_session(&session).await?;
            let candidates = signalling
                .watch_candidates(&session, CandidateRole::Answer)
                .await?;
            self.spawn_task(
                &live,
                watch_answer(Arc::downgrade(&self.inner), live.clone(), answers),
            );
            self.spawn_task(
                &live,
                watch_remote_candidates(Arc::downgrade(&self.inner), live.clone(), candidates),
            );
            Ok::<(), CallError>(())
        };
        match setup.await {
            Ok(()) => {
                info!("calling: session {}", session);
                Ok(session)
            }
            Err(e) => Err(self.fail(&live, e).await),
        }
    }

    /// "Answer": joins the session identified by a pasted id.
    pub async fn answer(&self, session_id: &str) -> Result<()> {
        let _action = self.inner.actions.lock().await;
        self.check_enabled("answer", |a| a.answer)?;
        let (live, transport) = self.current()?;
        let signalling = self.inner.ctx.signalling().clone();

        let session = match SessionId::parse(session_id) {
            Ok(id) => id,
            Err(e) => return Err(self.fail(&live, e).await),
        };

        // unknown session: report, stay in MediaAcquired
        let record = match signalling.read_session(&session).await {
            Ok(record) => record,
            Err(e @ CallError::SessionNotFound(_)) => {
                warn!("cannot answer {}: {}", session, e);
                return Err(e);
            }
            Err(e) => return Err(self.fail(&live, e).await),
        };
        let Some(offer) = record.offer else {
            warn!("cannot answer {}: no offer published", session);
            return Err(CallError::session_not_found(format!("{session} has no offer")));
        };

        if !self.bind(&live, &session, CandidateRole::Answer) {
            return Err(CallError::Closed);
        }
        self.transition(&live, CallState::MediaAcquired, CallState::Answering);

        let setup = async {
            if offer.sdp_type != SdpType::Offer {
                return Err(CallError::negotiation("session offer has the wrong type"));
            }
            transport.set_remote_description(offer).await?;
            let answer = transport.create_answer().await?;
            transport.set_local_description(answer.clone()).await?;
            live.ensure_alive()?;
            signalling.publish_answer(&session, &answer).await?;
            live.ensure_alive()?;

            let candidates = signalling
                .watch_candidates(&session, CandidateRole::Offer)
                .await?;
            self.spawn_task(
                &live,
                watch_remote_candidates(Arc::downgrade(&self.inner), live.clone(), candidates),
            );
            Ok::<(), CallError>(())
        };
        match setup.await {
            Ok(()) => {
                info!("answered session {}", session);
                Ok(())
            }
            Err(e) => Err(self.fail(&live, e).await),
        }
    }

    /// "Hang up". Idempotent.
    pub async fn hang_up(&self) {
        let taken = {
            let mut slot = self.inner.active.lock();
            if *self.inner.state.borrow() == CallState::Closed && slot.is_none() {
                return;
            }
            let taken = slot.take();
            if let Some(active) = &taken {
                active.live.kill();
            }
            self.inner.state.send_replace(CallState::Closed);
            taken
        };
        if let Some(active) = taken {
            teardown(active).await;
        }
        info!("call closed");
    }

    fn check_enabled(&self, action: &'static str, enabled: fn(&Affordances) -> bool) -> Result<()> {
        let state = self.state();
        if enabled(&state.affordances()) {
            Ok(())
        } else {
            Err(CallError::InvalidState { action, state })
        }
    }

    fn current(&self) -> Result<(Liveness, Arc<dyn PeerTransport>)> {
        self.inner
            .active
            .lock()
            .as_ref()
            .filter(|a| a.live.is_alive())
            .map(|a| (a.live.clone(), a.transport.clone()))
            .ok_or(CallError::Closed)
    }

    /// Runs `f` on the active call if it still belongs to `live`.
    fn with_active<R>(&self, live: &Liveness, f: impl FnOnce(&mut ActiveCall) -> R) -> Option<R> {
        let mut slot = self.inner.active.lock();
        match slot.as_mut() {
            Some(active) if active.live.same(live) && live.is_alive() => Some(f(active)),
            _ => None,
        }
    }

    fn transition(&self, live: &Liveness, from: CallState, to: CallState) -> bool {
        self.with_active(live, |_| {
            self.inner.state.send_if_modified(|state| {
                if *state == from {
                    debug!("call state {} -> {}", from, to);
                    *state = to;
                    true
                } else {
                    false
                }
            })
        })
        .unwrap_or(false)
    }

    fn bind(&self, live: &Liveness, session: &SessionId, role: CandidateRole) -> bool {
        self.with_active(live, |active| {
            active.session = Some(session.clone());
            let _ = active.pump_tx.send(PumpCommand::Bind(Binding {
                session: session.clone(),
                role,
            }));
        })
        .is_some()
    }

    fn spawn_task<F>(&self, live: &Liveness, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut slot = self.inner.active.lock();
        match slot.as_mut() {
            Some(active) if active.live.same(live) && live.is_alive() => active.tasks.push(handle),
            _ => handle.abort(),
        }
    }

    /// Tears the attempt down and moves to `Failed`. Returns the error to
    /// report, or `Closed` if the attempt was already gone.
    async fn fail(&self, live: &Liveness, err: CallError) -> CallError {
        let taken = {
            let mut slot = self.inner.active.lock();
            let current = matches!(
                slot.as_ref(),
                Some(active) if active.live.same(live) && live.is_alive()
            );
            if current {
                live.kill();
                self.inner.state.send_replace(CallState::Failed(err.kind()));
                slot.take()
            } else {
                None
            }
        };
        match taken {
            Some(active) => {
                error!("call failed: {}", err);
                teardown(active).await;
                err
            }
            None => {
                debug!("error after close ignored: {}", err);
                CallError::Closed
            }
        }
    }

    /// `fail` from inside a task that teardown would abort.
    fn fail_in_background(&self, live: Liveness, err: CallError) {
        let call = self.clone();
        tokio::spawn(async move {
            call.fail(&live, err).await;
        });
    }

    /// Sets the remote answer exactly once per attempt.
    async fn apply_answer(&self, live: &Liveness, answer: SessionDescription) -> Result<bool> {
        let transport = self.with_active(live, |active| {
            if active.answer_applied {
                None
            } else {
                active.answer_applied = true;
                Some(active.transport.clone())
            }
        });
        let Some(transport) = transport.flatten() else {
            return Ok(false);
        };
        if answer.sdp_type != SdpType::Answer {
            return Err(CallError::negotiation("session answer has the wrong type"));
        }
        if transport.has_remote_description().await {
            return Ok(false);
        }
        transport.set_remote_description(answer).await?;
        Ok(true)
    }

    /// Transport for a not-yet-applied remote candidate entry.
    fn claim_candidate(&self, live: &Liveness, entry_id: &str) -> Option<Arc<dyn PeerTransport>> {
        self.with_active(live, |active| {
            active
                .applied
                .mark(entry_id)
                .then(|| active.transport.clone())
        })
        .flatten()
    }
}

async fn teardown(mut active: ActiveCall) {
    active.live.kill();
    active.abort_tasks();
    if let Err(e) = active.transport.close().await {
        debug!("closing peer connection: {}", e);
    }
    active.local.stop();
    active.remote.clear();
}

fn upgrade(weak: &Weak<CallInner>) -> Option<VideoCall> {
    weak.upgrade().map(|inner| VideoCall { inner })
}

/// Consumes transport events for one attempt.
async fn run_pump(
    weak: Weak<CallInner>,
    live: Liveness,
    signalling: SignallingChannel,
    grace_period: Duration,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<PumpCommand>,
) {
    let mut binding: Option<Binding> = None;
    let mut pending: Vec<IceCandidate> = Vec::new();
    let mut gathered: Vec<IceCandidate> = Vec::new();

    loop {
        tokio::select! {
            biased;

            Some(PumpCommand::Bind(bound)) = commands.recv() => {
                debug!(
                    "forwarding {} buffered local candidate(s) to {}",
                    pending.len(),
                    bound.session
                );
                for candidate in pending.drain(..) {
                    if let Err(e) = signalling
                        .append_candidate(&bound.session, bound.role, &candidate)
                        .await
                    {
                        if let Some(call) = upgrade(&weak) {
                            call.fail_in_background(live.clone(), e);
                        }
                        return;
                    }
                }
                binding = Some(bound);
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                if !live.is_alive() {
                    break;
                }
                let Some(call) = upgrade(&weak) else { break };

                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        gathered.push(candidate.clone());
                        match &binding {
                            Some(bound) => {
                                if let Err(e) = signalling
                                    .append_candidate(&bound.session, bound.role, &candidate)
                                    .await
                                {
                                    call.fail_in_background(live.clone(), e);
                                    return;
                                }
                            }
                            None => pending.push(candidate),
                        }
                    }
                    TransportEvent::GatheringComplete => {
                        analyze_candidates(&gathered);
                    }
                    TransportEvent::RemoteTrack(track) => {
                        call.with_active(&live, |active| active.remote.add_track(track));
                    }
                    TransportEvent::LinkState(link) => {
                        on_link_state(&call, &live, link, grace_period);
                    }
                }
            }
        }
    }
    debug!("transport event pump stopped");
}

fn on_link_state(call: &VideoCall, live: &Liveness, link: LinkState, grace_period: Duration) {
    match link {
        LinkState::Connected => {
            let recovered = call.with_active(live, |active| {
                active.link = LinkState::Connected;
                // cancel a pending disconnect, if any
                active.grace.take().map(|grace| grace.abort()).is_some()
            });
            if recovered == Some(true) {
                info!("connection recovered during grace period");
            }
            if !call.transition(live, CallState::Offering, CallState::Connected) {
                call.transition(live, CallState::Answering, CallState::Connected);
            }
        }
        LinkState::Disconnected | LinkState::Failed => {
            let weak = Arc::downgrade(&call.inner);
            let task_live = live.clone();
            call.with_active(live, |active| {
                active.link = link;
                if active.grace.is_some() {
                    debug!("grace period already running, ignoring {:?}", link);
                    return;
                }
                warn!(
                    "peer link {:?}, waiting {} s before giving up",
                    link,
                    grace_period.as_secs()
                );
                active.grace = Some(tokio::spawn(grace_timer(weak, task_live, grace_period)));
            });
        }
        other => debug!("peer link state {:?}", other),
    }
}

async fn grace_timer(weak: Weak<CallInner>, live: Liveness, grace_period: Duration) {
    tokio::time::sleep(grace_period).await;
    let Some(call) = upgrade(&weak) else { return };
    let link = call.with_active(&live, |active| {
        active.grace = None;
        active.link
    });
    match link {
        Some(LinkState::Connected) | None => {}
        Some(link) => call.fail_in_background(
            live,
            CallError::connection_lost(format!(
                "link stayed {link:?} for {} s",
                grace_period.as_secs()
            )),
        ),
    }
}

/// Initiator side: applies the first answer seen in a session snapshot.
async fn watch_answer(weak: Weak<CallInner>, live: Liveness, mut watch: SessionWatch) {
    while let Some(record) = watch.next().await {
        if !live.is_alive() {
            break;
        }
        let Some(answer) = record.answer else {
            continue;
        };
        let Some(call) = upgrade(&weak) else { break };
        match call.apply_answer(&live, answer).await {
            Ok(true) => info!("remote answer applied"),
            Ok(false) => debug!("answer already applied, snapshot ignored"),
            Err(e) => {
                call.fail_in_background(live.clone(), e);
                break;
            }
        }
    }
    watch.cancel();
}

/// Applies the remote party's candidates in insertion order, once each.
async fn watch_remote_candidates(weak: Weak<CallInner>, live: Liveness, mut watch: CandidateWatch) {
    let role = watch.role();
    while let Some(entry) = watch.next().await {
        if !live.is_alive() {
            debug!("dropping late {} candidate {}", role, entry.id);
            break;
        }
        let Some(call) = upgrade(&weak) else { break };
        let Some(transport) = call.claim_candidate(&live, &entry.id) else {
            continue;
        };
        debug!("applying remote {} candidate {}", role, entry.id);
        if let Err(e) = transport.add_ice_candidate(entry.candidate).await {
            if live.is_alive() {
                call.fail_in_background(live.clone(), e);
            } else {
                debug!("candidate apply failed after close: {}", e);
            }
            break;
        }
    }
    watch.cancel();
}
