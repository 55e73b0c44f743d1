//! Call state machine
//!
//! The single source of truth for call state on one client. Commands come
//! from the UI; events come from the signaling channel and the session
//! store's update feed. Every transition runs under one lock, so transitions
//! are atomic with respect to each other. Lifecycle decisions (accept,
//! reject, supersede) are derived from the persisted session status; channel
//! messages are treated as delivery hints.

use crate::application::state::{CallPhase, CallSnapshot};
use crate::config::CallConfig;
use crate::domain::glare;
use crate::domain::presence::PresenceReader;
use crate::domain::session::aggregate::CallSession;
use crate::domain::session::entity::Participant;
use crate::domain::session::repository::{InsertOutcome, SessionStore};
use crate::domain::session::value_object::{CallStatus, EndReason};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{AttemptId, CallId};
use crate::infrastructure::media::backend::MediaConstraints;
use crate::infrastructure::media::manager::MediaSessionManager;
use crate::infrastructure::media::peer::PeerRole;
use crate::infrastructure::media::quality::NetworkQuality;
use crate::infrastructure::media::stream::{LocalStream, RemoteStream};
use crate::infrastructure::signaling::hub::{SignalingHandle, SignalingTransport};
use crate::infrastructure::signaling::message::{LifecycleNotice, SignalEnvelope, SignalPayload};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Explicit per-screen context. Identity is resolved before construction and
/// never re-derived mid-call.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub local: Participant,
    pub config: CallConfig,
}

struct Inner {
    phase: CallPhase,
    attempt: AttemptId,
    session: Option<CallSession>,
    remote: Option<Participant>,
    channel: Option<SignalingHandle>,
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    is_muted: bool,
    is_video_off: bool,
    remote_muted: bool,
    remote_video_off: bool,
    quality: NetworkQuality,
    end_reason: Option<EndReason>,
    last_error: Option<CallError>,
    /// Last applied lifecycle notice, for duplicate-delivery idempotence
    applied: Option<(CallId, LifecycleNotice)>,
    /// An acceptance is acquiring media off-lock; blocks re-entry while the
    /// phase is still `Incoming`
    accepting: bool,
}

impl Inner {
    fn call_id(&self) -> Option<CallId> {
        self.session.as_ref().map(|s| s.id())
    }
}

/// The call orchestrator for one client
pub struct CallMachine {
    ctx: SessionContext,
    store: Arc<dyn SessionStore>,
    signaling: Arc<dyn SignalingTransport>,
    media: Arc<MediaSessionManager>,
    presence: Arc<dyn PresenceReader>,
    inner: Mutex<Inner>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    /// Set once realtime delivery is suspected unavailable; the interface
    /// layer reads this to engage the fallback poll.
    degraded: AtomicBool,
}

impl CallMachine {
    pub fn new(
        ctx: SessionContext,
        store: Arc<dyn SessionStore>,
        signaling: Arc<dyn SignalingTransport>,
        media: Arc<MediaSessionManager>,
        presence: Arc<dyn PresenceReader>,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(CallSnapshot::default());
        Arc::new(Self {
            ctx,
            store,
            signaling,
            media,
            presence,
            inner: Mutex::new(Inner {
                phase: CallPhase::Idle,
                attempt: AttemptId::initial(),
                session: None,
                remote: None,
                channel: None,
                local_stream: None,
                remote_stream: None,
                is_muted: false,
                is_video_off: false,
                remote_muted: false,
                remote_video_off: false,
                quality: NetworkQuality::Good,
                end_reason: None,
                last_error: None,
                applied: None,
                accepting: false,
            }),
            snapshot_tx,
            degraded: AtomicBool::new(false),
        })
    }

    pub fn local_participant(&self) -> &Participant {
        &self.ctx.local
    }

    pub fn config(&self) -> &CallConfig {
        &self.ctx.config
    }

    /// Reactive view for the UI
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub async fn current_call_id(&self) -> Option<CallId> {
        self.inner.lock().await.call_id()
    }

    /// Whether realtime signaling delivery is suspected unavailable
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Re-read a specific session row (fallback poll path)
    pub async fn poll_call(&self, call_id: CallId) -> Result<Option<CallSession>> {
        self.store.find_by_id(call_id).await
    }

    /// Look for any live session involving this participant (fallback poll
    /// path while idle).
    pub async fn poll_live_for_self(&self) -> Result<Option<CallSession>> {
        self.store
            .find_live_for_participant(self.ctx.local.id())
            .await
    }

    /// Consume the store's update feed. Spawned once per machine, when the
    /// call screen mounts.
    pub fn spawn_store_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.store.subscribe();
        let machine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(session) => machine.reconcile(session).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "store feed lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // UI commands
    // ------------------------------------------------------------------

    /// Place an outbound call. Creates the session row, opens signaling,
    /// and acquires local media.
    pub async fn start_outgoing_call(self: &Arc<Self>, remote: Participant) -> Result<CallId> {
        let mut inner = self.inner.lock().await;
        if inner.phase != CallPhase::Idle {
            return Err(CallError::InvalidCallState(format!(
                "cannot start a call while {}",
                inner.phase.as_str()
            )));
        }
        if !self.presence.is_reachable(remote.id()) {
            return Err(CallError::PeerOffline(format!(
                "{} is not reachable",
                remote.id()
            )));
        }

        self.media.mark_user_gesture();
        let session = CallSession::new(self.ctx.local.clone(), remote.clone());

        match self.store.insert(&session).await? {
            InsertOutcome::Created => {}
            InsertOutcome::Conflict(existing) => {
                // Never create a duplicate live row. If the existing live
                // session is the other side calling us, join it instead.
                if existing.callee().id() == self.ctx.local.id() {
                    info!(
                        call_id = %existing.id(),
                        "outbound attempt joins existing inbound session"
                    );
                    let call_id = existing.id();
                    self.enter_incoming(&mut inner, existing).await;
                    return Ok(call_id);
                }
                return Err(CallError::Conflict(format!(
                    "a call between this pair is already live ({})",
                    existing.id()
                )));
            }
        }

        let call_id = session.id();
        inner.attempt = inner.attempt.next();
        let attempt = inner.attempt;
        info!(%call_id, %attempt, remote = %remote.id(), "starting outbound call");

        inner.phase = CallPhase::Calling;
        inner.session = Some(session);
        inner.remote = Some(remote);
        self.open_channel(&mut inner, call_id).await;
        self.send_lifecycle(&inner, LifecycleNotice::Requested);
        self.spawn_ring_timer(attempt);
        self.publish(&inner);
        drop(inner);

        // Media acquisition is the slow part; run it off-lock and re-check
        // the attempt token on completion.
        match self.media.acquire(attempt, MediaConstraints::default()).await {
            Ok(stream) => {
                let mut inner = self.inner.lock().await;
                if inner.attempt != attempt || inner.phase != CallPhase::Calling {
                    // The attempt moved on while we were acquiring
                    self.media.teardown(attempt).await;
                } else {
                    inner.local_stream = Some(stream);
                    self.publish(&inner);
                }
                Ok(call_id)
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if inner.attempt == attempt && inner.phase == CallPhase::Calling {
                    self.fail_current(&mut inner, EndReason::MediaError, Some(e.clone()))
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Accept the inbound call currently ringing on this device
    pub async fn accept_incoming_call(self: &Arc<Self>, call_id: CallId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.phase != CallPhase::Incoming || inner.call_id() != Some(call_id) || inner.accepting
        {
            return Err(CallError::InvalidCallState(format!(
                "call {} is not ringing here (phase {})",
                call_id,
                inner.phase.as_str()
            )));
        }

        self.media.mark_user_gesture();
        let attempt = inner.attempt;
        inner.accepting = true;
        info!(%call_id, "incoming call accepted");
        drop(inner);

        // Devices and the peer connection come up before anything is
        // persisted or announced: the caller's offer never arrives into a
        // peerless answering side, and the local phase never runs ahead of
        // the persisted status. Until the accepted write lands, this side
        // still presents as ringing.
        let stream = match self.media.acquire(attempt, MediaConstraints::default()).await {
            Ok(stream) => stream,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if inner.attempt == attempt && inner.phase == CallPhase::Incoming {
                    self.fail_current(&mut inner, EndReason::MediaError, Some(e.clone()))
                        .await;
                }
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.attempt != attempt || inner.phase != CallPhase::Incoming {
            if inner.attempt == attempt {
                inner.accepting = false;
            }
            self.media.teardown(attempt).await;
            return Err(CallError::InvalidCallState(
                "call ended during media acquisition".to_string(),
            ));
        }
        inner.local_stream = Some(stream);
        if let Err(e) = self.media.create_peer(attempt, PeerRole::Callee).await {
            self.fail_current(&mut inner, EndReason::MediaError, Some(e.clone()))
                .await;
            return Err(e);
        }

        let mut session = inner.session.clone().expect("incoming phase has a session");
        let persisted = match session.accept() {
            Ok(()) => self.store.update(&session).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            // Fall back to ringing; a terminal row will arrive via
            // reconciliation if the call is actually over
            warn!(%call_id, error = %e, "acceptance could not be persisted");
            inner.accepting = false;
            inner.local_stream = None;
            self.media.teardown(attempt).await;
            return Err(e);
        }
        inner.session = Some(session);
        inner.phase = CallPhase::Connecting;
        inner.accepting = false;
        self.send_lifecycle(&inner, LifecycleNotice::Accepted);
        self.spawn_negotiation_timer(attempt);
        self.publish(&inner);
        Ok(())
    }

    /// Decline the inbound call currently ringing on this device
    pub async fn reject_incoming_call(self: &Arc<Self>, call_id: CallId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.phase != CallPhase::Incoming || inner.call_id() != Some(call_id) {
            return Err(CallError::InvalidCallState(format!(
                "call {} is not ringing here (phase {})",
                call_id,
                inner.phase.as_str()
            )));
        }

        let mut session = inner.session.clone().expect("incoming phase has a session");
        session.reject()?;
        if let Err(e) = self.store.update(&session).await {
            warn!(%call_id, error = %e, "failed to persist rejection");
        }
        inner.session = Some(session);
        self.send_lifecycle(&inner, LifecycleNotice::Rejected);
        info!(%call_id, "incoming call rejected");
        self.finish_locally(&mut inner, EndReason::CalleeRejected, None)
            .await;
        Ok(())
    }

    /// Hang up. Valid from any live phase and always wins over in-flight
    /// async work.
    pub async fn end_call(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.phase.is_live() {
            return Err(CallError::InvalidCallState(format!(
                "no call to end (phase {})",
                inner.phase.as_str()
            )));
        }

        let reason = match inner.phase {
            CallPhase::Calling => EndReason::CallerCancelled,
            CallPhase::Incoming => EndReason::CalleeRejected,
            _ => EndReason::NormalHangup,
        };

        if let Some(mut session) = inner.session.clone() {
            if !session.is_terminal() {
                let result = match inner.phase {
                    CallPhase::Incoming => session.reject(),
                    _ => session.end(reason),
                };
                if result.is_ok() {
                    // Racing hangups converge on the store's terminal row
                    if let Err(e) = self.store.update(&session).await {
                        debug!(error = %e, "terminal write raced, keeping store row");
                    }
                    inner.session = Some(session);
                }
            }
        }

        self.send_lifecycle(&inner, LifecycleNotice::Hangup);
        info!(call_id = ?inner.call_id(), reason = reason.as_str(), "call ended locally");
        self.finish_locally(&mut inner, reason, None).await;
        Ok(())
    }

    /// Flip the microphone; mirrored to the peer via a control message
    pub async fn toggle_mute(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        self.require_media_phase(&inner)?;
        let muted = self.media.toggle_mute(inner.attempt).await?;
        inner.is_muted = muted;
        self.send_control(&inner);
        self.publish(&inner);
        Ok(muted)
    }

    /// Flip the camera; mirrored to the peer via a control message
    pub async fn toggle_video(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        self.require_media_phase(&inner)?;
        let video_off = self.media.toggle_video(inner.attempt).await?;
        inner.is_video_off = video_off;
        self.send_control(&inner);
        self.publish(&inner);
        Ok(video_off)
    }

    fn require_media_phase(&self, inner: &Inner) -> Result<()> {
        match inner.phase {
            CallPhase::Calling | CallPhase::Connecting | CallPhase::InCall
                if inner.local_stream.is_some() =>
            {
                Ok(())
            }
            _ => Err(CallError::InvalidCallState(
                "no local media to toggle".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Signaling channel events
    // ------------------------------------------------------------------

    async fn handle_signal(self: &Arc<Self>, envelope: SignalEnvelope) {
        if envelope.sender_id == self.ctx.local.id() {
            return;
        }

        let mut inner = self.inner.lock().await;
        let Some(call_id) = inner.call_id() else {
            return;
        };
        if envelope.call_id != call_id {
            debug!(got = %envelope.call_id, ours = %call_id, "message for another call ignored");
            return;
        }
        // Ended is absorbing: nothing for this call id changes state again
        if inner.phase == CallPhase::Ended {
            return;
        }

        match envelope.payload {
            SignalPayload::Lifecycle { notice } => {
                if inner.applied == Some((call_id, notice)) {
                    debug!(?notice, "duplicate lifecycle notice ignored");
                    return;
                }
                self.apply_lifecycle(&mut inner, notice).await;
                inner.applied = Some((call_id, notice));
            }
            SignalPayload::Offer { sdp } => {
                if inner.phase != CallPhase::Connecting {
                    debug!("offer ignored outside connecting");
                    return;
                }
                let attempt = inner.attempt;
                if let Err(e) = self.media.set_remote_offer(attempt, sdp).await {
                    // Duplicate offers land here; negotiation failure is
                    // covered by the timer
                    debug!(error = %e, "remote offer not applied");
                    return;
                }
                match self.media.create_answer(attempt).await {
                    Ok(answer) => {
                        self.send_payload(&inner, SignalPayload::Answer { sdp: answer });
                    }
                    Err(e) => {
                        self.fail_current(&mut inner, EndReason::MediaError, Some(e))
                            .await;
                    }
                }
            }
            SignalPayload::Answer { sdp } => {
                if inner.phase != CallPhase::Connecting {
                    debug!("answer ignored outside connecting");
                    return;
                }
                let attempt = inner.attempt;
                match self.media.set_remote_answer(attempt, sdp).await {
                    Ok(true) => self.on_negotiation_complete(&mut inner).await,
                    Ok(false) => {}
                    Err(e) => {
                        debug!(error = %e, "remote answer not applied");
                    }
                }
            }
            SignalPayload::Candidate { candidate, .. } => {
                if matches!(inner.phase, CallPhase::Connecting | CallPhase::InCall) {
                    let attempt = inner.attempt;
                    if let Err(e) = self.media.add_ice_candidate(attempt, candidate).await {
                        debug!(error = %e, "ICE candidate dropped");
                    }
                }
            }
            SignalPayload::Control { muted, video_off } => {
                inner.remote_muted = muted;
                inner.remote_video_off = video_off;
                self.publish(&inner);
            }
        }
    }

    async fn apply_lifecycle(self: &Arc<Self>, inner: &mut Inner, notice: LifecycleNotice) {
        match notice {
            // The inbound request itself arrives via the store feed; the
            // channel copy is a hint we already acted on.
            LifecycleNotice::Requested => {}
            LifecycleNotice::Accepted => self.on_remote_accepted(inner).await,
            LifecycleNotice::Rejected => {
                if inner.phase == CallPhase::Calling {
                    info!(call_id = ?inner.call_id(), "callee rejected");
                    self.finish_locally(inner, EndReason::CalleeRejected, None)
                        .await;
                }
            }
            LifecycleNotice::Hangup => {
                let reason = match inner.phase {
                    CallPhase::Incoming => EndReason::CallerCancelled,
                    _ => EndReason::NormalHangup,
                };
                info!(call_id = ?inner.call_id(), "peer hung up");
                self.finish_locally(inner, reason, None).await;
            }
            LifecycleNotice::Superseded => {
                info!(call_id = ?inner.call_id(), "call superseded by peer");
                self.finish_locally(inner, EndReason::Superseded, None).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Store reconciliation
    // ------------------------------------------------------------------

    /// Apply a persisted session row. Idempotent; used by both the store
    /// feed and the fallback poll. The row, not message arrival order, is
    /// the source of truth for lifecycle decisions.
    pub async fn reconcile(self: &Arc<Self>, session: CallSession) {
        if !session.involves(self.ctx.local.id()) {
            return;
        }
        let mut inner = self.inner.lock().await;

        match inner.phase {
            CallPhase::Idle => {
                let for_me = session.callee().id() == self.ctx.local.id();
                let ringing = matches!(
                    session.status(),
                    CallStatus::Requested | CallStatus::Ringing
                );
                if for_me && ringing {
                    self.enter_incoming(&mut inner, session).await;
                }
            }
            CallPhase::Calling => {
                let ours = inner.session.clone().expect("calling phase has a session");
                if session.id() == ours.id() {
                    self.apply_row_while_calling(&mut inner, session).await;
                } else if session.same_pair(&ours) && !session.is_terminal() {
                    self.resolve_glare(&mut inner, ours, session).await;
                }
            }
            CallPhase::Incoming => {
                if Some(session.id()) == inner.call_id() {
                    if session.is_terminal() {
                        let reason = session.end_reason().unwrap_or(EndReason::CallerCancelled);
                        info!(call_id = %session.id(), reason = reason.as_str(), "inbound call withdrawn");
                        inner.session = Some(session);
                        self.finish_locally(&mut inner, reason, None).await;
                    } else {
                        inner.session = Some(session);
                    }
                }
            }
            CallPhase::Connecting => {
                if Some(session.id()) == inner.call_id() {
                    if session.status() == CallStatus::Active {
                        self.on_row_active(&mut inner, session).await;
                    } else if session.is_terminal() {
                        let reason = session.end_reason().unwrap_or(EndReason::NormalHangup);
                        inner.session = Some(session);
                        self.finish_locally(&mut inner, reason, None).await;
                    } else {
                        inner.session = Some(session);
                    }
                }
            }
            CallPhase::InCall => {
                if Some(session.id()) == inner.call_id() && session.is_terminal() {
                    let reason = session.end_reason().unwrap_or(EndReason::NormalHangup);
                    info!(call_id = %session.id(), reason = reason.as_str(), "call ended by peer");
                    inner.session = Some(session);
                    self.finish_locally(&mut inner, reason, None).await;
                }
            }
            CallPhase::Ended => {}
        }
    }

    async fn apply_row_while_calling(self: &Arc<Self>, inner: &mut Inner, session: CallSession) {
        match session.status() {
            CallStatus::Ringing => {
                inner.session = Some(session);
            }
            CallStatus::Accepted => {
                inner.session = Some(session);
                self.on_remote_accepted(inner).await;
            }
            CallStatus::Rejected => {
                inner.session = Some(session);
                info!("callee rejected (store)");
                self.finish_locally(inner, EndReason::CalleeRejected, None)
                    .await;
            }
            status if status.is_terminal() => {
                let reason = session.end_reason().unwrap_or(EndReason::NormalHangup);
                inner.session = Some(session);
                self.finish_locally(inner, reason, None).await;
            }
            _ => {}
        }
    }

    /// Both sides called each other inside the race window. Order the two
    /// rows by `(caller_id, created_at)`; both clients compute the same
    /// winner from the same two rows.
    async fn resolve_glare(self: &Arc<Self>, inner: &mut Inner, ours: CallSession, theirs: CallSession) {
        if glare::loses_to(&ours, &theirs) {
            info!(
                ours = %ours.id(),
                theirs = %theirs.id(),
                "glare: abandoning our outbound attempt"
            );
            let mut mine = ours;
            if mine.supersede().is_ok() {
                if let Err(e) = self.store.update(&mine).await {
                    debug!(error = %e, "supersede write raced");
                }
            }
            self.send_lifecycle(inner, LifecycleNotice::Superseded);
            // Release our transport and media, then ring for the winner
            self.release_attempt(inner).await;
            self.enter_incoming(inner, theirs).await;
        } else {
            info!(
                ours = %ours.id(),
                theirs = %theirs.id(),
                "glare: our attempt wins, superseding theirs"
            );
            let mut loser = theirs;
            if loser.supersede().is_ok() {
                if let Err(e) = self.store.update(&loser).await {
                    debug!(error = %e, "supersede write raced");
                }
            }
        }
    }

    async fn enter_incoming(self: &Arc<Self>, inner: &mut Inner, session: CallSession) {
        inner.attempt = inner.attempt.next();
        let call_id = session.id();
        info!(%call_id, caller = %session.caller().id(), "inbound call ringing");

        self.open_channel(inner, call_id).await;

        // Acknowledge ringing so the caller's UI can say so
        let mut session = session;
        if session.status() == CallStatus::Requested && session.ring().is_ok() {
            if let Err(e) = self.store.update(&session).await {
                debug!(error = %e, "ringing ack raced");
            }
        }

        inner.remote = Some(session.caller().clone());
        inner.session = Some(session);
        inner.phase = CallPhase::Incoming;
        // Ringing is bounded on this side too: a caller that dies after
        // inserting the row must not leave this device ringing forever
        self.spawn_ring_timer(inner.attempt);
        self.publish(inner);
    }

    async fn on_remote_accepted(self: &Arc<Self>, inner: &mut Inner) {
        if inner.phase != CallPhase::Calling {
            return; // duplicate or late
        }
        let attempt = inner.attempt;
        info!(call_id = ?inner.call_id(), "callee accepted, negotiating");

        let mut session = inner.session.clone().expect("calling phase has a session");
        if session.status() == CallStatus::Requested || session.status() == CallStatus::Ringing {
            let _ = session.accept();
        }
        if session.connect().is_ok() {
            if let Err(e) = self.store.update(&session).await {
                debug!(error = %e, "connecting write raced");
            }
        }
        inner.session = Some(session);
        inner.phase = CallPhase::Connecting;

        if let Err(e) = self.media.create_peer(attempt, PeerRole::Caller).await {
            self.fail_current(inner, EndReason::MediaError, Some(e)).await;
            return;
        }
        match self.media.create_offer(attempt).await {
            Ok(offer) => {
                self.send_payload(inner, SignalPayload::Offer { sdp: offer });
                self.spawn_negotiation_timer(attempt);
                self.publish(inner);
            }
            Err(e) => {
                self.fail_current(inner, EndReason::MediaError, Some(e)).await;
            }
        }
    }

    /// Negotiation completed on the offering side
    async fn on_negotiation_complete(self: &Arc<Self>, inner: &mut Inner) {
        if inner.phase != CallPhase::Connecting {
            return;
        }
        let attempt = inner.attempt;
        match self.media.complete(attempt).await {
            Ok(remote_stream) => {
                let mut session = inner
                    .session
                    .clone()
                    .expect("connecting phase has a session");
                if session.activate().is_ok() {
                    if let Err(e) = self.store.update(&session).await {
                        debug!(error = %e, "activate write raced");
                    }
                }
                inner.session = Some(session);
                inner.remote_stream = Some(remote_stream);
                inner.phase = CallPhase::InCall;
                info!(call_id = ?inner.call_id(), "call active");
                self.spawn_quality_sampler(attempt);
                self.publish(inner);
            }
            Err(e) => {
                self.fail_current(inner, EndReason::MediaError, Some(e)).await;
            }
        }
    }

    /// The persisted row went `Active`: the answering side's confirmation
    /// that negotiation completed.
    async fn on_row_active(self: &Arc<Self>, inner: &mut Inner, session: CallSession) {
        let attempt = inner.attempt;
        match self.media.complete(attempt).await {
            Ok(remote_stream) => {
                inner.session = Some(session);
                inner.remote_stream = Some(remote_stream);
                inner.phase = CallPhase::InCall;
                info!(call_id = ?inner.call_id(), "call active (store)");
                self.spawn_quality_sampler(attempt);
                self.publish(inner);
            }
            Err(e) => {
                self.fail_current(inner, EndReason::MediaError, Some(e)).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Terminal paths
    // ------------------------------------------------------------------

    /// Persist a failure for the current attempt, notify the peer, and end
    async fn fail_current(
        self: &Arc<Self>,
        inner: &mut Inner,
        reason: EndReason,
        error: Option<CallError>,
    ) {
        if let Some(mut session) = inner.session.clone() {
            if !session.is_terminal() && session.fail(reason).is_ok() {
                if let Err(e) = self.store.update(&session).await {
                    debug!(error = %e, "failure write raced");
                }
                inner.session = Some(session);
            }
        }
        self.send_lifecycle(inner, LifecycleNotice::Hangup);
        warn!(call_id = ?inner.call_id(), reason = reason.as_str(), ?error, "call attempt failed");
        self.finish_locally(inner, reason, error).await;
    }

    /// Reach the absorbing `Ended` phase: bump the attempt token so stale
    /// async work is discarded, tear down media exactly once, release the
    /// channel, and publish.
    async fn finish_locally(
        self: &Arc<Self>,
        inner: &mut Inner,
        reason: EndReason,
        error: Option<CallError>,
    ) {
        self.release_attempt(inner).await;
        inner.phase = CallPhase::Ended;
        inner.end_reason = Some(reason);
        if let Some(e) = error {
            inner.last_error = Some(e);
        }
        inner.local_stream = None;
        inner.remote_stream = None;
        self.publish(inner);
    }

    /// Release transport and media for the current attempt without setting
    /// a terminal phase (glare hands the machine on to the winning call).
    async fn release_attempt(self: &Arc<Self>, inner: &mut Inner) {
        let ending = inner.attempt;
        inner.attempt = inner.attempt.next();
        inner.accepting = false;
        self.media.teardown(ending).await;
        if let Some(handle) = inner.channel.take() {
            self.signaling.close(handle.call_id()).await;
        }
        inner.local_stream = None;
        inner.remote_stream = None;
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn open_channel(self: &Arc<Self>, inner: &mut Inner, call_id: CallId) {
        match self.signaling.open(call_id).await {
            Ok(handle) => {
                self.spawn_recv_loop(&handle);
                inner.channel = Some(handle);
            }
            Err(e) => {
                // A dead channel does not abort the call; the session row
                // still advances and the fallback poll takes over delivery.
                warn!(%call_id, error = %e, "signaling unavailable, degrading to store poll");
                self.degraded.store(true, Ordering::SeqCst);
                inner.last_error = Some(e);
                inner.channel = None;
            }
        }
    }

    fn spawn_recv_loop(self: &Arc<Self>, handle: &SignalingHandle) {
        let mut rx = handle.subscribe();
        let machine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        machine.handle_signal(envelope).await;
                        if machine.snapshot().phase == CallPhase::Ended {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "signaling receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn send_lifecycle(&self, inner: &Inner, notice: LifecycleNotice) {
        self.send_payload(inner, SignalPayload::Lifecycle { notice });
    }

    fn send_control(&self, inner: &Inner) {
        self.send_payload(
            inner,
            SignalPayload::Control {
                muted: inner.is_muted,
                video_off: inner.is_video_off,
            },
        );
    }

    fn send_payload(&self, inner: &Inner, payload: SignalPayload) {
        if let (Some(handle), Some(call_id)) = (&inner.channel, inner.call_id()) {
            handle.send(SignalEnvelope::new(call_id, self.ctx.local.id(), payload));
        }
    }

    fn spawn_ring_timer(self: &Arc<Self>, attempt: AttemptId) {
        let machine = Arc::clone(self);
        let timeout = self.ctx.config.ring_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            machine.on_ring_timeout(attempt).await;
        });
    }

    async fn on_ring_timeout(self: &Arc<Self>, attempt: AttemptId) {
        let mut inner = self.inner.lock().await;
        if inner.attempt != attempt
            || !matches!(inner.phase, CallPhase::Calling | CallPhase::Incoming)
        {
            return;
        }
        // An acceptance already in flight settles the attempt on its own
        if inner.accepting {
            return;
        }
        info!(call_id = ?inner.call_id(), "no answer within ringing window");
        if let Some(mut session) = inner.session.clone() {
            if !session.is_terminal() && session.miss().is_ok() {
                if let Err(e) = self.store.update(&session).await {
                    debug!(error = %e, "missed write raced");
                }
                inner.session = Some(session);
            }
        }
        self.send_lifecycle(&inner, LifecycleNotice::Hangup);
        // A ring timeout is a normal no-answer outcome, not an error
        self.finish_locally(&mut inner, EndReason::Timeout, None).await;
    }

    fn spawn_negotiation_timer(self: &Arc<Self>, attempt: AttemptId) {
        let machine = Arc::clone(self);
        let timeout = self.ctx.config.negotiation_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut inner = machine.inner.lock().await;
            if inner.attempt != attempt || inner.phase != CallPhase::Connecting {
                return;
            }
            let error = CallError::Timeout("peer negotiation timed out".to_string());
            machine
                .fail_current(&mut inner, EndReason::Timeout, Some(error))
                .await;
        });
    }

    fn spawn_quality_sampler(self: &Arc<Self>, attempt: AttemptId) {
        let machine = Arc::clone(self);
        let interval = self.ctx.config.quality_sample_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let mut inner = machine.inner.lock().await;
                if inner.attempt != attempt || inner.phase != CallPhase::InCall {
                    break;
                }
                match machine.media.sample_quality(attempt).await {
                    Ok(quality) => {
                        if quality != inner.quality {
                            debug!(quality = quality.as_str(), "network quality changed");
                            inner.quality = quality;
                            machine.publish(&inner);
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    fn publish(&self, inner: &Inner) {
        let snapshot = CallSnapshot {
            phase: inner.phase,
            call_id: inner.call_id(),
            remote: inner.remote.clone(),
            local_stream: inner.local_stream.clone(),
            remote_stream: inner.remote_stream.clone(),
            is_muted: inner.is_muted,
            is_video_off: inner.is_video_off,
            remote_muted: inner.remote_muted,
            remote_video_off: inner.remote_video_off,
            network_quality: inner.quality,
            end_reason: inner.end_reason,
            last_error: inner.last_error.clone(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::presence::AlwaysReachable;
    use crate::domain::session::value_object::Role;
    use crate::domain::shared::value_objects::ParticipantId;
    use crate::infrastructure::media::backend::SimulatedMediaBackend;
    use crate::infrastructure::persistence::memory::InMemorySessionStore;
    use crate::infrastructure::signaling::hub::InProcessSignaling;

    fn machine_for(
        local: Participant,
        store: Arc<InMemorySessionStore>,
        hub: Arc<InProcessSignaling>,
        backend: Arc<SimulatedMediaBackend>,
    ) -> Arc<CallMachine> {
        CallMachine::new(
            SessionContext {
                local,
                config: CallConfig::default(),
            },
            store,
            hub,
            Arc::new(MediaSessionManager::new(backend)),
            Arc::new(AlwaysReachable),
        )
    }

    fn participants() -> (Participant, Participant) {
        (
            Participant::new(ParticipantId::new(), Role::Child, Some("Mia".to_string())),
            Participant::new(ParticipantId::new(), Role::Parent, Some("Dana".to_string())),
        )
    }

    #[tokio::test]
    async fn test_commands_require_matching_state() {
        let (child, parent) = participants();
        let store = Arc::new(InMemorySessionStore::new());
        let hub = Arc::new(InProcessSignaling::new());
        let machine = machine_for(child, store, hub, Arc::new(SimulatedMediaBackend::new()));

        // Nothing ringing, nothing to end or toggle
        let bogus = CallId::new();
        assert!(matches!(
            machine.accept_incoming_call(bogus).await.unwrap_err(),
            CallError::InvalidCallState(_)
        ));
        assert!(matches!(
            machine.reject_incoming_call(bogus).await.unwrap_err(),
            CallError::InvalidCallState(_)
        ));
        assert!(matches!(
            machine.end_call().await.unwrap_err(),
            CallError::InvalidCallState(_)
        ));
        assert!(machine.toggle_mute().await.is_err());
        let _ = parent;
    }

    #[tokio::test]
    async fn test_start_creates_requested_row() {
        let (child, parent) = participants();
        let store = Arc::new(InMemorySessionStore::new());
        let hub = Arc::new(InProcessSignaling::new());
        let machine = machine_for(
            child,
            Arc::clone(&store),
            hub,
            Arc::new(SimulatedMediaBackend::new()),
        );

        let call_id = machine.start_outgoing_call(parent).await.unwrap();
        let snap = machine.snapshot();
        assert_eq!(snap.phase, CallPhase::Calling);
        assert_eq!(snap.call_id, Some(call_id));
        assert!(snap.local_stream.is_some());

        let row = store.find_by_id(call_id).await.unwrap().unwrap();
        assert_eq!(row.status(), CallStatus::Requested);
    }

    #[tokio::test]
    async fn test_second_start_while_calling_is_invalid() {
        let (child, parent) = participants();
        let store = Arc::new(InMemorySessionStore::new());
        let hub = Arc::new(InProcessSignaling::new());
        let machine = machine_for(child, store, hub, Arc::new(SimulatedMediaBackend::new()));

        machine.start_outgoing_call(parent.clone()).await.unwrap();
        assert!(matches!(
            machine.start_outgoing_call(parent).await.unwrap_err(),
            CallError::InvalidCallState(_)
        ));
    }

    #[tokio::test]
    async fn test_permission_denied_leaves_no_live_row() {
        let (child, parent) = participants();
        let store = Arc::new(InMemorySessionStore::new());
        let hub = Arc::new(InProcessSignaling::new());
        let backend = Arc::new(SimulatedMediaBackend::new());
        backend.deny_permission(true);
        let machine = machine_for(child, Arc::clone(&store), hub, backend);

        let err = machine.start_outgoing_call(parent).await.unwrap_err();
        assert!(matches!(err, CallError::PermissionDenied(_)));

        let snap = machine.snapshot();
        assert_eq!(snap.phase, CallPhase::Ended);
        assert_eq!(snap.end_reason, Some(EndReason::MediaError));
        assert!(matches!(snap.last_error, Some(CallError::PermissionDenied(_))));
        assert!(store.live_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_calling() {
        let (child, parent) = participants();
        let store = Arc::new(InMemorySessionStore::new());
        let hub = Arc::new(InProcessSignaling::new());
        let machine = machine_for(
            child,
            Arc::clone(&store),
            hub,
            Arc::new(SimulatedMediaBackend::new()),
        );

        let call_id = machine.start_outgoing_call(parent).await.unwrap();
        machine.end_call().await.unwrap();

        let snap = machine.snapshot();
        assert_eq!(snap.phase, CallPhase::Ended);
        assert_eq!(snap.end_reason, Some(EndReason::CallerCancelled));

        let row = store.find_by_id(call_id).await.unwrap().unwrap();
        assert_eq!(row.status(), CallStatus::Ended);
        assert_eq!(row.end_reason(), Some(EndReason::CallerCancelled));

        // Ended is absorbing
        assert!(machine.end_call().await.is_err());
    }

    #[tokio::test]
    async fn test_offline_peer_refused() {
        struct NobodyHome;
        impl PresenceReader for NobodyHome {
            fn is_reachable(&self, _id: ParticipantId) -> bool {
                false
            }
        }

        let (child, parent) = participants();
        let store = Arc::new(InMemorySessionStore::new());
        let hub = Arc::new(InProcessSignaling::new());
        let machine = CallMachine::new(
            SessionContext {
                local: child,
                config: CallConfig::default(),
            },
            store,
            hub,
            Arc::new(MediaSessionManager::new(Arc::new(SimulatedMediaBackend::new()))),
            Arc::new(NobodyHome),
        );

        assert!(matches!(
            machine.start_outgoing_call(parent).await.unwrap_err(),
            CallError::PeerOffline(_)
        ));
        assert_eq!(machine.snapshot().phase, CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_to_the_caller() {
        use crate::domain::session::repository::MockSessionStore;

        let (child, parent) = participants();
        let mut store = MockSessionStore::new();
        store
            .expect_insert()
            .returning(|_| Err(CallError::Internal("store down".to_string())));

        let machine = CallMachine::new(
            SessionContext {
                local: child,
                config: CallConfig::default(),
            },
            Arc::new(store),
            Arc::new(InProcessSignaling::new()),
            Arc::new(MediaSessionManager::new(Arc::new(SimulatedMediaBackend::new()))),
            Arc::new(AlwaysReachable),
        );

        assert!(matches!(
            machine.start_outgoing_call(parent).await.unwrap_err(),
            CallError::Internal(_)
        ));
        // The machine never got past the insert
        assert_eq!(machine.snapshot().phase, CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_signaling_outage_degrades_not_aborts() {
        let (child, parent) = participants();
        let store = Arc::new(InMemorySessionStore::new());
        let hub = Arc::new(InProcessSignaling::new());
        hub.set_unavailable(true);
        let machine = machine_for(
            child,
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::new(SimulatedMediaBackend::new()),
        );

        let call_id = machine.start_outgoing_call(parent).await.unwrap();
        assert_eq!(machine.snapshot().phase, CallPhase::Calling);
        assert!(machine.is_degraded());
        assert!(store.find_by_id(call_id).await.unwrap().is_some());
    }
}
