//! Call session controller
//!
//! One controller per local participant. It owns a single session slot and
//! drives it through
//!
//! ```text
//!   Idle ──initiate──▶ Dialing ──remote accepted──▶ Connecting ──ICE up──▶ Active
//!     │                   │                              ▲                   │
//!     └──invite──▶ Ringing ──accept─────────────────────┘                   │
//!                     │                                                       ▼
//!                     └──────reject / cancel / timeout / failure──────────▶ Ended ──reset──▶ Idle
//! ```
//!
//! State lives behind a synchronous lock that is never held across an
//! `.await`. Every operation remembers the session epoch before suspending
//! and re-checks it afterwards; if the session was torn down in between, the
//! operation releases what it acquired and returns [`CallError::Cancelled`].

use crate::config::{CallConfig, ConfigError};
use crate::engine::{EngineError, EngineEvent, EngineFactory};
use crate::ice::IceCandidateBuffer;
use crate::identity::ParticipantId;
use crate::media::{LocalMedia, MediaError, MediaSource, RemoteMediaAggregator};
use crate::peer::{CandidateDisposition, ConnectivityAction, PeerConnectionHandle};
use crate::registry::{CallChannelRegistry, ChannelType, RegistryError};
use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::{
    CallEvent, CallId, CallSession, CallState, EndReason, IceCandidate, MediaConstraints, Role,
    SessionDescription,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Local media could not be acquired
    #[error("Media access failed: {0}")]
    MediaAccess(#[from] MediaError),

    /// A signaling message could not be delivered
    #[error("Signaling delivery failed: {0}")]
    SignalingDelivery(String),

    /// Description exchange failed or the call channel vanished
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// ICE connectivity was lost
    #[error("Connectivity lost: {0}")]
    Connectivity(String),

    /// Operation not valid in the current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        state: CallState,
    },

    /// Another initiate/accept/reject is still running
    #[error("Another call operation is in progress")]
    OperationInFlight,

    /// A call with this participant already exists
    #[error("Call with {0} already in progress")]
    SessionExists(ParticipantId),

    /// Tried to call ourselves
    #[error("Cannot call yourself")]
    SelfCall,

    /// The session was torn down while the operation was suspended
    #[error("Operation cancelled by call teardown")]
    Cancelled,

    /// Call channel registry failure
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<EngineError> for CallError {
    fn from(err: EngineError) -> Self {
        CallError::Negotiation(err.to_string())
    }
}

/// What the controller did with an incoming invite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteDisposition {
    /// A new session is ringing
    Ringing(CallId),
    /// Redelivery of the invite for the current session
    Duplicate,
    /// Busy with another call; the invite was dropped
    Busy,
    /// Both sides dialed; we keep the caller role and ignore theirs
    GlareIgnored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Initiate,
    Accept,
    Reject,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Self::Initiate => "initiate",
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }
}

/// Notification sent to the remote during teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notice {
    None,
    /// `call_ended`, only if the remote already knows about the call
    Ended,
    Rejected,
}

struct Session {
    epoch: u64,
    record: CallSession,
    pending_offer: Option<SessionDescription>,
    peer: Option<Arc<PeerConnectionHandle>>,
    local_media: Option<LocalMedia>,
    early: IceCandidateBuffer,
    outbound_ready: bool,
    held: Vec<IceCandidate>,
    ice_connected: bool,
    remote_contacted: bool,
    /// Glare was won; the remote's candidates from its abandoned attempt are
    /// dropped until its answer arrives
    awaiting_glare_answer: bool,
    joined: bool,
    ending: bool,
    remote_media: RemoteMediaAggregator,
    ring_timer: Option<AbortHandle>,
    grace_timer: Option<AbortHandle>,
    pump: Option<AbortHandle>,
}

impl Session {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && !self.ending && self.record.state.is_live()
    }
}

#[derive(Default)]
struct ControllerState {
    epoch: u64,
    session: Option<Session>,
    last_error: Option<CallError>,
    operation: Option<Operation>,
    cancel_requested: bool,
    stray: VecDeque<(ParticipantId, IceCandidateBuffer)>,
}

impl ControllerState {
    fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map_or(CallState::Idle, |s| s.record.state)
    }

    fn current(&mut self, epoch: u64) -> Option<&mut Session> {
        self.session.as_mut().filter(|s| s.is_current(epoch))
    }
}

struct Shared<T: SignalingTransport> {
    local: ParticipantId,
    config: CallConfig,
    signaling: Arc<SignalingHandler<T>>,
    registry: Arc<dyn CallChannelRegistry>,
    media: Arc<dyn MediaSource>,
    engines: Arc<dyn EngineFactory>,
    state: Mutex<ControllerState>,
    negotiation: tokio::sync::Mutex<()>,
    events: broadcast::Sender<CallEvent>,
}

/// Clears the in-flight marker when the operation finishes, however it finishes
struct OperationGuard<T: SignalingTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: SignalingTransport> Drop for OperationGuard<T> {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock();
        st.operation = None;
        st.cancel_requested = false;
    }
}

/// Resources taken out of a session that is being torn down
struct Released {
    call_id: CallId,
    remote: ParticipantId,
    peer: Option<Arc<PeerConnectionHandle>>,
    media: Option<LocalMedia>,
    notify: Option<SignalingMessage>,
}

/// State machine for one participant's calls
pub struct CallSessionController<T: SignalingTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: SignalingTransport> Clone for CallSessionController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

fn emit_transition(
    events: &broadcast::Sender<CallEvent>,
    call_id: CallId,
    from: CallState,
    to: CallState,
) {
    tracing::debug!(call_id = %call_id, old_state = ?from, new_state = ?to, "Call state transition");
    let _ = events.send(CallEvent::StateChanged { call_id, from, to });
}

/// Move a live session to `to`; refuses transitions outside the state table
fn transition(events: &broadcast::Sender<CallEvent>, session: &mut Session, to: CallState) -> bool {
    let from = session.record.state;
    if !from.can_transition_to(to) {
        tracing::error!(call_id = %session.record.id, from = ?from, to = ?to, "Refusing invalid call state transition");
        return false;
    }
    session.record.state = to;
    match to {
        CallState::Active => session.record.started_at = Some(Utc::now()),
        CallState::Ended => session.record.ended_at = Some(Utc::now()),
        _ => {}
    }
    emit_transition(events, session.record.id, from, to);
    true
}

fn cancel_timer(timer: &mut Option<AbortHandle>) {
    if let Some(handle) = timer.take() {
        handle.abort();
    }
}

impl<T: SignalingTransport> CallSessionController<T> {
    /// Create a controller for `local`
    ///
    /// # Errors
    ///
    /// Returns `CallError::Config` if the configuration does not validate
    pub fn new(
        local: ParticipantId,
        config: CallConfig,
        signaling: Arc<SignalingHandler<T>>,
        registry: Arc<dyn CallChannelRegistry>,
        media: Arc<dyn MediaSource>,
        engines: Arc<dyn EngineFactory>,
    ) -> Result<Self, CallError> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            shared: Arc::new(Shared {
                local,
                config,
                signaling,
                registry,
                media,
                engines,
                state: Mutex::new(ControllerState::default()),
                negotiation: tokio::sync::Mutex::new(()),
                events,
            }),
        })
    }

    /// Local participant
    pub fn local_id(&self) -> &ParticipantId {
        &self.shared.local
    }

    /// Active configuration
    pub fn config(&self) -> &CallConfig {
        &self.shared.config
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.shared.state.lock().state()
    }

    /// Snapshot of the current (or just ended) session
    pub fn session(&self) -> Option<CallSession> {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .map(|s| s.record.clone())
    }

    /// Most recent error, for the presentation layer
    pub fn last_error(&self) -> Option<CallError> {
        self.shared.state.lock().last_error.clone()
    }

    /// Subscribe to call events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.events.subscribe()
    }

    fn record_error(&self, call_id: Option<CallId>, error: CallError) {
        tracing::warn!(call_id = ?call_id, error = %error, "Call error");
        self.shared.state.lock().last_error = Some(error.clone());
        let _ = self.shared.events.send(CallEvent::Warning { call_id, error });
    }

    fn begin_operation(
        &self,
        operation: Operation,
        allowed: CallState,
    ) -> Result<(OperationGuard<T>, u64), CallError> {
        let mut st = self.shared.state.lock();
        if st.operation.is_some() {
            return Err(CallError::OperationInFlight);
        }
        let state = st.state();
        let ending = st.session.as_ref().is_some_and(|s| s.ending);
        if state != allowed || ending {
            return Err(CallError::InvalidState {
                operation: operation.name(),
                state,
            });
        }
        st.operation = Some(operation);
        st.cancel_requested = false;
        let epoch = st.session.as_ref().map_or(st.epoch, |s| s.epoch);
        Ok((
            OperationGuard {
                shared: self.shared.clone(),
            },
            epoch,
        ))
    }

    fn check_live(&self, epoch: u64) -> Result<(), CallError> {
        let mut st = self.shared.state.lock();
        if st.current(epoch).is_some() {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }

    async fn send(&self, to: &ParticipantId, message: SignalingMessage) -> Result<(), CallError> {
        self.shared
            .signaling
            .send_message(to, message)
            .await
            .map_err(|e| CallError::SignalingDelivery(e.to_string()))
    }

    /// Open a new session in the slot; the slot must be empty
    fn open_session(
        &self,
        st: &mut ControllerState,
        call_id: CallId,
        role: Role,
        state: CallState,
        remote: ParticipantId,
        is_video: bool,
    ) -> u64 {
        st.epoch += 1;
        let epoch = st.epoch;
        let mut early = IceCandidateBuffer::new(self.shared.config.ice_buffer_capacity);
        if let Some(pos) = st.stray.iter().position(|(peer, _)| *peer == remote) {
            if let Some((_, stray)) = st.stray.remove(pos) {
                tracing::debug!(peer = %remote, candidates = stray.len(), "Adopting early candidates");
                early.adopt(stray);
            }
        }
        let record = CallSession::new(
            call_id,
            role,
            state,
            self.shared.local.clone(),
            remote,
            is_video,
        );
        let mut session = Session {
            epoch,
            record,
            pending_offer: None,
            peer: None,
            local_media: None,
            early,
            outbound_ready: false,
            held: Vec::new(),
            ice_connected: false,
            remote_contacted: role == Role::Callee,
            awaiting_glare_answer: false,
            joined: false,
            ending: false,
            remote_media: RemoteMediaAggregator::new(),
            ring_timer: None,
            grace_timer: None,
            pump: None,
        };
        session.ring_timer = Some(self.spawn_ring_timer(epoch));
        st.session = Some(session);
        emit_transition(&self.shared.events, call_id, CallState::Idle, state);
        epoch
    }

    /// Place a call
    ///
    /// # Errors
    ///
    /// - `InvalidState`/`SessionExists`/`OperationInFlight`/`SelfCall` if a call cannot start now
    /// - `MediaAccess` if local media is unavailable (state returns to Idle, no invite sent)
    /// - `SignalingDelivery` if the invite cannot be delivered (state returns to Idle)
    /// - `Negotiation` if the offer cannot be produced (state goes to Ended)
    /// - `Cancelled` if the call was terminated while this was running
    #[tracing::instrument(skip(self), fields(local = %self.shared.local))]
    pub async fn initiate(&self, remote: ParticipantId, is_video: bool) -> Result<CallId, CallError> {
        if remote == self.shared.local {
            return Err(CallError::SelfCall);
        }
        {
            let st = self.shared.state.lock();
            if let Some(s) = &st.session {
                if s.record.remote == remote && s.record.state.is_live() {
                    return Err(CallError::SessionExists(remote));
                }
            }
        }
        let (_guard, _) = self.begin_operation(Operation::Initiate, CallState::Idle)?;

        let channel_type = ChannelType::for_call(is_video);
        let channel = match self
            .shared
            .registry
            .create(channel_type, std::slice::from_ref(&self.shared.local))
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let err = CallError::Registry(e);
                self.record_error(None, err.clone());
                return Err(err);
            }
        };
        let call_id = channel.id;

        let epoch = {
            let mut st = self.shared.state.lock();
            if st.cancel_requested || st.session.is_some() {
                None
            } else {
                Some(self.open_session(
                    &mut st,
                    call_id,
                    Role::Caller,
                    CallState::Dialing,
                    remote.clone(),
                    is_video,
                ))
            }
        };
        let Some(epoch) = epoch else {
            tracing::info!(call_id = %call_id, "Call cancelled before dialing");
            if let Err(e) = self.shared.registry.remove(call_id).await {
                tracing::warn!(call_id = %call_id, error = %e, "Failed to remove abandoned channel");
            }
            return Err(CallError::Cancelled);
        };
        tracing::info!(call_id = %call_id, peer = %remote, is_video, "Dialing");

        let media = match self
            .shared
            .media
            .acquire(&MediaConstraints::for_call(is_video))
            .await
        {
            Ok(media) => media,
            Err(e) => {
                let err = CallError::MediaAccess(e);
                self.record_error(Some(call_id), err.clone());
                self.abort_to_idle(epoch).await;
                return Err(err);
            }
        };
        self.store_media(epoch, media)?;

        let peer = match self.ensure_peer(epoch).await {
            Ok(peer) => peer,
            Err(CallError::Cancelled) => return Err(CallError::Cancelled),
            Err(e) => return Err(self.fail_negotiation(epoch, e).await),
        };
        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail_negotiation(epoch, e.into()).await),
        };

        {
            let mut st = self.shared.state.lock();
            let session = st.current(epoch).ok_or(CallError::Cancelled)?;
            session.remote_contacted = true;
        }
        let announce = SignalingMessage::CallChannelCreated {
            channel_id: call_id,
            channel_name: channel.name.clone(),
            call_type: channel_type,
            participants: vec![self.shared.local.clone(), remote.clone()],
        };
        if let Err(e) = self.send(&remote, announce).await {
            tracing::warn!(call_id = %call_id, error = %e, "Channel announcement not delivered");
        }
        self.check_live(epoch)?;
        let invite = SignalingMessage::CallIncoming {
            offer,
            is_video,
            channel_id: call_id,
        };
        if let Err(err) = self.send(&remote, invite).await {
            self.record_error(Some(call_id), err.clone());
            self.abort_to_idle(epoch).await;
            return Err(err);
        }
        self.release_held_candidates(epoch).await;
        self.check_live(epoch)?;
        Ok(call_id)
    }

    /// Handle an inbound `call_incoming`
    #[tracing::instrument(skip(self, offer), fields(local = %self.shared.local, from = %from))]
    pub async fn handle_incoming_invite(
        &self,
        from: ParticipantId,
        offer: SessionDescription,
        channel_id: CallId,
        is_video: bool,
    ) -> InviteDisposition {
        if from == self.shared.local {
            return InviteDisposition::Busy;
        }

        let yield_epoch = {
            let mut st = self.shared.state.lock();
            if st.state() == CallState::Ended {
                if let Some(old) = st.session.take() {
                    emit_transition(
                        &self.shared.events,
                        old.record.id,
                        CallState::Ended,
                        CallState::Idle,
                    );
                }
            }
            let decision = match st.session.as_mut() {
                None => None,
                Some(s) if s.ending || s.record.remote != from => {
                    return InviteDisposition::Busy;
                }
                Some(s) if s.record.id == channel_id => return InviteDisposition::Duplicate,
                Some(s) if s.record.state == CallState::Dialing && s.record.role == Role::Caller => {
                    if self.shared.local.wins_glare_against(&from) {
                        s.awaiting_glare_answer = true;
                        tracing::info!(peer = %from, "Glare: keeping caller role");
                        return InviteDisposition::GlareIgnored;
                    }
                    Some(s.epoch)
                }
                Some(_) => return InviteDisposition::Busy,
            };
            if decision.is_none() {
                self.open_ringing(&mut st, from, offer, channel_id, is_video);
                return InviteDisposition::Ringing(channel_id);
            }
            decision
        };

        if let Some(epoch) = yield_epoch {
            tracing::info!(peer = %from, "Glare: yielding caller role");
            self.abort_to_idle(epoch).await;
        }

        let mut st = self.shared.state.lock();
        if st.session.is_some() {
            return InviteDisposition::Busy;
        }
        self.open_ringing(&mut st, from, offer, channel_id, is_video);
        InviteDisposition::Ringing(channel_id)
    }

    fn open_ringing(
        &self,
        st: &mut ControllerState,
        from: ParticipantId,
        offer: SessionDescription,
        channel_id: CallId,
        is_video: bool,
    ) {
        let epoch = self.open_session(
            st,
            channel_id,
            Role::Callee,
            CallState::Ringing,
            from.clone(),
            is_video,
        );
        if let Some(session) = st.current(epoch) {
            session.pending_offer = Some(offer);
        }
        tracing::info!(call_id = %channel_id, peer = %from, is_video, "Incoming call");
        let _ = self.shared.events.send(CallEvent::IncomingCall {
            call_id: channel_id,
            from,
            is_video,
        });
    }

    /// Answer the ringing call
    ///
    /// # Errors
    ///
    /// - `InvalidState`/`OperationInFlight` if nothing is ringing
    /// - `Negotiation` if the channel is gone or the offer cannot be answered
    /// - `MediaAccess` if local media is unavailable; the call is rejected
    /// - `SignalingDelivery` if the answer cannot be delivered; the call ends
    /// - `Cancelled` if the call was terminated while this was running
    #[tracing::instrument(skip(self), fields(local = %self.shared.local))]
    pub async fn accept(&self) -> Result<(), CallError> {
        let (_guard, epoch) = self.begin_operation(Operation::Accept, CallState::Ringing)?;
        let (call_id, remote, is_video) = {
            let mut st = self.shared.state.lock();
            let s = st.current(epoch).ok_or(CallError::Cancelled)?;
            (s.record.id, s.record.remote.clone(), s.record.is_video)
        };

        if let Err(e) = self
            .shared
            .registry
            .attach(call_id, &self.shared.local)
            .await
        {
            let err = match e {
                RegistryError::NotFound(_) => {
                    CallError::Negotiation(format!("call channel {call_id} no longer exists"))
                }
                other => CallError::Registry(other),
            };
            return Err(self.fail_negotiation(epoch, err).await);
        }
        let joined = {
            let mut st = self.shared.state.lock();
            st.current(epoch).map(|s| s.joined = true).is_some()
        };
        if !joined {
            let _ = self.shared.registry.leave(call_id, &self.shared.local).await;
            return Err(CallError::Cancelled);
        }

        let media = match self
            .shared
            .media
            .acquire(&MediaConstraints::for_call(is_video))
            .await
        {
            Ok(media) => media,
            Err(e) => {
                let err = CallError::MediaAccess(e);
                self.record_error(Some(call_id), err.clone());
                self.end_session(epoch, EndReason::MediaUnavailable, Notice::Rejected)
                    .await;
                return Err(err);
            }
        };
        self.store_media(epoch, media)?;

        let peer = match self.ensure_peer(epoch).await {
            Ok(peer) => peer,
            Err(CallError::Cancelled) => return Err(CallError::Cancelled),
            Err(e) => return Err(self.fail_negotiation(epoch, e).await),
        };
        let offer = {
            let mut st = self.shared.state.lock();
            let s = st.current(epoch).ok_or(CallError::Cancelled)?;
            s.pending_offer.take()
        };
        let Some(offer) = offer else {
            let err = CallError::Negotiation("no pending offer".to_string());
            return Err(self.fail_negotiation(epoch, err).await);
        };
        if let Err(e) = peer.set_remote_description(offer).await {
            return Err(self.fail_negotiation(epoch, e.into()).await);
        }
        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail_negotiation(epoch, e.into()).await),
        };
        self.check_live(epoch)?;

        for message in [
            SignalingMessage::WebrtcAnswer { answer },
            SignalingMessage::CallAccepted,
        ] {
            let answered = matches!(message, SignalingMessage::WebrtcAnswer { .. });
            if let Err(err) = self.send(&remote, message).await {
                self.record_error(Some(call_id), err.clone());
                self.end_session(epoch, EndReason::SignalingFailed, Notice::None)
                    .await;
                return Err(err);
            }
            if answered {
                self.release_held_candidates(epoch).await;
            }
        }

        let mut st = self.shared.state.lock();
        let session = st.current(epoch).ok_or(CallError::Cancelled)?;
        cancel_timer(&mut session.ring_timer);
        transition(&self.shared.events, session, CallState::Connecting);
        if session.ice_connected {
            transition(&self.shared.events, session, CallState::Active);
        }
        tracing::info!(call_id = %call_id, "Call accepted");
        Ok(())
    }

    /// Decline the ringing call
    ///
    /// Teardown completes even if `call_rejected` cannot be delivered; the
    /// delivery failure is surfaced as a warning.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState`/`OperationInFlight` if nothing is ringing
    #[tracing::instrument(skip(self), fields(local = %self.shared.local))]
    pub async fn reject(&self) -> Result<(), CallError> {
        let (_guard, epoch) = self.begin_operation(Operation::Reject, CallState::Ringing)?;
        self.end_session(epoch, EndReason::Rejected, Notice::Rejected)
            .await;
        Ok(())
    }

    fn matching_epoch(&self, from: &ParticipantId, operation: &'static str) -> Result<u64, CallError> {
        let st = self.shared.state.lock();
        match st.session.as_ref() {
            Some(s) if s.record.remote == *from && !s.ending && s.record.state.is_live() => {
                Ok(s.epoch)
            }
            _ => Err(CallError::InvalidState {
                operation,
                state: st.state(),
            }),
        }
    }

    /// Handle an inbound `call_accepted`
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless we are dialing `from`
    /// - `Negotiation` if the call channel is gone (the call ends)
    #[tracing::instrument(skip(self), fields(local = %self.shared.local, from = %from))]
    pub async fn handle_remote_accepted(&self, from: &ParticipantId) -> Result<(), CallError> {
        let epoch = self.matching_epoch(from, "handle call_accepted")?;
        let call_id = {
            let st = self.shared.state.lock();
            match st.session.as_ref() {
                Some(s) if s.record.state == CallState::Dialing => s.record.id,
                _ => {
                    return Err(CallError::InvalidState {
                        operation: "handle call_accepted",
                        state: st.state(),
                    })
                }
            }
        };

        if let Err(e) = self.shared.registry.join(call_id, &self.shared.local).await {
            let err = CallError::Negotiation(format!("joining call channel failed: {e}"));
            return Err(self.fail_negotiation(epoch, err).await);
        }

        let mut st = self.shared.state.lock();
        let session = st.current(epoch).ok_or(CallError::Cancelled)?;
        if session.record.state != CallState::Dialing {
            return Ok(());
        }
        session.joined = true;
        cancel_timer(&mut session.ring_timer);
        transition(&self.shared.events, session, CallState::Connecting);
        if session.ice_connected {
            transition(&self.shared.events, session, CallState::Active);
        }
        tracing::info!(call_id = %call_id, "Remote accepted");
        Ok(())
    }

    /// Handle an inbound `call_rejected`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if there is no live call with `from`
    #[tracing::instrument(skip(self), fields(local = %self.shared.local, from = %from))]
    pub async fn handle_remote_rejected(&self, from: &ParticipantId) -> Result<(), CallError> {
        let epoch = self.matching_epoch(from, "handle call_rejected")?;
        self.end_session(epoch, EndReason::RemoteRejected, Notice::None)
            .await;
        Ok(())
    }

    /// Handle an inbound `call_ended`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if there is no live call with `from`
    #[tracing::instrument(skip(self), fields(local = %self.shared.local, from = %from))]
    pub async fn handle_remote_ended(&self, from: &ParticipantId) -> Result<(), CallError> {
        let epoch = self.matching_epoch(from, "handle call_ended")?;
        self.end_session(epoch, EndReason::RemoteEnded, Notice::None)
            .await;
        Ok(())
    }

    /// End the current call. Idempotent; never blocked by a running operation.
    ///
    /// # Errors
    ///
    /// Currently infallible; delivery failures of `call_ended` are reported
    /// as warnings after local teardown completes
    #[tracing::instrument(skip(self), fields(local = %self.shared.local))]
    pub async fn terminate(&self, reason: EndReason) -> Result<(), CallError> {
        let epoch = {
            let mut st = self.shared.state.lock();
            if st.session.is_none() && st.operation == Some(Operation::Initiate) {
                st.cancel_requested = true;
                tracing::debug!("Terminate recorded for call still being created");
                return Ok(());
            }
            match st.session.as_ref() {
                Some(s) if !s.ending && s.record.state.is_live() => s.epoch,
                _ => return Ok(()),
            }
        };
        self.end_session(epoch, reason, Notice::Ended).await;
        Ok(())
    }

    /// Local hang-up
    ///
    /// # Errors
    ///
    /// See [`terminate`](Self::terminate)
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.terminate(EndReason::LocalHangup).await
    }

    /// Handle an inbound `webrtc_offer`
    ///
    /// # Errors
    ///
    /// - `InvalidState` if there is no live call with `from`
    /// - `Negotiation` if the offer cannot be applied or answered (the call ends)
    /// - `SignalingDelivery` if the answer cannot be sent (the call continues)
    #[tracing::instrument(skip(self, offer), fields(local = %self.shared.local, from = %from))]
    pub async fn handle_offer(
        &self,
        from: &ParticipantId,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        let epoch = self.matching_epoch(from, "handle webrtc_offer")?;
        {
            let mut st = self.shared.state.lock();
            if let Some(session) = st.current(epoch) {
                if session.record.state == CallState::Ringing {
                    tracing::debug!("Replacing pending offer while ringing");
                    session.pending_offer = Some(offer);
                    return Ok(());
                }
            }
        }

        let peer = match self.ensure_peer(epoch).await {
            Ok(peer) => peer,
            Err(CallError::Cancelled) => return Err(CallError::Cancelled),
            Err(e) => return Err(self.fail_negotiation(epoch, e).await),
        };
        if let Err(e) = peer.set_remote_description(offer).await {
            return Err(self.fail_negotiation(epoch, e.into()).await);
        }
        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail_negotiation(epoch, e.into()).await),
        };
        self.check_live(epoch)?;
        if let Err(err) = self
            .send(from, SignalingMessage::WebrtcAnswer { answer })
            .await
        {
            let call_id = self.session().map(|s| s.id);
            self.record_error(call_id, err.clone());
            return Err(err);
        }
        self.release_held_candidates(epoch).await;
        Ok(())
    }

    /// Handle an inbound `webrtc_answer`
    ///
    /// An answer with no peer connection to apply it to is ignored.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if there is no live call with `from`
    /// - `Negotiation` if the answer cannot be applied (the call ends)
    #[tracing::instrument(skip(self, answer), fields(local = %self.shared.local, from = %from))]
    pub async fn handle_answer(
        &self,
        from: &ParticipantId,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        let epoch = self.matching_epoch(from, "handle webrtc_answer")?;
        let peer = {
            let mut st = self.shared.state.lock();
            st.current(epoch).and_then(|s| {
                s.awaiting_glare_answer = false;
                s.peer.clone()
            })
        };
        let Some(peer) = peer else {
            tracing::debug!("Ignoring answer without a peer connection");
            return Ok(());
        };
        match peer.set_remote_description(answer).await {
            Ok(report) => {
                tracing::debug!(applied = report.applied, dropped = report.dropped, "Answer applied");
                Ok(())
            }
            Err(e) => Err(self.fail_negotiation(epoch, e.into()).await),
        }
    }

    /// Handle an inbound `webrtc_ice_candidate`
    ///
    /// Candidates are never an error: they are applied, queued, or dropped
    /// with a log line.
    #[tracing::instrument(skip(self, candidate), fields(local = %self.shared.local, from = %from))]
    pub async fn handle_ice_candidate(
        &self,
        from: &ParticipantId,
        candidate: IceCandidate,
    ) -> CandidateDisposition {
        let peer = {
            let mut st = self.shared.state.lock();
            let capacity = self.shared.config.ice_buffer_capacity;
            let stray_limit = self.shared.config.stray_candidate_peers;
            if let Some(s) = st.session.as_mut().filter(|s| s.record.remote == *from) {
                if s.ending || !s.record.state.is_live() {
                    tracing::trace!("Dropping candidate for finished call");
                    return CandidateDisposition::Rejected;
                }
                if s.awaiting_glare_answer {
                    tracing::debug!("Dropping candidate from abandoned glare attempt");
                    return CandidateDisposition::Rejected;
                }
                match &s.peer {
                    Some(peer) => peer.clone(),
                    None => {
                        s.early.enqueue(candidate);
                        return CandidateDisposition::Queued;
                    }
                }
            } else {
                if stray_limit == 0 {
                    return CandidateDisposition::Rejected;
                }
                if let Some((_, buffer)) = st.stray.iter_mut().find(|(p, _)| p == from) {
                    buffer.enqueue(candidate);
                } else {
                    if st.stray.len() >= stray_limit {
                        if let Some((evicted, _)) = st.stray.pop_front() {
                            tracing::debug!(peer = %evicted, "Evicting stray candidates");
                        }
                    }
                    let mut buffer = IceCandidateBuffer::new(capacity);
                    buffer.enqueue(candidate);
                    st.stray.push_back((from.clone(), buffer));
                }
                tracing::trace!("Holding candidate until a session exists");
                return CandidateDisposition::Queued;
            }
        };
        peer.add_ice_candidate(candidate).await
    }

    /// Handle an inbound `call_channel_created`
    pub fn handle_channel_announced(
        &self,
        from: &ParticipantId,
        channel_id: CallId,
        name: String,
        call_type: ChannelType,
        participants: Vec<ParticipantId>,
    ) {
        tracing::debug!(from = %from, channel_id = %channel_id, "Call channel announced");
        let _ = self.shared.events.send(CallEvent::ChannelAnnounced {
            channel_id,
            name,
            call_type,
            participants,
        });
    }

    /// Handle an inbound `call_channel_left`; the remote leaving our channel ends the call
    pub async fn handle_channel_left(&self, channel_id: CallId, participant: ParticipantId) {
        let _ = self.shared.events.send(CallEvent::ParticipantLeft {
            channel_id,
            participant: participant.clone(),
        });
        let epoch = {
            let st = self.shared.state.lock();
            match st.session.as_ref() {
                Some(s)
                    if s.record.id == channel_id
                        && s.record.remote == participant
                        && !s.ending
                        && s.record.state.is_live() =>
                {
                    Some(s.epoch)
                }
                _ => None,
            }
        };
        if let Some(epoch) = epoch {
            self.end_session(epoch, EndReason::RemoteEnded, Notice::None)
                .await;
        }
    }

    /// Return from `Ended` to `Idle`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while a call is live
    pub fn reset(&self) -> Result<(), CallError> {
        let mut st = self.shared.state.lock();
        match st.state() {
            CallState::Idle => Ok(()),
            CallState::Ended => {
                if let Some(old) = st.session.take() {
                    emit_transition(
                        &self.shared.events,
                        old.record.id,
                        CallState::Ended,
                        CallState::Idle,
                    );
                }
                Ok(())
            }
            state => Err(CallError::InvalidState {
                operation: "reset",
                state,
            }),
        }
    }

    fn store_media(&self, epoch: u64, media: LocalMedia) -> Result<(), CallError> {
        let mut st = self.shared.state.lock();
        match st.current(epoch) {
            Some(session) => {
                session.local_media = Some(media);
                Ok(())
            }
            None => {
                media.stop_all();
                Err(CallError::Cancelled)
            }
        }
    }

    /// Get the session's peer connection, creating it on first use
    ///
    /// A new handle is published to the session only once the session's early
    /// buffer has been drained into it, so remote candidates keep arrival order.
    async fn ensure_peer(&self, epoch: u64) -> Result<Arc<PeerConnectionHandle>, CallError> {
        let _negotiation = self.shared.negotiation.lock().await;
        let (call_id, existing, tracks) = {
            let mut st = self.shared.state.lock();
            let session = st.current(epoch).ok_or(CallError::Cancelled)?;
            let tracks = session
                .local_media
                .as_ref()
                .map(|m| m.tracks.clone())
                .unwrap_or_default();
            (session.record.id, session.peer.clone(), tracks)
        };
        if let Some(peer) = existing {
            peer.add_local_tracks(&tracks).await?;
            return Ok(peer);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.shared.engines.create(call_id, tx).await?;
        let peer = Arc::new(PeerConnectionHandle::new(
            call_id,
            engine,
            self.shared.config.ice_buffer_capacity,
        ));
        if let Err(e) = peer.add_local_tracks(&tracks).await {
            peer.close().await;
            return Err(e.into());
        }

        let mut rx = Some(rx);
        let mut adopted = 0;
        loop {
            let early = {
                let mut st = self.shared.state.lock();
                match st.current(epoch) {
                    None => None,
                    Some(session) if session.early.is_empty() => {
                        session.peer = Some(peer.clone());
                        if let Some(rx) = rx.take() {
                            session.pump = Some(self.spawn_event_pump(epoch, rx));
                        }
                        break;
                    }
                    Some(session) => Some(std::mem::replace(
                        &mut session.early,
                        IceCandidateBuffer::new(self.shared.config.ice_buffer_capacity),
                    )),
                }
            };
            let Some(early) = early else {
                peer.close().await;
                return Err(CallError::Cancelled);
            };
            adopted += early.len();
            peer.adopt_candidates(early).await;
        }
        tracing::debug!(call_id = %call_id, tracks = tracks.len(), early = adopted, "Peer connection created");
        Ok(peer)
    }

    /// Send local candidates that were held back until the offer/answer went out
    async fn release_held_candidates(&self, epoch: u64) {
        let (remote, held) = {
            let mut st = self.shared.state.lock();
            let Some(session) = st.current(epoch) else {
                return;
            };
            session.outbound_ready = true;
            (
                session.record.remote.clone(),
                std::mem::take(&mut session.held),
            )
        };
        for candidate in held {
            if let Err(e) = self
                .send(&remote, SignalingMessage::WebrtcIceCandidate { candidate })
                .await
            {
                tracing::warn!(error = %e, "Local candidate not delivered");
            }
        }
    }

    fn spawn_event_pump(&self, epoch: u64, mut rx: mpsc::UnboundedReceiver<EngineEvent>) -> AbortHandle {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.on_engine_event(epoch, event).await;
            }
            tracing::trace!(epoch, "Engine event pump finished");
        })
        .abort_handle()
    }

    async fn on_engine_event(&self, epoch: u64, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                let remote = {
                    let mut st = self.shared.state.lock();
                    let Some(session) = st.current(epoch) else {
                        return;
                    };
                    if !session.outbound_ready {
                        session.held.push(candidate);
                        return;
                    }
                    session.record.remote.clone()
                };
                if let Err(e) = self
                    .send(&remote, SignalingMessage::WebrtcIceCandidate { candidate })
                    .await
                {
                    tracing::warn!(error = %e, "Local candidate not delivered");
                }
            }
            EngineEvent::Connectivity(connectivity) => {
                let peer = {
                    let mut st = self.shared.state.lock();
                    st.current(epoch).and_then(|s| s.peer.clone())
                };
                let Some(peer) = peer else {
                    return;
                };
                let action = peer.observe_connectivity(connectivity).await;
                self.on_connectivity(epoch, action);
            }
            EngineEvent::RemoteTrack(track) => {
                let mut st = self.shared.state.lock();
                let Some(session) = st.current(epoch) else {
                    return;
                };
                if let Some(stream) = session.remote_media.add(track) {
                    let _ = self.shared.events.send(CallEvent::RemoteMedia {
                        call_id: session.record.id,
                        stream,
                    });
                }
            }
        }
    }

    fn on_connectivity(&self, epoch: u64, action: ConnectivityAction) {
        let mut st = self.shared.state.lock();
        let Some(session) = st.current(epoch) else {
            return;
        };
        match action {
            ConnectivityAction::Established => {
                cancel_timer(&mut session.grace_timer);
                session.ice_connected = true;
                if session.record.state == CallState::Connecting {
                    transition(&self.shared.events, session, CallState::Active);
                    tracing::info!(call_id = %session.record.id, "Call active");
                }
            }
            ConnectivityAction::Interrupted => {
                session.ice_connected = false;
                let grace = self.shared.config.disconnect_grace();
                if grace.is_zero() {
                    drop(st);
                    self.spawn_connectivity_loss(epoch, "ICE disconnected");
                } else if session.grace_timer.is_none() {
                    tracing::debug!(grace_ms = grace.as_millis(), "ICE disconnected, waiting for recovery");
                    session.grace_timer = Some(self.spawn_grace_timer(epoch));
                }
            }
            ConnectivityAction::Lost => {
                session.ice_connected = false;
                drop(st);
                self.spawn_connectivity_loss(epoch, "ICE failed");
            }
            ConnectivityAction::Ignore => {}
        }
    }

    fn spawn_connectivity_loss(&self, epoch: u64, detail: &'static str) {
        let this = self.clone();
        tokio::spawn(async move {
            let call_id = this.session().map(|s| s.id);
            this.record_error(call_id, CallError::Connectivity(detail.to_string()));
            this.end_session(epoch, EndReason::ConnectivityLost, Notice::Ended)
                .await;
        });
    }

    fn spawn_grace_timer(&self, epoch: u64) -> AbortHandle {
        let this = self.clone();
        let grace = self.shared.config.disconnect_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let fired = {
                let mut st = this.shared.state.lock();
                st.current(epoch)
                    .and_then(|s| s.grace_timer.take())
                    .is_some()
            };
            if fired {
                let call_id = this.session().map(|s| s.id);
                this.record_error(
                    call_id,
                    CallError::Connectivity("ICE did not recover".to_string()),
                );
                this.end_session(epoch, EndReason::ConnectivityLost, Notice::Ended)
                    .await;
            }
        })
        .abort_handle()
    }

    fn spawn_ring_timer(&self, epoch: u64) -> AbortHandle {
        let this = self.clone();
        let timeout = self.shared.config.ring_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let state = {
                let mut st = this.shared.state.lock();
                st.current(epoch)
                    .and_then(|s| s.ring_timer.take().map(|_| s.record.state))
            };
            match state {
                Some(CallState::Dialing) => {
                    tracing::info!("No answer before ring timeout");
                    this.end_session(epoch, EndReason::NoAnswer, Notice::Ended)
                        .await;
                }
                Some(CallState::Ringing) => {
                    tracing::info!("Missed call");
                    this.end_session(epoch, EndReason::Missed, Notice::Rejected)
                        .await;
                }
                _ => {}
            }
        })
        .abort_handle()
    }

    /// Mark the session as ending and take its resources out of it
    fn begin_teardown(&self, epoch: u64, notice: Notice) -> Option<Released> {
        let mut st = self.shared.state.lock();
        let session = st.current(epoch)?;
        session.ending = true;
        cancel_timer(&mut session.ring_timer);
        cancel_timer(&mut session.grace_timer);
        cancel_timer(&mut session.pump);
        session.pending_offer = None;
        session.held.clear();
        session.early.clear();
        let notify = match notice {
            Notice::None => None,
            Notice::Ended if session.remote_contacted => Some(SignalingMessage::CallEnded),
            Notice::Ended => None,
            Notice::Rejected => Some(SignalingMessage::CallRejected),
        };
        let released = Released {
            call_id: session.record.id,
            remote: session.record.remote.clone(),
            peer: session.peer.take(),
            media: session.local_media.take(),
            notify,
        };
        let remote = released.remote.clone();
        st.stray.retain(|(peer, _)| *peer != remote);
        Some(released)
    }

    /// Stop media, close the peer connection and give up the call channel
    async fn release(&self, released: &Released) {
        if let Some(media) = &released.media {
            media.stop_all();
        }
        if let Some(peer) = &released.peer {
            peer.close().await;
        }
        let registry = &self.shared.registry;
        if let Err(e) = registry.leave(released.call_id, &self.shared.local).await {
            tracing::warn!(call_id = %released.call_id, error = %e, "Leaving call channel failed");
        }
        if let Err(e) = registry.remove(released.call_id).await {
            tracing::warn!(call_id = %released.call_id, error = %e, "Removing call channel failed");
        }
    }

    /// Full teardown ending in `Ended`
    async fn end_session(&self, epoch: u64, reason: EndReason, notice: Notice) {
        let Some(released) = self.begin_teardown(epoch, notice) else {
            return;
        };
        tracing::info!(call_id = %released.call_id, reason = %reason, "Ending call");
        self.release(&released).await;

        if let Some(message) = released.notify.clone() {
            if let Err(err) = self.send(&released.remote, message).await {
                self.record_error(Some(released.call_id), err);
            }
        }

        let mut st = self.shared.state.lock();
        if let Some(session) = st.session.as_mut().filter(|s| s.epoch == epoch) {
            session.record.end_reason = Some(reason);
            if transition(&self.shared.events, session, CallState::Ended) {
                let _ = self.shared.events.send(CallEvent::CallEnded {
                    call_id: released.call_id,
                    reason,
                });
            }
        }
    }

    /// Silent teardown of an outgoing attempt, back to `Idle`
    async fn abort_to_idle(&self, epoch: u64) {
        let Some(released) = self.begin_teardown(epoch, Notice::None) else {
            return;
        };
        tracing::info!(call_id = %released.call_id, "Abandoning outgoing call");
        self.release(&released).await;

        let mut st = self.shared.state.lock();
        if st.session.as_ref().is_some_and(|s| s.epoch == epoch) {
            if let Some(old) = st.session.take() {
                emit_transition(
                    &self.shared.events,
                    old.record.id,
                    old.record.state,
                    CallState::Idle,
                );
            }
        }
    }

    /// Record a negotiation failure and end the call
    async fn fail_negotiation(&self, epoch: u64, err: CallError) -> CallError {
        let call_id = self.session().map(|s| s.id);
        self.record_error(call_id, err.clone());
        self.end_session(epoch, EndReason::NegotiationFailed, Notice::Ended)
            .await;
        err
    }
}
