//! In-process signaling bus
//!
//! Carries the real JSON wire format between participants registered on the
//! same hub. Used by the CLI demo and the tests; a participant can be taken
//! offline to simulate an unreachable signaling server.

use crate::identity::ParticipantId;
use crate::signaling::{SignalingEnvelope, SignalingError, SignalingMessage, SignalingTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Loopback transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopbackError {
    /// Recipient is not registered or is offline
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(ParticipantId),

    /// This participant is offline
    #[error("Transport offline")]
    Offline,

    /// Hub dropped our inbox
    #[error("Transport closed")]
    Closed,

    /// Inbound frame did not decode
    #[error(transparent)]
    Malformed(#[from] SignalingError),
}

#[derive(Default)]
struct HubState {
    inboxes: HashMap<ParticipantId, mpsc::UnboundedSender<String>>,
    offline: HashSet<ParticipantId>,
    log: Vec<SignalingEnvelope>,
}

/// Shared in-process message bus
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant and get its transport
    ///
    /// Registering the same id again replaces the previous inbox.
    pub fn register(&self, id: impl Into<ParticipantId>) -> LoopbackTransport {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().inboxes.insert(id.clone(), tx);
        tracing::debug!(participant = %id, "Registered on loopback hub");
        LoopbackTransport {
            id,
            hub: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Take a participant on- or offline
    pub fn set_online(&self, id: &ParticipantId, online: bool) {
        let mut state = self.state.lock();
        if online {
            state.offline.remove(id);
        } else {
            state.offline.insert(id.clone());
        }
    }

    /// Push a raw frame into a participant's inbox, bypassing encoding
    pub fn inject_raw(&self, to: &ParticipantId, frame: impl Into<String>) -> bool {
        let state = self.state.lock();
        state
            .inboxes
            .get(to)
            .is_some_and(|tx| tx.send(frame.into()).is_ok())
    }

    /// Every envelope delivered so far, in delivery order
    pub fn delivered(&self) -> Vec<SignalingEnvelope> {
        self.state.lock().log.clone()
    }

    /// Count delivered messages of one type from one sender
    pub fn count_from(&self, from: &ParticipantId, message_type: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|e| e.from.as_ref() == Some(from) && e.message.message_type() == message_type)
            .count()
    }

    fn deliver(&self, envelope: SignalingEnvelope) -> Result<(), LoopbackError> {
        let frame = envelope.to_json()?;
        let mut state = self.state.lock();
        if let Some(from) = &envelope.from {
            if state.offline.contains(from) {
                return Err(LoopbackError::Offline);
            }
        }
        if state.offline.contains(&envelope.to) {
            return Err(LoopbackError::PeerUnavailable(envelope.to.clone()));
        }
        let inbox = state
            .inboxes
            .get(&envelope.to)
            .ok_or_else(|| LoopbackError::PeerUnavailable(envelope.to.clone()))?;
        inbox
            .send(frame)
            .map_err(|_| LoopbackError::PeerUnavailable(envelope.to.clone()))?;
        state.log.push(envelope);
        Ok(())
    }
}

/// One participant's end of a [`LoopbackHub`]
pub struct LoopbackTransport {
    id: ParticipantId,
    hub: LoopbackHub,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl LoopbackTransport {
    /// Our participant id
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Non-blocking receive, for tests that drain the inbox by hand
    ///
    /// # Errors
    ///
    /// Returns `LoopbackError::Malformed` if the next frame does not decode
    pub fn try_receive(&self) -> Result<Option<(ParticipantId, SignalingMessage)>, LoopbackError> {
        let Ok(mut inbox) = self.inbox.try_lock() else {
            return Ok(None);
        };
        match inbox.try_recv() {
            Ok(frame) => decode(&frame).map(Some),
            Err(_) => Ok(None),
        }
    }
}

fn decode(frame: &str) -> Result<(ParticipantId, SignalingMessage), LoopbackError> {
    let envelope = SignalingEnvelope::from_json(frame)?;
    let from = envelope
        .from
        .ok_or_else(|| SignalingError::Malformed("missing sender".to_string()))?;
    Ok((from, envelope.message))
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    type Error = LoopbackError;

    async fn send_message(
        &self,
        to: &ParticipantId,
        message: SignalingMessage,
    ) -> Result<(), LoopbackError> {
        let envelope = SignalingEnvelope::new(to.clone(), message).with_from(self.id.clone());
        self.hub.deliver(envelope)
    }

    async fn receive_message(&self) -> Result<(ParticipantId, SignalingMessage), LoopbackError> {
        let frame = self
            .inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(LoopbackError::Closed)?;
        decode(&frame)
    }
}
