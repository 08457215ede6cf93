//! Call signaling protocol
//!
//! Tagged JSON messages exchanged between the two participants of a call over
//! an external, unordered message bus. Every message is addressed with `to`;
//! the bus attaches `from` on delivery.

use crate::identity::ParticipantId;
use crate::registry::ChannelType;
use crate::types::{CallId, IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Envelope could not be decoded
    #[error("Malformed signaling message: {0}")]
    Malformed(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Recipient cannot be reached right now
    #[error("Signaling unavailable for {0}")]
    Unavailable(ParticipantId),
}

/// Signaling transport trait
///
/// Implement this for the message bus the host application uses (websocket,
/// socket.io room, in-process loopback). Delivery is best effort: messages
/// may be lost, duplicated or reordered across connections.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a signaling message to a participant
    async fn send_message(
        &self,
        to: &ParticipantId,
        message: SignalingMessage,
    ) -> Result<(), Self::Error>;

    /// Receive the next signaling message addressed to us
    async fn receive_message(&self) -> Result<(ParticipantId, SignalingMessage), Self::Error>;
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Invite carrying the caller's SDP offer
    CallIncoming {
        /// SDP offer
        offer: SessionDescription,
        /// Whether the caller asked for video
        #[serde(rename = "isVideo")]
        is_video: bool,
        /// Call channel created by the caller
        #[serde(rename = "channelId")]
        channel_id: CallId,
    },

    /// Callee accepted
    CallAccepted,

    /// Callee declined
    CallRejected,

    /// Either side hung up
    CallEnded,

    /// (Re-)negotiation offer
    WebrtcOffer {
        /// SDP offer
        offer: SessionDescription,
    },

    /// SDP answer
    WebrtcAnswer {
        /// SDP answer
        answer: SessionDescription,
    },

    /// One trickled ICE candidate
    WebrtcIceCandidate {
        /// The candidate
        candidate: IceCandidate,
    },

    /// Call channel announcement
    CallChannelCreated {
        /// Channel id
        #[serde(rename = "channelId")]
        channel_id: CallId,
        /// Display name
        #[serde(rename = "channelName")]
        channel_name: String,
        /// Voice or video
        #[serde(rename = "callType")]
        call_type: ChannelType,
        /// Members at creation
        participants: Vec<ParticipantId>,
    },

    /// A participant left a call channel
    CallChannelLeft {
        /// Channel id
        #[serde(rename = "channelId")]
        channel_id: CallId,
        /// Who left
        #[serde(rename = "userId")]
        user_id: ParticipantId,
    },
}

impl SignalingMessage {
    /// Wire discriminator of this message
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::CallIncoming { .. } => "call_incoming",
            Self::CallAccepted => "call_accepted",
            Self::CallRejected => "call_rejected",
            Self::CallEnded => "call_ended",
            Self::WebrtcOffer { .. } => "webrtc_offer",
            Self::WebrtcAnswer { .. } => "webrtc_answer",
            Self::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
            Self::CallChannelCreated { .. } => "call_channel_created",
            Self::CallChannelLeft { .. } => "call_channel_left",
        }
    }

    /// Whether this message drives media negotiation rather than call control
    #[must_use]
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Self::WebrtcOffer { .. } | Self::WebrtcAnswer { .. } | Self::WebrtcIceCandidate { .. }
        )
    }
}

/// Addressed signaling message as it travels on the bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalingEnvelope {
    /// Recipient
    pub to: ParticipantId,
    /// Sender, attached by the bus on delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ParticipantId>,
    /// Payload, flattened so `type` sits next to `to`
    #[serde(flatten)]
    pub message: SignalingMessage,
}

impl SignalingEnvelope {
    /// Address a message
    pub fn new(to: ParticipantId, message: SignalingMessage) -> Self {
        Self {
            to,
            from: None,
            message,
        }
    }

    /// Stamp the sender
    #[must_use]
    pub fn with_from(mut self, from: ParticipantId) -> Self {
        self.from = Some(from);
        self
    }

    /// Encode to JSON
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Malformed` if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Malformed` for invalid JSON, an unknown `type`
    /// or missing fields
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

/// Minimum time between messages (10ms for 100 msg/sec rate limit)
const MIN_MESSAGE_INTERVAL: Duration = Duration::from_millis(10);

/// Signaling handler with rate limiting
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
    min_interval: Duration,
    last_receive_time: tokio::sync::Mutex<Instant>,
    error_count: tokio::sync::Mutex<u32>,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_min_interval(transport, MIN_MESSAGE_INTERVAL)
    }

    /// Create a handler with a custom receive rate limit
    #[must_use]
    pub fn with_min_interval(transport: Arc<T>, min_interval: Duration) -> Self {
        Self {
            transport,
            min_interval,
            last_receive_time: tokio::sync::Mutex::new(Instant::now()),
            error_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Send a signaling message to a participant
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(peer = %to, message_type = message.message_type()))]
    pub async fn send_message(
        &self,
        to: &ParticipantId,
        message: SignalingMessage,
    ) -> Result<(), T::Error> {
        tracing::debug!("Sending signaling message");
        self.transport.send_message(to, message).await
    }

    /// Receive a signaling message with rate limiting and backpressure
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    #[tracing::instrument(skip(self))]
    pub async fn receive_message(&self) -> Result<(ParticipantId, SignalingMessage), T::Error> {
        let mut last_time = self.last_receive_time.lock().await;
        let elapsed = Instant::now().duration_since(*last_time);

        if elapsed < self.min_interval {
            let sleep_duration = self.min_interval - elapsed;
            tracing::trace!(
                sleep_ms = sleep_duration.as_millis(),
                "Rate limiting applied"
            );
            drop(last_time);
            sleep(sleep_duration).await;
            last_time = self.last_receive_time.lock().await;
        }

        *last_time = Instant::now();
        drop(last_time);

        match self.transport.receive_message().await {
            Ok(result) => {
                *self.error_count.lock().await = 0;
                tracing::debug!(peer = %result.0, message_type = result.1.message_type(), "Received signaling message");
                Ok(result)
            }
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count = error_count.saturating_add(1);
                let count = *error_count;
                drop(error_count);

                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    error = %e,
                    "Error receiving message, applying backoff"
                );
                sleep(backoff_duration).await;

                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct MockTransport {
        messages: Mutex<VecDeque<(ParticipantId, SignalingMessage)>>,
    }

    #[derive(Debug)]
    struct MockError;

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Mock error")
        }
    }

    impl std::error::Error for MockError {}

    impl MockTransport {
        fn new() -> Self {
            Self {
                messages: Mutex::new(VecDeque::new()),
            }
        }
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        type Error = MockError;

        async fn send_message(
            &self,
            to: &ParticipantId,
            message: SignalingMessage,
        ) -> Result<(), MockError> {
            self.messages
                .lock()
                .unwrap()
                .push_back((to.clone(), message));
            Ok(())
        }

        async fn receive_message(&self) -> Result<(ParticipantId, SignalingMessage), MockError> {
            self.messages
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(MockError)
        }
    }

    #[tokio::test]
    async fn test_signaling_handler_send_and_receive() {
        let transport = Arc::new(MockTransport::new());
        let handler = SignalingHandler::new(transport.clone());

        handler
            .send_message(&ParticipantId::from("bob"), SignalingMessage::CallAccepted)
            .await
            .unwrap();

        let (peer, message) = handler.receive_message().await.unwrap();
        assert_eq!(peer, ParticipantId::from("bob"));
        assert_eq!(message, SignalingMessage::CallAccepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_applies_backoff() {
        let transport = Arc::new(MockTransport::new());
        let handler = SignalingHandler::with_min_interval(transport, Duration::ZERO);

        let started = Instant::now();
        assert!(handler.receive_message().await.is_err());
        assert!(handler.receive_message().await.is_err());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_unit_message_wire_shape() {
        let envelope = SignalingEnvelope::new(ParticipantId::from("bob"), SignalingMessage::CallEnded);
        assert_eq!(envelope.to_json().unwrap(), r#"{"to":"bob","type":"call_ended"}"#);
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let result = SignalingEnvelope::from_json(r#"{"to":"bob","type":"call_teleport"}"#);
        assert!(matches!(result, Err(SignalingError::Malformed(_))));

        let result = SignalingEnvelope::from_json("not json");
        assert!(matches!(result, Err(SignalingError::Malformed(_))));
    }

    #[test]
    fn test_message_classification() {
        let candidate = SignalingMessage::WebrtcIceCandidate {
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"),
        };
        assert!(candidate.is_negotiation());
        assert_eq!(candidate.message_type(), "webrtc_ice_candidate");
        assert!(!SignalingMessage::CallRejected.is_negotiation());
    }
}
