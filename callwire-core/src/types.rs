//! Call types and data structures

use crate::call::CallError;
use crate::identity::ParticipantId;
use crate::media::RemoteStream;
use crate::registry::ChannelType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
///
/// A session id is always equal to the id of its call channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the call the local participant is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Originated the call and owns the channel id
    Caller,
    /// Received the invite
    Callee,
}

/// Call state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// No call
    Idle,
    /// Outgoing invite sent, waiting for the callee
    Dialing,
    /// Incoming invite waiting for the local user
    Ringing,
    /// Call accepted, media path being established
    Connecting,
    /// Media is flowing
    Active,
    /// Call is over; must be reset before reuse
    Ended,
}

impl CallState {
    /// Whether the state is terminal
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == CallState::Ended
    }

    /// Whether a session exists and has not ended
    #[must_use]
    pub fn is_live(self) -> bool {
        !matches!(self, CallState::Idle | CallState::Ended)
    }

    /// Check if a state transition is valid
    ///
    /// # Valid Transitions
    ///
    /// - **Outgoing**: Idle → Dialing → Connecting → Active
    /// - **Incoming**: Idle → Ringing → Connecting → Active
    /// - **Aborted dial**: Dialing → Idle (media or delivery failure, glare yield)
    /// - **Teardown**: any live state → Ended
    /// - **Reuse**: Ended → Idle
    #[must_use]
    pub fn can_transition_to(self, to: CallState) -> bool {
        matches!(
            (self, to),
            (CallState::Idle, CallState::Dialing)
                | (CallState::Idle, CallState::Ringing)
                | (CallState::Dialing, CallState::Connecting)
                | (CallState::Dialing, CallState::Idle)
                | (CallState::Ringing, CallState::Connecting)
                | (CallState::Connecting, CallState::Active)
                | (CallState::Dialing, CallState::Ended)
                | (CallState::Ringing, CallState::Ended)
                | (CallState::Connecting, CallState::Ended)
                | (CallState::Active, CallState::Ended)
                | (CallState::Ended, CallState::Idle)
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Constraints for the `isVideo` flag carried by an invite
    pub fn for_call(is_video: bool) -> Self {
        if is_video {
            Self::video_call()
        } else {
            Self::audio_only()
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }
}

/// Why a session reached `Ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote sent `call_ended` or left the channel
    RemoteEnded,
    /// Local user declined the invite
    Rejected,
    /// Remote declined our invite
    RemoteRejected,
    /// Dialing timed out
    NoAnswer,
    /// Ringing timed out
    Missed,
    /// ICE failed, or stayed disconnected past the grace period
    ConnectivityLost,
    /// Description exchange or channel membership failed
    NegotiationFailed,
    /// Local media could not be acquired
    MediaUnavailable,
    /// An answer could not be delivered
    SignalingFailed,
}

impl EndReason {
    /// Stable kebab-case label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalHangup => "local-hangup",
            Self::RemoteEnded => "remote-ended",
            Self::Rejected => "rejected",
            Self::RemoteRejected => "remote-rejected",
            Self::NoAnswer => "no-answer",
            Self::Missed => "missed",
            Self::ConnectivityLost => "connectivity-lost",
            Self::NegotiationFailed => "negotiation-failed",
            Self::MediaUnavailable => "media-unavailable",
            Self::SignalingFailed => "signaling-failed",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
}

/// SDP session description, in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap SDP text as an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap SDP text as an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate, in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media ID
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate bound to the first media section
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Snapshot of a call session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    /// Call identifier (equal to the call channel id)
    pub id: CallId,
    /// Local role
    pub role: Role,
    /// Current state
    pub state: CallState,
    /// Local participant
    pub local: ParticipantId,
    /// Remote participant
    pub remote: ParticipantId,
    /// Whether video was requested at creation
    pub is_video: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the call became active
    pub started_at: Option<DateTime<Utc>>,
    /// When the call ended
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the call ended
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    /// Create a new session record in the given state
    pub fn new(
        id: CallId,
        role: Role,
        state: CallState,
        local: ParticipantId,
        remote: ParticipantId,
        is_video: bool,
    ) -> Self {
        Self {
            id,
            role,
            state,
            local,
            remote,
            is_video,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    /// Get call duration
    pub fn duration(&self) -> Option<chrono::Duration> {
        if let (Some(start), Some(end)) = (self.started_at, self.ended_at) {
            Some(end - start)
        } else {
            self.started_at.map(|start| Utc::now() - start)
        }
    }
}

/// Call event for observers (UI, notifications)
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// State machine transition
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        from: CallState,
        /// New state
        to: CallState,
    },
    /// Incoming call is ringing
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        from: ParticipantId,
        /// Whether the caller asked for video
        is_video: bool,
    },
    /// A peer announced a call channel
    ChannelAnnounced {
        /// Channel identifier
        channel_id: CallId,
        /// Display name
        name: String,
        /// Voice or video
        call_type: ChannelType,
        /// Announced members
        participants: Vec<ParticipantId>,
    },
    /// A participant left a call channel
    ParticipantLeft {
        /// Channel identifier
        channel_id: CallId,
        /// Who left
        participant: ParticipantId,
    },
    /// Remote media changed; always the merged stream
    RemoteMedia {
        /// Call identifier
        call_id: CallId,
        /// Aggregated remote stream
        stream: RemoteStream,
    },
    /// Call ended
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
    },
    /// Non-fatal problem worth surfacing to the user
    Warning {
        /// Call identifier, if a session was involved
        call_id: Option<CallId>,
        /// The error
        error: CallError,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_media_constraints() {
        let audio = MediaConstraints::audio_only();
        assert!(audio.has_audio());
        assert!(!audio.has_video());

        let video = MediaConstraints::video_call();
        assert!(video.has_audio());
        assert!(video.has_video());

        assert_eq!(MediaConstraints::for_call(true), video);
        assert_eq!(MediaConstraints::for_call(false), audio);
    }

    #[test]
    fn test_valid_transitions() {
        assert!(CallState::Idle.can_transition_to(CallState::Dialing));
        assert!(CallState::Idle.can_transition_to(CallState::Ringing));
        assert!(CallState::Dialing.can_transition_to(CallState::Connecting));
        assert!(CallState::Ringing.can_transition_to(CallState::Connecting));
        assert!(CallState::Connecting.can_transition_to(CallState::Active));
        assert!(CallState::Active.can_transition_to(CallState::Ended));
        assert!(CallState::Ended.can_transition_to(CallState::Idle));
        assert!(CallState::Dialing.can_transition_to(CallState::Idle));

        assert!(!CallState::Idle.can_transition_to(CallState::Active));
        assert!(!CallState::Ringing.can_transition_to(CallState::Active));
        assert!(!CallState::Ended.can_transition_to(CallState::Dialing));
        assert!(!CallState::Active.can_transition_to(CallState::Connecting));
        assert!(!CallState::Idle.can_transition_to(CallState::Ended));
    }

    #[test]
    fn test_state_classification() {
        assert!(CallState::Ended.is_terminal());
        assert!(!CallState::Idle.is_live());
        assert!(CallState::Ringing.is_live());
        assert!(!CallState::Ended.is_live());
    }

    #[test]
    fn test_end_reason_labels() {
        assert_eq!(EndReason::ConnectivityLost.to_string(), "connectivity-lost");
        assert_eq!(
            serde_json::to_string(&EndReason::NegotiationFailed).unwrap(),
            "\"negotiation-failed\""
        );
    }

    #[test]
    fn test_session_description_wire_shape() {
        let offer = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");
    }

    #[test]
    fn test_ice_candidate_wire_shape() {
        let json = r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());

        let back = serde_json::to_string(&candidate).unwrap();
        assert!(!back.contains("usernameFragment"));
    }

    #[test]
    fn test_call_session_duration() {
        let mut session = CallSession::new(
            CallId::new(),
            Role::Caller,
            CallState::Dialing,
            ParticipantId::from("alice"),
            ParticipantId::from("bob"),
            false,
        );
        assert!(session.duration().is_none());

        let start = Utc::now();
        session.started_at = Some(start);
        session.ended_at = Some(start + chrono::Duration::seconds(30));
        assert_eq!(session.duration(), Some(chrono::Duration::seconds(30)));
    }
}
