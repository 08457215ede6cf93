//! Callwire - call signaling and session lifecycle for peer-to-peer calls
//!
//! This library drives one participant's side of a two-party audio/video
//! call. It features:
//!
//! - **Session state machine**: Idle, Dialing, Ringing, Connecting, Active, Ended
//! - **JSON signaling protocol**: invite, accept, reject, end and trickle ICE
//! - **Candidate buffering**: remote candidates that overtake their description are never lost
//! - **Pluggable engines**: `webrtc` peer connections in production, a simulated engine in tests
//! - **Call channels**: the shared membership record both sides agree on
//!
//! # Examples
//!
//! ```rust,no_run
//! use callwire_core::{
//!     CallService, LoopbackHub, ParticipantId, SignalingHandler, SimulatedEngineFactory,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = LoopbackHub::new();
//! let transport = Arc::new(hub.register("alice"));
//! let signaling = Arc::new(SignalingHandler::new(transport));
//!
//! let service = CallService::builder(ParticipantId::from("alice"), signaling)
//!     .with_engines(Arc::new(SimulatedEngineFactory::new()))
//!     .build()?;
//!
//! // Place a video call
//! let call_id = service
//!     .controller()
//!     .initiate(ParticipantId::from("bob"), true)
//!     .await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Participant identity
pub mod identity;

/// Controller configuration
pub mod config;

/// Signaling protocol and handlers
pub mod signaling;

/// In-process signaling bus
pub mod loopback;

/// Local and remote media
pub mod media;

/// Negotiation engine abstraction
pub mod engine;

/// Simulated negotiation engine
pub mod sim;

/// `webrtc`-backed negotiation engine
#[cfg(feature = "webrtc-engine")]
pub mod rtc_engine;

/// Remote ICE candidate buffering
pub mod ice;

/// Per-call peer connection handle
pub mod peer;

/// Call channel registry
pub mod registry;

/// Call session controller
pub mod call;

/// Call service orchestration
pub mod service;

// Re-export main types at crate root
pub use call::{CallError, CallSessionController, InviteDisposition};
pub use config::{CallConfig, ConfigError};
pub use engine::{ConnectivityState, EngineError, EngineEvent, EngineFactory, NegotiationEngine};
pub use ice::{FlushReport, IceCandidateBuffer};
pub use identity::ParticipantId;
pub use loopback::{LoopbackError, LoopbackHub, LoopbackTransport};
pub use media::{
    AudioDevice, DeviceMediaSource, LocalMedia, LocalTrack, MediaError, MediaKind, MediaSource,
    RemoteStream, RemoteTrack, VideoDevice,
};
pub use peer::{CandidateDisposition, ConnectivityAction, PeerConnectionHandle};
pub use registry::{CallChannel, CallChannelRegistry, ChannelType, InMemoryChannelRegistry, RegistryError};
#[cfg(feature = "webrtc-engine")]
pub use rtc_engine::{RtcEngine, RtcEngineFactory};
pub use service::{CallService, CallServiceBuilder, ServiceError};
pub use signaling::{
    SignalingEnvelope, SignalingError, SignalingHandler, SignalingMessage, SignalingTransport,
};
pub use sim::{SimProbe, SimulatedEngine, SimulatedEngineFactory};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallSessionController};
    pub use crate::config::CallConfig;
    pub use crate::identity::ParticipantId;
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
    pub use crate::types::{CallEvent, CallId, CallState, EndReason, MediaConstraints};
}
