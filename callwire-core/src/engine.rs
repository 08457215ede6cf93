//! Media negotiation engine abstraction
//!
//! The engine is whatever actually speaks SDP and ICE: an
//! `RTCPeerConnection` from the `webrtc` crate in production
//! ([`crate::rtc_engine`]), or [`crate::sim::SimulatedEngine`] in process.
//! Engines push asynchronous observations (local candidates, connectivity,
//! remote tracks) into an [`EngineEventSender`] handed to them at creation.

use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{CallId, IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Creating or applying a session description failed
    #[error("Session description error: {0}")]
    Description(String),

    /// Applying an ICE candidate failed
    #[error("ICE candidate error: {0}")]
    Candidate(String),

    /// Engine already closed
    #[error("Engine closed")]
    Closed,

    /// Engine could not be constructed
    #[error("Engine setup failed: {0}")]
    Setup(String),
}

/// ICE connectivity state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Gathering not started
    New,
    /// Checks in progress
    Checking,
    /// A working pair was found
    Connected,
    /// Checks finished with a working pair
    Completed,
    /// Lost connectivity, may recover
    Disconnected,
    /// No working pair; will not recover
    Failed,
    /// Engine closed
    Closed,
}

/// Asynchronous engine observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A local candidate was gathered and should be trickled to the peer
    LocalCandidate(IceCandidate),
    /// ICE connectivity changed
    Connectivity(ConnectivityState),
    /// The peer started sending a track
    RemoteTrack(RemoteTrack),
}

/// Channel an engine reports [`EngineEvent`]s on
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Underlying SDP/ICE negotiation engine, one per call
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Attach a captured local track
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if the track cannot be added
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), EngineError>;

    /// Produce an SDP offer
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Description` on failure
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    /// Produce an SDP answer to the applied remote offer
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Description` on failure
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    /// Apply a local description; gathering starts afterwards
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Description` on failure
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Apply the peer's description
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Description` on failure
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Candidate` on failure
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Release the engine
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if shutdown fails; the engine is unusable either way
    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds one engine per call
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Create an engine that reports on `events`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Setup` if the engine cannot be constructed
    async fn create(
        &self,
        call_id: CallId,
        events: EngineEventSender,
    ) -> Result<Arc<dyn NegotiationEngine>, EngineError>;
}
