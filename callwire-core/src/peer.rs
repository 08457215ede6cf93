//! Peer connection management
//!
//! A [`PeerConnectionHandle`] owns one negotiation engine for one call. All
//! description and candidate operations go through the handle's async lock,
//! so whether a candidate is applied or buffered is decided against a remote
//! description that cannot change underneath it.

use crate::engine::{ConnectivityState, EngineError, NegotiationEngine};
use crate::ice::{FlushReport, IceCandidateBuffer};
use crate::media::LocalTrack;
use crate::types::{CallId, IceCandidate, SessionDescription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What happened to a remote candidate handed to the handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Applied to the engine
    Applied,
    /// Held until the remote description is set
    Queued,
    /// Engine refused it; logged and otherwise ignored
    Rejected,
}

/// How the controller should react to a connectivity change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityAction {
    /// Media path is up
    Established,
    /// Lost connectivity; wait for the grace period
    Interrupted,
    /// Unrecoverable
    Lost,
    /// Nothing to do
    Ignore,
}

impl ConnectivityAction {
    /// Classify an engine connectivity state
    pub fn from_state(state: ConnectivityState) -> Self {
        match state {
            ConnectivityState::Connected | ConnectivityState::Completed => Self::Established,
            ConnectivityState::Disconnected => Self::Interrupted,
            ConnectivityState::Failed => Self::Lost,
            ConnectivityState::New | ConnectivityState::Checking | ConnectivityState::Closed => {
                Self::Ignore
            }
        }
    }
}

struct HandleState {
    buffer: IceCandidateBuffer,
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    local_tracks: Vec<String>,
    connectivity: ConnectivityState,
}

/// One call's negotiation engine plus its candidate buffer
pub struct PeerConnectionHandle {
    call_id: CallId,
    engine: Arc<dyn NegotiationEngine>,
    inner: Mutex<HandleState>,
    closed: AtomicBool,
}

impl PeerConnectionHandle {
    /// Wrap an engine
    pub fn new(call_id: CallId, engine: Arc<dyn NegotiationEngine>, buffer_capacity: usize) -> Self {
        Self {
            call_id,
            engine,
            inner: Mutex::new(HandleState {
                buffer: IceCandidateBuffer::new(buffer_capacity),
                local_desc: None,
                remote_desc: None,
                local_tracks: Vec::new(),
                connectivity: ConnectivityState::New,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Call this handle belongs to
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    /// Attach local tracks; tracks already attached are skipped
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if the engine refuses a track
    pub async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), EngineError> {
        self.ensure_open()?;
        let mut inner = self.inner.lock().await;
        for track in tracks {
            if inner.local_tracks.contains(&track.id) {
                continue;
            }
            self.engine.add_local_track(track).await?;
            inner.local_tracks.push(track.id.clone());
        }
        Ok(())
    }

    /// Create an offer and apply it locally before returning it
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Description` if either step fails
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        let mut inner = self.inner.lock().await;
        let offer = self.engine.create_offer().await?;
        self.engine.set_local_description(offer.clone()).await?;
        inner.local_desc = Some(offer.clone());
        Ok(offer)
    }

    /// Create an answer and apply it locally before returning it
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Description` if either step fails
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        let mut inner = self.inner.lock().await;
        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(answer.clone()).await?;
        inner.local_desc = Some(answer.clone());
        Ok(answer)
    }

    /// Apply the peer's description, then drain buffered candidates
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Description` if the engine refuses it; buffered
    /// candidates stay queued in that case
    #[tracing::instrument(skip(self, desc), fields(call_id = %self.call_id, kind = ?desc.kind))]
    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<FlushReport, EngineError> {
        self.ensure_open()?;
        let mut inner = self.inner.lock().await;
        self.engine.set_remote_description(desc.clone()).await?;
        inner.remote_desc = Some(desc);
        let report = inner.buffer.flush(self.engine.as_ref()).await;
        Ok(report)
    }

    /// Apply a remote candidate, or buffer it until the remote description is set
    #[tracing::instrument(skip(self, candidate), fields(call_id = %self.call_id))]
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> CandidateDisposition {
        if self.is_closed() {
            return CandidateDisposition::Rejected;
        }
        let mut inner = self.inner.lock().await;
        if inner.remote_desc.is_none() {
            tracing::trace!(candidate = %candidate.candidate, "Queueing candidate");
            inner.buffer.enqueue(candidate);
            return CandidateDisposition::Queued;
        }
        match self.engine.add_ice_candidate(candidate).await {
            Ok(()) => CandidateDisposition::Applied,
            Err(e) => {
                tracing::warn!(error = %e, "Remote candidate rejected");
                CandidateDisposition::Rejected
            }
        }
    }

    /// Queue candidates gathered before this handle existed
    pub async fn adopt_candidates(&self, early: IceCandidateBuffer) -> FlushReport {
        let mut inner = self.inner.lock().await;
        inner.buffer.adopt(early);
        if inner.remote_desc.is_some() {
            inner.buffer.flush(self.engine.as_ref()).await
        } else {
            FlushReport::default()
        }
    }

    /// Record a connectivity change and classify it
    pub async fn observe_connectivity(&self, state: ConnectivityState) -> ConnectivityAction {
        let mut inner = self.inner.lock().await;
        let previous = inner.connectivity;
        inner.connectivity = state;
        tracing::debug!(call_id = %self.call_id, from = ?previous, to = ?state, "ICE connectivity changed");
        if self.is_closed() {
            ConnectivityAction::Ignore
        } else {
            ConnectivityAction::from_state(state)
        }
    }

    /// Whether the remote description has been applied
    pub async fn has_remote_description(&self) -> bool {
        self.inner.lock().await.remote_desc.is_some()
    }

    /// Whether a local description has been applied
    pub async fn has_local_description(&self) -> bool {
        self.inner.lock().await.local_desc.is_some()
    }

    /// Candidates waiting for the remote description
    pub async fn queued_candidates(&self) -> usize {
        self.inner.lock().await.buffer.len()
    }

    /// Close the engine and drop buffered candidates
    ///
    /// Returns `true` only for the call that actually closed it.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.engine.close().await {
            tracing::warn!(call_id = %self.call_id, error = %e, "Engine close failed");
        }
        let mut inner = self.inner.lock().await;
        inner.buffer.clear();
        inner.connectivity = ConnectivityState::Closed;
        tracing::debug!(call_id = %self.call_id, "Peer connection closed");
        true
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
