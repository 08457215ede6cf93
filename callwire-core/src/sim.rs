//! In-process negotiation engine
//!
//! `SimulatedEngine` produces and parses just enough SDP to carry track
//! identities between two peers, gathers fake host candidates and reports
//! connectivity once both descriptions and a remote candidate are in place.
//! Every engine it creates can be inspected and steered through a [`SimProbe`].

use crate::engine::{
    ConnectivityState, EngineError, EngineEvent, EngineEventSender, EngineFactory,
    NegotiationEngine,
};
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::types::{CallId, IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_PORT: AtomicU32 = AtomicU32::new(50_000);

#[derive(Default)]
struct SimState {
    call_id: Option<CallId>,
    events: Option<EngineEventSender>,
    auto_connect: bool,
    track_delay: Duration,
    local_tracks: Vec<LocalTrack>,
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    fail_candidates: usize,
    connected: bool,
    closed: bool,
    close_calls: usize,
}

impl SimState {
    fn emit(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn maybe_connect(&mut self) {
        if self.auto_connect
            && !self.connected
            && self.local_desc.is_some()
            && self.remote_desc.is_some()
            && !self.applied.is_empty()
        {
            self.connected = true;
            self.emit(EngineEvent::Connectivity(ConnectivityState::Connected));
        }
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn render_sdp(&self) -> String {
        let mut sdp = String::from("v=0\r\n");
        let session = self.call_id.map(|id| id.to_string()).unwrap_or_default();
        let _ = write!(sdp, "o=- {session} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        for (mid, track) in self.local_tracks.iter().enumerate() {
            let _ = write!(
                sdp,
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{mid}\r\na=msid:{} {}\r\n",
                track.kind, track.stream_id, track.id
            );
        }
        sdp
    }
}

fn parse_remote_tracks(sdp: &str) -> Vec<RemoteTrack> {
    let mut tracks = Vec::new();
    let mut kind = None;
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            kind = match media.split_whitespace().next() {
                Some("audio") => Some(MediaKind::Audio),
                Some("video") => Some(MediaKind::Video),
                _ => None,
            };
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            let mut parts = msid.split_whitespace();
            if let (Some(kind), Some(stream_id), Some(id)) = (kind, parts.next(), parts.next()) {
                tracks.push(RemoteTrack {
                    id: id.to_string(),
                    kind,
                    stream_id: stream_id.to_string(),
                });
            }
        }
    }
    tracks
}

/// Deterministic in-process negotiation engine
pub struct SimulatedEngine {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl NegotiationEngine for SimulatedEngine {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), EngineError> {
        let delay = self.state.lock().track_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.local_tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let state = self.state.lock();
        state.ensure_open()?;
        Ok(SessionDescription::offer(state.render_sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let state = self.state.lock();
        state.ensure_open()?;
        match &state.remote_desc {
            Some(remote) if remote.kind == SdpKind::Offer => {
                Ok(SessionDescription::answer(state.render_sdp()))
            }
            _ => Err(EngineError::Description(
                "no remote offer to answer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !desc.sdp.starts_with("v=0") {
            return Err(EngineError::Description("malformed local SDP".to_string()));
        }
        state.local_desc = Some(desc);

        for component in 1..=2u32 {
            let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
            state.emit(EngineEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{component} 1 udp 2122260223 192.168.1.{component} {port} typ host"
            ))));
        }
        state.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !desc.sdp.starts_with("v=0") {
            return Err(EngineError::Description("malformed remote SDP".to_string()));
        }
        for track in parse_remote_tracks(&desc.sdp) {
            state.emit(EngineEvent::RemoteTrack(track));
        }
        state.remote_desc = Some(desc);
        state.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.remote_desc.is_none() {
            return Err(EngineError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        if state.fail_candidates > 0 {
            state.fail_candidates -= 1;
            return Err(EngineError::Candidate("injected failure".to_string()));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(EngineError::Candidate(format!(
                "unparseable candidate: {}",
                candidate.candidate
            )));
        }
        state.applied.push(candidate);
        state.maybe_connect();
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.closed = true;
        // Dropping the sender ends the owner's event pump.
        state.events = None;
        Ok(())
    }
}

/// Inspection and control handle for one [`SimulatedEngine`]
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimProbe {
    /// Candidate lines applied so far, in order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .applied
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    /// How many times `close` was called
    pub fn close_count(&self) -> usize {
        self.state.lock().close_calls
    }

    /// Whether the engine is closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Local tracks attached
    pub fn local_track_count(&self) -> usize {
        self.state.lock().local_tracks.len()
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_desc.clone()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_desc.clone()
    }

    /// Fail the next `n` candidate applications
    pub fn fail_next_candidates(&self, n: usize) {
        self.state.lock().fail_candidates = n;
    }

    /// Report a connectivity change as if ICE had observed it
    pub fn set_connectivity(&self, connectivity: ConnectivityState) {
        let mut state = self.state.lock();
        if matches!(
            connectivity,
            ConnectivityState::Connected | ConnectivityState::Completed
        ) {
            state.connected = true;
        }
        state.emit(EngineEvent::Connectivity(connectivity));
    }
}

/// Builds [`SimulatedEngine`]s and keeps a probe on each
#[derive(Clone)]
pub struct SimulatedEngineFactory {
    created: Arc<Mutex<Vec<SimProbe>>>,
    auto_connect: bool,
    track_delay: Duration,
}

impl SimulatedEngineFactory {
    /// Engines connect on their own once negotiation completes
    pub fn new() -> Self {
        Self {
            created: Arc::new(Mutex::new(Vec::new())),
            auto_connect: true,
            track_delay: Duration::ZERO,
        }
    }

    /// Delay every local track attachment, as a slow encoder setup would
    #[must_use]
    pub fn with_track_delay(mut self, delay: Duration) -> Self {
        self.track_delay = delay;
        self
    }

    /// Engines only change connectivity through [`SimProbe::set_connectivity`]
    pub fn manual() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    /// Number of engines created
    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    /// Probe on the most recently created engine
    pub fn last(&self) -> Option<SimProbe> {
        self.created.lock().last().cloned()
    }
}

impl Default for SimulatedEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineFactory for SimulatedEngineFactory {
    async fn create(
        &self,
        call_id: CallId,
        events: EngineEventSender,
    ) -> Result<Arc<dyn NegotiationEngine>, EngineError> {
        let state = Arc::new(Mutex::new(SimState {
            call_id: Some(call_id),
            events: Some(events),
            auto_connect: self.auto_connect,
            track_delay: self.track_delay,
            ..SimState::default()
        }));
        self.created.lock().push(SimProbe {
            state: state.clone(),
        });
        tracing::trace!(call_id = %call_id, "Simulated engine created");
        Ok(Arc::new(SimulatedEngine { state }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_offer_answer_exchange_reports_tracks_and_connectivity() {
        let factory = SimulatedEngineFactory::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = factory.create(CallId::new(), tx_a).await.unwrap();
        let b = factory.create(CallId::new(), tx_b).await.unwrap();

        a.add_local_track(&LocalTrack::new("mic", MediaKind::Audio, "s-a"))
            .await
            .unwrap();
        let offer = a.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        a.set_local_description(offer.clone()).await.unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let mut a_candidates = Vec::new();
        while let Ok(event) = rx_a.try_recv() {
            if let EngineEvent::LocalCandidate(c) = event {
                a_candidates.push(c);
            }
        }
        assert_eq!(a_candidates.len(), 2);

        let mut saw_track = false;
        while let Ok(event) = rx_b.try_recv() {
            if let EngineEvent::RemoteTrack(track) = event {
                assert_eq!(track.id, "mic");
                assert_eq!(track.stream_id, "s-a");
                saw_track = true;
            }
        }
        assert!(saw_track);

        b.add_ice_candidate(a_candidates[0].clone()).await.unwrap();
        assert_eq!(
            rx_b.try_recv().unwrap(),
            EngineEvent::Connectivity(ConnectivityState::Connected)
        );
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let factory = SimulatedEngineFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = factory.create(CallId::new(), tx).await.unwrap();
        let result = engine
            .add_ice_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host"))
            .await;
        assert!(matches!(result, Err(EngineError::Candidate(_))));
    }

    #[tokio::test]
    async fn test_malformed_remote_sdp_rejected() {
        let factory = SimulatedEngineFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = factory.create(CallId::new(), tx).await.unwrap();
        let result = engine
            .set_remote_description(SessionDescription::offer("garbage"))
            .await;
        assert!(matches!(result, Err(EngineError::Description(_))));
    }

    #[tokio::test]
    async fn test_close_drops_event_sender() {
        let factory = SimulatedEngineFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = factory.create(CallId::new(), tx).await.unwrap();
        engine.close().await.unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(factory.last().unwrap().close_count(), 1);
    }
}
