//! Buffer for remote ICE candidates that arrive before they can be applied
//!
//! Trickled candidates routinely overtake the description they belong to.
//! They are held here in arrival order and replayed once the remote
//! description is in place.

use crate::engine::NegotiationEngine;
use crate::types::IceCandidate;
use std::collections::VecDeque;

/// Default number of candidates held before the oldest is dropped
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Pending {
    candidate: IceCandidate,
    attempts: u8,
}

/// Outcome of draining a buffer into an engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Candidates the engine accepted
    pub applied: usize,
    /// Candidates that failed once and were retried after the batch
    pub retried: usize,
    /// Candidates given up on
    pub dropped: usize,
}

/// Bounded FIFO of remote candidates
#[derive(Debug, Clone)]
pub struct IceCandidateBuffer {
    queue: VecDeque<Pending>,
    capacity: usize,
    evicted: usize,
}

impl IceCandidateBuffer {
    /// Create a buffer holding at most `capacity` candidates
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    /// Append a candidate; returns the oldest candidate if it had to make room
    pub fn enqueue(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        let evicted = if self.queue.len() >= self.capacity {
            self.evicted += 1;
            self.queue.pop_front().map(|p| p.candidate)
        } else {
            None
        };
        if let Some(old) = &evicted {
            tracing::warn!(
                capacity = self.capacity,
                candidate = %old.candidate,
                "ICE buffer full, dropping oldest candidate"
            );
        }
        self.queue.push_back(Pending {
            candidate,
            attempts: 0,
        });
        evicted
    }

    /// Move every candidate of `other` to the back of this buffer
    pub fn adopt(&mut self, other: IceCandidateBuffer) {
        self.evicted += other.evicted;
        for pending in other.queue {
            self.enqueue(pending.candidate);
        }
    }

    /// Apply every held candidate in arrival order, leaving the buffer empty
    ///
    /// A candidate the engine refuses is retried once after the rest of the
    /// batch, then dropped.
    pub async fn flush(&mut self, engine: &dyn NegotiationEngine) -> FlushReport {
        let mut report = FlushReport::default();
        if self.queue.is_empty() {
            return report;
        }

        let mut retry = Vec::new();
        while let Some(mut pending) = self.queue.pop_front() {
            pending.attempts += 1;
            match engine.add_ice_candidate(pending.candidate.clone()).await {
                Ok(()) => report.applied += 1,
                Err(e) if pending.attempts < 2 => {
                    tracing::debug!(error = %e, "Candidate refused, retrying after batch");
                    report.retried += 1;
                    retry.push(pending);
                }
                Err(e) => {
                    tracing::warn!(error = %e, candidate = %pending.candidate.candidate, "Dropping candidate");
                    report.dropped += 1;
                }
            }
        }

        for pending in retry {
            match engine.add_ice_candidate(pending.candidate.clone()).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::warn!(error = %e, candidate = %pending.candidate.candidate, "Dropping candidate after retry");
                    report.dropped += 1;
                }
            }
        }

        tracing::debug!(
            applied = report.applied,
            retried = report.retried,
            dropped = report.dropped,
            "ICE buffer flushed"
        );
        report
    }

    /// Discard everything
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Number of held candidates
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Candidates dropped to respect the capacity
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    /// Held candidates, oldest first
    pub fn candidates(&self) -> impl Iterator<Item = &IceCandidate> {
        self.queue.iter().map(|p| &p.candidate)
    }
}

impl Default for IceCandidateBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::media::LocalTrack;
    use crate::types::SessionDescription;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    /// Engine that records candidates and refuses the ones listed in `refuse`
    #[derive(Default)]
    struct RecordingEngine {
        applied: Mutex<Vec<String>>,
        refuse: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingEngine {
        fn refusing(candidate: &str, times: usize) -> Self {
            let engine = Self::default();
            engine.refuse.lock().push((candidate.to_string(), times));
            engine
        }
    }

    #[async_trait]
    impl NegotiationEngine for RecordingEngine {
        async fn add_local_track(&self, _track: &LocalTrack) -> Result<(), EngineError> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
            Ok(SessionDescription::offer("v=0\r\n"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
            Ok(SessionDescription::answer("v=0\r\n"))
        }
        async fn set_local_description(&self, _d: SessionDescription) -> Result<(), EngineError> {
            Ok(())
        }
        async fn set_remote_description(&self, _d: SessionDescription) -> Result<(), EngineError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
            let mut refuse = self.refuse.lock();
            if let Some(entry) = refuse
                .iter_mut()
                .find(|(c, n)| *c == candidate.candidate && *n > 0)
            {
                entry.1 -= 1;
                return Err(EngineError::Candidate("refused".to_string()));
            }
            self.applied.lock().push(candidate.candidate);
            Ok(())
        }
        async fn close(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn test_flush_applies_in_order_and_empties() {
        let engine = RecordingEngine::default();
        let mut buffer = IceCandidateBuffer::default();
        for n in 1..=3 {
            buffer.enqueue(candidate(n));
        }

        let report = buffer.flush(&engine).await;
        assert_eq!(
            report,
            FlushReport {
                applied: 3,
                retried: 0,
                dropped: 0
            }
        );
        assert!(buffer.is_empty());
        let expected: Vec<String> = (1..=3).map(|n| candidate(n).candidate).collect();
        assert_eq!(*engine.applied.lock(), expected);

        // second flush is a no-op
        assert_eq!(buffer.flush(&engine).await, FlushReport::default());
        assert_eq!(engine.applied.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_candidate_retried_once_after_batch() {
        let engine = RecordingEngine::refusing(&candidate(1).candidate, 1);
        let mut buffer = IceCandidateBuffer::default();
        buffer.enqueue(candidate(1));
        buffer.enqueue(candidate(2));

        let report = buffer.flush(&engine).await;
        assert_eq!(report.applied, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(
            *engine.applied.lock(),
            vec![candidate(2).candidate, candidate(1).candidate]
        );
    }

    #[tokio::test]
    async fn test_candidate_dropped_after_second_failure() {
        let engine = RecordingEngine::refusing(&candidate(1).candidate, 5);
        let mut buffer = IceCandidateBuffer::default();
        buffer.enqueue(candidate(1));

        let report = buffer.flush(&engine).await;
        assert_eq!(
            report,
            FlushReport {
                applied: 0,
                retried: 1,
                dropped: 1
            }
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut buffer = IceCandidateBuffer::new(2);
        assert!(buffer.enqueue(candidate(1)).is_none());
        assert!(buffer.enqueue(candidate(2)).is_none());
        assert_eq!(buffer.enqueue(candidate(3)), Some(candidate(1)));
        assert_eq!(buffer.evicted(), 1);
        let held: Vec<_> = buffer.candidates().cloned().collect();
        assert_eq!(held, vec![candidate(2), candidate(3)]);
    }

    #[test]
    fn test_adopt_appends_in_order() {
        let mut early = IceCandidateBuffer::default();
        early.enqueue(candidate(1));
        let mut buffer = IceCandidateBuffer::default();
        buffer.enqueue(candidate(0));
        buffer.adopt(early);
        let held: Vec<_> = buffer.candidates().cloned().collect();
        assert_eq!(held, vec![candidate(0), candidate(1)]);
    }

    proptest! {
        #[test]
        fn prop_flush_preserves_fifo_tail(count in 0usize..40, capacity in 1usize..16) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let engine = RecordingEngine::default();
            let mut buffer = IceCandidateBuffer::new(capacity);
            for n in 0..count {
                buffer.enqueue(candidate(n));
            }
            let report = runtime.block_on(buffer.flush(&engine));

            let kept = count.min(capacity);
            let expected: Vec<String> = (count - kept..count).map(|n| candidate(n).candidate).collect();
            prop_assert_eq!(report.applied, kept);
            prop_assert_eq!(&*engine.applied.lock(), &expected);
            prop_assert_eq!(buffer.evicted(), count - kept);
        }
    }
}
