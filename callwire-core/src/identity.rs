//! Participant identity
//!
//! Participants are addressed by an opaque user id issued by the host
//! application. The signaling bus routes on it and the glare tie-break orders
//! on it, so it is totally ordered and hashable.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Opaque user id of a call participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create a participant id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this participant keeps the caller role when both sides dial
    /// each other at the same time.
    ///
    /// The lexicographically smaller id wins.
    pub fn wins_glare_against(&self, other: &ParticipantId) -> bool {
        self < other
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
