//! Call channel registry
//!
//! A call channel is the shared record both participants agree on for the
//! lifetime of a call. It is owned by the host application's backend; the
//! controller only talks to it through [`CallChannelRegistry`].

use crate::identity::ParticipantId;
use crate::types::CallId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Channel does not exist (never created, or already deleted)
    #[error("Call channel not found: {0}")]
    NotFound(CallId),

    /// Backend could not be reached
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

/// Kind of call a channel hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Audio only
    Voice,
    /// Audio and video
    Video,
}

impl ChannelType {
    /// Channel type for a call's video flag
    pub fn for_call(is_video: bool) -> Self {
        if is_video {
            Self::Video
        } else {
            Self::Voice
        }
    }
}

/// Shared call channel record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallChannel {
    /// Channel id; equal to the call id
    pub id: CallId,
    /// Display name
    pub name: String,
    /// Voice or video
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    /// Current members
    pub participants: BTreeSet<ParticipantId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Set once the call is over
    pub ended_at: Option<DateTime<Utc>>,
}

/// Store of call channels
///
/// Every operation is idempotent for a repeated (channel, participant) pair.
/// `leave` and `remove` on a channel that is already gone succeed.
#[async_trait]
pub trait CallChannelRegistry: Send + Sync {
    /// Create a channel with the given members
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unavailable` if the backend fails
    async fn create(
        &self,
        channel_type: ChannelType,
        participants: &[ParticipantId],
    ) -> Result<CallChannel, RegistryError>;

    /// Bind a participant to a channel someone else created
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` if the channel is gone
    async fn attach(
        &self,
        channel_id: CallId,
        participant: &ParticipantId,
    ) -> Result<CallChannel, RegistryError>;

    /// Add a participant to a channel's members
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` if the channel is gone
    async fn join(
        &self,
        channel_id: CallId,
        participant: &ParticipantId,
    ) -> Result<CallChannel, RegistryError>;

    /// Remove a participant; the channel is deleted once empty
    ///
    /// Returns the channel as it stands afterwards, `None` if it no longer exists.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unavailable` if the backend fails
    async fn leave(
        &self,
        channel_id: CallId,
        participant: &ParticipantId,
    ) -> Result<Option<CallChannel>, RegistryError>;

    /// Delete a channel
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unavailable` if the backend fails
    async fn remove(&self, channel_id: CallId) -> Result<(), RegistryError>;

    /// Look a channel up
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unavailable` if the backend fails
    async fn get(&self, channel_id: CallId) -> Result<Option<CallChannel>, RegistryError>;
}

/// Registry kept in process memory
#[derive(Clone, Default)]
pub struct InMemoryChannelRegistry {
    channels: Arc<Mutex<HashMap<CallId, CallChannel>>>,
}

impl InMemoryChannelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live channels
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// Whether no channel exists
    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Synchronous lookup for tests and diagnostics
    pub fn snapshot(&self, channel_id: CallId) -> Option<CallChannel> {
        self.channels.lock().get(&channel_id).cloned()
    }

    fn add_member(
        &self,
        channel_id: CallId,
        participant: &ParticipantId,
    ) -> Result<CallChannel, RegistryError> {
        let mut channels = self.channels.lock();
        let channel = channels
            .get_mut(&channel_id)
            .ok_or(RegistryError::NotFound(channel_id))?;
        channel.participants.insert(participant.clone());
        Ok(channel.clone())
    }
}

#[async_trait]
impl CallChannelRegistry for InMemoryChannelRegistry {
    async fn create(
        &self,
        channel_type: ChannelType,
        participants: &[ParticipantId],
    ) -> Result<CallChannel, RegistryError> {
        let id = CallId::new();
        let channel = CallChannel {
            id,
            name: format!("call-{}", &id.to_string()[..8]),
            channel_type,
            participants: participants.iter().cloned().collect(),
            created_at: Utc::now(),
            ended_at: None,
        };
        self.channels.lock().insert(id, channel.clone());
        tracing::debug!(channel_id = %id, channel_type = ?channel_type, "Call channel created");
        Ok(channel)
    }

    async fn attach(
        &self,
        channel_id: CallId,
        participant: &ParticipantId,
    ) -> Result<CallChannel, RegistryError> {
        self.add_member(channel_id, participant)
    }

    async fn join(
        &self,
        channel_id: CallId,
        participant: &ParticipantId,
    ) -> Result<CallChannel, RegistryError> {
        self.add_member(channel_id, participant)
    }

    async fn leave(
        &self,
        channel_id: CallId,
        participant: &ParticipantId,
    ) -> Result<Option<CallChannel>, RegistryError> {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(&channel_id) else {
            return Ok(None);
        };
        channel.participants.remove(participant);
        if channel.participants.is_empty() {
            channels.remove(&channel_id);
            tracing::debug!(channel_id = %channel_id, "Last participant left, channel deleted");
            return Ok(None);
        }
        Ok(Some(channel.clone()))
    }

    async fn remove(&self, channel_id: CallId) -> Result<(), RegistryError> {
        if self.channels.lock().remove(&channel_id).is_some() {
            tracing::debug!(channel_id = %channel_id, "Call channel removed");
        }
        Ok(())
    }

    async fn get(&self, channel_id: CallId) -> Result<Option<CallChannel>, RegistryError> {
        Ok(self.snapshot(channel_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_lifecycle() {
        let registry = InMemoryChannelRegistry::new();
        let alice = ParticipantId::from("alice");
        let bob = ParticipantId::from("bob");

        let channel = registry
            .create(ChannelType::Video, &[alice.clone()])
            .await
            .unwrap();
        assert_eq!(channel.participants.len(), 1);

        let attached = registry.attach(channel.id, &bob).await.unwrap();
        assert!(attached.participants.contains(&bob));
        // idempotent
        let again = registry.join(channel.id, &bob).await.unwrap();
        assert_eq!(again.participants.len(), 2);

        let after = registry.leave(channel.id, &alice).await.unwrap();
        assert!(after.is_some());
        assert!(registry.leave(channel.id, &bob).await.unwrap().is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_missing_channel() {
        let registry = InMemoryChannelRegistry::new();
        let id = CallId::new();
        let bob = ParticipantId::from("bob");

        assert_eq!(
            registry.attach(id, &bob).await.unwrap_err(),
            RegistryError::NotFound(id)
        );
        assert!(registry.leave(id, &bob).await.unwrap().is_none());
        assert!(registry.remove(id).await.is_ok());
        assert!(registry.get(id).await.unwrap().is_none());
    }

    #[test]
    fn test_channel_wire_shape() {
        let json = serde_json::to_value(ChannelType::Voice).unwrap();
        assert_eq!(json, "voice");
    }
}
