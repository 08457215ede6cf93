//! Call service orchestration
//!
//! Wires a [`CallSessionController`] to a signaling transport: inbound
//! messages are routed to the matching controller handler, malformed ones are
//! dropped with a warning.

use crate::call::{CallError, CallSessionController, InviteDisposition};
use crate::config::CallConfig;
use crate::engine::EngineFactory;
use crate::identity::ParticipantId;
use crate::media::{DeviceMediaSource, MediaSource};
use crate::registry::{CallChannelRegistry, InMemoryChannelRegistry};
use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Controller plus the signaling handler that feeds it
pub struct CallService<T: SignalingTransport> {
    controller: CallSessionController<T>,
    signaling: Arc<SignalingHandler<T>>,
}

impl<T: SignalingTransport> CallService<T> {
    /// Create a builder
    #[must_use]
    pub fn builder(local: ParticipantId, signaling: Arc<SignalingHandler<T>>) -> CallServiceBuilder<T> {
        CallServiceBuilder::new(local, signaling)
    }

    /// The controller driven by this service
    pub fn controller(&self) -> &CallSessionController<T> {
        &self.controller
    }

    /// Route one inbound message to the controller
    ///
    /// # Errors
    ///
    /// Returns the controller's error for messages that do not fit the
    /// current session; callers usually just log these
    #[tracing::instrument(skip(self, message), fields(local = %self.controller.local_id(), kind = message.message_type()))]
    pub async fn dispatch(
        &self,
        from: ParticipantId,
        message: SignalingMessage,
    ) -> Result<(), CallError> {
        let c = &self.controller;
        match message {
            SignalingMessage::CallIncoming {
                offer,
                is_video,
                channel_id,
            } => {
                let disposition = c
                    .handle_incoming_invite(from.clone(), offer, channel_id, is_video)
                    .await;
                if disposition == InviteDisposition::Busy {
                    tracing::info!(peer = %from, "Busy, invite dropped");
                }
                Ok(())
            }
            SignalingMessage::CallAccepted => c.handle_remote_accepted(&from).await,
            SignalingMessage::CallRejected => c.handle_remote_rejected(&from).await,
            SignalingMessage::CallEnded => c.handle_remote_ended(&from).await,
            SignalingMessage::WebrtcOffer { offer } => c.handle_offer(&from, offer).await,
            SignalingMessage::WebrtcAnswer { answer } => c.handle_answer(&from, answer).await,
            SignalingMessage::WebrtcIceCandidate { candidate } => {
                let disposition = c.handle_ice_candidate(&from, candidate).await;
                tracing::trace!(disposition = ?disposition, "Remote candidate handled");
                Ok(())
            }
            SignalingMessage::CallChannelCreated {
                channel_id,
                channel_name,
                call_type,
                participants,
            } => {
                c.handle_channel_announced(&from, channel_id, channel_name, call_type, participants);
                Ok(())
            }
            SignalingMessage::CallChannelLeft {
                channel_id,
                user_id,
            } => {
                c.handle_channel_left(channel_id, user_id).await;
                Ok(())
            }
        }
    }

    /// Receive and dispatch messages until `shutdown` flips to `true`
    #[tracing::instrument(skip(self, shutdown), fields(local = %self.controller.local_id()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Call service started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.signaling.receive_message() => match received {
                    Ok((from, message)) => {
                        if let Err(e) = self.dispatch(from, message).await {
                            match e {
                                CallError::InvalidState { .. } => {
                                    tracing::debug!(error = %e, "Ignoring out-of-state message");
                                }
                                other => tracing::warn!(error = %other, "Message handling failed"),
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping undeliverable signaling message"),
                },
            }
        }
        tracing::info!("Call service stopped");
    }
}

/// Call service builder
pub struct CallServiceBuilder<T: SignalingTransport> {
    local: ParticipantId,
    signaling: Arc<SignalingHandler<T>>,
    config: CallConfig,
    registry: Option<Arc<dyn CallChannelRegistry>>,
    media: Option<Arc<dyn MediaSource>>,
    engines: Option<Arc<dyn EngineFactory>>,
}

impl<T: SignalingTransport> CallServiceBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(local: ParticipantId, signaling: Arc<SignalingHandler<T>>) -> Self {
        Self {
            local,
            signaling,
            config: CallConfig::default(),
            registry: None,
            media: None,
            engines: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a shared call channel registry
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn CallChannelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a specific media source
    #[must_use]
    pub fn with_media(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Use a specific negotiation engine factory
    #[must_use]
    pub fn with_engines(mut self, engines: Arc<dyn EngineFactory>) -> Self {
        self.engines = Some(engines);
        self
    }

    #[cfg(feature = "webrtc-engine")]
    fn default_engines(config: &CallConfig) -> Arc<dyn EngineFactory> {
        Arc::new(crate::rtc_engine::RtcEngineFactory::from_config(config))
    }

    #[cfg(not(feature = "webrtc-engine"))]
    fn default_engines(_config: &CallConfig) -> Arc<dyn EngineFactory> {
        Arc::new(crate::sim::SimulatedEngineFactory::new())
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Call` if the configuration is invalid
    pub fn build(self) -> Result<CallService<T>, ServiceError> {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(InMemoryChannelRegistry::new()));
        let media = self
            .media
            .unwrap_or_else(|| Arc::new(DeviceMediaSource::default()));
        let engines = self
            .engines
            .unwrap_or_else(|| Self::default_engines(&self.config));
        let controller = CallSessionController::new(
            self.local,
            self.config,
            self.signaling.clone(),
            registry,
            media,
            engines,
        )?;
        Ok(CallService {
            controller,
            signaling: self.signaling,
        })
    }
}
