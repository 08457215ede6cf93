//! Two-participant harness over the loopback bus

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use callwire_core::{
    CallConfig, CallEvent, CallService, CallSessionController, DeviceMediaSource,
    InMemoryChannelRegistry, LoopbackHub, LoopbackTransport, ParticipantId, SignalingHandler,
    SimulatedEngineFactory,
};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct Participant {
    pub id: ParticipantId,
    pub service: CallService<LoopbackTransport>,
    pub transport: Arc<LoopbackTransport>,
    pub engines: SimulatedEngineFactory,
    pub media: Arc<DeviceMediaSource>,
    pub events: broadcast::Receiver<CallEvent>,
}

impl Participant {
    pub fn controller(&self) -> &CallSessionController<LoopbackTransport> {
        self.service.controller()
    }

    /// Handle everything currently in our inbox
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        while let Ok(Some((from, message))) = self.transport.try_receive() {
            let _ = self.service.dispatch(from, message).await;
            handled += 1;
        }
        handled
    }

    /// Events received so far
    pub fn take_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub struct Builder {
    hub: LoopbackHub,
    registry: InMemoryChannelRegistry,
    config: CallConfig,
    manual: bool,
    media: Option<DeviceMediaSource>,
    engines: Option<SimulatedEngineFactory>,
}

impl Builder {
    pub fn new(hub: &LoopbackHub, registry: &InMemoryChannelRegistry) -> Self {
        Self {
            hub: hub.clone(),
            registry: registry.clone(),
            config: CallConfig::default(),
            manual: false,
            media: None,
            engines: None,
        }
    }

    pub fn config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Engines only connect through `SimProbe::set_connectivity`
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn media(mut self, media: DeviceMediaSource) -> Self {
        self.media = Some(media);
        self
    }

    pub fn engines(mut self, engines: SimulatedEngineFactory) -> Self {
        self.engines = Some(engines);
        self
    }

    pub fn build(self, id: &str) -> Participant {
        let transport = Arc::new(self.hub.register(id));
        let engines = if let Some(engines) = self.engines {
            engines
        } else if self.manual {
            SimulatedEngineFactory::manual()
        } else {
            SimulatedEngineFactory::new()
        };
        let media = Arc::new(self.media.unwrap_or_default());
        let service = CallService::builder(
            ParticipantId::from(id),
            Arc::new(SignalingHandler::new(transport.clone())),
        )
        .with_config(self.config)
        .with_registry(Arc::new(self.registry))
        .with_media(media.clone())
        .with_engines(Arc::new(engines.clone()))
        .build()
        .unwrap();
        let events = service.controller().subscribe();
        Participant {
            id: ParticipantId::from(id),
            service,
            transport,
            engines,
            media,
            events,
        }
    }
}

/// Two default participants sharing a hub and a registry
pub fn pair() -> (LoopbackHub, InMemoryChannelRegistry, Participant, Participant) {
    let hub = LoopbackHub::new();
    let registry = InMemoryChannelRegistry::new();
    let alice = Builder::new(&hub, &registry).build("alice");
    let bob = Builder::new(&hub, &registry).build("bob");
    (hub, registry, alice, bob)
}

/// Deliver messages and run engine event pumps until nothing moves
pub async fn settle(participants: &[&Participant]) {
    let mut quiet_rounds = 0;
    for _ in 0..200 {
        let mut moved = 0;
        for p in participants {
            moved += p.drain().await;
        }
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        if moved == 0 {
            quiet_rounds += 1;
            if quiet_rounds >= 3 {
                return;
            }
        } else {
            quiet_rounds = 0;
        }
    }
}

/// Transitions seen in an event list, in order
pub fn transitions(events: &[CallEvent]) -> Vec<(callwire_core::CallState, callwire_core::CallState)> {
    events
        .iter()
        .filter_map(|e| match e {
            CallEvent::StateChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}
