//! Callwire CLI Application

use anyhow::{bail, Context, Result};
use callwire_core::prelude::*;
use callwire_core::{
    InMemoryChannelRegistry, LoopbackHub, LoopbackTransport, SignalingEnvelope,
    SimulatedEngineFactory,
};
use clap::{Args, Parser, Subcommand};
use rand::Rng;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local participant id (e.g., "alpha-comet-17")
    #[arg(short, long, env = "CALLWIRE_IDENTITY")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call between two in-process participants over the loopback bus
    Demo(DemoArgs),

    /// Parse a signaling envelope and pretty-print it
    Decode {
        /// JSON frame; read from stdin when omitted
        frame: Option<String>,
    },

    /// Show status and available commands
    Status,
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Participant to call
    #[arg(long, default_value = "bob")]
    peer: String,

    /// Request video
    #[arg(long)]
    video: bool,

    /// Callee declines instead of answering
    #[arg(long)]
    reject: bool,

    /// Hang up this long after the call becomes active
    #[arg(long, default_value_t = 500)]
    hang_up_after_ms: u64,

    /// Seconds a call may ring before it is abandoned
    #[arg(long, env = "CALLWIRE_RING_TIMEOUT", default_value_t = 45)]
    ring_timeout: u64,

    /// Grace period for a disconnected ICE link (0 disables)
    #[arg(long, env = "CALLWIRE_DISCONNECT_GRACE_MS", default_value_t = 5000)]
    disconnect_grace_ms: u64,

    /// Remote candidates held before a description arrives
    #[arg(long, env = "CALLWIRE_ICE_BUFFER", default_value_t = 64)]
    ice_buffer_capacity: usize,
}

impl DemoArgs {
    fn config(&self) -> CallConfig {
        CallConfig {
            ring_timeout_secs: self.ring_timeout,
            disconnect_grace_ms: self.disconnect_grace_ms,
            ice_buffer_capacity: self.ice_buffer_capacity,
            ..CallConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("callwire=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo(args) => {
            let identity = cli.identity.unwrap_or_else(generate_random_identity);
            handle_demo(&identity, args).await?;
        }
        Commands::Decode { frame } => {
            handle_decode(frame)?;
        }
        Commands::Status => {
            handle_status()?;
        }
    }

    Ok(())
}

struct DemoParticipant {
    name: String,
    service: Arc<CallService<LoopbackTransport>>,
}

fn start_participant(
    hub: &LoopbackHub,
    registry: &InMemoryChannelRegistry,
    name: &str,
    config: CallConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<DemoParticipant> {
    let transport = Arc::new(hub.register(name));
    let service = CallService::builder(
        ParticipantId::from(name),
        Arc::new(SignalingHandler::new(transport)),
    )
    .with_config(config)
    .with_registry(Arc::new(registry.clone()))
    .with_engines(Arc::new(SimulatedEngineFactory::new()))
    .build()?;
    let service = Arc::new(service);

    let runner = Arc::clone(&service);
    tokio::spawn(async move { runner.run(shutdown).await });

    Ok(DemoParticipant {
        name: name.to_string(),
        service,
    })
}

fn print_event(who: &str, event: &CallEvent) {
    match event {
        CallEvent::StateChanged { from, to, .. } => println!("  [{who}] {from} -> {to}"),
        CallEvent::IncomingCall { from, is_video, .. } => {
            println!("  [{who}] incoming {} call from {from}", kind(*is_video));
        }
        CallEvent::RemoteMedia { stream, .. } => {
            println!(
                "  [{who}] remote stream {} with {} track(s)",
                stream.stream_id,
                stream.tracks.len()
            );
        }
        CallEvent::CallEnded { reason, .. } => println!("  [{who}] call ended: {reason}"),
        CallEvent::Warning { error, .. } => println!("  [{who}] warning: {error}"),
        CallEvent::ChannelAnnounced { name, .. } => println!("  [{who}] channel {name} announced"),
        CallEvent::ParticipantLeft { participant, .. } => {
            println!("  [{who}] {participant} left the channel");
        }
    }
}

fn kind(is_video: bool) -> &'static str {
    if is_video {
        "video"
    } else {
        "voice"
    }
}

/// Wait until the participant's call reaches one of `targets`
async fn wait_for_state(
    events: &mut broadcast::Receiver<CallEvent>,
    who: &str,
    targets: &[CallState],
    limit: Duration,
) -> Result<CallState> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    print_event(who, &event);
                    if let CallEvent::StateChanged { to, .. } = event {
                        if targets.contains(&to) {
                            return Ok(to);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(limit, wait)
        .await
        .with_context(|| format!("{who} did not reach {targets:?} within {limit:?}"))?
}

async fn handle_demo(identity: &str, args: DemoArgs) -> Result<()> {
    let config = args.config();
    config.validate()?;
    if args.peer == identity {
        bail!("peer must differ from the local identity");
    }

    println!("📞 {identity} calling {} ({})", args.peer, kind(args.video));

    let hub = LoopbackHub::new();
    let registry = InMemoryChannelRegistry::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let caller = start_participant(&hub, &registry, identity, config.clone(), shutdown_rx.clone())?;
    let callee = start_participant(&hub, &registry, &args.peer, config.clone(), shutdown_rx)?;

    let mut caller_events = caller.service.controller().subscribe();
    let mut callee_events = callee.service.controller().subscribe();

    // The callee answers (or declines) as soon as it rings
    let answering = {
        let callee_controller = callee.service.controller().clone();
        let name = callee.name.clone();
        let reject = args.reject;
        tokio::spawn(async move {
            let ringing = wait_for_state(
                &mut callee_events,
                &name,
                &[CallState::Ringing],
                Duration::from_secs(10),
            )
            .await?;
            tracing::debug!(state = ?ringing, "Callee ringing");
            if reject {
                callee_controller.reject().await?;
            } else {
                callee_controller.accept().await?;
            }
            wait_for_state(
                &mut callee_events,
                &name,
                &[CallState::Ended],
                Duration::from_secs(60),
            )
            .await
        })
    };

    let started = tokio::time::Instant::now();
    caller
        .service
        .controller()
        .initiate(ParticipantId::from(args.peer.as_str()), args.video)
        .await?;

    let ring_limit = config.ring_timeout() + Duration::from_secs(5);
    let outcome = wait_for_state(
        &mut caller_events,
        &caller.name,
        &[CallState::Active, CallState::Ended],
        ring_limit,
    )
    .await?;

    if outcome == CallState::Active {
        println!("✅ Call active after {:?}", started.elapsed());
        tokio::time::sleep(Duration::from_millis(args.hang_up_after_ms)).await;
        caller.service.controller().hang_up().await?;
        wait_for_state(
            &mut caller_events,
            &caller.name,
            &[CallState::Ended],
            Duration::from_secs(5),
        )
        .await?;
    }

    let callee_final = answering.await??;
    tracing::debug!(state = ?callee_final, "Callee finished");
    let _ = shutdown_tx.send(true);

    let session = caller.service.controller().session();
    let reason = session
        .as_ref()
        .and_then(|s| s.end_reason)
        .map_or_else(|| "unknown".to_string(), |r| r.to_string());
    println!();
    println!("📊 Summary");
    println!("   Outcome: {reason}");
    if let Some(duration) = session.as_ref().and_then(|s| s.duration()) {
        println!("   Talk time: {} ms", duration.num_milliseconds());
    }
    let delivered = hub.delivered();
    println!("   Signaling messages: {}", delivered.len());
    for message_type in [
        "call_channel_created",
        "call_incoming",
        "webrtc_answer",
        "webrtc_ice_candidate",
        "call_accepted",
        "call_rejected",
        "call_ended",
    ] {
        let count = delivered
            .iter()
            .filter(|e| e.message.message_type() == message_type)
            .count();
        if count > 0 {
            println!("     {message_type}: {count}");
        }
    }
    println!("   Channels left open: {}", registry.len());

    Ok(())
}

fn handle_decode(frame: Option<String>) -> Result<()> {
    let frame = match frame {
        Some(frame) => frame,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading frame from stdin")?;
            buf
        }
    };

    let envelope = SignalingEnvelope::from_json(frame.trim())?;
    println!("type: {}", envelope.message.message_type());
    println!("to:   {}", envelope.to);
    if let Some(from) = &envelope.from {
        println!("from: {from}");
    }
    println!(
        "kind: {}",
        if envelope.message.is_negotiation() {
            "negotiation"
        } else {
            "call control"
        }
    );
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn handle_status() -> Result<()> {
    println!("📊 Callwire CLI Status");
    println!("======================");
    println!("✅ Call controller: Ready");
    println!("✅ Loopback signaling: Available");
    println!("✅ Simulated engine: Available");
    println!();
    println!("Default configuration:");
    println!("{}", serde_json::to_string_pretty(&CallConfig::default())?);
    println!();
    println!("Available commands:");
    println!("  callwire demo [options]   - Place an in-process call");
    println!("  callwire decode [frame]   - Inspect a signaling message");
    println!("  callwire status           - Show this status");
    println!();
    println!("Use 'callwire --help' for detailed options");

    Ok(())
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "atlas", "beacon", "comet", "dragon", "eagle", "falcon",
        "galaxy", "harbor", "lunar", "meteor", "nebula", "orbit", "phoenix", "quasar",
    ];

    let mut rng = rand::thread_rng();
    let first = WORDS[rng.gen_range(0..WORDS.len())];
    let second = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{first}-{second}-{}", rng.gen_range(10..100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_flags_and_env_defaults() {
        let cli = Cli::try_parse_from(["callwire", "demo", "--video", "--ring-timeout", "5"])
            .unwrap_or_else(|e| unreachable!("{e}"));
        let Commands::Demo(args) = cli.command else {
            unreachable!("expected demo");
        };
        assert!(args.video);
        assert!(!args.reject);
        assert_eq!(args.peer, "bob");
        let config = args.config();
        assert_eq!(config.ring_timeout_secs, 5);
        assert_eq!(config.ice_buffer_capacity, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_random_identity_shape() {
        let id = generate_random_identity();
        assert_eq!(id.split('-').count(), 3);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(handle_decode(Some("{not json".to_string())).is_err());
        assert!(handle_decode(Some(r#"{"to":"bob","type":"call_ended"}"#.to_string())).is_ok());
    }
}
