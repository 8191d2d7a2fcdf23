//! Murmur terminal client

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use murmur_core::config::IceServer;
use murmur_core::prelude::*;
use murmur_core::testing::MockTransportFactory;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use terminal_ui::{ExitPolicy, TerminalUI};
use tracing_subscriber::EnvFilter;

mod terminal_ui;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Signaling server base URL
    #[arg(
        long,
        env = "MURMUR_SIGNALING_URL",
        default_value = "http://localhost:3001"
    )]
    server: String,

    /// Comma-separated STUN/TURN URLs, replacing the defaults
    #[arg(long, env = "MURMUR_ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,

    /// Cancel unanswered calls after this many seconds (0 waits forever)
    #[arg(long, env = "MURMUR_RING_TIMEOUT_SECS")]
    ring_timeout: Option<u64>,

    /// JSON file with call settings
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call the partner the server paired you with
    Call {
        /// Partner socket id. The server routes calls to your paired partner
        /// whatever this says, and the partner's id from `call:accepted`
        /// replaces it, so the default is fine unless you know the id.
        #[arg(default_value = "partner")]
        peer: String,

        /// Audio only
        #[arg(long)]
        voice: bool,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept incoming calls without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// List capture devices
    Devices,

    /// Run two peers in-process and place a call between them
    Demo {
        /// Audio only
        #[arg(long)]
        voice: bool,

        /// How long to stay connected
        #[arg(long, default_value = "5")]
        seconds: u64,

        /// Use scripted transports instead of WebRTC
        #[arg(long)]
        mock: bool,
    },

    /// Show settings and check the signaling server
    Status,
}

fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log lines would tear the full-screen views
    let interactive = matches!(cli.command, Commands::Call { .. } | Commands::Listen { .. });
    init_tracing(if interactive {
        "murmur_core=warn,murmur=warn"
    } else {
        "murmur_core=info,murmur=info"
    });

    let call_config = call_config(&cli)?;
    let signaling_config = SignalingConfig {
        server_url: cli.server.clone(),
        ..SignalingConfig::default()
    };

    match cli.command {
        Commands::Call { peer, voice } => {
            handle_call(call_config, signaling_config, &peer, call_type(voice)).await?;
        }
        Commands::Listen { auto_accept } => {
            handle_listen(call_config, signaling_config, auto_accept).await?;
        }
        Commands::Devices => {
            handle_devices().await?;
        }
        Commands::Demo {
            voice,
            seconds,
            mock,
        } => {
            handle_demo(call_config, call_type(voice), seconds, mock).await?;
        }
        Commands::Status => {
            handle_status(&call_config, signaling_config).await?;
        }
    }

    Ok(())
}

fn call_type(voice: bool) -> CallType {
    if voice {
        CallType::Voice
    } else {
        CallType::Video
    }
}

/// Settings file first, then flags and environment on top
fn call_config(cli: &Cli) -> Result<CallConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => CallConfig::default(),
    };
    if !cli.ice_servers.is_empty() {
        config.ice_servers = cli.ice_servers.iter().map(IceServer::new).collect();
    }
    if let Some(secs) = cli.ring_timeout {
        config.ring_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    Ok(config)
}

async fn connect(
    call_config: CallConfig,
    signaling_config: SignalingConfig,
) -> Result<(Arc<CallService>, Arc<SocketIoChannel>)> {
    let server = signaling_config.server_url.clone();
    let channel = Arc::new(
        SocketIoChannel::connect(signaling_config)
            .await
            .with_context(|| format!("connecting to {server}"))?,
    );
    let service = Arc::new(
        CallService::builder()
            .with_config(call_config)
            .with_channel(channel.clone())
            .build()?,
    );
    let runner = Arc::clone(&service);
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            tracing::error!(error = %e, "Call service stopped");
        }
    });
    Ok((service, channel))
}

async fn handle_call(
    call_config: CallConfig,
    signaling_config: SignalingConfig,
    peer: &str,
    call_type: CallType,
) -> Result<()> {
    let peer = PeerId::new(peer)?;
    println!("📞 Calling {peer} ({call_type})...");

    let (service, channel) = connect(call_config, signaling_config).await?;
    service.manager().initiate_call(call_type, peer).await?;

    let mut ui = TerminalUI::new()?;
    ui.run(service.manager(), false, ExitPolicy::AfterCall).await?;
    drop(ui);

    service.shutdown();
    channel.close().await;
    println!("📞 Call ended");
    Ok(())
}

async fn handle_listen(
    call_config: CallConfig,
    signaling_config: SignalingConfig,
    auto_accept: bool,
) -> Result<()> {
    let (service, channel) = connect(call_config, signaling_config).await?;
    if let Some(id) = channel.local_id() {
        println!("👂 Listening as {id}");
    }

    let mut ui = TerminalUI::new()?;
    ui.run(service.manager(), auto_accept, ExitPolicy::OnQuit).await?;
    drop(ui);

    service.shutdown();
    channel.close().await;
    Ok(())
}

async fn handle_devices() -> Result<()> {
    let devices = VirtualMediaDevices::with_default_devices()
        .enumerate_devices()
        .await?;
    println!("{:<12} {:<12} {:<10} LABEL", "KIND", "ID", "FACING");
    for device in devices {
        let facing = device
            .facing
            .map_or_else(|| "-".to_string(), |f| format!("{f:?}"));
        println!(
            "{:<12} {:<12} {:<10} {}",
            format!("{:?}", device.kind),
            device.device_id,
            facing,
            device.label
        );
    }
    Ok(())
}

fn demo_transports(mock: bool) -> Result<Arc<dyn PeerTransportFactory>> {
    if mock {
        return Ok(Arc::new(MockTransportFactory::new()));
    }
    Ok(Arc::new(WebRtcTransportFactory::new()?))
}

async fn wait_for(manager: &CallSessionManager, state: CallState, limit: Duration) -> Result<()> {
    let mut rx = manager.subscribe();
    tokio::time::timeout(limit, async {
        while rx.borrow_and_update().state != state {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {state:?}"))
}

async fn handle_demo(
    call_config: CallConfig,
    call_type: CallType,
    seconds: u64,
    mock: bool,
) -> Result<()> {
    let relay = MemoryRelay::new();
    let mut peers = Vec::new();
    for _ in 0..2 {
        let channel = relay.join();
        let service = Arc::new(
            CallService::builder()
                .with_config(call_config.clone())
                .with_transports(demo_transports(mock)?)
                .with_channel(channel.clone())
                .build()?,
        );
        let runner = Arc::clone(&service);
        tokio::spawn(async move { runner.run().await });
        peers.push((channel.id().clone(), service));
    }
    let (alice_id, alice) = &peers[0];
    let (bob_id, bob) = &peers[1];
    relay.pair(alice_id, bob_id);

    for (id, service) in &peers {
        let id = id.clone();
        let mut events = service.manager().subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let Some(notice) = terminal_ui::notice_for(&event) {
                    println!("   [{id}] {notice}");
                }
            }
        });
    }

    let negotiation = Duration::from_secs(15);
    println!("📞 {alice_id} calls {bob_id} ({call_type})");
    alice
        .manager()
        .initiate_call(call_type, bob_id.clone())
        .await?;
    wait_for(bob.manager(), CallState::Ringing, negotiation).await?;
    bob.manager().accept_call().await?;
    wait_for(alice.manager(), CallState::Connected, negotiation).await?;
    wait_for(bob.manager(), CallState::Connected, negotiation).await?;
    println!("✅ Connected");

    tokio::time::sleep(Duration::from_secs(seconds / 2)).await;
    alice.manager().set_audio_muted(true)?;
    println!("🔇 {alice_id} muted");
    if call_type.has_video() {
        let device = alice.manager().switch_camera(None).await?;
        println!("📷 {alice_id} switched to {device}");
    }
    tokio::time::sleep(Duration::from_secs(seconds - seconds / 2)).await;

    let snapshot = alice.manager().snapshot();
    if let Some(duration) = snapshot.duration() {
        println!(
            "⏱  Call lasted {}",
            murmur_core::types::format_duration(duration)
        );
    }
    alice.manager().end_call().await;
    wait_for(bob.manager(), CallState::Idle, negotiation).await?;
    println!("📞 Call ended on both sides");

    for (_, service) in &peers {
        service.shutdown();
    }
    Ok(())
}

async fn handle_status(call_config: &CallConfig, signaling_config: SignalingConfig) -> Result<()> {
    println!("📊 Murmur {}", env!("CARGO_PKG_VERSION"));
    println!("==========================");
    println!("Signaling server: {}", signaling_config.server_url);
    println!("Call settings:");
    println!("{}", serde_json::to_string_pretty(call_config)?);
    println!();

    let check = SignalingConfig {
        reconnection: false,
        timeout: Duration::from_secs(5),
        ..signaling_config
    };
    match SocketIoChannel::connect(check).await {
        Ok(channel) => {
            let id = channel
                .local_id()
                .map_or_else(|| "?".to_string(), |id| id.to_string());
            println!("✅ Signaling: reachable (socket id {id})");
            channel.close().await;
        }
        Err(e) => println!("⚠️  Signaling: {e}"),
    }

    println!();
    println!("Available commands:");
    println!("  murmur call [peer] [--voice]         - Call your paired partner");
    println!("  murmur listen [--auto-accept]        - Wait for calls");
    println!("  murmur devices                       - List capture devices");
    println!("  murmur demo [--voice] [--seconds N]  - Local two-peer call");
    println!("  murmur status                        - Show this status");
    Ok(())
}
