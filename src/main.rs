use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use url::Url;

use babelcall::{
    CaptureEngine, CaptureSource, ClientConfig, ConversationEvent, ConversationOrchestrator,
    HostBridge, HttpBridge, Playback, SessionRegistry, TransportChannel, WsConnector,
};

/// Babelcall - real-time bilingual call translation client
#[derive(Parser)]
#[command(name = "babelcall", version, about)]
struct Cli {
    /// Backend REST base URL
    #[arg(long, env = "BABELCALL_HTTP_URL")]
    http_url: Option<String>,

    /// Backend WebSocket base URL
    #[arg(long, env = "BABELCALL_WS_URL")]
    ws_url: Option<String>,

    /// Language the local participant speaks
    #[arg(short, long, env = "BABELCALL_SOURCE_LANG")]
    source: Option<String>,

    /// Language the remote participant speaks
    #[arg(short, long, env = "BABELCALL_TARGET_LANG")]
    target: Option<String>,

    /// Run without the backend REST bridge (sessions are synthesized
    /// locally)
    #[arg(long)]
    no_host: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a session and start a call
    Create {
        /// Session name
        #[arg(short, long, default_value = "")]
        name: String,
    },
    /// Join an existing session by id
    Join {
        /// Session id
        id: String,
    },
    /// List joinable sessions
    Sessions,
    /// List audio input devices
    Devices,
    /// Meter the microphone
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Play a test tone
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,babelcall=info",
        1 => "info,babelcall=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ClientConfig::from_env()?;
    if let Some(raw) = &cli.http_url {
        config.http_url = Url::parse(raw)?;
    }
    if let Some(raw) = &cli.ws_url {
        config.ws_url = Url::parse(raw)?;
    }
    if let Some(source) = cli.source {
        config.source_language = source;
    }
    if let Some(target) = cli.target {
        config.target_language = target;
    }

    match cli.command {
        Command::Create { name } => run_call(config, cli.no_host, CallTarget::Create(name)).await,
        Command::Join { id } => run_call(config, cli.no_host, CallTarget::Join(id)).await,
        Command::Sessions => list_sessions(&config).await,
        Command::Devices => list_devices(&config),
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker(),
    }
}

enum CallTarget {
    Create(String),
    Join(String),
}

async fn run_call(config: ClientConfig, no_host: bool, target: CallTarget) -> anyhow::Result<()> {
    let transport = TransportChannel::new(config.transport(), Arc::new(WsConnector));
    let bridge: Option<Arc<dyn HostBridge>> = if no_host {
        None
    } else {
        Some(Arc::new(HttpBridge::new(config.http_url.clone())))
    };
    let registry = SessionRegistry::new(transport.clone(), bridge);

    let mut capture = CaptureEngine::new();
    capture.set_gain(config.gain);
    let playback = Playback::new()?;

    let conversation = ConversationOrchestrator::new(
        registry.clone(),
        transport,
        Box::new(capture),
        Box::new(playback),
        config.source_language.clone(),
        config.target_language.clone(),
    );

    let session = match target {
        CallTarget::Create(name) => registry.create_session(&name).await?,
        CallTarget::Join(id) => registry.join_session(&id).await?,
    };
    println!("session {} ({})", session.id, session.name);
    println!(
        "{} -> {}, listening; commands: role | export <path> | quit",
        config.source_language, config.target_language
    );

    let mut events = conversation.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConversationEvent::TranscriptReceived(item) => {
                    let who = if item.is_self { "you" } else { "them" };
                    println!("[{who}] {}", item.text);
                }
                ConversationEvent::TranslationReceived(item) => {
                    if let Some(translation) = &item.translation {
                        println!("      = {translation}");
                    }
                }
                ConversationEvent::RoleChanged(role) => println!("role: {role:?}"),
                _ => {}
            }
        }
    });

    conversation.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line == "quit" {
                    break;
                } else if line == "role" {
                    if let Err(e) = conversation.toggle_role().await {
                        eprintln!("role change failed: {e}");
                    }
                } else if let Some(path) = line.strip_prefix("export ") {
                    match conversation.export_transcript(Path::new(path.trim())).await {
                        Ok(written) => println!("exported to {}", written.display()),
                        Err(e) => eprintln!("export failed: {e}"),
                    }
                } else if !line.is_empty() {
                    println!("commands: role | export <path> | quit");
                }
            }
        }
    }

    conversation.dispose();
    registry.leave_session().await;
    Ok(())
}

async fn list_sessions(config: &ClientConfig) -> anyhow::Result<()> {
    let bridge = HttpBridge::new(config.http_url.clone());
    let sessions = bridge.list_sessions().await?;
    if sessions.is_empty() {
        println!("no joinable sessions");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {}  {}/{}",
            session.session_id, session.name, session.participant_count, session.max_participants
        );
    }
    Ok(())
}

fn list_devices(config: &ClientConfig) -> anyhow::Result<()> {
    let bridge = HttpBridge::new(config.http_url.clone());
    for name in bridge.audio_devices()? {
        println!("{name}");
    }
    Ok(())
}

async fn test_mic(duration: u64) -> anyhow::Result<()> {
    let mut engine = CaptureEngine::new();
    engine.initialize()?;
    let mut levels = engine.levels();
    engine.start_recording()?;
    println!("metering microphone for {duration}s...");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => break,
            level = levels.recv() => {
                if let Ok(level) = level {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let bar = "#".repeat((level.instant * 40.0) as usize);
                    let clip = if level.clip { " CLIP" } else { "" };
                    println!("{:5.2} {:5.2} {bar}{clip}", level.instant, level.slow);
                }
            }
        }
    }

    engine.dispose();
    Ok(())
}

fn test_speaker() -> anyhow::Result<()> {
    let playback = Playback::new()?;

    // One second of A440 at the playback rate
    let samples: Vec<f32> = (0..24_000)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f32 / 24_000.0;
            0.4 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
        })
        .collect();

    println!("playing test tone...");
    playback.play_samples(samples)?;
    drop(playback);
    Ok(())
}
