//! meshcall command-line client and signaling relay

use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use meshcall_core::prelude::*;
use meshcall_core::{
    FileSessionStore, LoopbackMediaTransport, MediaEvent, SessionStore, SignalingRelay,
    WebRtcMediaTransport,
};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// User id to sign in as (random if omitted)
    #[arg(short, long, env = "MESHCALL_IDENTITY")]
    identity: Option<String>,

    /// JSON configuration file
    #[arg(short, long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling relay URL (overrides the configuration file)
    #[arg(long, env = "MESHCALL_URL")]
    url: Option<String>,

    /// Peer link implementation
    #[arg(long, value_enum, default_value = "native")]
    media: MediaBackend,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MediaBackend {
    /// ICE/DTLS/SRTP peer connections
    Native,
    /// In-process links without media, for trying out signaling
    Loopback,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a signaling relay
    Relay {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9000")]
        listen: String,
    },

    /// Call the members of a chat
    Call {
        /// Chat to call in
        chat: String,

        /// Chat members, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        members: Vec<String>,

        /// Ring only this member
        #[arg(long)]
        target: Option<String>,

        /// Video call
        #[arg(long)]
        video: bool,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept incoming calls without asking
        #[arg(long)]
        auto_accept: bool,

        /// Rejoin calls that were in progress when the client last stopped
        #[arg(long)]
        rejoin: bool,
    },

    /// Show configuration and calls that can be rejoined
    Status,
}

struct Context {
    identity: String,
    config: ClientConfig,
    media: MediaBackend,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meshcall=info,meshcall_core=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Relay { listen } = &cli.command {
        return handle_relay(listen).await;
    }

    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_file(path).await?,
        None => ClientConfig::default(),
    };
    if cli.url.is_some() {
        config.signaling_url = cli.url.clone();
    }
    if config.session_store_path.is_none() {
        config.session_store_path = default_store_path();
    }
    config.validate()?;

    let identity = cli.identity.unwrap_or_else(generate_random_identity);
    println!("🔗 Using identity: {}", identity);

    let ctx = Context {
        identity,
        config,
        media: cli.media,
    };

    match cli.command {
        Commands::Call {
            chat,
            members,
            target,
            video,
        } => handle_call(&ctx, chat, members, target, video).await,
        Commands::Listen {
            auto_accept,
            rejoin,
        } => handle_listen(&ctx, auto_accept, rejoin).await,
        Commands::Status => handle_status(&ctx).await,
        Commands::Relay { .. } => Ok(()),
    }
}

async fn handle_relay(listen: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("cannot listen on {}", listen))?;
    println!("📡 Relay listening on ws://{}", listener.local_addr()?);
    SignalingRelay::new().serve(listener).await?;
    Ok(())
}

async fn build_client(ctx: &Context, backend: LocalCallBackend) -> Result<CallClient> {
    let url = ctx
        .config
        .signaling_url
        .clone()
        .ok_or_else(|| anyhow!("no signaling URL; pass --url or set signaling_url"))?;
    let transport =
        WebSocketSignalingTransport::connect(&url, UserId::new(ctx.identity.as_str())).await?;

    let media: Arc<dyn MediaTransport> = match ctx.media {
        MediaBackend::Native => Arc::new(WebRtcMediaTransport::new(&ctx.config.ice_servers)?),
        MediaBackend::Loopback => {
            Arc::new(LoopbackMediaTransport::new(UserId::new(ctx.identity.as_str())))
        }
    };

    let client = CallClient::builder(ctx.identity.as_str(), Arc::new(transport))
        .with_config(ctx.config.clone())
        .with_backend(Arc::new(backend))
        .with_media_transport(media)
        .build()?;
    println!("✅ Connected to {}", url);
    Ok(client)
}

async fn handle_call(
    ctx: &Context,
    chat: String,
    mut members: Vec<String>,
    target: Option<String>,
    video: bool,
) -> Result<()> {
    if !members.contains(&ctx.identity) {
        members.push(ctx.identity.clone());
    }
    let backend = LocalCallBackend::new().with_chat(chat.as_str(), members);
    let client = build_client(ctx, backend).await?;
    let _runner = client.start();
    let mut events = client.subscribe_events();

    let call_type = if video {
        CallType::Video
    } else {
        CallType::Audio
    };
    let call_id = client
        .initiate_call(ChatId::new(chat), call_type, target.map(UserId::new))
        .await?;
    println!("📞 Calling... (call {}, Ctrl-C to hang up)", call_id);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if matches!(&event, CallEvent::CallEnded { call_id: id, .. } if *id == call_id) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("👋 Hanging up");
                client.end_call(&call_id).await?;
            }
        }
    }
    Ok(())
}

async fn handle_listen(ctx: &Context, auto_accept: bool, rejoin: bool) -> Result<()> {
    let client = build_client(ctx, LocalCallBackend::new()).await?;
    let _runner = client.start();
    let mut events = client.subscribe_events();

    println!("👂 Listening for incoming calls...");
    if auto_accept {
        println!("   Auto-accept: enabled");
    } else {
        println!("   Commands: a = accept, r = reject, h = hang up, m = mute, u = unmute, q = quit");
    }
    client.recover().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ringing: Option<CallId> = None;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::IncomingCall { session }) => {
                    print_event(&CallEvent::IncomingCall { session: session.clone() });
                    if auto_accept {
                        accept(&client, &session).await;
                    } else {
                        ringing = Some(session.call_id);
                    }
                }
                Ok(CallEvent::RejoinAvailable { session }) => {
                    if rejoin {
                        println!("🔁 Rejoining call {}", session.call_id);
                        if let Err(e) = client
                            .rejoin(&session.call_id, session.call_type.default_constraints())
                            .await
                        {
                            println!("❌ Rejoin failed: {}", e);
                        }
                    } else {
                        println!(
                            "🔁 Call {} in chat {} can be rejoined (restart with --rejoin)",
                            session.call_id, session.chat_id
                        );
                    }
                }
                Ok(event) => {
                    if let CallEvent::CallEnded { call_id, .. } = &event {
                        if ringing.as_ref() == Some(call_id) {
                            ringing = None;
                        }
                    }
                    print_event(&event);
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(command) => {
                    if !run_command(&client, command.trim(), &mut ringing).await? {
                        break;
                    }
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    for call_id in client.active_calls() {
        client.end_call(&call_id).await?;
    }
    println!("👋 Bye");
    Ok(())
}

async fn accept(client: &CallClient, session: &CallSession) {
    println!("✅ Accepting call...");
    if let Err(e) = client
        .accept_call(&session.call_id, session.call_type.default_constraints())
        .await
    {
        println!("❌ Could not accept: {}", e);
    }
}

/// Returns `false` when the user asked to quit
async fn run_command(
    client: &CallClient,
    command: &str,
    ringing: &mut Option<CallId>,
) -> Result<bool> {
    match command {
        "a" => match ringing.take() {
            Some(call_id) => match client.session(&call_id).await {
                Some(session) => accept(client, &session).await,
                None => println!("Call {} is gone", call_id),
            },
            None => println!("Nothing is ringing"),
        },
        "r" => match ringing.take() {
            Some(call_id) => client.reject_call(&call_id).await?,
            None => println!("Nothing is ringing"),
        },
        "h" => {
            for call_id in client.active_calls() {
                client.end_call(&call_id).await?;
            }
        }
        "m" | "u" => {
            for call_id in client.active_calls() {
                if let Err(e) = client.set_muted(&call_id, command == "m").await {
                    println!("❌ {}", e);
                }
            }
        }
        "q" => return Ok(false),
        "" => {}
        other => println!("Unknown command {:?}", other),
    }
    Ok(true)
}

async fn handle_status(ctx: &Context) -> Result<()> {
    println!("📊 meshcall status");
    println!("==================");
    println!("Identity: {}", ctx.identity);
    println!("Media:    {:?}", ctx.media);
    println!("Configuration:");
    println!("{}", serde_json::to_string_pretty(&ctx.config)?);

    if let Some(path) = &ctx.config.session_store_path {
        let sessions = FileSessionStore::new(path).load().await?;
        if sessions.is_empty() {
            println!("No calls to rejoin");
        }
        for session in sessions {
            println!(
                "🔁 {} in chat {} ({:?}, {} participants)",
                session.call_id,
                session.chat_id,
                session.call_type,
                session.callee_ids.len() + 1
            );
        }
    }
    println!();
    println!("Available commands:");
    println!("  meshcall relay [--listen addr]              - Run a signaling relay");
    println!("  meshcall call <chat> --members a,b [opts]   - Call a chat");
    println!("  meshcall listen [--auto-accept] [--rejoin]  - Wait for calls");
    println!("  meshcall status                             - Show this status");
    Ok(())
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::CallInitiated { session } => {
            println!("📞 Ringing {} member(s)", session.callee_ids.len());
        }
        CallEvent::IncomingCall { session } => {
            let caller = session
                .metadata
                .display_name
                .clone()
                .unwrap_or_else(|| session.caller_id.to_string());
            println!(
                "📞 Incoming {:?} call from {} in chat {}",
                session.call_type, caller, session.chat_id
            );
        }
        CallEvent::Ringtone { .. } => {}
        CallEvent::CallAccepted { user_id, .. } => println!("✅ {} joined", user_id),
        CallEvent::CallRejected { user_id, .. } => println!("🚫 {} declined", user_id),
        CallEvent::ParticipantUpdated { participant, .. } => {
            tracing::debug!(user = %participant.user_id, state = ?participant.connection_state, "Participant updated");
        }
        CallEvent::ParticipantLeft { user_id, .. } => println!("👋 {} left", user_id),
        CallEvent::CallEnded { call_id, outcome } => {
            println!("📴 Call {} ended ({:?})", call_id, outcome);
        }
        CallEvent::Failed { error, .. } => println!("❌ {}", error),
        CallEvent::RejoinAvailable { session } => {
            println!("🔁 Call {} can be rejoined", session.call_id);
        }
        CallEvent::LocalMedia { event, .. } => match event {
            MediaEvent::TrackToggled { kind, enabled, .. } => {
                println!("🎚️  Local {:?} {}", kind, if *enabled { "on" } else { "off" });
            }
            MediaEvent::StreamStarted { .. } | MediaEvent::StreamStopped { .. } => {
                tracing::debug!(event = ?event, "Local media changed");
            }
        },
    }
}

fn default_store_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "meshcall")
        .map(|dirs| dirs.data_dir().join("sessions.json"))
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    let words: Vec<&str> = (0..2)
        .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
        .collect();
    format!("{}-{}-{}", words[0], words[1], rng.gen_range(100..1000))
}
