//! Console host for the embodied agent.
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and command line.
//! 2. Compiling the gesture tools and opening the live session.
//! 3. Reading user turns from stdin and logging the avatar's output.
//! 4. Disconnecting cleanly on Ctrl+C or end of session.

use anyhow::Context;
use clap::Parser;
use embody_agent::{
    collaborators::{Collaborators, LoggingAvatar, LoggingSink},
    config::{Config, WakeMode},
    gestures::gesture_tools,
    orchestrator::{HostInput, Orchestrator, OrchestratorConfig},
};
use embody_core::{
    generic_types::SessionConfig,
    playback::{PlaybackConfig, PlaybackManager},
    tools::ToolRegistry,
    uplink::{UplinkConfig, UplinkPipeline},
    vad::{InterruptionConfig, VadConfig, VoiceActivityDetector},
};
use gemini_realtime::{LiveClient, endpoint_url};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "agent", about = "Embodied conversational agent (console host)", version)]
struct Cli {
    /// Model id, overrides LIVE_MODEL.
    #[arg(short, long)]
    model: Option<String>,
    /// Wake policy (always, phrase, phrase_once), overrides WAKE_MODE.
    #[arg(short, long)]
    wake_mode: Option<WakeMode>,
    /// Websocket endpoint, overrides LIVE_ENDPOINT.
    #[arg(long)]
    endpoint: Option<String>,
}

/// Listens for the `Ctrl+C` signal to shut down gracefully.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Forwards stdin lines as user turns until EOF.
async fn read_stdin(inputs: mpsc::Sender<HostInput>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if inputs.send(HostInput::UserText(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(model) = cli.model {
        config.live_model = model;
    }
    if let Some(wake_mode) = cli.wake_mode {
        config.wake_mode = wake_mode;
    }
    if let Some(endpoint) = cli.endpoint {
        config.live_endpoint = endpoint;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing agent...");

    let system_instruction = match &config.system_prompt_path {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt {}", path.display()))?,
        ),
        None => None,
    };

    // --- 3. Compile Tools and Connect ---
    let registry = Arc::new(ToolRegistry::from_definitions(gesture_tools()));
    let session_config = SessionConfig {
        model: config.live_model.clone(),
        response_modalities: vec![config.response_modality],
        voice_name: config.voice_name.clone(),
        system_instruction,
        tools: registry.declarations(),
    };

    let (client, events) = LiveClient::new();
    let client = Arc::new(client);
    client
        .connect(
            &endpoint_url(&config.live_endpoint, &config.gemini_api_key),
            session_config,
            config.connect_timeout,
        )
        .await
        .context("Failed to open live session")?;
    info!(model = %config.live_model, tools = registry.len(), "Live session ready");

    // --- 4. Assemble the Orchestrator ---
    let shutdown = CancellationToken::new();
    let playback = PlaybackManager::new(
        Arc::new(LoggingSink::default()),
        PlaybackConfig::default(),
        client.cancellation_token(),
    );
    let uplink = UplinkPipeline::new(UplinkConfig {
        input_gain: config.input_gain,
        ..UplinkConfig::default()
    })?;
    let vad = VoiceActivityDetector::new(VadConfig {
        input_gain: config.input_gain,
        voice_detection_threshold: config.vad_threshold,
        ..VadConfig::default()
    });
    let orchestrator = Orchestrator::new(
        Arc::clone(&client),
        registry,
        playback,
        uplink,
        vad,
        Collaborators {
            avatar: Arc::new(LoggingAvatar),
            images: None,
        },
        OrchestratorConfig {
            wake_mode: config.wake_mode,
            wake_phrase: config.wake_phrase.clone(),
            vision_mode: config.vision_mode,
            vision_phrase: config.vision_phrase.clone(),
            greeting: config.greeting.clone(),
            interruption: InterruptionConfig {
                debounce: config.interrupt_debounce,
                ..InterruptionConfig::default()
            },
            ..OrchestratorConfig::default()
        },
    );

    let (inputs_tx, inputs_rx) = mpsc::channel(32);
    tokio::spawn(read_stdin(inputs_tx));
    info!("Type a message and press Enter to talk to the agent.");

    // --- 5. Run Until Closed ---
    tokio::select! {
        result = orchestrator.run(events, inputs_rx, shutdown.clone()) => result?,
        _ = shutdown_signal() => {}
    }
    shutdown.cancel();
    client.disconnect().await;

    info!("Agent has shut down.");
    Ok(())
}
