//! Headless runner for the realtime voice assistant core.
//!
//! Wires environment configuration and structured logging around the session
//! manager, drains its notifications into log lines, and forwards typed
//! stdin lines as text submissions. `Ctrl+C` stops the session and exits.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sona_realtime::{ClientConfig, ClientNotification, RealtimeClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sona", about = "Voice assistant session runner", version)]
struct Args {
    /// Realtime model identifier (overrides OPENAI_REALTIME_MODEL).
    #[arg(long)]
    model: Option<String>,

    /// Assistant voice.
    #[arg(long)]
    voice: Option<String>,

    /// System instructions for the assistant.
    #[arg(long)]
    instructions: Option<String>,

    /// Server-VAD sensitivity threshold, clamped to [0, 1].
    #[arg(long)]
    vad_threshold: Option<f32>,

    /// Server-VAD silence window in milliseconds, at least 100.
    #[arg(long)]
    vad_silence_ms: Option<u32>,

    /// Start with the microphone muted.
    #[arg(long)]
    no_mic: bool,

    /// Start with assistant playback muted.
    #[arg(long)]
    no_speaker: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let mut config = ClientConfig::from_env().context("Failed to load configuration")?;
    if let Some(model) = args.model {
        config.session.model = model;
    }
    if let Some(voice) = args.voice {
        config.session.voice = voice;
    }
    if let Some(instructions) = args.instructions {
        config.session.instructions = instructions;
    }
    if let Some(threshold) = args.vad_threshold {
        config.session.set_vad_threshold(threshold);
    }
    if let Some(silence_ms) = args.vad_silence_ms {
        config.session.set_vad_silence_ms(silence_ms);
    }

    info!(
        model = %config.session.model,
        voice = %config.session.voice,
        "Starting realtime session manager"
    );

    let (client, mut notifications) = RealtimeClient::new(config);
    let client = Arc::new(client);
    client.start();
    if args.no_mic {
        client.toggle_mic(false);
    }
    if args.no_speaker {
        client.toggle_speaker(false);
    }

    // Typed lines become user text submissions.
    let stdin_client = Arc::clone(&client);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() {
                stdin_client.submit_text(line);
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received shutdown signal. Stopping...");
                break;
            }
            maybe = notifications.recv() => {
                match maybe {
                    Some(notification) => render(&notification),
                    None => break,
                }
            }
        }
    }

    let stop_client = Arc::clone(&client);
    tokio::task::spawn_blocking(move || stop_client.stop())
        .await
        .context("stop task panicked")?;
    info!("Stopped.");
    Ok(())
}

fn render(notification: &ClientNotification) {
    match notification {
        ClientNotification::AssistantText(text) => info!(%text, "assistant"),
        ClientNotification::UserTranscript(text) => info!(%text, "user transcript"),
        ClientNotification::ServerError(message) => tracing::error!(%message, "session error"),
        ClientNotification::Status(message) => info!("{message}"),
        ClientNotification::Connection(connected) => info!(connected, "connection state"),
        ClientNotification::AudioLevel(level) => tracing::trace!(level, "assistant audio level"),
    }
}
