//! Main Entrypoint for the voxroom console client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and command line.
//! 2. Wiring the credential fetcher, room transport and microphone into a
//!    session controller, and agent audio into the speaker.
//! 3. Rendering session state changes to stdout.
//! 4. Turning stdin lines into controller commands until `/quit` or Ctrl+C.

use anyhow::Context;
use clap::Parser;
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use voxroom_client::{
    config::Config,
    console::{self, ConsoleInput},
    microphone::default_microphone,
};
use voxroom_core::{
    controller::SessionController,
    credential::HttpCredentialFetcher,
    types::{ConnectionStatus, SessionSnapshot},
};
use voxroom_transport::WsTransport;

const METER_PERIOD: Duration = Duration::from_secs(1);
const QUIT_GRACE: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(version, about = "Talk and chat with a voice agent in a room")]
struct Cli {
    /// Room to join (overrides VOXROOM_ROOM)
    #[arg(long)]
    room: Option<String>,
    /// Participant identity (overrides VOXROOM_PARTICIPANT)
    #[arg(long)]
    participant: Option<String>,
    /// Token service base URL (overrides VOXROOM_API_URL)
    #[arg(long)]
    api_url: Option<String>,
    /// Connect immediately instead of waiting for /connect
    #[arg(long)]
    connect: bool,
    /// Print every state change as a JSON snapshot
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let cli = Cli::parse();
    let config = Config::from_env()
        .context("Failed to load configuration")?
        .with_overrides(cli.room, cli.participant, cli.api_url)
        .context("Invalid command line")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(
        api_url = %config.api_url,
        room = %config.room_name,
        participant = %config.participant_name,
        "Configuration loaded"
    );

    // --- 3. Assemble the Session Controller ---
    let fetcher = Arc::new(
        HttpCredentialFetcher::new(
            &config.api_url,
            config.room_name.clone(),
            config.participant_name.clone(),
        )
        .with_metadata(config.metadata.clone()),
    );
    let transport = Arc::new(WsTransport::new());
    let controller = SessionController::new(
        config.controller_config(),
        fetcher,
        transport.clone(),
        default_microphone(),
    );

    #[cfg(feature = "native-audio")]
    let _speaker = match voxroom_client::speaker::CpalSpeaker::start(transport.playback()).await {
        Ok(speaker) => Some(speaker),
        Err(e) => {
            warn!(error = %e, "Agent audio playback unavailable");
            None
        }
    };

    let renderer = tokio::spawn(render(controller.clone(), cli.json));
    if cli.connect {
        controller.connect();
    } else {
        println!("{}", console::HELP);
    }

    // --- 4. Read Commands ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        match console::parse_line(&line) {
            ConsoleInput::Command(command) => controller.dispatch(command),
            ConsoleInput::Status => println!("{}", console::describe_status(&controller.snapshot())),
            ConsoleInput::Help => println!("{}", console::HELP),
            ConsoleInput::Quit => break,
            ConsoleInput::Empty => {}
            ConsoleInput::Invalid(message) => println!("? {}", message),
        }
    }

    // --- 5. Leave the Room ---
    controller.disconnect();
    let left = tokio::time::timeout(
        QUIT_GRACE,
        controller.wait_for(|s| s.connection_status == ConnectionStatus::Disconnected),
    )
    .await;
    if left.is_err() {
        warn!("Session did not close in time");
    }
    renderer.abort();
    info!("Client has shut down.");
    Ok(())
}

/// Prints state changes, plus level meters at most once per `METER_PERIOD`
/// while someone is audible.
async fn render(controller: SessionController, json: bool) {
    let mut updates = controller.subscribe();
    let mut previous: SessionSnapshot = updates.borrow_and_update().clone();
    let mut last_meter = tokio::time::Instant::now();

    while updates.changed().await.is_ok() {
        let current = updates.borrow_and_update().clone();
        if json {
            match serde_json::to_string(&current) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize snapshot"),
            }
        } else {
            for line in console::describe_change(&previous, &current) {
                println!("{}", line);
            }
            let audible = current.audio_level > 0 || current.agent_audio_level > 0;
            if audible && last_meter.elapsed() >= METER_PERIOD {
                println!("{}", console::describe_levels(&current));
                last_meter = tokio::time::Instant::now();
            }
        }
        previous = current;
    }
}
