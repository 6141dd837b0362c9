//! Main Entrypoint for the Parley Console
//!
//! 1. Parses arguments and loads configuration from the environment.
//! 2. Connects a session and joins the requested conversation.
//! 3. Prints conversation events and sends each stdin line as a command.
//! 4. Disconnects on EOF, `/quit` or `Ctrl+C`.

use anyhow::Context;
use clap::Parser;
use parley_console::{Args, Input, apply, parse_input, render_conversation_event, render_session_event};
use parley_core::config::ClientConfig;
use parley_realtime::{HttpEventHistory, WsRoomConnector};
use parley_session::{Session, StartOptions};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ClientConfig::from_env().context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(base_url = %config.base_url, realtime_url = %config.realtime_url, "Configuration loaded");

    let connector = Arc::new(WsRoomConnector::new(&config));
    let history = Arc::new(HttpEventHistory::new(&config));
    let session = Session::new(&args.token, connector, history, config).context("Invalid session token")?;
    let mut session_events = session.subscribe();
    let conversation = session
        .join_conversation(args.conversation)
        .context("Failed to join conversation")?;
    let mut conversation_events = conversation.subscribe();

    session.connect().await.context("Failed to connect")?;
    if let Some(scene_index) = args.start_scene {
        conversation
            .start(StartOptions {
                scene_index: Some(scene_index),
                ..StartOptions::default()
            })
            .context("Failed to start conversation")?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => match parse_input(&line) {
                    Input::Quit => break,
                    input => {
                        if let Err(e) = apply(&conversation, input) {
                            warn!(error = %e, "Command not sent");
                        }
                    }
                },
                None => break,
            },
            event = conversation_events.recv() => match event {
                Ok(event) => {
                    if let Some(text) = render_conversation_event(&event) {
                        println!("{text}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Console fell behind on conversation events"),
                Err(RecvError::Closed) => break,
            },
            event = session_events.recv() => match event {
                Ok(event) => {
                    if let Some(text) = render_session_event(&event) {
                        println!("{text}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Console fell behind on session events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
        }
    }

    session.disconnect().await;
    info!("Console has shut down.");
    Ok(())
}
