//! Parley Console
//!
//! Command-line arguments, stdin command parsing and event rendering for the
//! `parley-console` binary.

use clap::Parser;
use parley_core::events::{ConversationEvent, SessionEvent};
use parley_session::{Conversation, SessionError};
use serde_json::Value;
use uuid::Uuid;

/// Talk to a conversation from the terminal.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Session token issued for the playthrough.
    #[arg(long)]
    pub token: String,
    /// Conversation to join.
    #[arg(long)]
    pub conversation: Uuid,
    /// Start the story at this scene once connected.
    #[arg(long)]
    pub start_scene: Option<u32>,
    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// A line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Reply(String),
    Tap,
    Action(String),
    Pause,
    Play,
    Resume,
    Quit,
    Empty,
}

/// Lines starting with `/` are console commands; anything else is a reply.
pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Reply(line.to_string());
    };
    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, rest)| (name, rest.trim()));
    match name {
        "tap" => Input::Tap,
        "action" if !rest.is_empty() => Input::Action(rest.to_string()),
        "pause" => Input::Pause,
        "play" => Input::Play,
        "resume" => Input::Resume,
        "quit" | "exit" => Input::Quit,
        _ => Input::Reply(line.to_string()),
    }
}

/// Sends the command corresponding to `input`.
pub fn apply(conversation: &Conversation, input: Input) -> Result<(), SessionError> {
    match input {
        Input::Reply(text) => conversation.reply(&text),
        Input::Tap => conversation.tap(),
        Input::Action(action) => conversation.action(&action),
        Input::Pause => conversation.pause(),
        Input::Play => conversation.play(),
        Input::Resume => conversation.resume(),
        Input::Quit | Input::Empty => Ok(()),
    }
}

pub fn render_conversation_event(event: &ConversationEvent) -> Option<String> {
    match event {
        ConversationEvent::Message(message) => {
            let text = match message.message.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => message.message.to_string(),
            };
            Some(format!("[{}] {text}", message.event_id))
        }
        ConversationEvent::StartTyping => Some("... typing".to_string()),
        ConversationEvent::StopTyping => None,
        ConversationEvent::EpisodeComplete(_) => Some("-- episode complete --".to_string()),
        ConversationEvent::Problem(problem) => Some(format!("! {}", problem.error)),
        ConversationEvent::ReplayStart => Some("-- catching up --".to_string()),
        ConversationEvent::ReplayEnd => Some("-- caught up --".to_string()),
        ConversationEvent::ReplyAck(_)
        | ConversationEvent::ActionAck(_)
        | ConversationEvent::ResumeAck(_)
        | ConversationEvent::StartAck(_)
        | ConversationEvent::TapAck(_) => None,
    }
}

pub fn render_session_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::ConnectionStatus { status } => Some(format!("({status})")),
        SessionEvent::Problem(problem) => Some(format!("! {}", problem.error)),
        SessionEvent::Ready { .. } | SessionEvent::TransportError { .. } => None,
    }
}
