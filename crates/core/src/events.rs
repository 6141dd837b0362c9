//! Event Vocabulary
//!
//! The inbound topics a backend room can publish, and the closed sets of events
//! that sessions and conversations publish to their subscribers. Free-form
//! topic strings never leave this module.

use crate::{ConversationUuid, EventId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Acknowledgement sent by the server once per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub player_session_id: String,
}

/// Payload of topics that carry nothing but their conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_uuid: ConversationUuid,
}

/// An error reported by the backend, optionally scoped to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_uuid: Option<ConversationUuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub error: String,
}

/// An ordered conversation message, the only event kind that advances a
/// conversation's replay position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub conversation_uuid: ConversationUuid,
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub message: Value,
}

/// Signals that the current episode (turn sequence) has finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeCompleteEvent {
    pub conversation_uuid: ConversationUuid,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Confirmation that the server accepted a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckEvent {
    pub conversation_uuid: ConversationUuid,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Every topic a room delivers, as it appears on the wire:
/// `{"topic": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
pub enum InboundMessage {
    Status(StatusEvent),
    Problem(ProblemEvent),
    StartTyping(ConversationRef),
    StopTyping(ConversationRef),
    Message(MessageEvent),
    EpisodeComplete(EpisodeCompleteEvent),
    ReplyAck(AckEvent),
    ActionAck(AckEvent),
    ResumeAck(AckEvent),
    StartAck(AckEvent),
    TapAck(AckEvent),
}

/// Events published on a session's subscription channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    ConnectionStatus { status: ConnectionStatus },
    /// The server acknowledged the connection and assigned a player session.
    Ready { player_session_id: String },
    /// A problem not attributable to any conversation.
    Problem(ProblemEvent),
    /// A non-fatal transport error. Connection state is unaffected.
    TransportError { code: Option<u16>, message: String },
}

/// Events published on a conversation's subscription channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ConversationEvent {
    Message(MessageEvent),
    StartTyping,
    StopTyping,
    EpisodeComplete(EpisodeCompleteEvent),
    Problem(ProblemEvent),
    ReplyAck(AckEvent),
    ActionAck(AckEvent),
    ResumeAck(AckEvent),
    StartAck(AckEvent),
    TapAck(AckEvent),
    /// Missed history is about to be redelivered.
    ReplayStart,
    /// Redelivery of missed history has finished.
    ReplayEnd,
}

/// Where an inbound message must be delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Session(SessionEvent),
    Conversation(ConversationUuid, ConversationEvent),
}

impl InboundMessage {
    /// Splits the message into its delivery target and the event to publish.
    pub fn route(self) -> Route {
        use ConversationEvent as C;
        match self {
            InboundMessage::Status(status) => Route::Session(SessionEvent::Ready {
                player_session_id: status.player_session_id,
            }),
            InboundMessage::Problem(problem) => match problem.conversation_uuid {
                Some(uuid) => Route::Conversation(uuid, C::Problem(problem)),
                None => Route::Session(SessionEvent::Problem(problem)),
            },
            InboundMessage::StartTyping(r) => Route::Conversation(r.conversation_uuid, C::StartTyping),
            InboundMessage::StopTyping(r) => Route::Conversation(r.conversation_uuid, C::StopTyping),
            InboundMessage::Message(m) => Route::Conversation(m.conversation_uuid, C::Message(m)),
            InboundMessage::EpisodeComplete(e) => {
                Route::Conversation(e.conversation_uuid, C::EpisodeComplete(e))
            }
            InboundMessage::ReplyAck(a) => Route::Conversation(a.conversation_uuid, C::ReplyAck(a)),
            InboundMessage::ActionAck(a) => Route::Conversation(a.conversation_uuid, C::ActionAck(a)),
            InboundMessage::ResumeAck(a) => Route::Conversation(a.conversation_uuid, C::ResumeAck(a)),
            InboundMessage::StartAck(a) => Route::Conversation(a.conversation_uuid, C::StartAck(a)),
            InboundMessage::TapAck(a) => Route::Conversation(a.conversation_uuid, C::TapAck(a)),
        }
    }
}
