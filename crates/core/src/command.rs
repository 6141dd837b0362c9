//! Outgoing commands and the conversation-level options merged into them.

use crate::ConversationUuid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// The closed set of commands a client may send to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandName {
    Start,
    Reply,
    ReplyIntermediate,
    Tap,
    Action,
    Resume,
    Pause,
    Play,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::Start => "start",
            CommandName::Reply => "reply",
            CommandName::ReplyIntermediate => "reply-intermediate",
            CommandName::Tap => "tap",
            CommandName::Action => "action",
            CommandName::Resume => "resume",
            CommandName::Pause => "pause",
            CommandName::Play => "play",
        }
    }
}

/// How synthesized speech should be returned alongside character messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechOutput {
    Url,
    Buffer,
}

/// Speech synthesis preferences attached to every command of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    /// Accepted audio encodings, most preferred first (e.g. `["ogg", "mp3"]`).
    pub encoding: Vec<String>,
    pub output: SpeechOutput,
}

/// Options a conversation merges into each command it sends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// A command queued for delivery to the current room.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingCommand {
    pub name: CommandName,
    pub conversation_uuid: ConversationUuid,
    pub payload: Map<String, Value>,
}

impl OutgoingCommand {
    pub fn new(name: CommandName, conversation_uuid: ConversationUuid) -> Self {
        Self {
            name,
            conversation_uuid,
            payload: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Folds conversation options into the payload. Keys already present in
    /// the payload are kept.
    pub fn merged_with(mut self, options: &ConversationOptions) -> Self {
        if let Ok(Value::Object(defaults)) = serde_json::to_value(options) {
            for (key, value) in defaults {
                self.payload.entry(key).or_insert(value);
            }
        }
        self
    }

    /// The frame sent on the wire: `{"command": ..., "payload": {..., "conversationUuid": ...}}`.
    pub fn to_wire(&self) -> Value {
        let mut payload = self.payload.clone();
        payload.insert(
            "conversationUuid".to_string(),
            Value::String(self.conversation_uuid.to_string()),
        );
        json!({
            "command": self.name.as_str(),
            "payload": payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_command_names_match_wire_names() {
        for name in [
            CommandName::Start,
            CommandName::Reply,
            CommandName::ReplyIntermediate,
            CommandName::Tap,
            CommandName::Action,
            CommandName::Resume,
            CommandName::Pause,
            CommandName::Play,
        ] {
            assert_eq!(serde_json::to_value(name).unwrap(), json!(name.as_str()));
        }
    }

    #[test]
    fn test_merges_speech_config_without_overriding_payload() {
        let uuid = Uuid::new_v4();
        let options = ConversationOptions {
            speech_config: Some(SpeechConfig {
                encoding: vec!["ogg".into(), "mp3".into()],
                output: SpeechOutput::Url,
            }),
        };

        let merged = OutgoingCommand::new(CommandName::Reply, uuid)
            .with_field("text", "hi")
            .merged_with(&options);
        assert_eq!(merged.payload["text"], "hi");
        assert_eq!(
            merged.payload["speechConfig"],
            json!({ "encoding": ["ogg", "mp3"], "output": "url" })
        );

        let explicit = OutgoingCommand::new(CommandName::Reply, uuid)
            .with_field("speechConfig", Value::Null)
            .merged_with(&options);
        assert_eq!(explicit.payload["speechConfig"], Value::Null);
    }

    #[test]
    fn test_empty_options_leave_payload_untouched() {
        let command = OutgoingCommand::new(CommandName::Tap, Uuid::new_v4())
            .merged_with(&ConversationOptions::default());
        assert!(command.payload.is_empty());
    }

    #[test]
    fn test_wire_frame_carries_conversation() {
        let uuid = Uuid::new_v4();
        let wire = OutgoingCommand::new(CommandName::ReplyIntermediate, uuid)
            .with_field("text", "typing...")
            .to_wire();
        assert_eq!(wire["command"], "reply-intermediate");
        assert_eq!(wire["payload"]["conversationUuid"], uuid.to_string());
        assert_eq!(wire["payload"]["text"], "typing...");
    }
}
