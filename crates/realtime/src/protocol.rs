//! Frames exchanged with the realtime server.
//!
//! Control frames carry a `type` field; everything else is a topic frame
//! (`{"topic": ..., "payload": ...}`).

use parley_core::events::InboundMessage;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub(crate) enum ControlFrame {
    /// First frame after the upgrade: the identifiers needed to rejoin.
    Joined { room_id: String, session_id: String },
    /// A server-side error that does not end the connection.
    Error {
        #[serde(default)]
        code: Option<u16>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Control(ControlFrame),
    Topic(InboundMessage),
}

pub(crate) fn decode(text: &str) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("type").is_some() {
        serde_json::from_value(value).map(Frame::Control)
    } else {
        serde_json::from_value(value).map(Frame::Topic)
    }
}
