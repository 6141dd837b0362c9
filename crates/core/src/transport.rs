//! Transport Contract
//!
//! A *room* is a single realtime connection to the backend. Rooms are produced
//! by a [`RoomConnector`], which can either join (or create) the room for a
//! session identity, or rejoin a specific room by its previous identifiers.
//! The two constructors map directly onto the two phases of reconnection.

use crate::{command::OutgoingCommand, events::InboundMessage};
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Reason code carried by a transport closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Normal closure initiated by the remote end.
    pub const NORMAL: Self = Self(1000);
    /// A close frame arrived without a status code.
    pub const NO_STATUS: Self = Self(1005);
    /// The connection dropped without a close frame.
    pub const ABNORMAL: Self = Self(1006);
    /// Reserved: the user explicitly disconnected. Suppresses reconnection.
    pub const EXPLICIT_DISCONNECT: Self = Self(4000);
    /// The room being rejoined no longer exists on the server.
    pub const ROOM_NOT_FOUND: Self = Self(4004);

    pub fn is_explicit_disconnect(self) -> bool {
        self == Self::EXPLICIT_DISCONNECT
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a room can report to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// Non-fatal error; the room stays open.
    Error { code: Option<u16>, message: String },
    /// Terminal. No further events follow.
    Closed(CloseCode),
}

/// Failure to open a room.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("room {0} no longer exists")]
    RoomExpired(String),
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Failure to send on an open room.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("room is closed")]
    Closed,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("send failed: {0}")]
    Send(String),
}

/// The logical identity a session presents when joining a room.
#[derive(Clone)]
pub struct RoomIdentity {
    pub token: String,
    pub session_uuid: Uuid,
}

impl fmt::Debug for RoomIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomIdentity")
            .field("token", &"[REDACTED]")
            .field("session_uuid", &self.session_uuid)
            .finish()
    }
}

/// An open realtime connection.
#[async_trait]
pub trait Room: Send + Sync {
    /// Server-assigned room identifier, used to rejoin.
    fn room_id(&self) -> &str;
    /// Server-assigned id of this client within the room, used to rejoin.
    fn session_id(&self) -> &str;
    async fn send(&self, command: &OutgoingCommand) -> Result<(), TransportError>;
    /// Closes the room with `code`. The event stream ends with `Closed(code)`.
    async fn close(&self, code: CloseCode);
}

/// A freshly opened room together with its inbound event stream.
pub struct RoomHandle {
    pub room: Arc<dyn Room>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.room.room_id())
            .field("session_id", &self.room.session_id())
            .finish_non_exhaustive()
    }
}

/// Opens rooms against the backend.
#[async_trait]
pub trait RoomConnector: Send + Sync {
    /// Joins the room for `identity`, creating it if needed.
    async fn join_or_create(&self, identity: &RoomIdentity) -> Result<RoomHandle, ConnectError>;

    /// Resumes the exact remote session identified by a previous room.
    ///
    /// Fails with [`ConnectError::RoomExpired`] once the server has discarded
    /// the room.
    async fn rejoin(&self, room_id: &str, session_id: &str) -> Result<RoomHandle, ConnectError>;
}
