//! Event History Contract
//!
//! Used by conversations to fetch events missed while disconnected.

use crate::{ConversationUuid, EventId, events::MessageEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kinds of historical events that can be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Messages spoken by a character. This is what replay redelivers.
    MessageCharacter,
    MessagePlayer,
}

/// Parameters of a history fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQuery {
    pub conversation_uuid: ConversationUuid,
    /// Inclusive lower bound; the backend may return this event again.
    pub min_event_id: EventId,
    pub limit: usize,
    pub event_types: Vec<EventKind>,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Request(String),
    #[error("history request returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode history response: {0}")]
    Decode(String),
}

/// Fetches historical conversation events, ordered by ascending event id.
#[async_trait]
pub trait EventHistory: Send + Sync {
    async fn fetch_events(
        &self,
        token: &str,
        query: &EventQuery,
    ) -> Result<Vec<MessageEvent>, HistoryError>;
}
