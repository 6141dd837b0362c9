use parley_core::{
    ConversationUuid,
    events::ConnectionStatus,
    history::HistoryError,
    queue::QueueClosed,
    token::TokenError,
    transport::ConnectError,
};

/// Errors surfaced by the session API.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session token: {0}")]
    Token(#[from] TokenError),
    #[error("conversation {0} is already joined")]
    AlreadyJoined(ConversationUuid),
    #[error("conversation {0} is not joined")]
    NotJoined(ConversationUuid),
    #[error("session is {0}; connect requires a disconnected session")]
    InvalidState(ConnectionStatus),
    #[error("session has been disconnected")]
    Closed,
    #[error("failed to connect: {0}")]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Queue(#[from] QueueClosed),
}

/// Why a conversation's catch-up replay did not complete.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("owning session no longer exists")]
    SessionGone,
    #[error(transparent)]
    History(#[from] HistoryError),
}
