//! Parley Core
//!
//! Shared building blocks for the Parley conversation client: identifiers, the
//! event vocabulary exchanged with the backend, the ordered task queue, and the
//! collaborator contracts (room connector, event history) that `parley-session`
//! drives. Nothing in this crate owns a connection.

pub mod command;
pub mod config;
pub mod event_id;
pub mod events;
pub mod history;
pub mod queue;
pub mod token;
pub mod transport;

pub use event_id::EventId;

/// Identifier of a single dialogue thread within a session.
pub type ConversationUuid = uuid::Uuid;
