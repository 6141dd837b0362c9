//! Parley Session
//!
//! The client-side session protocol: a [`Session`] owns one realtime room,
//! keeps it alive across transport failures, buffers outgoing commands while
//! disconnected, and routes inbound topics to the [`Conversation`]s joined on
//! it. After every reconnection each conversation replays the events it missed
//! so subscribers observe a gap-free, duplicate-free history.

mod conversation;
mod error;
mod reconnect;
mod session;

#[cfg(test)]
mod testing;

pub use conversation::{Conversation, StartOptions};
pub use error::{ReplayError, SessionError};
pub use session::Session;
