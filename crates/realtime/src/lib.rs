//! Parley Realtime
//!
//! Network implementations of the collaborator traits in `parley-core`: a
//! WebSocket [`WsRoomConnector`] and an HTTP [`HttpEventHistory`].

mod history;
mod protocol;
mod room;

pub use history::HttpEventHistory;
pub use room::{WsRoom, WsRoomConnector};
