//! Reconnection Loop
//!
//! Runs after an abnormal closure. Each attempt waits the configured delay
//! plus jitter, then either rejoins the previous room (resuming the same
//! remote session) or, once the server reports that room as expired, joins a
//! fresh room for the session identity. The loop ends on the first success,
//! when the attempt budget runs out, or as soon as the session is
//! disconnected.

use crate::session::SessionInner;
use parley_core::transport::{CloseCode, ConnectError};
use std::sync::Weak;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub(crate) async fn run(session: Weak<SessionInner>) {
    let Some(inner) = session.upgrade() else {
        return;
    };
    let policy = inner.config.reconnect.clone();
    let identity = inner.identity();
    let previous = inner.previous_room();
    let connector = inner.connector.clone();
    let mut keep_going = inner.cancellation();
    drop(inner);

    let mut room_expired = previous.is_none();
    for attempt in 1..=policy.max_attempts {
        let delay = policy.next_delay();
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnection attempt");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(&mut keep_going) => {
                return abandon(&session, "Reconnection cancelled");
            }
        }
        if !should_continue(&keep_going) {
            return abandon(&session, "Reconnection cancelled");
        }

        let result = match previous.as_ref().filter(|_| !room_expired) {
            Some((room_id, session_id)) => {
                info!(attempt, %room_id, "Rejoining previous room");
                connector.rejoin(room_id, session_id).await
            }
            None => {
                info!(attempt, "Joining a new room");
                connector.join_or_create(&identity).await
            }
        };

        if !should_continue(&keep_going) {
            if let Ok(handle) = result {
                debug!("Closing room opened after disconnect");
                handle.room.close(CloseCode::EXPLICIT_DISCONNECT).await;
            }
            return abandon(&session, "Reconnection cancelled");
        }

        match result {
            Ok(handle) => {
                let Some(inner) = session.upgrade() else {
                    handle.room.close(CloseCode::EXPLICIT_DISCONNECT).await;
                    return;
                };
                let room_id = handle.room.room_id().to_string();
                match inner.reconnected(handle) {
                    Ok(()) => info!(attempt, %room_id, "Reconnected"),
                    Err(handle) => {
                        debug!("Closing room opened after disconnect");
                        handle.room.close(CloseCode::EXPLICIT_DISCONNECT).await;
                        inner.reconnect_abandoned();
                    }
                }
                return;
            }
            Err(ConnectError::RoomExpired(room_id)) => {
                warn!(attempt, %room_id, "Previous room has expired; joining a new room from now on");
                room_expired = true;
            }
            Err(e) => {
                warn!(attempt, max_attempts = policy.max_attempts, error = %e, "Reconnection attempt failed");
            }
        }
    }

    error!(attempts = policy.max_attempts, "Giving up on reconnecting");
    abandon(&session, "Reconnection attempts exhausted");
}

fn abandon(session: &Weak<SessionInner>, reason: &str) {
    info!(reason, "Reconnection stopped");
    if let Some(inner) = session.upgrade() {
        inner.reconnect_abandoned();
    }
}

fn should_continue(keep_going: &watch::Receiver<bool>) -> bool {
    *keep_going.borrow()
}

/// Resolves once the session stops wanting to reconnect, or is gone.
async fn cancelled(keep_going: &mut watch::Receiver<bool>) {
    let _ = keep_going.wait_for(|keep| !*keep).await;
}
