//! Session Lifecycle
//!
//! A session runs the connection state machine
//! (`disconnected` → `connecting` → `connected`), owns the current room and
//! the outgoing command queue, and fans inbound topics out to the joined
//! conversations. Abnormal closures hand over to the reconnection loop in
//! [`crate::reconnect`].

use crate::{
    conversation::{Conversation, InboundHold},
    error::SessionError,
    reconnect,
};
use futures_util::future::join_all;
use parley_core::{
    ConversationUuid,
    command::OutgoingCommand,
    config::ClientConfig,
    events::{ConnectionStatus, InboundMessage, Route, SessionEvent},
    history::EventHistory,
    queue::OrderedQueue,
    token::SessionToken,
    transport::{CloseCode, Room, RoomConnector, RoomHandle, RoomIdentity, TransportEvent},
};
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// One continuous logical connection to the conversation backend.
///
/// Cloning a `Session` yields another handle to the same connection. A
/// session that has been [disconnected](Session::disconnect) is terminal; a
/// new one must be constructed to connect again.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    token: SessionToken,
    pub(crate) config: ClientConfig,
    pub(crate) connector: Arc<dyn RoomConnector>,
    pub(crate) history: Arc<dyn EventHistory>,
    status: watch::Sender<ConnectionStatus>,
    should_reconnect: watch::Sender<bool>,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    link: Mutex<Link>,
    conversations: Mutex<HashMap<ConversationUuid, Conversation>>,
    outgoing: OrderedQueue<OutgoingCommand>,
    events: broadcast::Sender<SessionEvent>,
}

/// State tied to the current room.
#[derive(Default)]
struct Link {
    room: Option<Arc<dyn Room>>,
    /// `(room_id, session_id)` of the most recent room, kept for rejoining.
    previous: Option<(String, String)>,
    /// Incremented whenever a room is attached or abandoned.
    epoch: u64,
    player_session_id: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Creates a disconnected session for `token`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        token: &str,
        connector: Arc<dyn RoomConnector>,
        history: Arc<dyn EventHistory>,
        config: ClientConfig,
    ) -> Result<Self, SessionError> {
        let token = SessionToken::parse(token)?;
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (should_reconnect, _) = watch::channel(true);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let owner = weak.clone();
            let outgoing = OrderedQueue::new("outgoing", true, move |command: OutgoingCommand| {
                let owner = owner.clone();
                async move {
                    match owner.upgrade() {
                        Some(inner) => inner.transmit(command).await,
                        None => Err(command),
                    }
                }
            });
            SessionInner {
                token,
                config,
                connector,
                history,
                status,
                should_reconnect,
                closed: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                link: Mutex::default(),
                conversations: Mutex::default(),
                outgoing,
                events,
            }
        });
        Ok(Self { inner })
    }

    /// The session uuid encoded in the token.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// A receiver that only observes actual status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Player session assigned by the server for the current connection.
    pub fn player_session_id(&self) -> Option<String> {
        lock(&self.inner.link).player_session_id.clone()
    }

    pub fn conversation(&self, uuid: ConversationUuid) -> Option<Conversation> {
        lock(&self.inner.conversations).get(&uuid).cloned()
    }

    /// Every conversation currently joined.
    pub fn conversations(&self) -> Vec<Conversation> {
        lock(&self.inner.conversations).values().cloned().collect()
    }

    /// Opens the realtime connection and starts flushing queued commands.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SessionError::Closed);
        }
        inner.begin_connect()?;
        info!(session_uuid = %inner.uuid(), "Opening realtime connection");

        match inner.connector.join_or_create(&inner.identity()).await {
            Ok(handle) => match inner.attach(handle) {
                Ok(()) => Ok(()),
                Err(handle) => {
                    handle.room.close(CloseCode::EXPLICIT_DISCONNECT).await;
                    Err(SessionError::Closed)
                }
            },
            Err(e) => {
                error!(session_uuid = %inner.uuid(), error = %e, "Failed to open realtime connection");
                inner.set_status(ConnectionStatus::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Closes the connection for good and stops any reconnection in flight.
    ///
    /// Conversation registrations are dropped; `Conversation` handles held by
    /// the caller stay valid but can no longer send commands.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        inner.should_reconnect.send_replace(false);

        let room = {
            let mut link = lock(&inner.link);
            inner.outgoing.pause();
            link.epoch += 1;
            link.player_session_id = None;
            link.room.take()
        };
        lock(&inner.conversations).clear();

        if let Some(room) = room {
            room.close(CloseCode::EXPLICIT_DISCONNECT).await;
        }
        inner.set_status(ConnectionStatus::Disconnected);
        info!(session_uuid = %inner.uuid(), "Session disconnected");
    }

    /// Registers a conversation on this session.
    ///
    /// Joining a uuid that is already joined is an error; the existing
    /// instance is available through [`Session::conversation`].
    pub fn join_conversation(&self, uuid: ConversationUuid) -> Result<Conversation, SessionError> {
        if self.inner.is_closed() {
            return Err(SessionError::Closed);
        }
        match lock(&self.inner.conversations).entry(uuid) {
            Entry::Occupied(_) => Err(SessionError::AlreadyJoined(uuid)),
            Entry::Vacant(slot) => {
                let conversation = Conversation::new(
                    uuid,
                    Arc::downgrade(&self.inner),
                    self.inner.config.event_capacity,
                );
                slot.insert(conversation.clone());
                debug!(session_uuid = %self.uuid(), conversation_uuid = %uuid, "Joined conversation");
                Ok(conversation)
            }
        }
    }

    pub fn leave_conversation(&self, uuid: ConversationUuid) -> Result<(), SessionError> {
        match lock(&self.inner.conversations).remove(&uuid) {
            Some(_) => {
                debug!(session_uuid = %self.uuid(), conversation_uuid = %uuid, "Left conversation");
                Ok(())
            }
            None => Err(SessionError::NotJoined(uuid)),
        }
    }
}

impl SessionInner {
    pub(crate) fn uuid(&self) -> Uuid {
        self.token.session_uuid()
    }

    pub(crate) fn token(&self) -> &SessionToken {
        &self.token
    }

    pub(crate) fn identity(&self) -> RoomIdentity {
        RoomIdentity {
            token: self.token.as_str().to_string(),
            session_uuid: self.uuid(),
        }
    }

    pub(crate) fn previous_room(&self) -> Option<(String, String)> {
        lock(&self.link).previous.clone()
    }

    /// Cleared by `disconnect`; the reconnection loop waits on it.
    pub(crate) fn cancellation(&self) -> watch::Receiver<bool> {
        self.should_reconnect.subscribe()
    }

    fn should_reconnect(&self) -> bool {
        *self.should_reconnect.borrow()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn enqueue(&self, command: OutgoingCommand) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.outgoing.enqueue(command)?;
        Ok(())
    }

    fn begin_connect(&self) -> Result<(), SessionError> {
        let mut observed = ConnectionStatus::Disconnected;
        let started = self.status.send_if_modified(|status| {
            observed = *status;
            if *status == ConnectionStatus::Disconnected {
                *status = ConnectionStatus::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SessionError::InvalidState(observed));
        }
        self.announce(ConnectionStatus::Connecting);
        Ok(())
    }

    pub(crate) fn set_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
        if changed {
            self.announce(next);
        }
    }

    fn announce(&self, status: ConnectionStatus) {
        info!(session_uuid = %self.uuid(), %status, "Connection status changed");
        let _ = self.events.send(SessionEvent::ConnectionStatus { status });
    }

    /// Makes `handle` the current room. A session that has been disconnected
    /// refuses the room and hands it back to be closed.
    ///
    /// Runs under the link lock, which `disconnect` takes after marking the
    /// session closed, so a room is never installed on a closed session.
    fn attach(self: &Arc<Self>, handle: RoomHandle) -> Result<(), RoomHandle> {
        let mut link = lock(&self.link);
        if self.is_closed() {
            return Err(handle);
        }
        let RoomHandle { room, events } = handle;
        link.epoch += 1;
        link.previous = Some((room.room_id().to_string(), room.session_id().to_string()));
        link.player_session_id = None;
        link.room = Some(room);
        let epoch = link.epoch;

        let span = info_span!("room", session_uuid = %self.uuid(), epoch);
        tokio::spawn(pump(Arc::downgrade(self), epoch, events).instrument(span));
        self.set_status(ConnectionStatus::Connected);
        self.outgoing.resume();
        Ok(())
    }

    /// Installs a room opened by the reconnection loop and starts catch-up
    /// replay on every joined conversation.
    ///
    /// Inbound delivery is held from before the room starts pumping until each
    /// conversation's replay has finished.
    pub(crate) fn reconnected(self: &Arc<Self>, handle: RoomHandle) -> Result<(), RoomHandle> {
        self.reconnecting.store(false, Ordering::SeqCst);
        let held: Vec<(Conversation, InboundHold)> = lock(&self.conversations)
            .values()
            .map(|conversation| (conversation.clone(), conversation.hold_inbound()))
            .collect();
        self.attach(handle)?;

        if held.is_empty() {
            return Ok(());
        }
        let span = info_span!("replay", session_uuid = %self.uuid());
        tokio::spawn(
            async move {
                let replays = held.into_iter().map(|(conversation, hold)| async move {
                    let result = conversation.catch_up().await;
                    drop(hold);
                    (conversation.uuid(), result)
                });
                for (uuid, result) in join_all(replays).await {
                    match result {
                        Ok(0) => {}
                        Ok(count) => info!(conversation_uuid = %uuid, count, "Replayed missed events"),
                        Err(e) => warn!(conversation_uuid = %uuid, error = %e, "Catch-up replay failed"),
                    }
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Called by the reconnection loop when it stops without a connection.
    pub(crate) fn reconnect_abandoned(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn closed_by_transport(self: &Arc<Self>, epoch: u64, code: CloseCode) {
        {
            let mut link = lock(&self.link);
            if link.epoch != epoch {
                debug!(epoch, %code, "Ignoring closure of a superseded room");
                return;
            }
            link.room = None;
        }
        self.outgoing.pause();

        if code.is_explicit_disconnect() || !self.should_reconnect() {
            info!(%code, "Realtime connection closed");
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }

        warn!(%code, "Realtime connection lost");
        self.set_status(ConnectionStatus::Connecting);
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnection already in progress");
            return;
        }
        let span = info_span!("reconnect", session_uuid = %self.uuid());
        tokio::spawn(reconnect::run(Arc::downgrade(self)).instrument(span));
    }

    fn route(&self, message: InboundMessage) {
        match message.route() {
            Route::Session(SessionEvent::Ready { player_session_id }) => {
                {
                    let mut link = lock(&self.link);
                    if let Some(existing) = &link.player_session_id {
                        warn!(%existing, ignored = %player_session_id, "Ignoring repeated status acknowledgement");
                        return;
                    }
                    link.player_session_id = Some(player_session_id.clone());
                }
                info!(%player_session_id, "Server acknowledged connection");
                let _ = self.events.send(SessionEvent::Ready { player_session_id });
            }
            Route::Session(SessionEvent::Problem(problem)) => {
                warn!(code = ?problem.code, error = %problem.error, "Server reported a problem");
                let _ = self.events.send(SessionEvent::Problem(problem));
            }
            Route::Session(event) => {
                let _ = self.events.send(event);
            }
            Route::Conversation(uuid, event) => {
                let conversation = lock(&self.conversations).get(&uuid).cloned();
                match conversation {
                    Some(conversation) => conversation.dispatch(event),
                    None => debug!(conversation_uuid = %uuid, "Dropping event for a conversation that is not joined"),
                }
            }
        }
    }

    async fn transmit(&self, command: OutgoingCommand) -> Result<(), OutgoingCommand> {
        let room = lock(&self.link).room.clone();
        let Some(room) = room else {
            debug!(command = command.name.as_str(), "No open room; holding command");
            return Err(command);
        };
        match room.send(&command).await {
            Ok(()) => {
                debug!(
                    command = command.name.as_str(),
                    conversation_uuid = %command.conversation_uuid,
                    "Command sent"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    command = command.name.as_str(),
                    error = %e,
                    "Failed to send command; holding it for the next connection"
                );
                Err(command)
            }
        }
    }
}

/// Forwards one room's events into the session until the room closes.
async fn pump(
    session: Weak<SessionInner>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let code = loop {
        let Some(event) = events.recv().await else {
            break CloseCode::ABNORMAL;
        };
        let Some(inner) = session.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(message) => inner.route(message),
            TransportEvent::Error { code, message } => {
                warn!(?code, %message, "Transport error");
                let _ = inner.events.send(SessionEvent::TransportError { code, message });
            }
            TransportEvent::Closed(code) => break code,
        }
    };
    if let Some(inner) = session.upgrade() {
        inner.closed_by_transport(epoch, code);
    }
}
