//! In-memory rooms and scripted connectors for session tests.

use crate::Session;
use async_trait::async_trait;
use base64::Engine;
use mockall::mock;
use parley_core::{
    ConversationUuid,
    command::{CommandName, OutgoingCommand},
    config::ClientConfig,
    events::{ConnectionStatus, ConversationEvent, InboundMessage, MessageEvent, SessionEvent},
    history::{EventHistory, EventQuery, HistoryError},
    transport::{
        CloseCode, ConnectError, Room, RoomConnector, RoomHandle, RoomIdentity, TransportError,
        TransportEvent,
    },
};
use serde_json::json;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{Notify, broadcast, mpsc},
    time::timeout,
};
use uuid::Uuid;

mock! {
    pub History {}

    #[async_trait]
    impl EventHistory for History {
        async fn fetch_events(
            &self,
            token: &str,
            query: &EventQuery,
        ) -> Result<Vec<MessageEvent>, HistoryError>;
    }
}

pub(crate) fn token_for(session_uuid: Uuid) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    format!(
        "{}.{}.signature",
        engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
        engine.encode(json!({ "playthrough_uuid": session_uuid }).to_string())
    )
}

pub(crate) fn message(conversation_uuid: ConversationUuid, id: u64, text: &str) -> MessageEvent {
    MessageEvent {
        conversation_uuid,
        event_id: id.into(),
        timestamp: None,
        message: json!({ "text": text }),
    }
}

pub(crate) fn test_config() -> ClientConfig {
    ClientConfig::with_base_url("http://localhost:3000")
}

pub(crate) struct Harness {
    pub session: Session,
    pub connector: Arc<ScriptedConnector>,
}

pub(crate) fn harness(history: impl EventHistory + 'static, config: ClientConfig) -> Harness {
    let connector = Arc::new(ScriptedConnector::default());
    let session = Session::new(
        &token_for(Uuid::new_v4()),
        connector.clone(),
        Arc::new(history),
        config,
    )
    .expect("test token parses");
    Harness { session, connector }
}

pub(crate) async fn next_status(events: &mut broadcast::Receiver<SessionEvent>) -> ConnectionStatus {
    loop {
        let event = timeout(Duration::from_secs(600), events.recv())
            .await
            .expect("status change in time")
            .expect("session events still open");
        if let SessionEvent::ConnectionStatus { status } = event {
            return status;
        }
    }
}

pub(crate) async fn next_event(events: &mut broadcast::Receiver<ConversationEvent>) -> ConversationEvent {
    timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("conversation event in time")
        .expect("conversation events still open")
}

pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// A room that records what is sent on it.
pub(crate) struct FakeRoom {
    room_id: String,
    session_id: String,
    sent: Mutex<Vec<OutgoingCommand>>,
    closed: Mutex<Option<CloseCode>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl FakeRoom {
    pub(crate) fn sent(&self) -> Vec<OutgoingCommand> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_names(&self) -> Vec<CommandName> {
        self.sent().iter().map(|command| command.name).collect()
    }

    pub(crate) fn closed_with(&self) -> Option<CloseCode> {
        *self.closed.lock().unwrap()
    }

    pub(crate) fn deliver(&self, message: InboundMessage) {
        let _ = self.events.send(TransportEvent::Message(message));
    }

    /// Simulates the server or the network ending the connection.
    pub(crate) fn drop_connection(&self, code: CloseCode) {
        *self.closed.lock().unwrap() = Some(code);
        let _ = self.events.send(TransportEvent::Closed(code));
    }
}

#[async_trait]
impl Room for FakeRoom {
    fn room_id(&self) -> &str {
        &self.room_id
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, command: &OutgoingCommand) -> Result<(), TransportError> {
        if self.closed.lock().unwrap().is_some() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }

    async fn close(&self, code: CloseCode) {
        let mut closed = self.closed.lock().unwrap();
        if closed.is_none() {
            *closed = Some(code);
            let _ = self.events.send(TransportEvent::Closed(code));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Join,
    Rejoin { room_id: String, session_id: String },
}

/// Scripted answer to one connector call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Reply {
    Open,
    Expired,
    Fail,
}

/// Connector answering from per-operation scripts; unscripted calls succeed.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    joins: Mutex<VecDeque<Reply>>,
    rejoins: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Call>>,
    rooms: Mutex<Vec<Arc<FakeRoom>>>,
    preloaded: Mutex<Vec<InboundMessage>>,
    rejoin_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedConnector {
    pub(crate) fn script_joins(&self, replies: impl IntoIterator<Item = Reply>) {
        self.joins.lock().unwrap().extend(replies);
    }

    pub(crate) fn script_rejoins(&self, replies: impl IntoIterator<Item = Reply>) {
        self.rejoins.lock().unwrap().extend(replies);
    }

    /// Messages the next opened room delivers as soon as it is pumped.
    pub(crate) fn preload(&self, messages: impl IntoIterator<Item = InboundMessage>) {
        self.preloaded.lock().unwrap().extend(messages);
    }

    /// Makes later rejoins wait until the returned `Notify` is notified.
    pub(crate) fn gate_rejoins(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.rejoin_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub(crate) fn opened(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn latest_room(&self) -> Arc<FakeRoom> {
        self.rooms
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a room has been opened")
    }

    fn answer(&self, reply: Reply, room_id: String, session_id: String) -> Result<RoomHandle, ConnectError> {
        match reply {
            Reply::Open => {
                let (events, rx) = mpsc::unbounded_channel();
                for message in self.preloaded.lock().unwrap().drain(..) {
                    let _ = events.send(TransportEvent::Message(message));
                }
                let room = Arc::new(FakeRoom {
                    room_id,
                    session_id,
                    sent: Mutex::default(),
                    closed: Mutex::default(),
                    events,
                });
                self.rooms.lock().unwrap().push(room.clone());
                Ok(RoomHandle { room, events: rx })
            }
            Reply::Expired => Err(ConnectError::RoomExpired(room_id)),
            Reply::Fail => Err(ConnectError::Transport("connection refused".into())),
        }
    }
}

#[async_trait]
impl RoomConnector for ScriptedConnector {
    async fn join_or_create(&self, _identity: &RoomIdentity) -> Result<RoomHandle, ConnectError> {
        self.calls.lock().unwrap().push(Call::Join);
        let reply = self.joins.lock().unwrap().pop_front().unwrap_or(Reply::Open);
        let n = self.rooms.lock().unwrap().len();
        self.answer(reply, format!("room-{n}"), format!("client-{n}"))
    }

    async fn rejoin(&self, room_id: &str, session_id: &str) -> Result<RoomHandle, ConnectError> {
        self.calls.lock().unwrap().push(Call::Rejoin {
            room_id: room_id.to_string(),
            session_id: session_id.to_string(),
        });
        let gate = self.rejoin_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let reply = self.rejoins.lock().unwrap().pop_front().unwrap_or(Reply::Open);
        self.answer(reply, room_id.to_string(), session_id.to_string())
    }
}
