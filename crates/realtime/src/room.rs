//! WebSocket Rooms
//!
//! [`WsRoomConnector`] opens rooms over `tokio-tungstenite`. Each open room is
//! owned by a socket task: commands reach it through a channel, and inbound
//! frames are decoded and forwarded as [`TransportEvent`]s until the socket
//! closes.

use crate::protocol::{self, ControlFrame, Frame};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use parley_core::{
    command::OutgoingCommand,
    config::ClientConfig,
    transport::{
        CloseCode, ConnectError, Room, RoomConnector, RoomHandle, RoomIdentity, TransportError,
        TransportEvent,
    },
};
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as WsError,
        protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode as WsCloseCode},
    },
};
use tracing::{Instrument, debug, info, info_span, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything except RFC 3986 unreserved characters.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Opens rooms on the realtime server.
///
/// Joining connects to `{realtime_url}/rooms/join?token=...`; rejoining
/// connects to `{realtime_url}/rooms/{room_id}/rejoin?session_id=...`. Either
/// way the server confirms with a `joined` frame before any topic is sent.
#[derive(Debug, Clone)]
pub struct WsRoomConnector {
    realtime_url: String,
    handshake_timeout: Duration,
}

impl WsRoomConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            realtime_url: config.realtime_url.trim_end_matches('/').to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Bounds both the upgrade and the wait for the `joined` frame.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    async fn open(&self, url: &str, rejoining: Option<&str>) -> Result<RoomHandle, ConnectError> {
        let (mut socket, _) = match timeout(self.handshake_timeout, connect_async(url)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(WsError::Http(response))) => {
                return Err(refused(response.status().as_u16(), rejoining));
            }
            Ok(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
            Err(_) => {
                return Err(ConnectError::Transport(
                    "timed out opening the connection".to_string(),
                ));
            }
        };

        let joined = timeout(self.handshake_timeout, await_joined(&mut socket, rejoining)).await;
        let (room_id, session_id) = match joined {
            Ok(joined) => joined?,
            Err(_) => {
                let _ = socket.close(None).await;
                return Err(ConnectError::Transport(
                    "timed out waiting for the join confirmation".to_string(),
                ));
            }
        };
        info!(%room_id, "Room joined");

        let (outbound, requests) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let span = info_span!("ws_room", %room_id);
        tokio::spawn(run_socket(socket, requests, events_tx).instrument(span));

        let room = WsRoom {
            room_id,
            session_id,
            outbound,
        };
        Ok(RoomHandle {
            room: Arc::new(room),
            events,
        })
    }
}

#[async_trait]
impl RoomConnector for WsRoomConnector {
    async fn join_or_create(&self, identity: &RoomIdentity) -> Result<RoomHandle, ConnectError> {
        debug!(session_uuid = %identity.session_uuid, "Joining room");
        let url = format!(
            "{}/rooms/join?token={}",
            self.realtime_url,
            encode(&identity.token)
        );
        self.open(&url, None).await
    }

    async fn rejoin(&self, room_id: &str, session_id: &str) -> Result<RoomHandle, ConnectError> {
        debug!(%room_id, "Rejoining room");
        let url = format!(
            "{}/rooms/{}/rejoin?session_id={}",
            self.realtime_url,
            encode(room_id),
            encode(session_id)
        );
        self.open(&url, Some(room_id)).await
    }
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, UNRESERVED).to_string()
}

enum Outbound {
    /// A text frame; the sender learns whether it reached the socket.
    Frame(String, oneshot::Sender<Result<(), String>>),
    Close(CloseCode),
}

/// An open room backed by a WebSocket.
pub struct WsRoom {
    room_id: String,
    session_id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl Room for WsRoom {
    fn room_id(&self) -> &str {
        &self.room_id
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, command: &OutgoingCommand) -> Result<(), TransportError> {
        let text = serde_json::to_string(&command.to_wire())?;
        let (written, ack) = oneshot::channel();
        self.outbound
            .send(Outbound::Frame(text, written))
            .map_err(|_| TransportError::Closed)?;
        match ack.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Send(e)),
            // The socket task ended with the frame still queued.
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn close(&self, code: CloseCode) {
        if self.outbound.send(Outbound::Close(code)).is_err() {
            debug!(room_id = %self.room_id, "Room already closed");
        }
    }
}

fn refused(status: u16, rejoining: Option<&str>) -> ConnectError {
    match (status, rejoining) {
        (404, Some(room_id)) => ConnectError::RoomExpired(room_id.to_string()),
        (400..=499, _) => ConnectError::Rejected(format!("server answered {status}")),
        _ => ConnectError::Transport(format!("server answered {status}")),
    }
}

async fn await_joined(
    socket: &mut WsStream,
    rejoining: Option<&str>,
) -> Result<(String, String), ConnectError> {
    while let Some(frame) = socket.next().await {
        match frame.map_err(|e| ConnectError::Transport(e.to_string()))? {
            WsMessage::Text(text) => match protocol::decode(&text) {
                Ok(Frame::Control(ControlFrame::Joined {
                    room_id,
                    session_id,
                })) => return Ok((room_id, session_id)),
                Ok(Frame::Control(ControlFrame::Error { message, .. })) => {
                    return Err(ConnectError::Rejected(message));
                }
                Ok(Frame::Topic(_)) => warn!("Ignoring topic received before the join confirmation"),
                Err(e) => {
                    return Err(ConnectError::Transport(format!("invalid handshake frame: {e}")));
                }
            },
            WsMessage::Close(frame) => {
                let code = frame.map(|f| u16::from(f.code));
                return Err(match (code, rejoining) {
                    (Some(code), Some(room_id)) if code == CloseCode::ROOM_NOT_FOUND.0 => {
                        ConnectError::RoomExpired(room_id.to_string())
                    }
                    (Some(code), _) => {
                        ConnectError::Rejected(format!("closed during handshake with code {code}"))
                    }
                    (None, _) => ConnectError::Transport("closed during handshake".to_string()),
                });
            }
            _ => {}
        }
    }
    Err(ConnectError::Transport(
        "connection ended during handshake".to_string(),
    ))
}

async fn run_socket(
    socket: WsStream,
    mut requests: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut sink, mut stream) = socket.split();
    let code = loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(Outbound::Frame(text, written)) => {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        warn!(error = %e, "Failed to write frame");
                        let _ = written.send(Err(e.to_string()));
                        break CloseCode::ABNORMAL;
                    }
                    let _ = written.send(Ok(()));
                }
                Some(Outbound::Close(code)) => {
                    let frame = CloseFrame {
                        code: WsCloseCode::from(code.0),
                        reason: "".into(),
                    };
                    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                        debug!(error = %e, "Close frame not delivered");
                    }
                    break code;
                }
                None => {
                    let _ = sink.close().await;
                    break CloseCode::NORMAL;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => forward(&events, &text),
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame.map_or(CloseCode::NO_STATUS, |f| CloseCode(u16::from(f.code)));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Connection failed");
                    break CloseCode::ABNORMAL;
                }
                None => break CloseCode::ABNORMAL,
            },
        }
    };
    // Unwritten frames are refused before the closure is reported.
    drop(requests);
    info!(%code, "Room connection closed");
    let _ = events.send(TransportEvent::Closed(code));
}

fn forward(events: &mpsc::UnboundedSender<TransportEvent>, text: &str) {
    let event = match protocol::decode(text) {
        Ok(Frame::Topic(message)) => TransportEvent::Message(message),
        Ok(Frame::Control(ControlFrame::Error { code, message })) => {
            TransportEvent::Error { code, message }
        }
        Ok(Frame::Control(ControlFrame::Joined { .. })) => {
            debug!("Ignoring repeated join confirmation");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Undecodable frame");
            TransportEvent::Error {
                code: None,
                message: format!("undecodable frame: {e}"),
            }
        }
    };
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{command::CommandName, events::InboundMessage};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{
        accept_hdr_async,
        tungstenite::{
            handshake::server::{ErrorResponse, Request, Response},
            http,
        },
    };
    use uuid::Uuid;

    async fn bind() -> (TcpListener, WsRoomConnector) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ClientConfig::with_base_url(&format!("http://127.0.0.1:{port}"));
        let connector = WsRoomConnector::new(&config).with_handshake_timeout(Duration::from_secs(2));
        (listener, connector)
    }

    /// Accepts one upgrade and returns the socket with the requested target.
    async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, String) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut target = String::new();
        let socket = accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                target = request.uri().to_string();
                Ok(response)
            },
        )
        .await
        .unwrap();
        (socket, target)
    }

    fn joined(room_id: &str, session_id: &str) -> WsMessage {
        let frame = json!({ "type": "joined", "roomId": room_id, "sessionId": session_id });
        WsMessage::Text(frame.to_string().into())
    }

    fn close_with(code: u16) -> WsMessage {
        WsMessage::Close(Some(CloseFrame {
            code: WsCloseCode::from(code),
            reason: "".into(),
        }))
    }

    fn identity() -> RoomIdentity {
        RoomIdentity {
            token: "tok".into(),
            session_uuid: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_join_exchanges_frames_until_server_closes() {
        let (listener, connector) = bind().await;
        let conversation_uuid = Uuid::new_v4();
        let server = tokio::spawn(async move {
            let (mut socket, target) = accept(&listener).await;
            socket.send(joined("room-7", "sess-3")).await.unwrap();
            let error = json!({ "type": "error", "code": 429, "message": "slow down" });
            socket.send(WsMessage::Text(error.to_string().into())).await.unwrap();
            let typing = json!({
                "topic": "start-typing",
                "payload": { "conversationUuid": conversation_uuid }
            });
            socket.send(WsMessage::Text(typing.to_string().into())).await.unwrap();

            let command = loop {
                if let WsMessage::Text(text) = socket.next().await.unwrap().unwrap() {
                    break serde_json::from_str::<Value>(&text).unwrap();
                }
            };
            socket.send(close_with(4321)).await.unwrap();
            (target, command)
        });

        let RoomHandle { room, mut events } = connector.join_or_create(&identity()).await.unwrap();
        assert_eq!(room.room_id(), "room-7");
        assert_eq!(room.session_id(), "sess-3");

        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Error {
                code: Some(429),
                message: "slow down".into(),
            }
        );
        match events.recv().await.unwrap() {
            TransportEvent::Message(InboundMessage::StartTyping(typing)) => {
                assert_eq!(typing.conversation_uuid, conversation_uuid);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        room.send(&OutgoingCommand::new(CommandName::Reply, conversation_uuid).with_field("text", "hi"))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Closed(CloseCode(4321))
        );

        let (target, command) = server.await.unwrap();
        assert_eq!(target, "/rooms/join?token=tok");
        assert_eq!(command["command"], "reply");
        assert_eq!(command["payload"]["text"], "hi");
        assert_eq!(
            command["payload"]["conversationUuid"],
            conversation_uuid.to_string()
        );

    }

    #[tokio::test]
    async fn test_rejoin_refused_with_404_means_room_expired() {
        let (listener, connector) = bind().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let refused = accept_hdr_async(
                stream,
                |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
                    Err(http::Response::builder()
                        .status(404)
                        .body(Some("room not found".to_string()))
                        .unwrap())
                },
            )
            .await;
            assert!(refused.is_err());
        });

        let err = connector.rejoin("room-7", "sess-3").await.unwrap_err();
        assert_eq!(err, ConnectError::RoomExpired("room-7".into()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejoin_closed_with_4004_means_room_expired() {
        let (listener, connector) = bind().await;
        let server = tokio::spawn(async move {
            let (mut socket, target) = accept(&listener).await;
            socket.send(close_with(4004)).await.unwrap();
            target
        });

        let err = connector.rejoin("room-7", "sess-3").await.unwrap_err();
        assert_eq!(err, ConnectError::RoomExpired("room-7".into()));
        assert_eq!(server.await.unwrap(), "/rooms/room-7/rejoin?session_id=sess-3");
    }

    #[tokio::test]
    async fn test_rejoin_encodes_server_assigned_ids() {
        let (listener, connector) = bind().await;
        let server = tokio::spawn(async move {
            let (mut socket, target) = accept(&listener).await;
            socket.send(close_with(4004)).await.unwrap();
            target
        });

        let err = connector.rejoin("room 7/../x", "a&b=c").await.unwrap_err();
        assert_eq!(err, ConnectError::RoomExpired("room 7/../x".into()));
        assert_eq!(
            server.await.unwrap(),
            "/rooms/room%207%2F..%2Fx/rejoin?session_id=a%26b%3Dc"
        );
    }

    #[tokio::test]
    async fn test_join_rejected_by_error_frame() {
        let (listener, connector) = bind().await;
        tokio::spawn(async move {
            let (mut socket, _) = accept(&listener).await;
            let error = json!({ "type": "error", "message": "token expired" });
            socket.send(WsMessage::Text(error.to_string().into())).await.unwrap();
        });

        let err = connector.join_or_create(&identity()).await.unwrap_err();
        assert_eq!(err, ConnectError::Rejected("token expired".into()));
    }

    #[tokio::test]
    async fn test_missing_join_confirmation_times_out() {
        let (listener, connector) = bind().await;
        let connector = connector.with_handshake_timeout(Duration::from_millis(200));
        let server = tokio::spawn(async move {
            let (socket, _) = accept(&listener).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let err = connector.join_or_create(&identity()).await.unwrap_err();
        assert!(matches!(err, ConnectError::Transport(_)));
        server.abort();
    }

    #[tokio::test]
    async fn test_dropped_socket_reports_abnormal_closure() {
        let (listener, connector) = bind().await;
        tokio::spawn(async move {
            let (mut socket, _) = accept(&listener).await;
            socket.send(joined("room-1", "sess-1")).await.unwrap();
            drop(socket);
        });

        let RoomHandle { mut events, .. } = connector.join_or_create(&identity()).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Closed(CloseCode::ABNORMAL)
        );
    }

    #[tokio::test]
    async fn test_close_sends_code_to_server() {
        let (listener, connector) = bind().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = accept(&listener).await;
            socket.send(joined("room-1", "sess-1")).await.unwrap();
            while let Some(Ok(frame)) = socket.next().await {
                if let WsMessage::Close(frame) = frame {
                    return frame.map(|f| u16::from(f.code));
                }
            }
            None
        });

        let RoomHandle { room, mut events } = connector.join_or_create(&identity()).await.unwrap();
        room.close(CloseCode::EXPLICIT_DISCONNECT).await;

        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Closed(CloseCode::EXPLICIT_DISCONNECT)
        );
        assert_eq!(server.await.unwrap(), Some(4000));
    }

    #[tokio::test]
    async fn test_send_succeeds_only_for_frames_the_server_can_read() {
        let (listener, connector) = bind().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = accept(&listener).await;
            socket.send(joined("room-1", "sess-1")).await.unwrap();
            socket.send(close_with(1001)).await.unwrap();
            let mut received = 0;
            while let Some(Ok(frame)) = socket.next().await {
                if let WsMessage::Text(_) = frame {
                    received += 1;
                }
            }
            received
        });

        let RoomHandle { room, mut events } = connector.join_or_create(&identity()).await.unwrap();
        let command = OutgoingCommand::new(CommandName::Tap, Uuid::new_v4());
        let mut accepted = 0;
        for _ in 0..200 {
            if room.send(&command).await.is_err() {
                break;
            }
            accepted += 1;
        }

        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Closed(CloseCode(1001))
        );
        assert!(matches!(
            room.send(&command).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(server.await.unwrap(), accepted);
    }
}
