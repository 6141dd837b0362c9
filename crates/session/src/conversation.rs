//! Conversation Dispatch
//!
//! A conversation receives the topics routed to it by its session, delivers
//! them to subscribers in arrival order, and remembers the newest message id it
//! has delivered. After a reconnection, [`Conversation::catch_up`] fetches the
//! messages published while the connection was down and delivers the ones
//! that are newer than that position. Live events are held back while the
//! replay runs, so subscribers never see a message twice or out of order.

use crate::{
    error::{ReplayError, SessionError},
    session::SessionInner,
};
use parley_core::{
    ConversationUuid, EventId,
    command::{CommandName, ConversationOptions, OutgoingCommand, SpeechConfig},
    events::ConversationEvent,
    history::{EventKind, EventQuery},
    queue::OrderedQueue,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Handle to a conversation joined on a [`Session`](crate::Session).
///
/// Cheap to clone. Handles stay usable after the conversation is left, but
/// stop receiving events.
#[derive(Clone)]
pub struct Conversation {
    inner: Arc<ConversationInner>,
}

struct ConversationInner {
    uuid: ConversationUuid,
    session: Weak<SessionInner>,
    options: Mutex<ConversationOptions>,
    last_event_id: Mutex<Option<EventId>>,
    inbound: OrderedQueue<ConversationEvent>,
    /// Serializes live delivery with replay.
    delivery: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ConversationEvent>,
}

/// Where a `start` command should begin the story.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub scene_index: Option<u32>,
    pub start_graph_id: Option<u64>,
    pub start_graph_reference_id: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Conversation {
    pub(crate) fn new(uuid: ConversationUuid, session: Weak<SessionInner>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let inner = Arc::new_cyclic(|weak: &Weak<ConversationInner>| {
            let owner = weak.clone();
            let inbound = OrderedQueue::new("inbound", false, move |event: ConversationEvent| {
                let owner = owner.clone();
                async move {
                    if let Some(inner) = owner.upgrade() {
                        inner.deliver(event).await;
                    }
                    Ok::<(), ConversationEvent>(())
                }
            });
            ConversationInner {
                uuid,
                session,
                options: Mutex::default(),
                last_event_id: Mutex::default(),
                inbound,
                delivery: tokio::sync::Mutex::new(()),
                events,
            }
        });
        Self { inner }
    }

    pub fn uuid(&self) -> ConversationUuid {
        self.inner.uuid
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.inner.events.subscribe()
    }

    /// Id of the newest message delivered to subscribers, if any.
    pub fn last_event_id(&self) -> Option<EventId> {
        lock(&self.inner.last_event_id).clone()
    }

    pub fn options(&self) -> ConversationOptions {
        lock(&self.inner.options).clone()
    }

    pub fn set_options(&self, options: ConversationOptions) {
        *lock(&self.inner.options) = options;
    }

    /// Sets or clears the speech preferences attached to later commands.
    pub fn set_speech_config(&self, speech_config: Option<SpeechConfig>) {
        lock(&self.inner.options).speech_config = speech_config;
    }

    /// Holds inbound delivery until the returned guard is dropped.
    pub(crate) fn hold_inbound(&self) -> InboundHold {
        InboundHold {
            paused_here: self.inner.inbound.pause(),
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn dispatch(&self, event: ConversationEvent) {
        if let Err(e) = self.inner.inbound.enqueue(event) {
            error!(conversation_uuid = %self.uuid(), error = %e, "Dropping inbound event");
        }
    }

    pub fn start(&self, options: StartOptions) -> Result<(), SessionError> {
        let mut command = OutgoingCommand::new(CommandName::Start, self.uuid());
        if let Some(scene_index) = options.scene_index {
            command = command.with_field("sceneIndex", scene_index);
        }
        if let Some(start_graph_id) = options.start_graph_id {
            command = command.with_field("startGraphId", start_graph_id);
        }
        if let Some(reference) = options.start_graph_reference_id {
            command = command.with_field("startGraphReferenceId", reference);
        }
        self.send_command(command)
    }

    pub fn reply(&self, text: &str) -> Result<(), SessionError> {
        self.send_command(OutgoingCommand::new(CommandName::Reply, self.uuid()).with_field("text", text))
    }

    /// Sends partial player input, e.g. a live transcription in progress.
    pub fn reply_intermediate(&self, text: &str) -> Result<(), SessionError> {
        self.send_command(
            OutgoingCommand::new(CommandName::ReplyIntermediate, self.uuid()).with_field("text", text),
        )
    }

    pub fn tap(&self) -> Result<(), SessionError> {
        self.send_command(OutgoingCommand::new(CommandName::Tap, self.uuid()))
    }

    pub fn action(&self, action: &str) -> Result<(), SessionError> {
        self.send_command(OutgoingCommand::new(CommandName::Action, self.uuid()).with_field("action", action))
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        self.send_command(OutgoingCommand::new(CommandName::Resume, self.uuid()))
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.send_command(OutgoingCommand::new(CommandName::Pause, self.uuid()))
    }

    pub fn play(&self) -> Result<(), SessionError> {
        self.send_command(OutgoingCommand::new(CommandName::Play, self.uuid()))
    }

    /// Merges this conversation's options into `command` and queues it on the
    /// owning session.
    pub fn send_command(&self, command: OutgoingCommand) -> Result<(), SessionError> {
        let session = self.inner.session.upgrade().ok_or(SessionError::Closed)?;
        session.enqueue(command.merged_with(&self.options()))
    }

    /// Redelivers messages published after [`last_event_id`](Self::last_event_id).
    ///
    /// Returns how many messages were delivered. Live events arriving
    /// meanwhile are held and delivered afterwards, whether or not the replay
    /// succeeds. Without a known position there is nothing to catch up on.
    pub async fn catch_up(&self) -> Result<usize, ReplayError> {
        let Some(min_event_id) = self.last_event_id() else {
            debug!(conversation_uuid = %self.uuid(), "No delivered events yet; skipping replay");
            return Ok(0);
        };
        let session = self.inner.session.upgrade().ok_or(ReplayError::SessionGone)?;
        let history = session.history.clone();
        let token = session.token().as_str().to_string();
        let query = EventQuery {
            conversation_uuid: self.uuid(),
            min_event_id,
            limit: session.config.replay_limit,
            event_types: vec![EventKind::MessageCharacter],
        };
        drop(session);

        let _hold = self.inner.inbound.hold();
        debug!(conversation_uuid = %self.uuid(), min_event_id = %query.min_event_id, "Fetching missed events");
        let events = history.fetch_events(&token, &query).await?;
        if events.is_empty() {
            return Ok(0);
        }

        self.inner.deliver(ConversationEvent::ReplayStart).await;
        let mut replayed = 0;
        for event in events {
            if event.conversation_uuid != self.uuid() {
                warn!(
                    conversation_uuid = %self.uuid(),
                    other = %event.conversation_uuid,
                    "History returned an event for another conversation"
                );
                continue;
            }
            if self.inner.deliver(ConversationEvent::Message(event)).await {
                replayed += 1;
            }
        }
        self.inner.deliver(ConversationEvent::ReplayEnd).await;
        Ok(replayed)
    }
}

/// Owned pause on a conversation's inbound queue, see
/// [`Conversation::hold_inbound`].
pub(crate) struct InboundHold {
    inner: Arc<ConversationInner>,
    paused_here: bool,
}

impl Drop for InboundHold {
    fn drop(&mut self) {
        if self.paused_here {
            self.inner.inbound.resume();
        }
    }
}

impl ConversationInner {
    /// Publishes `event`. Messages at or below the delivered position are
    /// dropped; returns whether the event was published.
    async fn deliver(&self, event: ConversationEvent) -> bool {
        let _turn = self.delivery.lock().await;
        if let ConversationEvent::Message(message) = &event {
            let mut last = lock(&self.last_event_id);
            if last.as_ref().is_some_and(|seen| message.event_id <= *seen) {
                debug!(
                    conversation_uuid = %self.uuid,
                    event_id = %message.event_id,
                    "Skipping already delivered event"
                );
                return false;
            }
            *last = Some(message.event_id.clone());
        }
        let _ = self.events.send(event);
        true
    }
}
