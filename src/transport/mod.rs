//! Chat transport controller.
//!
//! Keeps one conversation's visible history in sync with the backend over two paths: a live
//! push channel that reconnects forever on a fixed delay, and a silent history refresh on a
//! fixed interval. Sends go over the live channel when it is open and over HTTP otherwise.
//!
//! Every task spawned for a conversation carries that conversation's generation number and
//! only mutates state while the generation is still the active one, so a torn down
//! conversation can never write into its successor.

pub mod history;

use futures::StreamExt;
use log::{ debug, error, info, warn };
use std::fmt;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{ broadcast, mpsc };
use tokio::task::AbortHandle;
use tokio::time::{ interval_at, sleep, Instant, MissedTickBehavior };

use crate::api::{ ApiError, MessageApi };
use crate::live::{ LiveConnector, LiveLink };
use crate::models::chat::{ room_name, Message, OutgoingMessage };
use crate::models::websocket::{ decode_frame, InboundFrame };
use self::history::History;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3);
const EVENT_BUFFER: usize = 256;

pub const HISTORY_LOAD_FAILED: &str = "Unable to load previous messages.";
pub const LIVE_INTERRUPTED: &str = "Live connection interrupted. Retrying...";
pub const LIVE_UNREACHABLE: &str = "Unable to reach the live server. Retrying...";
pub const SEND_FAILED: &str = "Unable to send message. Check your connection.";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Error,
    #[default]
    Closed,
}

impl ConnectionStatus {
    /// Short badge text for the chat header.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Open => "Live",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Error | ConnectionStatus::Closed => "Offline",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Change notifications for whoever renders the conversation.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    HistoryReplaced,
    MessageAppended(Message),
    StatusChanged(ConnectionStatus),
    AdvisoryChanged(Option<String>),
    HistoryErrorChanged(Option<String>),
    LoadingChanged(bool),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SendOutcome {
    /// Nothing to send after trimming.
    Skipped,
    /// Queued on the live channel; shows up once echoed or refreshed.
    Live,
    /// Stored through the HTTP endpoint and merged into history.
    Fallback(Message),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no conversation is open")]
    NoConversation,

    #[error("{advisory}")]
    SendFailed {
        advisory: String,
        #[source]
        source: ApiError,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatSnapshot {
    pub room: Option<String>,
    pub peer: Option<String>,
    pub messages: Vec<Message>,
    pub status: ConnectionStatus,
    pub loading: bool,
    pub history_error: Option<String>,
    pub advisory: Option<String>,
}

struct Conversation {
    generation: u64,
    room: String,
    peer: String,
    history: History,
    status: ConnectionStatus,
    loading: bool,
    history_error: Option<String>,
    advisory: Option<String>,
    live: Option<mpsc::Sender<String>>,
    tasks: Vec<AbortHandle>,
}

impl Conversation {
    fn new(generation: u64, room: String, peer: String) -> Self {
        Self {
            generation,
            room,
            peer,
            history: History::new(),
            status: ConnectionStatus::Connecting,
            loading: true,
            history_error: None,
            advisory: None,
            live: None,
            tasks: Vec::new(),
        }
    }

    /// Cancels the reconnect loop and the refresh ticker; dropping the sender closes the socket.
    fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        debug!("Tore down room {} (generation {})", self.room, self.generation);
    }
}

#[derive(Default)]
struct Shared {
    next_generation: u64,
    active: Option<Conversation>,
}

struct Inner {
    local_user: String,
    api: Arc<dyn MessageApi>,
    connector: Arc<dyn LiveConnector>,
    state: Mutex<Shared>,
    events: broadcast::Sender<TransportEvent>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn with_current<R>(&self, generation: u64, f: impl FnOnce(&mut Conversation) -> R) -> Option<R> {
        let mut state = self.state();
        match state.active.as_mut() {
            Some(conversation) if conversation.generation == generation => Some(f(conversation)),
            _ => None,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.with_current(generation, |_| ()).is_some()
    }

    fn set_status(&self, generation: u64, status: ConnectionStatus) {
        let changed = self
            .with_current(generation, |c| std::mem::replace(&mut c.status, status) != status)
            .unwrap_or(false);
        if changed {
            debug!("Live channel status -> {}", status);
            self.emit(TransportEvent::StatusChanged(status));
        }
    }

    fn set_advisory(&self, generation: u64, advisory: Option<String>) {
        let changed = self
            .with_current(generation, |c| {
                if c.advisory == advisory {
                    false
                } else {
                    c.advisory = advisory.clone();
                    true
                }
            })
            .unwrap_or(false);
        if changed {
            self.emit(TransportEvent::AdvisoryChanged(advisory));
        }
    }

    fn set_history_error(&self, generation: u64, history_error: Option<String>) {
        let changed = self
            .with_current(generation, |c| {
                if c.history_error == history_error {
                    false
                } else {
                    c.history_error = history_error.clone();
                    true
                }
            })
            .unwrap_or(false);
        if changed {
            self.emit(TransportEvent::HistoryErrorChanged(history_error));
        }
    }

    fn set_loading(&self, generation: u64, loading: bool) {
        let changed = self
            .with_current(generation, |c| std::mem::replace(&mut c.loading, loading) != loading)
            .unwrap_or(false);
        if changed {
            self.emit(TransportEvent::LoadingChanged(loading));
        }
    }

    fn replace_history(&self, generation: u64, messages: Vec<Message>) {
        if self.with_current(generation, |c| c.history.replace(messages)).is_some() {
            self.emit(TransportEvent::HistoryReplaced);
        }
    }

    fn merge_message(&self, generation: u64, message: Message) -> bool {
        let event = message.clone();
        let appended = self
            .with_current(generation, |c| c.history.merge(message))
            .unwrap_or(false);
        if appended {
            self.emit(TransportEvent::MessageAppended(event));
        }
        appended
    }

    async fn load_history(&self, generation: u64, room: &str, silent: bool) {
        if !silent {
            self.set_loading(generation, true);
        }
        match self.api.fetch_messages(room).await {
            Ok(messages) => {
                debug!("Fetched {} messages for room {}", messages.len(), room);
                self.replace_history(generation, messages);
                self.set_history_error(generation, None);
            }
            Err(e) if silent => {
                warn!("Background history refresh for room {} failed: {}", room, e);
            }
            Err(e) => {
                error!("Failed to load history for room {}: {}", room, e);
                self.set_history_error(generation, Some(HISTORY_LOAD_FAILED.to_string()));
            }
        }
        if !silent {
            self.set_loading(generation, false);
        }
    }

    fn receive_frame(&self, generation: u64, room: &str, text: &str) {
        match decode_frame(text) {
            Ok(InboundFrame::Message(message)) => {
                if !self.merge_message(generation, message) {
                    debug!("Dropped duplicate live message on room {}", room);
                }
            }
            Ok(InboundFrame::Detail(detail)) => {
                warn!("Server advisory on room {}: {}", room, detail);
            }
            Err(e) => {
                error!("Failed to parse live frame on room {}: {}", room, e);
            }
        }
    }

    async fn connect_live(&self, generation: u64, room: &str, resync: bool) {
        self.set_status(generation, ConnectionStatus::Connecting);
        self.set_advisory(generation, None);

        let LiveLink { sender, mut frames } = match self.connector.connect(room).await {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to create live channel for room {}: {}", room, e);
                self.set_status(generation, ConnectionStatus::Error);
                self.set_advisory(generation, Some(LIVE_UNREACHABLE.to_string()));
                return;
            }
        };
        if self.with_current(generation, |c| c.live = Some(sender)).is_none() {
            return;
        }
        self.set_status(generation, ConnectionStatus::Open);
        self.set_advisory(generation, None);
        info!("Live channel open for room {}", room);

        if resync {
            self.load_history(generation, room, true).await;
        }

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(text) => self.receive_frame(generation, room, &text),
                Err(e) => {
                    error!("Live channel error on room {}: {}", room, e);
                    self.set_status(generation, ConnectionStatus::Error);
                    self.set_advisory(generation, Some(LIVE_INTERRUPTED.to_string()));
                    break;
                }
            }
        }

        self.with_current(generation, |c| {
            c.live = None;
        });
        self.set_status(generation, ConnectionStatus::Closed);
        info!("Live channel for room {} closed", room);
    }

    async fn run_live(self: Arc<Self>, generation: u64, room: String) {
        let mut reconnecting = false;
        while self.is_current(generation) {
            self.connect_live(generation, &room, reconnecting).await;
            if !self.is_current(generation) {
                break;
            }
            debug!("Reconnecting room {} in {:?}", room, RECONNECT_DELAY);
            sleep(RECONNECT_DELAY).await;
            reconnecting = true;
        }
    }

    async fn run_refresh(self: Arc<Self>, generation: u64, room: String) {
        let mut ticker = interval_at(Instant::now() + REFRESH_INTERVAL, REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.is_current(generation) {
                break;
            }
            self.load_history(generation, &room, true).await;
        }
    }
}

/// Drives one two-party conversation at a time for `local_user`.
///
/// Must be used from within a tokio runtime: opening a conversation spawns its tasks.
pub struct ChatTransport {
    inner: Arc<Inner>,
}

impl ChatTransport {
    pub fn new(
        local_user: impl Into<String>,
        api: Arc<dyn MessageApi>,
        connector: Arc<dyn LiveConnector>
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                local_user: local_user.into(),
                api,
                connector,
                state: Mutex::new(Shared::default()),
                events,
            }),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.inner.local_user
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Switches to the conversation with `peer` and returns its room name.
    ///
    /// The previous conversation, if any, is torn down first. Re-opening the active peer
    /// keeps the current state.
    pub fn open_conversation(&self, peer: &str) -> String {
        let room = room_name(&self.inner.local_user, peer);
        let generation = {
            let mut state = self.inner.state();
            if state.active.as_ref().map_or(false, |c| c.room == room) {
                return room;
            }
            if let Some(previous) = state.active.take() {
                info!("Leaving room {}", previous.room);
                previous.shutdown();
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.active = Some(Conversation::new(generation, room.clone(), peer.to_string()));
            generation
        };
        info!("Opening conversation with {} in room {}", peer, room);
        self.inner.emit(TransportEvent::HistoryReplaced);
        self.inner.emit(TransportEvent::StatusChanged(ConnectionStatus::Connecting));
        self.inner.emit(TransportEvent::LoadingChanged(true));

        let initial = {
            let inner = Arc::clone(&self.inner);
            let room = room.clone();
            tokio::spawn(async move {
                inner.load_history(generation, &room, false).await;
            })
        };
        let live = tokio::spawn(Arc::clone(&self.inner).run_live(generation, room.clone()));
        let refresh = tokio::spawn(Arc::clone(&self.inner).run_refresh(generation, room.clone()));

        let mut handles = Some(
            vec![initial.abort_handle(), live.abort_handle(), refresh.abort_handle()]
        );
        self.inner.with_current(generation, |c| {
            if let Some(handles) = handles.take() {
                c.tasks.extend(handles);
            }
        });
        // Superseded before the tasks could be registered.
        if let Some(orphans) = handles {
            for task in orphans {
                task.abort();
            }
        }
        room
    }

    /// Tears down the active conversation: timers cancelled, live channel closed.
    pub fn close_conversation(&self) {
        let previous = self.inner.state().active.take();
        if let Some(conversation) = previous {
            info!("Closing conversation in room {}", conversation.room);
            conversation.shutdown();
        }
    }

    pub async fn load_history(&self, silent: bool) -> Result<(), TransportError> {
        let (generation, room) = self.current().ok_or(TransportError::NoConversation)?;
        self.inner.load_history(generation, &room, silent).await;
        Ok(())
    }

    pub async fn send_message(&self, text: &str) -> Result<SendOutcome, TransportError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(SendOutcome::Skipped);
        }
        let payload = OutgoingMessage {
            text: trimmed.to_string(),
            sender: self.inner.local_user.clone(),
        };

        let (generation, room, live) = {
            let state = self.inner.state();
            let conversation = state.active.as_ref().ok_or(TransportError::NoConversation)?;
            let live = match (&conversation.live, conversation.status) {
                (Some(sender), ConnectionStatus::Open) if !sender.is_closed() =>
                    Some(sender.clone()),
                _ => None,
            };
            (conversation.generation, conversation.room.clone(), live)
        };

        if let Some(sender) = live {
            let frame = serde_json::to_string(&payload)?;
            match sender.try_send(frame) {
                Ok(()) => {
                    debug!("Sent message to room {} over live channel", room);
                    return Ok(SendOutcome::Live);
                }
                Err(e) => {
                    warn!("Live channel for room {} not writable ({}), using HTTP", room, e);
                }
            }
        }

        match self.inner.api.post_message(&room, &payload).await {
            Ok(stored) => {
                debug!("Sent message to room {} over HTTP", room);
                self.inner.merge_message(generation, stored.clone());
                self.inner.set_advisory(generation, None);
                Ok(SendOutcome::Fallback(stored))
            }
            Err(source) => {
                let advisory = source.detail().unwrap_or(SEND_FAILED).to_string();
                error!("Failed to send message to room {}: {}", room, source);
                self.inner.set_advisory(generation, Some(advisory.clone()));
                Err(TransportError::SendFailed { advisory, source })
            }
        }
    }

    fn current(&self) -> Option<(u64, String)> {
        self.inner
            .state()
            .active.as_ref()
            .map(|c| (c.generation, c.room.clone()))
    }

    pub fn room(&self) -> Option<String> {
        self.current().map(|(_, room)| room)
    }

    pub fn status(&self) -> Option<ConnectionStatus> {
        self.inner
            .state()
            .active.as_ref()
            .map(|c| c.status)
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let state = self.inner.state();
        match &state.active {
            Some(c) =>
                ChatSnapshot {
                    room: Some(c.room.clone()),
                    peer: Some(c.peer.clone()),
                    messages: c.history.messages().to_vec(),
                    status: c.status,
                    loading: c.loading,
                    history_error: c.history_error.clone(),
                    advisory: c.advisory.clone(),
                },
            None => ChatSnapshot::default(),
        }
    }
}

impl Drop for ChatTransport {
    fn drop(&mut self) {
        self.close_conversation();
    }
}
