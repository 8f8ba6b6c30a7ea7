//! Broadcast engine: the single control loop that owns the subscriber
//! registry, persists chat messages and fans them out.
//!
//! ```text
//!  join / leave / publish ──► bounded queue ──► ControlLoop ──► Store::append
//!  (any task, fire-and-forget)                     │
//!                                                  └──► Registry::broadcast
//!                                                          │ failed sends
//!                                                          ▼
//!                                                   pending leaves
//! ```
//!
//! Commands are handled one at a time in arrival order, so broadcast order
//! equals publish order and the registry is never seen mid-update.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{ChatMessage, Message, MessageKind, WsData, WsEvent};
use crate::registry::{Connection, Registry, RegistryError, SendError};
use crate::storage::{chat, AppendChatMessage, Partition, Store, StoreError, LAST_BUCKET_KEY};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Commands buffered before `join`/`leave`/`publish` wait (default: 10)
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { queue_capacity: 10 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("unknown message type {0}")]
    UnknownKind(u8),
    #[error("message type {0:?} is not handled by the engine")]
    UnsupportedKind(MessageKind),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid message payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
    #[error("engine is stopped")]
    Stopped,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub events_published: u64,
    pub chat_persisted: u64,
    pub deliveries: u64,
    pub failed_deliveries: u64,
    pub active_subscribers: usize,
}

/// Counters updated by the control loop and read lock-free by handles.
#[derive(Default)]
struct AtomicEngineStats {
    events_published: AtomicU64,
    chat_persisted: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
    active_subscribers: AtomicUsize,
}

impl AtomicEngineStats {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            chat_persisted: self.chat_persisted.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
            active_subscribers: self.active_subscribers.load(Ordering::Relaxed),
        }
    }
}

pub(crate) enum Command {
    Join {
        id: Uuid,
        conn: Option<Arc<dyn Connection>>,
        /// Chat buckets to send before subscribing
        history: Option<usize>,
    },
    Leave(Uuid),
    Publish(WsEvent),
    Subscribers(oneshot::Sender<Vec<Uuid>>),
    Shutdown,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::Sender<Command>,
    stats: Arc<AtomicEngineStats>,
}

impl Engine {
    /// Start the control loop on the current tokio runtime.
    pub fn spawn(store: Arc<Store>, config: EngineConfig) -> (Self, JoinHandle<()>) {
        let (commands, inbox) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(AtomicEngineStats::default());

        let control = ControlLoop {
            store,
            registry: Registry::new(),
            pending_leaves: VecDeque::new(),
            stats: stats.clone(),
        };
        let task = tokio::spawn(control.run(inbox));

        (Self { commands, stats }, task)
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Stopped)
    }

    /// Register `id`. A duplicate id is logged by the loop and ignored.
    pub async fn join(
        &self,
        id: Uuid,
        conn: Option<Arc<dyn Connection>>,
    ) -> Result<(), EngineError> {
        self.send(Command::Join {
            id,
            conn,
            history: None,
        })
        .await
    }

    /// Register `id` after sending it the last `history_buckets` of chat as
    /// one kind-1 frame.
    ///
    /// History and subscription happen in one step of the loop, so every
    /// chat message reaches the client exactly once: either in the history
    /// frame or live.
    pub async fn join_with_history(
        &self,
        id: Uuid,
        conn: Arc<dyn Connection>,
        history_buckets: usize,
    ) -> Result<(), EngineError> {
        self.send(Command::Join {
            id,
            conn: Some(conn),
            history: Some(history_buckets),
        })
        .await
    }

    pub async fn leave(&self, id: Uuid) -> Result<(), EngineError> {
        self.send(Command::Leave(id)).await
    }

    pub async fn publish(&self, event: WsEvent) -> Result<(), EngineError> {
        self.send(Command::Publish(event)).await
    }

    /// Registered subscriber ids, answered after every earlier command.
    pub async fn subscribers(&self) -> Result<Vec<Uuid>, EngineError> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Subscribers(reply)).await?;
        answer.await.map_err(|_| EngineError::Stopped)
    }

    /// Drop every subscriber and stop the loop once earlier commands are done.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.send(Command::Shutdown).await
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }
}

#[cfg(test)]
impl Engine {
    /// Handle with no loop behind it. Commands stay queued in the receiver.
    pub(crate) fn detached(queue_capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (commands, inbox) = mpsc::channel(queue_capacity);
        let stats = Arc::new(AtomicEngineStats::default());
        (Self { commands, stats }, inbox)
    }
}

struct ControlLoop {
    store: Arc<Store>,
    registry: Registry,
    /// Subscribers whose last send failed, removed before the next command
    pending_leaves: VecDeque<Uuid>,
    stats: Arc<AtomicEngineStats>,
}

impl ControlLoop {
    async fn run(mut self, mut inbox: mpsc::Receiver<Command>) {
        log::info!("Engine control loop started");

        while let Some(command) = inbox.recv().await {
            let keep_running = self.handle(command).await;
            self.drain_pending_leaves();
            if !keep_running {
                break;
            }
        }

        let dropped = self.registry.len();
        self.registry.clear();
        self.stats.active_subscribers.store(0, Ordering::Relaxed);
        log::info!("Engine control loop stopped, dropped {dropped} subscribers");
    }

    /// Returns false when the loop should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Join { id, conn, history } => self.join(id, conn, history),
            Command::Leave(id) => self.leave(id),
            Command::Publish(event) => self.publish(event).await,
            Command::Subscribers(reply) => {
                let _ = reply.send(self.registry.ids());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn join(&mut self, id: Uuid, conn: Option<Arc<dyn Connection>>, history: Option<usize>) {
        if self.registry.contains(&id) {
            log::warn!("Join rejected: {}", RegistryError::AlreadyJoined(id));
            return;
        }
        if let (Some(conn), Some(max_buckets)) = (&conn, history) {
            if let Err(e) = self.send_history(conn.as_ref(), max_buckets) {
                // Dropping the handle closes the transport
                log::warn!("History for {id} not delivered, not joining: {e}");
                return;
            }
        }
        match self.registry.subscribe(id, conn) {
            Ok(()) => log::info!("Client {id} joined"),
            Err(e) => log::warn!("Join rejected: {e}"),
        }
        self.sync_subscriber_count();
    }

    fn send_history(&self, conn: &dyn Connection, max_buckets: usize) -> Result<(), EngineError> {
        let history = chat::recent_messages(&self.store, max_buckets)?;
        let frame: Arc<str> = WsData::single(Message::new(MessageKind::ChatHistory, &history)?)
            .encode()?
            .into();
        conn.send_text(frame)?;
        Ok(())
    }

    fn leave(&mut self, id: Uuid) {
        match self.registry.unsubscribe(id) {
            Ok(()) => log::info!("Client {id} left"),
            Err(e) => log::warn!("Leave rejected: {e}"),
        }
        self.sync_subscriber_count();
    }

    fn drain_pending_leaves(&mut self) {
        while let Some(id) = self.pending_leaves.pop_front() {
            log::debug!("Dropping unreachable client {id}");
            self.leave(id);
        }
    }

    fn sync_subscriber_count(&self) {
        self.stats
            .active_subscribers
            .store(self.registry.len(), Ordering::Relaxed);
    }

    async fn publish(&mut self, event: WsEvent) {
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);

        for message in &event.data.data {
            let result = match message.kind() {
                Ok(MessageKind::AddChat) => self.spread_chat(event.id, message).await,
                Ok(kind) => Err(EngineError::UnsupportedKind(kind)),
                Err(code) => Err(EngineError::UnknownKind(code)),
            };
            if let Err(e) = result {
                log::warn!("Message from {} dropped: {e}", event.id);
            }
        }
    }

    /// Stamp, persist, then broadcast one chat message.
    async fn spread_chat(&mut self, sender: Uuid, message: &Message) -> Result<(), EngineError> {
        let mut chat: ChatMessage = message.decode_data()?;
        chat.author_id = Some(sender.to_string());
        chat.time = Some(unix_now());

        let frame: Arc<str> = WsData::single(Message::new(MessageKind::AddChat, &chat)?)
            .encode()?
            .into();

        let outcome = self
            .store
            .append(Partition::Chat, LAST_BUCKET_KEY, AppendChatMessage(chat))
            .await?;
        if outcome.rolled_over {
            if let Ok(bucket) = Uuid::from_slice(&outcome.bucket) {
                log::debug!("Chat log rolled over to bucket {bucket}");
            }
        }
        self.stats.chat_persisted.fetch_add(1, Ordering::Relaxed);

        let delivery = self.registry.broadcast(&frame);
        self.stats
            .deliveries
            .fetch_add(delivery.delivered as u64, Ordering::Relaxed);
        self.stats
            .failed_deliveries
            .fetch_add(delivery.failed.len() as u64, Ordering::Relaxed);
        self.pending_leaves.extend(delivery.failed);

        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
