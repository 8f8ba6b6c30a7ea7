//! WebSocket transport for the broadcast engine.
//!
//! Architecture:
//! ```text
//! Client A ──┐  text frames   ┌────────────┐  append   ┌───────┐
//!            ├──────────────► │ Engine     │ ────────► │ Store │
//! Client B ──┘                │ (1 loop)   │           └───────┘
//!     ▲                       └─────┬──────┘
//!     │  WsConnection (bounded)     │ broadcast
//!     └─────────────────────────────┘
//! ```
//!
//! Each connection gets a fresh subscriber id and joins the engine, which
//! queues the recent chat history as one kind-1 frame ahead of any live
//! frame. Every inbound text frame is then published to the engine.
//! Outbound frames go through a bounded per-connection queue so the engine
//! never waits on a slow socket, and the queue keeps draining while a
//! publish waits for room in the engine.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use uuid::Uuid;

use crate::engine::{Engine, EngineConfig, EngineStats};
use crate::protocol::{WsData, WsEvent};
use crate::registry::{Connection, SendError};
use crate::storage::Store;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection before sends fail as full
    pub connection_buffer: usize,
    /// Chat buckets sent to a client when it connects
    pub history_buckets: usize,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            connection_buffer: 64,
            history_buckets: 1,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, with the bind address taken from `UNION_BIND_ADDR` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("UNION_BIND_ADDR") {
            config.bind_addr = addr;
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub engine: EngineStats,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
}

/// Outbound side of one WebSocket, as seen by the engine.
///
/// Frames are queued without waiting; the connection task drains the queue
/// into the socket. When the last handle is dropped the socket is closed.
pub struct WsConnection {
    frames: mpsc::Sender<Arc<str>>,
}

impl WsConnection {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (frames, rx) = mpsc::channel(buffer.max(1));
        (Self { frames }, rx)
    }
}

impl Connection for WsConnection {
    fn send_text(&self, frame: Arc<str>) -> Result<(), SendError> {
        self.frames.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// How a connection's pump loop ended.
enum Exit {
    /// The client went away; it is still registered
    ClientClosed,
    /// The engine dropped the subscriber
    Dropped,
}

/// The live server.
pub struct LiveServer {
    config: ServerConfig,
    store: Arc<Store>,
    engine: Engine,
    engine_task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<AtomicServerStats>,
}

impl LiveServer {
    /// Create the server and start its engine. Call from an async runtime.
    pub fn new(config: ServerConfig, store: Arc<Store>) -> Self {
        let (engine, engine_task) = Engine::spawn(store.clone(), config.engine.clone());
        Self {
            config,
            store,
            engine,
            engine_task: Mutex::new(Some(engine_task)),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address and serve until an accept fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Live server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, engine, config, stats).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Engine,
        config: ServerConfig,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let id = Uuid::new_v4();
        log::info!("WebSocket connection established from {addr} as {id}");

        let (conn, mut frames) = WsConnection::channel(config.connection_buffer);
        engine
            .join_with_history(id, Arc::new(conn), config.history_buckets)
            .await?;

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let exit = Self::pump(
            id,
            addr,
            &engine,
            &stats,
            &mut ws_sender,
            &mut ws_receiver,
            &mut frames,
        )
        .await;

        stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        if !matches!(exit, Ok(Exit::Dropped)) {
            if let Err(e) = engine.leave(id).await {
                log::debug!("Leave for {id} not delivered: {e}");
            }
        }
        exit.map(|_| ())
    }

    /// Shuttle frames between the socket and the engine until either side ends.
    async fn pump<S, R>(
        id: Uuid,
        addr: SocketAddr,
        engine: &Engine,
        stats: &AtomicServerStats,
        ws_sender: &mut S,
        ws_receiver: &mut R,
        frames: &mut mpsc::Receiver<Arc<str>>,
    ) -> Result<Exit, BoxError>
    where
        S: futures_util::Sink<WsMessage, Error = tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            let data = match WsData::decode(text.as_str()) {
                                Ok(data) => data,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {id}: {e}");
                                    continue;
                                }
                            };
                            // Keep draining outbound frames while the engine queue is full
                            let publish = engine.publish(WsEvent { id, data });
                            tokio::pin!(publish);
                            loop {
                                tokio::select! {
                                    sent = &mut publish => {
                                        sent?;
                                        break;
                                    }
                                    frame = frames.recv() => {
                                        if !Self::forward(id, frame, ws_sender).await? {
                                            return Ok(Exit::Dropped);
                                        }
                                    }
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(Exit::ClientClosed);
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(Exit::ClientClosed);
                        }
                        _ => {}
                    }
                }

                frame = frames.recv() => {
                    if !Self::forward(id, frame, ws_sender).await? {
                        return Ok(Exit::Dropped);
                    }
                }
            }
        }
    }

    /// Write one queued frame to the socket. Returns false once the engine
    /// has dropped the subscriber and the close frame is sent.
    async fn forward<S>(
        id: Uuid,
        frame: Option<Arc<str>>,
        ws_sender: &mut S,
    ) -> Result<bool, BoxError>
    where
        S: futures_util::Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    {
        match frame {
            Some(frame) => {
                ws_sender.send(WsMessage::text(frame.to_string())).await?;
                Ok(true)
            }
            None => {
                log::info!("Client {id} dropped by engine, closing");
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                Ok(false)
            }
        }
    }

    /// Stop the engine, closing every live connection. Idempotent.
    pub async fn shutdown(&self) {
        if let Err(e) = self.engine.shutdown().await {
            log::debug!("Engine already stopped: {e}");
        }
        let task = self
            .engine_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Engine task failed: {e}");
            }
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            engine: self.engine.stats(),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}
