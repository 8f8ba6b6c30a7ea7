//! # union-live: persistence and live fan-out for the trading union
//!
//! Stores proposals, users and the chat log in an embedded RocksDB database
//! and relays chat messages between connected WebSocket clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ client      │ ◄────────────────► │ LiveServer  │
//! │ (browser)   │     JSON frames    │ (transport) │
//! └─────────────┘                    └──────┬──────┘
//!                                           │ join / leave / publish
//!                                           ▼
//!                                    ┌─────────────┐
//!                                    │ Engine      │──► Registry (fan-out)
//!                                    │ (1 loop)    │
//!                                    └──────┬──────┘
//!                                           │ append
//!                                           ▼
//!                                    ┌─────────────┐
//!                                    │ Store       │──► SerialWriter (1 thread)
//!                                    │ (RocksDB)   │
//!                                    └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope (`WsData` / `Message` / `ChatMessage`)
//! - [`storage`]: partitioned store, serialized writer, chat buckets
//! - [`registry`]: subscriber map and broadcast
//! - [`engine`]: control loop tying registry and store together
//! - [`server`]: WebSocket transport

pub mod engine;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use engine::{Engine, EngineConfig, EngineError, EngineStats};
pub use protocol::{ChatMessage, Message, MessageKind, WsData, WsEvent};
pub use registry::{Connection, Delivery, Registry, RegistryError, SendError};
pub use server::{LiveServer, ServerConfig, ServerStats, WsConnection};
pub use storage::{
    AppendChatMessage, AppendOutcome, BucketModifier, ChatBucket, Modifier, Overwrite, Partition,
    Store, StoreConfig, StoreError, LAST_BUCKET_KEY, MAX_BUCKET_SIZE,
};
