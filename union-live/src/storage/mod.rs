//! Persistent storage layer.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   read (direct)    ┌──────────────────────────────┐
//! │ readers (N) │ ─────────────────► │ RocksDB                       │
//! └─────────────┘                    │  CF "proposals"               │
//! ┌─────────────┐  write / modify /  │  CF "users"                   │
//! │ callers     │  append            │  CF "chat"  (+ 0x00 pointer)  │
//! └──────┬──────┘                    │  CF "dynamic"                 │
//!        │ bounded queue             │  CF "private"                 │
//!        ▼                           └──────────────▲───────────────┘
//! ┌──────────────┐      WriteBatch                  │
//! │ SerialWriter │ ─────────────────────────────────┘
//! │ (1 thread)   │
//! └──────────────┘
//! ```

pub mod chat;
pub mod modifier;
pub mod store;
pub mod writer;

pub use chat::{AppendChatMessage, ChatBucket, LAST_BUCKET_KEY, MAX_BUCKET_SIZE};
pub use modifier::{BucketModifier, Modifier, Overwrite};
pub use store::{AppendOutcome, Partition, Store, StoreConfig, StoreError, WriteTxn};
pub use writer::SerialWriter;
