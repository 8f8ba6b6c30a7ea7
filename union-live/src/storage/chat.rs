//! Chat log layout inside the `chat` partition.
//!
//! ```text
//!  key 0x00 ──► head bucket id
//!                   │
//!                   ▼
//!  ┌──────────────────────┐  previous  ┌──────────────────────┐  previous
//!  │ bucket (≤30 msgs)    │ ─────────► │ bucket (30 msgs)     │ ─────────► ...
//!  └──────────────────────┘            └──────────────────────┘
//! ```
//!
//! Buckets are keyed by the raw 16 bytes of a UUID and hold JSON
//! `{"messages": [...], "previous": "<uuid>"|null}`. Only the head bucket is
//! ever rewritten; once a bucket is full it is immutable.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::modifier::{BucketModifier, Modifier};
use super::store::{Partition, Store, StoreError, WriteTxn};
use crate::protocol::ChatMessage;

/// Key of the last-bucket pointer.
pub const LAST_BUCKET_KEY: &[u8] = &[0];

/// Messages per bucket before a new one is started.
pub const MAX_BUCKET_SIZE: usize = 30;

/// Upper bound on buckets returned by [`history`].
pub const HISTORY_MAX_BUCKETS: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatBucket {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub previous: Option<Uuid>,
}

impl ChatBucket {
    pub fn is_full(&self) -> bool {
        self.messages.len() >= MAX_BUCKET_SIZE
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// Appends one message to the head bucket, rolling over when it is full.
#[derive(Debug, Clone)]
pub struct AppendChatMessage(pub ChatMessage);

impl Modifier for AppendChatMessage {
    fn apply(&self, current: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut bucket = ChatBucket::decode(current)?;
        if bucket.is_full() {
            return Err(StoreError::BucketFull);
        }
        bucket.messages.push(self.0.clone());
        bucket.encode()
    }
}

impl BucketModifier for AppendChatMessage {
    fn start_bucket(&self, previous: &[u8]) -> Result<Vec<u8>, StoreError> {
        ChatBucket {
            messages: vec![self.0.clone()],
            previous: Some(bucket_id(previous)?),
        }
        .encode()
    }
}

fn bucket_id(bytes: &[u8]) -> Result<Uuid, StoreError> {
    Uuid::from_slice(bytes)
        .map_err(|e| StoreError::Deserialization(format!("invalid bucket id: {e}")))
}

/// Create an empty head bucket and point at it, unless the pointer exists.
///
/// Returns whether anything was written.
pub(crate) fn seed(txn: &mut WriteTxn<'_>) -> Result<bool, StoreError> {
    match txn.get(Partition::Chat, LAST_BUCKET_KEY) {
        Ok(_) => Ok(false),
        Err(StoreError::NotFound(_)) => {
            let id = Uuid::new_v4();
            txn.put(Partition::Chat, id.as_bytes(), &ChatBucket::default().encode()?)?;
            txn.put(Partition::Chat, LAST_BUCKET_KEY, id.as_bytes())?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Id of the current head bucket.
pub fn head(store: &Store) -> Result<Uuid, StoreError> {
    bucket_id(&store.read(Partition::Chat, LAST_BUCKET_KEY)?)
}

/// Read one bucket; `None` reads the head.
pub fn read_bucket(store: &Store, id: Option<Uuid>) -> Result<(Uuid, ChatBucket), StoreError> {
    let id = match id {
        Some(id) => id,
        None => head(store)?,
    };
    let bucket = ChatBucket::decode(&store.read(Partition::Chat, id.as_bytes())?)?;
    Ok((id, bucket))
}

/// Walk back from the head, newest bucket first.
///
/// Stops after `max_buckets` (capped at [`HISTORY_MAX_BUCKETS`]) or at the
/// oldest bucket. Each bucket is a separate snapshot read; full buckets never
/// change, so a concurrent rollover can only make the head stale.
pub fn history(store: &Store, max_buckets: usize) -> Result<Vec<(Uuid, ChatBucket)>, StoreError> {
    let limit = max_buckets.min(HISTORY_MAX_BUCKETS);
    let mut buckets = Vec::with_capacity(limit);
    let mut next = if limit > 0 { Some(head(store)?) } else { None };

    while let Some(id) = next {
        let (id, bucket) = read_bucket(store, Some(id))?;
        next = bucket.previous;
        buckets.push((id, bucket));
        if buckets.len() >= limit {
            break;
        }
    }

    Ok(buckets)
}

/// Messages from [`history`] flattened oldest first.
pub fn recent_messages(store: &Store, max_buckets: usize) -> Result<Vec<ChatMessage>, StoreError> {
    Ok(history(store, max_buckets)?
        .into_iter()
        .rev()
        .flat_map(|(_, bucket)| bucket.messages)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> ChatMessage {
        ChatMessage::new(text)
    }

    #[test]
    fn test_apply_appends_in_place() {
        let bucket = ChatBucket::default().encode().unwrap();
        let updated = AppendChatMessage(msg("hi")).apply(&bucket).unwrap();
        let decoded = ChatBucket::decode(&updated).unwrap();
        assert_eq!(decoded.messages, vec![msg("hi")]);
        assert!(decoded.previous.is_none());
    }

    #[test]
    fn test_apply_reports_full() {
        let full = ChatBucket {
            messages: (0..MAX_BUCKET_SIZE).map(|i| msg(&i.to_string())).collect(),
            previous: None,
        };
        let err = AppendChatMessage(msg("overflow"))
            .apply(&full.encode().unwrap())
            .unwrap_err();
        assert!(matches!(err, StoreError::BucketFull));
    }

    #[test]
    fn test_start_bucket_links_previous() {
        let previous = Uuid::new_v4();
        let bytes = AppendChatMessage(msg("first"))
            .start_bucket(previous.as_bytes())
            .unwrap();
        let bucket = ChatBucket::decode(&bytes).unwrap();
        assert_eq!(bucket.messages, vec![msg("first")]);
        assert_eq!(bucket.previous, Some(previous));
    }

    #[test]
    fn test_start_bucket_rejects_bad_key() {
        let err = AppendChatMessage(msg("x")).start_bucket(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, StoreError::Deserialization(_)));
    }

    #[test]
    fn test_bucket_json_layout() {
        let prev = Uuid::new_v4();
        let bucket = ChatBucket {
            messages: vec![msg("a")],
            previous: Some(prev),
        };
        let json: serde_json::Value = serde_json::from_slice(&bucket.encode().unwrap()).unwrap();
        assert_eq!(json["previous"], prev.to_string());
        assert_eq!(json["messages"][0]["text"], "a");
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            ChatBucket::decode(b"\xff\x00"),
            Err(StoreError::Deserialization(_))
        ));
    }

    #[tokio::test]
    async fn test_store_seeds_empty_head() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(crate::storage::StoreConfig::for_testing(dir.path())).unwrap();

        let (id, bucket) = read_bucket(&store, None).unwrap();
        assert_eq!(id, head(&store).unwrap());
        assert!(bucket.messages.is_empty());
        assert!(bucket.previous.is_none());

        store.close().await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_seeded_head() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::storage::StoreConfig::for_testing(dir.path());

        let first = {
            let store = Store::open(config.clone()).unwrap();
            let id = head(&store).unwrap();
            store.close().await;
            id
        };
        let store = Store::open(config).unwrap();
        assert_eq!(head(&store).unwrap(), first);
        store.close().await;
    }

    #[tokio::test]
    async fn test_history_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(crate::storage::StoreConfig::for_testing(dir.path())).unwrap();

        for i in 0..(MAX_BUCKET_SIZE * 3 + 1) {
            store
                .append(Partition::Chat, LAST_BUCKET_KEY, AppendChatMessage(msg(&i.to_string())))
                .await
                .unwrap();
        }

        assert_eq!(history(&store, 2).unwrap().len(), 2);
        let all = history(&store, 100).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all[3].1.previous.is_none());
        assert!(history(&store, 0).unwrap().is_empty());

        let messages = recent_messages(&store, 100).unwrap();
        assert_eq!(messages.len(), MAX_BUCKET_SIZE * 3 + 1);
        assert_eq!(messages[0].text, "0");
        assert_eq!(messages.last().unwrap().text, (MAX_BUCKET_SIZE * 3).to_string());

        store.close().await;
    }
}
