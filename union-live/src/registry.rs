//! Subscriber registry and fan-out.
//!
//! Owned by the engine's control loop; nothing else touches it, so it needs
//! no locking. A subscriber without a connection is tracked but never sent to.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Why a frame could not be handed to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("connection buffer full")]
    Full,
}

/// Outbound half of a live client connection.
///
/// `send_text` must not block: the control loop calls it for every
/// subscriber in turn. Dropping the last handle is the signal for the
/// transport to close the connection.
pub trait Connection: Send + Sync {
    fn send_text(&self, frame: Arc<str>) -> Result<(), SendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("client {0} already exists in real-time list of users")]
    AlreadyJoined(Uuid),
    #[error("client {0} doesn't exist in real-time list of users")]
    NotJoined(Uuid),
}

/// Result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Subscribers without a connection
    pub skipped: usize,
    /// Subscribers whose send failed
    pub failed: Vec<Uuid>,
}

#[derive(Default)]
pub struct Registry {
    clients: HashMap<Uuid, Option<Arc<dyn Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        id: Uuid,
        conn: Option<Arc<dyn Connection>>,
    ) -> Result<(), RegistryError> {
        if self.clients.contains_key(&id) {
            return Err(RegistryError::AlreadyJoined(id));
        }
        self.clients.insert(id, conn);
        Ok(())
    }

    /// Remove `id`, dropping its connection handle.
    pub fn unsubscribe(&mut self, id: Uuid) -> Result<(), RegistryError> {
        self.clients
            .remove(&id)
            .map(drop)
            .ok_or(RegistryError::NotJoined(id))
    }

    /// Send `frame` to every connected subscriber.
    ///
    /// A failed send never stops delivery to the others.
    pub fn broadcast(&self, frame: &Arc<str>) -> Delivery {
        let mut delivery = Delivery::default();
        for (id, conn) in &self.clients {
            match conn {
                Some(conn) => match conn.send_text(frame.clone()) {
                    Ok(()) => delivery.delivered += 1,
                    Err(e) => {
                        log::debug!("Send to {id} failed: {e}");
                        delivery.failed.push(*id);
                    }
                },
                None => delivery.skipped += 1,
            }
        }
        delivery
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.clients.contains_key(id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.clients.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop every subscriber and its connection.
    pub fn clear(&mut self) {
        self.clients.clear();
    }
}
