use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RelayError;

/// Opaque token correlating one outbound request with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for MessageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no request is waiting under this message id")]
    NotFound,
    #[error("a reply was already delivered under this message id")]
    Duplicate,
    #[error("the waiting request already gave up")]
    WaiterGone,
}

/// A reusable unit of capacity. Holding one is the right to have a request in flight.
#[derive(Debug)]
struct WaitSlot {
    index: usize,
}

struct ActiveSlot {
    slot: WaitSlot,
    reply_tx: Option<oneshot::Sender<String>>,
    reply_rx: Option<oneshot::Receiver<String>>,
}

/// Fixed-capacity table matching asynchronous device replies to waiting HTTP requests.
///
/// Slots move between the idle pool and the active map: `allocate` takes one from
/// the pool (waiting when none is idle), `release` puts it back. A fresh one-shot
/// channel is attached to the slot on every allocation, so each message id accepts
/// exactly one delivery.
pub struct CorrelationTable {
    capacity: usize,
    reply_timeout: Duration,
    allocation_timeout: Option<Duration>,
    pool_tx: mpsc::Sender<WaitSlot>,
    pool_rx: Mutex<mpsc::Receiver<WaitSlot>>,
    active: Mutex<HashMap<MessageId, ActiveSlot>>,
}

impl CorrelationTable {
    /// `allocation_timeout` of `None` makes `allocate` wait for a free slot indefinitely.
    pub fn new(
        capacity: usize,
        reply_timeout: Duration,
        allocation_timeout: Option<Duration>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (pool_tx, pool_rx) = mpsc::channel(capacity);
        for index in 0..capacity {
            // The channel was sized for exactly this many slots.
            let _ = pool_tx.try_send(WaitSlot { index });
        }

        Self {
            capacity,
            reply_timeout,
            allocation_timeout,
            pool_tx,
            pool_rx: Mutex::new(pool_rx),
            active: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Take an idle slot and register it under a fresh message id.
    pub async fn allocate(&self) -> Result<MessageId, RelayError> {
        let slot = match self.allocation_timeout {
            Some(limit) => tokio::time::timeout(limit, self.take_slot())
                .await
                .map_err(|_| RelayError::AllocationTimeout)?,
            None => self.take_slot().await,
        }
        // The table owns a pool sender, so the pool never reports closed.
        .ok_or(RelayError::AllocationTimeout)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let mut active = self.active.lock().await;
        let message_id = loop {
            let id = MessageId::generate();
            if !active.contains_key(&id) {
                break id;
            }
        };

        debug!(message_id = %message_id, slot = slot.index, "slot allocated");
        active.insert(
            message_id.clone(),
            ActiveSlot {
                slot,
                reply_tx: Some(reply_tx),
                reply_rx: Some(reply_rx),
            },
        );

        Ok(message_id)
    }

    async fn take_slot(&self) -> Option<WaitSlot> {
        self.pool_rx.lock().await.recv().await
    }

    /// Hand a reply payload to whoever waits on `message_id`.
    ///
    /// The payload is buffered in the slot, so delivery never blocks even if the
    /// waiter has not started awaiting yet.
    pub async fn deliver(&self, message_id: &str, payload: String) -> Result<(), DeliveryError> {
        let reply_tx = {
            let mut active = self.active.lock().await;
            let slot = active.get_mut(message_id).ok_or(DeliveryError::NotFound)?;
            slot.reply_tx.take().ok_or(DeliveryError::Duplicate)?
        };

        reply_tx.send(payload).map_err(|_| DeliveryError::WaiterGone)
    }

    /// Wait for the reply to `message_id`, up to the configured reply timeout.
    pub async fn await_reply(&self, message_id: &MessageId) -> Result<String, RelayError> {
        let reply_rx = self
            .active
            .lock()
            .await
            .get_mut(message_id)
            .and_then(|slot| slot.reply_rx.take())
            .ok_or_else(|| RelayError::TransportRead(message_id.to_string()))?;

        match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(RelayError::TransportRead(message_id.to_string())),
            Err(_) => Err(RelayError::CorrelationTimeout(message_id.to_string())),
        }
    }

    /// Retire `message_id` and return its slot to the pool. Releasing twice is a no-op.
    pub async fn release(&self, message_id: &MessageId) {
        let Some(active) = self.active.lock().await.remove(message_id) else {
            debug!(message_id = %message_id, "slot already released");
            return;
        };

        let index = active.slot.index;
        match self.pool_tx.try_send(active.slot) {
            Ok(()) => debug!(message_id = %message_id, pooled = self.pooled_count(), "slot released"),
            Err(_) => warn!(slot = index, "correlation pool is full, discarding slot"),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub fn pooled_count(&self) -> usize {
        self.pool_tx.max_capacity() - self.pool_tx.capacity()
    }
}
