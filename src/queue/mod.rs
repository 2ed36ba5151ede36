//! Durable FIFO queue substrate (C1, spec §4.8).
//!
//! Two named queues exist per zone: `vlan_mapping_<zone>` and
//! `vm_placement_<zone>`. Delivery is exactly-once-effect via prefetch=1,
//! ack-after-commit, and nack-with/without-requeue on transient/permanent
//! faults. `NatsQueue` implements this over JetStream pull consumers
//! (grounded in `cp5337-sx9/crates/sx9-nats-router`, the only message-queue
//! crate anywhere in the retrieved pack); `MemoryQueue` is the in-process
//! stand-in used by `--dev` mode and the test suite.

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryQueue;
pub use nats::NatsQueue;

use crate::store::error::{Result, StoreError};

pub fn vlan_queue_name(zone: crate::domain::Zone) -> String {
    format!("vlan_mapping_{}", zone.as_str())
}

pub fn placement_queue_name(zone: crate::domain::Zone) -> String {
    format!("vm_placement_{}", zone.as_str())
}

/// A queue message: the slice id plus enough context for the consumer to
/// reload authoritative state from the store rather than trust the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceMessage {
    pub slice_id: i64,
}

/// A delivered message plus its ack/nack handle. Dropping a `Delivery`
/// without acking or nacking leaves the broker to redeliver after its
/// visibility timeout -- callers should always resolve one explicitly.
pub struct Delivery {
    pub message: SliceMessage,
    handle: DeliveryHandle,
}

enum DeliveryHandle {
    Nats(async_nats::jetstream::Message),
    Memory(memory::MemoryHandle),
}

impl Delivery {
    /// Acknowledge successful, committed processing (§4.8 "ack only after
    /// the component's work has been committed to the DB").
    pub async fn ack(self) -> Result<()> {
        match self.handle {
            DeliveryHandle::Nats(msg) => msg
                .ack()
                .await
                .map_err(|e| StoreError::DependencyUnavailable(format!("nats ack failed: {e}"))),
            DeliveryHandle::Memory(h) => h.ack(),
        }
    }

    /// Nack a transient fault with requeue, or a permanent fault without
    /// requeue to avoid a poison-message loop (§4.8).
    pub async fn nack(self, requeue: bool) -> Result<()> {
        match self.handle {
            DeliveryHandle::Nats(msg) => {
                use async_nats::jetstream::AckKind;
                let kind = if requeue {
                    AckKind::Nak(None)
                } else {
                    AckKind::Term
                };
                msg.ack_with(kind)
                    .await
                    .map_err(|e| StoreError::DependencyUnavailable(format!("nats nack failed: {e}")))
            }
            DeliveryHandle::Memory(h) => h.nack(requeue),
        }
    }
}

/// Facade over the two queue backends, picked at startup by `--dev`.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(&self, subject: &str, message: SliceMessage) -> Result<()>;

    /// Pull exactly one message (prefetch=1, §4.2 concurrency note), or
    /// `None` if the subject is currently empty.
    async fn consume_one(&self, subject: &str) -> Result<Option<Delivery>>;
}
