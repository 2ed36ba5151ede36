//! In-process FIFO stand-in for `NatsQueue`, used by `--dev` mode and by
//! this crate's own test suite (§10.7). A delivered-but-unacked message is
//! tracked so that `nack(true)` can push it back to the front of the queue,
//! matching the broker's requeue semantics without a redelivery timer.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Delivery, DeliveryHandle, Queue, SliceMessage};
use crate::store::error::Result;

pub struct MemoryHandle {
    subject: String,
    message: SliceMessage,
    queues: &'static MemoryQueueInner,
}

impl MemoryHandle {
    pub fn ack(self) -> Result<()> {
        Ok(())
    }

    pub fn nack(self, requeue: bool) -> Result<()> {
        if requeue {
            self.queues.push_front(&self.subject, self.message);
        }
        Ok(())
    }
}

/// Leaked, 'static inner state so `MemoryHandle` can carry a reference
/// without threading a lifetime through `Delivery`/`Queue`. `MemoryQueue`
/// is constructed once per process (dev mode, tests), so the leak is
/// bounded.
struct MemoryQueueInner {
    queues: Mutex<std::collections::HashMap<String, VecDeque<SliceMessage>>>,
}

impl MemoryQueueInner {
    fn push_back(&self, subject: &str, message: SliceMessage) {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(subject.to_string())
            .or_default()
            .push_back(message);
    }

    fn push_front(&self, subject: &str, message: SliceMessage) {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(subject.to_string())
            .or_default()
            .push_front(message);
    }

    fn pop_front(&self, subject: &str) -> Option<SliceMessage> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(subject)
            .and_then(|q| q.pop_front())
    }
}

pub struct MemoryQueue {
    inner: &'static MemoryQueueInner,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let inner = Box::leak(Box::new(MemoryQueueInner {
            queues: Mutex::new(std::collections::HashMap::new()),
        }));
        Self { inner }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(&self, subject: &str, message: SliceMessage) -> Result<()> {
        self.inner.push_back(subject, message);
        Ok(())
    }

    async fn consume_one(&self, subject: &str) -> Result<Option<Delivery>> {
        let Some(message) = self.inner.pop_front(subject) else {
            return Ok(None);
        };
        Ok(Some(Delivery {
            message: message.clone(),
            handle: DeliveryHandle::Memory(MemoryHandle {
                subject: subject.to_string(),
                message,
                queues: self.inner,
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = MemoryQueue::new();
        q.publish("s", SliceMessage { slice_id: 1 }).await.unwrap();
        q.publish("s", SliceMessage { slice_id: 2 }).await.unwrap();

        let first = q.consume_one("s").await.unwrap().unwrap();
        assert_eq!(first.message.slice_id, 1);
        first.ack().await.unwrap();

        let second = q.consume_one("s").await.unwrap().unwrap();
        assert_eq!(second.message.slice_id, 2);
        second.ack().await.unwrap();

        assert!(q.consume_one("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_with_requeue_is_redelivered_first() {
        let q = MemoryQueue::new();
        q.publish("s", SliceMessage { slice_id: 1 }).await.unwrap();
        q.publish("s", SliceMessage { slice_id: 2 }).await.unwrap();

        let first = q.consume_one("s").await.unwrap().unwrap();
        first.nack(true).await.unwrap();

        let redelivered = q.consume_one("s").await.unwrap().unwrap();
        assert_eq!(redelivered.message.slice_id, 1);
        redelivered.ack().await.unwrap();
    }

    #[tokio::test]
    async fn nack_without_requeue_drops_the_message() {
        let q = MemoryQueue::new();
        q.publish("s", SliceMessage { slice_id: 1 }).await.unwrap();

        let first = q.consume_one("s").await.unwrap().unwrap();
        first.nack(false).await.unwrap();

        assert!(q.consume_one("s").await.unwrap().is_none());
    }
}
