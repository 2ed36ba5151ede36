//! JetStream-backed `Queue`, grounded in
//! `cp5337-sx9/crates/sx9-nats-router`'s use of `async-nats` -- the closest
//! available ecosystem crate to the AMQP-shaped contract spec §4.8
//! describes. A pull consumer with `max_ack_pending: 1` gives prefetch=1;
//! `message.ack()` after a DB commit gives ack-after-commit; `AckKind::Nak`
//! / `AckKind::Term` give requeue / no-requeue.

use async_nats::jetstream::{self, consumer::pull, stream};
use futures::StreamExt;
use tracing::warn;

use super::{Delivery, DeliveryHandle, Queue, SliceMessage};
use crate::store::error::{Result, StoreError};

pub struct NatsQueue {
    context: jetstream::Context,
    stream_name: String,
}

impl NatsQueue {
    pub async fn connect(nats_url: &str) -> Result<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("nats connect failed: {e}")))?;
        let context = jetstream::new(client);

        let stream_name = "slice_orchestrator".to_string();
        context
            .get_or_create_stream(stream::Config {
                name: stream_name.clone(),
                subjects: vec!["vlan_mapping_*".to_string(), "vm_placement_*".to_string()],
                retention: stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("nats stream create failed: {e}")))?;

        Ok(Self { context, stream_name })
    }

    async fn consumer(&self, subject: &str) -> Result<pull::Stream> {
        let stream = self
            .context
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("nats get_stream failed: {e}")))?;

        let consumer = stream
            .get_or_create_consumer(
                subject,
                pull::Config {
                    durable_name: Some(subject.to_string()),
                    filter_subject: subject.to_string(),
                    max_ack_pending: 1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("nats consumer create failed: {e}")))?;

        consumer
            .messages()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("nats messages() failed: {e}")))
    }
}

#[async_trait::async_trait]
impl Queue for NatsQueue {
    async fn publish(&self, subject: &str, message: SliceMessage) -> Result<()> {
        let payload = serde_json::to_vec(&message)
            .map_err(|e| StoreError::Internal(format!("slice message serialize failed: {e}")))?;
        self.context
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("nats publish failed: {e}")))?
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("nats publish ack failed: {e}")))?;
        Ok(())
    }

    async fn consume_one(&self, subject: &str) -> Result<Option<Delivery>> {
        let mut messages = self.consumer(subject).await?;
        let Some(next) = messages.next().await else {
            return Ok(None);
        };
        let msg = next.map_err(|e| StoreError::DependencyUnavailable(format!("nats message error: {e}")))?;

        let parsed: SliceMessage = match serde_json::from_slice(&msg.payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "poison message on {subject}, terminating without requeue");
                let _ = msg.ack_with(jetstream::AckKind::Term).await;
                return Ok(None);
            }
        };

        Ok(Some(Delivery {
            message: parsed,
            handle: DeliveryHandle::Nats(msg),
        }))
    }
}
