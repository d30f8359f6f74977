//! Passive persistence endpoint for dead-lettered messages
//!
//! The sink never fails upstream: a message that cannot be persisted is
//! logged and acknowledged anyway, so an already-failed job is not
//! redelivered forever.

use crate::config::Config;
use crate::error::Result;
use crate::messages::{topics, PushEnvelope};
use crate::meta::{DeadLetterRecord, MetaDb};
use crate::queue::{Delivery, Queue};
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Drains every dead-letter topic into `dead_letter_messages`
pub struct DeadLetterSink {
    db: MetaDb,
    queue: Arc<dyn Queue>,
    lease: Duration,
    poll_interval: Duration,
    batch_size: usize,
}

impl DeadLetterSink {
    pub fn new(db: MetaDb, queue: Arc<dyn Queue>, config: &Config) -> Self {
        Self {
            db,
            queue,
            lease: config.queue.lease(),
            poll_interval: config.queue.poll_interval(),
            batch_size: config.queue.batch_size.max(1),
        }
    }

    /// Run until the shutdown flag flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Dead-letter sink started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.drain().await == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!("Dead-letter sink stopped");
        Ok(())
    }

    /// Persist everything currently visible on the dead-letter topics
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        for topic in topics::ALL {
            let dead_topic = topics::dead_letter(topic);
            loop {
                let deliveries = match self
                    .queue
                    .receive(&dead_topic, self.batch_size, self.lease)
                    .await
                {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(topic = %dead_topic, error = %e, "Receive failed");
                        break;
                    }
                };
                if deliveries.is_empty() {
                    break;
                }
                for delivery in deliveries {
                    self.settle(&delivery).await;
                    handled += 1;
                }
            }
        }
        handled
    }

    async fn settle(&self, delivery: &Delivery) {
        let record = record_from_delivery(delivery);
        match self.db.insert_dead_letter(&record).await {
            Ok(()) => info!(
                subscription = %record.subscription_name,
                message_id = %record.message_id,
                "Dead-letter message persisted"
            ),
            Err(e) => error!(
                topic = %delivery.topic,
                message_id = %delivery.id,
                error = %e,
                "Could not persist dead-letter message"
            ),
        }
        if let Err(e) = self.queue.delete(delivery).await {
            warn!(topic = %delivery.topic, message_id = %delivery.id, error = %e, "Dead-letter ack failed");
        }
    }
}

fn record_from_delivery(delivery: &Delivery) -> DeadLetterRecord {
    let subscription = delivery
        .attributes
        .get("subscription")
        .cloned()
        .unwrap_or_else(|| delivery.topic.clone());
    let message_id = delivery
        .attributes
        .get("original_message_id")
        .cloned()
        .unwrap_or_else(|| delivery.id.clone());
    let attributes = if delivery.attributes.is_empty() {
        None
    } else {
        serde_json::to_string(&delivery.attributes).ok()
    };
    DeadLetterRecord::new(subscription, message_id, delivery.payload.clone(), attributes)
}

/// Persist a push-delivered dead-letter envelope.
///
/// The payload is base64-decoded when possible and stored raw otherwise.
/// Persistence errors are logged and swallowed.
pub async fn record_push(db: &MetaDb, envelope: &PushEnvelope) -> Result<()> {
    let data = &envelope.message.data;
    let payload = base64::engine::general_purpose::STANDARD
        .decode(data)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| data.clone());

    let attributes = if envelope.message.attributes.is_empty() {
        None
    } else {
        serde_json::to_string(&envelope.message.attributes).ok()
    };
    let record = DeadLetterRecord::new(
        envelope.subscription.clone(),
        envelope.message.message_id.clone(),
        payload,
        attributes,
    );

    match db.insert_dead_letter(&record).await {
        Ok(()) => info!(
            subscription = %record.subscription_name,
            message_id = %record.message_id,
            "Dead-letter envelope persisted"
        ),
        Err(e) => error!(
            subscription = %record.subscription_name,
            message_id = %record.message_id,
            error = %e,
            "Could not persist dead-letter envelope"
        ),
    }
    Ok(())
}
