//! Topic queue with visibility leases
//!
//! Delivery is at-least-once: a received message stays invisible for the
//! lease and reappears if it is not deleted before the lease runs out.

use crate::error::{Error, Result};
use crate::messages::{topics, JobMessage};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub topic: String,
    pub payload: String,
    pub attributes: HashMap<String, String>,
    /// Number of times the message has been handed out, this one included
    pub delivery_count: u32,
    pub enqueued_at: String,
}

/// Publish/consume primitive shared by every stage
#[async_trait]
pub trait Queue: Send + Sync {
    /// Publish a payload, returning its message id
    async fn send(
        &self,
        topic: &str,
        payload: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String>;

    /// Receive up to `max` visible messages and hide them for `lease`
    async fn receive(&self, topic: &str, max: usize, lease: Duration) -> Result<Vec<Delivery>>;

    /// Push the visibility deadline of a delivery `lease` into the future
    async fn extend_lease(&self, delivery: &Delivery, lease: Duration) -> Result<()>;

    /// Acknowledge a delivery
    async fn delete(&self, delivery: &Delivery) -> Result<()>;

    /// Forward a delivery to its topic's dead-letter topic.
    ///
    /// The original payload and attributes are kept; the originating
    /// subscription is recorded as an attribute. The original is not deleted.
    async fn dead_letter(&self, delivery: &Delivery, subscription: &str) -> Result<String>;
}

/// Serialize and publish a job to its topic
pub async fn publish<J: JobMessage>(queue: &dyn Queue, job: &J) -> Result<String> {
    let payload = job.to_payload()?;
    let id = queue.send(J::TOPIC, &payload, HashMap::new()).await?;
    debug!(topic = J::TOPIC, message_id = %id, lecture_id = %job.lecture_id(), "Published job");
    Ok(id)
}

#[derive(Debug, FromRow)]
struct QueueRow {
    id: i64,
    topic: String,
    payload: String,
    attributes: Option<String>,
    enqueued_at: String,
    delivery_count: i64,
}

impl QueueRow {
    fn into_delivery(self) -> Delivery {
        let attributes = self
            .attributes
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default();
        Delivery {
            id: self.id.to_string(),
            topic: self.topic,
            payload: self.payload,
            attributes,
            delivery_count: self.delivery_count.max(0) as u32,
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Queue stored in the pipeline's SQLite database
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    /// Create a queue on an existing pool (the schema must already exist)
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn parse_id(delivery: &Delivery) -> Result<i64> {
        delivery
            .id
            .parse()
            .map_err(|_| Error::Queue(format!("Invalid message id: {}", delivery.id)))
    }

    /// Number of messages on a topic, visible or leased
    pub async fn count(&self, topic: &str) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as usize)
    }

    /// Payloads on a topic in publish order, without leasing them
    pub async fn peek(&self, topic: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT payload FROM queue_messages WHERE topic = ? ORDER BY id")
                .bind(topic)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }
}

#[async_trait]
impl Queue for SqliteQueue {
    async fn send(
        &self,
        topic: &str,
        payload: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String> {
        let attributes = if attributes.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&attributes)?)
        };
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO queue_messages (topic, payload, attributes, enqueued_at, visible_at, delivery_count)
            VALUES (?, ?, ?, ?, ?, 0)
            RETURNING id
            "#,
        )
        .bind(topic)
        .bind(payload)
        .bind(attributes)
        .bind(Utc::now().to_rfc3339())
        .bind(Self::now_ms())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Queue(format!("send to '{}' failed: {}", topic, e)))?;
        Ok(id.to_string())
    }

    async fn receive(&self, topic: &str, max: usize, lease: Duration) -> Result<Vec<Delivery>> {
        let now = Self::now_ms();
        let hidden_until = now + lease.as_millis() as i64;
        let mut rows = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, delivery_count = delivery_count + 1
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE topic = ? AND visible_at <= ?
                ORDER BY id
                LIMIT ?
            )
            RETURNING id, topic, payload, attributes, enqueued_at, delivery_count
            "#,
        )
        .bind(hidden_until)
        .bind(topic)
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Queue(format!("receive from '{}' failed: {}", topic, e)))?;

        rows.sort_by_key(|row| row.id);
        Ok(rows.into_iter().map(QueueRow::into_delivery).collect())
    }

    async fn extend_lease(&self, delivery: &Delivery, lease: Duration) -> Result<()> {
        let hidden_until = Self::now_ms() + lease.as_millis() as i64;
        sqlx::query("UPDATE queue_messages SET visible_at = ? WHERE id = ?")
            .bind(hidden_until)
            .bind(Self::parse_id(delivery)?)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Queue(format!("lease extension failed: {}", e)))?;
        Ok(())
    }

    async fn delete(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(Self::parse_id(delivery)?)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Queue(format!("delete failed: {}", e)))?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, subscription: &str) -> Result<String> {
        let mut attributes = delivery.attributes.clone();
        attributes.insert("subscription".to_string(), subscription.to_string());
        attributes.insert("original_message_id".to_string(), delivery.id.clone());
        attributes.insert(
            "delivery_count".to_string(),
            delivery.delivery_count.to_string(),
        );
        let topic = topics::dead_letter(&delivery.topic);
        self.send(&topic, &delivery.payload, attributes).await
    }
}
