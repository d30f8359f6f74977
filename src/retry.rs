//! Bounded retry and dead-letter supervision
//!
//! Every external call a worker makes runs through [`retry_with_backoff`].
//! When the attempts run out, the [`Supervisor`] marks the owning lecture
//! failed and moves the original message to the stage's dead-letter topic.

use crate::error::{Error, Result};
use crate::meta::{ErrorDetails, MetaDb};
use crate::queue::{Delivery, Queue};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Backoff schedule: fixed initial delay, doubling, capped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// Both permanent failures and exhaustion come back as
/// [`Error::RetriesExhausted`] tagged with `stage`.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, stage: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => {
                warn!(stage, attempt, error = %e, "Permanent failure, not retrying");
                return Err(Error::RetriesExhausted {
                    stage: stage.to_string(),
                    message: e.to_string(),
                });
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!(stage, attempt, error = %e, "Retries exhausted");
                return Err(Error::RetriesExhausted {
                    stage: stage.to_string(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    stage,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Escalates exhausted work to lecture failure and the dead-letter topic
#[derive(Clone)]
pub struct Supervisor {
    db: MetaDb,
    queue: Arc<dyn Queue>,
}

impl Supervisor {
    pub fn new(db: MetaDb, queue: Arc<dyn Queue>) -> Self {
        Self { db, queue }
    }

    /// Fail a delivery for good.
    ///
    /// Forwards the original payload to the dead-letter topic, records
    /// `{stage, message}` on the lecture (when one is known), then
    /// acknowledges the original. If the forward fails nothing else is
    /// touched and the delivery stays on its topic for another attempt.
    pub async fn fail(
        &self,
        delivery: &Delivery,
        lecture_id: Option<&str>,
        stage: &str,
        message: &str,
    ) -> Result<()> {
        let subscription = format!("{}-worker", delivery.topic);
        let dlq_id = self.queue.dead_letter(delivery, &subscription).await?;

        if let Some(id) = lecture_id {
            let details = ErrorDetails {
                stage: stage.to_string(),
                message: message.to_string(),
            };
            match self.db.mark_failed(id, &details).await {
                Ok(true) => error!(lecture_id = %id, stage, message, "Lecture failed"),
                Ok(false) => warn!(lecture_id = %id, stage, "Lecture already terminal or deleted"),
                Err(e) => error!(lecture_id = %id, stage, error = %e, "Could not mark lecture failed"),
            }
        }

        self.queue.delete(delivery).await?;
        warn!(
            topic = %delivery.topic,
            message_id = %delivery.id,
            dead_letter_id = %dlq_id,
            stage,
            "Message dead-lettered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(5), "embedding", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(Error::Embedding("503".to_string()))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_stage() {
        let calls = &AtomicU32::new(0);
        let err = retry_with_backoff(&fast_policy(3), "summary", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Llm("timeout".to_string()))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::RetriesExhausted { stage, message } => {
                assert_eq!(stage, "summary");
                assert!(message.contains("timeout"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let calls = &AtomicU32::new(0);
        let err = retry_with_backoff(&fast_policy(5), "ingestion", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Deck("not a pdf".to_string()))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::RetriesExhausted { .. }));
    }
}
