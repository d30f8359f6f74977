//! Queue-driven pipeline workers
//!
//! Each stage is a stateless [`Worker`] driven by a [`WorkerRuntime`] that
//! polls the stage's topic, keeps the lease alive while the handler runs, and
//! decides what happens to the delivery afterwards:
//! - success or a no-op acknowledges it
//! - a payload that does not parse is deleted without retry
//! - exhausted retries and permanent errors go to the [`Supervisor`]
//! - any other error leaves the message for redelivery

mod dead_letter;
mod embedding;
mod explanation;
mod image_analysis;
mod ingestion;
mod summary;

#[cfg(test)]
mod tests;

pub use dead_letter::*;
pub use embedding::*;
pub use explanation::*;
pub use image_analysis::*;
pub use ingestion::*;
pub use summary::*;

use crate::blob::BlobStore;
use crate::config::Config;
use crate::deck::DeckReader;
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::llm::SlideModel;
use crate::messages::JobMessage;
use crate::meta::MetaDb;
use crate::queue::{self, Delivery, Queue};
use crate::retry::{retry_with_backoff, RetryPolicy, Supervisor};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every worker
#[derive(Clone)]
pub struct Services {
    pub db: MetaDb,
    pub queue: Arc<dyn Queue>,
    pub blobs: Arc<dyn BlobStore>,
    pub model: Arc<dyn SlideModel>,
    pub embedder: Arc<dyn Embedder>,
    pub reader: Arc<dyn DeckReader>,
    pub config: Arc<Config>,
}

impl Services {
    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(self.db.clone(), self.queue.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry.policy()
    }

    /// Publish a follow-up job, retrying transient queue failures
    pub async fn publish<J: JobMessage>(&self, stage: &str, job: &J) -> Result<String> {
        let queue = self.queue.as_ref();
        retry_with_backoff(&self.retry_policy(), stage, || queue::publish(queue, job)).await
    }
}

/// What a handler did with a job it accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Nothing to do: lecture gone, already processed, or superseded
    Skipped(&'static str),
}

/// One pipeline stage
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    type Job: JobMessage;

    /// Stage name recorded in `error_details`
    const STAGE: &'static str;

    async fn handle(&self, job: Self::Job) -> Result<Outcome>;
}

/// What happened to a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Skipped(&'static str),
    Malformed,
    DeadLettered,
    /// Left unacknowledged; it reappears when the lease expires
    Released,
}

/// Polls one topic and runs its worker
pub struct WorkerRuntime<W: Worker> {
    worker: W,
    db: MetaDb,
    queue: Arc<dyn Queue>,
    supervisor: Supervisor,
    lease: Duration,
    poll_interval: Duration,
    batch_size: usize,
    max_deliveries: u32,
}

impl<W: Worker> WorkerRuntime<W> {
    pub fn new(worker: W, services: &Services) -> Self {
        let queue_config = &services.config.queue;
        Self {
            worker,
            db: services.db.clone(),
            queue: services.queue.clone(),
            supervisor: services.supervisor(),
            lease: queue_config.lease(),
            poll_interval: queue_config.poll_interval(),
            batch_size: queue_config.batch_size,
            max_deliveries: queue_config.max_deliveries,
        }
    }

    /// Run until the shutdown flag flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let topic = W::Job::TOPIC;
        info!(topic, stage = W::STAGE, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let deliveries = match self.queue.receive(topic, self.batch_size, self.lease).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(topic, error = %e, "Receive failed");
                    Vec::new()
                }
            };

            if deliveries.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            for delivery in deliveries {
                if let Err(e) = self.process(delivery).await {
                    error!(topic, error = %e, "Failed to settle delivery");
                }
            }
        }

        info!(topic, "Worker stopped");
        Ok(())
    }

    /// Receive and process everything currently visible on the topic
    pub async fn drain(&self) -> Result<Vec<Disposition>> {
        let mut dispositions = Vec::new();
        loop {
            let deliveries = self
                .queue
                .receive(W::Job::TOPIC, self.batch_size, self.lease)
                .await?;
            if deliveries.is_empty() {
                return Ok(dispositions);
            }
            for delivery in deliveries {
                dispositions.push(self.process(delivery).await?);
            }
        }
    }

    /// Handle one delivery and settle it
    pub async fn process(&self, delivery: Delivery) -> Result<Disposition> {
        let topic = W::Job::TOPIC;
        let parsed = W::Job::from_payload(&delivery.payload);

        if delivery.delivery_count > self.max_deliveries {
            let lecture_id = parsed.as_ref().ok().map(|job| job.lecture_id().to_string());
            let message = format!(
                "message delivered {} times without being acknowledged",
                delivery.delivery_count
            );
            return self
                .escalate(&delivery, lecture_id.as_deref(), W::STAGE, &message)
                .await;
        }

        let job = match parsed {
            Ok(job) => job,
            Err(e) => {
                warn!(topic, message_id = %delivery.id, error = %e, "Dropping malformed message");
                self.queue.delete(&delivery).await?;
                return Ok(Disposition::Malformed);
            }
        };
        let lecture_id = job.lecture_id().to_string();
        debug!(topic, message_id = %delivery.id, lecture_id = %lecture_id, "Processing job");

        let result = self.handle_with_heartbeat(job, &delivery).await;

        match result {
            Ok(Outcome::Done) => {
                self.queue.delete(&delivery).await?;
                Ok(Disposition::Acked)
            }
            Ok(Outcome::Skipped(reason)) => {
                debug!(topic, lecture_id = %lecture_id, reason, "Job skipped");
                self.queue.delete(&delivery).await?;
                Ok(Disposition::Skipped(reason))
            }
            Err(Error::RetriesExhausted { stage, message }) => {
                self.escalate(&delivery, Some(&lecture_id), &stage, &message)
                    .await
            }
            Err(e) if !e.is_transient() => {
                self.escalate(&delivery, Some(&lecture_id), W::STAGE, &e.to_string())
                    .await
            }
            Err(e) => {
                warn!(
                    topic,
                    message_id = %delivery.id,
                    lecture_id = %lecture_id,
                    error = %e,
                    "Job failed, leaving for redelivery"
                );
                Ok(Disposition::Released)
            }
        }
    }

    /// Hand a failed delivery to the supervisor, unless its lecture was
    /// deleted while the job ran; that delivery is acknowledged silently.
    async fn escalate(
        &self,
        delivery: &Delivery,
        lecture_id: Option<&str>,
        stage: &str,
        message: &str,
    ) -> Result<Disposition> {
        if let Some(id) = lecture_id {
            if self.db.get_lecture(id).await?.is_none() {
                debug!(topic = %delivery.topic, lecture_id = %id, stage, "Lecture deleted, dropping failed job");
                self.queue.delete(delivery).await?;
                return Ok(Disposition::Skipped("lecture deleted"));
            }
        }
        self.supervisor.fail(delivery, lecture_id, stage, message).await?;
        Ok(Disposition::DeadLettered)
    }

    /// Run the handler while renewing the lease at half its length
    async fn handle_with_heartbeat(&self, job: W::Job, delivery: &Delivery) -> Result<Outcome> {
        let period = (self.lease / 2).max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.tick().await;

        let handler = self.worker.handle(job);
        tokio::pin!(handler);

        loop {
            tokio::select! {
                result = &mut handler => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.queue.extend_lease(delivery, self.lease).await {
                        warn!(message_id = %delivery.id, error = %e, "Lease renewal failed");
                    }
                }
            }
        }
    }
}

/// Stages a worker process can run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Ingestion,
    ImageAnalysis,
    Explanation,
    Embedding,
    Summary,
    DeadLetter,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 6] = [
        WorkerKind::Ingestion,
        WorkerKind::ImageAnalysis,
        WorkerKind::Explanation,
        WorkerKind::Embedding,
        WorkerKind::Summary,
        WorkerKind::DeadLetter,
    ];
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Ingestion => write!(f, "ingestion"),
            WorkerKind::ImageAnalysis => write!(f, "image-analysis"),
            WorkerKind::Explanation => write!(f, "explanation"),
            WorkerKind::Embedding => write!(f, "embedding"),
            WorkerKind::Summary => write!(f, "summary"),
            WorkerKind::DeadLetter => write!(f, "dead-letter"),
        }
    }
}

impl FromStr for WorkerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "ingestion" => Ok(WorkerKind::Ingestion),
            "image-analysis" => Ok(WorkerKind::ImageAnalysis),
            "explanation" => Ok(WorkerKind::Explanation),
            "embedding" => Ok(WorkerKind::Embedding),
            "summary" => Ok(WorkerKind::Summary),
            "dead-letter" => Ok(WorkerKind::DeadLetter),
            _ => Err(Error::Config(format!("Unknown worker: {}", s))),
        }
    }
}

/// Run the given stages concurrently until shutdown
pub async fn run_workers(
    services: Services,
    kinds: &[WorkerKind],
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut set = JoinSet::new();

    for kind in kinds {
        let rx = shutdown.clone();
        let s = services.clone();
        match kind {
            WorkerKind::Ingestion => {
                set.spawn(WorkerRuntime::new(IngestionWorker::new(s.clone()), &s).run(rx));
            }
            WorkerKind::ImageAnalysis => {
                set.spawn(WorkerRuntime::new(ImageAnalysisWorker::new(s.clone()), &s).run(rx));
            }
            WorkerKind::Explanation => {
                set.spawn(WorkerRuntime::new(ExplanationWorker::new(s.clone()), &s).run(rx));
            }
            WorkerKind::Embedding => {
                set.spawn(WorkerRuntime::new(EmbeddingWorker::new(s.clone()), &s).run(rx));
            }
            WorkerKind::Summary => {
                set.spawn(WorkerRuntime::new(SummaryWorker::new(s.clone()), &s).run(rx));
            }
            WorkerKind::DeadLetter => {
                set.spawn(DeadLetterSink::new(s.db.clone(), s.queue.clone(), &s.config).run(rx));
            }
        }
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Worker exited with error"),
            Err(e) => error!(error = %e, "Worker task panicked"),
        }
    }
    Ok(())
}
