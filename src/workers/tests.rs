//! Pipeline scenarios against the real SQLite store and queue with
//! in-process model, embedder and document fakes.

use super::*;
use crate::blob::{BlobStore, FsBlobStore};
use crate::deck::{DeckPage, EmbeddedImage};
use crate::dedupe::tests::{banded_png, striped_png};
use crate::lecture;
use crate::llm::{ExplainRequest, ImageAnalysis, SlideExplanation, SlideNote, SlidePurpose};
use crate::messages::{stages, topics, ImageAnalysisJob, PushEnvelope, PushMessage};
use crate::meta::{ImageKind, ImageType, Lecture, LectureStatus};
use crate::queue::SqliteQueue;
use base64::Engine;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

struct FakeReader {
    pages: Vec<DeckPage>,
}

impl DeckReader for FakeReader {
    fn read(&self, _bytes: &[u8], _render_width: u32) -> Result<Vec<DeckPage>> {
        Ok(self.pages.clone())
    }
}

fn label(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().as_str()[..12].to_string()
}

#[derive(Default)]
struct FakeModel {
    analyze_calls: AtomicU32,
    explain_calls: AtomicU32,
    summarize_calls: AtomicU32,
    failing_stage: Mutex<Option<&'static str>>,
    decorative: Mutex<Vec<Vec<u8>>>,
    requests: Mutex<Vec<(u32, Option<String>, Option<String>)>>,
}

impl FakeModel {
    fn check(&self, stage: &'static str) -> Result<()> {
        if *self.failing_stage.lock().unwrap() == Some(stage) {
            return Err(Error::Llm(format!("{} backend unavailable", stage)));
        }
        Ok(())
    }

    fn calls(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SlideModel for FakeModel {
    async fn analyze_image(&self, image: &[u8], _mime: &str) -> Result<ImageAnalysis> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        self.check(stages::IMAGE_ANALYSIS)?;
        let decorative = self.decorative.lock().unwrap().iter().any(|d| d == image);
        Ok(ImageAnalysis {
            image_type: if decorative {
                ImageType::Decorative
            } else {
                ImageType::Content
            },
            ocr_text: format!("ocr-{}", label(image)),
            alt_text: format!("alt-{}", label(image)),
        })
    }

    async fn explain_slide(&self, request: &ExplainRequest) -> Result<SlideExplanation> {
        self.explain_calls.fetch_add(1, Ordering::SeqCst);
        self.check(stages::EXPLANATION)?;
        self.requests.lock().unwrap().push((
            request.slide_number,
            request.previous_text.clone(),
            request.next_text.clone(),
        ));
        Ok(SlideExplanation {
            explanation: format!("Slide {} of {}", request.slide_number, request.total_slides),
            one_liner: format!("slide {}", request.slide_number),
            slide_purpose: SlidePurpose::Content,
        })
    }

    async fn summarize(&self, notes: &[SlideNote]) -> Result<String> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        self.check(stages::SUMMARY)?;
        Ok(format!("summary of {} slides", notes.len()))
    }
}

#[derive(Default)]
struct FakeEmbedder {
    texts: Mutex<Vec<String>>,
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let vectors = texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect();
        self.texts.lock().unwrap().extend(texts);
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        3
    }

    fn model_name(&self) -> &str {
        "fake-embedder"
    }
}

fn logo() -> Vec<u8> {
    banded_png(32, 32, 4)
}

fn diagram() -> Vec<u8> {
    striped_png(48, 48, 3)
}

fn page(text: &str, stripe: u32, images: Vec<Vec<u8>>) -> DeckPage {
    DeckPage {
        text: text.to_string(),
        render: striped_png(64, 48, stripe),
        images: images
            .into_iter()
            .map(|bytes| EmbeddedImage {
                bytes,
                extension: "png".to_string(),
            })
            .collect(),
    }
}

/// Slides 1 and 3 share a logo, slide 2 has a diagram
fn three_slide_deck() -> Vec<DeckPage> {
    vec![
        page("Welcome to distributed systems", 8, vec![logo()]),
        page("The pipeline fans out into workers", 4, vec![diagram()]),
        page("Questions and thanks", 16, vec![logo()]),
    ]
}

struct Harness {
    services: Services,
    queue: Arc<SqliteQueue>,
    model: Arc<FakeModel>,
    embedder: Arc<FakeEmbedder>,
    _tmp: TempDir,
}

impl Harness {
    async fn new(pages: Vec<DeckPage>) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.retry.initial_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.retry.max_attempts = 3;
        config.queue.lease_secs = 30;
        config.queue.poll_interval_ms = 10;
        config.queue.batch_size = 10;

        let db = MetaDb::connect(&config).await.unwrap();
        db.init_schema().await.unwrap();
        let queue = Arc::new(SqliteQueue::new(db.pool().clone()));
        let model = Arc::new(FakeModel::default());
        let embedder = Arc::new(FakeEmbedder::default());

        let services = Services {
            db,
            queue: queue.clone(),
            blobs: Arc::new(FsBlobStore::new(config.storage_root())),
            model: model.clone(),
            embedder: embedder.clone(),
            reader: Arc::new(FakeReader { pages }),
            config: Arc::new(config),
        };

        Self {
            services,
            queue,
            model,
            embedder,
            _tmp: tmp,
        }
    }

    async fn upload(&self) -> String {
        lecture::upload_lecture(
            &self.services.db,
            self.services.blobs.as_ref(),
            self.services.queue.as_ref(),
            b"%PDF-1.7 deck",
            "deck.pdf",
            Some("Systems".to_string()),
        )
        .await
        .unwrap()
        .id
    }

    async fn drain<W: Worker>(&self, worker: W) -> Vec<Disposition> {
        WorkerRuntime::new(worker, &self.services).drain().await.unwrap()
    }

    async fn ingest(&self) -> Vec<Disposition> {
        self.drain(IngestionWorker::new(self.services.clone())).await
    }

    async fn analyze(&self) -> Vec<Disposition> {
        self.drain(ImageAnalysisWorker::new(self.services.clone())).await
    }

    async fn explain(&self) -> Vec<Disposition> {
        self.drain(ExplanationWorker::new(self.services.clone())).await
    }

    async fn embed(&self) -> Vec<Disposition> {
        self.drain(EmbeddingWorker::new(self.services.clone())).await
    }

    async fn summarize(&self) -> Vec<Disposition> {
        self.drain(SummaryWorker::new(self.services.clone())).await
    }

    fn sink(&self) -> DeadLetterSink {
        DeadLetterSink::new(
            self.services.db.clone(),
            self.services.queue.clone(),
            &self.services.config,
        )
    }

    async fn lecture(&self, id: &str) -> Lecture {
        self.services.db.get_lecture(id).await.unwrap().unwrap()
    }

    async fn status(&self, id: &str) -> LectureStatus {
        self.lecture(id).await.get_status().unwrap()
    }

    async fn count(&self, topic: &str) -> usize {
        self.queue.count(topic).await.unwrap()
    }

    async fn resend(&self, topic: &str, payload: &str) {
        self.queue.send(topic, payload, HashMap::new()).await.unwrap();
    }

    /// Observable end state, independent of ids
    async fn end_state(&self, id: &str) -> (LectureStatus, i64, i64, bool, usize, bool) {
        let lecture = self.lecture(id).await;
        (
            lecture.get_status().unwrap(),
            lecture.processed_slides,
            lecture.processed_sub_images,
            lecture.embeddings_complete,
            self.services.db.count_embeddings(id).await.unwrap(),
            self.services.db.summary_exists(id).await.unwrap(),
        )
    }
}

fn all_acked(dispositions: &[Disposition]) -> bool {
    dispositions.iter().all(|d| *d == Disposition::Acked)
}

fn all_skipped(dispositions: &[Disposition]) -> bool {
    dispositions.iter().all(|d| matches!(d, Disposition::Skipped(_)))
}

#[tokio::test]
async fn test_three_slide_deck_fan_out() {
    let h = Harness::new(three_slide_deck()).await;
    let id = h.upload().await;

    assert_eq!(h.ingest().await, vec![Disposition::Acked]);

    let lecture = h.lecture(&id).await;
    assert_eq!(lecture.get_status().unwrap(), LectureStatus::Explaining);
    assert_eq!(lecture.total_slides, 3);
    assert_eq!(lecture.total_sub_images, 5);
    assert_eq!(h.services.db.list_slides(&id).await.unwrap().len(), 3);
    assert_eq!(h.count(topics::IMAGE_ANALYSIS).await, 5);
    assert_eq!(h.count(topics::EXPLANATION).await, 3);
    assert_eq!(h.count(topics::EMBEDDING).await, 0);

    let images = h.services.db.list_slide_images(&id).await.unwrap();
    let full_pages = images
        .iter()
        .filter(|i| i.kind == ImageKind::FullPage.to_string())
        .count();
    let subs: Vec<_> = images
        .iter()
        .filter(|i| i.kind == ImageKind::SubImage.to_string())
        .collect();
    assert_eq!(full_pages, 3);
    assert_eq!(subs.len(), 3);

    let distinct: HashSet<&str> = subs.iter().map(|i| i.image_hash.as_str()).collect();
    assert_eq!(distinct.len(), 2);

    let logo_rows: Vec<_> = subs
        .iter()
        .filter(|i| subs.iter().filter(|j| j.image_hash == i.image_hash).count() == 2)
        .collect();
    assert_eq!(logo_rows.len(), 2);
    assert_eq!(logo_rows[0].storage_path, logo_rows[1].storage_path);
    assert_ne!(logo_rows[0].slide_id, logo_rows[1].slide_id);

    let jobs: Vec<ImageAnalysisJob> = h
        .queue
        .peek(topics::IMAGE_ANALYSIS)
        .await
        .unwrap()
        .iter()
        .map(|p| ImageAnalysisJob::from_payload(p).unwrap())
        .collect();
    let logo_jobs = jobs
        .iter()
        .filter(|j| j.image_hash == logo_rows[0].image_hash)
        .count();
    assert_eq!(logo_jobs, 1);
}

#[tokio::test]
async fn test_analysis_propagates_to_duplicate_rows() {
    let h = Harness::new(three_slide_deck()).await;
    let id = h.upload().await;
    h.ingest().await;

    assert!(all_acked(&h.analyze().await));
    assert_eq!(FakeModel::calls(&h.model.analyze_calls), 5);

    let images = h.services.db.list_slide_images(&id).await.unwrap();
    assert!(images.iter().all(|i| i.ocr_text.is_some()));
    let logo_ocr = format!("ocr-{}", label(&logo()));
    let logo_rows = images
        .iter()
        .filter(|i| i.ocr_text.as_deref() == Some(logo_ocr.as_str()))
        .count();
    assert_eq!(logo_rows, 2);
}

#[tokio::test]
async fn test_duplicate_final_image_job_enqueues_embedding_once() {
    let h = Harness::new(three_slide_deck()).await;
    let id = h.upload().await;
    h.ingest().await;

    let payloads = h.queue.peek(topics::IMAGE_ANALYSIS).await.unwrap();
    assert!(all_acked(&h.analyze().await));
    assert_eq!(h.count(topics::EMBEDDING).await, 1);

    let last = payloads.last().unwrap();
    for _ in 0..3 {
        h.resend(topics::IMAGE_ANALYSIS, last).await;
    }
    let again = h.analyze().await;
    assert_eq!(again.len(), 3);
    assert!(all_skipped(&again));

    assert_eq!(h.count(topics::EMBEDDING).await, 1);
    assert_eq!(FakeModel::calls(&h.model.analyze_calls), 5);
    let lecture = h.lecture(&id).await;
    assert_eq!(lecture.processed_sub_images, lecture.total_sub_images);
}

#[tokio::test]
async fn test_concurrent_duplicate_image_deliveries_count_once() {
    let h = Harness::new(vec![page("Only slide", 8, Vec::new())]).await;
    let id = h.upload().await;
    h.ingest().await;

    let payload = h.queue.peek(topics::IMAGE_ANALYSIS).await.unwrap().remove(0);
    h.resend(topics::IMAGE_ANALYSIS, &payload).await;

    let deliveries = h
        .queue
        .receive(topics::IMAGE_ANALYSIS, 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 2);

    let runtime = WorkerRuntime::new(ImageAnalysisWorker::new(h.services.clone()), &h.services);
    let mut iter = deliveries.into_iter();
    let (a, b) = (iter.next().unwrap(), iter.next().unwrap());
    let (ra, rb) = tokio::join!(runtime.process(a), runtime.process(b));
    ra.unwrap();
    rb.unwrap();

    let lecture = h.lecture(&id).await;
    assert_eq!(lecture.processed_sub_images, 1);
    assert_eq!(lecture.total_sub_images, 1);
    assert_eq!(h.count(topics::EMBEDDING).await, 1);
}

#[tokio::test]
async fn test_duplicate_final_explanation_enqueues_summary_once() {
    let h = Harness::new(three_slide_deck()).await;
    let id = h.upload().await;
    h.ingest().await;

    let payloads = h.queue.peek(topics::EXPLANATION).await.unwrap();
    assert!(all_acked(&h.explain().await));
    assert_eq!(h.count(topics::SUMMARY).await, 1);
    assert_eq!(h.status(&id).await, LectureStatus::Summarising);

    let last = payloads.last().unwrap();
    h.resend(topics::EXPLANATION, last).await;
    h.resend(topics::EXPLANATION, last).await;
    let again = h.explain().await;
    assert!(all_skipped(&again));

    assert_eq!(h.count(topics::SUMMARY).await, 1);
    assert_eq!(FakeModel::calls(&h.model.explain_calls), 3);
    assert_eq!(h.services.db.list_explanations(&id).await.unwrap().len(), 3);
    let lecture = h.lecture(&id).await;
    assert_eq!(lecture.processed_slides, 3);
}

#[tokio::test]
async fn test_explanation_receives_neighbour_text() {
    let h = Harness::new(three_slide_deck()).await;
    h.upload().await;
    h.ingest().await;
    h.explain().await;

    let mut requests = h.model.requests.lock().unwrap().clone();
    requests.sort_by_key(|r| r.0);
    assert_eq!(
        requests[0],
        (1, None, Some("The pipeline fans out into workers".to_string()))
    );
    assert_eq!(
        requests[1],
        (
            2,
            Some("Welcome to distributed systems".to_string()),
            Some("Questions and thanks".to_string())
        )
    );
    assert_eq!(
        requests[2],
        (3, Some("The pipeline fans out into workers".to_string()), None)
    );
}

#[tokio::test]
async fn test_both_completion_orderings_converge() {
    // Embedding track first
    let first = Harness::new(three_slide_deck()).await;
    let a = first.upload().await;
    first.ingest().await;
    first.analyze().await;
    assert!(all_acked(&first.embed().await));
    let lecture = first.lecture(&a).await;
    assert!(lecture.embeddings_complete);
    assert_eq!(lecture.get_status().unwrap(), LectureStatus::Explaining);
    first.explain().await;
    assert_eq!(first.status(&a).await, LectureStatus::Summarising);
    assert!(all_acked(&first.summarize().await));
    assert_eq!(first.status(&a).await, LectureStatus::Complete);

    // Explanation track first
    let second = Harness::new(three_slide_deck()).await;
    let b = second.upload().await;
    second.ingest().await;
    second.explain().await;
    assert!(all_acked(&second.summarize().await));
    assert_eq!(second.status(&b).await, LectureStatus::Summarising);
    assert!(second.services.db.summary_exists(&b).await.unwrap());
    second.analyze().await;
    assert!(all_acked(&second.embed().await));
    assert_eq!(second.status(&b).await, LectureStatus::Complete);

    assert_eq!(first.end_state(&a).await, second.end_state(&b).await);
    assert!(first.lecture(&a).await.completed_at.is_some());
    assert!(second.lecture(&b).await.completed_at.is_some());
}

#[tokio::test]
async fn test_summary_redelivery_is_noop() {
    let h = Harness::new(three_slide_deck()).await;
    let id = h.upload().await;
    h.ingest().await;
    h.explain().await;

    let payload = h.queue.peek(topics::SUMMARY).await.unwrap().remove(0);
    h.summarize().await;
    let summary = h.services.db.get_summary(&id).await.unwrap().unwrap();

    h.resend(topics::SUMMARY, &payload).await;
    assert_eq!(
        h.summarize().await,
        vec![Disposition::Skipped("lecture already summarised")]
    );
    assert_eq!(FakeModel::calls(&h.model.summarize_calls), 1);
    let after = h.services.db.get_summary(&id).await.unwrap().unwrap();
    assert_eq!(summary.content, after.content);
    assert_eq!(summary.content, "summary of 3 slides");
}

#[tokio::test]
async fn test_retry_exhaustion_fails_lecture_and_dead_letters() {
    let h = Harness::new(three_slide_deck()).await;
    *h.model.failing_stage.lock().unwrap() = Some(stages::EXPLANATION);
    let id = h.upload().await;
    h.ingest().await;

    let original = h.queue.peek(topics::EXPLANATION).await.unwrap().remove(0);
    let dispositions = h.explain().await;
    assert_eq!(dispositions[0], Disposition::DeadLettered);
    assert!(all_skipped(&dispositions[1..]));
    assert_eq!(FakeModel::calls(&h.model.explain_calls), 3);

    let lecture = h.lecture(&id).await;
    assert_eq!(lecture.get_status().unwrap(), LectureStatus::Failed);
    let details = lecture.error().unwrap();
    assert_eq!(details.stage, stages::EXPLANATION);
    assert!(details.message.contains("unavailable"));

    assert_eq!(h.sink().drain().await, 1);
    let records = h.services.db.list_dead_letters(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, original);
    assert_eq!(records[0].subscription_name, "explanation-worker");

    // The image track stops too
    assert!(all_skipped(&h.analyze().await));
    assert_eq!(h.count(topics::EMBEDDING).await, 0);
}

/// Queue whose dead-letter forward fails a set number of times
struct FlakyDeadLetterQueue {
    inner: Arc<SqliteQueue>,
    failures_left: AtomicU32,
}

#[async_trait]
impl Queue for FlakyDeadLetterQueue {
    async fn send(
        &self,
        topic: &str,
        payload: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String> {
        self.inner.send(topic, payload, attributes).await
    }

    async fn receive(&self, topic: &str, max: usize, lease: Duration) -> Result<Vec<Delivery>> {
        self.inner.receive(topic, max, lease).await
    }

    async fn extend_lease(&self, delivery: &Delivery, lease: Duration) -> Result<()> {
        self.inner.extend_lease(delivery, lease).await
    }

    async fn delete(&self, delivery: &Delivery) -> Result<()> {
        self.inner.delete(delivery).await
    }

    async fn dead_letter(&self, delivery: &Delivery, subscription: &str) -> Result<String> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::Queue("dead-letter publish failed".to_string()));
        }
        self.inner.dead_letter(delivery, subscription).await
    }
}

#[tokio::test]
async fn test_failed_dead_letter_forward_keeps_message() {
    let h = Harness::new(three_slide_deck()).await;
    *h.model.failing_stage.lock().unwrap() = Some(stages::EXPLANATION);
    let id = h.upload().await;
    h.ingest().await;
    let original = h.queue.peek(topics::EXPLANATION).await.unwrap().remove(0);

    let flaky = Arc::new(FlakyDeadLetterQueue {
        inner: h.queue.clone(),
        failures_left: AtomicU32::new(1),
    });
    let services = Services {
        queue: flaky,
        ..h.services.clone()
    };
    let runtime = WorkerRuntime::new(ExplanationWorker::new(services.clone()), &services);

    let delivery = h
        .queue
        .receive(topics::EXPLANATION, 1, Duration::ZERO)
        .await
        .unwrap()
        .remove(0);
    assert!(runtime.process(delivery).await.is_err());

    // Nothing was recorded against the lecture and the job is still queued
    assert_eq!(h.status(&id).await, LectureStatus::Explaining);
    assert_eq!(h.count(topics::EXPLANATION).await, 3);
    assert_eq!(h.count(&topics::dead_letter(topics::EXPLANATION)).await, 0);

    let dispositions = runtime.drain().await.unwrap();
    let dead = dispositions
        .iter()
        .filter(|d| **d == Disposition::DeadLettered)
        .count();
    assert_eq!(dead, 1);
    assert_eq!(h.status(&id).await, LectureStatus::Failed);

    assert_eq!(h.sink().drain().await, 1);
    let records = h.services.db.list_dead_letters(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, original);
    assert_eq!(records[0].subscription_name, "explanation-worker");
}

/// Model that deletes the lecture mid-call and then fails
struct DeletingModel {
    db: MetaDb,
    blobs: Arc<dyn BlobStore>,
}

impl DeletingModel {
    async fn delete_all(&self) -> Result<()> {
        for lecture in self.db.list_lectures().await? {
            lecture::delete_lecture(&self.db, self.blobs.as_ref(), &lecture.id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SlideModel for DeletingModel {
    async fn analyze_image(&self, _image: &[u8], _mime: &str) -> Result<ImageAnalysis> {
        self.delete_all().await?;
        Err(Error::Llm("vision backend unavailable".to_string()))
    }

    async fn explain_slide(&self, _request: &ExplainRequest) -> Result<SlideExplanation> {
        self.delete_all().await?;
        Err(Error::Llm("text backend unavailable".to_string()))
    }

    async fn summarize(&self, _notes: &[SlideNote]) -> Result<String> {
        self.delete_all().await?;
        Err(Error::Llm("text backend unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_lecture_deleted_mid_job_is_not_dead_lettered() {
    let h = Harness::new(vec![page("Only slide", 8, Vec::new())]).await;
    let id = h.upload().await;
    h.ingest().await;

    let services = Services {
        model: Arc::new(DeletingModel {
            db: h.services.db.clone(),
            blobs: h.services.blobs.clone(),
        }),
        ..h.services.clone()
    };
    let dispositions = WorkerRuntime::new(ImageAnalysisWorker::new(services.clone()), &services)
        .drain()
        .await
        .unwrap();

    assert_eq!(dispositions, vec![Disposition::Skipped("lecture deleted")]);
    assert!(h.services.db.get_lecture(&id).await.unwrap().is_none());
    assert_eq!(h.count(topics::IMAGE_ANALYSIS).await, 0);
    assert_eq!(h.count(&topics::dead_letter(topics::IMAGE_ANALYSIS)).await, 0);
    assert_eq!(h.sink().drain().await, 0);
    assert!(h.services.db.list_dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_duplicate_ingestion_converges() {
    let h = Harness::new(three_slide_deck()).await;
    let id = h.upload().await;
    let payload = h.queue.peek(topics::INGESTION).await.unwrap().remove(0);
    h.resend(topics::INGESTION, &payload).await;

    let deliveries = h
        .queue
        .receive(topics::INGESTION, 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 2);

    let runtime = WorkerRuntime::new(IngestionWorker::new(h.services.clone()), &h.services);
    let mut iter = deliveries.into_iter();
    let (a, b) = (iter.next().unwrap(), iter.next().unwrap());
    let (ra, rb) = tokio::join!(runtime.process(a), runtime.process(b));
    assert_ne!(ra.unwrap(), Disposition::DeadLettered);
    assert_ne!(rb.unwrap(), Disposition::DeadLettered);

    let lecture = h.lecture(&id).await;
    assert_eq!(lecture.get_status().unwrap(), LectureStatus::Explaining);
    assert_eq!(lecture.total_slides, 3);
    assert_eq!(lecture.total_sub_images, 5);
    assert_eq!(h.services.db.list_slides(&id).await.unwrap().len(), 3);
    assert_eq!(h.services.db.list_slide_images(&id).await.unwrap().len(), 6);

    let chunks = h.services.db.list_chunks(&id).await.unwrap();
    let keys: HashSet<(String, i64)> = chunks
        .iter()
        .map(|c| (c.slide_id.clone(), c.chunk_index))
        .collect();
    assert_eq!(keys.len(), chunks.len());

    h.analyze().await;
    h.explain().await;
    h.embed().await;
    h.summarize().await;

    let lecture = h.lecture(&id).await;
    assert_eq!(lecture.get_status().unwrap(), LectureStatus::Complete);
    assert_eq!(lecture.processed_sub_images, 5);
    assert_eq!(lecture.processed_slides, 3);
    assert_eq!(FakeModel::calls(&h.model.analyze_calls), 5);
    assert_eq!(FakeModel::calls(&h.model.explain_calls), 3);
    assert_eq!(h.services.db.count_embeddings(&id).await.unwrap(), chunks.len());
}

#[tokio::test]
async fn test_delete_before_ingestion_creates_nothing() {
    let h = Harness::new(three_slide_deck()).await;
    let id = h.upload().await;
    assert!(
        lecture::delete_lecture(&h.services.db, h.services.blobs.as_ref(), &id)
            .await
            .unwrap()
    );

    assert_eq!(
        h.ingest().await,
        vec![Disposition::Skipped("lecture missing or terminal")]
    );
    assert!(h.services.db.list_slides(&id).await.unwrap().is_empty());
    assert_eq!(h.count(topics::INGESTION).await, 0);
    assert_eq!(h.count(topics::IMAGE_ANALYSIS).await, 0);
    assert_eq!(h.count(topics::EXPLANATION).await, 0);
}

#[tokio::test]
async fn test_empty_deck_fails_ingestion() {
    let h = Harness::new(Vec::new()).await;
    let id = h.upload().await;

    assert_eq!(h.ingest().await, vec![Disposition::DeadLettered]);
    let lecture = h.lecture(&id).await;
    assert_eq!(lecture.get_status().unwrap(), LectureStatus::Failed);
    assert_eq!(lecture.error().unwrap().stage, stages::INGESTION);
    assert_eq!(h.count(&topics::dead_letter(topics::INGESTION)).await, 1);
}

#[tokio::test]
async fn test_malformed_message_is_deleted() {
    let h = Harness::new(Vec::new()).await;
    h.resend(topics::SUMMARY, "{\"lecture\": 1}").await;

    assert_eq!(h.summarize().await, vec![Disposition::Malformed]);
    assert_eq!(h.count(topics::SUMMARY).await, 0);
    assert_eq!(h.count(&topics::dead_letter(topics::SUMMARY)).await, 0);
}

#[tokio::test]
async fn test_poison_message_is_dead_lettered() {
    let h = Harness::new(three_slide_deck()).await;
    let id = h.upload().await;

    let max = h.services.config.queue.max_deliveries;
    for _ in 0..max {
        let leased = h
            .queue
            .receive(topics::INGESTION, 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
    }

    assert_eq!(h.ingest().await, vec![Disposition::DeadLettered]);
    let lecture = h.lecture(&id).await;
    assert_eq!(lecture.get_status().unwrap(), LectureStatus::Failed);
    assert_eq!(lecture.error().unwrap().stage, stages::INGESTION);
    assert!(h.services.db.list_slides(&id).await.unwrap().is_empty());

    assert_eq!(h.sink().drain().await, 1);
    let records = h.services.db.list_dead_letters(10).await.unwrap();
    let attributes: HashMap<String, String> =
        serde_json::from_str(records[0].attributes.as_deref().unwrap()).unwrap();
    assert_eq!(attributes["delivery_count"], (max + 1).to_string());
}

#[tokio::test]
async fn test_decorative_images_do_not_enrich_chunks() {
    let h = Harness::new(three_slide_deck()).await;
    h.model.decorative.lock().unwrap().push(logo());
    let id = h.upload().await;
    h.ingest().await;
    h.analyze().await;
    assert!(all_acked(&h.embed().await));

    let texts = h.embedder.texts.lock().unwrap().clone();
    assert_eq!(texts.len(), 3);
    assert!(texts.iter().all(|t| !t.contains(&label(&logo()))));
    assert!(texts
        .iter()
        .any(|t| t.contains(&format!("OCR Text: ocr-{}", label(&diagram())))));
    assert!(texts.iter().all(|t| t.contains("Alt Text: alt-")));

    assert_eq!(h.services.db.count_embeddings(&id).await.unwrap(), 3);
    let chunks = h.services.db.list_chunks(&id).await.unwrap();
    let vector = h.services.db.get_embedding(&chunks[0].id).await.unwrap().unwrap();
    assert_eq!(vector.len(), 3);
}

#[tokio::test]
async fn test_blank_deck_completes_without_chunks() {
    let h = Harness::new(vec![page("", 8, Vec::new())]).await;
    let id = h.upload().await;
    h.ingest().await;
    h.analyze().await;
    h.embed().await;
    h.explain().await;
    h.summarize().await;

    assert_eq!(h.status(&id).await, LectureStatus::Complete);
    assert_eq!(h.services.db.count_embeddings(&id).await.unwrap(), 0);
    assert!(h.embedder.texts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_record_push_decodes_payload() {
    let h = Harness::new(Vec::new()).await;
    let payload = r#"{"lecture_id":"00000000-0000-0000-0000-000000000000"}"#;
    let envelope = PushEnvelope {
        message: PushMessage {
            data: base64::engine::general_purpose::STANDARD.encode(payload),
            message_id: "m-1".to_string(),
            attributes: HashMap::from([("origin".to_string(), "summary".to_string())]),
        },
        subscription: "summary-dead-letter-sub".to_string(),
    };
    record_push(&h.services.db, &envelope).await.unwrap();

    let raw = PushEnvelope {
        message: PushMessage {
            data: "not base64 !".to_string(),
            message_id: "m-2".to_string(),
            attributes: HashMap::new(),
        },
        subscription: "summary-dead-letter-sub".to_string(),
    };
    record_push(&h.services.db, &raw).await.unwrap();

    let records = h.services.db.list_dead_letters(10).await.unwrap();
    assert_eq!(records.len(), 2);
    let decoded = records.iter().find(|r| r.message_id == "m-1").unwrap();
    assert_eq!(decoded.payload, payload);
    assert!(decoded.attributes.as_deref().unwrap().contains("origin"));
    let kept = records.iter().find(|r| r.message_id == "m-2").unwrap();
    assert_eq!(kept.payload, "not base64 !");
    assert!(kept.attributes.is_none());
}

#[test]
fn test_worker_kind_parse() {
    assert_eq!("image_analysis".parse::<WorkerKind>().unwrap(), WorkerKind::ImageAnalysis);
    assert_eq!("Dead-Letter".parse::<WorkerKind>().unwrap(), WorkerKind::DeadLetter);
    assert!("all".parse::<WorkerKind>().is_err());
    for kind in WorkerKind::ALL {
        assert_eq!(kind.to_string().parse::<WorkerKind>().unwrap(), kind);
    }
}

#[tokio::test]
async fn test_run_workers_completes_lecture() {
    let h = Harness::new(three_slide_deck()).await;
    let id = h.upload().await;

    let (tx, rx) = watch::channel(false);
    let services = h.services.clone();
    let handle = tokio::spawn(async move { run_workers(services, &WorkerKind::ALL, rx).await });

    let mut status = h.status(&id).await;
    for _ in 0..500 {
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = h.status(&id).await;
    }

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(status, LectureStatus::Complete);
    for topic in topics::ALL {
        assert_eq!(h.count(topic).await, 0);
    }
}
