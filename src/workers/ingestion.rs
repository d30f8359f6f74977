use super::{Outcome, Services, Worker};
use crate::blob;
use crate::chunk::chunk_text;
use crate::deck::sanitize_text;
use crate::dedupe::{perceptual_hash, HashLocationMap};
use crate::error::{Error, Result};
use crate::messages::{stages, EmbeddingJob, ExplanationJob, ImageAnalysisJob, IngestionJob};
use crate::meta::{Chunk, ImageKind, LectureStatus, Slide, SlideImage};
use crate::queue;
use crate::retry::retry_with_backoff;
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Walks an uploaded deck and fans it out into per-image and per-slide jobs
pub struct IngestionWorker {
    services: Services,
}

/// Jobs collected during the page walk, published once totals are stored
#[derive(Debug, Default)]
struct FanOut {
    analysis: Vec<ImageAnalysisJob>,
    explanation: Vec<ExplanationJob>,
}

impl IngestionWorker {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn ingest(&self, job: &IngestionJob) -> Result<Outcome> {
        let db = &self.services.db;
        let config = &self.services.config;
        let lecture_id = job.lecture_id.to_string();

        if !db.begin_ingestion(&lecture_id).await? {
            return Ok(Outcome::Skipped("lecture missing or already parsed"));
        }

        let document = self.services.blobs.get(&job.document_location).await?;
        let reader = self.services.reader.clone();
        let width = config.render.width;
        let pages = tokio::task::spawn_blocking(move || reader.read(&document, width))
            .await
            .map_err(|e| Error::Deck(format!("Document reader panicked: {}", e)))??;

        if pages.is_empty() {
            return Err(Error::Deck("Document has no pages".to_string()));
        }

        let total_slides = pages.len() as u32;
        let mut seen = HashLocationMap::new(config.dedupe.max_distance);
        let mut fan_out = FanOut::default();
        let blobs = self.services.blobs.as_ref();

        for (index, page) in pages.into_iter().enumerate() {
            let slide_number = index as i64 + 1;
            let mut slide = Slide::new(lecture_id.clone(), slide_number, sanitize_text(&page.text));

            // Full-page render: always stored, always analyzed
            let full_path = blob::full_slide_path(&lecture_id, slide_number);
            blobs.put(&full_path, &page.render, "image/png").await?;
            slide.image_location = Some(full_path.clone());

            let chunks: Vec<Chunk> = chunk_text(&slide.raw_text, &config.chunk)
                .into_iter()
                .map(|c| Chunk::new(&slide, c.index as i64, c.text, c.hash, c.token_count as i64))
                .collect();
            let slide = db.insert_slide(&slide, &chunks).await?;

            let page_hash = perceptual_hash(&page.render, config.dedupe.hash_size)?;
            let page_image = SlideImage::new(&slide, ImageKind::FullPage, page_hash.to_hex(), full_path.clone());
            let page_image = db.insert_slide_image(&page_image).await?;
            fan_out.analysis.push(ImageAnalysisJob {
                image_id: parse_id(&page_image.id)?,
                lecture_id: job.lecture_id,
                image_hash: page_image.image_hash.clone(),
            });

            for embedded in page.images {
                let hash = match perceptual_hash(&embedded.bytes, config.dedupe.hash_size) {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(lecture_id = %lecture_id, slide_number, error = %e, "Skipping undecodable image");
                        continue;
                    }
                };

                if let Some(existing) = seen.resolve(&hash) {
                    let row = SlideImage::new(
                        &slide,
                        ImageKind::SubImage,
                        existing.hash.clone(),
                        existing.location.clone(),
                    );
                    db.insert_slide_image(&row).await?;
                    debug!(lecture_id = %lecture_id, slide_number, hash = %existing.hash, "Reused duplicate image");
                    continue;
                }

                let hex = hash.to_hex();
                let location = blob::sub_image_path(&lecture_id, &hex, &embedded.extension);
                let content_type = mime_guess::from_ext(&embedded.extension)
                    .first_or_octet_stream()
                    .to_string();
                blobs.put(&location, &embedded.bytes, &content_type).await?;
                let recorded = seen.record(hash, location);

                let row = SlideImage::new(
                    &slide,
                    ImageKind::SubImage,
                    recorded.hash.clone(),
                    recorded.location.clone(),
                );
                let row = db.insert_slide_image(&row).await?;
                fan_out.analysis.push(ImageAnalysisJob {
                    image_id: parse_id(&row.id)?,
                    lecture_id: job.lecture_id,
                    image_hash: row.image_hash.clone(),
                });
            }

            fan_out.explanation.push(ExplanationJob {
                lecture_id: job.lecture_id,
                slide_id: parse_id(&slide.id)?,
                slide_number: slide_number as u32,
                total_slides,
                slide_image_location: full_path,
            });
        }

        let total_sub_images = fan_out.analysis.len() as i64;
        db.set_ingestion_totals(&lecture_id, total_slides as i64, total_sub_images)
            .await?;

        let queue = self.services.queue.as_ref();
        for analysis in &fan_out.analysis {
            queue::publish(queue, analysis).await?;
        }
        for explanation in &fan_out.explanation {
            queue::publish(queue, explanation).await?;
        }
        if total_sub_images == 0 {
            queue::publish(queue, &EmbeddingJob { lecture_id: job.lecture_id }).await?;
        }

        db.advance_status(&lecture_id, LectureStatus::Explaining).await?;
        info!(
            lecture_id = %lecture_id,
            slides = total_slides,
            unique_images = seen.len(),
            analysis_jobs = total_sub_images,
            "Lecture ingested"
        );
        Ok(Outcome::Done)
    }
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|e| Error::Other(format!("Invalid row id {}: {}", id, e)))
}

#[async_trait]
impl Worker for IngestionWorker {
    type Job = IngestionJob;
    const STAGE: &'static str = stages::INGESTION;

    async fn handle(&self, job: IngestionJob) -> Result<Outcome> {
        if !self.services.db.lecture_is_active(&job.lecture_id.to_string()).await? {
            return Ok(Outcome::Skipped("lecture missing or terminal"));
        }

        let policy = self.services.retry_policy();
        retry_with_backoff(&policy, Self::STAGE, || self.ingest(&job)).await
    }
}
