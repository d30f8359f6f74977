use super::{Outcome, Services, Worker};
use crate::error::Result;
use crate::messages::{stages, EmbeddingJob, ImageAnalysisJob};
use crate::meta::ImageCount;
use crate::retry::retry_with_backoff;
use async_trait::async_trait;
use tracing::{debug, info};

/// Analyzes one unique image and joins the image track
pub struct ImageAnalysisWorker {
    services: Services,
}

impl ImageAnalysisWorker {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Worker for ImageAnalysisWorker {
    type Job = ImageAnalysisJob;
    const STAGE: &'static str = stages::IMAGE_ANALYSIS;

    async fn handle(&self, job: ImageAnalysisJob) -> Result<Outcome> {
        let db = &self.services.db;
        let lecture_id = job.lecture_id.to_string();
        let image_id = job.image_id.to_string();

        if !db.lecture_is_active(&lecture_id).await? {
            return Ok(Outcome::Skipped("lecture missing or terminal"));
        }

        let Some(image) = db.get_slide_image(&image_id).await? else {
            return Ok(Outcome::Skipped("image row no longer exists"));
        };
        if image.analyzed {
            return Ok(Outcome::Skipped("image already analyzed"));
        }

        let mime = mime_guess::from_path(&image.storage_path)
            .first_or_octet_stream()
            .to_string();
        let blobs = self.services.blobs.as_ref();
        let model = self.services.model.as_ref();
        let analysis = retry_with_backoff(&self.services.retry_policy(), Self::STAGE, || async {
            let bytes = blobs.get(&image.storage_path).await?;
            model.analyze_image(&bytes, &mime).await
        })
        .await?;

        let count = db
            .record_image_analysis(
                &image_id,
                &lecture_id,
                &job.image_hash,
                analysis.image_type,
                &analysis.ocr_text,
                &analysis.alt_text,
            )
            .await?;

        match count {
            ImageCount::AlreadyCounted => Ok(Outcome::Skipped("image already counted")),
            ImageCount::Counted { processed, total } if processed == total => {
                info!(lecture_id = %lecture_id, processed, total, "Last image analyzed, enqueueing embedding");
                self.services
                    .publish(Self::STAGE, &EmbeddingJob { lecture_id: job.lecture_id })
                    .await?;
                Ok(Outcome::Done)
            }
            ImageCount::Counted { processed, total } => {
                debug!(lecture_id = %lecture_id, processed, total, "Image analyzed");
                Ok(Outcome::Done)
            }
        }
    }
}
