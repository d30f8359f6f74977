use super::{Outcome, Services, Worker};
use crate::error::Result;
use crate::llm::ExplainRequest;
use crate::messages::{stages, ExplanationJob, SummaryJob};
use crate::meta::{Explanation, ExplanationCount};
use crate::retry::retry_with_backoff;
use async_trait::async_trait;
use tracing::{debug, info};

/// Explains one slide and joins the explanation track
pub struct ExplanationWorker {
    services: Services,
}

impl ExplanationWorker {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Raw text of a neighbouring slide, if it exists and has any
    async fn neighbour_text(&self, lecture_id: &str, slide_number: i64) -> Result<Option<String>> {
        if slide_number < 1 {
            return Ok(None);
        }
        let slide = self
            .services
            .db
            .get_slide_by_number(lecture_id, slide_number)
            .await?;
        Ok(slide
            .map(|s| s.raw_text)
            .filter(|text| !text.trim().is_empty()))
    }
}

#[async_trait]
impl Worker for ExplanationWorker {
    type Job = ExplanationJob;
    const STAGE: &'static str = stages::EXPLANATION;

    async fn handle(&self, job: ExplanationJob) -> Result<Outcome> {
        let db = &self.services.db;
        let lecture_id = job.lecture_id.to_string();
        let slide_id = job.slide_id.to_string();

        if !db.lecture_is_active(&lecture_id).await? {
            return Ok(Outcome::Skipped("lecture missing or terminal"));
        }
        if db.explanation_exists(&slide_id).await? {
            return Ok(Outcome::Skipped("slide already explained"));
        }
        let Some(slide) = db.get_slide(&slide_id).await? else {
            return Ok(Outcome::Skipped("slide no longer exists"));
        };

        let slide_number = slide.slide_number;
        let previous_text = self.neighbour_text(&lecture_id, slide_number - 1).await?;
        let next_text = if job.slide_number < job.total_slides {
            self.neighbour_text(&lecture_id, slide_number + 1).await?
        } else {
            None
        };

        let location = slide
            .image_location
            .clone()
            .unwrap_or_else(|| job.slide_image_location.clone());
        let image_mime = mime_guess::from_path(&location)
            .first_or_octet_stream()
            .to_string();

        let blobs = self.services.blobs.as_ref();
        let model = self.services.model.as_ref();
        let explained = retry_with_backoff(&self.services.retry_policy(), Self::STAGE, || async {
            let image = blobs.get(&location).await?;
            let request = ExplainRequest {
                image,
                image_mime: image_mime.clone(),
                slide_number: job.slide_number,
                total_slides: job.total_slides,
                previous_text: previous_text.clone(),
                next_text: next_text.clone(),
            };
            model.explain_slide(&request).await
        })
        .await?;

        let explanation = Explanation::new(
            lecture_id.clone(),
            slide_id,
            slide_number,
            explained.explanation,
            explained.one_liner,
            explained.slide_purpose.to_string(),
        );

        match db.record_explanation(&explanation).await? {
            ExplanationCount::Duplicate => Ok(Outcome::Skipped("slide already explained")),
            ExplanationCount::Counted { processed, total } if processed == total => {
                info!(lecture_id = %lecture_id, processed, total, "Last slide explained, enqueueing summary");
                self.services
                    .publish(Self::STAGE, &SummaryJob { lecture_id: job.lecture_id })
                    .await?;
                Ok(Outcome::Done)
            }
            ExplanationCount::Counted { processed, total } => {
                debug!(lecture_id = %lecture_id, slide_number, processed, total, "Slide explained");
                Ok(Outcome::Done)
            }
        }
    }
}
