use super::{Outcome, Services, Worker};
use crate::error::Result;
use crate::llm::SlideNote;
use crate::messages::{stages, SummaryJob};
use crate::meta::{LectureStatus, Summary};
use crate::retry::retry_with_backoff;
use async_trait::async_trait;
use tracing::info;

/// Synthesizes the lecture summary and finishes the explanation track
pub struct SummaryWorker {
    services: Services,
}

impl SummaryWorker {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Worker for SummaryWorker {
    type Job = SummaryJob;
    const STAGE: &'static str = stages::SUMMARY;

    async fn handle(&self, job: SummaryJob) -> Result<Outcome> {
        let db = &self.services.db;
        let lecture_id = job.lecture_id.to_string();

        if !db.lecture_is_active(&lecture_id).await? {
            return Ok(Outcome::Skipped("lecture missing or terminal"));
        }
        if db.summary_exists(&lecture_id).await? {
            return Ok(Outcome::Skipped("lecture already summarised"));
        }

        let notes: Vec<SlideNote> = db
            .list_explanations(&lecture_id)
            .await?
            .into_iter()
            .map(|e| SlideNote {
                slide_number: e.slide_number,
                one_liner: e.one_liner,
                explanation: e.content,
            })
            .collect();

        let model = self.services.model.as_ref();
        let content = retry_with_backoff(&self.services.retry_policy(), Self::STAGE, || {
            model.summarize(&notes)
        })
        .await?;

        let summary = Summary::new(lecture_id.clone(), content);
        match db.finalize_summary(&summary).await? {
            None => Ok(Outcome::Skipped("lecture missing or terminal")),
            Some(status) => {
                info!(
                    lecture_id = %lecture_id,
                    slides = notes.len(),
                    completed = status == LectureStatus::Complete,
                    "Summary stored"
                );
                Ok(Outcome::Done)
            }
        }
    }
}
