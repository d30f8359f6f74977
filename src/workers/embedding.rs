use super::{Outcome, Services, Worker};
use crate::embed::embed_in_batches;
use crate::error::{Error, Result};
use crate::messages::{stages, EmbeddingJob};
use crate::meta::{Chunk, LectureStatus, SlideImage};
use crate::retry::retry_with_backoff;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::info;

/// Embeds every chunk of a lecture and finishes the search-enrichment track
pub struct EmbeddingWorker {
    services: Services,
}

impl EmbeddingWorker {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

/// Append OCR and alt text of content images on the chunk's slide.
///
/// Each stored image contributes once per slide even when it appears on
/// the slide several times. A page render and a sub-image are distinct
/// even when their perceptual hashes match.
pub fn enrich_chunks(chunks: &[Chunk], content_images: &[SlideImage]) -> Vec<String> {
    let mut by_slide: HashMap<&str, Vec<String>> = HashMap::new();
    let mut seen: HashSet<(&str, &str)> = HashSet::new();

    for image in content_images.iter().filter(|i| i.is_content()) {
        if !seen.insert((image.slide_id.as_str(), image.storage_path.as_str())) {
            continue;
        }
        let parts = by_slide.entry(image.slide_id.as_str()).or_default();
        if let Some(ocr) = image.ocr_text.as_deref().filter(|t| !t.trim().is_empty()) {
            parts.push(format!("OCR Text: {}", ocr.trim()));
        }
        if let Some(alt) = image.alt_text.as_deref().filter(|t| !t.trim().is_empty()) {
            parts.push(format!("Alt Text: {}", alt.trim()));
        }
    }

    chunks
        .iter()
        .map(|chunk| match by_slide.get(chunk.slide_id.as_str()) {
            Some(parts) if !parts.is_empty() => {
                format!("{} {}", chunk.chunk_text, parts.join(" "))
            }
            _ => chunk.chunk_text.clone(),
        })
        .collect()
}

#[async_trait]
impl Worker for EmbeddingWorker {
    type Job = EmbeddingJob;
    const STAGE: &'static str = stages::EMBEDDING;

    async fn handle(&self, job: EmbeddingJob) -> Result<Outcome> {
        let db = &self.services.db;
        let lecture_id = job.lecture_id.to_string();

        if !db.lecture_is_active(&lecture_id).await? {
            return Ok(Outcome::Skipped("lecture missing or terminal"));
        }
        let Some(lecture) = db.get_lecture(&lecture_id).await? else {
            return Ok(Outcome::Skipped("lecture missing or terminal"));
        };
        if lecture.embeddings_complete {
            return Ok(Outcome::Skipped("embeddings already complete"));
        }

        let chunks = db.list_chunks(&lecture_id).await?;
        let images = db.list_content_images(&lecture_id).await?;
        let texts = enrich_chunks(&chunks, &images);

        let embedder = self.services.embedder.as_ref();
        let batch_size = self.services.config.embedding.batch_size;
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            retry_with_backoff(&self.services.retry_policy(), Self::STAGE, || {
                embed_in_batches(embedder, texts.clone(), batch_size)
            })
            .await?
        };

        if vectors.len() != chunks.len() {
            return Err(Error::Embedding(format!(
                "Expected {} vectors, got {}",
                chunks.len(),
                vectors.len()
            )));
        }

        let rows: Vec<(String, Vec<f32>)> = chunks
            .iter()
            .map(|c| c.id.clone())
            .zip(vectors)
            .collect();

        match db
            .finalize_embeddings(&lecture_id, embedder.model_name(), &rows)
            .await?
        {
            None => Ok(Outcome::Skipped("lecture missing or terminal")),
            Some(status) => {
                info!(
                    lecture_id = %lecture_id,
                    chunks = rows.len(),
                    completed = status == LectureStatus::Complete,
                    "Embeddings stored"
                );
                Ok(Outcome::Done)
            }
        }
    }
}
