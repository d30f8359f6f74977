//! Lecture lifecycle: upload, progress and deletion

use crate::blob::{self, BlobStore};
use crate::error::{Error, Result};
use crate::messages::IngestionJob;
use crate::meta::{ErrorDetails, Lecture, LectureStatus, MetaDb};
use crate::queue::{self, Queue};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Progress read model exposed to callers that poll a lecture
#[derive(Debug, Clone, Serialize)]
pub struct LectureProgress {
    pub id: String,
    pub title: Option<String>,
    pub status: LectureStatus,
    pub processed_slides: i64,
    pub total_slides: i64,
    pub processed_sub_images: i64,
    pub total_sub_images: i64,
    pub embeddings_complete: bool,
    pub error_details: Option<ErrorDetails>,
}

impl LectureProgress {
    pub fn from_lecture(lecture: &Lecture) -> Result<Self> {
        Ok(Self {
            id: lecture.id.clone(),
            title: lecture.title.clone(),
            status: lecture.get_status()?,
            processed_slides: lecture.processed_slides,
            total_slides: lecture.total_slides,
            processed_sub_images: lecture.processed_sub_images,
            total_sub_images: lecture.total_sub_images,
            embeddings_complete: lecture.embeddings_complete,
            error_details: lecture.error(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Create a lecture, store its document and enqueue ingestion
pub async fn upload_lecture(
    db: &MetaDb,
    blobs: &dyn BlobStore,
    queue: &dyn Queue,
    document: &[u8],
    file_name: &str,
    title: Option<String>,
) -> Result<Lecture> {
    let file_name = std::path::Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("Invalid document name: {}", file_name)))?
        .to_string();

    let mut lecture = Lecture::new(title);
    db.insert_lecture(&lecture).await?;

    let location = blob::document_path(&lecture.id, &file_name);
    let content_type = mime_guess::from_path(&file_name)
        .first_or_octet_stream()
        .to_string();
    if let Err(e) = blobs.put(&location, document, &content_type).await {
        warn!(lecture_id = %lecture.id, error = %e, "Document upload failed, removing lecture");
        db.delete_lecture(&lecture.id).await?;
        return Err(e);
    }
    db.set_document_location(&lecture.id, &location).await?;
    db.advance_status(&lecture.id, LectureStatus::PendingProcessing)
        .await?;

    let lecture_id = Uuid::parse_str(&lecture.id)
        .map_err(|e| Error::Other(format!("Invalid lecture id: {}", e)))?;
    queue::publish(
        queue,
        &IngestionJob {
            lecture_id,
            document_location: location.clone(),
        },
    )
    .await?;

    info!(lecture_id = %lecture.id, %location, "Lecture uploaded");
    lecture.document_location = Some(location);
    lecture.status = LectureStatus::PendingProcessing.to_string();
    Ok(lecture)
}

/// Current progress of a lecture
pub async fn lecture_progress(db: &MetaDb, id: &str) -> Result<LectureProgress> {
    let lecture = db
        .get_lecture(id)
        .await?
        .ok_or_else(|| Error::LectureNotFound(id.to_string()))?;
    LectureProgress::from_lecture(&lecture)
}

/// Delete a lecture, its rows and its blobs.
///
/// In-flight messages for the lecture are not recalled; every worker checks
/// that its lecture still exists before doing any work.
pub async fn delete_lecture(db: &MetaDb, blobs: &dyn BlobStore, id: &str) -> Result<bool> {
    if db.get_lecture(id).await?.is_none() {
        return Ok(false);
    }
    let deleted = db.delete_lecture(id).await?;
    let removed = blobs.delete_prefix(&blob::lecture_prefix(id)).await?;
    info!(lecture_id = %id, blobs_removed = removed, "Lecture deleted");
    Ok(deleted)
}
