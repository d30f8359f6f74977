//! Entity storage using SQLite
//!
//! This module holds every row the pipeline coordinates through:
//! - Lectures (status, fan-in counters, embedding flag)
//! - Slides, chunks and slide images written by ingestion
//! - Explanations, summaries and embeddings written by the workers
//! - Dead-letter records kept for inspection
//!
//! Workers never coordinate directly. Every join decision is an atomic
//! statement (or short transaction) against the lecture row.

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Lecture processing status, in forward order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LectureStatus {
    Uploading,
    PendingProcessing,
    Parsing,
    Explaining,
    Summarising,
    Complete,
    Failed,
}

impl LectureStatus {
    /// Statuses from which `self` can be reached by a forward write
    pub fn predecessors(self) -> &'static [LectureStatus] {
        use LectureStatus::*;
        match self {
            Uploading => &[],
            PendingProcessing => &[Uploading],
            Parsing => &[Uploading, PendingProcessing],
            Explaining => &[Uploading, PendingProcessing, Parsing],
            Summarising => &[Uploading, PendingProcessing, Parsing, Explaining],
            Complete => &[Uploading, PendingProcessing, Parsing, Explaining, Summarising],
            Failed => &[Uploading, PendingProcessing, Parsing, Explaining, Summarising],
        }
    }

    /// Terminal states receive no further processing
    pub fn is_terminal(self) -> bool {
        matches!(self, LectureStatus::Complete | LectureStatus::Failed)
    }

    fn sql_in_list(statuses: &[LectureStatus]) -> String {
        statuses
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::fmt::Display for LectureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LectureStatus::Uploading => "uploading",
            LectureStatus::PendingProcessing => "pending_processing",
            LectureStatus::Parsing => "parsing",
            LectureStatus::Explaining => "explaining",
            LectureStatus::Summarising => "summarising",
            LectureStatus::Complete => "complete",
            LectureStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for LectureStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "uploading" => Ok(LectureStatus::Uploading),
            "pending_processing" => Ok(LectureStatus::PendingProcessing),
            "parsing" => Ok(LectureStatus::Parsing),
            "explaining" => Ok(LectureStatus::Explaining),
            "summarising" => Ok(LectureStatus::Summarising),
            "complete" => Ok(LectureStatus::Complete),
            "failed" => Ok(LectureStatus::Failed),
            _ => Err(Error::Config(format!("Unknown lecture status: {}", s))),
        }
    }
}

/// Whether a slide image is the page render or an embedded picture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    FullPage,
    SubImage,
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageKind::FullPage => write!(f, "full_page"),
            ImageKind::SubImage => write!(f, "sub_image"),
        }
    }
}

/// Classification returned by image analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Content,
    Decorative,
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageType::Content => write!(f, "content"),
            ImageType::Decorative => write!(f, "decorative"),
        }
    }
}

impl FromStr for ImageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "content" => Ok(ImageType::Content),
            "decorative" => Ok(ImageType::Decorative),
            _ => Err(Error::Config(format!("Unknown image type: {}", s))),
        }
    }
}

/// Structured failure written to `lectures.error_details`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub stage: String,
    pub message: String,
}

/// A lecture row, also the progress read model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Lecture {
    pub id: String,
    pub title: Option<String>,
    pub document_location: Option<String>,
    pub status: String,
    pub total_slides: i64,
    pub processed_slides: i64,
    pub total_sub_images: i64,
    pub processed_sub_images: i64,
    pub embeddings_complete: bool,
    pub error_details: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl Lecture {
    pub fn new(title: Option<String>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            document_location: None,
            status: LectureStatus::Uploading.to_string(),
            total_slides: 0,
            processed_slides: 0,
            total_sub_images: 0,
            processed_sub_images: 0,
            embeddings_complete: false,
            error_details: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn get_status(&self) -> Result<LectureStatus> {
        self.status.parse()
    }

    /// Parsed error details, if the lecture failed
    pub fn error(&self) -> Option<ErrorDetails> {
        self.error_details
            .as_ref()
            .and_then(|json| serde_json::from_str(json).ok())
    }
}

/// One page of a lecture
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Slide {
    pub id: String,
    pub lecture_id: String,
    pub slide_number: i64,
    pub raw_text: String,
    pub image_location: Option<String>,
    pub created_at: String,
}

impl Slide {
    pub fn new(lecture_id: String, slide_number: i64, raw_text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            lecture_id,
            slide_number,
            raw_text,
            image_location: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// A token-bounded window of slide text
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub lecture_id: String,
    pub slide_id: String,
    pub slide_number: i64,
    pub chunk_index: i64,
    pub chunk_text: String,
    pub chunk_hash: String,
    pub token_count: i64,
    pub created_at: String,
}

impl Chunk {
    pub fn new(slide: &Slide, chunk_index: i64, chunk_text: String, chunk_hash: String, token_count: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            lecture_id: slide.lecture_id.clone(),
            slide_id: slide.id.clone(),
            slide_number: slide.slide_number,
            chunk_index,
            chunk_text,
            chunk_hash,
            token_count,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// An image shown on a slide
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SlideImage {
    pub id: String,
    pub lecture_id: String,
    pub slide_id: String,
    pub kind: String,
    pub image_hash: String,
    pub storage_path: String,
    pub image_type: Option<String>,
    pub ocr_text: Option<String>,
    pub alt_text: Option<String>,
    pub analyzed: bool,
    pub created_at: String,
}

impl SlideImage {
    pub fn new(slide: &Slide, kind: ImageKind, image_hash: String, storage_path: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            lecture_id: slide.lecture_id.clone(),
            slide_id: slide.id.clone(),
            kind: kind.to_string(),
            image_hash,
            storage_path,
            image_type: None,
            ocr_text: None,
            alt_text: None,
            analyzed: false,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn is_content(&self) -> bool {
        self.image_type
            .as_deref()
            .and_then(|t| t.parse::<ImageType>().ok())
            == Some(ImageType::Content)
    }
}

/// The explanation of one slide
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Explanation {
    pub id: String,
    pub lecture_id: String,
    pub slide_id: String,
    pub slide_number: i64,
    pub content: String,
    pub one_liner: String,
    pub slide_purpose: String,
    pub created_at: String,
}

impl Explanation {
    pub fn new(
        lecture_id: String,
        slide_id: String,
        slide_number: i64,
        content: String,
        one_liner: String,
        slide_purpose: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            lecture_id,
            slide_id,
            slide_number,
            content,
            one_liner,
            slide_purpose,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// The consolidated summary of a lecture
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Summary {
    pub lecture_id: String,
    pub content: String,
    pub created_at: String,
}

impl Summary {
    pub fn new(lecture_id: String, content: String) -> Self {
        Self {
            lecture_id,
            content,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// A persisted dead-lettered message
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub subscription_name: String,
    pub message_id: String,
    pub payload: String,
    pub attributes: Option<String>,
    pub status: String,
    pub received_at: String,
}

impl DeadLetterRecord {
    pub fn new(subscription_name: String, message_id: String, payload: String, attributes: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subscription_name,
            message_id,
            payload,
            attributes,
            status: "unprocessed".to_string(),
            received_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Result of counting one analyzed image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCount {
    /// This delivery had already been counted, or its row is gone
    AlreadyCounted,
    Counted { processed: i64, total: i64 },
}

/// Result of recording one slide explanation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplanationCount {
    /// An explanation already existed for the slide
    Duplicate,
    Counted { processed: i64, total: i64 },
}

/// Encode a vector as little-endian f32 bytes
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes
pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Entity database handle
#[derive(Clone)]
pub struct MetaDb {
    pool: SqlitePool,
}

impl MetaDb {
    /// Connect to the entity database
    pub async fn connect(config: &Config) -> Result<Self> {
        let db_path = &config.paths.db_file;

        // Create parent directory if needed
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(10))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Shared connection pool (the queue lives in the same database)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='lectures'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    // ===== Lecture Operations =====

    /// Insert a new lecture
    pub async fn insert_lecture(&self, lecture: &Lecture) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO lectures (id, title, document_location, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&lecture.id)
        .bind(&lecture.title)
        .bind(&lecture.document_location)
        .bind(&lecture.status)
        .bind(&lecture.created_at)
        .bind(&lecture.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get lecture by ID
    pub async fn get_lecture(&self, id: &str) -> Result<Option<Lecture>> {
        let lecture = sqlx::query_as::<_, Lecture>("SELECT * FROM lectures WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(lecture)
    }

    /// List all lectures, newest first
    pub async fn list_lectures(&self) -> Result<Vec<Lecture>> {
        let lectures =
            sqlx::query_as::<_, Lecture>("SELECT * FROM lectures ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(lectures)
    }

    /// Whether the lecture exists and can still be processed
    pub async fn lecture_is_active(&self, id: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM lectures WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((status,)) => Ok(!status.parse::<LectureStatus>()?.is_terminal()),
            None => Ok(false),
        }
    }

    /// Set the stored document location
    pub async fn set_document_location(&self, id: &str, location: &str) -> Result<()> {
        sqlx::query("UPDATE lectures SET document_location = ?, updated_at = ? WHERE id = ?")
            .bind(location)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a lecture forward to `to`.
    ///
    /// Returns false when the lecture is missing or already at or past `to`.
    pub async fn advance_status(&self, id: &str, to: LectureStatus) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let changed = advance_status_on(&mut conn, id, to).await?;
        Ok(changed)
    }

    /// Mark a lecture failed with structured details
    pub async fn mark_failed(&self, id: &str, details: &ErrorDetails) -> Result<bool> {
        let sql = format!(
            "UPDATE lectures SET status = ?, error_details = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            LectureStatus::sql_in_list(LectureStatus::Failed.predecessors())
        );
        let result = sqlx::query(&sql)
            .bind(LectureStatus::Failed.to_string())
            .bind(serde_json::to_string(details)?)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a lecture and, by cascade, every row that belongs to it
    pub async fn delete_lecture(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM lectures WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ===== Ingestion Operations =====

    /// Start (or resume) parsing a lecture.
    ///
    /// Rows written by an earlier or concurrent run of the same ingestion are
    /// kept; the inserts below converge on them. Returns false if the lecture
    /// is gone or has already moved past parsing.
    pub async fn begin_ingestion(&self, id: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE lectures SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            LectureStatus::sql_in_list(&[
                LectureStatus::Uploading,
                LectureStatus::PendingProcessing,
                LectureStatus::Parsing,
            ])
        );
        let result = sqlx::query(&sql)
            .bind(LectureStatus::Parsing.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a slide together with its chunks.
    ///
    /// Idempotent on `(lecture_id, slide_number)` and `(slide_id, chunk_index)`:
    /// when the slide already exists the stored row wins and is returned, and
    /// chunks attach to it.
    pub async fn insert_slide(&self, slide: &Slide, chunks: &[Chunk]) -> Result<Slide> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO slides (id, lecture_id, slide_number, raw_text, image_location, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(lecture_id, slide_number) DO NOTHING
            "#,
        )
        .bind(&slide.id)
        .bind(&slide.lecture_id)
        .bind(slide.slide_number)
        .bind(&slide.raw_text)
        .bind(&slide.image_location)
        .bind(&slide.created_at)
        .execute(&mut *tx)
        .await?;

        let stored = sqlx::query_as::<_, Slide>(
            "SELECT * FROM slides WHERE lecture_id = ? AND slide_number = ?",
        )
        .bind(&slide.lecture_id)
        .bind(slide.slide_number)
        .fetch_one(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, lecture_id, slide_id, slide_number, chunk_index, chunk_text, chunk_hash, token_count, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(slide_id, chunk_index) DO NOTHING
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.lecture_id)
            .bind(&stored.id)
            .bind(chunk.slide_number)
            .bind(chunk.chunk_index)
            .bind(&chunk.chunk_text)
            .bind(&chunk.chunk_hash)
            .bind(chunk.token_count)
            .bind(&chunk.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(stored)
    }

    /// Insert a slide image row, returning the stored row.
    ///
    /// Idempotent on `(slide_id, storage_path)`.
    pub async fn insert_slide_image(&self, image: &SlideImage) -> Result<SlideImage> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO slide_images (id, lecture_id, slide_id, kind, image_hash, storage_path, image_type, ocr_text, alt_text, analyzed, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(slide_id, storage_path) DO NOTHING
            "#,
        )
        .bind(&image.id)
        .bind(&image.lecture_id)
        .bind(&image.slide_id)
        .bind(&image.kind)
        .bind(&image.image_hash)
        .bind(&image.storage_path)
        .bind(&image.image_type)
        .bind(&image.ocr_text)
        .bind(&image.alt_text)
        .bind(image.analyzed)
        .bind(&image.created_at)
        .execute(&mut *tx)
        .await?;

        let stored = sqlx::query_as::<_, SlideImage>(
            "SELECT * FROM slide_images WHERE slide_id = ? AND storage_path = ?",
        )
        .bind(&image.slide_id)
        .bind(&image.storage_path)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    /// Persist the fan-out totals both tracks join on.
    ///
    /// Must run before any job of the run is published.
    pub async fn set_ingestion_totals(&self, id: &str, total_slides: i64, total_sub_images: i64) -> Result<()> {
        sqlx::query(
            "UPDATE lectures SET total_slides = ?, total_sub_images = ?, updated_at = ? WHERE id = ?",
        )
        .bind(total_slides)
        .bind(total_sub_images)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ===== Slide Operations =====

    /// Get slide by ID
    pub async fn get_slide(&self, id: &str) -> Result<Option<Slide>> {
        let slide = sqlx::query_as::<_, Slide>("SELECT * FROM slides WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(slide)
    }

    /// Get slide by lecture and number
    pub async fn get_slide_by_number(&self, lecture_id: &str, slide_number: i64) -> Result<Option<Slide>> {
        let slide = sqlx::query_as::<_, Slide>(
            "SELECT * FROM slides WHERE lecture_id = ? AND slide_number = ?",
        )
        .bind(lecture_id)
        .bind(slide_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(slide)
    }

    /// List slides of a lecture in order
    pub async fn list_slides(&self, lecture_id: &str) -> Result<Vec<Slide>> {
        let slides = sqlx::query_as::<_, Slide>(
            "SELECT * FROM slides WHERE lecture_id = ? ORDER BY slide_number",
        )
        .bind(lecture_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(slides)
    }

    /// List chunks of a lecture in reading order
    pub async fn list_chunks(&self, lecture_id: &str) -> Result<Vec<Chunk>> {
        let chunks = sqlx::query_as::<_, Chunk>(
            "SELECT * FROM chunks WHERE lecture_id = ? ORDER BY slide_number, chunk_index",
        )
        .bind(lecture_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chunks)
    }

    // ===== Image Operations =====

    /// Get slide image by ID
    pub async fn get_slide_image(&self, id: &str) -> Result<Option<SlideImage>> {
        let image = sqlx::query_as::<_, SlideImage>("SELECT * FROM slide_images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(image)
    }

    /// List all image rows of a lecture
    pub async fn list_slide_images(&self, lecture_id: &str) -> Result<Vec<SlideImage>> {
        let images = sqlx::query_as::<_, SlideImage>(
            "SELECT * FROM slide_images WHERE lecture_id = ? ORDER BY created_at, id",
        )
        .bind(lecture_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(images)
    }

    /// Record the analysis of one image and count it toward the lecture.
    ///
    /// The triggering row's `analyzed` marker is flipped first; only the
    /// delivery that flips it propagates the result to every row sharing
    /// `(lecture_id, image_hash)` and increments the counter. The increment
    /// and the read-back happen in one statement, so exactly one caller ever
    /// observes `processed == total`.
    pub async fn record_image_analysis(
        &self,
        image_id: &str,
        lecture_id: &str,
        image_hash: &str,
        image_type: ImageType,
        ocr_text: &str,
        alt_text: &str,
    ) -> Result<ImageCount> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            "UPDATE slide_images SET analyzed = 1 WHERE id = ? AND lecture_id = ? AND analyzed = 0",
        )
        .bind(image_id)
        .bind(lecture_id)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ImageCount::AlreadyCounted);
        }

        sqlx::query(
            r#"
            UPDATE slide_images SET image_type = ?, ocr_text = ?, alt_text = ?
            WHERE lecture_id = ? AND image_hash = ?
              AND kind = (SELECT kind FROM slide_images WHERE id = ?)
            "#,
        )
        .bind(image_type.to_string())
        .bind(ocr_text)
        .bind(alt_text)
        .bind(lecture_id)
        .bind(image_hash)
        .bind(image_id)
        .execute(&mut *tx)
        .await?;

        let counted: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE lectures SET processed_sub_images = processed_sub_images + 1, updated_at = ?
            WHERE id = ? AND processed_sub_images < total_sub_images
            RETURNING processed_sub_images, total_sub_images
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(lecture_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(match counted {
            Some((processed, total)) => ImageCount::Counted { processed, total },
            None => ImageCount::AlreadyCounted,
        })
    }

    /// Images classified as content, used to enrich chunk text
    pub async fn list_content_images(&self, lecture_id: &str) -> Result<Vec<SlideImage>> {
        let images = sqlx::query_as::<_, SlideImage>(
            r#"
            SELECT * FROM slide_images
            WHERE lecture_id = ? AND image_type = 'content'
            ORDER BY created_at, id
            "#,
        )
        .bind(lecture_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(images)
    }

    // ===== Explanation Operations =====

    /// Check whether a slide already has an explanation
    pub async fn explanation_exists(&self, slide_id: &str) -> Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM explanations WHERE slide_id = ?")
            .bind(slide_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Insert an explanation and count it toward the lecture.
    ///
    /// The counter moves only when the insert created the row. When the
    /// count reaches the slide total the lecture advances to `summarising`
    /// in the same transaction.
    pub async fn record_explanation(&self, explanation: &Explanation) -> Result<ExplanationCount> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO explanations (id, lecture_id, slide_id, slide_number, content, one_liner, slide_purpose, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(slide_id) DO NOTHING
            "#,
        )
        .bind(&explanation.id)
        .bind(&explanation.lecture_id)
        .bind(&explanation.slide_id)
        .bind(explanation.slide_number)
        .bind(&explanation.content)
        .bind(&explanation.one_liner)
        .bind(&explanation.slide_purpose)
        .bind(&explanation.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ExplanationCount::Duplicate);
        }

        let counted: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE lectures SET processed_slides = processed_slides + 1, updated_at = ?
            WHERE id = ? AND processed_slides < total_slides
            RETURNING processed_slides, total_slides
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&explanation.lecture_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match counted {
            Some((processed, total)) => {
                if processed == total {
                    advance_status_on(&mut tx, &explanation.lecture_id, LectureStatus::Summarising)
                        .await?;
                }
                ExplanationCount::Counted { processed, total }
            }
            None => ExplanationCount::Duplicate,
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// List explanations of a lecture by slide number
    pub async fn list_explanations(&self, lecture_id: &str) -> Result<Vec<Explanation>> {
        let explanations = sqlx::query_as::<_, Explanation>(
            "SELECT * FROM explanations WHERE lecture_id = ? ORDER BY slide_number",
        )
        .bind(lecture_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(explanations)
    }

    // ===== Completion Operations =====

    /// Check whether a lecture already has a summary
    pub async fn summary_exists(&self, lecture_id: &str) -> Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM summaries WHERE lecture_id = ?")
            .bind(lecture_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Get the summary of a lecture
    pub async fn get_summary(&self, lecture_id: &str) -> Result<Option<Summary>> {
        let summary = sqlx::query_as::<_, Summary>("SELECT * FROM summaries WHERE lecture_id = ?")
            .bind(lecture_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(summary)
    }

    /// Finish the explanation track.
    ///
    /// Persists the summary, confirms `summarising` and reads the embedding
    /// flag in one transaction; completes the lecture if embeddings are done.
    /// Returns the resulting status, or `None` if the lecture is gone.
    pub async fn finalize_summary(&self, summary: &Summary) -> Result<Option<LectureStatus>> {
        let mut tx = self.pool.begin().await?;

        let Some((status, embeddings_complete)) = touch_lecture(&mut tx, &summary.lecture_id).await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };
        if status.is_terminal() {
            tx.commit().await?;
            return Ok(Some(status));
        }

        sqlx::query(
            r#"
            INSERT INTO summaries (lecture_id, content, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(lecture_id) DO NOTHING
            "#,
        )
        .bind(&summary.lecture_id)
        .bind(&summary.content)
        .bind(&summary.created_at)
        .execute(&mut *tx)
        .await?;

        advance_status_on(&mut tx, &summary.lecture_id, LectureStatus::Summarising).await?;

        let final_status = if embeddings_complete {
            advance_status_on(&mut tx, &summary.lecture_id, LectureStatus::Complete).await?;
            LectureStatus::Complete
        } else {
            LectureStatus::Summarising
        };

        tx.commit().await?;
        Ok(Some(final_status))
    }

    /// Finish the search-enrichment track.
    ///
    /// Persists every vector, sets `embeddings_complete` and reads back the
    /// status in one transaction. Completes the lecture only when the
    /// explanation track has already produced its summary.
    pub async fn finalize_embeddings(
        &self,
        lecture_id: &str,
        model: &str,
        vectors: &[(String, Vec<f32>)],
    ) -> Result<Option<LectureStatus>> {
        let mut tx = self.pool.begin().await?;

        let Some((status, _)) = touch_lecture(&mut tx, lecture_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        if status.is_terminal() {
            tx.commit().await?;
            return Ok(Some(status));
        }

        let now = Utc::now().to_rfc3339();
        for (chunk_id, vector) in vectors {
            sqlx::query(
                r#"
                INSERT INTO embeddings (chunk_id, lecture_id, model, dimension, vector, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    model = excluded.model,
                    dimension = excluded.dimension,
                    vector = excluded.vector,
                    created_at = excluded.created_at
                "#,
            )
            .bind(chunk_id)
            .bind(lecture_id)
            .bind(model)
            .bind(vector.len() as i64)
            .bind(encode_vector(vector))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        let (status,): (String,) = sqlx::query_as(
            "UPDATE lectures SET embeddings_complete = 1, updated_at = ? WHERE id = ? RETURNING status",
        )
        .bind(&now)
        .bind(lecture_id)
        .fetch_one(&mut *tx)
        .await?;
        let status: LectureStatus = status.parse()?;

        let summarised: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM summaries WHERE lecture_id = ?")
            .bind(lecture_id)
            .fetch_optional(&mut *tx)
            .await?;

        let final_status = if status == LectureStatus::Summarising && summarised.is_some() {
            advance_status_on(&mut tx, lecture_id, LectureStatus::Complete).await?;
            LectureStatus::Complete
        } else {
            status
        };

        tx.commit().await?;
        Ok(Some(final_status))
    }

    /// Count stored embeddings for a lecture
    pub async fn count_embeddings(&self, lecture_id: &str) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embeddings WHERE lecture_id = ?")
            .bind(lecture_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as usize)
    }

    /// Get the stored vector of a chunk
    pub async fn get_embedding(&self, chunk_id: &str) -> Result<Option<Vec<f32>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT vector FROM embeddings WHERE chunk_id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(bytes,)| decode_vector(&bytes)))
    }

    // ===== Dead-letter Operations =====

    /// Persist a dead-lettered message
    pub async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_messages (id, subscription_name, message_id, payload, attributes, status, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.subscription_name)
        .bind(&record.message_id)
        .bind(&record.payload)
        .bind(&record.attributes)
        .bind(&record.status)
        .bind(&record.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List dead-letter records, newest first
    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterRecord>> {
        let records = sqlx::query_as::<_, DeadLetterRecord>(
            "SELECT * FROM dead_letter_messages ORDER BY received_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

/// Forward-only status write on an open connection or transaction
async fn advance_status_on(
    conn: &mut sqlx::SqliteConnection,
    id: &str,
    to: LectureStatus,
) -> Result<bool> {
    let completed_at = if to == LectureStatus::Complete {
        Some(Utc::now().to_rfc3339())
    } else {
        None
    };
    let sql = format!(
        "UPDATE lectures SET status = ?, updated_at = ?, completed_at = COALESCE(?, completed_at) WHERE id = ? AND status IN ({})",
        LectureStatus::sql_in_list(to.predecessors())
    );
    let result = sqlx::query(&sql)
        .bind(to.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(completed_at)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() > 0 {
        debug!(lecture_id = %id, status = %to, "Lecture status advanced");
    }
    Ok(result.rows_affected() > 0)
}

/// Take the write lock on a lecture row and read its completion state
async fn touch_lecture(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
) -> Result<Option<(LectureStatus, bool)>> {
    let row: Option<(String, bool)> = sqlx::query_as(
        "UPDATE lectures SET updated_at = ? WHERE id = ? RETURNING status, embeddings_complete",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    match row {
        Some((status, flag)) => Ok(Some((status.parse()?, flag))),
        None => Ok(None),
    }
}
