//! Upload, status and delete commands

use crate::blob::FsBlobStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lecture::{self, LectureProgress};
use crate::meta::{Lecture, LectureStatus, MetaDb};
use crate::progress::add_progress_bar;
use crate::queue::SqliteQueue;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Upload a document and enqueue its ingestion
pub async fn cmd_upload(
    config: &Config,
    db: &MetaDb,
    path: &Path,
    title: Option<String>,
) -> Result<Lecture> {
    let document = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("Invalid document path: {}", path.display())))?;
    let title = title.or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
    });

    let blobs = FsBlobStore::new(config.storage_root());
    let queue = SqliteQueue::new(db.pool().clone());
    lecture::upload_lecture(db, &blobs, &queue, &document, file_name, title).await
}

/// Progress of one lecture
pub async fn cmd_status(db: &MetaDb, id: &str) -> Result<LectureProgress> {
    lecture::lecture_progress(db, id).await
}

/// Progress of every lecture, newest first
pub async fn cmd_list(db: &MetaDb) -> Result<Vec<LectureProgress>> {
    db.list_lectures()
        .await?
        .iter()
        .map(LectureProgress::from_lecture)
        .collect()
}

/// Delete a lecture and its blobs
pub async fn cmd_delete(config: &Config, db: &MetaDb, id: &str) -> Result<bool> {
    let blobs = FsBlobStore::new(config.storage_root());
    lecture::delete_lecture(db, &blobs, id).await
}

/// Poll a lecture and render progress bars until it reaches a terminal state
pub async fn cmd_watch(db: &MetaDb, id: &str, interval: Duration) -> Result<LectureProgress> {
    let mut progress = lecture::lecture_progress(db, id).await?;
    let slides = start_bar("Slides explained");
    let images = start_bar("Images analyzed");

    loop {
        update_bar(&slides, progress.processed_slides, progress.total_slides);
        update_bar(&images, progress.processed_sub_images, progress.total_sub_images);
        images.set_message(if progress.embeddings_complete {
            "Images analyzed, embeddings stored".to_string()
        } else {
            "Images analyzed".to_string()
        });
        slides.set_message(format!("Slides explained ({})", progress.status));

        if progress.is_terminal() {
            break;
        }
        tokio::time::sleep(interval).await;
        progress = lecture::lecture_progress(db, id).await?;
    }

    slides.finish_with_message(format!("Lecture {}", progress.status));
    images.finish();
    info!(lecture_id = %id, status = %progress.status, "Lecture reached a terminal state");
    Ok(progress)
}

fn start_bar(message: &str) -> ProgressBar {
    let pb = add_progress_bar(0);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn update_bar(pb: &ProgressBar, processed: i64, total: i64) {
    pb.set_length(total.max(0) as u64);
    pb.set_position(processed.max(0) as u64);
}

/// Print one lecture's progress
pub fn print_progress(progress: &LectureProgress) {
    println!("\nLecture {}", progress.id);
    if let Some(title) = &progress.title {
        println!("  Title: {}", title);
    }
    println!("  Status: {}", progress.status);
    println!(
        "  Slides explained: {}/{}",
        progress.processed_slides, progress.total_slides
    );
    println!(
        "  Images analyzed: {}/{}",
        progress.processed_sub_images, progress.total_sub_images
    );
    println!(
        "  Embeddings: {}",
        if progress.embeddings_complete { "complete" } else { "pending" }
    );
    if progress.status == LectureStatus::Failed {
        if let Some(details) = &progress.error_details {
            println!("  Failed at {}: {}", details.stage, details.message);
        }
    }
}

/// Print a table of lectures
pub fn print_lectures(lectures: &[LectureProgress]) {
    if lectures.is_empty() {
        println!("No lectures. Upload one with 'deckflow upload <file>'.");
        return;
    }

    println!(
        "{:<36}  {:<18}  {:>9}  {:>9}  {}",
        "ID", "STATUS", "SLIDES", "IMAGES", "TITLE"
    );
    for p in lectures {
        println!(
            "{:<36}  {:<18}  {:>9}  {:>9}  {}",
            p.id,
            p.status.to_string(),
            format!("{}/{}", p.processed_slides, p.total_slides),
            format!("{}/{}", p.processed_sub_images, p.total_sub_images),
            p.title.as_deref().unwrap_or("-")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::topics;
    use tempfile::TempDir;

    async fn setup() -> (Config, MetaDb, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        let db = MetaDb::connect(&config).await.unwrap();
        db.init_schema().await.unwrap();
        (config, db, tmp)
    }

    #[tokio::test]
    async fn test_upload_list_delete() {
        let (config, db, tmp) = setup().await;
        let path = tmp.path().join("week-3.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();

        let lecture = cmd_upload(&config, &db, &path, None).await.unwrap();
        assert_eq!(lecture.title.as_deref(), Some("week-3"));

        let queue = SqliteQueue::new(db.pool().clone());
        assert_eq!(queue.count(topics::INGESTION).await.unwrap(), 1);

        let listed = cmd_list(&db).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, LectureStatus::PendingProcessing);

        assert!(cmd_delete(&config, &db, &lecture.id).await.unwrap());
        assert!(matches!(
            cmd_status(&db, &lecture.id).await,
            Err(Error::LectureNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_returns_terminal_progress() {
        let (_config, db, _tmp) = setup().await;
        let lecture = Lecture::new(None);
        db.insert_lecture(&lecture).await.unwrap();
        db.advance_status(&lecture.id, LectureStatus::Complete)
            .await
            .unwrap();

        let progress = cmd_watch(&db, &lecture.id, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(progress.status, LectureStatus::Complete);
    }
}
