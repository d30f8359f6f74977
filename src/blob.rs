//! Blob storage for documents and slide images

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Get/put/delete by relative path
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete everything under a prefix, returning the number of objects removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Storage key of a slide's full-page render
pub fn full_slide_path(lecture_id: &str, slide_number: i64) -> String {
    format!("lectures/{}/slides/{}/full_slide.png", lecture_id, slide_number)
}

/// Storage key of a deduplicated sub-image
pub fn sub_image_path(lecture_id: &str, image_hash: &str, extension: &str) -> String {
    format!("lectures/{}/images/{}.{}", lecture_id, image_hash, extension)
}

/// Storage key of an uploaded document
pub fn document_path(lecture_id: &str, file_name: &str) -> String {
    format!("lectures/{}/{}", lecture_id, file_name)
}

/// Prefix holding every object of a lecture
pub fn lecture_prefix(lecture_id: &str) -> String {
    format!("lectures/{}", lecture_id)
}

/// Blob store on the local filesystem
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a storage key below the root, rejecting escapes
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty() {
            return Err(Error::Blob("Empty storage path".to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(Error::Config(format!(
                        "Storage path must be relative without '..': {}",
                        path
                    )))
                }
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        debug!(path, content_type, size = bytes.len(), "Stored blob");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| Error::Blob(format!("Failed to read {}: {}", path, e)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let target = self.resolve(prefix)?;
        if !tokio::fs::try_exists(&target).await? {
            return Ok(0);
        }
        if tokio::fs::metadata(&target).await?.is_file() {
            tokio::fs::remove_file(&target).await?;
            return Ok(1);
        }

        let mut removed = 0;
        let mut stack = vec![target.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    stack.push(entry.path());
                } else {
                    removed += 1;
                }
            }
        }
        tokio::fs::remove_dir_all(&target).await?;
        debug!(prefix, removed, "Deleted blob prefix");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path());

        let path = full_slide_path("lec", 1);
        store.put(&path, b"png", "image/png").await.unwrap();
        assert_eq!(store.get(&path).await.unwrap(), b"png");

        store.delete(&path).await.unwrap();
        assert!(store.get(&path).await.is_err());
        // Deleting twice is fine
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path());
        store.put(&full_slide_path("a", 1), b"1", "image/png").await.unwrap();
        store.put(&sub_image_path("a", "ff00", "png"), b"2", "image/png").await.unwrap();
        store.put(&full_slide_path("b", 1), b"3", "image/png").await.unwrap();

        assert_eq!(store.delete_prefix(&lecture_prefix("a")).await.unwrap(), 2);
        assert_eq!(store.delete_prefix(&lecture_prefix("a")).await.unwrap(), 0);
        assert!(store.get(&full_slide_path("b", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path());
        assert!(store.put("../outside", b"x", "text/plain").await.is_err());
        assert!(store.put("/etc/passwd", b"x", "text/plain").await.is_err());
        assert!(store.get("").await.is_err());
    }
}
