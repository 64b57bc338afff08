//! Blob collaborator: attachment bytes live outside the relational store and
//! are referred to by the `stored_path` of an attachment row.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persists the bytes and returns the reference to keep on the row.
    async fn store(&self, original_name: &str, bytes: &[u8]) -> ChatResult<String>;

    async fn read(&self, reference: &str) -> ChatResult<Vec<u8>>;

    async fn delete(&self, reference: &str) -> ChatResult<()>;
}

/// Blobs as files under `<root>/attachments`, named by a random uuid that
/// keeps the original extension.
pub struct LocalBlobStore {
    dir: PathBuf,
}

impl LocalBlobStore {
    pub async fn new(root: impl AsRef<Path>) -> ChatResult<Self> {
        let dir = root.as_ref().join("attachments");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ChatError::Blob(format!("cannot create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }
}

fn stored_name(original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    format!("{}{}", Uuid::new_v4().simple(), ext)
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(&self, original_name: &str, bytes: &[u8]) -> ChatResult<String> {
        let path = self.dir.join(stored_name(original_name));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ChatError::Blob(format!("cannot write {}: {}", path.display(), e)))?;
        debug!("Stored blob {} ({} bytes)", path.display(), bytes.len());
        Ok(path.to_string_lossy().into_owned())
    }

    async fn read(&self, reference: &str) -> ChatResult<Vec<u8>> {
        tokio::fs::read(reference)
            .await
            .map_err(|e| ChatError::Blob(format!("cannot read {}: {}", reference, e)))
    }

    async fn delete(&self, reference: &str) -> ChatResult<()> {
        match tokio::fs::remove_file(reference).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Blob {} already gone", reference);
                Ok(())
            }
            Err(e) => Err(ChatError::Blob(format!("cannot delete {}: {}", reference, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_name_keeps_extension() {
        assert!(stored_name("photo.JPG").ends_with(".JPG"));
        assert!(!stored_name("README").contains('.'));
        assert_ne!(stored_name("a.txt"), stored_name("a.txt"));
    }

    #[tokio::test]
    async fn store_then_delete_round_trip() {
        let root = tempfile::TempDir::new().unwrap();
        let blobs = LocalBlobStore::new(root.path()).await.unwrap();
        assert!(root.path().join("attachments").is_dir());

        let reference = blobs.store("note.txt", b"hello").await.unwrap();
        assert_eq!(blobs.read(&reference).await.unwrap(), b"hello");

        blobs.delete(&reference).await.unwrap();
        assert!(matches!(blobs.read(&reference).await, Err(ChatError::Blob(_))));
        // Deleting twice is not an error.
        blobs.delete(&reference).await.unwrap();
    }
}
