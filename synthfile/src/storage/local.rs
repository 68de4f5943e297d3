use super::{Reference, Result, StorageBackend, StorageError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// Prefix for files still being written; they are renamed into place once complete.
const PARTIAL_PREFIX: &str = ".partial-";

/// Local filesystem storage backend - keeps files directly under a root directory.
///
/// Files are sized with `set_len`, so on filesystems with sparse file support a 1 GiB file
/// costs no disk blocks until something writes real data into it. Reads return zeroes either way.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create the root directory if needed and return a backend over it
    pub async fn create(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await?;
        tracing::info!("Using local file storage at {:?}", root);
        Ok(Self::new(root))
    }

    /// Map a name to a path, refusing anything that could escape the root
    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(StorageError::InvalidKey(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        // Only regular files count; anything else under the name can't be served
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_zeroes(&self, name: &str, len: u64) -> Result<()> {
        let target = self.path_for(name)?;
        let partial = self.root.join(format!("{PARTIAL_PREFIX}{}-{name}", uuid::Uuid::new_v4()));

        let written = async {
            let file = fs::File::create(&partial).await?;
            file.set_len(len).await?;
            file.sync_all().await?;
            fs::rename(&partial, &target).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&partial).await {
                tracing::debug!("Could not remove partial file {:?}: {}", partial, cleanup);
            }
            return Err(e.into());
        }

        Ok(())
    }

    async fn reference(&self, name: &str, _ttl: Duration) -> Result<Reference> {
        Ok(Reference::Path(self.path_for(name)?))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            // Skip in-progress writes and other hidden files
            match entry.file_name().into_string() {
                Ok(name) if !name.starts_with('.') => names.push(name),
                _ => {}
            }
        }

        names.sort();
        Ok(names)
    }

    fn describe(&self) -> String {
        format!("local directory {}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_storage_lifecycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        assert!(!storage.exists("5KB.bin").await.unwrap());

        storage.write_zeroes("5KB.bin", 5120).await.unwrap();
        assert!(storage.exists("5KB.bin").await.unwrap());

        let content = std::fs::read(temp_dir.path().join("5KB.bin")).unwrap();
        assert_eq!(content.len(), 5120);
        assert!(content.iter().all(|b| *b == 0));

        let reference = storage.reference("5KB.bin", Duration::from_secs(60)).await.unwrap();
        assert_eq!(reference, Reference::Path(temp_dir.path().join("5KB.bin")));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        std::fs::write(temp_dir.path().join("1KB.bin"), b"not zeroes").unwrap();
        storage.write_zeroes("1KB.bin", 1024).await.unwrap();

        let content = std::fs::read(temp_dir.path().join("1KB.bin")).unwrap();
        assert_eq!(content, vec![0u8; 1024]);
    }

    #[tokio::test]
    async fn test_list_skips_hidden_and_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        storage.write_zeroes("2KB.bin", 2048).await.unwrap();
        storage.write_zeroes("1KB.bin", 1024).await.unwrap();
        std::fs::write(temp_dir.path().join(".partial-abc-3KB.bin"), b"").unwrap();
        std::fs::create_dir(temp_dir.path().join("subdir")).unwrap();

        let names = storage.list().await.unwrap();
        assert_eq!(names, vec!["1KB.bin".to_string(), "2KB.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_directory_under_name_is_not_a_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());
        std::fs::create_dir(temp_dir.path().join("4KB.bin")).unwrap();

        assert!(!storage.exists("4KB.bin").await.unwrap());

        // The directory is in the way, so the write fails and cleans up after itself
        let result = storage.write_zeroes("4KB.bin", 4096).await;
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert!(temp_dir.path().join("4KB.bin").is_dir());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_rejects_keys_outside_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        for name in ["../1KB.bin", "a/1KB.bin", ".hidden", ""] {
            let result = storage.exists(name).await;
            assert!(matches!(result, Err(StorageError::InvalidKey(_))), "{name} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_list_missing_root_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(temp_dir.path().join("gone"));

        assert!(matches!(storage.list().await, Err(StorageError::Io(_))));
    }
}
