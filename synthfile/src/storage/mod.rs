//! Storage backends holding synthesized files.
//!
//! The service only ever needs four things from storage: an existence check, a write of N zero
//! bytes, a way for the caller to fetch the bytes back, and a listing. [`StorageBackend`] captures
//! exactly that; [`create_storage`] picks the implementation from configuration at startup.
//!
//! - [`S3Storage`]: S3 or S3-compatible object store, downloads via presigned URLs
//! - [`LocalStorage`]: a directory on disk (also used for the ephemeral `scratch` backend),
//!   downloads streamed by the HTTP layer

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;

use crate::config::StorageConfig;

mod local;
mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(ThisError, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A call to the object store failed
    #[error("S3 {operation} failed: {message}")]
    S3 { operation: &'static str, message: String },

    /// The name cannot be used as a storage key
    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),
}

/// How a caller retrieves stored bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Time-limited URL the client should be redirected to
    Url(String),
    /// File on local disk, streamed back to the client
    Path(PathBuf),
}

/// Trait for synthesized-file storage backends
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Check whether `name` is stored. A missing object is `Ok(false)`, never an error.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Store `len` zero bytes under `name`, replacing anything already there
    async fn write_zeroes(&self, name: &str, len: u64) -> Result<()>;

    /// Produce a retrieval handle for `name`. `ttl` is advisory.
    async fn reference(&self, name: &str, ttl: Duration) -> Result<Reference>;

    /// Every name currently stored
    async fn list(&self) -> Result<Vec<String>>;

    /// Human-readable description for startup logs
    fn describe(&self) -> String;
}

/// Create a storage backend based on configuration
pub async fn create_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::S3 {
            bucket,
            region,
            access_key_id,
            secret_access_key,
            endpoint_url,
            force_path_style,
        } => {
            let credentials = access_key_id.clone().zip(secret_access_key.clone());
            let storage = S3Storage::connect(
                bucket.clone(),
                region.clone(),
                credentials,
                endpoint_url.as_ref(),
                *force_path_style,
            )
            .await;
            Ok(Arc::new(storage))
        }
        StorageConfig::Local { path } => Ok(Arc::new(LocalStorage::create(path.clone()).await?)),
        StorageConfig::Scratch { path } => {
            let dir = StorageConfig::scratch_dir(path.as_ref());
            Ok(Arc::new(LocalStorage::create(dir).await?))
        }
    }
}
