//! Test utilities shared by the unit and HTTP tests.

use crate::config::{Config, StorageConfig};
use crate::storage::{LocalStorage, Reference, Result, S3Storage, StorageBackend};
use async_trait::async_trait;
use axum_test::TestServer;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Wraps a backend and counts calls, so tests can assert how much storage work a request did.
pub struct CountingStorage<S = LocalStorage> {
    inner: S,
    calls: AtomicUsize,
    writes: AtomicUsize,
}

impl<S> CountingStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of `write_zeroes` calls
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of calls of any kind
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: StorageBackend> StorageBackend for CountingStorage<S> {
    async fn exists(&self, name: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.exists(name).await
    }

    async fn write_zeroes(&self, name: &str, len: u64) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_zeroes(name, len).await
    }

    async fn reference(&self, name: &str, ttl: Duration) -> Result<Reference> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.reference(name, ttl).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list().await
    }

    fn describe(&self) -> String {
        format!("counting {}", self.inner.describe())
    }
}

pub fn create_test_config(root: &Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        storage: StorageConfig::Local {
            path: root.to_path_buf(),
        },
        ..Default::default()
    }
}

/// Test server over a counting local backend rooted at `root`
pub fn create_test_app(root: &Path) -> (TestServer, Arc<CountingStorage>) {
    create_test_app_with_config(create_test_config(root))
}

pub fn create_test_app_with_config(config: Config) -> (TestServer, Arc<CountingStorage>) {
    let root = match &config.storage {
        StorageConfig::Local { path } => path.clone(),
        other => panic!("test apps need local storage, got {other:?}"),
    };
    let storage = Arc::new(CountingStorage::new(LocalStorage::new(root)));

    let app = crate::Application::new_with_storage(config, storage.clone()).expect("Failed to create application");
    (app.into_test_server(), storage)
}

/// S3 backend talking to `endpoint` (usually a wiremock server) with path-style addressing
/// and static credentials
pub fn create_test_s3_storage(endpoint: &str, bucket: &str) -> S3Storage {
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};

    let config = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "test"))
        .endpoint_url(endpoint)
        .force_path_style(true)
        .build();
    S3Storage::new(aws_sdk_s3::Client::from_conf(config), bucket.to_string())
}
