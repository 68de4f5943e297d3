//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `SYNTHFILE_CONFIG`
//! environment variable. A missing file is not an error: every field has a default.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Deployment variables** - `PORT` and the `LEARNING_S3_*` / `LEARNING_AWS_*` variables used
//!    by existing deployments. Setting `LEARNING_S3_BUCKET_NAME` selects the S3 backend unless a
//!    storage type was configured explicitly.
//! 3. **Environment variables** - Variables prefixed with `SYNTHFILE_` override everything else
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `SYNTHFILE_STORAGE__TYPE=local` sets the `storage.type` field.
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Serve from a local directory on port 9000
//! SYNTHFILE_PORT=9000
//! SYNTHFILE_STORAGE__TYPE=local
//! SYNTHFILE_STORAGE__PATH=/var/lib/synthfile
//!
//! # Serve from S3
//! LEARNING_S3_BUCKET_NAME=my-bucket
//! LEARNING_AWS_REGION=eu-west-1
//!
//! # Raise the ceiling to 2 GiB
//! SYNTHFILE_MAX_FILE_SIZE=2147483648
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Default ceiling for synthesized files: 1 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// S3 refuses presigned URLs valid for longer than seven days.
const MAX_REFERENCE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Environment variables kept for compatibility with existing deployments, and the config
/// path each one sets.
const DEPLOYMENT_ENV: &[(&str, &str)] = &[
    ("PORT", "port"),
    ("LEARNING_S3_BUCKET_NAME", "storage.bucket"),
    ("LEARNING_AWS_REGION", "storage.region"),
    ("LEARNING_AWS_ACCESS_KEY_ID", "storage.access_key_id"),
    ("LEARNING_AWS_SECRET_ACCESS_KEY", "storage.secret_access_key"),
];

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "SYNTHFILE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// Loaded once at startup and handed to [`crate::Application`]; nothing reads configuration
/// from the environment after that.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Prefix the file routes are mounted under (e.g. `/.netlify/functions/api`). Empty mounts
    /// them at the root.
    pub base_path: String,
    /// Largest file, in bytes, that may be synthesized
    pub max_file_size: u64,
    /// Validity of signed download URLs. Backends that hand out stable paths ignore it.
    #[serde(with = "humantime_serde")]
    pub reference_ttl: Duration,
    /// Where synthesized files are kept
    pub storage: StorageConfig,
    /// CORS settings, applied to every route
    pub cors: CorsConfig,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// S3 or an S3-compatible object store. Downloads are served as presigned URLs.
    S3 {
        /// Bucket holding the files
        bucket: String,
        /// AWS region; falls back to the default provider chain when unset
        #[serde(default)]
        region: Option<String>,
        /// Static access key; falls back to the default credential chain when unset
        #[serde(default)]
        access_key_id: Option<String>,
        /// Static secret key, paired with `access_key_id`
        #[serde(default, skip_serializing)]
        secret_access_key: Option<String>,
        /// Custom endpoint for S3-compatible stores (MinIO, R2, ...)
        #[serde(default)]
        endpoint_url: Option<Url>,
        /// Use path-style addressing (`endpoint/bucket/key`)
        #[serde(default)]
        force_path_style: bool,
    },
    /// A directory on local disk
    Local {
        /// Directory holding the files; created on startup
        path: PathBuf,
    },
    /// Ephemeral scratch space, `<temp dir>/files` unless a path is given
    Scratch {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl StorageConfig {
    /// Resolve the scratch directory for the `scratch` backend.
    pub fn scratch_dir(path: Option<&PathBuf>) -> PathBuf {
        path.cloned().unwrap_or_else(|| std::env::temp_dir().join("files"))
    }
}

/// CORS (Cross-Origin Resource Sharing) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests
    pub allowed_origins: Vec<CorsOrigin>,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

/// A single allowed CORS origin.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_path: String::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            reference_ttl: Duration::from_secs(60),
            storage: StorageConfig::default(),
            cors: CorsConfig::default(),
            enable_metrics: false,
            enable_otel_export: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Scratch { path: None }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Wildcard],
            max_age: Some(3600), // Cache preflight for 1 hour
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_file_size < 1024 {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: max_file_size ({}) must allow at least one 1KB file",
                    self.max_file_size
                ),
            });
        }

        if self.reference_ttl < Duration::from_secs(1) || self.reference_ttl > MAX_REFERENCE_TTL {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: reference_ttl ({}) must be between 1s and 7 days",
                    humantime::format_duration(self.reference_ttl)
                ),
            });
        }

        if !self.base_path.is_empty() && (!self.base_path.starts_with('/') || self.base_path.ends_with('/')) {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: base_path '{}' must start with '/' and must not end with '/'",
                    self.base_path
                ),
            });
        }

        if let StorageConfig::S3 {
            bucket,
            access_key_id,
            secret_access_key,
            ..
        } = &self.storage
        {
            if bucket.trim().is_empty() {
                return Err(Error::Internal {
                    operation: "Config validation: S3 storage requires a bucket name. \
                     Set LEARNING_S3_BUCKET_NAME or storage.bucket."
                        .to_string(),
                });
            }

            if access_key_id.is_some() != secret_access_key.is_some() {
                return Err(Error::Internal {
                    operation: "Config validation: access_key_id and secret_access_key must be set together".to_string(),
                });
            }
        }

        if self.cors.allowed_origins.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: CORS allowed_origins cannot be empty. Add at least one allowed origin.".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        let mut figment = Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Variables understood by existing deployments
            .merge(Env::raw().only(&DEPLOYMENT_ENV.iter().map(|(name, _)| *name).collect::<Vec<_>>()).map(|key| {
                DEPLOYMENT_ENV
                    .iter()
                    .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                    .map(|(_, path)| (*path).into())
                    .unwrap_or_else(|| key.as_str().to_string().into())
            }))
            // Prefixed environment variables win over everything else
            .merge(Env::prefixed("SYNTHFILE_").split("__").ignore(&["config"]));

        // A bucket from the deployment environment implies S3 unless a type was chosen
        if std::env::var_os("LEARNING_S3_BUCKET_NAME").is_some() {
            figment = figment.join(Serialized::defaults(serde_json::json!({ "storage": { "type": "s3" } })));
        }

        figment
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
