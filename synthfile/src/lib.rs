//! # synthfile: size-encoded file synthesis over HTTP
//!
//! `synthfile` serves binary files whose size is spelled out in their name. A request for
//! `/files/512KB.bin` returns 512 KiB of zero bytes: if storage already holds `512KB.bin` it is
//! served from there, otherwise it is written first. `/files` lists everything stored so far as an
//! HTML page of download links. This is useful for bandwidth tests and download-progress UIs
//! that need files of predictable size without shipping them.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum). Requests are handled by
//! [`api::handlers`], which delegate to [`service::FileSynthesisService`]. The service validates
//! the name, asks the configured [`storage::StorageBackend`] whether the file exists, writes it
//! on a miss, and returns a [`storage::Reference`]:
//!
//! - **S3** (`storage.type: s3`): files are objects in a bucket and downloads are answered with a
//!   `302` to a presigned URL (valid for `reference_ttl`, 60 seconds by default).
//! - **Local** (`storage.type: local`) and **scratch** (`storage.type: scratch`): files live in a
//!   directory and are streamed back with `Cache-Control: no-store`.
//!
//! The routes, status codes and response bodies are the same whichever backend is used.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use synthfile::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = synthfile::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     synthfile::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod config;
pub mod errors;
mod openapi;
pub mod service;
pub mod storage;
pub mod telemetry;

#[cfg(test)]
pub mod test_utils;

use crate::config::CorsOrigin;
use crate::openapi::ApiDoc;
use crate::service::FileSynthesisService;
use crate::storage::StorageBackend;
use api::handlers::files;
use axum::http::{self, HeaderValue};
use axum::{Json, Router, routing::get};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .service(Arc::new(service))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub service: Arc<FileSynthesisService>,
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let allow_origin = if config.cors.allowed_origins.contains(&CorsOrigin::Wildcard) {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &config.cors.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                // Origins never carry a trailing slash, while `Url` always renders one
                origins.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(vec![http::header::LOCATION, http::header::CONTENT_DISPOSITION]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router with all endpoints and middleware.
///
/// - `{base_path}/files` and `{base_path}/files/{file_name}`
/// - `/healthz`
/// - OpenAPI document at `/api-docs/openapi.json`, rendered at `/docs`
/// - Optional Prometheus metrics at `/internal/metrics`
/// - CORS and tracing on everything
#[instrument(skip_all)]
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let file_routes = Router::new()
        .route("/files", get(files::list_files))
        .route("/files/{file_name}", get(files::get_file));

    let file_routes = if state.config.base_path.is_empty() {
        file_routes
    } else {
        Router::new().nest(&state.config.base_path, file_routes)
    };

    let cors_layer = create_cors_layer(&state.config)?;
    let enable_metrics = state.config.enable_metrics;

    let mut router = Router::new()
        .merge(file_routes)
        .route("/healthz", get(|| async { "OK" }))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()))
        .with_state(state)
        .layer(cors_layer);

    if enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// A configured service, ready to bind.
///
/// 1. **Create**: [`Application::new`] connects the storage backend and builds the router
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and handles requests until the
///    shutdown future resolves
pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create a new application with the storage backend named in `config`
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!(
            "Starting with host={} port={} base_path={:?} max_file_size={}",
            config.host, config.port, config.base_path, config.max_file_size
        );
        let storage = storage::create_storage(&config.storage).await?;
        Self::new_with_storage(config, storage)
    }

    /// Create a new application over an already constructed storage backend
    pub fn new_with_storage(config: Config, storage: Arc<dyn StorageBackend>) -> anyhow::Result<Self> {
        info!("File storage: {}", storage.describe());

        let service = FileSynthesisService::new(storage, config.max_file_size, config.reference_ttl);
        let app_state = AppState::builder()
            .config(config.clone())
            .service(Arc::new(service))
            .build();
        let router = build_router(app_state)?;

        Ok(Self { router, config })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Server listening on http://{}, available at http://localhost:{}{}/files",
            bind_addr, self.config.port, self.config.base_path
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
