//! API layer for HTTP request handling.
//!
//! - **[`handlers`]**: Axum route handlers
//!
//! # API Structure
//!
//! - **Download** (`{base_path}/files/{file_name}`): synthesize-on-demand download
//! - **Listing** (`{base_path}/files`): HTML page of every stored file

pub mod handlers;
