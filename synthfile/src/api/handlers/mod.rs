//! HTTP request handlers.
//!
//! - [`files`]: file download and listing

pub mod files;
