//! OpenAPI documentation for the file routes.
//!
//! Paths are documented relative to the configured `base_path`.

use utoipa::OpenApi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "synthfile",
        description = "Zero-filled files whose size is encoded in their name, created on first request."
    ),
    paths(
        api::handlers::files::get_file,
        api::handlers::files::list_files,
    ),
    tags(
        (name = "files", description = "Download and list synthesized files")
    )
)]
pub struct ApiDoc;
