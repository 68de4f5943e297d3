//! HTTP handlers for file download and listing.

use std::path::Path as FsPath;
use std::sync::LazyLock;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use minijinja::{Environment, context};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Serialize;
use tokio_util::io::ReaderStream;

use crate::AppState;
use crate::errors::{Error, Result};
use crate::storage::{Reference, StorageError};

/// Template for the listing page. The `.html` name turns on autoescaping.
const LISTING_TEMPLATE: &str = r#"
<h1>Download Files</h1>
<ul>
{%- for file in files %}
    <li><a href="{{ file.href }}" download>{{ file.name }}</a></li>
{%- endfor %}
</ul>
"#;

/// Characters that can't appear raw in a single URL path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("files.html", LISTING_TEMPLATE)
        .expect("listing template is valid");
    env
});

#[derive(Serialize)]
struct ListingLink<'a> {
    name: &'a str,
    href: String,
}

#[utoipa::path(
    get,
    path = "/files/{file_name}",
    tag = "files",
    summary = "Download file",
    description = "Download a zero-filled file whose size is encoded in its name (`<N>KB.bin`). \
                   The file is created on first request. Depending on the storage backend the response \
                   is a redirect to a short-lived signed URL or the file contents.",
    responses(
        (status = 200, description = "File contents, served as `application/octet-stream`"),
        (status = 302, description = "Redirect to a signed download URL"),
        (status = 400, description = "Invalid or too large file size"),
        (status = 500, description = "Storage error")
    ),
    params(
        ("file_name" = String, Path, description = "File name of the form `<N>KB.bin`, e.g. `512KB.bin`")
    )
)]
#[tracing::instrument(skip(state))]
pub async fn get_file(State(state): State<AppState>, Path(file_name): Path<String>) -> Result<Response> {
    match state.service.get_or_create(&file_name).await? {
        Reference::Url(url) => Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response()),
        Reference::Path(path) => stream_file(&file_name, &path).await,
    }
}

/// Stream a local file back as a download. Local files can be replaced at any time, so
/// intermediaries are told not to cache them.
async fn stream_file(name: &str, path: &FsPath) -> Result<Response> {
    let file = tokio::fs::File::open(path).await.map_err(StorageError::from)?;
    let len = file.metadata().await.map_err(StorageError::from)?.len();

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{name}\""))
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| Error::Other(e.into()))
}

#[utoipa::path(
    get,
    path = "/files",
    tag = "files",
    summary = "List files",
    description = "HTML page linking every stored file.",
    responses(
        (status = 200, description = "Listing page", body = String, content_type = "text/html"),
        (status = 404, description = "No files have been created yet"),
        (status = 500, description = "Storage error")
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_files(State(state): State<AppState>) -> Result<Html<String>> {
    let entries = state.service.list_all().await?;

    let links: Vec<_> = entries
        .iter()
        .map(|entry| ListingLink {
            name: &entry.name,
            href: match &entry.reference {
                Reference::Url(url) => url.clone(),
                Reference::Path(_) => format!(
                    "{}/files/{}",
                    state.config.base_path,
                    utf8_percent_encode(&entry.name, PATH_SEGMENT)
                ),
            },
        })
        .collect();

    let page = TEMPLATES
        .get_template("files.html")
        .and_then(|template| template.render(context! { files => links }))
        .map_err(anyhow::Error::from)?;

    Ok(Html(page))
}
