//! File synthesis: turn a size-encoding file name into stored zero bytes and a way to fetch them.
//!
//! A file name such as `512KB.bin` is both the identifier and the size. The first
//! request for a name writes `512 * 1024` zero bytes to storage; later requests find it there and
//! only produce a fresh [`Reference`]. Storage is the only source of truth for what exists.
//!
//! Two concurrent requests for the same missing name may both write it. Both writes carry the
//! same bytes, so the only cost is duplicated I/O; no locking is done.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{info, instrument};

use crate::errors::{Error, Result};
use crate::storage::{Reference, StorageBackend};

/// Suffix every synthesized file name ends with; the digits before it are KiB.
pub const NAME_SUFFIX: &str = "KB.bin";

/// A file whose size is encoded in its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticFile {
    pub name: String,
    pub size_bytes: u64,
}

impl SyntheticFile {
    /// Parse and bound-check a file name of the form `<N>KB.bin`.
    pub fn parse(name: &str, max_file_size: u64) -> Result<Self> {
        let invalid = || Error::InvalidSize {
            message: "Invalid file size in file name.".to_string(),
        };

        let digits = name.strip_suffix(NAME_SUFFIX).ok_or_else(invalid)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let too_large = || Error::InvalidSize {
            message: format!(
                "Invalid or too large file size. Maximum allowed is {}.",
                format_size(max_file_size)
            ),
        };

        let size_kb: u64 = digits.parse().map_err(|_| too_large())?;
        if size_kb == 0 {
            return Err(invalid());
        }
        let size_bytes = size_kb.checked_mul(1024).ok_or_else(too_large)?;
        if size_bytes > max_file_size {
            return Err(too_large());
        }

        Ok(Self {
            name: name.to_string(),
            size_bytes,
        })
    }
}

/// Render a byte count the way the error messages quote the ceiling (`1GB`, `512MB`, ...)
fn format_size(bytes: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1024 * 1024 * 1024, "GB"), (1024 * 1024, "MB"), (1024, "KB")];

    UNITS
        .iter()
        .find(|(unit, _)| bytes >= *unit && bytes % unit == 0)
        .map(|(unit, suffix)| format!("{}{}", bytes / unit, suffix))
        .unwrap_or_else(|| format!("{bytes} bytes"))
}

/// A stored file and how to retrieve it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub reference: Reference,
}

/// Serves size-encoded files, creating them in storage on first request.
pub struct FileSynthesisService {
    storage: Arc<dyn StorageBackend>,
    max_file_size: u64,
    reference_ttl: Duration,
}

impl FileSynthesisService {
    pub fn new(storage: Arc<dyn StorageBackend>, max_file_size: u64, reference_ttl: Duration) -> Self {
        Self {
            storage,
            max_file_size,
            reference_ttl,
        }
    }

    /// Return a reference to `name`, writing the file first if storage doesn't have it.
    ///
    /// The name is validated before storage is touched, so a bad name never causes I/O.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn get_or_create(&self, name: &str) -> Result<Reference> {
        let file = SyntheticFile::parse(name, self.max_file_size)?;

        if self.storage.exists(&file.name).await? {
            counter!("synthfile_cache_hits_total").increment(1);
        } else {
            self.storage.write_zeroes(&file.name, file.size_bytes).await?;
            counter!("synthfile_files_created_total").increment(1);
            counter!("synthfile_bytes_synthesized_total").increment(file.size_bytes);
            info!(name = %file.name, size_bytes = file.size_bytes, "Created file");
        }

        Ok(self.storage.reference(&file.name, self.reference_ttl).await?)
    }

    /// Every stored file with a reference to it. An empty store is reported as [`Error::NotFound`].
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn list_all(&self) -> Result<Vec<FileEntry>> {
        let names = self.storage.list().await?;
        if names.is_empty() {
            return Err(Error::NotFound {
                message: "No files found.".to_string(),
            });
        }

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let reference = self.storage.reference(&name, self.reference_ttl).await?;
            entries.push(FileEntry { name, reference });
        }
        Ok(entries)
    }
}
