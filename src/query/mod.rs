//! Read-only view over the audit working set and the capture directory.

use crate::audit::{AuditLog, RecordLine};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Capture file not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone)]
pub struct QueryService {
    audit: Arc<AuditLog>,
    capture_dir: PathBuf,
    capture_suffix: String,
}

impl QueryService {
    pub fn new(
        audit: Arc<AuditLog>,
        capture_dir: impl Into<PathBuf>,
        capture_suffix: impl Into<String>,
    ) -> Self {
        Self {
            audit,
            capture_dir: capture_dir.into(),
            capture_suffix: capture_suffix.into(),
        }
    }

    pub fn capture_suffix(&self) -> &str {
        &self.capture_suffix
    }

    /// Working set in wire shape, newest first.
    pub fn list_records(&self) -> Vec<RecordLine> {
        self.audit
            .snapshot()
            .iter()
            .rev()
            .map(RecordLine::from)
            .collect()
    }

    /// Names of regular files in the capture directory carrying the capture
    /// suffix, sorted. A missing directory lists as empty.
    pub async fn list_capture_files(&self) -> Result<Vec<String>, QueryError> {
        let mut entries = match tokio::fs::read_dir(&self.capture_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.ends_with(&self.capture_suffix) {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Raw bytes of one capture file. `name` must be a bare file name with the
    /// capture suffix; it is validated before anything touches the disk.
    pub async fn fetch_capture_file(&self, name: &str) -> Result<Vec<u8>, QueryError> {
        self.validate_capture_name(name)?;

        let path = self.capture_dir.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(QueryError::NotFound),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(QueryError::NotFound),
            Err(e) => return Err(e.into()),
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(QueryError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate_capture_name(&self, name: &str) -> Result<(), QueryError> {
        if name.is_empty() {
            return Err(QueryError::BadRequest("empty capture name"));
        }
        if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
            return Err(QueryError::BadRequest("capture name must be a bare file name"));
        }
        match name.strip_suffix(self.capture_suffix.as_str()) {
            Some(stem) if !stem.is_empty() => Ok(()),
            _ => Err(QueryError::BadRequest("unexpected capture file suffix")),
        }
    }
}
