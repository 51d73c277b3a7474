//! Append-only, replayable audit journal with a bounded in-memory working set.
//!
//! Every decoded request becomes one JSON line in the journal. When its
//! response arrives the full updated record is appended again under the same
//! id, so readers take the latest occurrence per id. The journal file and the
//! working set are updated inside one critical section so they never disagree.

mod capture;
mod record;
mod redact;
mod working_set;

pub use capture::{CaptureHint, TimestampCaptureHint};
pub use record::{
    RecordLine, RecordStatus, RequestRecord, RequestView, ResponseSummary, ResponseView,
};
pub use redact::{cap_body, is_sensitive, sanitize_headers, REDACTED, TRUNCATION_MARKER};
pub use working_set::WorkingSet;

use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_WORKING_SET_SIZE: usize = 1000;
pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Journal IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct AuditOptions {
    pub working_set_size: usize,
    pub body_limit: usize,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            working_set_size: DEFAULT_WORKING_SET_SIZE,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

/// Outcome of replaying the journal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Parseable lines read
    pub lines: usize,
    /// Lines skipped as unparseable
    pub skipped: usize,
    /// Records in the working set afterwards
    pub retained: usize,
}

struct Journal {
    file: File,
    working_set: WorkingSet,
}

impl Journal {
    fn append(&mut self, line: &RecordLine) -> Result<(), AuditError> {
        let mut bytes = serde_json::to_vec(line)?;
        bytes.push(b'\n');
        let len = self.file.metadata()?.len();
        if let Err(e) = self
            .file
            .write_all(&bytes)
            .and_then(|()| self.file.sync_data())
        {
            // A torn line would swallow the next append when replayed.
            if let Err(undo) = self.file.set_len(len) {
                tracing::error!(error = %undo, "Failed to roll back partial journal line");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// 8 hex digits of a fresh v4 uuid, unique within the working set.
    fn fresh_id(&self) -> String {
        loop {
            let mut id = Uuid::new_v4().simple().to_string();
            id.truncate(8);
            if !self.working_set.contains(&id) {
                return id;
            }
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
    options: AuditOptions,
    journal: Mutex<Journal>,
    capture_hint: Box<dyn CaptureHint>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Open (or create) the journal at `path` and restore the working set
    /// from it. An unwritable location is an error.
    pub fn open(path: impl AsRef<Path>, options: AuditOptions) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut open = OpenOptions::new();
        open.create(true).append(true).read(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open.mode(0o600);
        }
        let file = open.open(&path)?;

        let log = Self {
            path,
            options,
            journal: Mutex::new(Journal {
                file,
                working_set: WorkingSet::new(options.working_set_size),
            }),
            capture_hint: Box::new(TimestampCaptureHint::default()),
        };

        let report = log.restore()?;
        tracing::info!(
            path = ?log.path,
            lines = report.lines,
            skipped = report.skipped,
            retained = report.retained,
            "Restored audit journal"
        );
        Ok(log)
    }

    pub fn with_capture_hint(mut self, hint: impl CaptureHint + 'static) -> Self {
        self.capture_hint = Box::new(hint);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> AuditOptions {
        self.options
    }

    fn lock(&self) -> MutexGuard<'_, Journal> {
        // The journal stays consistent across a panicking holder: every
        // mutation is a single append followed by a single in-memory update.
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebuild the working set from the journal, oldest line first. Garbled
    /// lines are skipped and counted.
    pub fn restore(&self) -> Result<RestoreReport, AuditError> {
        let mut journal = self.lock();
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        // Terminate a torn tail so new lines do not run into it.
        if contents.last().is_some_and(|b| *b != b'\n') {
            journal.file.write_all(b"\n")?;
        }

        journal.working_set.clear();
        let mut report = RestoreReport::default();
        for (line_no, line) in contents.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<RecordLine>(line) {
                Ok(parsed) => {
                    report.lines += 1;
                    journal.working_set.upsert(parsed.into());
                }
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(line = line_no + 1, error = %e, "Skipping unparseable journal line");
                }
            }
        }
        report.retained = journal.working_set.len();
        Ok(report)
    }

    /// Store a redacted, size-capped copy of `request` and return its
    /// correlation id. Nothing is added to the working set if the journal
    /// append fails.
    pub fn record(&self, request: RequestView) -> Result<String, AuditError> {
        let headers = sanitize_headers(request.headers);
        let body = request
            .body
            .as_deref()
            .and_then(|body| cap_body(body, self.options.body_limit));
        let timestamp = Utc::now();
        let pcap_file = self.capture_hint.file_name_at(timestamp);

        let mut journal = self.lock();
        let id = journal.fresh_id();
        let record = RequestRecord {
            id: id.clone(),
            timestamp,
            method: request.method,
            host: request.host,
            path: request.path,
            headers,
            body,
            pcap_file,
            status: RecordStatus::Pending,
        };

        journal.append(&RecordLine::from(&record))?;
        tracing::debug!(
            id = %id,
            method = %record.method,
            host = %record.host,
            path = %record.path,
            "Recorded request"
        );
        journal.working_set.push(record);
        Ok(id)
    }

    /// Attach `response` to the record `id`. Returns `false` without touching
    /// anything when the id is unknown, evicted or already completed.
    pub fn complete(&self, id: &str, response: ResponseView) -> Result<bool, AuditError> {
        let summary = ResponseSummary {
            status: response.status,
            headers: sanitize_headers(response.headers),
            body: response
                .body
                .as_deref()
                .and_then(|body| cap_body(body, self.options.body_limit)),
        };

        let mut journal = self.lock();
        let mut updated = match journal.working_set.get(id) {
            Some(record) if !record.is_completed() => record.clone(),
            Some(_) => {
                tracing::debug!(id = %id, "Record already completed; ignoring response");
                return Ok(false);
            }
            None => {
                tracing::debug!(id = %id, "Record not in working set; dropping response");
                return Ok(false);
            }
        };
        updated.status = RecordStatus::Completed(summary);

        journal.append(&RecordLine::from(&updated))?;
        if let Some(slot) = journal.working_set.get_mut(id) {
            *slot = updated;
        }
        tracing::debug!(id = %id, status = response.status, "Completed record");
        Ok(true)
    }

    /// Independent copy of the working set in creation order.
    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.lock().working_set.snapshot()
    }

    pub fn len(&self) -> usize {
        self.lock().working_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
