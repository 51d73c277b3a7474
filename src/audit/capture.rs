use chrono::{DateTime, Utc};

/// Names the packet-capture file that covers a given instant. Records only
/// carry the name as a hint; nothing here reads capture files.
pub trait CaptureHint: Send + Sync {
    fn file_name_at(&self, at: DateTime<Utc>) -> String;
}

/// `capture_YYYYmmdd_HHMMSS<suffix>`, matching the capture sidecar's rotation.
#[derive(Debug, Clone)]
pub struct TimestampCaptureHint {
    suffix: String,
}

impl TimestampCaptureHint {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl Default for TimestampCaptureHint {
    fn default() -> Self {
        Self::new(".pcap")
    }
}

impl CaptureHint for TimestampCaptureHint {
    fn file_name_at(&self, at: DateTime<Utc>) -> String {
        format!("capture_{}{}", at.format("%Y%m%d_%H%M%S"), self.suffix)
    }
}
