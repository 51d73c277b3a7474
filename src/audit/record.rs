use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One observed exchange. Starts `Pending` when the request is decoded and
/// moves to `Completed` at most once, when the matching response arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub host: String,
    pub path: String,
    /// Redacted request headers
    pub headers: BTreeMap<String, String>,
    /// Size-capped request body, `None` when empty or unreadable
    pub body: Option<String>,
    pub pcap_file: String,
    pub status: RecordStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordStatus {
    Pending,
    Completed(ResponseSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSummary {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl RequestRecord {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, RecordStatus::Completed(_))
    }

    pub fn response(&self) -> Option<&ResponseSummary> {
        match &self.status {
            RecordStatus::Completed(summary) => Some(summary),
            RecordStatus::Pending => None,
        }
    }
}

/// What the interception pipeline hands over for a decoded request.
#[derive(Debug, Clone, Default)]
pub struct RequestView {
    pub method: String,
    pub host: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// `None` when the body could not be read
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseView {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

/// On-disk and query shape of a record: one self-contained JSON object per
/// journal line. Response fields being present is what marks completion here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordLine {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    #[serde(alias = "domain")]
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, alias = "response_status", skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(default, alias = "response_headers", skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
    #[serde(default, alias = "response_body", skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, alias = "pcap_file")]
    pub pcap_file: String,
}

impl From<&RequestRecord> for RecordLine {
    fn from(record: &RequestRecord) -> Self {
        let (response_status, response_headers, response_body) = match &record.status {
            RecordStatus::Pending => (None, None, None),
            RecordStatus::Completed(summary) => (
                Some(summary.status),
                Some(summary.headers.clone()),
                summary.body.clone(),
            ),
        };

        Self {
            id: record.id.clone(),
            timestamp: record.timestamp,
            method: record.method.clone(),
            host: record.host.clone(),
            path: record.path.clone(),
            headers: record.headers.clone(),
            body: record.body.clone(),
            response_status,
            response_headers,
            response_body,
            pcap_file: record.pcap_file.clone(),
        }
    }
}

impl From<RecordLine> for RequestRecord {
    fn from(line: RecordLine) -> Self {
        let status = match line.response_status {
            Some(status) => RecordStatus::Completed(ResponseSummary {
                status,
                headers: line.response_headers.unwrap_or_default(),
                body: line.response_body,
            }),
            None => RecordStatus::Pending,
        };

        Self {
            id: line.id,
            timestamp: line.timestamp,
            method: line.method,
            host: line.host,
            path: line.path,
            headers: line.headers,
            body: line.body,
            pcap_file: line.pcap_file,
            status,
        }
    }
}
