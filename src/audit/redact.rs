use std::collections::BTreeMap;

pub const REDACTED: &str = "[REDACTED]";
pub const TRUNCATION_MARKER: &str = "... [truncated]";

const SENSITIVE_HEADERS: &[&str] = &["authorization", "proxy-authorization", "x-api-key", "api-key"];

pub fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|sensitive| name.eq_ignore_ascii_case(sensitive))
}

/// Lowercase header names, fold repeated headers into one comma-separated
/// value and replace sensitive values with [`REDACTED`].
pub fn sanitize_headers<I, K, V>(headers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut sanitized: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_ref().to_ascii_lowercase();
        if is_sensitive(&name) {
            sanitized.insert(name, REDACTED.to_string());
            continue;
        }
        sanitized
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value.as_ref());
            })
            .or_insert_with(|| value.as_ref().to_string());
    }
    sanitized
}

/// Decode a body for storage, keeping at most `limit` bytes.
pub fn cap_body(body: &[u8], limit: usize) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if body.len() <= limit {
        return Some(String::from_utf8_lossy(body).into_owned());
    }
    let mut capped = String::from_utf8_lossy(&body[..limit]).into_owned();
    capped.push_str(TRUNCATION_MARKER);
    Some(capped)
}
