use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub web_ui: WebUIConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_host")]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout_ms: u64,
    #[serde(default = "default_upstream_response_timeout")]
    pub upstream_response_timeout_ms: u64,
    /// Longest pause between two chunks of an upstream response body
    #[serde(default = "default_upstream_body_idle_timeout")]
    pub upstream_body_idle_timeout_ms: u64,
    #[serde(default = "default_client_idle_timeout")]
    pub client_idle_timeout_ms: u64,
    /// Accept any upstream certificate. Only meant for lab setups.
    #[serde(default)]
    pub upstream_insecure_skip_verify: bool,
    /// Extra PEM bundle trusted for upstream connections, on top of the webpki roots
    #[serde(default)]
    pub upstream_ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebUIConfig {
    #[serde(default = "default_web_ui_enabled")]
    pub enabled: bool,
    #[serde(default = "default_web_ui_host")]
    pub host: String,
    #[serde(default = "default_web_ui_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Shared directory holding the journal and the capture files
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Where `ca.crt` / `ca.key` live; falls back to `logs_dir`
    #[serde(default)]
    pub ca_dir: Option<PathBuf>,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_capture_suffix")]
    pub capture_suffix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default = "default_working_set_size")]
    pub working_set_size: usize,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    /// Also write the operator log to `<logs_dir>/proxy.log`
    #[serde(default)]
    pub file: bool,
}

// Default value functions
fn default_proxy_host() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_upstream_connect_timeout() -> u64 {
    10_000
}

fn default_upstream_response_timeout() -> u64 {
    60_000
}

fn default_upstream_body_idle_timeout() -> u64 {
    60_000
}

fn default_client_idle_timeout() -> u64 {
    30_000
}

fn default_web_ui_enabled() -> bool {
    true
}

fn default_web_ui_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_ui_port() -> u16 {
    8888
}

fn default_logs_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".agent-netlog"))
        .unwrap_or_else(|| PathBuf::from("/logs"))
}

fn default_log_file() -> String {
    "requests.jsonl".to_string()
}

fn default_capture_suffix() -> String {
    ".pcap".to_string()
}

fn default_working_set_size() -> usize {
    1000
}

fn default_body_limit() -> usize {
    10 * 1024
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
            upstream_connect_timeout_ms: default_upstream_connect_timeout(),
            upstream_response_timeout_ms: default_upstream_response_timeout(),
            upstream_body_idle_timeout_ms: default_upstream_body_idle_timeout(),
            client_idle_timeout_ms: default_client_idle_timeout(),
            upstream_insecure_skip_verify: false,
            upstream_ca_file: None,
        }
    }
}

impl Default for WebUIConfig {
    fn default() -> Self {
        Self {
            enabled: default_web_ui_enabled(),
            host: default_web_ui_host(),
            port: default_web_ui_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            logs_dir: default_logs_dir(),
            ca_dir: None,
            log_file: default_log_file(),
            capture_suffix: default_capture_suffix(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            working_set_size: default_working_set_size(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

impl Config {
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }

    pub fn web_ui_addr(&self) -> String {
        format!("{}:{}", self.web_ui.host, self.web_ui.port)
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.storage
            .ca_dir
            .clone()
            .unwrap_or_else(|| self.storage.logs_dir.clone())
    }

    pub fn journal_path(&self) -> PathBuf {
        self.storage.logs_dir.join(&self.storage.log_file)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.upstream_connect_timeout_ms)
    }

    pub fn upstream_response_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.upstream_response_timeout_ms)
    }

    pub fn upstream_body_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.upstream_body_idle_timeout_ms)
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.client_idle_timeout_ms)
    }
}
