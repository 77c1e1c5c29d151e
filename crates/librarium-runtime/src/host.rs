//! Host API injected into each runtime.
//!
//! Plugin code never reaches the network or the filesystem directly: every
//! such operation goes through the [`HostApi`] instance created for that
//! runtime, which enforces the plugin's declared capabilities.

use crate::context::CallContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::scope::PluginKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// HTTP method available to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

/// An outbound HTTP request issued by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: BTreeMap::new(),
            body: Some(body.into()),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// HTTP response returned to a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Log level for plugin logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Host functions available to plugin code.
///
/// Implementations are instantiated per runtime and must be capability
/// checked. A denied operation fails only that call.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Perform an outbound HTTP request.
    async fn http_request(&self, cx: &CallContext, request: HttpRequest)
        -> RuntimeResult<HttpResponse>;

    /// Read a file.
    async fn read_file(&self, cx: &CallContext, path: &Path) -> RuntimeResult<Vec<u8>>;

    /// Write a file, replacing any existing content.
    async fn write_file(&self, cx: &CallContext, path: &Path, contents: &[u8])
        -> RuntimeResult<()>;

    /// List the entry names of a directory.
    async fn list_dir(&self, cx: &CallContext, path: &Path) -> RuntimeResult<Vec<String>>;

    /// Log a message on behalf of the plugin (always allowed).
    fn log(&self, level: LogLevel, message: &str);

    /// Current timestamp in milliseconds.
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Route a plugin log line to `tracing` with the plugin identity attached.
pub fn log_for_plugin(key: &PluginKey, level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(plugin = %key, "{}", message),
        LogLevel::Debug => tracing::debug!(plugin = %key, "{}", message),
        LogLevel::Info => tracing::info!(plugin = %key, "{}", message),
        LogLevel::Warn => tracing::warn!(plugin = %key, "{}", message),
        LogLevel::Error => tracing::error!(plugin = %key, "{}", message),
    }
}

/// Host for plugins that declared no resources: every network and file
/// operation is denied, logging works.
#[derive(Debug, Clone)]
pub struct NoAccessHost {
    key: PluginKey,
}

impl NoAccessHost {
    pub fn new(key: PluginKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl HostApi for NoAccessHost {
    async fn http_request(
        &self,
        _cx: &CallContext,
        request: HttpRequest,
    ) -> RuntimeResult<HttpResponse> {
        Err(RuntimeError::denied("http_access", request.url))
    }

    async fn read_file(&self, _cx: &CallContext, path: &Path) -> RuntimeResult<Vec<u8>> {
        Err(RuntimeError::denied("file_access", path.display().to_string()))
    }

    async fn write_file(
        &self,
        _cx: &CallContext,
        path: &Path,
        _contents: &[u8],
    ) -> RuntimeResult<()> {
        Err(RuntimeError::denied("file_access", path.display().to_string()))
    }

    async fn list_dir(&self, _cx: &CallContext, path: &Path) -> RuntimeResult<Vec<String>> {
        Err(RuntimeError::denied("file_access", path.display().to_string()))
    }

    fn log(&self, level: LogLevel, message: &str) {
        log_for_plugin(&self.key, level, message);
    }
}
