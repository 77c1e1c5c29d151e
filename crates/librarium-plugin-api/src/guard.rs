//! Capability guard.
//!
//! [`GuardedHost`] is the [`HostApi`] injected into each runtime. Every
//! network and filesystem call a plugin makes is checked against the
//! capabilities its manifest declared. A denial fails only the call that
//! attempted it.

use async_trait::async_trait;
use librarium_runtime::{
    Capabilities, CallContext, HostApi, HttpMethod, HttpRequest, HttpResponse, LogLevel,
    PluginKey, RuntimeError, RuntimeResult,
};
use reqwest::header::LOCATION;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Host-wide limits and paths applied by every guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardOptions {
    /// Catalog-wide roots, reachable with `file_access` `read`/`readwrite`.
    pub catalog_roots: Vec<PathBuf>,

    /// Maximum HTTP response body size.
    pub max_response_bytes: usize,

    /// Maximum redirect hops followed for one request.
    pub max_redirects: usize,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            catalog_roots: Vec::new(),
            max_response_bytes: 10 * 1024 * 1024,
            max_redirects: 10,
        }
    }
}

/// Build the HTTP client shared by all guards. Redirects are never followed
/// by the client itself; the guard checks every hop.
pub fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("librarium/", env!("CARGO_PKG_VERSION")))
        .build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Capability-checked host API for one runtime.
pub struct GuardedHost {
    key: PluginKey,
    capabilities: Capabilities,
    install_dir: Option<PathBuf>,
    options: Arc<GuardOptions>,
    client: reqwest::Client,
}

impl GuardedHost {
    pub fn new(
        key: PluginKey,
        capabilities: Capabilities,
        install_dir: Option<PathBuf>,
        options: Arc<GuardOptions>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            key,
            capabilities,
            install_dir,
            options,
            client,
        }
    }

    pub fn key(&self) -> &PluginKey {
        &self.key
    }

    fn deny(&self, capability: &str, detail: String) -> RuntimeError {
        warn!(plugin = %self.key, capability, detail = %detail, "Capability denied");
        RuntimeError::denied(capability, detail)
    }

    fn check_url(&self, url: &Url) -> RuntimeResult<()> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(self.deny(
                "http_access",
                format!("scheme '{}' is not allowed", url.scheme()),
            ));
        }
        if !self.capabilities.allows_url(url) {
            return Err(self.deny(
                "http_access",
                format!(
                    "{}:{} is not allow-listed",
                    url.host_str().unwrap_or(""),
                    url.port_or_known_default().unwrap_or(0)
                ),
            ));
        }
        Ok(())
    }

    async fn send(&self, request: HttpRequest) -> RuntimeResult<HttpResponse> {
        let mut url = Url::parse(&request.url)
            .map_err(|e| RuntimeError::Http(format!("invalid url '{}': {}", request.url, e)))?;
        self.check_url(&url)?;

        let mut method = request.method;
        let mut body = request.body;

        for _ in 0..=self.options.max_redirects {
            let mut builder = match method {
                HttpMethod::Get => self.client.get(url.clone()),
                HttpMethod::Post => self
                    .client
                    .post(url.clone())
                    .body(body.clone().unwrap_or_default()),
            };
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let response = builder
                .send()
                .await
                .map_err(|e| RuntimeError::Http(format!("request to {} failed: {}", url, e)))?;

            let status = response.status();
            if !is_followed_redirect(status) {
                return self.read_response(response).await;
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    RuntimeError::Http(format!("{} redirect without a location", status))
                })?;
            let next = url
                .join(location)
                .map_err(|e| RuntimeError::Http(format!("invalid redirect '{}': {}", location, e)))?;

            if !self.capabilities.allows_url(&next) || !matches!(next.scheme(), "http" | "https") {
                return Err(self.deny(
                    "http_access",
                    format!("redirect from {} to {} is not allow-listed", url, next),
                ));
            }

            debug!(plugin = %self.key, from = %url, to = %next, "Following redirect");
            if status == StatusCode::SEE_OTHER
                || (method == HttpMethod::Post
                    && matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND))
            {
                method = HttpMethod::Get;
                body = None;
            }
            url = next;
        }

        Err(RuntimeError::Http(format!(
            "too many redirects (max {})",
            self.options.max_redirects
        )))
    }

    async fn read_response(&self, mut response: reqwest::Response) -> RuntimeResult<HttpResponse> {
        let limit = self.options.max_response_bytes;
        if response.content_length().is_some_and(|len| len as usize > limit) {
            return Err(RuntimeError::Http(format!(
                "response larger than {} bytes",
                limit
            )));
        }

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| RuntimeError::Http(format!("failed to read response: {}", e)))?
        {
            if body.len() + chunk.len() > limit {
                return Err(RuntimeError::Http(format!(
                    "response larger than {} bytes",
                    limit
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    /// Resolve `path` to a real path inside a permitted root.
    async fn resolve(&self, cx: &CallContext, path: &Path, access: Access) -> RuntimeResult<PathBuf> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            match cx.temp_dir() {
                Some(temp) => temp.join(path),
                None => {
                    return Err(self.deny(
                        "file_access",
                        format!("relative path {} without a temp directory", path.display()),
                    ))
                }
            }
        };

        let resolved = resolve_real(&normalize(&absolute)).await?;

        for (root, writable) in self.roots(cx) {
            let Ok(root) = tokio::fs::canonicalize(&root).await else {
                continue;
            };
            if resolved.starts_with(&root) && (access == Access::Read || writable) {
                return Ok(resolved);
            }
        }

        let verb = match access {
            Access::Read => "read",
            Access::Write => "write",
        };
        Err(self.deny(
            "file_access",
            format!("{} of {} is outside the permitted roots", verb, path.display()),
        ))
    }

    /// Permitted roots with their write flag.
    fn roots(&self, cx: &CallContext) -> Vec<(PathBuf, bool)> {
        let mut roots = Vec::new();

        if let Some(temp) = cx.temp_dir() {
            roots.push((temp.to_path_buf(), true));
        }
        if let Some(install) = &self.install_dir {
            roots.push((install.clone(), false));
        }
        for path in cx.readable_paths() {
            roots.push((path.clone(), false));
        }

        let level = self.capabilities.file_access;
        if level.can_read_catalog() {
            for root in &self.options.catalog_roots {
                roots.push((root.clone(), level.can_write_catalog()));
            }
        }

        roots
    }
}

/// Statuses the guard follows as redirects. Others in the 3xx range, such
/// as `304 Not Modified`, go back to the plugin as ordinary responses.
fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Lexically normalize a path: drop `.` and apply `..` without ever going
/// above the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the longest existing ancestor so symlinks resolve to their
/// real target, then re-append the missing tail.
async fn resolve_real(path: &Path) -> RuntimeResult<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();

    loop {
        match tokio::fs::canonicalize(&existing).await {
            Ok(real) => {
                let mut real = real;
                for part in tail.iter().rev() {
                    real.push(part);
                }
                return Ok(real);
            }
            Err(_) => match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name);
                    existing = parent.to_path_buf();
                }
                _ => {
                    return Err(RuntimeError::Io(format!(
                        "cannot resolve {}",
                        path.display()
                    )))
                }
            },
        }
    }
}

#[async_trait]
impl HostApi for GuardedHost {
    async fn http_request(&self, cx: &CallContext, request: HttpRequest) -> RuntimeResult<HttpResponse> {
        cx.run(self.send(request)).await
    }

    async fn read_file(&self, cx: &CallContext, path: &Path) -> RuntimeResult<Vec<u8>> {
        let resolved = self.resolve(cx, path, Access::Read).await?;
        cx.run(async { Ok::<_, RuntimeError>(tokio::fs::read(&resolved).await?) })
            .await
    }

    async fn write_file(&self, cx: &CallContext, path: &Path, contents: &[u8]) -> RuntimeResult<()> {
        let resolved = self.resolve(cx, path, Access::Write).await?;
        cx.run(async {
            if let Some(parent) = resolved.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&resolved, contents).await?;
            Ok::<_, RuntimeError>(())
        })
        .await
    }

    async fn list_dir(&self, cx: &CallContext, path: &Path) -> RuntimeResult<Vec<String>> {
        let resolved = self.resolve(cx, path, Access::Read).await?;
        cx.run(async {
            let mut entries = tokio::fs::read_dir(&resolved).await?;
            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok::<_, RuntimeError>(names)
        })
        .await
    }

    fn log(&self, level: LogLevel, message: &str) {
        librarium_runtime::host::log_for_plugin(&self.key, level, message);
    }
}
