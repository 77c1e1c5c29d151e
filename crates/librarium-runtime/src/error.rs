//! Error types for the Librarium runtime.
//!
//! Errors are split along the lifecycle of a plugin:
//! - [`ManifestError`]: the manifest was rejected at the boundary.
//! - [`LoadError`]: the plugin never became a dispatchable runtime.
//! - [`RuntimeError`]: a single hook call failed; the runtime keeps serving.

use crate::capability::HookType;
use std::time::Duration;
use thiserror::Error;

/// Hard failures produced while validating a plugin manifest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// The manifest could not be decoded.
    #[error("Manifest parse error: {0}")]
    Parse(String),

    /// The declared manifest version is outside the host's supported set.
    #[error("Unsupported manifest version {found} (supported: {supported:?})")]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    /// A capability references something outside the fixed vocabulary.
    #[error("Invalid capability '{capability}': {reason}")]
    InvalidCapability { capability: String, reason: String },
}

impl ManifestError {
    pub(crate) fn invalid(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        ManifestError::InvalidCapability {
            capability: capability.into(),
            reason: reason.into(),
        }
    }
}

/// Fatal load failures. A plugin that hits one of these never participates
/// in dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Manifest validation failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The manifest names an engine the host does not provide.
    #[error("Unknown plugin engine: {0}")]
    UnknownEngine(String),

    /// The entry point could not be found in the plugin code.
    #[error("Entry point missing: {0}")]
    EntryPointMissing(String),

    /// The plugin code failed while its module was being evaluated.
    #[error("Plugin initialization failed: {0}")]
    ExecutionInit(String),

    /// The plugin exported a hook kind it did not declare.
    #[error("Plugin exports undeclared hook '{0}'")]
    UndeclaredExport(String),

    /// An update asked for broader capabilities than the installed version
    /// without the user confirming them.
    #[error("Capabilities widened without confirmation: {}", .0.join(", "))]
    CapabilityWidened(Vec<String>),

    /// The plugin was disabled or uninstalled while this version was being
    /// built; the new runtime was discarded.
    #[error("Plugin was removed while loading")]
    Superseded,

    /// The plugin files could not be read.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        LoadError::Io(err.to_string())
    }
}

/// Errors raised by a single hook call. Isolated to the plugin and the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The plugin attempted something outside its declared capabilities.
    #[error("Capability denied ({capability}): {detail}")]
    CapabilityDenied { capability: String, detail: String },

    /// The call did not finish before its deadline.
    #[error("Hook call timed out after {0:?}")]
    Timeout(Duration),

    /// The call was cancelled by its parent operation.
    #[error("Hook call cancelled")]
    Cancelled,

    /// The plugin raised an error while executing.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The plugin returned a value that does not match the hook contract.
    #[error("Invalid hook output: {0}")]
    InvalidOutput(String),

    /// The runtime does not provide the requested hook.
    #[error("Hook not exported: {0}")]
    NotExported(HookType),

    /// An outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A filesystem operation failed.
    #[error("IO error: {0}")]
    Io(String),
}

impl RuntimeError {
    pub fn denied(capability: impl Into<String>, detail: impl Into<String>) -> Self {
        RuntimeError::CapabilityDenied {
            capability: capability.into(),
            detail: detail.into(),
        }
    }

    /// Whether the error came from the call running out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Timeout(_))
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::InvalidOutput(err.to_string())
    }
}

/// Result type for manifest validation.
pub type ManifestResult<T> = std::result::Result<T, ManifestError>;

/// Result type for plugin loading.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Result type for hook calls.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
