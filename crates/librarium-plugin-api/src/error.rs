//! Error types for the hook manager.

use librarium_runtime::{HookType, PluginKey, RuntimeError, Scope};
use thiserror::Error;

/// Failures of the host's own collaborators (configuration store, plugin
/// store, registry). These fail the whole operation and are not retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Configuration store error: {0}")]
    ConfigStore(String),

    #[error("Plugin store error: {0}")]
    PluginStore(String),

    /// An ordering write would create a second entry for the same plugin.
    #[error("Duplicate order entry for {plugin} in {hook} list of scope {scope}")]
    DuplicateOrderEntry {
        hook: HookType,
        scope: Scope,
        plugin: PluginKey,
    },

    #[error("Plugin not installed: {0}")]
    PluginNotFound(PluginKey),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        HostError::Io(err.to_string())
    }
}

/// Failure of a dispatch pass as seen by the caller.
///
/// Multi-producer hooks never fail because of a plugin; their per-plugin
/// failures are reported as outcomes instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Host(#[from] HostError),

    /// The plugin selected for a single-producer hook failed.
    #[error("Plugin {plugin} failed in {hook}: {source}")]
    Hook {
        plugin: PluginKey,
        hook: HookType,
        #[source]
        source: RuntimeError,
    },

    /// No loaded plugin handles the requested file type.
    #[error("No {hook} plugin handles file type '{file_type}'")]
    NoProducer { hook: HookType, file_type: String },

    /// The parent operation was cancelled before a result was produced.
    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::Io(err.to_string())
    }
}

/// Result type for host collaborator operations.
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Result type for dispatch operations.
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
