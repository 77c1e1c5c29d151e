//! # librarium-runtime
//!
//! Sandboxed plugin runtime for Librarium.
//!
//! This crate provides:
//! - Plugin manifest parsing and validation
//! - The capability model and the fixed metadata vocabulary
//! - Bytecode loading, validation and a sandboxed interpreter
//! - The [`HostApi`] seam through which plugins reach the outside world
//! - [`Runtime`], one loaded plugin version with typed hook methods
//!
//! ## Plugin Structure
//!
//! Plugins are directories containing:
//! - `manifest.toml` - Plugin metadata and capabilities
//! - `plugin.lbc` - Compiled bytecode (or the factory name for native plugins)
//!
//! ## Security Model
//!
//! Plugins declare the hooks they implement and the resources they need in
//! their manifest. Only declared hooks are bound, and every host call goes
//! through a capability-checked [`HostApi`] injected per runtime.

pub mod bytecode;
pub mod capability;
pub mod context;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod host;
pub mod manifest;
pub mod metadata;
pub mod runtime;
pub mod scope;
pub mod vm;

pub use bytecode::{Bytecode, BytecodeLoader};
pub use capability::{normalize_file_type, Capabilities, DomainRule, FileAccessLevel, HookType};
pub use context::CallContext;
pub use engine::{BytecodeEngine, Engine, EngineSet, Exports, FnHook, HookFn, NativeEngine};
pub use error::{LoadError, LoadResult, ManifestError, ManifestResult, RuntimeError, RuntimeResult};
pub use hooks::{ConvertOutput, ConvertRequest, EnrichRequest, GenerateOutput, GenerateRequest, ParseRequest};
pub use host::{HostApi, HttpMethod, HttpRequest, HttpResponse, LogLevel, NoAccessHost};
pub use manifest::{LoadWarning, ManifestValidator, PluginManifest, PluginMetadata, ValidatedManifest};
pub use metadata::{BookMetadata, Identifier, IdentifierType, MetadataField};
pub use runtime::{Runtime, RuntimeOptions};
pub use scope::{PluginKey, Scope};
pub use vm::VmLimits;
