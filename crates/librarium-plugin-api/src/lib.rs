//! # librarium-plugin-api
//!
//! Hook manager for Librarium plugins.
//!
//! This crate sits between the cataloging pipeline and the plugin runtimes.
//! It provides:
//!
//! - The capability guard injected into every runtime
//! - Installed-plugin and configuration stores
//! - The plugin registry with hot-reload
//! - Order resolution with per-scope overrides
//! - Field filtering, metadata merging and hook dispatch
//!
//! ## Dispatch Flow
//!
//! A caller asks the [`HookDispatcher`] to run a hook for a scope. The
//! [`OrderResolver`] computes the ordered runtimes, each is called under a
//! deadline through its [`GuardedHost`], and enrichment output passes through
//! the field filter and [`MetadataMerger`] before it is returned.

pub mod config_store;
pub mod dispatcher;
pub mod error;
pub mod guard;
pub mod loader;
pub mod merge;
pub mod order;
pub mod pool;
pub mod registry;
pub mod store;

pub use config_store::{ConfigStore, FieldSetting, MemoryConfigStore, OrderEntry};
pub use dispatcher::{
    DispatchReport, HookDispatcher, HookOutput, HookRequest, HookTimeouts, MergedMetadata,
    OutcomeStatus, PerPluginOutcome, ProducedFile,
};
pub use error::{DispatchError, DispatchResult, HostError, HostResult};
pub use guard::{http_client, GuardOptions, GuardedHost};
pub use loader::PluginLoader;
pub use merge::{effective_field_settings, filter_enrichment, EffectiveFields, MetadataMerger};
pub use order::{OrderResolver, Resolution, ResolvedPlugin};
pub use pool::{PoolSizes, WorkerPools};
pub use registry::{PluginRegistry, PluginState, PluginStatus, Removal, Snapshot};
pub use store::{DirectoryPluginStore, InstalledPlugin, MemoryPluginStore, PluginStore};
