//! # Plugin Management
//!
//! Manages installed plugins for the Librarium daemon.
//!
//! This module provides:
//! - Startup loading of every enabled plugin
//! - Lifecycle events (install, update, enable, disable, uninstall)
//! - Cascading configuration cleanup on uninstall and scope deletion

mod manager;

pub use manager::{LoadOutcome, LoadReport, PluginEvent, PluginManager};
