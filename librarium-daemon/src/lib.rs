//! Librarium daemon library
//!
//! This module exports the internal components of the daemon for testing purposes.

pub mod config;
pub mod daemon;
pub mod plugin;
