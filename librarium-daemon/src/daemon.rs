//! Daemon assembly: wires stores, registry, loader and dispatcher from a
//! [`Config`].

use crate::config::Config;
use crate::plugin::PluginManager;
use anyhow::{Context, Result};
use librarium_plugin_api::{
    http_client, DirectoryPluginStore, HookDispatcher, MemoryConfigStore, OrderResolver,
    PluginLoader, PluginRegistry, PluginStore, WorkerPools,
};
use librarium_runtime::EngineSet;
use std::sync::Arc;
use tracing::info;

/// The running host: plugin manager plus the dispatcher the pipeline calls.
#[derive(Debug)]
pub struct Daemon {
    manager: PluginManager,
    dispatcher: HookDispatcher,
}

impl Daemon {
    /// Build a daemon over the configured plugin directory and settings file.
    pub async fn from_config(config: &Config, engines: EngineSet) -> Result<Self> {
        let plugins_dir = config.plugins_dir()?;
        let settings_path = config.settings_path()?;
        info!("Plugins directory: {}", plugins_dir.display());
        info!("Settings file: {}", settings_path.display());

        let settings = MemoryConfigStore::load(&settings_path)
            .await
            .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;

        Self::new(
            config,
            Arc::new(DirectoryPluginStore::new(plugins_dir)),
            settings,
            engines,
        )
    }

    /// Build a daemon over explicit stores.
    pub fn new(
        config: &Config,
        store: Arc<dyn PluginStore>,
        settings: MemoryConfigStore,
        engines: EngineSet,
    ) -> Result<Self> {
        let client = http_client().context("Failed to build HTTP client")?;
        let loader = PluginLoader::new(
            config.manifest_validator(),
            engines,
            config.runtime_options(),
            config.guard_options(),
            client,
        );

        let registry = Arc::new(PluginRegistry::new(config.drain_timeout()));
        let settings = Arc::new(settings);
        let resolver = OrderResolver::new(registry.clone(), settings.clone());

        let mut dispatcher = HookDispatcher::new(
            resolver,
            WorkerPools::new(config.pool_sizes()),
            config.hook_timeouts(),
        );
        if let Some(ref temp_dir) = config.daemon.temp_dir {
            dispatcher = dispatcher.with_temp_root(temp_dir.clone());
        }

        Ok(Self {
            manager: PluginManager::new(store, settings, registry, loader),
            dispatcher,
        })
    }

    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    pub fn dispatcher(&self) -> &HookDispatcher {
        &self.dispatcher
    }

    /// Take every runtime out of service, waiting for in-flight calls.
    pub async fn shutdown(&self) {
        info!("Draining plugin runtimes...");
        self.manager.registry().drain_all().await;
    }
}
