//! Plugin manager for loading installed plugins and applying lifecycle events.

use chrono::{DateTime, Utc};
use librarium_plugin_api::{
    HostError, HostResult, InstalledPlugin, MemoryConfigStore, PluginLoader, PluginRegistry,
    PluginStatus, PluginStore, Removal,
};
use librarium_runtime::{LoadError, LoadWarning, PluginKey, Scope};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// An installation change reported by the plugin installer.
///
/// Events describe changes already written to the [`PluginStore`]; the
/// manager brings the registry and configuration in line with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    /// A new plugin was installed.
    Installed(PluginKey),
    /// An installed plugin was replaced by a new version. `confirmed` is set
    /// when the user approved any capability widening.
    Updated { key: PluginKey, confirmed: bool },
    Enabled(PluginKey),
    Disabled(PluginKey),
    /// A plugin was removed; its configuration rows go with it.
    Uninstalled(PluginKey),
    /// A scope was deleted along with its plugins and settings.
    ScopeDeleted(Scope),
}

/// What happened to one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum LoadOutcome {
    Loaded,
    /// Installed but disabled; nothing is loaded.
    Disabled,
    /// Taken out of service.
    Unloaded,
    Failed(String),
}

/// Result of loading or unloading one plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub key: PluginKey,
    pub outcome: LoadOutcome,
    /// Version serving after the operation, if any.
    pub version: Option<String>,
    pub warnings: Vec<LoadWarning>,
    pub at: DateTime<Utc>,
}

impl LoadReport {
    fn new(key: PluginKey, outcome: LoadOutcome) -> Self {
        Self {
            key,
            outcome,
            version: None,
            warnings: Vec::new(),
            at: Utc::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, LoadOutcome::Failed(_))
    }
}

/// Manager for installed plugins.
///
/// The plugin manager handles startup loading and lifecycle events. It keeps
/// the [`PluginRegistry`] and the ordering/field settings consistent with
/// what is installed.
pub struct PluginManager {
    store: Arc<dyn PluginStore>,
    config: Arc<MemoryConfigStore>,
    registry: Arc<PluginRegistry>,
    loader: PluginLoader,
}

impl PluginManager {
    /// Create a new plugin manager.
    pub fn new(
        store: Arc<dyn PluginStore>,
        config: Arc<MemoryConfigStore>,
        registry: Arc<PluginRegistry>,
        loader: PluginLoader,
    ) -> Self {
        Self {
            store,
            config,
            registry,
            loader,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<MemoryConfigStore> {
        &self.config
    }

    /// Load every enabled installed plugin.
    ///
    /// A plugin that fails to load is reported and skipped; the rest still load.
    pub async fn load_all(&self) -> HostResult<Vec<LoadReport>> {
        info!("Loading installed plugins...");
        let plugins = self.store.list().await?;

        let mut reports = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            reports.push(self.load(&plugin).await);
        }

        let failed = reports.iter().filter(|r| r.is_failure()).count();
        info!(
            "Loaded {} of {} plugin(s), {} failed",
            reports.iter().filter(|r| r.outcome == LoadOutcome::Loaded).count(),
            reports.len(),
            failed
        );
        Ok(reports)
    }

    /// Apply an installation event.
    pub async fn handle(&self, event: PluginEvent) -> HostResult<Vec<LoadReport>> {
        info!(?event, "Handling plugin event");

        match event {
            PluginEvent::Installed(key) | PluginEvent::Enabled(key) => {
                let plugin = self.installed(&key).await?;
                Ok(vec![self.load(&plugin).await])
            }
            PluginEvent::Updated { key, confirmed } => {
                let mut plugin = self.installed(&key).await?;
                plugin.capabilities_confirmed = confirmed;
                Ok(vec![self.load(&plugin).await])
            }
            PluginEvent::Disabled(key) => {
                self.registry.remove(&key, Removal::Disabled).await;
                Ok(vec![LoadReport::new(key, LoadOutcome::Disabled)])
            }
            PluginEvent::Uninstalled(key) => {
                self.registry.remove(&key, Removal::Uninstalled).await;
                self.config.remove_plugin(&key).await;
                Ok(vec![LoadReport::new(key, LoadOutcome::Unloaded)])
            }
            PluginEvent::ScopeDeleted(scope) => {
                if scope.is_global() {
                    return Err(HostError::ConfigStore(
                        "the global scope cannot be deleted".to_string(),
                    ));
                }

                let mut reports = Vec::new();
                for key in self.registry.keys_in_scope(scope) {
                    self.registry.remove(&key, Removal::Uninstalled).await;
                    reports.push(LoadReport::new(key, LoadOutcome::Unloaded));
                }
                self.config.remove_scope(scope).await;
                Ok(reports)
            }
        }
    }

    /// Status of every known plugin.
    pub fn statuses(&self) -> Vec<PluginStatus> {
        self.registry.statuses()
    }

    async fn installed(&self, key: &PluginKey) -> HostResult<InstalledPlugin> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| HostError::PluginNotFound(key.clone()))
    }

    async fn load(&self, plugin: &InstalledPlugin) -> LoadReport {
        if !plugin.enabled {
            self.registry.remove(&plugin.key, Removal::Disabled).await;
            return LoadReport::new(plugin.key.clone(), LoadOutcome::Disabled);
        }

        match self.loader.load_into(&self.registry, plugin).await {
            Ok(runtime) => LoadReport {
                version: Some(runtime.version().to_string()),
                warnings: runtime.warnings().to_vec(),
                ..LoadReport::new(plugin.key.clone(), LoadOutcome::Loaded)
            },
            Err(LoadError::Superseded) => {
                LoadReport::new(plugin.key.clone(), LoadOutcome::Unloaded)
            }
            Err(err) => {
                if matches!(err, LoadError::CapabilityWidened(_)) {
                    warn!(plugin = %plugin.key, "Update needs confirmation of wider capabilities");
                }
                LoadReport {
                    version: self.registry.get(&plugin.key).map(|r| r.version().to_string()),
                    ..LoadReport::new(plugin.key.clone(), LoadOutcome::Failed(err.to_string()))
                }
            }
        }
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("loader", &self.loader)
            .field("loaded", &self.registry.snapshot().len())
            .finish()
    }
}
