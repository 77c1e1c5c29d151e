//! Installed-plugin stores.
//!
//! A [`PluginStore`] hands the loader the manifest bytes and code of every
//! installed plugin. Two implementations ship here:
//!
//! - [`DirectoryPluginStore`]: plugins laid out on disk.
//! - [`MemoryPluginStore`]: plugins held in memory, for embedding and tests.
//!
//! ## Directory layout
//!
//! ```text
//! <plugins_dir>/
//!   global/<id>/manifest.toml     plugins visible to every scope
//!   <scope>/<id>/manifest.toml    plugins installed under a numeric scope
//! ```
//!
//! Each plugin directory holds `manifest.toml` (or `manifest.json`) and a
//! code file (`plugin.lbc` for bytecode, `plugin.native` naming a built-in
//! factory). A `.disabled` marker file disables the plugin.

use crate::error::{HostError, HostResult};
use async_trait::async_trait;
use librarium_runtime::{PluginKey, Scope};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Manifest file names, in lookup order.
pub const MANIFEST_FILES: &[&str] = &["manifest.toml", "manifest.json"];

/// Code file names, in lookup order.
pub const CODE_FILES: &[&str] = &["plugin.lbc", "plugin.native"];

/// Marker file disabling a plugin directory.
pub const DISABLED_MARKER: &str = ".disabled";

/// An installed plugin as handed to the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPlugin {
    pub key: PluginKey,
    pub manifest: Vec<u8>,
    pub code: Vec<u8>,
    pub enabled: bool,

    /// Plugin's own directory, readable by the plugin.
    pub install_dir: Option<PathBuf>,

    /// The user confirmed this version's capabilities, allowing it to
    /// widen what the previous version was granted.
    pub capabilities_confirmed: bool,
}

impl InstalledPlugin {
    pub fn new(key: PluginKey, manifest: impl Into<Vec<u8>>, code: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            manifest: manifest.into(),
            code: code.into(),
            enabled: true,
            install_dir: None,
            capabilities_confirmed: false,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.capabilities_confirmed = true;
        self
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }
}

/// Source of installed plugins.
#[async_trait]
pub trait PluginStore: Send + Sync {
    /// Every installed plugin, enabled or not.
    async fn list(&self) -> HostResult<Vec<InstalledPlugin>>;

    /// One installed plugin.
    async fn get(&self, key: &PluginKey) -> HostResult<Option<InstalledPlugin>>;
}

/// Get the user plugins directory.
pub fn user_plugins_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "raibid-labs", "librarium")
        .map(|dirs| dirs.data_dir().join("plugins"))
}

/// Plugins installed under a directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryPluginStore {
    root: PathBuf,
}

impl DirectoryPluginStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a plugin is (or would be) installed in.
    pub fn plugin_dir(&self, key: &PluginKey) -> PathBuf {
        self.root.join(key.scope.to_string()).join(&key.id)
    }

    /// Enable or disable a plugin by toggling its marker file.
    pub async fn set_enabled(&self, key: &PluginKey, enabled: bool) -> HostResult<()> {
        let dir = self.plugin_dir(key);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(HostError::PluginNotFound(key.clone()));
        }

        let marker = dir.join(DISABLED_MARKER);
        if enabled {
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            tokio::fs::write(&marker, b"").await?;
        }
        Ok(())
    }

    async fn read_plugin(&self, key: PluginKey, dir: &Path) -> HostResult<Option<InstalledPlugin>> {
        let Some(manifest) = read_first(dir, MANIFEST_FILES).await? else {
            debug!("Skipping {:?}: no manifest", dir);
            return Ok(None);
        };
        let Some(code) = read_first(dir, CODE_FILES).await? else {
            warn!(plugin = %key, "Plugin directory {:?} has no code file", dir);
            return Ok(None);
        };
        let enabled = !tokio::fs::try_exists(dir.join(DISABLED_MARKER)).await?;

        Ok(Some(InstalledPlugin {
            key,
            manifest,
            code,
            enabled,
            install_dir: Some(dir.to_path_buf()),
            capabilities_confirmed: false,
        }))
    }
}

async fn read_first(dir: &Path, names: &[&str]) -> HostResult<Option<Vec<u8>>> {
    for name in names {
        match tokio::fs::read(dir.join(name)).await {
            Ok(bytes) => return Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

async fn subdirectories(dir: &Path) -> HostResult<Vec<(String, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(HostError::PluginStore(format!("reading {:?}: {}", dir, e))),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[async_trait]
impl PluginStore for DirectoryPluginStore {
    async fn list(&self) -> HostResult<Vec<InstalledPlugin>> {
        let mut plugins = Vec::new();

        for (scope_name, scope_dir) in subdirectories(&self.root).await? {
            let scope: Scope = match scope_name.parse() {
                Ok(scope) => scope,
                Err(_) => {
                    warn!("Ignoring {:?}: not a scope directory", scope_dir);
                    continue;
                }
            };

            for (id, plugin_dir) in subdirectories(&scope_dir).await? {
                if let Some(plugin) = self.read_plugin(PluginKey::new(scope, id), &plugin_dir).await? {
                    plugins.push(plugin);
                }
            }
        }

        info!("Discovered {} installed plugins in {:?}", plugins.len(), self.root);
        Ok(plugins)
    }

    async fn get(&self, key: &PluginKey) -> HostResult<Option<InstalledPlugin>> {
        let dir = self.plugin_dir(key);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(None);
        }
        self.read_plugin(key.clone(), &dir).await
    }
}

/// Plugins held in memory.
#[derive(Debug, Default)]
pub struct MemoryPluginStore {
    plugins: RwLock<BTreeMap<PluginKey, InstalledPlugin>>,
}

impl MemoryPluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a plugin.
    pub async fn insert(&self, plugin: InstalledPlugin) {
        self.plugins.write().await.insert(plugin.key.clone(), plugin);
    }

    pub async fn remove(&self, key: &PluginKey) -> Option<InstalledPlugin> {
        self.plugins.write().await.remove(key)
    }

    pub async fn set_enabled(&self, key: &PluginKey, enabled: bool) -> HostResult<()> {
        let mut plugins = self.plugins.write().await;
        let plugin = plugins
            .get_mut(key)
            .ok_or_else(|| HostError::PluginNotFound(key.clone()))?;
        plugin.enabled = enabled;
        Ok(())
    }

    /// Remove every plugin installed under `scope`.
    pub async fn remove_scope(&self, scope: Scope) {
        self.plugins.write().await.retain(|key, _| key.scope != scope);
    }
}

#[async_trait]
impl PluginStore for MemoryPluginStore {
    async fn list(&self) -> HostResult<Vec<InstalledPlugin>> {
        Ok(self.plugins.read().await.values().cloned().collect())
    }

    async fn get(&self, key: &PluginKey) -> HostResult<Option<InstalledPlugin>> {
        Ok(self.plugins.read().await.get(key).cloned())
    }
}
