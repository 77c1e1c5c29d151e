//! Ordering and field-setting configuration.
//!
//! The hook manager never persists configuration itself; it queries a
//! [`ConfigStore`]. [`MemoryConfigStore`] is the in-process implementation,
//! optionally seeded from a TOML settings file:
//!
//! ```toml
//! [[order]]
//! hook = "metadata_enricher"
//! scope = "global"                              # list owner: "global" or a scope
//! plugin = { scope = "global", id = "openlibrary" }
//! position = 0
//! enabled = true
//!
//! [[field]]
//! scope = 7
//! plugin = { scope = "global", id = "openlibrary" }
//! field = "title"
//! enabled = false
//! ```

use crate::error::{HostError, HostResult};
use async_trait::async_trait;
use librarium_runtime::{HookType, MetadataField, PluginKey, Scope};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

/// One row of an ordered plugin list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEntry {
    pub hook: HookType,

    /// Owner of the list: `Global` for the default list, otherwise the scope
    /// whose override this row belongs to.
    pub scope: Scope,

    pub plugin: PluginKey,
    pub position: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl OrderEntry {
    pub fn new(hook: HookType, scope: Scope, plugin: PluginKey, position: u32) -> Self {
        Self {
            hook,
            scope,
            plugin,
            position,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Enablement of one logical field for one plugin, globally or per scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSetting {
    pub scope: Scope,
    pub plugin: PluginKey,
    pub field: MetadataField,
    pub enabled: bool,
}

/// Configuration consumed by the order resolver and the field filter.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// The default ordered list for a hook type.
    async fn global_order(&self, hook: HookType) -> HostResult<Vec<OrderEntry>>;

    /// A scope's override list. `None` means the scope inherits the global
    /// list; `Some(vec![])` is an explicit override running no plugins.
    async fn scope_order(&self, hook: HookType, scope: Scope) -> HostResult<Option<Vec<OrderEntry>>>;

    /// Field rows for a plugin at one level (`Scope::Global` for the global
    /// rows). Fields without a row are absent from the map.
    async fn field_settings(&self, scope: Scope, plugin: &PluginKey) -> HostResult<BTreeMap<MetadataField, bool>>;
}

#[derive(Debug, Default)]
struct Settings {
    global: HashMap<HookType, Vec<OrderEntry>>,
    overrides: HashMap<(HookType, Scope), Vec<OrderEntry>>,
    fields: BTreeMap<(Scope, PluginKey), BTreeMap<MetadataField, bool>>,
}

/// In-memory configuration store.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    settings: RwLock<Settings>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    order: Vec<OrderEntry>,
    #[serde(default)]
    field: Vec<FieldSetting>,
}

/// Reject rows for the wrong list and duplicate plugins within a list.
fn check_list(hook: HookType, scope: Scope, entries: &[OrderEntry]) -> HostResult<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        if entry.hook != hook || entry.scope != scope {
            return Err(HostError::ConfigStore(format!(
                "entry for {} in {} list of scope {} does not belong to the {} list of scope {}",
                entry.plugin, entry.hook, entry.scope, hook, scope
            )));
        }
        if !seen.insert(&entry.plugin) {
            return Err(HostError::DuplicateOrderEntry {
                hook,
                scope,
                plugin: entry.plugin.clone(),
            });
        }
    }
    Ok(())
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from the TOML settings format.
    pub fn from_toml_str(content: &str) -> HostResult<Self> {
        let file: SettingsFile = toml::from_str(content)
            .map_err(|e| HostError::ConfigStore(format!("invalid settings: {}", e)))?;

        let mut settings = Settings::default();
        let mut lists: BTreeMap<(HookType, Scope), Vec<OrderEntry>> = BTreeMap::new();
        for entry in file.order {
            lists.entry((entry.hook, entry.scope)).or_default().push(entry);
        }
        for ((hook, scope), entries) in lists {
            check_list(hook, scope, &entries)?;
            if scope.is_global() {
                settings.global.insert(hook, entries);
            } else {
                settings.overrides.insert((hook, scope), entries);
            }
        }

        for row in file.field {
            settings
                .fields
                .entry((row.scope, row.plugin))
                .or_default()
                .insert(row.field, row.enabled);
        }

        Ok(Self {
            settings: RwLock::new(settings),
        })
    }

    /// Load the TOML settings file; a missing file yields an empty store.
    pub async fn load(path: &Path) -> HostResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {:?}; starting empty", path);
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the global list for a hook type.
    pub async fn set_global_order(&self, hook: HookType, entries: Vec<OrderEntry>) -> HostResult<()> {
        check_list(hook, Scope::Global, &entries)?;
        self.settings.write().await.global.insert(hook, entries);
        Ok(())
    }

    /// Create or replace a scope's override for a hook type.
    pub async fn set_scope_order(&self, hook: HookType, scope: Scope, entries: Vec<OrderEntry>) -> HostResult<()> {
        if scope.is_global() {
            return self.set_global_order(hook, entries).await;
        }
        check_list(hook, scope, &entries)?;
        self.settings.write().await.overrides.insert((hook, scope), entries);
        Ok(())
    }

    /// Drop a scope's override; the scope inherits the global list again.
    pub async fn clear_scope_order(&self, hook: HookType, scope: Scope) -> bool {
        self.settings.write().await.overrides.remove(&(hook, scope)).is_some()
    }

    pub async fn set_field_setting(&self, setting: FieldSetting) {
        self.settings
            .write()
            .await
            .fields
            .entry((setting.scope, setting.plugin))
            .or_default()
            .insert(setting.field, setting.enabled);
    }

    /// Cascade-delete every row referencing an uninstalled plugin.
    pub async fn remove_plugin(&self, plugin: &PluginKey) {
        let mut guard = self.settings.write().await;
        let settings = &mut *guard;
        for list in settings.global.values_mut().chain(settings.overrides.values_mut()) {
            list.retain(|entry| &entry.plugin != plugin);
        }
        settings.fields.retain(|(_, p), _| p != plugin);
    }

    /// Cascade-delete a scope: its overrides, its field rows, and every row
    /// referencing a plugin installed under it.
    pub async fn remove_scope(&self, scope: Scope) {
        if scope.is_global() {
            return;
        }

        let mut guard = self.settings.write().await;
        let settings = &mut *guard;
        settings.overrides.retain(|(_, s), _| *s != scope);
        for list in settings.global.values_mut().chain(settings.overrides.values_mut()) {
            list.retain(|entry| entry.plugin.scope != scope);
        }
        settings
            .fields
            .retain(|(s, p), _| *s != scope && p.scope != scope);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn global_order(&self, hook: HookType) -> HostResult<Vec<OrderEntry>> {
        Ok(self
            .settings
            .read()
            .await
            .global
            .get(&hook)
            .cloned()
            .unwrap_or_default())
    }

    async fn scope_order(&self, hook: HookType, scope: Scope) -> HostResult<Option<Vec<OrderEntry>>> {
        Ok(self.settings.read().await.overrides.get(&(hook, scope)).cloned())
    }

    async fn field_settings(&self, scope: Scope, plugin: &PluginKey) -> HostResult<BTreeMap<MetadataField, bool>> {
        Ok(self
            .settings
            .read()
            .await
            .fields
            .get(&(scope, plugin.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"
[[order]]
hook = "metadata_enricher"
scope = "global"
plugin = { scope = "global", id = "a" }
position = 0

[[order]]
hook = "metadata_enricher"
scope = "global"
plugin = { scope = 7, id = "b" }
position = 1

[[order]]
hook = "metadata_enricher"
scope = 7
plugin = { scope = 7, id = "b" }
position = 0
enabled = false

[[field]]
scope = 7
plugin = { scope = "global", id = "a" }
field = "title"
enabled = false
"#;

    #[tokio::test]
    async fn test_load_from_toml() {
        let store = MemoryConfigStore::from_toml_str(SETTINGS).unwrap();
        let hook = HookType::MetadataEnricher;

        assert_eq!(store.global_order(hook).await.unwrap().len(), 2);
        let overridden = store.scope_order(hook, Scope::Id(7)).await.unwrap().unwrap();
        assert!(!overridden[0].enabled);
        assert!(store.scope_order(hook, Scope::Id(8)).await.unwrap().is_none());

        let fields = store
            .field_settings(Scope::Id(7), &PluginKey::global("a"))
            .await
            .unwrap();
        assert_eq!(fields.get(&MetadataField::Title), Some(&false));
    }

    #[tokio::test]
    async fn test_duplicate_entries_rejected() {
        let store = MemoryConfigStore::new();
        let hook = HookType::FileParser;
        let a = PluginKey::global("a");

        let result = store
            .set_global_order(
                hook,
                vec![
                    OrderEntry::new(hook, Scope::Global, a.clone(), 0),
                    OrderEntry::new(hook, Scope::Global, a.clone(), 1),
                ],
            )
            .await;
        assert_eq!(
            result,
            Err(HostError::DuplicateOrderEntry {
                hook,
                scope: Scope::Global,
                plugin: a.clone(),
            })
        );

        // A row owned by another list is rejected too.
        let result = store
            .set_scope_order(hook, Scope::Id(2), vec![OrderEntry::new(hook, Scope::Id(3), a, 0)])
            .await;
        assert!(matches!(result, Err(HostError::ConfigStore(_))));
    }

    #[tokio::test]
    async fn test_cascade_deletes() {
        let store = MemoryConfigStore::from_toml_str(SETTINGS).unwrap();
        let hook = HookType::MetadataEnricher;

        store.remove_plugin(&PluginKey::global("a")).await;
        assert_eq!(store.global_order(hook).await.unwrap().len(), 1);
        assert!(store
            .field_settings(Scope::Id(7), &PluginKey::global("a"))
            .await
            .unwrap()
            .is_empty());

        store.remove_scope(Scope::Id(7)).await;
        assert!(store.global_order(hook).await.unwrap().is_empty());
        assert!(store.scope_order(hook, Scope::Id(7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_scope_order() {
        let store = MemoryConfigStore::from_toml_str(SETTINGS).unwrap();
        let hook = HookType::MetadataEnricher;

        assert!(store.clear_scope_order(hook, Scope::Id(7)).await);
        assert!(!store.clear_scope_order(hook, Scope::Id(7)).await);
        assert!(store.scope_order(hook, Scope::Id(7)).await.unwrap().is_none());
    }
}
