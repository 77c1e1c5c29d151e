//! Order resolution.
//!
//! For a `(hook type, scope)` pair the resolver produces the ordered list of
//! runtimes to invoke. A scope's override list replaces the global list
//! wholesale; a scope without an override inherits the global list. Entries
//! are dropped when disabled, not visible to the scope, or not loaded.

use crate::config_store::{ConfigStore, OrderEntry};
use crate::error::HostResult;
use crate::registry::PluginRegistry;
use librarium_runtime::{HookType, IdentifierType, PluginKey, Runtime, Scope};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// One plugin selected for a dispatch pass.
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    pub entry: OrderEntry,
    pub runtime: Arc<Runtime>,
}

impl ResolvedPlugin {
    pub fn key(&self) -> &PluginKey {
        &self.entry.plugin
    }
}

/// Result of resolving one `(hook type, scope)` pair.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub hook: HookType,
    pub scope: Scope,

    /// The scope's own override list was used.
    pub overridden: bool,

    pub plugins: Vec<ResolvedPlugin>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn keys(&self) -> Vec<PluginKey> {
        self.plugins.iter().map(|p| p.key().clone()).collect()
    }
}

/// Resolves ordered plugin lists against the configuration and the registry.
#[derive(Clone)]
pub struct OrderResolver {
    registry: Arc<PluginRegistry>,
    config: Arc<dyn ConfigStore>,
}

impl std::fmt::Debug for OrderResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderResolver")
            .field("registry", &self.registry)
            .finish()
    }
}

impl OrderResolver {
    pub fn new(registry: Arc<PluginRegistry>, config: Arc<dyn ConfigStore>) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<dyn ConfigStore> {
        &self.config
    }

    /// Ordered runtimes to invoke for `hook` on behalf of `scope`.
    ///
    /// The list is resolved against a single registry snapshot, so a
    /// concurrent reload is either fully visible or not at all.
    pub async fn resolve(&self, hook: HookType, scope: Scope) -> HostResult<Resolution> {
        let scope_list = if scope.is_global() {
            None
        } else {
            self.config.scope_order(hook, scope).await?
        };
        let overridden = scope_list.is_some();
        let mut entries = match scope_list {
            Some(entries) => entries,
            None => self.config.global_order(hook).await?,
        };
        entries.sort_by_key(|entry| entry.position);

        let snapshot = self.registry.snapshot();
        let mut seen = HashSet::new();
        let mut plugins = Vec::new();

        for entry in entries {
            if !entry.enabled || !entry.plugin.scope.is_visible_to(&scope) {
                continue;
            }
            if !seen.insert(entry.plugin.clone()) {
                continue;
            }
            let Some(runtime) = snapshot.get(&entry.plugin) else {
                continue;
            };
            if !runtime.provides(hook) {
                continue;
            }
            plugins.push(ResolvedPlugin {
                runtime: runtime.clone(),
                entry,
            });
        }

        debug!(
            hook = %hook,
            scope = %scope,
            overridden,
            resolved = plugins.len(),
            "Resolved plugin order"
        );

        Ok(Resolution {
            hook,
            scope,
            overridden,
            plugins,
        })
    }

    /// Union of the identifier types declared by the plugins resolved for
    /// `scope`.
    pub async fn identifier_types(&self, scope: Scope) -> HostResult<BTreeSet<IdentifierType>> {
        let resolution = self.resolve(HookType::IdentifierTypes, scope).await?;
        Ok(resolution
            .plugins
            .iter()
            .flat_map(|p| p.runtime.manifest().capabilities.identifier_types.iter().copied())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::MemoryConfigStore;
    use librarium_runtime::{
        EngineSet, Exports, FnHook, ManifestValidator, NativeEngine, NoAccessHost, RuntimeOptions,
    };
    use serde_json::json;
    use std::time::Duration;

    async fn load(registry: &PluginRegistry, key: PluginKey) {
        let manifest = format!(
            r#"
manifest_version = 1

[plugin]
id = "{}"
name = "Parser"
version = "1.0.0"
engine = "native"

[capabilities.file_parser]
file_types = ["epub"]

[capabilities.identifier_types]
types = ["isbn13"]
"#,
            key.id
        );
        let native = NativeEngine::new().register("parser", |_| {
            let mut exports = Exports::new();
            exports.insert(
                "file_parser".to_string(),
                FnHook::new(|_, _| async { Ok(json!({})) }),
            );
            Ok(exports)
        });
        let mut engines = EngineSet::new();
        engines.register(Arc::new(native));

        let validated = ManifestValidator::default().validate(manifest.as_bytes()).unwrap();
        let runtime = Runtime::new(
            key.clone(),
            validated,
            b"parser",
            &engines,
            Arc::new(NoAccessHost::new(key)),
            &RuntimeOptions::default(),
        )
        .await
        .unwrap();
        registry.publish(runtime).await;
    }

    fn entry(scope: Scope, plugin: &PluginKey, position: u32) -> OrderEntry {
        OrderEntry::new(HookType::FileParser, scope, plugin.clone(), position)
    }

    #[tokio::test]
    async fn test_resolve_global_order_and_filters() {
        let registry = Arc::new(PluginRegistry::new(Duration::from_secs(1)));
        let config = Arc::new(MemoryConfigStore::new());
        let a = PluginKey::global("a");
        let b = PluginKey::new(Scope::Id(7), "b");
        let c = PluginKey::global("c");
        let unloaded = PluginKey::global("unloaded");
        load(&registry, a.clone()).await;
        load(&registry, b.clone()).await;
        load(&registry, c.clone()).await;

        config
            .set_global_order(
                HookType::FileParser,
                vec![
                    entry(Scope::Global, &c, 2),
                    entry(Scope::Global, &unloaded, 0),
                    entry(Scope::Global, &b, 1),
                    entry(Scope::Global, &a, 3).disabled(),
                ],
            )
            .await
            .unwrap();

        let resolver = OrderResolver::new(registry, config);

        let scope7 = resolver.resolve(HookType::FileParser, Scope::Id(7)).await.unwrap();
        assert!(!scope7.overridden);
        assert_eq!(scope7.keys(), vec![b.clone(), c.clone()]);

        // b is installed under scope 7 and invisible elsewhere.
        let scope8 = resolver.resolve(HookType::FileParser, Scope::Id(8)).await.unwrap();
        assert_eq!(scope8.keys(), vec![c]);

        // Hooks the runtime does not provide resolve to nothing.
        let enrich = resolver
            .resolve(HookType::MetadataEnricher, Scope::Id(7))
            .await
            .unwrap();
        assert!(enrich.is_empty());
    }

    #[tokio::test]
    async fn test_scope_override_replaces_global() {
        let registry = Arc::new(PluginRegistry::new(Duration::from_secs(1)));
        let config = Arc::new(MemoryConfigStore::new());
        let a = PluginKey::global("a");
        let b = PluginKey::global("b");
        load(&registry, a.clone()).await;
        load(&registry, b.clone()).await;

        config
            .set_global_order(
                HookType::FileParser,
                vec![entry(Scope::Global, &a, 0), entry(Scope::Global, &b, 1)],
            )
            .await
            .unwrap();
        config
            .set_scope_order(HookType::FileParser, Scope::Id(5), vec![entry(Scope::Id(5), &b, 0)])
            .await
            .unwrap();
        config
            .set_scope_order(HookType::FileParser, Scope::Id(6), Vec::new())
            .await
            .unwrap();

        let resolver = OrderResolver::new(registry, config);

        let overridden = resolver.resolve(HookType::FileParser, Scope::Id(5)).await.unwrap();
        assert!(overridden.overridden);
        assert_eq!(overridden.keys(), vec![b.clone()]);

        let empty = resolver.resolve(HookType::FileParser, Scope::Id(6)).await.unwrap();
        assert!(empty.overridden && empty.is_empty());

        let inherited = resolver.resolve(HookType::FileParser, Scope::Id(9)).await.unwrap();
        assert_eq!(inherited.keys(), vec![a.clone(), b]);

        let ids = resolver.identifier_types(Scope::Id(9)).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_identifier_types_union() {
        let registry = Arc::new(PluginRegistry::new(Duration::from_secs(1)));
        let config = Arc::new(MemoryConfigStore::new());
        let a = PluginKey::global("a");
        load(&registry, a.clone()).await;
        config
            .set_global_order(
                HookType::IdentifierTypes,
                vec![OrderEntry::new(HookType::IdentifierTypes, Scope::Global, a, 0)],
            )
            .await
            .unwrap();

        let resolver = OrderResolver::new(registry, config);
        let ids = resolver.identifier_types(Scope::Id(1)).await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![IdentifierType::Isbn13]);
    }
}
