//! Plugin loading.
//!
//! [`PluginLoader`] turns an [`InstalledPlugin`] into a [`Runtime`]: validate
//! the manifest, check it against the version currently serving, build a
//! capability-checked host and instantiate the code.

use crate::guard::{GuardOptions, GuardedHost};
use crate::registry::PluginRegistry;
use crate::store::InstalledPlugin;
use librarium_runtime::{
    EngineSet, LoadError, LoadResult, LoadWarning, ManifestError, ManifestValidator, Runtime,
    RuntimeOptions,
};
use std::sync::Arc;
use tracing::debug;

/// Builds runtimes for installed plugins.
#[derive(Clone)]
pub struct PluginLoader {
    validator: ManifestValidator,
    engines: Arc<EngineSet>,
    runtime_options: RuntimeOptions,
    guard_options: Arc<GuardOptions>,
    client: reqwest::Client,
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("supported_versions", &self.validator.supported_versions())
            .field("engines", &self.engines.names())
            .field("runtime_options", &self.runtime_options)
            .finish()
    }
}

impl PluginLoader {
    pub fn new(
        validator: ManifestValidator,
        engines: EngineSet,
        runtime_options: RuntimeOptions,
        guard_options: GuardOptions,
        client: reqwest::Client,
    ) -> Self {
        Self {
            validator,
            engines: Arc::new(engines),
            runtime_options,
            guard_options: Arc::new(guard_options),
            client,
        }
    }

    pub fn guard_options(&self) -> &GuardOptions {
        &self.guard_options
    }

    /// Build a runtime for `plugin`. `previous` is the version currently
    /// serving, if any; a new version may not widen its capabilities unless
    /// the user confirmed them.
    pub async fn build(&self, plugin: &InstalledPlugin, previous: Option<&Runtime>) -> LoadResult<Runtime> {
        let mut validated = self.validator.validate(&plugin.manifest)?;

        if validated.manifest.id() != plugin.key.id {
            return Err(ManifestError::Parse(format!(
                "manifest id '{}' does not match installed id '{}'",
                validated.manifest.id(),
                plugin.key.id
            ))
            .into());
        }

        if let Some(previous) = previous {
            let widened = validated
                .manifest
                .capabilities
                .widened_from(&previous.manifest().capabilities);
            if !widened.is_empty() {
                if !plugin.capabilities_confirmed {
                    return Err(LoadError::CapabilityWidened(widened));
                }
                validated.warnings.push(LoadWarning::CapabilityDiff(widened));
            }
        }

        debug!(plugin = %plugin.key, version = %validated.manifest.version(), "Building runtime");

        let host = GuardedHost::new(
            plugin.key.clone(),
            validated.manifest.capabilities.clone(),
            plugin.install_dir.clone(),
            self.guard_options.clone(),
            self.client.clone(),
        );

        Runtime::new(
            plugin.key.clone(),
            validated,
            &plugin.code,
            &self.engines,
            Arc::new(host),
            &self.runtime_options,
        )
        .await
    }

    /// Build `plugin` and hot-swap it into `registry`. On failure the
    /// current version, if any, keeps serving.
    pub async fn load_into(&self, registry: &PluginRegistry, plugin: &InstalledPlugin) -> LoadResult<Arc<Runtime>> {
        let previous = registry.get(&plugin.key);
        registry
            .reload(&plugin.key, self.build(plugin, previous.as_deref()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use librarium_runtime::{Exports, FnHook, NativeEngine, PluginKey, Scope};
    use serde_json::json;
    use std::time::Duration;

    fn manifest(id: &str, domains: &[&str]) -> String {
        let domains: Vec<String> = domains.iter().map(|d| format!("\"{}\"", d)).collect();
        format!(
            r#"
manifest_version = 1

[plugin]
id = "{id}"
name = "Lookup"
version = "1.{n}.0"
engine = "native"

[capabilities.metadata_enricher]
fields = ["title"]

[capabilities.http_access]
domains = [{domains}]
"#,
            n = domains.len(),
            domains = domains.join(", ")
        )
    }

    fn loader() -> PluginLoader {
        let native = NativeEngine::new().register("lookup", |_| {
            let mut exports = Exports::new();
            exports.insert(
                "metadata_enricher".to_string(),
                FnHook::new(|_, _| async { Ok(json!({"title": "T"})) }),
            );
            Ok(exports)
        });
        let mut engines = EngineSet::new();
        engines.register(Arc::new(native));

        PluginLoader::new(
            ManifestValidator::default(),
            engines,
            RuntimeOptions::default(),
            GuardOptions::default(),
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn test_widening_requires_confirmation() {
        let loader = loader();
        let registry = PluginRegistry::new(Duration::from_secs(1));
        let key = PluginKey::new(Scope::Id(4), "lookup");

        let v1 = InstalledPlugin::new(key.clone(), manifest("lookup", &["a.example"]), "lookup");
        loader.load_into(&registry, &v1).await.unwrap();

        let v2 = InstalledPlugin::new(
            key.clone(),
            manifest("lookup", &["a.example", "b.example"]),
            "lookup",
        );
        let err = loader.load_into(&registry, &v2).await.unwrap_err();
        assert_eq!(
            err,
            LoadError::CapabilityWidened(vec!["http domain b.example".to_string()])
        );
        assert_eq!(registry.get(&key).unwrap().version(), "1.1.0");

        let runtime = loader.load_into(&registry, &v2.confirmed()).await.unwrap();
        assert_eq!(runtime.version(), "1.2.0");
        assert_eq!(
            runtime.warnings(),
            &[LoadWarning::CapabilityDiff(vec!["http domain b.example".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_manifest_id_must_match_key() {
        let loader = loader();
        let plugin = InstalledPlugin::new(
            PluginKey::global("other"),
            manifest("lookup", &[]),
            "lookup",
        );
        assert!(matches!(
            loader.build(&plugin, None).await,
            Err(LoadError::Manifest(ManifestError::Parse(_)))
        ));
    }
}
