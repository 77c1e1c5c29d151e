//! Integration tests for librarium-daemon.
//!
//! These tests cover:
//! - Startup loading from a plugin directory
//! - Lifecycle events and their configuration cascades
//! - Capability widening on update
//! - Dispatch through the assembled daemon

use librarium_daemon::config::Config;
use librarium_daemon::daemon::Daemon;
use librarium_daemon::plugin::{LoadOutcome, PluginEvent};
use librarium_plugin_api::{
    ConfigStore, DirectoryPluginStore, HostError, MemoryConfigStore, PluginState,
};
use librarium_runtime::{
    BookMetadata, CallContext, EngineSet, EnrichRequest, Exports, FnHook, HookType, HostApi,
    LoadError, LoadResult, MetadataField, NativeEngine, PluginKey, Scope,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

const SETTINGS: &str = r#"
[[order]]
hook = "metadata_enricher"
scope = "global"
plugin = { scope = "global", id = "titles" }
position = 0

[[order]]
hook = "metadata_enricher"
scope = "global"
plugin = { scope = 3, id = "blurbs" }
position = 1

[[field]]
scope = 3
plugin = { scope = 3, id = "blurbs" }
field = "description"
enabled = true
"#;

fn manifest(id: &str, version: &str, domains: &[&str]) -> String {
    let http = if domains.is_empty() {
        String::new()
    } else {
        let domains: Vec<String> = domains.iter().map(|d| format!("\"{}\"", d)).collect();
        format!("[capabilities.http_access]\ndomains = [{}]\n", domains.join(", "))
    };
    format!(
        r#"
manifest_version = 1

[plugin]
id = "{id}"
name = "{id}"
version = "{version}"
engine = "native"

[capabilities.metadata_enricher]
fields = ["title", "description"]

{http}
"#
    )
}

fn write_plugin(root: &Path, scope: &str, id: &str, manifest: &str, factory: &str) {
    let dir = root.join(scope).join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("manifest.toml"), manifest).unwrap();
    std::fs::write(dir.join("plugin.native"), factory).unwrap();
}

/// A factory whose enricher always returns `output`.
fn constant(output: Value) -> impl Fn(Arc<dyn HostApi>) -> LoadResult<Exports> + Send + Sync + 'static {
    move |_| {
        let output = output.clone();
        let mut exports = Exports::new();
        exports.insert(
            "metadata_enricher".to_string(),
            FnHook::new(move |_: Value, _: CallContext| {
                let output = output.clone();
                async move { Ok(output) }
            }),
        );
        Ok(exports)
    }
}

fn engines() -> EngineSet {
    let native = NativeEngine::new()
        .register("titles", constant(json!({"title": "From Titles"})))
        .register("blurbs", constant(json!({"title": "Ignored", "description": "A blurb"})));

    let mut engines = EngineSet::with_defaults();
    engines.register(Arc::new(native));
    engines
}

fn daemon(root: &Path) -> Daemon {
    let mut config = Config::default();
    config.plugins.drain_timeout_secs = 5;
    Daemon::new(
        &config,
        Arc::new(DirectoryPluginStore::new(root)),
        MemoryConfigStore::from_toml_str(SETTINGS).unwrap(),
        engines(),
    )
    .unwrap()
}

fn install_both(root: &Path) {
    write_plugin(root, "global", "titles", &manifest("titles", "1.0.0", &[]), "titles");
    write_plugin(root, "3", "blurbs", &manifest("blurbs", "1.0.0", &[]), "blurbs");
}

fn enrich_request() -> EnrichRequest {
    EnrichRequest {
        file_type: None,
        current: BookMetadata::default(),
    }
}

// ==============================================================================
// Startup Loading
// ==============================================================================

#[tokio::test]
async fn test_load_all_reports_each_plugin() {
    let temp_dir = TempDir::new().unwrap();
    install_both(temp_dir.path());
    write_plugin(temp_dir.path(), "global", "off", &manifest("off", "1.0.0", &[]), "titles");
    std::fs::write(temp_dir.path().join("global/off/.disabled"), b"").unwrap();
    write_plugin(temp_dir.path(), "global", "broken", &manifest("broken", "1.0.0", &[]), "missing");

    let daemon = daemon(temp_dir.path());
    let reports = daemon.manager().load_all().await.unwrap();
    assert_eq!(reports.len(), 4);

    let outcome = |id: &str| {
        reports
            .iter()
            .find(|r| r.key.id == id)
            .map(|r| r.outcome.clone())
            .unwrap()
    };
    assert_eq!(outcome("titles"), LoadOutcome::Loaded);
    assert_eq!(outcome("blurbs"), LoadOutcome::Loaded);
    assert_eq!(outcome("off"), LoadOutcome::Disabled);
    assert!(matches!(outcome("broken"), LoadOutcome::Failed(_)));

    let registry = daemon.manager().registry();
    assert_eq!(registry.snapshot().len(), 2);
    assert_eq!(
        registry.status(&PluginKey::global("off")).unwrap().state,
        PluginState::Disabled
    );
    let broken = registry.status(&PluginKey::global("broken")).unwrap();
    assert_eq!(broken.state, PluginState::Error);
    assert!(broken.last_error.unwrap().contains("missing"));
}

#[tokio::test]
async fn test_load_all_with_empty_directory() {
    let temp_dir = TempDir::new().unwrap();
    let daemon = daemon(&temp_dir.path().join("not-created"));

    let reports = daemon.manager().load_all().await.unwrap();
    assert!(reports.is_empty());
    assert!(daemon.manager().statuses().is_empty());
}

// ==============================================================================
// Dispatch Through The Daemon
// ==============================================================================

#[tokio::test]
async fn test_enrich_uses_loaded_plugins_and_settings() {
    let temp_dir = TempDir::new().unwrap();
    install_both(temp_dir.path());
    let daemon = daemon(temp_dir.path());
    daemon.manager().load_all().await.unwrap();

    let parent = CallContext::with_timeout(Duration::from_secs(30));

    // Scope 3 sees both plugins; titles runs first and owns the title.
    let report = daemon
        .dispatcher()
        .enrich(Scope::Id(3), enrich_request(), &parent)
        .await
        .unwrap();
    assert_eq!(report.result.metadata.title.as_deref(), Some("From Titles"));
    assert_eq!(report.result.metadata.description.as_deref(), Some("A blurb"));
    assert_eq!(
        report.result.contributors[&MetadataField::Description],
        vec![PluginKey::new(Scope::Id(3), "blurbs")]
    );

    // The scoped plugin is invisible elsewhere.
    let report = daemon
        .dispatcher()
        .enrich(Scope::Id(4), enrich_request(), &parent)
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.result.metadata.description.is_none());
}

// ==============================================================================
// Lifecycle Events
// ==============================================================================

#[tokio::test]
async fn test_disable_and_enable_events() {
    let temp_dir = TempDir::new().unwrap();
    install_both(temp_dir.path());
    let store = DirectoryPluginStore::new(temp_dir.path());
    let daemon = daemon(temp_dir.path());
    daemon.manager().load_all().await.unwrap();

    let titles = PluginKey::global("titles");
    store.set_enabled(&titles, false).await.unwrap();
    let reports = daemon
        .manager()
        .handle(PluginEvent::Disabled(titles.clone()))
        .await
        .unwrap();
    assert_eq!(reports[0].outcome, LoadOutcome::Disabled);
    assert!(daemon.manager().registry().get(&titles).is_none());

    // Settings survive a disable.
    let order = daemon.manager().config().global_order(HookType::MetadataEnricher).await.unwrap();
    assert!(order.iter().any(|e| e.plugin == titles));

    store.set_enabled(&titles, true).await.unwrap();
    let reports = daemon
        .manager()
        .handle(PluginEvent::Enabled(titles.clone()))
        .await
        .unwrap();
    assert_eq!(reports[0].outcome, LoadOutcome::Loaded);
    assert_eq!(reports[0].version.as_deref(), Some("1.0.0"));
    assert!(daemon.manager().registry().get(&titles).is_some());
}

#[tokio::test]
async fn test_enable_event_for_disabled_plugin_stays_unloaded() {
    let temp_dir = TempDir::new().unwrap();
    install_both(temp_dir.path());
    let store = DirectoryPluginStore::new(temp_dir.path());
    let daemon = daemon(temp_dir.path());

    let titles = PluginKey::global("titles");
    store.set_enabled(&titles, false).await.unwrap();
    let reports = daemon.manager().handle(PluginEvent::Installed(titles.clone())).await.unwrap();
    assert_eq!(reports[0].outcome, LoadOutcome::Disabled);
    assert!(daemon.manager().registry().get(&titles).is_none());
}

#[tokio::test]
async fn test_uninstall_cascades_to_settings() {
    let temp_dir = TempDir::new().unwrap();
    install_both(temp_dir.path());
    let daemon = daemon(temp_dir.path());
    daemon.manager().load_all().await.unwrap();

    let titles = PluginKey::global("titles");
    std::fs::remove_dir_all(temp_dir.path().join("global/titles")).unwrap();
    let reports = daemon
        .manager()
        .handle(PluginEvent::Uninstalled(titles.clone()))
        .await
        .unwrap();
    assert_eq!(reports[0].outcome, LoadOutcome::Unloaded);

    let registry = daemon.manager().registry();
    assert!(registry.get(&titles).is_none());
    assert!(registry.status(&titles).is_none());

    let order = daemon.manager().config().global_order(HookType::MetadataEnricher).await.unwrap();
    let plugins: Vec<&PluginKey> = order.iter().map(|e| &e.plugin).collect();
    assert_eq!(plugins, vec![&PluginKey::new(Scope::Id(3), "blurbs")]);
}

#[tokio::test]
async fn test_scope_deletion_cascades() {
    let temp_dir = TempDir::new().unwrap();
    install_both(temp_dir.path());
    let daemon = daemon(temp_dir.path());
    daemon.manager().load_all().await.unwrap();

    let blurbs = PluginKey::new(Scope::Id(3), "blurbs");
    let reports = daemon
        .manager()
        .handle(PluginEvent::ScopeDeleted(Scope::Id(3)))
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].key, blurbs);

    let config = daemon.manager().config();
    assert!(daemon.manager().registry().get(&blurbs).is_none());
    assert!(daemon.manager().registry().get(&PluginKey::global("titles")).is_some());
    assert!(config.field_settings(Scope::Id(3), &blurbs).await.unwrap().is_empty());
    let order = config.global_order(HookType::MetadataEnricher).await.unwrap();
    assert!(order.iter().all(|e| e.plugin != blurbs));
}

#[tokio::test]
async fn test_global_scope_cannot_be_deleted() {
    let temp_dir = TempDir::new().unwrap();
    let daemon = daemon(temp_dir.path());

    let err = daemon
        .manager()
        .handle(PluginEvent::ScopeDeleted(Scope::Global))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::ConfigStore(_)));
}

#[tokio::test]
async fn test_event_for_unknown_plugin() {
    let temp_dir = TempDir::new().unwrap();
    let daemon = daemon(temp_dir.path());
    let ghost = PluginKey::global("ghost");

    let err = daemon
        .manager()
        .handle(PluginEvent::Installed(ghost.clone()))
        .await
        .unwrap_err();
    assert_eq!(err, HostError::PluginNotFound(ghost));
}

// ==============================================================================
// Updates
// ==============================================================================

#[tokio::test]
async fn test_update_widening_needs_confirmation() {
    let temp_dir = TempDir::new().unwrap();
    write_plugin(
        temp_dir.path(),
        "global",
        "titles",
        &manifest("titles", "1.0.0", &["a.example"]),
        "titles",
    );
    let daemon = daemon(temp_dir.path());
    daemon.manager().load_all().await.unwrap();
    let titles = PluginKey::global("titles");

    write_plugin(
        temp_dir.path(),
        "global",
        "titles",
        &manifest("titles", "2.0.0", &["a.example", "b.example"]),
        "titles",
    );

    let reports = daemon
        .manager()
        .handle(PluginEvent::Updated {
            key: titles.clone(),
            confirmed: false,
        })
        .await
        .unwrap();
    let expected = LoadError::CapabilityWidened(vec!["http domain b.example".to_string()]);
    assert_eq!(reports[0].outcome, LoadOutcome::Failed(expected.to_string()));
    // The old version keeps serving.
    assert_eq!(reports[0].version.as_deref(), Some("1.0.0"));
    let status = daemon.manager().registry().status(&titles).unwrap();
    assert_eq!(status.state, PluginState::Loaded);
    assert!(status.last_error.is_some());

    let reports = daemon
        .manager()
        .handle(PluginEvent::Updated {
            key: titles.clone(),
            confirmed: true,
        })
        .await
        .unwrap();
    assert_eq!(reports[0].outcome, LoadOutcome::Loaded);
    assert_eq!(reports[0].version.as_deref(), Some("2.0.0"));
    assert_eq!(daemon.manager().registry().get(&titles).unwrap().version(), "2.0.0");
}

#[tokio::test]
async fn test_shutdown_drains_everything() {
    let temp_dir = TempDir::new().unwrap();
    install_both(temp_dir.path());
    let daemon = daemon(temp_dir.path());
    daemon.manager().load_all().await.unwrap();
    assert_eq!(daemon.manager().registry().snapshot().len(), 2);

    daemon.shutdown().await;
    assert!(daemon.manager().registry().snapshot().is_empty());
}
