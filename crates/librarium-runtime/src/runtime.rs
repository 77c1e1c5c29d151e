//! A loaded plugin version.
//!
//! A [`Runtime`] wraps the hook implementations exported by one version of a
//! plugin, restricted to the hooks its manifest declares. Runtimes are
//! immutable after construction apart from call bookkeeping; a new plugin
//! version always gets a new Runtime.

use crate::capability::HookType;
use crate::context::CallContext;
use crate::engine::{EngineSet, Exports, HookFn};
use crate::error::{LoadError, LoadResult, RuntimeError, RuntimeResult};
use crate::hooks::{ConvertOutput, ConvertRequest, EnrichRequest, GenerateOutput, GenerateRequest, ParseRequest};
use crate::host::HostApi;
use crate::manifest::{LoadWarning, PluginManifest, ValidatedManifest};
use crate::scope::PluginKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Options applied while constructing a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Reject plugins exporting hooks they did not declare. When false the
    /// export is dropped with a warning.
    pub strict_exports: bool,

    /// Deadline for evaluating the plugin's entry code.
    pub init_timeout: Duration,

    /// Consecutive timeouts after which the runtime is flagged. Zero
    /// disables flagging.
    pub flag_after_timeouts: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            strict_exports: true,
            init_timeout: Duration::from_secs(30),
            flag_after_timeouts: 3,
        }
    }
}

/// One loaded, executable plugin version.
pub struct Runtime {
    key: PluginKey,
    manifest: PluginManifest,
    warnings: Vec<LoadWarning>,
    engine: String,
    hooks: HashMap<HookType, Arc<dyn HookFn>>,
    in_flight: AtomicUsize,
    drained: Notify,
    consecutive_timeouts: AtomicU32,
    flag_after_timeouts: u32,
    flagged: AtomicBool,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("key", &self.key)
            .field("version", &self.manifest.plugin.version)
            .field("engine", &self.engine)
            .field("hooks", &self.exported_hooks())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Runtime {
    /// Instantiate the plugin code and bind its exports to declared hooks.
    ///
    /// Fails with [`LoadError::EntryPointMissing`], [`LoadError::ExecutionInit`]
    /// or [`LoadError::UndeclaredExport`]; the plugin then never participates
    /// in dispatch.
    pub async fn new(
        key: PluginKey,
        validated: ValidatedManifest,
        code: &[u8],
        engines: &EngineSet,
        host: Arc<dyn HostApi>,
        options: &RuntimeOptions,
    ) -> LoadResult<Self> {
        let ValidatedManifest {
            manifest,
            mut warnings,
        } = validated;

        let engine = engines.get(&manifest.plugin.engine)?;
        let cx = CallContext::with_timeout(options.init_timeout);
        let exports = engine.instantiate(&manifest, code, host, &cx).await?;
        let hooks = bind_exports(&manifest, exports, options.strict_exports, &mut warnings)?;

        for warning in &warnings {
            warn!(plugin = %key, "Plugin load warning: {}", warning);
        }

        let mut exported: Vec<&str> = hooks.keys().map(|h| h.as_str()).collect();
        exported.sort_unstable();
        info!(
            plugin = %key,
            version = %manifest.plugin.version,
            engine = engine.name(),
            hooks = ?exported,
            "Runtime loaded"
        );

        Ok(Self {
            key,
            engine: engine.name().to_string(),
            manifest,
            warnings,
            hooks,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            consecutive_timeouts: AtomicU32::new(0),
            flag_after_timeouts: options.flag_after_timeouts,
            flagged: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &PluginKey {
        &self.key
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn version(&self) -> &str {
        &self.manifest.plugin.version
    }

    pub fn warnings(&self) -> &[LoadWarning] {
        &self.warnings
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Hooks with a bound implementation.
    pub fn exported_hooks(&self) -> Vec<HookType> {
        let mut hooks: Vec<HookType> = self.hooks.keys().copied().collect();
        hooks.sort();
        hooks
    }

    /// Whether this runtime takes part in `hook`. For `identifier_types`
    /// that is a declaration; for every other hook an active export.
    pub fn provides(&self, hook: HookType) -> bool {
        if hook.is_callable() {
            self.hooks.contains_key(&hook)
        } else {
            self.manifest.declares(hook)
        }
    }

    /// Whether this runtime handles `file_type` for `hook`.
    pub fn supports_file_type(&self, hook: HookType, file_type: &str) -> bool {
        self.provides(hook) && self.manifest.capabilities.handles_file_type(hook, file_type)
    }

    /// Number of hook calls currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Call a hook with a raw JSON input.
    pub async fn invoke(&self, hook: HookType, input: Value, cx: &CallContext) -> RuntimeResult<Value> {
        let hook_fn = self
            .hooks
            .get(&hook)
            .cloned()
            .ok_or(RuntimeError::NotExported(hook))?;

        let _guard = self.enter();
        debug!(plugin = %self.key, hook = %hook, "Invoking hook");
        hook_fn.call(input, cx).await
    }

    pub async fn convert(&self, request: &ConvertRequest, cx: &CallContext) -> RuntimeResult<ConvertOutput> {
        self.typed(HookType::InputConverter, request, cx).await
    }

    /// Parse a file. Returns the raw metadata object.
    pub async fn parse(&self, request: &ParseRequest, cx: &CallContext) -> RuntimeResult<Map<String, Value>> {
        let output = self.invoke(HookType::FileParser, to_input(request)?, cx).await?;
        into_object(output)
    }

    pub async fn generate(&self, request: &GenerateRequest, cx: &CallContext) -> RuntimeResult<GenerateOutput> {
        self.typed(HookType::OutputGenerator, request, cx).await
    }

    /// Enrich metadata. Returns the raw delta object, unfiltered.
    pub async fn enrich(&self, request: &EnrichRequest, cx: &CallContext) -> RuntimeResult<Map<String, Value>> {
        let output = self.invoke(HookType::MetadataEnricher, to_input(request)?, cx).await?;
        into_object(output)
    }

    async fn typed<I, O>(&self, hook: HookType, request: &I, cx: &CallContext) -> RuntimeResult<O>
    where
        I: Serialize + Sync,
        O: DeserializeOwned,
    {
        let output = self.invoke(hook, to_input(request)?, cx).await?;
        serde_json::from_value(output)
            .map_err(|e| RuntimeError::InvalidOutput(format!("{} output: {}", hook, e)))
    }

    /// Wait until no hook call is in flight.
    pub async fn close(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight.load(Ordering::SeqCst) == 0 {
                debug!(plugin = %self.key, version = %self.version(), "Runtime drained");
                return;
            }
            notified.await;
        }
    }

    /// Record a timed-out call. Returns true when this call flagged the runtime.
    pub fn record_timeout(&self) -> bool {
        let count = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.flag_after_timeouts == 0 || count < self.flag_after_timeouts {
            return false;
        }

        let newly_flagged = !self.flagged.swap(true, Ordering::SeqCst);
        if newly_flagged {
            warn!(
                plugin = %self.key,
                consecutive_timeouts = count,
                "Runtime flagged after repeated timeouts"
            );
        }
        newly_flagged
    }

    /// Record a completed call, resetting the timeout streak.
    pub fn record_success(&self) {
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::SeqCst)
    }

    /// Whether repeated timeouts flagged this runtime. Sticky until the
    /// plugin is reloaded.
    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::SeqCst)
    }

    fn enter(&self) -> CallGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        CallGuard { runtime: self }
    }
}

struct CallGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.runtime.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.runtime.drained.notify_waiters();
        }
    }
}

fn to_input<T: Serialize>(request: &T) -> RuntimeResult<Value> {
    serde_json::to_value(request).map_err(|e| RuntimeError::Execution(format!("encoding hook input: {}", e)))
}

fn into_object(output: Value) -> RuntimeResult<Map<String, Value>> {
    match output {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(RuntimeError::InvalidOutput(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Keep only exports backed by a declared capability.
fn bind_exports(
    manifest: &PluginManifest,
    exports: Exports,
    strict: bool,
    warnings: &mut Vec<LoadWarning>,
) -> LoadResult<HashMap<HookType, Arc<dyn HookFn>>> {
    let mut hooks = HashMap::new();

    for (name, hook_fn) in exports {
        let hook = match name.parse::<HookType>() {
            Ok(hook) if hook.is_callable() => hook,
            _ => {
                warnings.push(LoadWarning::UnknownExport(name));
                continue;
            }
        };

        if !manifest.declares(hook) {
            if strict {
                return Err(LoadError::UndeclaredExport(name));
            }
            warnings.push(LoadWarning::UndeclaredExportDropped(name));
            continue;
        }

        if hook == HookType::MetadataEnricher && !enricher_active(manifest) {
            continue;
        }

        hooks.insert(hook, hook_fn);
    }

    for hook in manifest.capabilities.hook_types() {
        if !hook.is_callable() || hooks.contains_key(&hook) {
            continue;
        }
        if hook == HookType::MetadataEnricher && !enricher_active(manifest) {
            continue;
        }
        warnings.push(LoadWarning::DeclaredHookNotExported(hook));
    }

    Ok(hooks)
}

fn enricher_active(manifest: &PluginManifest) -> bool {
    manifest
        .capabilities
        .metadata_enricher
        .as_ref()
        .is_some_and(|e| e.is_active())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FnHook, NativeEngine};
    use crate::host::NoAccessHost;
    use crate::manifest::ManifestValidator;
    use serde_json::json;
    use std::time::Duration;

    const MANIFEST: &str = r#"
manifest_version = 1

[plugin]
id = "sample"
name = "Sample"
version = "1.0.0"
engine = "native"

[capabilities.file_parser]
file_types = ["epub"]

[capabilities.metadata_enricher]
fields = []
"#;

    fn engines() -> EngineSet {
        let native = NativeEngine::new()
            .register("parser", |_| {
                let mut exports = Exports::new();
                exports.insert(
                    "file_parser".to_string(),
                    FnHook::new(|input, _| async move { Ok(json!({"title": input["path"]})) }),
                );
                exports.insert(
                    "metadata_enricher".to_string(),
                    FnHook::new(|_, _| async { Ok(json!({})) }),
                );
                Ok(exports)
            })
            .register("sneaky", |_| {
                let mut exports = Exports::new();
                exports.insert(
                    "output_generator".to_string(),
                    FnHook::new(|_, _| async { Ok(Value::Null) }),
                );
                Ok(exports)
            })
            .register("slow", |_| {
                let mut exports = Exports::new();
                exports.insert(
                    "file_parser".to_string(),
                    FnHook::new(|_, _| async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(json!({}))
                    }),
                );
                Ok(exports)
            });

        let mut set = EngineSet::with_defaults();
        set.register(Arc::new(native));
        set
    }

    async fn load(code: &str, options: &RuntimeOptions) -> LoadResult<Runtime> {
        let key = PluginKey::global("sample");
        let validated = ManifestValidator::default().validate(MANIFEST.as_bytes()).unwrap();
        Runtime::new(
            key.clone(),
            validated,
            code.as_bytes(),
            &engines(),
            Arc::new(NoAccessHost::new(key)),
            options,
        )
        .await
    }

    #[tokio::test]
    async fn test_enricher_without_fields_is_disabled() {
        let runtime = load("parser", &RuntimeOptions::default()).await.unwrap();

        assert!(runtime.provides(HookType::FileParser));
        assert!(!runtime.provides(HookType::MetadataEnricher));
        assert!(runtime.warnings().contains(&LoadWarning::EnricherFieldsEmpty));

        let cx = CallContext::with_timeout(Duration::from_secs(5));
        let request = ParseRequest {
            path: "/books/dune.epub".into(),
            file_type: "epub".to_string(),
        };
        let output = runtime.parse(&request, &cx).await.unwrap();
        assert_eq!(output.get("title"), Some(&json!("/books/dune.epub")));

        let enrich = EnrichRequest {
            file_type: None,
            current: Default::default(),
        };
        assert_eq!(
            runtime.enrich(&enrich, &cx).await,
            Err(RuntimeError::NotExported(HookType::MetadataEnricher))
        );
    }

    #[tokio::test]
    async fn test_undeclared_export_strict_and_lenient() {
        assert_eq!(
            load("sneaky", &RuntimeOptions::default()).await.unwrap_err(),
            LoadError::UndeclaredExport("output_generator".to_string())
        );

        let lenient = RuntimeOptions {
            strict_exports: false,
            ..RuntimeOptions::default()
        };
        let runtime = load("sneaky", &lenient).await.unwrap();
        assert!(!runtime.provides(HookType::OutputGenerator));
        assert!(runtime
            .warnings()
            .contains(&LoadWarning::UndeclaredExportDropped("output_generator".to_string())));
        assert!(runtime
            .warnings()
            .contains(&LoadWarning::DeclaredHookNotExported(HookType::FileParser)));
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_calls() {
        let runtime = Arc::new(load("slow", &RuntimeOptions::default()).await.unwrap());

        let call = {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                let cx = CallContext::with_timeout(Duration::from_secs(5));
                runtime.invoke(HookType::FileParser, json!({}), &cx).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.in_flight(), 1);

        runtime.close().await;
        assert_eq!(runtime.in_flight(), 0);
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_timeout_flagging() {
        let runtime = load("parser", &RuntimeOptions::default()).await.unwrap();

        assert!(!runtime.record_timeout());
        runtime.record_success();
        assert!(!runtime.record_timeout());
        assert!(!runtime.record_timeout());
        assert!(runtime.record_timeout());
        assert!(runtime.is_flagged());
        assert!(!runtime.record_timeout());
    }
}
