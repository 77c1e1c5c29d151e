//! Execution engines.
//!
//! An [`Engine`] turns a plugin's code into a table of hook implementations.
//! Two engines ship with the runtime:
//!
//! - [`BytecodeEngine`]: sandboxed bytecode evaluated by [`crate::vm`].
//! - [`NativeEngine`]: in-process factories registered by name, for built-in
//!   plugins and tests.

use crate::bytecode::BytecodeLoader;
use crate::context::CallContext;
use crate::error::{LoadError, LoadResult, RuntimeError, RuntimeResult};
use crate::host::HostApi;
use crate::manifest::PluginManifest;
use crate::vm::{Module, VmLimits};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

/// A single exported hook implementation.
#[async_trait]
pub trait HookFn: Send + Sync {
    async fn call(&self, input: Value, cx: &CallContext) -> RuntimeResult<Value>;
}

/// Exported hooks, keyed by the name the plugin exported them under.
pub type Exports = BTreeMap<String, Arc<dyn HookFn>>;

/// Instantiates plugin code.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Name used by manifests to select this engine.
    fn name(&self) -> &str;

    /// Evaluate the plugin's entry code once and return its exports.
    async fn instantiate(
        &self,
        manifest: &PluginManifest,
        code: &[u8],
        host: Arc<dyn HostApi>,
        cx: &CallContext,
    ) -> LoadResult<Exports>;
}

/// Engines available to the host, keyed by name.
#[derive(Clone, Default)]
pub struct EngineSet {
    engines: HashMap<String, Arc<dyn Engine>>,
}

impl EngineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine set containing the bytecode engine with default limits.
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(BytecodeEngine::default()));
        set
    }

    /// Register an engine, replacing any engine with the same name.
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn get(&self, name: &str) -> LoadResult<Arc<dyn Engine>> {
        self.engines
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::UnknownEngine(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.engines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Engine for compiled bytecode modules.
#[derive(Debug, Clone, Default)]
pub struct BytecodeEngine {
    limits: VmLimits,
}

impl BytecodeEngine {
    pub fn new(limits: VmLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl Engine for BytecodeEngine {
    fn name(&self) -> &str {
        "bytecode"
    }

    async fn instantiate(
        &self,
        manifest: &PluginManifest,
        code: &[u8],
        host: Arc<dyn HostApi>,
        cx: &CallContext,
    ) -> LoadResult<Exports> {
        let bytecode = BytecodeLoader::parse(code)?;
        let entry = manifest
            .plugin
            .entry_point
            .clone()
            .unwrap_or_else(|| bytecode.entry_point.clone());
        BytecodeLoader::validate(&bytecode, Some(&entry), &self.limits)?;

        let mut module = Module::new(bytecode);
        let (table, globals) = cx
            .run(module.call(&entry, Vec::new(), host.as_ref(), cx, &self.limits))
            .await
            .map_err(|e| LoadError::ExecutionInit(e.to_string()))?;
        module.set_globals(globals);
        let module = Arc::new(module);

        let table = match table {
            Value::Object(table) => table,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(LoadError::ExecutionInit(format!(
                    "entry point must return an export table, got {}",
                    other
                )))
            }
        };

        let mut exports = Exports::new();
        for (name, target) in table {
            let function = match target {
                Value::String(function) => function,
                other => {
                    return Err(LoadError::ExecutionInit(format!(
                        "export '{}' must name a function, got {}",
                        name, other
                    )))
                }
            };

            match module.arity(&function) {
                Some(arity) if arity <= 1 => {}
                Some(arity) => {
                    return Err(LoadError::ExecutionInit(format!(
                        "export '{}' function '{}' takes {} parameters, expected at most 1",
                        name, function, arity
                    )))
                }
                None => {
                    return Err(LoadError::ExecutionInit(format!(
                        "export '{}' names missing function '{}'",
                        name, function
                    )))
                }
            }

            exports.insert(
                name,
                Arc::new(BytecodeHook {
                    module: module.clone(),
                    function,
                    host: host.clone(),
                    limits: self.limits.clone(),
                }),
            );
        }

        Ok(exports)
    }
}

struct BytecodeHook {
    module: Arc<Module>,
    function: String,
    host: Arc<dyn HostApi>,
    limits: VmLimits,
}

#[async_trait]
impl HookFn for BytecodeHook {
    async fn call(&self, input: Value, cx: &CallContext) -> RuntimeResult<Value> {
        let args = match self.module.arity(&self.function) {
            Some(0) => Vec::new(),
            _ => vec![input],
        };

        let (value, _) = cx
            .run(
                self.module
                    .call(&self.function, args, self.host.as_ref(), cx, &self.limits),
            )
            .await?;
        Ok(value)
    }
}

/// Factory producing the exports of a native plugin.
pub type NativeFactory = Arc<dyn Fn(Arc<dyn HostApi>) -> LoadResult<Exports> + Send + Sync>;

/// Engine for plugins compiled into the host. The plugin code is the name
/// of a registered factory.
#[derive(Clone, Default)]
pub struct NativeEngine {
    factories: HashMap<String, NativeFactory>,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`.
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Arc<dyn HostApi>) -> LoadResult<Exports> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }
}

#[async_trait]
impl Engine for NativeEngine {
    fn name(&self) -> &str {
        "native"
    }

    async fn instantiate(
        &self,
        _manifest: &PluginManifest,
        code: &[u8],
        host: Arc<dyn HostApi>,
        cx: &CallContext,
    ) -> LoadResult<Exports> {
        cx.check()
            .map_err(|e| LoadError::ExecutionInit(e.to_string()))?;

        let name = std::str::from_utf8(code)
            .map_err(|e| LoadError::ExecutionInit(format!("invalid factory name: {}", e)))?
            .trim();

        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| LoadError::EntryPointMissing(name.to_string()))?;

        factory(host)
    }
}

/// Adapts an async closure into a [`HookFn`].
pub struct FnHook<F> {
    f: F,
}

impl<F, Fut> FnHook<F>
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RuntimeResult<Value>> + Send + 'static,
{
    pub fn new(f: F) -> Arc<dyn HookFn> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F, Fut> HookFn for FnHook<F>
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RuntimeResult<Value>> + Send + 'static,
{
    async fn call(&self, input: Value, cx: &CallContext) -> RuntimeResult<Value> {
        (self.f)(input, cx.clone()).await
    }
}

/// Convenience for native plugins: a hook that always fails.
pub fn failing_hook(message: impl Into<String>) -> Arc<dyn HookFn> {
    let message = message.into();
    FnHook::new(move |_, _| {
        let message = message.clone();
        async move { Err(RuntimeError::Execution(message)) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Bytecode, BytecodeMetadata, Constant, Function, Instruction};
    use crate::host::NoAccessHost;
    use crate::manifest::ManifestValidator;
    use crate::scope::PluginKey;
    use serde_json::json;
    use std::time::Duration;

    fn manifest() -> PluginManifest {
        ManifestValidator::default()
            .validate(
                br#"
manifest_version = 1

[plugin]
id = "echo"
name = "Echo"
version = "0.1.0"

[capabilities.file_parser]
file_types = ["epub"]
"#,
            )
            .unwrap()
            .manifest
    }

    fn host() -> Arc<dyn HostApi> {
        Arc::new(NoAccessHost::new(PluginKey::global("echo")))
    }

    fn echo_module(export_target: &str) -> Vec<u8> {
        let bytecode = Bytecode {
            version: 1,
            metadata: BytecodeMetadata {
                plugin_id: "echo".to_string(),
                plugin_version: "0.1.0".to_string(),
                compiled_at: None,
                compiler_version: None,
            },
            constants: vec![
                Constant::String("file_parser".to_string()),
                Constant::String(export_target.to_string()),
            ],
            functions: vec![
                Function {
                    name: "main".to_string(),
                    params: vec![],
                    instructions: vec![
                        Instruction::LoadConst { index: 0 },
                        Instruction::LoadConst { index: 1 },
                        Instruction::MakeObject { count: 1 },
                        Instruction::Return,
                    ],
                    local_count: 0,
                },
                Function {
                    name: "parse".to_string(),
                    params: vec!["request".to_string()],
                    instructions: vec![Instruction::LoadLocal { index: 0 }, Instruction::Return],
                    local_count: 1,
                },
            ],
            entry_point: "main".to_string(),
        };
        serde_json::to_vec(&bytecode).unwrap()
    }

    #[tokio::test]
    async fn test_bytecode_engine_exports() {
        let cx = CallContext::with_timeout(Duration::from_secs(5));
        let exports = BytecodeEngine::default()
            .instantiate(&manifest(), &echo_module("parse"), host(), &cx)
            .await
            .unwrap();

        let hook = exports.get("file_parser").unwrap();
        let output = hook.call(json!({"title": "Dune"}), &cx).await.unwrap();
        assert_eq!(output, json!({"title": "Dune"}));
    }

    #[tokio::test]
    async fn test_bytecode_export_missing_function() {
        let cx = CallContext::with_timeout(Duration::from_secs(5));
        let result = BytecodeEngine::default()
            .instantiate(&manifest(), &echo_module("nope"), host(), &cx)
            .await;
        assert!(matches!(result, Err(LoadError::ExecutionInit(_))));
    }

    #[tokio::test]
    async fn test_native_engine_unknown_factory() {
        let cx = CallContext::with_timeout(Duration::from_secs(5));
        let engine = NativeEngine::new().register("known", |_| Ok(Exports::new()));

        assert!(engine
            .instantiate(&manifest(), b"known", host(), &cx)
            .await
            .is_ok());
        assert!(matches!(
            engine.instantiate(&manifest(), b"unknown", host(), &cx).await,
            Err(LoadError::EntryPointMissing(_))
        ));
    }

    #[test]
    fn test_engine_set_lookup() {
        let mut set = EngineSet::with_defaults();
        set.register(Arc::new(NativeEngine::new()));
        assert_eq!(set.names(), vec!["bytecode", "native"]);
        assert!(matches!(set.get("wasm"), Err(LoadError::UnknownEngine(_))));
    }
}
