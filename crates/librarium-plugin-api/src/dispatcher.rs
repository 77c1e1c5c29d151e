//! Hook dispatch.
//!
//! The [`HookDispatcher`] resolves the ordered runtimes for a hook type and
//! scope, then calls them one after another, each on a pooled worker under
//! its own deadline:
//!
//! - The deadline is the hook type's timeout, shortened by the parent's.
//! - A worker that misses its deadline is abandoned; its runtime is told to
//!   stop through the call's cancellation token and the chain moves on.
//! - Multi-producer hooks (`file_parser`, `metadata_enricher`) isolate every
//!   plugin failure and return what the others produced.
//! - Single-producer hooks (`input_converter`, `output_generator`) run the
//!   first plugin handling the file type; its failure fails the operation.
//!
//! Every pass gets a dispatch id and reports a [`PerPluginOutcome`] for each
//! resolved plugin.

use crate::error::{DispatchError, DispatchResult};
use crate::merge::{effective_field_settings, filter_enrichment, MetadataMerger};
use crate::order::{OrderResolver, ResolvedPlugin};
use crate::pool::WorkerPools;
use chrono::{DateTime, Utc};
use librarium_runtime::{
    normalize_file_type, BookMetadata, CallContext, ConvertRequest, EnrichRequest, GenerateRequest,
    HookType, IdentifierType, MetadataField, ParseRequest, PluginKey, Runtime, RuntimeError,
    RuntimeResult, Scope,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deadline per hook type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookTimeouts {
    pub input_converter: Duration,
    pub file_parser: Duration,
    pub output_generator: Duration,
    pub metadata_enricher: Duration,
}

impl Default for HookTimeouts {
    fn default() -> Self {
        Self {
            input_converter: HookType::InputConverter.default_timeout(),
            file_parser: HookType::FileParser.default_timeout(),
            output_generator: HookType::OutputGenerator.default_timeout(),
            metadata_enricher: HookType::MetadataEnricher.default_timeout(),
        }
    }
}

impl HookTimeouts {
    pub fn get(&self, hook: HookType) -> Duration {
        match hook {
            HookType::InputConverter => self.input_converter,
            HookType::FileParser => self.file_parser,
            HookType::OutputGenerator => self.output_generator,
            HookType::MetadataEnricher => self.metadata_enricher,
            HookType::IdentifierTypes => Duration::ZERO,
        }
    }
}

/// How one plugin fared in a dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
    TimedOut,
    /// Not called, or cut short: the parent operation was cancelled or ran
    /// out of time.
    Skipped,
    /// Not called: the plugin does not handle the file type.
    Unsupported,
}

/// Per-plugin record of a dispatch pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerPluginOutcome {
    pub plugin: PluginKey,
    pub hook: HookType,
    pub status: OutcomeStatus,
    pub error: Option<String>,

    /// Contract violations and other advisory notes from this call.
    pub warnings: Vec<String>,

    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
}

impl PerPluginOutcome {
    fn new(plugin: PluginKey, hook: HookType, status: OutcomeStatus) -> Self {
        Self {
            plugin,
            hook,
            status,
            error: None,
            warnings: Vec::new(),
            elapsed: Duration::ZERO,
            started_at: Utc::now(),
        }
    }
}

/// Result of a dispatch pass plus its per-plugin outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport<T> {
    pub dispatch_id: Uuid,
    pub hook: HookType,
    pub scope: Scope,
    pub result: T,
    pub outcomes: Vec<PerPluginOutcome>,
}

impl<T> DispatchReport<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DispatchReport<U> {
        DispatchReport {
            dispatch_id: self.dispatch_id,
            hook: self.hook,
            scope: self.scope,
            result: f(self.result),
            outcomes: self.outcomes,
        }
    }

    /// Outcomes with the given status.
    pub fn with_status(&self, status: OutcomeStatus) -> impl Iterator<Item = &PerPluginOutcome> {
        self.outcomes.iter().filter(move |o| o.status == status)
    }
}

/// Merged metadata from a multi-producer hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedMetadata {
    pub metadata: BookMetadata,
    /// Plugins that contributed to each field, in execution order.
    pub contributors: BTreeMap<MetadataField, Vec<PluginKey>>,
}

impl MergedMetadata {
    fn from_merger(merger: &MetadataMerger) -> Self {
        Self {
            metadata: merger.metadata().unwrap_or_else(|e| {
                warn!(error = %e, "Merged metadata failed to decode");
                BookMetadata::default()
            }),
            contributors: merger.contributors().clone(),
        }
    }
}

/// A file produced by a single-producer hook, moved into the caller's
/// output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducedFile {
    pub plugin: PluginKey,
    pub path: PathBuf,
    pub file_type: String,
    pub mime_type: Option<String>,
}

/// A request for any hook type.
#[derive(Debug, Clone, PartialEq)]
pub enum HookRequest {
    Convert { request: ConvertRequest, output_dir: PathBuf },
    Parse(ParseRequest),
    Generate { request: GenerateRequest, output_dir: PathBuf },
    Enrich(EnrichRequest),
    IdentifierTypes,
}

impl HookRequest {
    pub fn hook_type(&self) -> HookType {
        match self {
            HookRequest::Convert { .. } => HookType::InputConverter,
            HookRequest::Parse(_) => HookType::FileParser,
            HookRequest::Generate { .. } => HookType::OutputGenerator,
            HookRequest::Enrich(_) => HookType::MetadataEnricher,
            HookRequest::IdentifierTypes => HookType::IdentifierTypes,
        }
    }
}

/// The result of any hook type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum HookOutput {
    File(ProducedFile),
    Metadata(MergedMetadata),
    IdentifierTypes(BTreeSet<IdentifierType>),
}

struct Attempt<T> {
    outcome: PerPluginOutcome,
    result: RuntimeResult<T>,
    temp_dir: Option<TempDir>,
}

/// Orchestrates ordered, isolated hook calls.
#[derive(Debug, Clone)]
pub struct HookDispatcher {
    resolver: OrderResolver,
    pools: WorkerPools,
    timeouts: HookTimeouts,
    temp_root: Option<PathBuf>,
}

impl HookDispatcher {
    pub fn new(resolver: OrderResolver, pools: WorkerPools, timeouts: HookTimeouts) -> Self {
        Self {
            resolver,
            pools,
            timeouts,
            temp_root: None,
        }
    }

    /// Create per-call temp directories under `root` instead of the system
    /// temp directory.
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    pub fn resolver(&self) -> &OrderResolver {
        &self.resolver
    }

    pub fn timeouts(&self) -> &HookTimeouts {
        &self.timeouts
    }

    fn make_temp_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("librarium-call-");
        match &self.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }

    /// Call one plugin on a pooled worker under the hook's deadline.
    async fn attempt<T, F, Fut>(
        &self,
        dispatch_id: Uuid,
        plugin: &ResolvedPlugin,
        hook: HookType,
        parent: &CallContext,
        readable: Option<PathBuf>,
        call: F,
    ) -> Attempt<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Runtime>, CallContext) -> Fut,
        Fut: Future<Output = RuntimeResult<T>> + Send + 'static,
    {
        let key = plugin.key().clone();
        let mut outcome = PerPluginOutcome::new(key.clone(), hook, OutcomeStatus::Skipped);
        let started = Instant::now();

        let skipped = |outcome: PerPluginOutcome| Attempt {
            outcome,
            result: Err(RuntimeError::Cancelled),
            temp_dir: None,
        };

        if parent.is_done() {
            return skipped(outcome);
        }

        let permit = tokio::select! {
            permit = self.pools.acquire(hook) => permit,
            _ = parent.cancellation_token().cancelled() => None,
            _ = tokio::time::sleep_until(parent.deadline()) => None,
        };
        let Some(_permit) = permit else {
            return skipped(outcome);
        };

        let temp_dir = match self.make_temp_dir() {
            Ok(dir) => Some(dir),
            Err(e) => {
                outcome.status = OutcomeStatus::Failed;
                outcome.error = Some(format!("creating temp dir: {}", e));
                return Attempt {
                    outcome,
                    result: Err(RuntimeError::Io(e.to_string())),
                    temp_dir: None,
                };
            }
        };

        // Only a call stopped by its own hook budget counts against the
        // plugin; running into the parent's deadline is a cancellation.
        let budget_deadline = Instant::now() + self.timeouts.get(hook);
        let hook_bound = budget_deadline <= parent.deadline();
        let deadline = budget_deadline.min(parent.deadline());
        let child = parent.cancellation_token().child_token();
        let mut cx = CallContext::new(deadline, child.clone());
        if let Some(dir) = &temp_dir {
            cx = cx.with_temp_dir(dir.path());
        }
        if let Some(path) = readable {
            cx = cx.with_readable(path);
        }

        outcome.started_at = Utc::now();
        let mut task = tokio::spawn(call(plugin.runtime.clone(), cx));

        let result = tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) => Err(RuntimeError::Execution(format!("hook worker failed: {}", e))),
            },
            _ = tokio::time::sleep_until(deadline) => {
                // Abandon the worker; it stops once it observes the token.
                child.cancel();
                Err(RuntimeError::Timeout(deadline.saturating_duration_since(started)))
            }
            _ = parent.cancellation_token().cancelled() => Err(RuntimeError::Cancelled),
        };
        let result = match result {
            Err(e) if e.is_timeout() && !hook_bound => Err(RuntimeError::Cancelled),
            other => other,
        };
        outcome.elapsed = started.elapsed();

        match &result {
            Ok(_) => {
                plugin.runtime.record_success();
                outcome.status = OutcomeStatus::Success;
                debug!(
                    dispatch_id = %dispatch_id,
                    plugin = %key,
                    hook = %hook,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Hook call succeeded"
                );
            }
            Err(e) => {
                outcome.status = match e {
                    RuntimeError::Timeout(_) => {
                        plugin.runtime.record_timeout();
                        OutcomeStatus::TimedOut
                    }
                    RuntimeError::Cancelled if parent.is_done() => OutcomeStatus::Skipped,
                    _ => OutcomeStatus::Failed,
                };
                outcome.error = Some(e.to_string());
                warn!(
                    dispatch_id = %dispatch_id,
                    plugin = %key,
                    hook = %hook,
                    error = %e,
                    "Hook call failed"
                );
            }
        }

        Attempt {
            outcome,
            result,
            temp_dir,
        }
    }

    /// Run the first plugin handling `file_type` for a single-producer hook.
    async fn produce<T, F, Fut>(
        &self,
        hook: HookType,
        scope: Scope,
        file_type: &str,
        parent: &CallContext,
        readable: Option<PathBuf>,
        call: F,
    ) -> DispatchResult<(DispatchReport<()>, PluginKey, T, TempDir)>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Runtime>, CallContext) -> Fut,
        Fut: Future<Output = RuntimeResult<T>> + Send + 'static,
    {
        let dispatch_id = Uuid::new_v4();
        let resolution = self.resolver.resolve(hook, scope).await?;
        let mut report = DispatchReport {
            dispatch_id,
            hook,
            scope,
            result: (),
            outcomes: Vec::new(),
        };

        let Some(producer) = resolution
            .plugins
            .iter()
            .find(|p| p.runtime.supports_file_type(hook, file_type))
        else {
            return Err(DispatchError::NoProducer {
                hook,
                file_type: normalize_file_type(file_type),
            });
        };

        for plugin in resolution.plugins.iter().take_while(|p| p.key() != producer.key()) {
            report.outcomes.push(PerPluginOutcome::new(
                plugin.key().clone(),
                hook,
                OutcomeStatus::Unsupported,
            ));
        }

        info!(dispatch_id = %dispatch_id, hook = %hook, scope = %scope, plugin = %producer.key(), "Dispatching");
        let attempt = self
            .attempt(dispatch_id, producer, hook, parent, readable, call)
            .await;
        report.outcomes.push(attempt.outcome);

        match (attempt.result, attempt.temp_dir) {
            (Ok(value), Some(temp_dir)) => Ok((report, producer.key().clone(), value, temp_dir)),
            (Ok(_), None) => Err(DispatchError::Io("call produced no temp dir".to_string())),
            (Err(RuntimeError::Cancelled), _) if parent.is_done() => Err(DispatchError::Cancelled),
            (Err(source), _) => Err(DispatchError::Hook {
                plugin: producer.key().clone(),
                hook,
                source,
            }),
        }
    }

    /// Convert a file with the first converter handling its type. The
    /// converted file is moved into `output_dir`.
    pub async fn convert(
        &self,
        scope: Scope,
        request: ConvertRequest,
        output_dir: &Path,
        parent: &CallContext,
    ) -> DispatchResult<DispatchReport<ProducedFile>> {
        let source_type = request.source_type.clone();
        let readable = Some(request.source_path.clone());
        let (report, plugin, output, temp_dir) = self
            .produce(
                HookType::InputConverter,
                scope,
                &source_type,
                parent,
                readable,
                move |runtime, cx| async move { runtime.convert(&request, &cx).await },
            )
            .await?;

        let target_type = self
            .resolver
            .registry()
            .get(&plugin)
            .and_then(|r| {
                r.manifest()
                    .capabilities
                    .input_converter
                    .as_ref()
                    .map(|c| c.target_type.clone())
            })
            .unwrap_or_default();

        let path = relocate(temp_dir.path(), &output.file, output_dir)
            .await
            .map_err(|source| DispatchError::Hook {
                plugin: plugin.clone(),
                hook: HookType::InputConverter,
                source,
            })?;

        Ok(report.map(|()| ProducedFile {
            plugin,
            path,
            file_type: target_type,
            mime_type: None,
        }))
    }

    /// Generate an output file with the first generator handling the target
    /// type. The generated file is moved into `output_dir`.
    pub async fn generate(
        &self,
        scope: Scope,
        request: GenerateRequest,
        output_dir: &Path,
        parent: &CallContext,
    ) -> DispatchResult<DispatchReport<ProducedFile>> {
        let target_type = normalize_file_type(&request.target_type);
        let readable = request.source_path.clone();
        let (report, plugin, output, temp_dir) = self
            .produce(
                HookType::OutputGenerator,
                scope,
                &target_type,
                parent,
                readable,
                move |runtime, cx| async move { runtime.generate(&request, &cx).await },
            )
            .await?;

        let path = relocate(temp_dir.path(), &output.file, output_dir)
            .await
            .map_err(|source| DispatchError::Hook {
                plugin: plugin.clone(),
                hook: HookType::OutputGenerator,
                source,
            })?;

        Ok(report.map(|()| ProducedFile {
            plugin,
            path,
            file_type: target_type,
            mime_type: output.mime_type,
        }))
    }

    /// Parse a file with every parser handling its type, merging the results.
    pub async fn parse(
        &self,
        scope: Scope,
        request: ParseRequest,
        parent: &CallContext,
    ) -> DispatchResult<DispatchReport<MergedMetadata>> {
        let hook = HookType::FileParser;
        let dispatch_id = Uuid::new_v4();
        let resolution = self.resolver.resolve(hook, scope).await?;
        let mut merger = MetadataMerger::new();
        let mut outcomes = Vec::new();

        for plugin in &resolution.plugins {
            if !plugin.runtime.supports_file_type(hook, &request.file_type) {
                outcomes.push(PerPluginOutcome::new(plugin.key().clone(), hook, OutcomeStatus::Unsupported));
                continue;
            }

            let input = request.clone();
            let attempt = self
                .attempt(
                    dispatch_id,
                    plugin,
                    hook,
                    parent,
                    Some(request.path.clone()),
                    move |runtime, cx| async move { runtime.parse(&input, &cx).await },
                )
                .await;
            let mut outcome = attempt.outcome;

            if let Ok(raw) = attempt.result {
                match BookMetadata::from_object(raw.clone()) {
                    Ok(_) => {
                        merger.merge(plugin.key(), &raw);
                    }
                    Err(e) => reject_output(dispatch_id, &mut outcome, e),
                }
            }
            outcomes.push(outcome);
        }

        info!(
            dispatch_id = %dispatch_id,
            hook = %hook,
            scope = %scope,
            plugins = outcomes.len(),
            "Parse dispatch finished"
        );

        Ok(DispatchReport {
            dispatch_id,
            hook,
            scope,
            result: MergedMetadata::from_merger(&merger),
            outcomes,
        })
    }

    /// Run the enricher chain. Each enricher sees the caller's metadata with
    /// the contributions of earlier enrichers applied; its output is
    /// filtered against its declared and enabled fields before merging.
    pub async fn enrich(
        &self,
        scope: Scope,
        request: EnrichRequest,
        parent: &CallContext,
    ) -> DispatchResult<DispatchReport<MergedMetadata>> {
        let hook = HookType::MetadataEnricher;
        let dispatch_id = Uuid::new_v4();
        let resolution = self.resolver.resolve(hook, scope).await?;
        let mut merger = MetadataMerger::new();
        let mut outcomes = Vec::new();

        for plugin in &resolution.plugins {
            let supported = request
                .file_type
                .as_deref()
                .map_or(true, |t| plugin.runtime.supports_file_type(hook, t));
            if !supported {
                outcomes.push(PerPluginOutcome::new(plugin.key().clone(), hook, OutcomeStatus::Unsupported));
                continue;
            }

            let enabled =
                effective_field_settings(&**self.resolver.config(), scope, plugin.key()).await?;
            let declared = plugin.runtime.manifest().enricher_fields();

            let current = merger.view(&request.current).unwrap_or_else(|e| {
                warn!(dispatch_id = %dispatch_id, error = %e, "Could not apply merged metadata");
                request.current.clone()
            });
            let input = EnrichRequest {
                file_type: request.file_type.clone(),
                current,
            };

            let attempt = self
                .attempt(
                    dispatch_id,
                    plugin,
                    hook,
                    parent,
                    None,
                    move |runtime, cx| async move { runtime.enrich(&input, &cx).await },
                )
                .await;
            let mut outcome = attempt.outcome;

            if let Ok(raw) = attempt.result {
                let filtered = filter_enrichment(plugin.key(), &declared, &enabled, raw);
                outcome.warnings = filtered.violations.iter().map(|v| v.to_string()).collect();

                match BookMetadata::from_object(filtered.fields.clone()) {
                    Ok(_) => {
                        merger.merge(plugin.key(), &filtered.fields);
                    }
                    Err(e) => reject_output(dispatch_id, &mut outcome, e),
                }
            }
            outcomes.push(outcome);
        }

        info!(
            dispatch_id = %dispatch_id,
            hook = %hook,
            scope = %scope,
            plugins = outcomes.len(),
            failed = outcomes
                .iter()
                .filter(|o| matches!(o.status, OutcomeStatus::Failed | OutcomeStatus::TimedOut))
                .count(),
            "Enrichment dispatch finished"
        );

        Ok(DispatchReport {
            dispatch_id,
            hook,
            scope,
            result: MergedMetadata::from_merger(&merger),
            outcomes,
        })
    }

    /// Identifier types offered to `scope`. Declarations only; no plugin
    /// code runs.
    pub async fn identifier_types(&self, scope: Scope) -> DispatchResult<DispatchReport<BTreeSet<IdentifierType>>> {
        let hook = HookType::IdentifierTypes;
        let resolution = self.resolver.resolve(hook, scope).await?;

        let mut types = BTreeSet::new();
        let mut outcomes = Vec::new();
        for plugin in &resolution.plugins {
            types.extend(plugin.runtime.manifest().capabilities.identifier_types.iter().copied());
            outcomes.push(PerPluginOutcome::new(plugin.key().clone(), hook, OutcomeStatus::Success));
        }

        Ok(DispatchReport {
            dispatch_id: Uuid::new_v4(),
            hook,
            scope,
            result: types,
            outcomes,
        })
    }

    /// Dispatch any hook request.
    pub async fn run(
        &self,
        scope: Scope,
        request: HookRequest,
        parent: &CallContext,
    ) -> DispatchResult<DispatchReport<HookOutput>> {
        match request {
            HookRequest::Convert { request, output_dir } => Ok(self
                .convert(scope, request, &output_dir, parent)
                .await?
                .map(HookOutput::File)),
            HookRequest::Parse(request) => Ok(self
                .parse(scope, request, parent)
                .await?
                .map(HookOutput::Metadata)),
            HookRequest::Generate { request, output_dir } => Ok(self
                .generate(scope, request, &output_dir, parent)
                .await?
                .map(HookOutput::File)),
            HookRequest::Enrich(request) => Ok(self
                .enrich(scope, request, parent)
                .await?
                .map(HookOutput::Metadata)),
            HookRequest::IdentifierTypes => Ok(self
                .identifier_types(scope)
                .await?
                .map(HookOutput::IdentifierTypes)),
        }
    }
}

fn reject_output(dispatch_id: Uuid, outcome: &mut PerPluginOutcome, err: serde_json::Error) {
    let err = RuntimeError::InvalidOutput(err.to_string());
    warn!(
        dispatch_id = %dispatch_id,
        plugin = %outcome.plugin,
        hook = %outcome.hook,
        error = %err,
        "Discarding plugin output"
    );
    outcome.status = OutcomeStatus::Failed;
    outcome.error = Some(err.to_string());
}

/// Move a hook's output file out of the call's temp directory.
async fn relocate(temp_dir: &Path, file: &Path, output_dir: &Path) -> RuntimeResult<PathBuf> {
    let relative = file.strip_prefix(temp_dir).unwrap_or(file);
    if relative.as_os_str().is_empty()
        || !relative.components().all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(RuntimeError::InvalidOutput(format!(
            "output file {:?} is not inside the call's temp directory",
            file
        )));
    }

    let source = temp_dir.join(relative);
    let is_file = tokio::fs::metadata(&source)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(RuntimeError::InvalidOutput(format!(
            "output file {:?} does not exist",
            relative
        )));
    }

    let Some(name) = relative.file_name() else {
        return Err(RuntimeError::InvalidOutput(format!("output file {:?} has no name", relative)));
    };
    tokio::fs::create_dir_all(output_dir).await?;
    let target = output_dir.join(name);

    if tokio::fs::rename(&source, &target).await.is_err() {
        // Different filesystem: copy instead.
        tokio::fs::copy(&source, &target).await?;
    }
    Ok(target)
}
