//! Plugin registry with hot-reload.
//!
//! The registry maps `(scope, id)` to the active [`Runtime`] of each loaded
//! plugin. The map is an immutable [`Snapshot`] behind a pointer that writers
//! replace wholesale:
//!
//! - Readers clone the current `Arc<Snapshot>` and drop the lock at once;
//!   no lock is held while plugin code runs.
//! - Writers are serialized, build a new snapshot and swap it in with one
//!   store, so readers never observe a half-updated entry.
//! - A replaced runtime is drained (bounded by the drain timeout) after the
//!   swap, outside every lock.

use chrono::{DateTime, Utc};
use librarium_runtime::{LoadError, LoadResult, LoadWarning, PluginKey, Runtime, Scope};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Load state of an installed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Loaded,
    Disabled,
    Error,
}

/// Administrative view of one plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginStatus {
    pub key: PluginKey,
    pub state: PluginState,

    /// Version of the serving runtime, if any.
    pub version: Option<String>,

    pub warnings: Vec<LoadWarning>,

    /// Most recent load failure. Set while an older version keeps serving.
    pub last_error: Option<String>,

    /// Repeated timeouts flagged the serving runtime.
    pub flagged: bool,

    pub updated_at: DateTime<Utc>,
}

impl PluginStatus {
    fn new(key: PluginKey, state: PluginState) -> Self {
        Self {
            key,
            state,
            version: None,
            warnings: Vec::new(),
            last_error: None,
            flagged: false,
            updated_at: Utc::now(),
        }
    }
}

/// An immutable view of the loaded runtimes.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    runtimes: HashMap<PluginKey, Arc<Runtime>>,
}

impl Snapshot {
    pub fn get(&self, key: &PluginKey) -> Option<&Arc<Runtime>> {
        self.runtimes.get(key)
    }

    pub fn contains(&self, key: &PluginKey) -> bool {
        self.runtimes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PluginKey, &Arc<Runtime>)> {
        self.runtimes.iter()
    }
}

/// Why a runtime is being taken out of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Still installed; status becomes `Disabled`.
    Disabled,
    /// Gone; the status entry is removed.
    Uninstalled,
}

/// Registry of active plugin runtimes.
pub struct PluginRegistry {
    current: RwLock<Arc<Snapshot>>,
    statuses: RwLock<BTreeMap<PluginKey, PluginStatus>>,

    /// Bumped by every removal. A reload that started under an older
    /// generation must not publish.
    generations: RwLock<HashMap<PluginKey, u64>>,

    writer: Mutex<()>,
    drain_timeout: Duration,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("loaded", &self.snapshot().len())
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

impl PluginRegistry {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            statuses: RwLock::new(BTreeMap::new()),
            generations: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
            drain_timeout,
        }
    }

    /// The current snapshot. Cheap; holds no lock after returning.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, key: &PluginKey) -> Option<Arc<Runtime>> {
        self.snapshot().get(key).cloned()
    }

    /// Apply `change` to a copy of the current map and publish it. Returns
    /// the runtime previously stored under `key`. Callers hold the writer lock.
    fn swap(&self, key: &PluginKey, replacement: Option<Arc<Runtime>>) -> Option<Arc<Runtime>> {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut runtimes = current.runtimes.clone();
        let previous = match replacement {
            Some(runtime) => runtimes.insert(key.clone(), runtime),
            None => runtimes.remove(key),
        };
        *current = Arc::new(Snapshot { runtimes });
        previous
    }

    fn update_status(&self, key: &PluginKey, update: impl FnOnce(&mut PluginStatus)) {
        let mut statuses = self
            .statuses
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let status = statuses
            .entry(key.clone())
            .or_insert_with(|| PluginStatus::new(key.clone(), PluginState::Error));
        update(status);
        status.updated_at = Utc::now();
    }

    /// Wait for a retired runtime's in-flight calls, bounded by the drain
    /// timeout.
    async fn drain(&self, retired: Arc<Runtime>) {
        let key = retired.key().clone();
        let version = retired.version().to_string();
        match tokio::time::timeout(self.drain_timeout, retired.close()).await {
            Ok(()) => info!(plugin = %key, version = %version, "Retired runtime drained"),
            Err(_) => warn!(
                plugin = %key,
                version = %version,
                in_flight = retired.in_flight(),
                "Drain timed out; abandoning in-flight calls"
            ),
        }
    }

    fn generation(&self, key: &PluginKey) -> u64 {
        self.generations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Callers hold the writer lock.
    fn bump_generation(&self, key: &PluginKey) {
        *self
            .generations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key.clone())
            .or_insert(0) += 1;
    }

    /// Swap `runtime` in and mark it loaded. Callers hold the writer lock.
    fn install(&self, runtime: &Arc<Runtime>) -> Option<Arc<Runtime>> {
        let key = runtime.key();
        let previous = self.swap(key, Some(runtime.clone()));
        self.update_status(key, |status| {
            status.state = PluginState::Loaded;
            status.version = Some(runtime.version().to_string());
            status.warnings = runtime.warnings().to_vec();
            status.last_error = None;
            status.flagged = false;
        });
        previous
    }

    async fn retire(&self, runtime: &Runtime, previous: Option<Arc<Runtime>>) {
        let key = runtime.key();
        match previous {
            Some(old) => {
                info!(
                    plugin = %key,
                    from = %old.version(),
                    to = %runtime.version(),
                    "Runtime swapped"
                );
                self.drain(old).await;
            }
            None => info!(plugin = %key, version = %runtime.version(), "Runtime published"),
        }
    }

    /// Publish a runtime under its key, replacing and draining any previous
    /// version.
    pub async fn publish(&self, runtime: Runtime) -> Arc<Runtime> {
        let runtime = Arc::new(runtime);
        let previous = {
            let _writer = self.writer.lock().await;
            self.install(&runtime)
        };
        self.retire(&runtime, previous).await;
        runtime
    }

    /// Hot-reload protocol: build the new runtime while the current one keeps
    /// serving, swap on success, drain the old one. On failure nothing is
    /// swapped and the failure is recorded.
    ///
    /// A removal that lands while the build is in progress wins: the new
    /// runtime is discarded and [`LoadError::Superseded`] returned.
    pub async fn reload<F>(&self, key: &PluginKey, build: F) -> LoadResult<Arc<Runtime>>
    where
        F: Future<Output = LoadResult<Runtime>>,
    {
        let generation = self.generation(key);
        match build.await {
            Ok(runtime) if runtime.key() == key => {
                let runtime = Arc::new(runtime);
                let previous = {
                    let _writer = self.writer.lock().await;
                    if self.generation(key) != generation {
                        info!(
                            plugin = %key,
                            version = %runtime.version(),
                            "Plugin removed while loading; discarding runtime"
                        );
                        return Err(LoadError::Superseded);
                    }
                    self.install(&runtime)
                };
                self.retire(&runtime, previous).await;
                Ok(runtime)
            }
            Ok(runtime) => {
                let err = LoadError::ExecutionInit(format!(
                    "built runtime for {} while reloading {}",
                    runtime.key(),
                    key
                ));
                self.record_failure(key, &err);
                Err(err)
            }
            Err(err) => {
                self.record_failure(key, &err);
                Err(err)
            }
        }
    }

    /// Record a load failure. A serving runtime stays loaded.
    pub fn record_failure(&self, key: &PluginKey, err: &LoadError) {
        let serving = self.get(key);
        match &serving {
            Some(runtime) => error!(
                plugin = %key,
                serving = %runtime.version(),
                error = %err,
                "Reload failed; keeping current version"
            ),
            None => error!(plugin = %key, error = %err, "Plugin failed to load"),
        }

        self.update_status(key, |status| {
            status.last_error = Some(err.to_string());
            if serving.is_none() {
                status.state = PluginState::Error;
                status.version = None;
            }
        });
    }

    /// Record an installed plugin that is disabled and therefore not loaded.
    pub fn mark_disabled(&self, key: &PluginKey) {
        self.update_status(key, |status| {
            status.state = PluginState::Disabled;
            status.version = None;
        });
    }

    /// Take a runtime out of service and drain it.
    pub async fn remove(&self, key: &PluginKey, removal: Removal) -> bool {
        let previous = {
            let _writer = self.writer.lock().await;
            self.bump_generation(key);
            let previous = self.swap(key, None);
            match removal {
                Removal::Disabled => self.mark_disabled(key),
                Removal::Uninstalled => {
                    self.statuses
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .remove(key);
                }
            }
            previous
        };

        match previous {
            Some(old) => {
                info!(plugin = %key, ?removal, "Runtime removed");
                self.drain(old).await;
                true
            }
            None => false,
        }
    }

    /// Remove every runtime and drain them all. Used at shutdown.
    pub async fn drain_all(&self) {
        let retired = {
            let _writer = self.writer.lock().await;
            let keys: Vec<PluginKey> = self
                .statuses
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .keys()
                .cloned()
                .collect();
            for key in &keys {
                self.bump_generation(key);
            }
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *current)
        };

        let drains = retired
            .runtimes
            .values()
            .cloned()
            .map(|runtime| self.drain(runtime));
        for drain in drains {
            drain.await;
        }
    }

    pub fn status(&self, key: &PluginKey) -> Option<PluginStatus> {
        let mut status = self
            .statuses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()?;
        status.flagged = self.get(key).is_some_and(|r| r.is_flagged());
        Some(status)
    }

    /// Status of every known plugin, flagged state taken from the live runtime.
    pub fn statuses(&self) -> Vec<PluginStatus> {
        let snapshot = self.snapshot();
        self.statuses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .map(|mut status| {
                status.flagged = snapshot.get(&status.key).is_some_and(|r| r.is_flagged());
                status
            })
            .collect()
    }

    /// Every known plugin installed under `scope`.
    pub fn keys_in_scope(&self, scope: Scope) -> Vec<PluginKey> {
        self.statuses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .filter(|key| key.scope == scope)
            .cloned()
            .collect()
    }
}
