//! Per-hook-type worker pools.
//!
//! Each hook type has its own bound on concurrently executing plugin calls.
//! The dispatcher holds the permit, not the worker task: when a call times
//! out the worker is abandoned and the slot is released at once.

use librarium_runtime::HookType;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pool sizes per hook type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSizes {
    pub input_converter: usize,
    pub file_parser: usize,
    pub output_generator: usize,
    pub metadata_enricher: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            input_converter: 2,
            file_parser: 4,
            output_generator: 2,
            metadata_enricher: 8,
        }
    }
}

impl PoolSizes {
    pub fn get(&self, hook: HookType) -> usize {
        match hook {
            HookType::InputConverter => self.input_converter,
            HookType::FileParser => self.file_parser,
            HookType::OutputGenerator => self.output_generator,
            HookType::MetadataEnricher => self.metadata_enricher,
            // Declaration-only; no plugin code runs.
            HookType::IdentifierTypes => 0,
        }
    }
}

/// Semaphores bounding plugin execution per hook type.
#[derive(Debug, Clone)]
pub struct WorkerPools {
    sizes: PoolSizes,
    semaphores: HashMap<HookType, Arc<Semaphore>>,
}

impl WorkerPools {
    pub fn new(sizes: PoolSizes) -> Self {
        let semaphores = HookType::ALL
            .into_iter()
            .filter(|hook| hook.is_callable())
            .map(|hook| (hook, Arc::new(Semaphore::new(sizes.get(hook).max(1)))))
            .collect();
        Self { sizes, semaphores }
    }

    pub fn sizes(&self) -> &PoolSizes {
        &self.sizes
    }

    /// Wait for a free worker slot. `None` for hook types that never run code
    /// or when the pool was closed.
    pub async fn acquire(&self, hook: HookType) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.semaphores.get(&hook)?.clone();
        semaphore.acquire_owned().await.ok()
    }

    /// Free slots for a hook type.
    pub fn available(&self, hook: HookType) -> usize {
        self.semaphores
            .get(&hook)
            .map(|s| s.available_permits())
            .unwrap_or(0)
    }
}

impl Default for WorkerPools {
    fn default() -> Self {
        Self::new(PoolSizes::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pools_are_independent() {
        let pools = WorkerPools::new(PoolSizes {
            file_parser: 1,
            ..PoolSizes::default()
        });

        let held = pools.acquire(HookType::FileParser).await.unwrap();
        assert_eq!(pools.available(HookType::FileParser), 0);
        assert_eq!(pools.available(HookType::MetadataEnricher), 8);
        assert!(pools.acquire(HookType::MetadataEnricher).await.is_some());

        drop(held);
        assert_eq!(pools.available(HookType::FileParser), 1);
        assert!(pools.acquire(HookType::IdentifierTypes).await.is_none());
    }
}
