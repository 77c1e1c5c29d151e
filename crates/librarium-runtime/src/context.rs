//! Per-call execution context.
//!
//! Every hook call carries a deadline and a cancellation token. Plugin code
//! and host functions are expected to observe both; cancellation is
//! cooperative and never tears down the runtime itself.

use crate::error::{RuntimeError, RuntimeResult};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Context handed to a hook implementation for the duration of one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    budget: Duration,
    cancel: CancellationToken,
    temp_dir: Option<PathBuf>,
    readable: Vec<PathBuf>,
}

impl CallContext {
    /// Create a context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(Instant::now() + timeout, CancellationToken::new())
    }

    /// Create a context with an explicit deadline and token.
    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            deadline,
            budget: deadline.saturating_duration_since(Instant::now()),
            cancel,
            temp_dir: None,
            readable: Vec::new(),
        }
    }

    /// Attach the per-call temporary directory.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Grant read access to one extra path (typically the call's input file).
    pub fn with_readable(mut self, path: impl Into<PathBuf>) -> Self {
        self.readable.push(path.into());
        self
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_deref()
    }

    pub fn readable_paths(&self) -> &[PathBuf] {
        &self.readable
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the call should stop: cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Return the appropriate error if the call should stop.
    pub fn check(&self) -> RuntimeResult<()> {
        if self.cancel.is_cancelled() {
            Err(RuntimeError::Cancelled)
        } else if Instant::now() >= self.deadline {
            Err(RuntimeError::Timeout(self.budget))
        } else {
            Ok(())
        }
    }

    /// Run a future until it completes, the deadline passes or the call is
    /// cancelled, whichever comes first.
    pub async fn run<F, T>(&self, fut: F) -> RuntimeResult<T>
    where
        F: Future<Output = RuntimeResult<T>>,
    {
        self.check()?;
        tokio::select! {
            result = fut => result,
            _ = self.cancel.cancelled() => Err(RuntimeError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(RuntimeError::Timeout(self.budget)),
        }
    }
}
