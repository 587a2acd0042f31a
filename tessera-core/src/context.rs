//! Per-operation context threaded through diff and merge calls
//!
//! Carries cooperative cancellation and operation counters, so callers
//! (and tests) observe what an operation did without any global state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Cooperative cancellation flag, cheap to clone and share across workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` once cancellation has been requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Counters collected while an operation runs
#[derive(Debug, Default)]
pub struct OpStats {
    files_diffed: AtomicU64,
    files_merged: AtomicU64,
    conflicts: AtomicU64,
    auto_resolved: AtomicU64,
}

/// Plain snapshot of [`OpStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStatsSnapshot {
    pub files_diffed: u64,
    pub files_merged: u64,
    pub conflicts: u64,
    pub auto_resolved: u64,
}

impl OpStats {
    pub fn record_diff(&self) {
        self.files_diffed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge(&self) {
        self.files_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auto_resolved(&self) {
        self.auto_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OpStatsSnapshot {
        OpStatsSnapshot {
            files_diffed: self.files_diffed.load(Ordering::Relaxed),
            files_merged: self.files_merged.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            auto_resolved: self.auto_resolved.load(Ordering::Relaxed),
        }
    }
}

/// Execution context for one diff or merge invocation
#[derive(Debug, Default)]
pub struct OpContext {
    pub cancel: CancelToken,
    pub stats: OpStats,
    /// Upper bound on worker threads; 0 means available parallelism
    pub max_workers: usize,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workers(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Self::default()
        }
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Worker count for `units` independent jobs
    pub fn worker_count(&self, units: usize) -> usize {
        let limit = if self.max_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.max_workers
        };
        limit.min(units).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_worker_count_bounds() {
        let ctx = OpContext::with_max_workers(4);
        assert_eq!(ctx.worker_count(2), 2);
        assert_eq!(ctx.worker_count(10), 4);
        assert_eq!(ctx.worker_count(0), 1);
    }

    #[test]
    fn test_stats_snapshot() {
        let ctx = OpContext::new();
        ctx.stats.record_merge();
        ctx.stats.record_merge();
        ctx.stats.record_conflict();
        let snap = ctx.stats.snapshot();
        assert_eq!(snap.files_merged, 2);
        assert_eq!(snap.conflicts, 1);
        assert_eq!(snap.auto_resolved, 0);
    }
}
