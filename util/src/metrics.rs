use std::time::Instant;

/// Logs a `tracing` warning if the guarded scope runs longer than expected.
/// Mirrors the teacher's `td::PerfWarningTimer` usage in `CheckProof`.
pub struct HistogramGuard {
    name: &'static str,
    warn_after: std::time::Duration,
    started: Instant,
}

impl HistogramGuard {
    pub fn begin(name: &'static str, warn_after: std::time::Duration) -> Self {
        Self {
            name,
            warn_after,
            started: Instant::now(),
        }
    }
}

impl Drop for HistogramGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        if elapsed >= self.warn_after {
            tracing::warn!(target: "shardval", metric = self.name, ?elapsed, "slow operation");
        } else {
            tracing::trace!(target: "shardval", metric = self.name, ?elapsed, "operation finished");
        }
    }
}
