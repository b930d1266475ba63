//! Process-wide observability counters (SPEC_FULL.md §2: "Perf timers / stats
//! counters"), grounded on `ext-message-pool.cpp`'s `prepare_stats()` and
//! `check-proof.hpp`'s `td::PerfWarningTimer`. Treated as an observability
//! bus with explicit init/teardown (spec.md §9), not ambient global state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Named counters read by a metrics exporter or a debug CLI command. Cheap
/// enough to bump on every hot-path event; never gated behind a lock.
#[derive(Debug, Default)]
pub struct Stats {
    pub ext_message_check_ok: AtomicU64,
    pub ext_message_check_error: AtomicU64,
    pub apply_block_count: AtomicU64,
    pub apply_block_errors: AtomicU64,
    pub collator_bans: AtomicU64,
    pub check_proof_ok: AtomicU64,
    pub check_proof_error: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ext_message_check(&self, ok: bool) {
        let counter = if ok { &self.ext_message_check_ok } else { &self.ext_message_check_error };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_apply_block(&self, ok: bool) {
        self.apply_block_count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.apply_block_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_collator_ban(&self) {
        self.collator_bans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_check_proof(&self, ok: bool) {
        let counter = if ok { &self.check_proof_ok } else { &self.check_proof_error };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// `(name, value)` snapshot pairs, mirroring `prepare_stats()`'s
    /// `vector<pair<string,string>>` shape.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("total.ext_msg_check_ok", self.ext_message_check_ok.load(Ordering::Relaxed)),
            ("total.ext_msg_check_error", self.ext_message_check_error.load(Ordering::Relaxed)),
            ("total.apply_block", self.apply_block_count.load(Ordering::Relaxed)),
            ("total.apply_block_errors", self.apply_block_errors.load(Ordering::Relaxed)),
            ("total.collator_bans", self.collator_bans.load(Ordering::Relaxed)),
            ("total.check_proof_ok", self.check_proof_ok.load(Ordering::Relaxed)),
            ("total.check_proof_error", self.check_proof_error.load(Ordering::Relaxed)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = Stats::new();
        stats.record_ext_message_check(true);
        stats.record_ext_message_check(false);
        stats.record_collator_ban();
        let snap = stats.snapshot();
        assert!(snap.contains(&("total.ext_msg_check_ok", 1)));
        assert!(snap.contains(&("total.ext_msg_check_error", 1)));
        assert!(snap.contains(&("total.collator_bans", 1)));
    }
}
