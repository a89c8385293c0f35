//! Shared counters and gauges, readable from the facade without a round
//! trip to the scheduler task.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use procmux_core::EndReason;

#[derive(Debug, Default)]
pub(crate) struct PoolMetrics {
    spawned: AtomicU64,
    completed: AtomicU64,
    internal_errors: AtomicU64,
    pending: AtomicU64,
    busy: AtomicU64,
    ended: AtomicBool,
    end_reasons: Mutex<BTreeMap<EndReason, u64>>,
}

impl PoolMetrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_spawned(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_internal_errors(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_pending(&self, n: u64) {
        self.pending.store(n, Ordering::Relaxed);
    }

    pub(crate) fn set_busy(&self, n: u64) {
        self.busy.store(n, Ordering::Relaxed);
    }

    pub(crate) fn set_ended(&self) {
        self.ended.store(true, Ordering::Relaxed);
    }

    pub(crate) fn record_end_reason(&self, reason: EndReason) {
        let mut map = self.end_reasons.lock().expect("end_reasons lock");
        *map.entry(reason).or_insert(0) += 1;
    }

    pub(crate) fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn internal_errors(&self) -> u64 {
        self.internal_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub(crate) fn busy(&self) -> u64 {
        self.busy.load(Ordering::Relaxed)
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Relaxed)
    }

    pub(crate) fn end_reasons(&self) -> BTreeMap<EndReason, u64> {
        self.end_reasons.lock().expect("end_reasons lock").clone()
    }
}
