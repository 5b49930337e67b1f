use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, shared by ingest workers and the releaser.
#[derive(Debug, Default)]
pub struct AggregatorStats {
    payloads_processed: AtomicU64,
    payloads_denied: AtomicU64,
    payloads_failed: AtomicU64,
    rows_appended: AtomicU64,
    rows_skipped: AtomicU64,
    cycles_idle: AtomicU64,
    cycles_denied: AtomicU64,
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    files_delivered: AtomicU64,
    files_rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub payloads_processed: u64,
    pub payloads_denied: u64,
    pub payloads_failed: u64,
    pub rows_appended: u64,
    pub rows_skipped: u64,
    pub cycles_idle: u64,
    pub cycles_denied: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub files_delivered: u64,
    pub files_rejected: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl AggregatorStats {
    pub fn observe_payload(&self, rows_appended: usize, rows_skipped: usize) {
        bump(&self.payloads_processed, 1);
        bump(&self.rows_appended, rows_appended as u64);
        bump(&self.rows_skipped, rows_skipped as u64);
    }

    pub fn observe_payload_denied(&self) {
        bump(&self.payloads_denied, 1);
    }

    pub fn observe_payload_failed(&self) {
        bump(&self.payloads_failed, 1);
    }

    pub fn observe_cycle_idle(&self) {
        bump(&self.cycles_idle, 1);
    }

    pub fn observe_cycle_denied(&self) {
        bump(&self.cycles_denied, 1);
    }

    pub fn observe_cycle_completed(&self, delivered: usize, rejected: usize) {
        bump(&self.cycles_completed, 1);
        bump(&self.files_delivered, delivered as u64);
        bump(&self.files_rejected, rejected as u64);
    }

    pub fn observe_cycle_failed(&self) {
        bump(&self.cycles_failed, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            payloads_processed: load(&self.payloads_processed),
            payloads_denied: load(&self.payloads_denied),
            payloads_failed: load(&self.payloads_failed),
            rows_appended: load(&self.rows_appended),
            rows_skipped: load(&self.rows_skipped),
            cycles_idle: load(&self.cycles_idle),
            cycles_denied: load(&self.cycles_denied),
            cycles_completed: load(&self.cycles_completed),
            cycles_failed: load(&self.cycles_failed),
            files_delivered: load(&self.files_delivered),
            files_rejected: load(&self.files_rejected),
        }
    }
}
