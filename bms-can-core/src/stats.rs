//! Pipeline counters
//!
//! Lock-free counters shared by the capture and flush loops. Losses are only
//! ever reported here and in the log; they never stop the pipeline.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_read: AtomicU64,
    pub read_timeouts: AtomicU64,
    pub reconnects: AtomicU64,
    pub records_built: AtomicU64,
    pub signals_decoded: AtomicU64,
    pub unknown_id_frames: AtomicU64,
    pub records_evicted: AtomicU64,
    pub write_attempts: AtomicU64,
    pub batches_written: AtomicU64,
    pub records_written: AtomicU64,
    pub batches_rejected: AtomicU64,
    pub records_rejected: AtomicU64,
    pub batches_lost: AtomicU64,
    pub records_lost: AtomicU64,
    pub records_unencodable: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) -> u64 {
        counter.fetch_add(n, Ordering::Relaxed) + n
    }

    pub(crate) fn incr(counter: &AtomicU64) -> u64 {
        Self::add(counter, 1)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_read: get(&self.frames_read),
            read_timeouts: get(&self.read_timeouts),
            reconnects: get(&self.reconnects),
            records_built: get(&self.records_built),
            signals_decoded: get(&self.signals_decoded),
            unknown_id_frames: get(&self.unknown_id_frames),
            records_evicted: get(&self.records_evicted),
            write_attempts: get(&self.write_attempts),
            batches_written: get(&self.batches_written),
            records_written: get(&self.records_written),
            batches_rejected: get(&self.batches_rejected),
            records_rejected: get(&self.records_rejected),
            batches_lost: get(&self.batches_lost),
            records_lost: get(&self.records_lost),
            records_unencodable: get(&self.records_unencodable),
        }
    }
}

/// Serializable copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_read: u64,
    pub read_timeouts: u64,
    pub reconnects: u64,
    pub records_built: u64,
    pub signals_decoded: u64,
    pub unknown_id_frames: u64,
    pub records_evicted: u64,
    pub write_attempts: u64,
    pub batches_written: u64,
    pub records_written: u64,
    pub batches_rejected: u64,
    pub records_rejected: u64,
    pub batches_lost: u64,
    pub records_lost: u64,
    pub records_unencodable: u64,
}

impl StatsSnapshot {
    /// Records that will never reach the store
    pub fn records_missing(&self) -> u64 {
        self.records_evicted + self.records_rejected + self.records_lost + self.records_unencodable
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frames={} records={} written={} ({} batches) rejected={} lost={} evicted={} reconnects={}",
            self.frames_read,
            self.records_built,
            self.records_written,
            self.batches_written,
            self.records_rejected,
            self.records_lost,
            self.records_evicted,
            self.reconnects
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        PipelineStats::incr(&stats.frames_read);
        PipelineStats::add(&stats.records_lost, 7);
        PipelineStats::add(&stats.records_evicted, 2);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_read, 1);
        assert_eq!(snap.records_lost, 7);
        assert_eq!(snap.records_missing(), 9);
        assert!(snap.to_string().contains("lost=7"));
    }
}
