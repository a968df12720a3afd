//! Batch Buffer
//!
//! Accumulates records between the capture loop and the flush loop. It is the
//! only mutable state the two share.
//!
//! ```text
//! EMPTY --append--> ACCUMULATING --size or age bound--> READY_TO_FLUSH
//!   ^                                                         |
//!   +------------------- take_and_reset() -------------------+
//! ```
//!
//! `append` never waits on the writer. When the writer falls behind and the
//! hard ceiling is reached, the oldest record is evicted and counted instead of
//! stalling the bus reads.

use crate::config::BatchConfig;
use crate::types::{Batch, MeasurementRecord};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Observable buffer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Accumulating,
    ReadyToFlush,
}

/// Result of one append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The oldest record was evicted to make room
    pub evicted: bool,
    /// The size bound is met after this append
    pub ready: bool,
}

#[derive(Default)]
struct Inner {
    /// Records with the instant they were appended, oldest first
    records: VecDeque<(Instant, MeasurementRecord)>,
}

/// Thread-safe record accumulator with size and age bounds
pub struct BatchBuffer {
    max_batch_size: usize,
    max_batch_age: Duration,
    ceiling: usize,
    inner: Mutex<Inner>,
    ready: Condvar,
    evicted: AtomicU64,
}

impl BatchBuffer {
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            max_batch_age: config.max_batch_age(),
            ceiling: config.effective_ceiling(),
            inner: Mutex::new(Inner::default()),
            ready: Condvar::new(),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record stamped with the current instant
    pub fn append(&self, record: MeasurementRecord) -> AppendOutcome {
        self.append_at(record, Instant::now())
    }

    /// Append a record stamped with `now`
    pub fn append_at(&self, record: MeasurementRecord, now: Instant) -> AppendOutcome {
        let mut inner = self.lock();

        let evicted = if inner.records.len() >= self.ceiling {
            inner.records.pop_front();
            true
        } else {
            false
        };
        inner.records.push_back((now, record));
        let ready = inner.records.len() >= self.max_batch_size;
        drop(inner);

        if evicted {
            let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % 1000 == 0 {
                log::warn!(
                    "Batch buffer at ceiling ({} records), evicting oldest (total evicted: {})",
                    self.ceiling,
                    total
                );
            }
        }
        if ready {
            self.ready.notify_all();
        }

        AppendOutcome { evicted, ready }
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Records evicted at the ceiling since creation
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Current state relative to `now`
    pub fn state_at(&self, now: Instant) -> BufferState {
        let inner = self.lock();
        self.state_locked(&inner, now)
    }

    /// True exactly when the size bound is met or the oldest record has reached the age bound
    pub fn is_ready_at(&self, now: Instant) -> bool {
        self.state_at(now) == BufferState::ReadyToFlush
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready_at(Instant::now())
    }

    fn state_locked(&self, inner: &Inner, now: Instant) -> BufferState {
        match inner.records.front() {
            None => BufferState::Empty,
            Some(_) if inner.records.len() >= self.max_batch_size => BufferState::ReadyToFlush,
            Some((oldest, _)) if now.saturating_duration_since(*oldest) >= self.max_batch_age => {
                BufferState::ReadyToFlush
            }
            Some(_) => BufferState::Accumulating,
        }
    }

    /// Time until the age bound fires for the current window
    fn age_remaining(&self, inner: &Inner, now: Instant) -> Option<Duration> {
        inner
            .records
            .front()
            .map(|(oldest, _)| self.max_batch_age.saturating_sub(now.saturating_duration_since(*oldest)))
    }

    /// Drain every buffered record and start a fresh window
    ///
    /// The returned batch is owned by the caller; the buffer keeps no reference.
    pub fn take_and_reset(&self) -> Batch {
        let mut inner = self.lock();
        let records = std::mem::take(&mut inner.records);
        drop(inner);
        Batch::new(records.into_iter().map(|(_, record)| record).collect())
    }

    /// Block until the buffer is ready to flush or `timeout` passes
    ///
    /// Wakes early on the append that meets the size bound, when the age bound
    /// of the oldest record fires, or on `wake()`. Returns readiness at exit.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            let now = Instant::now();
            if self.state_locked(&inner, now) == BufferState::ReadyToFlush {
                return true;
            }
            if now >= deadline {
                return false;
            }

            let mut wait = deadline - now;
            if let Some(remaining) = self.age_remaining(&inner, now) {
                wait = wait.min(remaining.max(Duration::from_millis(1)));
            }

            let (guard, result) = self
                .ready
                .wait_timeout(inner, wait)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;

            if result.timed_out() {
                continue;
            }
            // Notified: either ready, or woken for shutdown
            let now = Instant::now();
            return self.state_locked(&inner, now) == BufferState::ReadyToFlush;
        }
    }

    /// Wake any thread blocked in `wait_until_ready`
    pub fn wake(&self) {
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn record(i: usize) -> MeasurementRecord {
        MeasurementRecord::Decoded {
            timestamp: Utc::now(),
            car_id: "car1".to_string(),
            signal_name: format!("s{}", i),
            numeric_value: i as f64,
        }
    }

    fn buffer(size: usize, age_ms: u64, ceiling: usize) -> BatchBuffer {
        BatchBuffer::new(&BatchConfig {
            max_batch_size: size,
            max_batch_age_ms: age_ms,
            max_buffered_records: ceiling,
        })
    }

    #[test]
    fn test_state_transitions() {
        let buf = buffer(3, 1000, 100);
        let t0 = Instant::now();

        assert_eq!(buf.state_at(t0), BufferState::Empty);
        assert!(!buf.append_at(record(0), t0).ready);
        assert_eq!(buf.state_at(t0), BufferState::Accumulating);
        assert!(!buf.append_at(record(1), t0).ready);
        assert!(buf.append_at(record(2), t0).ready);
        assert_eq!(buf.state_at(t0), BufferState::ReadyToFlush);

        let batch = buf.take_and_reset();
        assert_eq!(batch.len(), 3);
        assert_eq!(buf.state_at(t0), BufferState::Empty);
    }

    #[test]
    fn test_flushes_exactly_at_size_bound() {
        let buf = buffer(5, 60_000, 100);
        let t0 = Instant::now();
        for i in 0..4 {
            buf.append_at(record(i), t0);
            assert!(!buf.is_ready_at(t0), "ready early at {} records", i + 1);
        }
        buf.append_at(record(4), t0);
        assert!(buf.is_ready_at(t0));
    }

    #[test]
    fn test_flushes_exactly_at_age_bound() {
        let buf = buffer(100, 1000, 1000);
        let t0 = Instant::now();
        buf.append_at(record(0), t0);
        buf.append_at(record(1), t0 + Duration::from_millis(500));

        assert!(!buf.is_ready_at(t0 + Duration::from_millis(999)));
        assert!(buf.is_ready_at(t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_take_and_reset_starts_fresh_window() {
        let buf = buffer(100, 1000, 1000);
        let t0 = Instant::now();
        buf.append_at(record(0), t0);
        let batch = buf.take_and_reset();
        assert_eq!(batch.len(), 1);
        assert_eq!(buf.len(), 0);

        // The new window is aged from the new append, not the old one
        let t1 = t0 + Duration::from_millis(900);
        buf.append_at(record(1), t1);
        assert!(!buf.is_ready_at(t0 + Duration::from_millis(1500)));
        assert!(buf.is_ready_at(t1 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_take_preserves_order() {
        let buf = buffer(10, 1000, 100);
        for i in 0..4 {
            buf.append(record(i));
        }
        let names: Vec<_> = buf
            .take_and_reset()
            .into_records()
            .into_iter()
            .map(|r| match r {
                MeasurementRecord::Decoded { signal_name, .. } => signal_name,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["s0", "s1", "s2", "s3"]);
    }

    #[test]
    fn test_ceiling_evicts_oldest() {
        let buf = buffer(2, 1000, 3);
        for i in 0..5 {
            let outcome = buf.append(record(i));
            assert_eq!(outcome.evicted, i >= 3);
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.evicted(), 2);

        let first = buf.take_and_reset().into_records().remove(0);
        match first {
            MeasurementRecord::Decoded { signal_name, .. } => assert_eq!(signal_name, "s2"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_wait_until_ready_wakes_on_size() {
        let buf = Arc::new(buffer(2, 60_000, 100));
        let producer = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                buf.append(record(0));
                buf.append(record(1));
            })
        };

        assert!(buf.wait_until_ready(Duration::from_secs(5)));
        producer.join().unwrap();
        assert_eq!(buf.take_and_reset().len(), 2);
    }

    #[test]
    fn test_wait_until_ready_wakes_on_age() {
        let buf = buffer(100, 30, 100);
        buf.append(record(0));
        let start = Instant::now();
        assert!(buf.wait_until_ready(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_until_ready_times_out_when_empty() {
        let buf = buffer(10, 1000, 100);
        assert!(!buf.wait_until_ready(Duration::from_millis(10)));
    }

    #[test]
    fn test_concurrent_append_and_take() {
        let buf = Arc::new(buffer(50, 1000, 100_000));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let buf = Arc::clone(&buf);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        buf.append(record(i));
                    }
                })
            })
            .collect();

        let mut taken = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            taken += buf.take_and_reset().len();
        }
        for writer in writers {
            writer.join().unwrap();
        }
        taken += buf.take_and_reset().len();
        assert_eq!(taken, 4000);
    }
}
