//! Durable Writer
//!
//! Delivers batches to the time-series store. Transient failures are retried
//! with exponential backoff up to the retry ceiling; a batch the store rejects
//! is logged with its full body and never retried. In every case the outcome
//! is reported and counted, and the caller moves on to the next batch.

pub mod influx;

pub use influx::{Credential, HttpStoreSink, StoreConfig};

use crate::config::RetryConfig;
use crate::error::WriteError;
use crate::line_protocol::LineProtocolEncoder;
use crate::stats::PipelineStats;
use crate::types::Batch;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity of cancellable backoff sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Destination for encoded batches
///
/// Implementations perform exactly one delivery attempt per call and classify
/// failures as `Rejected` (permanent) or `Unreachable` (transient).
pub trait StoreSink: Send {
    fn write(&mut self, body: &str) -> Result<(), WriteError>;

    /// Human-readable destination for log messages
    fn describe(&self) -> String {
        "store".to_string()
    }
}

impl<T: StoreSink + ?Sized> StoreSink for Box<T> {
    fn write(&mut self, body: &str) -> Result<(), WriteError> {
        (**self).write(body)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Final result of delivering one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Acknowledged by the store
    Written { attempts: u32, records: usize },
    /// Refused by the store; not retried
    Rejected { records: usize, reason: String },
    /// Retry ceiling reached without an acknowledgement
    Dropped { attempts: u32, records: usize },
    /// Abandoned during backoff because the caller cancelled
    Cancelled { attempts: u32, records: usize },
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }

    /// Records that did not reach the store
    pub fn records_lost(&self) -> usize {
        match self {
            WriteOutcome::Written { .. } => 0,
            WriteOutcome::Rejected { records, .. }
            | WriteOutcome::Dropped { records, .. }
            | WriteOutcome::Cancelled { records, .. } => *records,
        }
    }
}

/// Writes batches through a [`StoreSink`] with bounded retries
pub struct DurableWriter<S: StoreSink> {
    sink: S,
    encoder: LineProtocolEncoder,
    retry: RetryConfig,
    stats: Arc<PipelineStats>,
}

impl<S: StoreSink> DurableWriter<S> {
    pub fn new(sink: S, retry: RetryConfig, stats: Arc<PipelineStats>) -> Self {
        Self {
            sink,
            encoder: LineProtocolEncoder::new(),
            retry,
            stats,
        }
    }

    /// Builder method: use a specific encoder (e.g. with a source tag)
    pub fn with_encoder(mut self, encoder: LineProtocolEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    /// Deliver a batch, retrying transient failures
    ///
    /// Never fails: the outcome says what happened and the stats are updated.
    pub fn write_batch(&mut self, batch: &Batch) -> WriteOutcome {
        self.write_batch_until(batch, &|| false)
    }

    /// Deliver a batch, giving up during backoff once `cancelled` returns true
    ///
    /// The first attempt is always made. Cancellation is only checked between
    /// attempts so an in-flight request is never abandoned halfway.
    pub fn write_batch_until(&mut self, batch: &Batch, cancelled: &dyn Fn() -> bool) -> WriteOutcome {
        let encoded = self.encoder.encode_batch(batch);
        if encoded.skipped > 0 {
            PipelineStats::add(&self.stats.records_unencodable, encoded.skipped as u64);
        }

        let records = encoded.lines;
        if records == 0 {
            return WriteOutcome::Written { attempts: 0, records: 0 };
        }

        let ceiling = self.retry.retry_ceiling.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            PipelineStats::incr(&self.stats.write_attempts);

            match self.sink.write(&encoded.body) {
                Ok(()) => {
                    PipelineStats::incr(&self.stats.batches_written);
                    let total = PipelineStats::add(&self.stats.records_written, records as u64);
                    log::info!(
                        "Wrote {} records to {} (attempt {}, {} written total)",
                        records,
                        self.sink.describe(),
                        attempt,
                        total
                    );
                    return WriteOutcome::Written { attempts: attempt, records };
                }
                Err(WriteError::Rejected(reason)) => {
                    PipelineStats::incr(&self.stats.batches_rejected);
                    PipelineStats::add(&self.stats.records_rejected, records as u64);
                    log::error!(
                        "{} rejected batch of {} records: {}",
                        self.sink.describe(),
                        records,
                        reason
                    );
                    log::error!("Rejected batch body:\n{}", encoded.body);
                    return WriteOutcome::Rejected { records, reason };
                }
                Err(WriteError::Unreachable(reason)) => {
                    log::warn!(
                        "Write attempt {}/{} to {} failed: {}",
                        attempt,
                        ceiling,
                        self.sink.describe(),
                        reason
                    );
                }
            }

            if attempt >= ceiling {
                break;
            }

            let delay = self.retry.backoff_for(attempt);
            log::debug!("Retrying in {:?}", delay);
            if !sleep_unless_cancelled(delay, cancelled) {
                self.count_lost(records);
                log::warn!(
                    "Abandoned batch of {} records after {} attempts (shutting down)",
                    records,
                    attempt
                );
                return WriteOutcome::Cancelled { attempts: attempt, records };
            }
        }

        self.count_lost(records);
        log::error!(
            "Dropped batch of {} records after {} failed attempts",
            records,
            attempt
        );
        WriteOutcome::Dropped { attempts: attempt, records }
    }

    fn count_lost(&self, records: usize) {
        PipelineStats::incr(&self.stats.batches_lost);
        PipelineStats::add(&self.stats.records_lost, records as u64);
    }
}

/// Sleep for `delay`; returns false if cancelled first
fn sleep_unless_cancelled(delay: Duration, cancelled: &dyn Fn() -> bool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
