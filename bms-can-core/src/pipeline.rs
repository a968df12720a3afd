//! Pipeline controller
//!
//! Wires a Frame Source, the record builder, the Batch Buffer and the Durable
//! Writer together and runs them until shutdown or the source ends.
//!
//! Two threads cooperate inside a `std::thread::scope`:
//! - capture (the caller's thread): bounded reads, decode, build, append;
//! - flush: waits for the buffer to become ready and hands batches to the
//!   writer, then drains what is left when capture stops.
//!
//! The buffer is the only state they share. Neither thread is ever interrupted
//! in the middle of a read or a request; both check for shutdown in between.

use crate::buffer::BatchBuffer;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, SourceError};
use crate::line_protocol::LineProtocolEncoder;
use crate::records::RecordBuilder;
use crate::signals::SignalTable;
use crate::source::{FrameSource, SourceGuard};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::types::RawFrame;
use crate::writer::{DurableWriter, StoreSink};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// How long the flush thread sleeps on the buffer before rechecking for stop
const FLUSH_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct ShutdownState {
    requested: AtomicBool,
    requested_at: Mutex<Option<Instant>>,
    wake: Condvar,
}

/// Cooperative cancellation flag shared between the pipeline and its owner
///
/// Cloning yields a handle to the same flag. The first `request` records the
/// instant shutdown was asked for, which bounds the final drain.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    state: Arc<ShutdownState>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the pipeline to stop. Idempotent.
    pub fn request(&self) {
        let mut at = self.state.requested_at.lock().unwrap_or_else(PoisonError::into_inner);
        if at.is_none() {
            *at = Some(Instant::now());
        }
        self.state.requested.store(true, Ordering::SeqCst);
        drop(at);
        self.state.wake.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    pub fn requested_at(&self) -> Option<Instant> {
        *self.state.requested_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`; returns true as soon as shutdown is requested
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut at = self.state.requested_at.lock().unwrap_or_else(PoisonError::into_inner);
        while at.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            at = self
                .state
                .wake
                .wait_timeout(at, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Why capture stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureEnd {
    /// Shutdown was requested
    Shutdown,
    /// A finite source ran out of frames
    SourceExhausted,
}

/// Summary returned when the pipeline stops cleanly
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub end: CaptureEnd,
    pub elapsed_ms: u64,
    pub stats: StatsSnapshot,
}

/// Capture, decode, batch and write until stopped
pub struct Pipeline<S: FrameSource, K: StoreSink> {
    config: PipelineConfig,
    source: S,
    builder: RecordBuilder,
    sink: K,
    stats: Arc<PipelineStats>,
}

impl<S: FrameSource, K: StoreSink> Pipeline<S, K> {
    /// Create a pipeline; `table` is required for decoded modes
    pub fn new(config: PipelineConfig, source: S, table: Option<SignalTable>, sink: K) -> Self {
        let builder = RecordBuilder::new(config.car_id.clone(), config.mode, table);
        Self {
            config,
            source,
            builder,
            sink,
            stats: Arc::new(PipelineStats::new()),
        }
    }

    /// Live counters, readable while the pipeline runs and after it fails
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Run until `shutdown` is requested, the source is exhausted, or a fatal error
    ///
    /// Whatever the reason capture stops, buffered records are drained to the
    /// store (bounded by the drain timeout) before this returns.
    pub fn run(self, shutdown: &ShutdownSignal) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let Pipeline {
            config,
            source,
            builder,
            sink,
            stats,
        } = self;

        let mut source = SourceGuard::open(source).map_err(|e| match e {
            SourceError::AdapterUnavailable(reason) => PipelineError::AdapterUnavailable(reason),
            other => PipelineError::AdapterUnavailable(other.to_string()),
        })?;

        log::info!(
            "Pipeline started: car_id={} mode={:?} batch={} records/{} ms",
            config.car_id,
            config.mode,
            config.batch.max_batch_size,
            config.batch.max_batch_age_ms
        );

        let mut encoder = LineProtocolEncoder::new();
        if let Some(tag) = &config.source_tag {
            encoder = encoder.with_source_tag(tag.clone());
        }
        let writer = DurableWriter::new(sink, config.retry, Arc::clone(&stats)).with_encoder(encoder);
        let buffer = BatchBuffer::new(&config.batch);
        let stopping = ShutdownSignal::new();
        let flush_exited = ShutdownSignal::new();

        let capture = Capture {
            config: &config,
            builder: &builder,
            buffer: &buffer,
            stats: &stats,
            shutdown,
            flush_exited: &flush_exited,
        };
        let flush = Flush {
            config: &config,
            buffer: &buffer,
            stats: &stats,
            shutdown,
            stopping: &stopping,
        };

        let result = std::thread::scope(|scope| {
            let flusher = std::thread::Builder::new()
                .name("bms-flush".to_string())
                .spawn_scoped(scope, || {
                    // Set on return and on unwind so capture never outlives the writer
                    let _exit = ExitNotice(&flush_exited);
                    flush.run(writer)
                })
                .map_err(|e| PipelineError::Worker(format!("could not spawn flush thread: {}", e)))?;

            let result = capture.run(&mut source);

            stopping.request();
            buffer.wake();
            match flusher.join() {
                Ok(()) => result,
                Err(panic) => Err(PipelineError::Worker(format!(
                    "flush thread panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        });

        drop(source);

        let snapshot = stats.snapshot();
        let end = match result {
            Ok(end) => end,
            Err(e) => {
                log::error!("Pipeline stopped: {} ({})", e, snapshot);
                return Err(e);
            }
        };

        log::info!("Pipeline stopped ({:?}): {}", end, snapshot);
        if snapshot.records_missing() > 0 {
            log::warn!("{} records did not reach the store", snapshot.records_missing());
        }

        Ok(PipelineReport {
            end,
            elapsed_ms: started.elapsed().as_millis() as u64,
            stats: snapshot,
        })
    }
}

/// Requests the wrapped signal when dropped
struct ExitNotice<'a>(&'a ShutdownSignal);

impl Drop for ExitNotice<'_> {
    fn drop(&mut self) {
        self.0.request();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// Capture side: runs on the caller's thread
struct Capture<'a> {
    config: &'a PipelineConfig,
    builder: &'a RecordBuilder,
    buffer: &'a BatchBuffer,
    stats: &'a PipelineStats,
    shutdown: &'a ShutdownSignal,
    flush_exited: &'a ShutdownSignal,
}

impl Capture<'_> {
    fn run<S: FrameSource>(&self, source: &mut SourceGuard<S>) -> Result<CaptureEnd, PipelineError> {
        let read_timeout = self.config.read_timeout();

        loop {
            if self.shutdown.is_requested() {
                log::info!("Shutdown requested, stopping capture");
                return Ok(CaptureEnd::Shutdown);
            }
            if self.flush_exited.is_requested() {
                log::error!("Flush thread exited unexpectedly, stopping capture");
                return Err(PipelineError::Worker("flush thread exited".to_string()));
            }

            match source.read_next(read_timeout) {
                Ok(frame) => {
                    PipelineStats::incr(&self.stats.frames_read);
                    log::trace!("{}", frame);
                    self.ingest(&frame);
                }
                Err(SourceError::Timeout) => {
                    PipelineStats::incr(&self.stats.read_timeouts);
                }
                Err(SourceError::Exhausted) => {
                    log::info!("{} exhausted", source.describe());
                    return Ok(CaptureEnd::SourceExhausted);
                }
                Err(SourceError::PortClosed(reason)) | Err(SourceError::AdapterUnavailable(reason)) => {
                    if !self.reconnect(source, reason)? {
                        return Ok(CaptureEnd::Shutdown);
                    }
                }
            }
        }
    }

    fn ingest(&self, frame: &RawFrame) {
        let built = self.builder.process(frame);

        if built.unknown_id {
            PipelineStats::incr(&self.stats.unknown_id_frames);
        }
        PipelineStats::add(&self.stats.signals_decoded, built.decoded_signals as u64);
        PipelineStats::add(&self.stats.records_built, built.records.len() as u64);

        for record in built.records {
            if self.buffer.append(record).evicted {
                PipelineStats::incr(&self.stats.records_evicted);
            }
        }
    }

    /// Re-acquire the adapter; Ok(false) if shutdown interrupted the attempts
    fn reconnect<S: FrameSource>(&self, source: &mut SourceGuard<S>, reason: String) -> Result<bool, PipelineError> {
        let attempts = self.config.reconnect_attempts;
        let delay = self.config.reconnect_delay();
        log::warn!("{} closed: {}; reconnecting ({} attempts)", source.describe(), reason, attempts);
        source.close();

        let mut last_error = reason;
        for attempt in 1..=attempts {
            if self.shutdown.wait(delay) {
                return Ok(false);
            }
            if self.flush_exited.is_requested() {
                return Err(PipelineError::Worker("flush thread exited".to_string()));
            }
            match source.open() {
                Ok(()) => {
                    PipelineStats::incr(&self.stats.reconnects);
                    log::info!("Reconnected to {} (attempt {}/{})", source.describe(), attempt, attempts);
                    return Ok(true);
                }
                Err(e) => {
                    log::warn!("Reconnect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(PipelineError::PortClosed {
            attempts,
            reason: last_error,
        })
    }
}

/// Flush side: runs on the scoped worker thread
struct Flush<'a> {
    config: &'a PipelineConfig,
    buffer: &'a BatchBuffer,
    stats: &'a PipelineStats,
    shutdown: &'a ShutdownSignal,
    stopping: &'a ShutdownSignal,
}

impl Flush<'_> {
    fn run<K: StoreSink>(&self, mut writer: DurableWriter<K>) {
        let stats_interval = self.config.stats_interval();
        let mut next_summary = stats_interval.map(|interval| Instant::now() + interval);

        while !self.stopping.is_requested() {
            if self.buffer.wait_until_ready(FLUSH_POLL) {
                self.flush(&mut writer);
            }

            if let (Some(at), Some(interval)) = (next_summary, stats_interval) {
                if Instant::now() >= at {
                    log::info!("Stats: {}", self.stats.snapshot());
                    next_summary = Some(at + interval);
                }
            }
        }

        self.drain(&mut writer);
    }

    /// Write everything currently buffered in batches of at most max_batch_size
    fn flush<K: StoreSink>(&self, writer: &mut DurableWriter<K>) {
        let batch = self.buffer.take_and_reset();
        if batch.is_empty() {
            return;
        }
        log::debug!("Flushing {} records", batch.len());

        let cancelled = || self.drain_expired();
        for chunk in batch.into_chunks(self.config.batch.max_batch_size) {
            if self.drain_expired() {
                self.abandon(chunk.len());
                continue;
            }
            writer.write_batch_until(&chunk, &cancelled);
        }
    }

    fn drain<K: StoreSink>(&self, writer: &mut DurableWriter<K>) {
        let remaining = self.buffer.len();
        if remaining > 0 {
            log::info!(
                "Draining {} buffered records (timeout {:?})",
                remaining,
                self.config.drain_timeout()
            );
        }
        self.flush(writer);
    }

    /// True once the drain window after shutdown has elapsed
    fn drain_expired(&self) -> bool {
        self.shutdown
            .requested_at()
            .or_else(|| self.stopping.requested_at())
            .is_some_and(|at| at.elapsed() >= self.config.drain_timeout())
    }

    fn abandon(&self, records: usize) {
        PipelineStats::incr(&self.stats.batches_lost);
        PipelineStats::add(&self.stats.records_lost, records as u64);
        log::warn!("Drain timeout passed, abandoning {} records", records);
    }
}
