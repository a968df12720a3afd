//! End-to-end pipeline tests with a scripted source and an in-memory store

use bms_can_core::source::MemorySource;
use bms_can_core::{
    CaptureClock, CaptureEnd, OperatingMode, Pipeline, PipelineConfig, PipelineError, RawFrame,
    RetryConfig, ShutdownSignal, SignalDefinition, SignalTable, SourceError, StoreSink, WriteError,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Store double: accepts or fails per script, keeps every acknowledged body
#[derive(Clone, Default)]
struct TestStore {
    written: Arc<Mutex<Vec<String>>>,
    script: Arc<Mutex<VecDeque<Result<(), WriteError>>>>,
    always_unreachable: bool,
}

impl TestStore {
    fn unreachable() -> Self {
        Self {
            always_unreachable: true,
            ..Self::default()
        }
    }

    fn with_script(script: Vec<Result<(), WriteError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Self::default()
        }
    }

    fn lines(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .flat_map(|body| body.lines().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }
}

impl StoreSink for TestStore {
    fn write(&mut self, body: &str) -> Result<(), WriteError> {
        if self.always_unreachable {
            return Err(WriteError::Unreachable("connection refused".into()));
        }
        let result = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.written.lock().unwrap().push(body.to_string());
        }
        result
    }
}

fn frames(n: u32) -> Vec<RawFrame> {
    let clock = CaptureClock::start();
    (0..n)
        .map(|i| RawFrame::new(clock.now(), 0x100 + (i % 4), false, &i.to_le_bytes()).unwrap())
        .collect()
}

fn fast_config() -> PipelineConfig {
    PipelineConfig::new("car1")
        .with_batch(10, Duration::from_millis(20))
        .with_read_timeout(Duration::from_millis(10))
        .with_reconnect(3, Duration::from_millis(1))
        .with_drain_timeout(Duration::from_secs(2))
        .with_retry(RetryConfig {
            retry_ceiling: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        })
}

#[test]
fn test_raw_mode_writes_every_frame() {
    let store = TestStore::default();
    let source = MemorySource::from_frames(frames(55));
    let pipeline = Pipeline::new(fast_config(), source, None, store.clone());

    let report = pipeline.run(&ShutdownSignal::new()).unwrap();

    assert_eq!(report.end, CaptureEnd::SourceExhausted);
    assert_eq!(report.stats.frames_read, 55);
    assert_eq!(report.stats.records_written, 55);
    assert_eq!(report.stats.records_missing(), 0);

    let lines = store.lines();
    assert_eq!(lines.len(), 55);
    assert!(lines.iter().all(|l| l.starts_with("bms_can_raw,car_id=car1,")));
    // Capture order is preserved through the buffer and the batches
    assert!(lines[0].contains("data_hex=\"00000000\""));
    assert!(lines[54].contains("data_hex=\"36000000\""));
}

#[test]
fn test_batches_never_exceed_max_size() {
    let store = TestStore::default();
    let source = MemorySource::from_frames(frames(95));
    Pipeline::new(fast_config(), source, None, store.clone())
        .run(&ShutdownSignal::new())
        .unwrap();

    let bodies = store.written.lock().unwrap();
    assert!(bodies.iter().all(|b| b.lines().count() <= 10));
    assert_eq!(bodies.iter().map(|b| b.lines().count()).sum::<usize>(), 95);
}

#[test]
fn test_decoded_mode_with_orion_table() {
    let store = TestStore::default();
    let clock = CaptureClock::start();
    let telemetry = RawFrame::new(clock.now(), 0x6B0, false, &[0xE8, 0x03, 0x9C, 0xFF, 0xA0, 25, 31, 0]).unwrap();
    let unknown = RawFrame::new(clock.now(), 0x123, false, &[1, 2, 3]).unwrap();
    let source = MemorySource::from_frames(vec![telemetry, unknown]);
    let table = SignalTable::orion_telemetry(0x6B0, false).unwrap();
    let config = fast_config().with_mode(OperatingMode::Decoded);

    let report = Pipeline::new(config, source, Some(table), store.clone())
        .run(&ShutdownSignal::new())
        .unwrap();

    assert_eq!(report.stats.signals_decoded, 6);
    assert_eq!(report.stats.unknown_id_frames, 1);

    let lines = store.lines();
    assert_eq!(lines.len(), 6);
    let line = |name: &str| lines.iter().find(|l| l.starts_with(name)).unwrap().clone();
    assert!(line("pack_voltage,").contains("numeric_value=100.0 "));
    assert!(line("pack_current,").contains("numeric_value=-10.0 "));
    assert!(line("soc,").contains("numeric_value=80.0 "));
    assert!(line("max_temp,").contains("numeric_value=31.0 "));
}

#[test]
fn test_both_mode_with_source_tag() {
    let store = TestStore::default();
    let clock = CaptureClock::start();
    let frame = RawFrame::new(clock.now(), 0x100, false, &[0x10, 0x27]).unwrap();
    let table = SignalTable::from_definitions(
        "test",
        vec![SignalDefinition::new(0x100, "pack_voltage", 0, 16).with_scaling(0.01, 0.0)],
    )
    .unwrap();
    let config = fast_config()
        .with_mode(OperatingMode::Both)
        .with_source_tag("candapter");

    Pipeline::new(config, MemorySource::from_frames(vec![frame]), Some(table), store.clone())
        .run(&ShutdownSignal::new())
        .unwrap();

    let lines = store.lines();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("bms_can_raw,car_id=car1,arb_id=256,is_ext=false,source=candapter "));
    assert!(lines[1].starts_with("pack_voltage,car_id=car1,source=candapter numeric_value=100.0 "));
}

#[test]
fn test_unreachable_store_loses_records_but_keeps_running() {
    let store = TestStore::unreachable();
    let source = MemorySource::from_frames(frames(25));

    let report = Pipeline::new(fast_config(), source, None, store.clone())
        .run(&ShutdownSignal::new())
        .unwrap();

    assert_eq!(report.stats.frames_read, 25);
    assert_eq!(report.stats.records_written, 0);
    assert_eq!(report.stats.records_lost, 25);
    assert_eq!(report.stats.write_attempts, report.stats.batches_lost * 3);
}

#[test]
fn test_transient_failures_are_retried_without_duplicates() {
    let store = TestStore::with_script(vec![
        Err(WriteError::Unreachable("timeout".into())),
        Err(WriteError::Unreachable("timeout".into())),
    ]);
    let source = MemorySource::from_frames(frames(8));

    let report = Pipeline::new(fast_config(), source, None, store.clone())
        .run(&ShutdownSignal::new())
        .unwrap();

    assert_eq!(report.stats.records_written, 8);
    assert_eq!(report.stats.records_lost, 0);
    assert_eq!(store.lines().len(), 8);
}

#[test]
fn test_rejected_batch_is_counted_and_pipeline_continues() {
    let store = TestStore::with_script(vec![Err(WriteError::Rejected("HTTP 400: bad line".into()))]);
    let source = MemorySource::from_frames(frames(20));

    let report = Pipeline::new(fast_config(), source, None, store.clone())
        .run(&ShutdownSignal::new())
        .unwrap();

    assert!(report.stats.records_rejected > 0);
    assert_eq!(report.stats.records_rejected + report.stats.records_written, 20);
}

#[test]
fn test_reconnects_after_port_closed() {
    let store = TestStore::default();
    let mut script: Vec<_> = frames(3).into_iter().map(Ok).collect();
    script.push(Err(SourceError::PortClosed("adapter unplugged".into())));
    script.extend(frames(2).into_iter().map(Ok));
    let source = MemorySource::from_script(script).with_open_results(vec![
        Ok(()),
        Err(SourceError::AdapterUnavailable("not yet".into())),
    ]);

    let report = Pipeline::new(fast_config(), source, None, store.clone())
        .run(&ShutdownSignal::new())
        .unwrap();

    assert_eq!(report.stats.reconnects, 1);
    assert_eq!(report.stats.frames_read, 5);
    assert_eq!(store.lines().len(), 5);
}

#[test]
fn test_exhausted_reconnects_are_fatal_after_drain() {
    let store = TestStore::default();
    let mut script: Vec<_> = frames(4).into_iter().map(Ok).collect();
    script.push(Err(SourceError::PortClosed("adapter unplugged".into())));
    let unavailable = || Err(SourceError::AdapterUnavailable("no device".into()));
    let source = MemorySource::from_script(script).with_open_results(vec![
        Ok(()),
        unavailable(),
        unavailable(),
        unavailable(),
    ]);
    let pipeline = Pipeline::new(fast_config(), source, None, store.clone());
    let stats = pipeline.stats();

    match pipeline.run(&ShutdownSignal::new()) {
        Err(PipelineError::PortClosed { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected PortClosed, got {:?}", other.map(|r| r.end)),
    }

    // Frames captured before the failure still reached the store
    assert_eq!(store.lines().len(), 4);
    assert_eq!(stats.snapshot().records_written, 4);
}

#[test]
fn test_adapter_unavailable_at_startup() {
    let source = MemorySource::from_frames(frames(1))
        .with_open_results(vec![Err(SourceError::AdapterUnavailable("/dev/ttyUSB0: no such device".into()))]);

    let result = Pipeline::new(fast_config(), source, None, TestStore::default()).run(&ShutdownSignal::new());
    assert!(matches!(result, Err(PipelineError::AdapterUnavailable(_))));
}

#[test]
fn test_shutdown_drains_buffered_records() {
    let store = TestStore::default();
    // Large batch and long age so nothing flushes before shutdown
    let config = fast_config().with_batch(1000, Duration::from_secs(60));
    let source = MemorySource::from_frames(frames(30)).idle_when_empty();
    let shutdown = ShutdownSignal::new();

    let trigger = {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            shutdown.request();
        })
    };

    let report = Pipeline::new(config, source, None, store.clone()).run(&shutdown).unwrap();
    trigger.join().unwrap();

    assert_eq!(report.end, CaptureEnd::Shutdown);
    assert!(report.stats.read_timeouts > 0);
    assert_eq!(report.stats.records_written, 30);
    assert_eq!(store.lines().len(), 30);
}

#[test]
fn test_drain_is_bounded_when_store_is_down() {
    let config = fast_config()
        .with_batch(1000, Duration::from_secs(60))
        .with_drain_timeout(Duration::from_millis(300))
        .with_retry(RetryConfig {
            retry_ceiling: 100,
            initial_backoff_ms: 1000,
            max_backoff_ms: 1000,
        });
    let source = MemorySource::from_frames(frames(12)).idle_when_empty();
    let shutdown = ShutdownSignal::new();
    let trigger = {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            shutdown.request();
        })
    };

    let started = std::time::Instant::now();
    let report = Pipeline::new(config, source, None, TestStore::unreachable())
        .run(&shutdown)
        .unwrap();
    trigger.join().unwrap();

    // One attempt, then the backoff is cut short by the drain deadline
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.stats.frames_read, 12);
    assert_eq!(report.stats.write_attempts, 1);
    assert_eq!(report.stats.records_lost, 12);
}

/// Store whose client code panics on the first write
struct PanickingStore;

impl StoreSink for PanickingStore {
    fn write(&mut self, _body: &str) -> Result<(), WriteError> {
        panic!("store client crashed");
    }
}

#[test]
fn test_flush_thread_panic_stops_capture_with_error() {
    // The source never ends on its own, so only the dead flush thread can stop capture
    let source = MemorySource::from_frames(frames(5)).idle_when_empty();
    let pipeline = Pipeline::new(fast_config(), source, None, PanickingStore);
    let stats = pipeline.stats();

    let started = std::time::Instant::now();
    match pipeline.run(&ShutdownSignal::new()) {
        Err(PipelineError::Worker(reason)) => assert!(reason.contains("store client crashed"), "{}", reason),
        other => panic!("expected Worker error, got {:?}", other.map(|r| r.end)),
    }

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(stats.snapshot().records_written, 0);
}
