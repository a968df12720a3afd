//! Core types for the BMS CAN logger pipeline
//!
//! This module defines the values that flow through the pipeline: frames as
//! captured from the adapter, signals decoded from them, and the measurement
//! records that are eventually persisted. All of them are immutable once built.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Instant;

use crate::error::FrameError;

/// Timestamp type used throughout the pipeline
pub type Timestamp = DateTime<Utc>;

/// Largest 11-bit (standard) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit (extended) identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Maximum payload length of a classic CAN frame
pub const MAX_DLC: u8 = 8;

/// Capture time of a frame: wall-clock time plus a monotonic instant.
///
/// The wall time is used for persistence, the monotonic instant for
/// buffer age checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTime {
    pub wall: Timestamp,
    pub monotonic: Instant,
}

/// Clock that stamps frames for one Frame Source session.
///
/// Wall time is derived from the session start plus monotonic elapsed time,
/// so stamps never go backwards even if the system clock is stepped.
#[derive(Debug, Clone, Copy)]
pub struct CaptureClock {
    start_wall: Timestamp,
    start_mono: Instant,
}

impl CaptureClock {
    /// Start a new session clock anchored at the current time
    pub fn start() -> Self {
        Self {
            start_wall: Utc::now(),
            start_mono: Instant::now(),
        }
    }

    /// Stamp "now"
    pub fn now(&self) -> CaptureTime {
        let monotonic = Instant::now();
        let elapsed = monotonic.saturating_duration_since(self.start_mono);
        let wall = self.start_wall
            + ChronoDuration::from_std(elapsed).unwrap_or_else(|_| ChronoDuration::zero());
        CaptureTime { wall, monotonic }
    }
}

/// Raw CAN frame as delivered by the adapter
///
/// Fields are private so a frame cannot be altered after capture.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    timestamp: CaptureTime,
    arbitration_id: u32,
    is_extended: bool,
    payload: Vec<u8>,
}

impl RawFrame {
    /// Build a frame, validating identifier width and payload length
    pub fn new(
        timestamp: CaptureTime,
        arbitration_id: u32,
        is_extended: bool,
        payload: &[u8],
    ) -> Result<Self, FrameError> {
        let max_id = if is_extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
        if arbitration_id > max_id {
            return Err(FrameError::InvalidIdentifier {
                id: arbitration_id,
                extended: is_extended,
            });
        }
        if payload.len() > MAX_DLC as usize {
            return Err(FrameError::InvalidDlc(payload.len()));
        }

        Ok(Self {
            timestamp,
            arbitration_id,
            is_extended,
            payload: payload.to_vec(),
        })
    }

    pub fn timestamp(&self) -> CaptureTime {
        self.timestamp
    }

    /// CAN message ID (11-bit or 29-bit)
    pub fn arbitration_id(&self) -> u32 {
        self.arbitration_id
    }

    /// True if this is an extended (29-bit) CAN ID
    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    /// Data length code - equals the payload length for classic CAN
    pub fn data_length_code(&self) -> u8 {
        self.payload.len() as u8
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended {
            write!(f, "{:08X}", self.arbitration_id)?;
        } else {
            write!(f, "{:03X}", self.arbitration_id)?;
        }
        write!(f, " [{}]", self.payload.len())?;
        for byte in &self.payload {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Integer extracted from the payload before scaling
///
/// Unsigned signals keep all 64 bits so a set top bit is not read as a sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawValue {
    Unsigned(u64),
    Signed(i64),
}

impl RawValue {
    pub fn as_f64(self) -> f64 {
        match self {
            RawValue::Unsigned(v) => v as f64,
            RawValue::Signed(v) => v as f64,
        }
    }
}

/// A decoded signal with its physical value
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    /// Capture time of the frame the signal came from
    pub timestamp: CaptureTime,
    /// Signal name from the signal table
    pub name: String,
    /// Physical value after scale and offset
    pub numeric_value: f64,
    /// Raw integer before scaling (useful for debugging)
    pub raw_value: RawValue,
    /// Engineering unit (e.g., "V", "A", "%")
    pub unit: Option<String>,
    /// Arbitration ID of the source frame
    pub source_arbitration_id: u32,
}

/// Unit of persistence
///
/// Identity is (timestamp, car_id, arbitration_id | signal_name). Writing the
/// same identity twice overwrites in the store, so it is not an error here.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasurementRecord {
    /// One record per captured frame
    Raw {
        timestamp: Timestamp,
        car_id: String,
        arbitration_id: u32,
        data_length_code: u8,
        /// Lowercase hex, exactly two characters per payload byte
        payload_hex: String,
        is_extended: bool,
    },
    /// One record per decoded signal
    Decoded {
        timestamp: Timestamp,
        car_id: String,
        signal_name: String,
        numeric_value: f64,
    },
}

impl MeasurementRecord {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            MeasurementRecord::Raw { timestamp, .. } => *timestamp,
            MeasurementRecord::Decoded { timestamp, .. } => *timestamp,
        }
    }

    pub fn car_id(&self) -> &str {
        match self {
            MeasurementRecord::Raw { car_id, .. } => car_id,
            MeasurementRecord::Decoded { car_id, .. } => car_id,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, MeasurementRecord::Raw { .. })
    }
}

/// Ordered sequence of records handed from the buffer to the writer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    records: Vec<MeasurementRecord>,
}

impl Batch {
    pub fn new(records: Vec<MeasurementRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[MeasurementRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<MeasurementRecord> {
        self.records
    }

    /// Split into batches of at most `max_len` records, preserving order
    pub fn into_chunks(self, max_len: usize) -> Vec<Batch> {
        let max_len = max_len.max(1);
        if self.records.len() <= max_len {
            return vec![self];
        }

        let mut chunks = Vec::with_capacity(self.records.len() / max_len + 1);
        let mut records = self.records.into_iter().peekable();
        while records.peek().is_some() {
            chunks.push(Batch::new(records.by_ref().take(max_len).collect()));
        }
        chunks
    }
}
