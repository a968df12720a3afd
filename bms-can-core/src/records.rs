//! Record builder
//!
//! Turns captured frames and decoded signals into measurement records.

use crate::config::OperatingMode;
use crate::decoder::SignalDecoder;
use crate::signals::SignalTable;
use crate::types::{DecodedSignal, MeasurementRecord, RawFrame};

/// Input to the builder: either a frame (raw mode) or the signals decoded from one
#[derive(Debug, Clone, Copy)]
pub enum BuildInput<'a> {
    Frame(&'a RawFrame),
    Signals(&'a [DecodedSignal]),
}

/// Build records for one input
///
/// A frame yields exactly one raw record; a signal set yields one decoded
/// record per signal.
pub fn build(input: BuildInput<'_>, car_id: &str) -> Vec<MeasurementRecord> {
    match input {
        BuildInput::Frame(frame) => vec![raw_record(frame, car_id)],
        BuildInput::Signals(signals) => signals
            .iter()
            .map(|signal| decoded_record(signal, car_id))
            .collect(),
    }
}

fn raw_record(frame: &RawFrame, car_id: &str) -> MeasurementRecord {
    MeasurementRecord::Raw {
        timestamp: frame.timestamp().wall,
        car_id: car_id.to_string(),
        arbitration_id: frame.arbitration_id(),
        data_length_code: frame.data_length_code(),
        payload_hex: hex::encode(frame.payload()),
        is_extended: frame.is_extended(),
    }
}

fn decoded_record(signal: &DecodedSignal, car_id: &str) -> MeasurementRecord {
    MeasurementRecord::Decoded {
        timestamp: signal.timestamp.wall,
        car_id: car_id.to_string(),
        signal_name: signal.name.clone(),
        numeric_value: signal.numeric_value,
    }
}

/// What one frame produced
#[derive(Debug, Default)]
pub struct FrameRecords {
    pub records: Vec<MeasurementRecord>,
    /// Signals decoded from the frame (decoded modes only)
    pub decoded_signals: usize,
    /// True when decoding was requested but the table had no entry for the ID
    pub unknown_id: bool,
}

/// Applies the operating mode to each captured frame
pub struct RecordBuilder {
    car_id: String,
    mode: OperatingMode,
    table: Option<SignalTable>,
}

impl RecordBuilder {
    /// Create a builder; decoded modes without a table behave like an empty table
    pub fn new(car_id: impl Into<String>, mode: OperatingMode, table: Option<SignalTable>) -> Self {
        if mode.decodes() && table.is_none() {
            log::warn!("Decoding requested without a signal table; no signals will be decoded");
        }
        Self {
            car_id: car_id.into(),
            mode,
            table,
        }
    }

    /// Build all records for one frame, raw first when both are written
    pub fn process(&self, frame: &RawFrame) -> FrameRecords {
        let mut out = FrameRecords::default();

        if self.mode.writes_raw() {
            out.records.extend(build(BuildInput::Frame(frame), &self.car_id));
        }

        if self.mode.decodes() {
            let signals = match &self.table {
                Some(table) => SignalDecoder::decode(frame, table),
                None => Vec::new(),
            };

            if signals.is_empty() {
                out.unknown_id = !self
                    .table
                    .as_ref()
                    .is_some_and(|t| t.contains_id(frame.arbitration_id()));
                log::trace!("No signals decoded from 0x{:X}", frame.arbitration_id());
            } else {
                out.decoded_signals = signals.len();
                out.records.extend(build(BuildInput::Signals(&signals), &self.car_id));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalDefinition;
    use crate::types::CaptureClock;

    fn frame(id: u32, payload: &[u8]) -> RawFrame {
        RawFrame::new(CaptureClock::start().now(), id, false, payload).unwrap()
    }

    fn voltage_table() -> SignalTable {
        SignalTable::from_definitions(
            "test",
            vec![SignalDefinition::new(0x100, "pack_voltage", 0, 16).with_scaling(0.01, 0.0)],
        )
        .unwrap()
    }

    #[test]
    fn test_raw_scenario() {
        let f = frame(0x100, &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        let records = build(BuildInput::Frame(&f), "car1");

        assert_eq!(records.len(), 1);
        match &records[0] {
            MeasurementRecord::Raw {
                car_id,
                arbitration_id,
                data_length_code,
                payload_hex,
                is_extended,
                timestamp,
            } => {
                assert_eq!(car_id, "car1");
                assert_eq!(*arbitration_id, 0x100);
                assert_eq!(*data_length_code, 8);
                assert_eq!(payload_hex, "0102030405060708");
                assert!(!is_extended);
                assert_eq!(*timestamp, f.timestamp().wall);
            }
            other => panic!("expected raw record, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_hex_is_fixed_width() {
        let f = frame(0x7, &[0x00, 0x0A]);
        match &build(BuildInput::Frame(&f), "car1")[0] {
            MeasurementRecord::Raw { payload_hex, .. } => assert_eq!(payload_hex, "000a"),
            other => panic!("expected raw record, got {:?}", other),
        }

        let empty = frame(0x7, &[]);
        match &build(BuildInput::Frame(&empty), "car1")[0] {
            MeasurementRecord::Raw { payload_hex, data_length_code, .. } => {
                assert_eq!(payload_hex, "");
                assert_eq!(*data_length_code, 0);
            }
            other => panic!("expected raw record, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_mode_is_one_to_one() {
        let builder = RecordBuilder::new("car1", OperatingMode::Raw, Some(voltage_table()));
        let total: usize = (0..50u32)
            .map(|i| builder.process(&frame(i, &[i as u8])).records.len())
            .sum();
        assert_eq!(total, 50);
    }

    #[test]
    fn test_decoded_mode_unknown_id() {
        let builder = RecordBuilder::new("car1", OperatingMode::Decoded, Some(voltage_table()));
        let out = builder.process(&frame(0x200, &[0; 8]));
        assert!(out.records.is_empty());
        assert!(out.unknown_id);
    }

    #[test]
    fn test_decoded_mode_records() {
        let builder = RecordBuilder::new("car1", OperatingMode::Decoded, Some(voltage_table()));
        let out = builder.process(&frame(0x100, &[0x10, 0x27]));

        assert_eq!(out.decoded_signals, 1);
        match &out.records[..] {
            [MeasurementRecord::Decoded { car_id, signal_name, numeric_value, .. }] => {
                assert_eq!(car_id, "car1");
                assert_eq!(signal_name, "pack_voltage");
                assert!((numeric_value - 100.0).abs() < 1e-9);
            }
            other => panic!("unexpected records {:?}", other),
        }
    }

    #[test]
    fn test_both_mode_raw_first() {
        let builder = RecordBuilder::new("car1", OperatingMode::Both, Some(voltage_table()));
        let out = builder.process(&frame(0x100, &[0x10, 0x27]));
        assert_eq!(out.records.len(), 2);
        assert!(out.records[0].is_raw());
        assert!(!out.records[1].is_raw());

        let unknown = builder.process(&frame(0x300, &[0x10]));
        assert_eq!(unknown.records.len(), 1);
        assert!(unknown.unknown_id);
    }
}
