//! Line protocol encoder
//!
//! Serializes records into the store's line-oriented write format, one line per
//! record:
//!
//! ```text
//! bms_can_raw,car_id=car1,arb_id=256,is_ext=false dlc=8i,data_hex="0102030405060708" 1700000000000000000
//! pack_voltage,car_id=car1 numeric_value=100.0 1700000000000000000
//! ```
//!
//! Timestamps are nanoseconds since the Unix epoch.

use crate::types::{Batch, MeasurementRecord, Timestamp};
use std::fmt::Write;

/// Measurement name for raw frames
pub const RAW_MEASUREMENT: &str = "bms_can_raw";

/// Encoded request body for one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedBatch {
    pub body: String,
    /// Lines written to `body`
    pub lines: usize,
    /// Records that could not be represented (non-finite values)
    pub skipped: usize,
}

/// Encodes records, optionally adding a static `source` tag
#[derive(Debug, Clone, Default)]
pub struct LineProtocolEncoder {
    source_tag: Option<String>,
}

impl LineProtocolEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: tag every line with `source=<tag>`
    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.source_tag = Some(tag.into());
        self
    }

    /// Encode a whole batch, newline separated
    pub fn encode_batch(&self, batch: &Batch) -> EncodedBatch {
        let mut encoded = EncodedBatch {
            body: String::with_capacity(batch.len() * 96),
            ..EncodedBatch::default()
        };

        for record in batch.records() {
            match self.encode_record(record) {
                Some(line) => {
                    if encoded.lines > 0 {
                        encoded.body.push('\n');
                    }
                    encoded.body.push_str(&line);
                    encoded.lines += 1;
                }
                None => encoded.skipped += 1,
            }
        }

        encoded
    }

    /// Encode one record; None if it cannot be represented
    pub fn encode_record(&self, record: &MeasurementRecord) -> Option<String> {
        let mut line = String::with_capacity(96);

        match record {
            MeasurementRecord::Raw {
                timestamp,
                car_id,
                arbitration_id,
                data_length_code,
                payload_hex,
                is_extended,
            } => {
                line.push_str(RAW_MEASUREMENT);
                self.push_tag(&mut line, "car_id", car_id);
                let _ = write!(line, ",arb_id={},is_ext={}", arbitration_id, is_extended);
                self.push_source(&mut line);
                let _ = write!(
                    line,
                    " dlc={}i,data_hex=\"{}\" {}",
                    data_length_code,
                    escape_string_field(payload_hex),
                    nanos(timestamp)
                );
            }
            MeasurementRecord::Decoded {
                timestamp,
                car_id,
                signal_name,
                numeric_value,
            } => {
                if !numeric_value.is_finite() {
                    log::warn!(
                        "Skipping non-finite value {} for signal '{}'",
                        numeric_value,
                        signal_name
                    );
                    return None;
                }
                line.push_str(&escape_measurement(signal_name));
                self.push_tag(&mut line, "car_id", car_id);
                self.push_source(&mut line);
                let _ = write!(
                    line,
                    " numeric_value={:?} {}",
                    numeric_value,
                    nanos(timestamp)
                );
            }
        }

        Some(line)
    }

    fn push_tag(&self, line: &mut String, key: &str, value: &str) {
        line.push(',');
        line.push_str(key);
        line.push('=');
        line.push_str(&escape_tag(value));
    }

    fn push_source(&self, line: &mut String) {
        // An empty tag value is not valid line protocol
        if let Some(source) = self.source_tag.as_deref().filter(|s| !s.is_empty()) {
            self.push_tag(line, "source", source);
        }
    }
}

fn nanos(timestamp: &Timestamp) -> i64 {
    timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| timestamp.timestamp().saturating_mul(1_000_000_000))
}

/// Escape a measurement name (commas and spaces)
pub fn escape_measurement(name: &str) -> String {
    escape(name, &[',', ' '])
}

/// Escape a tag key or value (commas, equals signs and spaces)
pub fn escape_tag(value: &str) -> String {
    escape(value, &[',', '=', ' '])
}

/// Escape a string field value (double quotes and backslashes)
pub fn escape_string_field(value: &str) -> String {
    escape(value, &['"', '\\'])
}

fn escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ts() -> Timestamp {
        Utc.timestamp_opt(1_700_000_000, 123).unwrap()
    }

    fn raw(car_id: &str) -> MeasurementRecord {
        MeasurementRecord::Raw {
            timestamp: ts(),
            car_id: car_id.to_string(),
            arbitration_id: 0x100,
            data_length_code: 8,
            payload_hex: "0102030405060708".to_string(),
            is_extended: false,
        }
    }

    fn decoded(name: &str, value: f64) -> MeasurementRecord {
        MeasurementRecord::Decoded {
            timestamp: ts(),
            car_id: "car1".to_string(),
            signal_name: name.to_string(),
            numeric_value: value,
        }
    }

    #[test]
    fn test_raw_line() {
        let line = LineProtocolEncoder::new().encode_record(&raw("car1")).unwrap();
        assert_eq!(
            line,
            "bms_can_raw,car_id=car1,arb_id=256,is_ext=false dlc=8i,data_hex=\"0102030405060708\" 1700000000000000123"
        );
    }

    #[test]
    fn test_decoded_line() {
        let line = LineProtocolEncoder::new()
            .encode_record(&decoded("pack_voltage", 100.0))
            .unwrap();
        assert_eq!(line, "pack_voltage,car_id=car1 numeric_value=100.0 1700000000000000123");
    }

    #[test]
    fn test_source_tag() {
        let encoder = LineProtocolEncoder::new().with_source_tag("candapter");
        let line = encoder.encode_record(&decoded("soc", 87.5)).unwrap();
        assert_eq!(line, "soc,car_id=car1,source=candapter numeric_value=87.5 1700000000000000123");
    }

    #[test]
    fn test_empty_source_tag_is_omitted() {
        let encoder = LineProtocolEncoder::new().with_source_tag("");
        let line = encoder.encode_record(&decoded("soc", 87.5)).unwrap();
        assert_eq!(line, "soc,car_id=car1 numeric_value=87.5 1700000000000000123");
    }

    #[test]
    fn test_escaping() {
        let line = LineProtocolEncoder::new().encode_record(&raw("car 1,a=b")).unwrap();
        assert!(line.starts_with("bms_can_raw,car_id=car\\ 1\\,a\\=b,arb_id=256,"));

        let line = LineProtocolEncoder::new()
            .encode_record(&decoded("cell voltage,max", 3.5))
            .unwrap();
        assert!(line.starts_with("cell\\ voltage\\,max,car_id=car1 "));

        assert_eq!(escape_string_field("a\"b\\c"), "a\\\"b\\\\c");
    }

    #[test]
    fn test_batch_skips_non_finite() {
        let batch = Batch::new(vec![
            decoded("a", 1.0),
            decoded("b", f64::NAN),
            decoded("c", f64::INFINITY),
            raw("car1"),
        ]);
        let encoded = LineProtocolEncoder::new().encode_batch(&batch);
        assert_eq!(encoded.lines, 2);
        assert_eq!(encoded.skipped, 2);
        assert_eq!(encoded.body.lines().count(), 2);
        assert!(!encoded.body.ends_with('\n'));
    }
}
