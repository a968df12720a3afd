//! Signal decoding engine
//!
//! Extracts signal values from raw CAN frames based on the signal table.
//! Handles bit extraction, endianness, sign extension and physical value
//! conversion. Decoding is pure: the frame is only read, never modified.

use crate::signals::{ByteOrder, SignalDefinition, SignalTable};
use crate::types::{DecodedSignal, RawFrame, RawValue};

/// Signal decoder - extracts signals from CAN frames
pub struct SignalDecoder;

impl SignalDecoder {
    /// Decode every signal the table defines for this frame
    ///
    /// Returns an empty vector when the arbitration ID is not in the table.
    /// Definitions whose bits fall outside the payload are skipped, and a
    /// frame shorter than the table's minimum length for its ID yields nothing.
    pub fn decode(frame: &RawFrame, table: &SignalTable) -> Vec<DecodedSignal> {
        if let Some(min) = table.min_length(frame.arbitration_id()) {
            if frame.payload().len() < min {
                log::debug!(
                    "Frame 0x{:X} has {} bytes, table expects at least {}",
                    frame.arbitration_id(),
                    frame.payload().len(),
                    min
                );
                return Vec::new();
            }
        }

        table
            .signals_for(frame.arbitration_id())
            .iter()
            .filter(|def| def.matches(frame.arbitration_id(), frame.is_extended()))
            .filter_map(|def| Self::decode_signal(frame, def))
            .collect()
    }

    /// Decode a single signal from CAN frame data
    fn decode_signal(frame: &RawFrame, signal: &SignalDefinition) -> Option<DecodedSignal> {
        let raw_value = extract_raw_value(frame.payload(), signal)?;
        let numeric_value = raw_value.as_f64() * signal.scale + signal.offset;

        Some(DecodedSignal {
            timestamp: frame.timestamp(),
            name: signal.name.clone(),
            numeric_value,
            raw_value,
            unit: signal.unit.clone(),
            source_arbitration_id: frame.arbitration_id(),
        })
    }
}

/// Number of payload bytes a definition needs
///
/// Returns None if the bit range cannot be addressed at all.
pub(crate) fn required_bytes(signal: &SignalDefinition) -> Option<usize> {
    let start_bit = signal.bit_offset as usize;
    let length = signal.bit_length as usize;
    if length == 0 {
        return None;
    }

    match signal.byte_order {
        ByteOrder::LittleEndian => Some((start_bit + length + 7) / 8),
        ByteOrder::BigEndian => {
            let mut bit = start_bit;
            for _ in 1..length {
                bit = next_motorola_bit(bit);
            }
            Some(bit / 8 + 1)
        }
    }
}

/// Extract the raw (sign-extended if configured) value of a signal
///
/// Returns None if the signal does not fit in the payload.
fn extract_raw_value(data: &[u8], signal: &SignalDefinition) -> Option<RawValue> {
    let length = signal.bit_length as usize;
    let required = required_bytes(signal)?;
    if required > data.len() {
        log::warn!(
            "Signal '{}' requires {} bytes but frame 0x{:X} only has {} bytes",
            signal.name,
            required,
            signal.arbitration_id,
            data.len()
        );
        return None;
    }

    let raw = match signal.byte_order {
        ByteOrder::LittleEndian => extract_little_endian(data, signal.bit_offset as usize, length),
        ByteOrder::BigEndian => extract_big_endian(data, signal.bit_offset as usize, length),
    };

    Some(if signal.signed {
        RawValue::Signed(sign_extend(raw, length))
    } else {
        RawValue::Unsigned(raw)
    })
}

/// Extract signal with little-endian (Intel) byte order
///
/// Little-endian format:
/// - Start bit points to the LSB (least significant bit)
/// - Bits are numbered from LSB to MSB within each byte
/// - Byte 0 is the first byte in the CAN frame
fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;

    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = bit_pos % 8;

        if byte_idx < data.len() {
            let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
            result |= (bit_value as u64) << i;
        }
    }

    result
}

/// Extract signal with big-endian (Motorola) byte order
///
/// Start bit is the MSB, numbered as in DBC files (bit 7 is the MSB of byte 0).
/// The walk goes down within a byte and continues at bit 7 of the next byte.
fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;
    let mut bit_pos = start_bit;

    for i in 0..length {
        let byte_idx = bit_pos / 8;
        let bit_in_byte = bit_pos % 8;

        if byte_idx < data.len() {
            let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
            result = (result << 1) | bit_value as u64;
        } else {
            result <<= 1;
        }

        if i + 1 < length {
            bit_pos = next_motorola_bit(bit_pos);
        }
    }

    result
}

fn next_motorola_bit(bit_pos: usize) -> usize {
    if bit_pos % 8 == 0 {
        bit_pos + 15
    } else {
        bit_pos - 1
    }
}

/// Sign-extend a value from N bits to 64 bits
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}
