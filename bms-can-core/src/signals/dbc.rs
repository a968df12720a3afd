//! DBC file parser
//!
//! Parses Vector DBC files and flattens them into signal table definitions.

use crate::error::TableError;
use crate::signals::table::{ByteOrder, SignalDefinition};
use std::path::Path;

/// DBC marks extended identifiers by setting bit 31 of the message ID
const DBC_EXTENDED_FLAG: u32 = 0x8000_0000;

/// Parse a DBC file and return signal definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<SignalDefinition>, TableError> {
    log::info!("Parsing DBC file: {:?}", path);

    // Read the DBC file as bytes first (handle non-UTF8 encodings)
    let bytes = std::fs::read(path).map_err(|source| TableError::Io {
        path: path.display().to_string(),
        source,
    })?;

    // Try UTF-8 first, then fall back to Latin-1/Windows-1252
    let dbc_content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    parse_dbc_str(&dbc_content)
        .map_err(|e| TableError::DbcParse(format!("{:?}: {}", path, e)))
}

/// Parse DBC content already held in memory
pub fn parse_dbc_str(content: &str) -> Result<Vec<SignalDefinition>, TableError> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes())
        .map_err(|e| TableError::DbcParse(format!("{:?}", e)))?;

    let mut definitions = Vec::new();
    for dbc_msg in dbc.messages() {
        definitions.extend(convert_message(dbc_msg));
    }

    log::info!("Parsed {} signals from DBC", definitions.len());
    Ok(definitions)
}

/// Flatten a can-dbc message into definitions
///
/// Multiplexed signals are skipped: the table has no notion of a multiplexer
/// switch. The multiplexer signal itself is kept.
fn convert_message(dbc_msg: &can_dbc::Message) -> Vec<SignalDefinition> {
    let raw_id = dbc_msg.message_id().0;
    let extended = raw_id & DBC_EXTENDED_FLAG != 0;
    let arbitration_id = raw_id & !DBC_EXTENDED_FLAG;

    let mut definitions = Vec::new();
    for dbc_sig in dbc_msg.signals() {
        if let can_dbc::MultiplexIndicator::MultiplexedSignal(_) = dbc_sig.multiplexer_indicator() {
            log::warn!(
                "Skipping multiplexed signal '{}' in message {} (0x{:X})",
                dbc_sig.name(),
                dbc_msg.message_name(),
                arbitration_id
            );
            continue;
        }
        definitions.push(convert_signal(dbc_sig, arbitration_id, extended));
    }
    definitions
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(dbc_sig: &can_dbc::Signal, arbitration_id: u32, extended: bool) -> SignalDefinition {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    SignalDefinition {
        arbitration_id,
        name: dbc_sig.name().to_string(),
        bit_offset: *dbc_sig.start_bit() as u16,
        bit_length: *dbc_sig.signal_size() as u16,
        byte_order,
        scale: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        signed: matches!(*dbc_sig.value_type(), can_dbc::ValueType::Signed),
        extended: Some(extended),
    }
}
