//! Versioned signal table
//!
//! Holds every signal definition known to the logger, keyed by arbitration ID.
//! One frame ID may carry many signals. The table is loaded once at startup and
//! never mutated afterwards, so new layouts only need a new table file.

use crate::error::TableError;
use crate::types::MAX_EXTENDED_ID;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDefinition {
    /// Arbitration ID of the frame carrying this signal
    pub arbitration_id: u32,
    /// Signal name, also used as the measurement name in the store
    pub name: String,
    /// Start bit: LSB position for little-endian, MSB position for big-endian
    pub bit_offset: u16,
    /// Length in bits
    pub bit_length: u16,
    /// Byte order for signal extraction
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Scale factor to convert raw value to physical value
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Offset to add after scaling
    #[serde(default)]
    pub offset: f64,
    /// Engineering unit (e.g., "V", "A", "%")
    #[serde(default)]
    pub unit: Option<String>,
    /// Interpret the raw bits as two's complement
    #[serde(default)]
    pub signed: bool,
    /// Only match standard (false) or extended (true) frames; None matches both
    #[serde(default)]
    pub extended: Option<bool>,
}

fn default_scale() -> f64 {
    1.0
}

impl SignalDefinition {
    /// Create an unsigned little-endian definition with unit scale
    pub fn new(arbitration_id: u32, name: impl Into<String>, bit_offset: u16, bit_length: u16) -> Self {
        Self {
            arbitration_id,
            name: name.into(),
            bit_offset,
            bit_length,
            byte_order: ByteOrder::LittleEndian,
            scale: 1.0,
            offset: 0.0,
            unit: None,
            signed: false,
            extended: None,
        }
    }

    /// Builder method: set scale and offset
    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    /// Builder method: set byte order
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Builder method: set unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Builder method: interpret as signed
    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Builder method: restrict to standard or extended frames
    pub fn with_frame_format(mut self, extended: bool) -> Self {
        self.extended = Some(extended);
        self
    }

    /// Check if this definition applies to a frame
    pub fn matches(&self, arbitration_id: u32, is_extended: bool) -> bool {
        self.arbitration_id == arbitration_id
            && self.extended.map_or(true, |ext| ext == is_extended)
    }

    fn validate(&self) -> Result<(), TableError> {
        let invalid = |reason: String| {
            TableError::InvalidSignalDefinition(format!("'{}' (0x{:X}): {}", self.name, self.arbitration_id, reason))
        };

        if self.name.trim().is_empty() {
            return Err(invalid("empty signal name".to_string()));
        }
        if self.arbitration_id > MAX_EXTENDED_ID {
            return Err(invalid("arbitration ID exceeds 29 bits".to_string()));
        }
        if self.bit_length == 0 || self.bit_length > 64 {
            return Err(invalid(format!("bit length {} outside 1..=64", self.bit_length)));
        }
        if !self.scale.is_finite() || !self.offset.is_finite() {
            return Err(invalid("scale and offset must be finite".to_string()));
        }
        match crate::decoder::required_bytes(self) {
            Some(bytes) if bytes <= 8 => Ok(()),
            _ => Err(invalid(format!(
                "bits {}+{} do not fit an 8-byte payload",
                self.bit_offset, self.bit_length
            ))),
        }
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    #[default]
    #[serde(alias = "intel")]
    LittleEndian,
    /// Big-endian (Motorola format)
    #[serde(alias = "motorola")]
    BigEndian,
}

/// On-disk layout of a TOML signal table
#[derive(Debug, Deserialize)]
struct TableFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    signals: Vec<SignalDefinition>,
}

/// The signal table
#[derive(Debug, Clone)]
pub struct SignalTable {
    /// Table version, reported at startup
    version: String,
    /// All definitions by arbitration ID
    /// Key: CAN ID, Value: signals carried by that ID in table order
    signals: HashMap<u32, Vec<SignalDefinition>>,
    /// Frames shorter than this are not decoded at all
    min_lengths: HashMap<u32, usize>,
}

impl SignalTable {
    /// Build a table from definitions, validating each one
    pub fn from_definitions(
        version: impl Into<String>,
        definitions: Vec<SignalDefinition>,
    ) -> Result<Self, TableError> {
        let mut signals: HashMap<u32, Vec<SignalDefinition>> = HashMap::new();

        for definition in definitions {
            definition.validate()?;
            signals
                .entry(definition.arbitration_id)
                .or_default()
                .push(definition);
        }

        Ok(Self {
            version: version.into(),
            signals,
            min_lengths: HashMap::new(),
        })
    }

    /// Parse a TOML signal table
    ///
    /// ```
    /// use bms_can_core::SignalTable;
    ///
    /// let table = SignalTable::from_toml_str(r#"
    ///     version = "pack-v1"
    ///
    ///     [[signals]]
    ///     arbitration_id = 0x100
    ///     name = "pack_voltage"
    ///     bit_offset = 0
    ///     bit_length = 16
    ///     scale = 0.01
    ///     unit = "V"
    /// "#).unwrap();
    ///
    /// assert_eq!(table.version(), "pack-v1");
    /// assert_eq!(table.signals_for(0x100).len(), 1);
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self, TableError> {
        let file: TableFile =
            toml::from_str(content).map_err(|e| TableError::Parse(e.to_string()))?;
        let version = file.version.unwrap_or_else(|| "unversioned".to_string());
        Self::from_definitions(version, file.signals)
    }

    /// Load a table from a `.toml` or `.dbc` file
    pub fn load(path: &Path) -> Result<Self, TableError> {
        log::info!("Loading signal table: {:?}", path);

        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());

        let table = match extension.as_deref() {
            Some("toml") => {
                let content = std::fs::read_to_string(path).map_err(|source| TableError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml_str(&content)?
            }
            Some("dbc") => {
                let definitions = super::dbc::parse_dbc_file(path)?;
                let version = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("unknown.dbc")
                    .to_string();
                Self::from_definitions(version, definitions)?
            }
            _ => return Err(TableError::UnsupportedFormat(format!("{:?}", path))),
        };

        let stats = table.stats();
        log::info!(
            "Signal table '{}' loaded: {} signals on {} frame IDs",
            table.version,
            stats.num_signals,
            stats.num_ids
        );
        Ok(table)
    }

    /// Custom Orion BMS telemetry frame packed into 8 bytes
    ///
    /// | bytes | signal | encoding |
    /// |-------|--------|----------|
    /// | 0-1 | pack_voltage | u16 LE, 0.1 V |
    /// | 2-3 | pack_current | i16 LE, 0.1 A |
    /// | 4 | soc | u8, 0.5 % |
    /// | 5 | avg_temp | u8, degC |
    /// | 6 | max_temp | u8, degC |
    /// | 7 | fault_flag | u8 bitfield |
    pub fn orion_telemetry(arbitration_id: u32, extended: bool) -> Result<Self, TableError> {
        let signal = |name: &str, bit_offset: u16, bit_length: u16| {
            SignalDefinition::new(arbitration_id, name, bit_offset, bit_length)
                .with_frame_format(extended)
        };

        let table = Self::from_definitions(
            "orion-telemetry-v1",
            vec![
                signal("pack_voltage", 0, 16).with_scaling(0.1, 0.0).with_unit("V"),
                signal("pack_current", 16, 16).signed().with_scaling(0.1, 0.0).with_unit("A"),
                signal("soc", 32, 8).with_scaling(0.5, 0.0).with_unit("%"),
                signal("avg_temp", 40, 8).with_unit("degC"),
                signal("max_temp", 48, 8).with_unit("degC"),
                signal("fault_flag", 56, 8),
            ],
        )?;
        Ok(table.with_min_length(arbitration_id, 8))
    }

    /// Builder method: ignore frames on this ID with fewer payload bytes
    pub fn with_min_length(mut self, arbitration_id: u32, bytes: usize) -> Self {
        self.min_lengths.insert(arbitration_id, bytes);
        self
    }

    /// Minimum payload length for an ID, if one is set
    pub fn min_length(&self, arbitration_id: u32) -> Option<usize> {
        self.min_lengths.get(&arbitration_id).copied()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// All definitions for a given CAN ID (empty if unknown)
    pub fn signals_for(&self, arbitration_id: u32) -> &[SignalDefinition] {
        self.signals
            .get(&arbitration_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains_id(&self, arbitration_id: u32) -> bool {
        self.signals.contains_key(&arbitration_id)
    }

    /// Find all definitions with a specific signal name
    pub fn find_signal(&self, name: &str) -> Vec<&SignalDefinition> {
        let mut found: Vec<_> = self
            .signals
            .values()
            .flat_map(|defs| defs.iter())
            .filter(|def| def.name == name)
            .collect();
        found.sort_by_key(|def| def.arbitration_id);
        found
    }

    /// Get all unique CAN IDs in the table
    pub fn arbitration_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.signals.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Get table statistics
    pub fn stats(&self) -> TableStats {
        TableStats {
            num_ids: self.signals.len(),
            num_signals: self.signals.values().map(Vec::len).sum(),
        }
    }
}

/// Table statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Number of distinct arbitration IDs
    pub num_ids: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table() {
        let table = SignalTable::from_definitions("empty", Vec::new()).unwrap();
        let stats = table.stats();
        assert_eq!(stats.num_ids, 0);
        assert_eq!(stats.num_signals, 0);
        assert!(table.signals_for(0x123).is_empty());
    }

    #[test]
    fn test_one_id_many_signals() {
        let table = SignalTable::orion_telemetry(0x6B0, false).unwrap();
        assert_eq!(table.signals_for(0x6B0).len(), 6);
        assert_eq!(table.arbitration_ids(), vec![0x6B0]);

        let found = table.find_signal("pack_current");
        assert_eq!(found.len(), 1);
        assert!(found[0].signed);
    }

    #[test]
    fn test_toml_table() {
        let table = SignalTable::from_toml_str(
            r#"
            version = "bench-1"

            [[signals]]
            arbitration_id = 0x100
            name = "pack_voltage"
            bit_offset = 0
            bit_length = 16
            scale = 0.01
            unit = "V"

            [[signals]]
            arbitration_id = 0x101
            name = "cell_max"
            bit_offset = 7
            bit_length = 16
            byte_order = "motorola"
            extended = false
            "#,
        )
        .unwrap();

        assert_eq!(table.version(), "bench-1");
        let voltage = &table.signals_for(0x100)[0];
        assert_eq!(voltage.byte_order, ByteOrder::LittleEndian);
        assert_eq!(voltage.scale, 0.01);
        assert!(!voltage.signed);

        let cell = &table.signals_for(0x101)[0];
        assert_eq!(cell.byte_order, ByteOrder::BigEndian);
        assert_eq!(cell.scale, 1.0);
        assert!(cell.matches(0x101, false));
        assert!(!cell.matches(0x101, true));
    }

    #[test]
    fn test_rejects_invalid_definitions() {
        let too_long = SignalDefinition::new(0x100, "x", 0, 65);
        assert!(SignalTable::from_definitions("t", vec![too_long]).is_err());

        let past_payload = SignalDefinition::new(0x100, "x", 60, 8);
        assert!(SignalTable::from_definitions("t", vec![past_payload]).is_err());

        let unnamed = SignalDefinition::new(0x100, " ", 0, 8);
        assert!(SignalTable::from_definitions("t", vec![unnamed]).is_err());

        let bad_scale = SignalDefinition::new(0x100, "x", 0, 8).with_scaling(f64::NAN, 0.0);
        assert!(SignalTable::from_definitions("t", vec![bad_scale]).is_err());
    }

    #[test]
    fn test_load_unsupported_extension() {
        let result = SignalTable::load(Path::new("signals.json"));
        assert!(matches!(result, Err(TableError::UnsupportedFormat(_))));
    }
}
