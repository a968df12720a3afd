//! SLCAN (Lawicel) serial adapters
//!
//! Covers CANdapter, CANable and other USB-CAN adapters speaking the Lawicel
//! ASCII protocol. Received frames arrive as `\r`-terminated lines:
//!
//! ```text
//! Standard: t<ID:3hex><DLC:1hex><DATA:2hex*DLC>\r
//! Extended: T<ID:8hex><DLC:1hex><DATA:2hex*DLC>\r
//! RTR:      r<ID:3hex><DLC:1hex>\r / R<ID:8hex><DLC:1hex>\r
//! ```
//!
//! Command acknowledgements (`\r`, `z`, `Z`) and the bell byte the adapter
//! sends on a failed command are not frames and are skipped.

use super::FrameSource;
use crate::error::SourceError;
use crate::types::{CaptureClock, RawFrame, MAX_DLC};
use serialport::{ClearBuffer, SerialPort};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// Bitrate commands S0-S8
const SLCAN_BITRATES: [(u32, &str); 9] = [
    (10_000, "S0"),
    (20_000, "S1"),
    (50_000, "S2"),
    (100_000, "S3"),
    (125_000, "S4"),
    (250_000, "S5"),
    (500_000, "S6"),
    (750_000, "S7"),
    (1_000_000, "S8"),
];

/// Longest valid line: `T` + 8 id + 1 dlc + 16 data + optional 4 timestamp
const MAX_LINE_LEN: usize = 30;

/// Error response to a command
const BELL: u8 = 0x07;

/// Find the bitrate command for a bus bitrate
pub fn find_bitrate_command(bitrate: u32) -> Result<&'static str, SourceError> {
    SLCAN_BITRATES
        .iter()
        .find(|(rate, _)| *rate == bitrate)
        .map(|(_, cmd)| *cmd)
        .ok_or_else(|| {
            let valid: Vec<String> = SLCAN_BITRATES.iter().map(|(r, _)| r.to_string()).collect();
            SourceError::AdapterUnavailable(format!(
                "Invalid CAN bitrate {}. Valid bitrates: {}",
                bitrate,
                valid.join(", ")
            ))
        })
}

/// A data frame parsed from one SLCAN line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlcanFrame {
    pub id: u32,
    pub is_extended: bool,
    pub data: Vec<u8>,
}

/// Parse one line (without the terminator)
///
/// Returns None for remote frames, acknowledgements and malformed lines.
///
/// ```
/// use bms_can_core::source::slcan::parse_slcan_line;
///
/// let frame = parse_slcan_line("t6B02AABB").unwrap();
/// assert_eq!(frame.id, 0x6B0);
/// assert_eq!(frame.data, vec![0xAA, 0xBB]);
/// assert!(parse_slcan_line("r1230").is_none());
/// ```
pub fn parse_slcan_line(line: &str) -> Option<SlcanFrame> {
    let bytes = line.as_bytes();
    let is_extended = match bytes.first()? {
        b't' => false,
        b'T' => true,
        _ => return None,
    };

    let id_len = if is_extended { 8 } else { 3 };
    let data_start = 1 + id_len + 1;
    if bytes.len() < data_start {
        return None;
    }

    let id = u32::from_str_radix(line.get(1..1 + id_len)?, 16).ok()?;
    let dlc = (bytes[1 + id_len] as char).to_digit(16)? as usize;
    if dlc > MAX_DLC as usize {
        return None;
    }

    let data_end = data_start + dlc * 2;
    let data = hex::decode(line.get(data_start..data_end)?).ok()?;

    Some(SlcanFrame { id, is_extended, data })
}

/// Splits the serial byte stream into lines
#[derive(Debug, Default)]
struct LineAssembler {
    partial: Vec<u8>,
    lines: VecDeque<String>,
}

impl LineAssembler {
    fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match b {
                b'\r' | b'\n' => {
                    if !self.partial.is_empty() {
                        let line = String::from_utf8_lossy(&self.partial).into_owned();
                        self.lines.push_back(line);
                        self.partial.clear();
                    }
                }
                BELL => {
                    log::debug!("SLCAN adapter reported a command error");
                    self.partial.clear();
                }
                _ => {
                    if self.partial.len() >= MAX_LINE_LEN {
                        log::debug!("Discarding overlong SLCAN line");
                        self.partial.clear();
                    }
                    self.partial.push(b);
                }
            }
        }
    }

    fn next_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }
}

/// Serial-line CAN adapter
pub struct SlcanSource {
    port_name: String,
    serial_baud: u32,
    bitrate: u32,
    bitrate_command: &'static str,
    listen_only: bool,
    port: Option<Box<dyn SerialPort>>,
    clock: CaptureClock,
    assembler: LineAssembler,
}

impl SlcanSource {
    /// Create a source for `port`; fails if the bitrate has no SLCAN command
    pub fn new(port: impl Into<String>, bitrate: u32) -> Result<Self, SourceError> {
        Ok(Self {
            port_name: port.into(),
            serial_baud: 115_200,
            bitrate,
            bitrate_command: find_bitrate_command(bitrate)?,
            listen_only: true,
            port: None,
            clock: CaptureClock::start(),
            assembler: LineAssembler::default(),
        })
    }

    /// Builder method: serial baud rate (ignored by USB CDC adapters)
    pub fn with_serial_baud(mut self, baud: u32) -> Self {
        self.serial_baud = baud;
        self
    }

    /// Builder method: listen-only (M1) or normal (M0) mode
    pub fn with_listen_only(mut self, listen_only: bool) -> Self {
        self.listen_only = listen_only;
        self
    }

    fn send_command(port: &mut Box<dyn SerialPort>, command: &str) -> std::io::Result<()> {
        port.write_all(command.as_bytes())?;
        port.write_all(b"\r")?;
        port.flush()
    }

    fn port_closed(&mut self, reason: String) -> SourceError {
        log::warn!("{} lost: {}", self.describe(), reason);
        self.port = None;
        self.assembler = LineAssembler::default();
        SourceError::PortClosed(reason)
    }
}

impl FrameSource for SlcanSource {
    fn open(&mut self) -> Result<(), SourceError> {
        self.close();

        let mut port = serialport::new(&self.port_name, self.serial_baud)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| SourceError::AdapterUnavailable(format!("{}: {}", self.port_name, e)))?;

        let mode = if self.listen_only { "M1" } else { "M0" };
        // Close any channel left open by a previous session before configuring
        let _ = Self::send_command(&mut port, "C");
        for command in [self.bitrate_command, mode, "O"] {
            Self::send_command(&mut port, command).map_err(|e| {
                SourceError::AdapterUnavailable(format!("{}: command {} failed: {}", self.port_name, command, e))
            })?;
        }
        let _ = port.clear(ClearBuffer::Input);

        log::debug!(
            "SLCAN channel open on {} ({} bit/s, {})",
            self.port_name,
            self.bitrate,
            if self.listen_only { "listen-only" } else { "normal" }
        );
        self.port = Some(port);
        self.clock = CaptureClock::start();
        self.assembler = LineAssembler::default();
        Ok(())
    }

    fn read_next(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];

        loop {
            while let Some(line) = self.assembler.next_line() {
                let Some(parsed) = parse_slcan_line(&line) else {
                    log::trace!("Skipping SLCAN line {:?}", line);
                    continue;
                };
                match RawFrame::new(self.clock.now(), parsed.id, parsed.is_extended, &parsed.data) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => log::debug!("Discarding SLCAN frame {:?}: {}", line, e),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SourceError::Timeout);
            }

            let Some(port) = self.port.as_mut() else {
                return Err(SourceError::PortClosed("port is not open".to_string()));
            };
            if let Err(e) = port.set_timeout(deadline - now) {
                return Err(self.port_closed(e.to_string()));
            }

            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => self.assembler.feed(&buf[..n]),
                Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(self.port_closed(e.to_string())),
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            let _ = Self::send_command(&mut port, "C");
        }
    }

    fn describe(&self) -> String {
        format!("SLCAN adapter {} @ {} bit/s", self.port_name, self.bitrate)
    }
}
