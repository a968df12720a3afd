//! Replay of GVRET/SavvyCAN CSV captures
//!
//! Format: `Time Stamp,ID,Extended,Bus,LEN,D1,D2,D3,D4,D5,D6,D7,D8`, with the
//! time stamp in microseconds. A `Dir` column is accepted when the header
//! names it. Frames are re-stamped relative to the session start so a replay
//! looks like a live capture to the rest of the pipeline.

use super::FrameSource;
use crate::error::SourceError;
use crate::types::{CaptureTime, RawFrame, Timestamp};
use chrono::{Duration as ChronoDuration, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Column positions, detected from the header when present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CsvColumns {
    timestamp: usize,
    id: usize,
    extended: usize,
    dlc: usize,
    data_start: usize,
}

impl Default for CsvColumns {
    fn default() -> Self {
        Self {
            timestamp: 0,
            id: 1,
            extended: 2,
            dlc: 4,
            data_start: 5,
        }
    }
}

fn is_header(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("time") || lower.contains("id,")
}

fn parse_header(header: &str) -> CsvColumns {
    let mut columns = CsvColumns::default();
    for (i, col) in header.split(',').map(|s| s.trim().to_ascii_lowercase()).enumerate() {
        match col.as_str() {
            "time stamp" | "timestamp" | "time" => columns.timestamp = i,
            "id" => columns.id = i,
            "extended" | "ext" => columns.extended = i,
            "len" | "dlc" | "length" => columns.dlc = i,
            "d1" | "data1" | "byte1" => columns.data_start = i,
            _ => {}
        }
    }
    columns
}

fn parse_hex_u32(s: &str) -> Option<u32> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u32::from_str_radix(digits, 16).ok()
}

fn parse_id(s: &str) -> Option<u32> {
    parse_hex_u32(s).or_else(|| {
        if s.len() == 8 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            u32::from_str_radix(s, 16).ok()
        } else {
            s.parse().ok()
        }
    })
}

fn parse_byte(s: &str) -> Option<u8> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u8::from_str_radix(digits, 16).ok()
}

/// One parsed capture row
#[derive(Debug, Clone, PartialEq, Eq)]
struct CsvRow {
    timestamp_us: u64,
    id: u32,
    is_extended: bool,
    data: Vec<u8>,
}

fn parse_row(line: &str, columns: &CsvColumns) -> Option<CsvRow> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();

    let timestamp_us = parts.get(columns.timestamp)?.parse().ok()?;
    let id = parse_id(parts.get(columns.id)?)?;
    let is_extended = parts
        .get(columns.extended)
        .is_some_and(|s| s.eq_ignore_ascii_case("true") || *s == "1");
    let dlc: usize = parts.get(columns.dlc)?.parse().ok()?;

    let data = (0..dlc)
        .map(|i| parts.get(columns.data_start + i).and_then(|s| parse_byte(s)))
        .collect::<Option<Vec<u8>>>()?;

    Some(CsvRow {
        timestamp_us,
        id,
        is_extended,
        data,
    })
}

/// Replays a capture file as a finite Frame Source
pub struct ReplaySource {
    path: PathBuf,
    realtime: bool,
    lines: Option<Lines<BufReader<File>>>,
    columns: CsvColumns,
    line_number: usize,
    /// Row read ahead while waiting for its replay time
    pending: Option<CsvRow>,
    session: Option<ReplaySession>,
}

/// Anchors recorded time to the replay's start
#[derive(Debug, Clone, Copy)]
struct ReplaySession {
    start_wall: Timestamp,
    start_mono: Instant,
    first_us: u64,
    last_wall: Timestamp,
}

impl ReplaySession {
    fn offset(&self, timestamp_us: u64) -> Duration {
        Duration::from_micros(timestamp_us.saturating_sub(self.first_us))
    }
}

impl ReplaySource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            realtime: false,
            lines: None,
            columns: CsvColumns::default(),
            line_number: 0,
            pending: None,
            session: None,
        }
    }

    /// Builder method: pace frames by their recorded timestamps
    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    fn next_row(&mut self) -> Result<Option<CsvRow>, SourceError> {
        if let Some(row) = self.pending.take() {
            return Ok(Some(row));
        }

        let Some(lines) = self.lines.as_mut() else {
            return Err(SourceError::PortClosed("replay file is not open".to_string()));
        };

        for line in lines.by_ref() {
            self.line_number += 1;
            let line = line.map_err(|e| {
                SourceError::PortClosed(format!("{}: line {}: {}", self.path.display(), self.line_number, e))
            })?;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if self.line_number == 1 && is_header(trimmed) {
                self.columns = parse_header(trimmed);
                continue;
            }
            match parse_row(trimmed, &self.columns) {
                Some(row) => return Ok(Some(row)),
                None => log::debug!("{}: skipping malformed line {}", self.path.display(), self.line_number),
            }
        }

        Ok(None)
    }

    fn stamp(&mut self, row: &CsvRow) -> CaptureTime {
        let session = self.session.get_or_insert_with(|| {
            let now = Utc::now();
            ReplaySession {
                start_wall: now,
                start_mono: Instant::now(),
                first_us: row.timestamp_us,
                last_wall: now,
            }
        });

        let offset = ChronoDuration::from_std(session.offset(row.timestamp_us)).unwrap_or_else(|_| ChronoDuration::zero());
        // Keep stamps non-decreasing even if the capture is out of order
        let wall = (session.start_wall + offset).max(session.last_wall);
        session.last_wall = wall;

        CaptureTime {
            wall,
            monotonic: Instant::now(),
        }
    }
}

impl FrameSource for ReplaySource {
    fn open(&mut self) -> Result<(), SourceError> {
        let file = File::open(&self.path)
            .map_err(|e| SourceError::AdapterUnavailable(format!("{}: {}", self.path.display(), e)))?;
        self.lines = Some(BufReader::new(file).lines());
        self.columns = CsvColumns::default();
        self.line_number = 0;
        self.pending = None;
        self.session = None;
        Ok(())
    }

    fn read_next(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        loop {
            let Some(row) = self.next_row()? else {
                return Err(SourceError::Exhausted);
            };

            if self.realtime {
                if let Some(session) = &self.session {
                    let due = session.start_mono + session.offset(row.timestamp_us);
                    let now = Instant::now();
                    if due > now {
                        let wait = due - now;
                        if wait > timeout {
                            std::thread::sleep(timeout);
                            self.pending = Some(row);
                            return Err(SourceError::Timeout);
                        }
                        std::thread::sleep(wait);
                    }
                }
            }

            let timestamp = self.stamp(&row);
            match RawFrame::new(timestamp, row.id, row.is_extended, &row.data) {
                Ok(frame) => return Ok(frame),
                Err(e) => log::debug!("{}: skipping frame: {}", self.path.display(), e),
            }
        }
    }

    fn close(&mut self) {
        self.lines = None;
        self.pending = None;
    }

    fn describe(&self) -> String {
        format!("replay of {}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn capture(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn read_all(source: &mut ReplaySource) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        loop {
            match source.read_next(Duration::from_millis(100)) {
                Ok(frame) => frames.push(frame),
                Err(SourceError::Exhausted) => return frames,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
    }

    #[test]
    fn test_replays_gvret_capture() {
        let file = capture(
            "Time Stamp,ID,Extended,Bus,LEN,D1,D2,D3,D4,D5,D6,D7,D8\n\
             1000,0x000006B0,false,0,8,01,02,03,04,05,06,07,08\n\
             \n\
             2500,18FF50E5,true,0,2,AA,BB,,,,,,\n\
             3000,not-an-id,false,0,0,,,,,,,,\n\
             4000,0x00000100,false,0,0,,,,,,,,\n",
        );
        let mut source = ReplaySource::new(file.path());
        source.open().unwrap();
        let frames = read_all(&mut source);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].arbitration_id(), 0x6B0);
        assert_eq!(frames[0].payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frames[1].arbitration_id(), 0x18FF_50E5);
        assert!(frames[1].is_extended());
        assert_eq!(frames[1].payload(), &[0xAA, 0xBB]);
        assert_eq!(frames[2].data_length_code(), 0);

        // Relative timing is preserved in the stamps
        let gap = frames[1].timestamp().wall - frames[0].timestamp().wall;
        assert_eq!(gap.num_microseconds(), Some(1500));
    }

    #[test]
    fn test_header_with_direction_column() {
        let file = capture(
            "Time Stamp,ID,Extended,Dir,Bus,LEN,D1,D2\n\
             10,0x00000101,false,Rx,0,2,0A,0B\n",
        );
        let mut source = ReplaySource::new(file.path());
        source.open().unwrap();
        let frames = read_all(&mut source);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0x0A, 0x0B]);
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let file = capture(
            "5000,0x00000001,false,0,0\n\
             1000,0x00000002,false,0,0\n",
        );
        let mut source = ReplaySource::new(file.path());
        source.open().unwrap();
        let frames = read_all(&mut source);
        assert!(frames[1].timestamp().wall >= frames[0].timestamp().wall);
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let mut source = ReplaySource::new("/nonexistent/capture.csv");
        assert!(matches!(source.open(), Err(SourceError::AdapterUnavailable(_))));
    }

    #[test]
    fn test_realtime_pacing_times_out_then_delivers() {
        let file = capture(
            "0,0x00000001,false,0,0\n\
             200000,0x00000002,false,0,0\n",
        );
        let mut source = ReplaySource::new(file.path()).with_realtime(true);
        source.open().unwrap();

        assert_eq!(source.read_next(Duration::from_millis(10)).unwrap().arbitration_id(), 1);
        assert_eq!(source.read_next(Duration::from_millis(10)), Err(SourceError::Timeout));
        assert_eq!(source.read_next(Duration::from_secs(2)).unwrap().arbitration_id(), 2);
    }
}
