//! Scripted in-process source
//!
//! Plays back a fixed script of frames and errors. Used by tests and by code
//! that embeds the pipeline with frames obtained elsewhere.

use super::FrameSource;
use crate::error::SourceError;
use crate::types::RawFrame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the script does when it runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WhenEmpty {
    Exhausted,
    Idle,
}

pub struct MemorySource {
    script: VecDeque<Result<RawFrame, SourceError>>,
    open_results: VecDeque<Result<(), SourceError>>,
    when_empty: WhenEmpty,
    is_open: bool,
    closed_flag: Option<Arc<AtomicBool>>,
}

impl MemorySource {
    /// Source that yields `frames` in order, then `Exhausted`
    pub fn from_frames(frames: Vec<RawFrame>) -> Self {
        Self::from_script(frames.into_iter().map(Ok).collect())
    }

    /// Source that yields each scripted frame or error in order
    pub fn from_script(script: Vec<Result<RawFrame, SourceError>>) -> Self {
        Self {
            script: script.into(),
            open_results: VecDeque::new(),
            when_empty: WhenEmpty::Exhausted,
            is_open: false,
            closed_flag: None,
        }
    }

    /// Builder method: scripted results for successive `open` calls (Ok once exhausted)
    pub fn with_open_results(mut self, results: Vec<Result<(), SourceError>>) -> Self {
        self.open_results = results.into();
        self
    }

    /// Builder method: behave like an idle bus (timeouts) once the script ends
    pub fn idle_when_empty(mut self) -> Self {
        self.when_empty = WhenEmpty::Idle;
        self
    }

    /// Builder method: set `flag` whenever the source is closed
    pub fn on_close(mut self, flag: Arc<AtomicBool>) -> Self {
        self.closed_flag = Some(flag);
        self
    }

    /// Scripted entries not yet consumed
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl FrameSource for MemorySource {
    fn open(&mut self) -> Result<(), SourceError> {
        self.open_results.pop_front().unwrap_or(Ok(()))?;
        self.is_open = true;
        Ok(())
    }

    fn read_next(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        if !self.is_open {
            return Err(SourceError::PortClosed("source is not open".to_string()));
        }

        match self.script.pop_front() {
            Some(Err(SourceError::PortClosed(reason))) => {
                self.is_open = false;
                Err(SourceError::PortClosed(reason))
            }
            Some(entry) => entry,
            None => match self.when_empty {
                WhenEmpty::Exhausted => Err(SourceError::Exhausted),
                WhenEmpty::Idle => {
                    std::thread::sleep(timeout.min(Duration::from_millis(10)));
                    Err(SourceError::Timeout)
                }
            },
        }
    }

    fn close(&mut self) {
        self.is_open = false;
        if let Some(flag) = &self.closed_flag {
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn describe(&self) -> String {
        format!("memory source ({} scripted entries)", self.script.len())
    }
}
