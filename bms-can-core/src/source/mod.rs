//! Frame Sources
//!
//! One implementation per adapter family, chosen by [`AdapterConfig`]. A source
//! is opened once, read with a bounded timeout until it fails or runs out, and
//! closed. After `PortClosed` the handle is unusable until `open` succeeds
//! again.

pub mod memory;
pub mod replay;
pub mod slcan;
#[cfg(target_os = "linux")]
pub mod socketcan;

pub use memory::MemorySource;
pub use replay::ReplaySource;
pub use slcan::SlcanSource;

use crate::error::SourceError;
use crate::types::RawFrame;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Capture capability shared by all adapters
pub trait FrameSource: Send {
    /// Acquire the adapter; fails with `AdapterUnavailable`
    fn open(&mut self) -> Result<(), SourceError>;

    /// Next frame in adapter order, waiting at most `timeout`
    fn read_next(&mut self, timeout: Duration) -> Result<RawFrame, SourceError>;

    /// Release the adapter. Safe to call more than once.
    fn close(&mut self);

    /// Human-readable description for log messages
    fn describe(&self) -> String;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn open(&mut self) -> Result<(), SourceError> {
        (**self).open()
    }

    fn read_next(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        (**self).read_next(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Bus settings shared by adapters that configure the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Nominal bus bitrate in bits/second
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

fn default_bitrate() -> u32 {
    500_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
        }
    }
}

/// Adapter selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AdapterConfig {
    /// Lawicel ASCII protocol over a serial port
    Slcan {
        port: String,
        #[serde(default = "default_serial_baud")]
        serial_baud: u32,
        /// Open the channel without acknowledging frames (M1)
        #[serde(default = "default_listen_only")]
        listen_only: bool,
    },
    /// Linux SocketCAN network interface
    SocketCan { interface: String },
    /// GVRET/SavvyCAN CSV capture file
    Replay {
        path: String,
        /// Pace frames by their recorded timestamps
        #[serde(default)]
        realtime: bool,
    },
}

fn default_serial_baud() -> u32 {
    115_200
}

fn default_listen_only() -> bool {
    true
}

impl AdapterConfig {
    /// Override the port or interface name (CLI `--port`)
    pub fn with_port(self, port: impl Into<String>) -> Self {
        let port = port.into();
        match self {
            AdapterConfig::Slcan {
                serial_baud,
                listen_only,
                ..
            } => AdapterConfig::Slcan {
                port,
                serial_baud,
                listen_only,
            },
            AdapterConfig::SocketCan { .. } => AdapterConfig::SocketCan { interface: port },
            AdapterConfig::Replay { realtime, .. } => AdapterConfig::Replay { path: port, realtime },
        }
    }
}

/// Build an (unopened) source for the configured adapter
pub fn create_source(adapter: &AdapterConfig, bus: &BusConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    match adapter {
        AdapterConfig::Slcan {
            port,
            serial_baud,
            listen_only,
        } => Ok(Box::new(
            SlcanSource::new(port.clone(), bus.bitrate)?
                .with_serial_baud(*serial_baud)
                .with_listen_only(*listen_only),
        )),
        #[cfg(target_os = "linux")]
        AdapterConfig::SocketCan { interface } => Ok(Box::new(socketcan::SocketCanSource::new(interface.clone()))),
        #[cfg(not(target_os = "linux"))]
        AdapterConfig::SocketCan { interface } => Err(SourceError::AdapterUnavailable(format!(
            "SocketCAN interface {} requested but SocketCAN is only available on Linux",
            interface
        ))),
        AdapterConfig::Replay { path, realtime } => Ok(Box::new(ReplaySource::new(path).with_realtime(*realtime))),
    }
}

/// Open source that is closed when the guard goes out of scope
pub struct SourceGuard<S: FrameSource> {
    source: S,
}

impl<S: FrameSource> SourceGuard<S> {
    /// Open `source` and wrap it
    pub fn open(mut source: S) -> Result<Self, SourceError> {
        source.open()?;
        log::info!("Opened {}", source.describe());
        Ok(Self { source })
    }
}

impl<S: FrameSource> Deref for SourceGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.source
    }
}

impl<S: FrameSource> DerefMut for SourceGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: FrameSource> Drop for SourceGuard<S> {
    fn drop(&mut self) {
        self.source.close();
        log::info!("Closed {}", self.source.describe());
    }
}
