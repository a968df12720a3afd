//! SocketCAN interfaces (Linux)
//!
//! Opens a classic CAN raw socket on a configured interface such as `can0`.
//! The interface must already be up at the right bitrate; configuring it is
//! left to the system.

use super::FrameSource;
use crate::error::SourceError;
use crate::types::{CaptureClock, RawFrame};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket};
use std::io::ErrorKind;
use std::time::Duration;

pub struct SocketCanSource {
    interface: String,
    socket: Option<CanSocket>,
    clock: CaptureClock,
}

impl SocketCanSource {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            socket: None,
            clock: CaptureClock::start(),
        }
    }
}

impl FrameSource for SocketCanSource {
    fn open(&mut self) -> Result<(), SourceError> {
        let socket = CanSocket::open(&self.interface)
            .map_err(|e| SourceError::AdapterUnavailable(format!("{}: {}", self.interface, e)))?;
        self.socket = Some(socket);
        self.clock = CaptureClock::start();
        Ok(())
    }

    fn read_next(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(SourceError::PortClosed("socket is not open".to_string()));
        };

        // A zero timeout would block forever
        let timeout = timeout.max(Duration::from_millis(1));
        if let Err(e) = socket.set_read_timeout(timeout) {
            self.socket = None;
            return Err(SourceError::PortClosed(e.to_string()));
        }

        loop {
            let Some(socket) = self.socket.as_ref() else {
                return Err(SourceError::PortClosed("socket is not open".to_string()));
            };
            match socket.read_frame() {
                Ok(CanFrame::Data(frame)) => {
                    let id = frame.raw_id() & 0x1FFF_FFFF;
                    match RawFrame::new(self.clock.now(), id, frame.is_extended(), frame.data()) {
                        Ok(raw) => return Ok(raw),
                        Err(e) => log::debug!("Discarding frame from {}: {}", self.interface, e),
                    }
                }
                // Remote and error frames carry no telemetry; the timeout is
                // per read so a flood of them can extend the wait
                Ok(CanFrame::Remote(_)) | Ok(CanFrame::Error(_)) => {}
                Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Err(SourceError::Timeout);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("SocketCAN {} lost: {}", self.interface, e);
                    self.socket = None;
                    return Err(SourceError::PortClosed(e.to_string()));
                }
            }
        }
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn describe(&self) -> String {
        format!("SocketCAN interface {}", self.interface)
    }
}
