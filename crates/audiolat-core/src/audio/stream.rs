//! Duplex stream provider contract
//!
//! The loop only needs four things from an audio backend:
//! - a non-blocking playback sink of 16-bit mono PCM bytes
//! - a non-blocking capture source of 16-bit mono PCM bytes
//! - start/stop control, with release on drop
//! - optional hardware timestamps
//!
//! Playback and capture handles are `Send` so they can move to the loop
//! thread; the control guard stays with the session controller because some
//! backends' stream objects must not leave the thread that created them.

use serde::Serialize;
use thiserror::Error;

/// Bytes per sample (16-bit PCM)
pub const BYTES_PER_SAMPLE: usize = 2;

/// Errors reported by stream providers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    Open(String),

    #[error("Unsupported stream configuration: {0}")]
    Unsupported(String),

    #[error("Failed to start or stop stream: {0}")]
    Control(String),

    #[error("Device error: {0}")]
    Device(String),
}

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Playback,
    Capture,
}

/// Parameters for one direction of the duplex pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub sample_rate: u32,
    /// Always 1 for this tool
    pub channel_count: u16,
    /// Always 16 for this tool
    pub bit_depth: u16,
    /// 0 = device minimum
    pub buffer_size_bytes: usize,
    pub direction: Direction,
    /// Device name substring, `None` = default device
    pub device: Option<String>,
}

impl StreamConfig {
    pub fn mono16(sample_rate: u32, buffer_size_bytes: usize, direction: Direction) -> Self {
        Self {
            sample_rate,
            channel_count: 1,
            bit_depth: 16,
            buffer_size_bytes,
            direction,
            device: None,
        }
    }

    pub fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    /// Buffer size in frames, `None` for the device minimum
    pub fn buffer_frames(&self) -> Option<u32> {
        match self.buffer_size_bytes {
            0 => None,
            bytes => Some((bytes / BYTES_PER_SAMPLE).max(1) as u32),
        }
    }
}

/// Both directions of a duplex session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplexConfig {
    pub playback: StreamConfig,
    pub capture: StreamConfig,
}

/// A frame position paired with the host clock time it was observed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamTimestamp {
    pub frame_position: u64,
    pub host_time_ns: u64,
}

/// Non-blocking playback end
pub trait PlaybackStream: Send {
    /// Queue up to `bytes.len()` bytes; returns how many were accepted
    ///
    /// `Ok(0)` means the device buffer is full right now. Only whole samples
    /// are accepted.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, StreamError>;

    /// Latest hardware timestamp, if the backend provides one
    fn timestamp(&self) -> Option<StreamTimestamp> {
        None
    }

    /// Bytes queued but not yet played, if the backend can tell
    fn queued_bytes(&self) -> Option<usize> {
        None
    }

    /// `Err` once the device has left the active state
    fn health(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    /// Underruns observed so far
    fn xruns(&self) -> u64 {
        0
    }
}

/// Non-blocking capture end
pub trait CaptureStream: Send {
    /// Copy up to `buf.len()` captured bytes; returns how many were read
    ///
    /// `Ok(0)` means nothing is available yet. Only whole samples are returned.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError>;

    fn timestamp(&self) -> Option<StreamTimestamp> {
        None
    }

    fn health(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    /// Overruns observed so far
    fn xruns(&self) -> u64 {
        0
    }
}

/// Start/stop control for an opened duplex pair
///
/// Dropping the guard releases the streams.
pub trait StreamControl {
    fn start(&mut self) -> Result<(), StreamError>;
    fn stop(&mut self) -> Result<(), StreamError>;

    /// Human-readable description of the negotiated settings
    fn describe(&self) -> String {
        String::new()
    }
}

/// An opened duplex pair
pub struct OpenedDuplex<P, C, G> {
    pub playback: P,
    pub capture: C,
    pub control: G,
}

/// Opens playback and capture streams sharing one sample rate
pub trait StreamProvider {
    type Playback: PlaybackStream + 'static;
    type Capture: CaptureStream + 'static;
    type Control: StreamControl;

    fn open(
        &self,
        config: &DuplexConfig,
    ) -> Result<OpenedDuplex<Self::Playback, Self::Capture, Self::Control>, StreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_frames() {
        let cfg = StreamConfig::mono16(16000, 0, Direction::Capture);
        assert_eq!(cfg.buffer_frames(), None);
        let cfg = StreamConfig::mono16(16000, 32, Direction::Playback);
        assert_eq!(cfg.buffer_frames(), Some(16));
        assert_eq!(cfg.channel_count, 1);
        assert_eq!(cfg.bit_depth, 16);
    }
}
