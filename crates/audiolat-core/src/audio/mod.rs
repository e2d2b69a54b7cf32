//! Audio module
//!
//! - Stream abstraction shared by every backend ([`stream`])
//! - cpal device backend ([`engine`]) and in-process loopback ([`loopback`])
//! - End-signal and begin-marker buffers ([`signal`])
//! - Raw capture file writer ([`sink`])
//! - The duplex playback/capture loop ([`driver`])

pub mod driver;
pub mod engine;
pub mod loopback;
pub mod signal;
pub mod sink;
pub mod stream;
