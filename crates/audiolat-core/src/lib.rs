//! Audiolat Core - duplex audio loop, marker injection and trigger decoding
//!
//! This library runs round-trip latency probes: it plays a known end-signal
//! on an output stream, records the input stream to a raw capture file, and
//! replaces the tail of the first capture read after each probe starts with a
//! begin-marker (continuing into following reads when it is longer), so the
//! delay can be read off the file afterwards.

pub mod audio;
pub mod config;
pub mod pcm;
pub mod session;
pub mod trigger;

pub use audio::driver::{DuplexDriver, LoopOutcome, LoopState, StopHandle};
pub use audio::engine::CpalProvider;
pub use audio::loopback::LoopbackProvider;
pub use audio::signal::{SignalBuffer, SignalKind};
pub use config::{SessionConfig, TriggerMode};
pub use session::{Session, SessionError, SessionReport, SessionStatus};
pub use trigger::{TriggerEvent, TriggerMailbox, TriggerSource};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default sample rate for playback and capture
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;
