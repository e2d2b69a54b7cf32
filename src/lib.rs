//! Audiolat - round-trip audio latency probe
//!
//! This library re-exports the duplex loop, stream providers, triggers and
//! session controller from `audiolat-core`.

pub use audiolat_core::audio;
pub use audiolat_core::config;
pub use audiolat_core::pcm;
pub use audiolat_core::session;
pub use audiolat_core::trigger;

pub use audiolat_core::{
    CpalProvider, LoopbackProvider, Session, SessionConfig, SessionError, SessionReport,
    SessionStatus, StopHandle, TriggerMode,
};
pub use audiolat_core::{BUILD_DATE, DEFAULT_SAMPLE_RATE, VERSION};
