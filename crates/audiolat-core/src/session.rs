//! Session controller
//!
//! Runs one measurement end to end:
//! validate config, open the capture file, open and start the duplex
//! streams, connect the trigger source, run the loop on its own thread, then
//! stop everything and report. Audio content is never interpreted here.
//!
//! Resources are released on every exit path: the stream control guard, the
//! trigger handles and the sink all drop at the end of [`Session::run`], and a
//! capture file created for a session that never started is removed.

use crate::audio::driver::{DuplexDriver, LoopCounters, LoopOutcome, LoopState, StopHandle};
use crate::audio::signal::{begin_marker, SignalBuffer, SignalError};
use crate::audio::sink::{CaptureSink, SinkError, SinkStats};
use crate::audio::stream::{
    CaptureStream, OpenedDuplex, PlaybackStream, StreamControl, StreamError, StreamProvider,
    StreamTimestamp,
};
use crate::config::{
    ConfigError, ContentType, PerformanceMode, SessionConfig, TriggerMode, Usage,
};
use crate::trigger::external::{MidiError, MidiTriggerListener, PortSelector};
use crate::trigger::usb::{UsbMidiPoller, UsbPollerHandle, DEFAULT_PACKET_SIZE};
use crate::trigger::TriggerMailbox;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use thread_priority::ThreadPriority;

/// Session outcome code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Success,
    DeviceOpenFailed,
    SinkOpenFailed,
    StreamError,
    /// Capture write failed with `strict_sink` set
    SinkWriteFailed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to load signal: {0}")]
    Signal(#[from] SignalError),

    #[error("Failed to open capture file: {0}")]
    SinkOpen(#[source] SinkError),

    #[error("Failed to open audio device: {0}")]
    DeviceOpen(#[source] StreamError),

    #[error("Failed to open MIDI trigger: {0}")]
    Midi(#[from] MidiError),

    #[error("Failed to open USB-MIDI source {path}: {source}")]
    UsbOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Trigger mode {0:?} needs a device path")]
    MissingTriggerDevice(TriggerMode),

    #[error("Failed to spawn loop thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Loop thread panicked: {0}")]
    LoopPanicked(String),
}

impl SessionError {
    /// Status code for a session that failed before producing a report
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionError::SinkOpen(_) => SessionStatus::SinkOpenFailed,
            SessionError::Spawn(_) | SessionError::LoopPanicked(_) => SessionStatus::StreamError,
            _ => SessionStatus::DeviceOpenFailed,
        }
    }
}

/// The two probe signals of a session
#[derive(Debug, Clone)]
pub struct SessionSignals {
    pub begin: SignalBuffer,
    pub end: SignalBuffer,
}

impl SessionSignals {
    pub fn new(begin: SignalBuffer, end: SignalBuffer) -> Self {
        Self { begin, end }
    }

    /// Load signal files or generate the built-in ones, then apply the end gain
    pub fn load(config: &SessionConfig) -> Result<Self, SignalError> {
        let rate = config.sample_rate;
        let begin = match &config.begin_signal_path {
            Some(path) => SignalBuffer::load(path, rate)?,
            None => begin_marker(rate),
        };
        let end = match &config.end_signal_path {
            Some(path) => SignalBuffer::load(path, rate)?,
            None => config.signal.generate(rate),
        };
        let end = if config.end_gain_db != 0.0 {
            end.with_gain_db(config.end_gain_db)
        } else {
            end
        };
        Ok(Self { begin, end })
    }
}

/// Start/stop timestamps of one stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamTimestamps {
    pub start: Option<StreamTimestamp>,
    pub stop: Option<StreamTimestamp>,
}

/// Summary of a finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub status: SessionStatus,
    /// Stopped by request before the timeout
    pub cancelled: bool,
    pub error: Option<String>,
    pub output: PathBuf,
    pub started_at: String,
    pub wall_time_ms: u64,
    pub sample_rate: u32,
    pub timeout_sec: f64,
    pub usage: Usage,
    pub content_type: ContentType,
    pub performance_mode: PerformanceMode,
    pub frames_captured: u64,
    pub captured_sec: f64,
    pub counters: LoopCounters,
    pub sink: SinkStats,
    pub triggers_posted: u64,
    pub triggers_ignored: u64,
    pub playback_xruns: u64,
    pub capture_xruns: u64,
    pub playback: StreamTimestamps,
    pub capture: StreamTimestamps,
    pub streams: String,
    pub version: String,
}

impl SessionReport {
    /// Report path for a capture file: `<output>.json`
    pub fn sidecar_path(output: &Path) -> PathBuf {
        let mut name = output.as_os_str().to_owned();
        name.push(".json");
        PathBuf::from(name)
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Diagnostic offset between the two streams' start timestamps
    ///
    /// Positive when capture started later than playback on the host clock.
    pub fn start_skew_ms(&self) -> Option<f64> {
        let p = self.playback.start?;
        let c = self.capture.start?;
        Some((c.host_time_ns as f64 - p.host_time_ns as f64) / 1_000_000.0)
    }
}

/// Trigger producers kept alive for the length of a session
enum ActiveTriggers {
    Timer,
    Midi(MidiTriggerListener),
    Usb(UsbPollerHandle),
}

impl ActiveTriggers {
    fn close(self) {
        match self {
            ActiveTriggers::Timer => {}
            ActiveTriggers::Midi(mut listener) => listener.close(),
            ActiveTriggers::Usb(mut handle) => handle.stop(),
        }
    }
}

/// One measurement session
pub struct Session {
    config: SessionConfig,
    signals: SessionSignals,
    mailbox: TriggerMailbox,
    stop: StopHandle,
}

impl Session {
    /// Validate the config; nothing is opened yet
    pub fn new(config: SessionConfig, signals: SessionSignals) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            config,
            signals,
            mailbox: TriggerMailbox::new(),
            stop: StopHandle::new(),
        })
    }

    /// Validate the config and load its signals
    pub fn from_config(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let signals = SessionSignals::load(&config)?;
        Self::new(config, signals)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Mailbox for external trigger producers
    pub fn mailbox(&self) -> TriggerMailbox {
        self.mailbox.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn open_triggers(&self) -> Result<ActiveTriggers, SessionError> {
        match self.config.trigger {
            TriggerMode::Timer => Ok(ActiveTriggers::Timer),
            TriggerMode::Midi => {
                let selector = PortSelector::parse(self.config.midi_port.as_deref().unwrap_or(""));
                let listener = MidiTriggerListener::open(&selector, self.mailbox())?;
                Ok(ActiveTriggers::Midi(listener))
            }
            TriggerMode::Usb => {
                let path = self
                    .config
                    .usb_device
                    .as_ref()
                    .ok_or(SessionError::MissingTriggerDevice(TriggerMode::Usb))?;
                let file = std::fs::File::open(path).map_err(|source| SessionError::UsbOpen {
                    path: path.clone(),
                    source,
                })?;
                let handle = UsbMidiPoller::new(DEFAULT_PACKET_SIZE)
                    .start(file, self.mailbox())
                    .map_err(SessionError::Spawn)?;
                tracing::info!(path = %path.display(), "USB-MIDI poller started");
                Ok(ActiveTriggers::Usb(handle))
            }
        }
    }

    /// Run the session to completion
    ///
    /// Failures before the loop starts return `Err` (see
    /// [`SessionError::status`]); once the loop has run, the outcome is in
    /// the report's status.
    pub fn run<S: StreamProvider>(&self, provider: &S) -> Result<SessionReport, SessionError> {
        self.config.validate()?;
        self.config.log_settings();

        let started_at = chrono::Local::now();
        let wall_start = Instant::now();
        let output = self.config.output_path();

        let sink = CaptureSink::create(&output, self.config.strict_sink)
            .map_err(SessionError::SinkOpen)?;

        let OpenedDuplex {
            playback,
            capture,
            mut control,
        } = match provider.open(&self.config.duplex_config()) {
            Ok(opened) => opened,
            Err(e) => {
                drop(sink);
                remove_unused_output(&output);
                tracing::error!(error = %e, "Failed to open streams");
                return Err(SessionError::DeviceOpen(e));
            }
        };
        let streams = control.describe();

        let triggers = match self.open_triggers() {
            Ok(t) => t,
            Err(e) => {
                drop(control);
                drop(sink);
                remove_unused_output(&output);
                return Err(e);
            }
        };

        if let Err(e) = control.start() {
            triggers.close();
            drop(control);
            drop(sink);
            remove_unused_output(&output);
            tracing::error!(error = %e, "Failed to start streams");
            return Err(SessionError::DeviceOpen(e));
        }
        tracing::info!(output = %output.display(), "Session started: {}", streams);

        let driver = DuplexDriver::new(
            self.config.loop_config(),
            playback,
            capture,
            sink,
            self.signals.begin.clone(),
            self.signals.end.clone(),
            self.mailbox(),
            self.stop.clone(),
        );

        let joined = spawn_loop(driver).map(|handle| handle.join());

        if let Err(e) = control.stop() {
            tracing::warn!(error = %e, "Failed to stop streams cleanly");
        }
        drop(control);
        triggers.close();

        let (outcome, state, driver) = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(panic_info)) => {
                let msg = panic_message(&*panic_info);
                tracing::error!(panic = %msg, "Loop thread panicked");
                return Err(SessionError::LoopPanicked(msg));
            }
            Err(e) => return Err(e),
        };

        let (playback, capture, sink) = driver.into_parts();
        let playback_stop = playback.timestamp();
        let capture_stop = capture.timestamp();

        let mut sink_stats = sink.stats();
        let mut flush_error = None;
        match sink.finish() {
            Ok(stats) => sink_stats = stats,
            Err(e) => {
                tracing::error!(error = %e, "Failed to flush capture file");
                flush_error = Some(e);
            }
        }

        let (status, cancelled, error) = match (&outcome, &flush_error) {
            (LoopOutcome::Stream(e), _) => (SessionStatus::StreamError, false, Some(e.to_string())),
            (LoopOutcome::Sink(e), _) => {
                (SessionStatus::SinkWriteFailed, false, Some(e.to_string()))
            }
            (_, Some(e)) if self.config.strict_sink => {
                (SessionStatus::SinkWriteFailed, false, Some(e.to_string()))
            }
            (LoopOutcome::Cancelled, _) => (SessionStatus::Success, true, None),
            (LoopOutcome::Timeout, _) => (SessionStatus::Success, false, None),
        };

        let (triggers_posted, triggers_ignored) = self.mailbox.counts();
        let report = SessionReport {
            status,
            cancelled,
            error,
            output: output.clone(),
            started_at: started_at.to_rfc3339(),
            wall_time_ms: wall_start.elapsed().as_millis() as u64,
            sample_rate: self.config.sample_rate,
            timeout_sec: self.config.timeout_sec,
            usage: self.config.usage,
            content_type: self.config.content_type,
            performance_mode: self.config.performance_mode,
            frames_captured: state.frames_captured,
            captured_sec: state.capture_sec(self.config.sample_rate),
            counters: state.counters,
            sink: sink_stats,
            triggers_posted,
            triggers_ignored,
            playback_xruns: playback.xruns(),
            capture_xruns: capture.xruns(),
            playback: StreamTimestamps {
                start: state.playback_start,
                stop: playback_stop,
            },
            capture: StreamTimestamps {
                start: state.capture_start,
                stop: capture_stop,
            },
            streams,
            version: crate::VERSION.to_string(),
        };

        tracing::info!(
            status = ?report.status,
            frames = report.frames_captured,
            probes = report.counters.probes_started,
            overlays = report.counters.overlays_completed,
            stalls = report.counters.stalls,
            playback_xruns = report.playback_xruns,
            capture_xruns = report.capture_xruns,
            bytes_dropped = report.sink.bytes_dropped,
            "Session finished"
        );
        self.config.log_settings();

        if self.config.write_report {
            let path = SessionReport::sidecar_path(&output);
            if let Err(e) = report.write_json(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write session report");
            }
        }

        Ok(report)
    }
}

type LoopResult<P, C> = (
    LoopOutcome,
    LoopState,
    DuplexDriver<P, C, std::io::BufWriter<std::fs::File>>,
);

fn spawn_loop<P, C>(
    mut driver: DuplexDriver<P, C, std::io::BufWriter<std::fs::File>>,
) -> Result<std::thread::JoinHandle<LoopResult<P, C>>, SessionError>
where
    P: PlaybackStream + 'static,
    C: CaptureStream + 'static,
{
    std::thread::Builder::new()
        .name("audiolat-loop".into())
        .spawn(move || {
            if let Err(e) = thread_priority::set_current_thread_priority(ThreadPriority::Max) {
                tracing::warn!(error = ?e, "Could not raise loop thread priority");
            }
            let mut state = LoopState::new();
            let outcome = driver.run(&mut state);
            tracing::debug!(?outcome, iterations = state.counters.iterations, "Loop exited");
            (outcome, state, driver)
        })
        .map_err(SessionError::Spawn)
}

fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Remove a capture file that never received data
fn remove_unused_output(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove unused capture file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::loopback::{LoopbackProvider, Pacing};

    fn quick_config(output: PathBuf) -> SessionConfig {
        SessionConfig {
            timeout_sec: 0.5,
            poll_interval_us: 0,
            output: Some(output),
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_config_fails_before_anything_opens() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("never.raw");
        let config = SessionConfig {
            sample_rate: 1000,
            ..quick_config(output.clone())
        };
        let signals = SessionSignals::new(begin_marker(16000), begin_marker(16000));
        assert!(matches!(
            Session::new(config, signals),
            Err(SessionError::Config(ConfigError::InvalidSampleRate(1000)))
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            SessionReport::sidecar_path(Path::new("/tmp/cap.raw")),
            PathBuf::from("/tmp/cap.raw.json")
        );
    }

    #[test]
    fn test_usb_mode_needs_device() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("usb.raw");
        let config = SessionConfig {
            trigger: TriggerMode::Usb,
            ..quick_config(output.clone())
        };
        let session = Session::from_config(config).unwrap();
        let provider = LoopbackProvider::new(0).with_pacing(Pacing::Chunk(128));
        let err = session.run(&provider).unwrap_err();
        assert!(matches!(
            err,
            SessionError::MissingTriggerDevice(TriggerMode::Usb)
        ));
        assert_eq!(err.status(), SessionStatus::DeviceOpenFailed);
        assert!(!output.exists(), "unused capture file must be removed");
    }

    #[test]
    fn test_signals_gain_applied() {
        let config = SessionConfig {
            end_gain_db: -6.0,
            ..Default::default()
        };
        let plain = SessionSignals::load(&SessionConfig::default()).unwrap();
        let quieter = SessionSignals::load(&config).unwrap();
        assert_eq!(plain.end.len_bytes(), quieter.end.len_bytes());
        assert_ne!(plain.end, quieter.end);
        assert_eq!(plain.begin, quieter.begin);
    }
}
