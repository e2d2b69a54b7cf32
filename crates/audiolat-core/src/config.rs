//! Session configuration
//!
//! Every field has a default so a partial JSON file is enough; command-line
//! flags are layered on top by the binary. A config is validated once, before
//! any device or file is touched, and is immutable for the session.

use crate::audio::driver::LoopConfig;
use crate::audio::signal::SignalKind;
use crate::audio::stream::{Direction, DuplexConfig, StreamConfig, BYTES_PER_SAMPLE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Accepted sample rate range
pub const SAMPLE_RATE_RANGE: std::ops::RangeInclusive<u32> = 8000..=192000;

/// Buffer length assumed when a buffer size of 0 asks for the device minimum
const FALLBACK_BUFFER_MS: usize = 10;

/// Capture working buffer relative to the record buffer size
const RECORD_CHUNK_FACTOR: usize = 4;

/// Capture working buffer relative to one poll period of audio
///
/// Covers sleeps overshooting the poll interval so the loop catches up.
const POLL_HEADROOM: usize = 4;

/// Poll periods of silence kept queued on top of one playback buffer
const SILENCE_POLL_PERIODS: usize = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Sample rate {0} Hz outside 8000..=192000")]
    InvalidSampleRate(u32),

    #[error("Timeout must be positive, got {0}")]
    InvalidTimeout(f64),

    #[error("{which} buffer size {bytes} is not a whole number of 16-bit samples")]
    OddBufferSize { which: &'static str, bytes: usize },
}

/// Output usage hint
///
/// Logged with the session settings and recorded in the report; no current
/// backend applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Usage {
    Media,
    VoiceCommunication,
    Alarm,
    Notification,
    #[default]
    Game,
    Unknown,
}

/// Output content-type hint, recorded like [`Usage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Music,
    Speech,
    Movie,
    #[default]
    Sonification,
    Unknown,
}

/// Performance-mode hint, recorded like [`Usage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    None,
    PowerSaving,
    #[default]
    LowLatency,
}

/// Where probes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Periodic probes every `interval_sec`
    #[default]
    Timer,
    /// External MIDI input port
    Midi,
    /// Raw USB-MIDI byte stream
    Usb,
}

macro_rules! impl_from_str {
    ($ty:ty { $($name:literal => $variant:expr),* $(,)? }) => {
        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().replace('-', "_").as_str() {
                    $($name => Ok($variant),)*
                    other => Err(format!("unknown value '{}'", other)),
                }
            }
        }
    };
}

impl_from_str!(Usage {
    "media" => Usage::Media,
    "voice_communication" => Usage::VoiceCommunication,
    "alarm" => Usage::Alarm,
    "notification" => Usage::Notification,
    "game" => Usage::Game,
    "unknown" => Usage::Unknown,
});

impl_from_str!(ContentType {
    "music" => ContentType::Music,
    "speech" => ContentType::Speech,
    "movie" => ContentType::Movie,
    "sonification" => ContentType::Sonification,
    "unknown" => ContentType::Unknown,
});

impl_from_str!(PerformanceMode {
    "none" => PerformanceMode::None,
    "power_saving" => PerformanceMode::PowerSaving,
    "low_latency" => PerformanceMode::LowLatency,
});

/// Configuration of one measurement session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shared playback/capture rate in Hz
    pub sample_rate: u32,
    /// Session ends once this much audio has been captured
    pub timeout_sec: f64,
    /// 0 = device minimum
    pub record_buffer_bytes: usize,
    /// 0 = device minimum
    pub playback_buffer_bytes: usize,
    /// Time between periodic probes; `<= 0` disables them
    pub interval_sec: f64,
    pub usage: Usage,
    pub content_type: ContentType,
    pub performance_mode: PerformanceMode,
    /// Device name substring, `None` = default
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    /// Sleep between loop iterations in microseconds; 0 only yields
    pub poll_interval_us: u64,
    pub trigger: TriggerMode,
    /// MIDI port name substring or index, `None` = first port
    pub midi_port: Option<String>,
    /// Source of raw 4-byte USB-MIDI bulk packets (FIFO, file or bulk
    /// endpoint bridge); ALSA raw-MIDI devices deliver plain MIDI bytes instead
    pub usb_device: Option<PathBuf>,
    /// Built-in end-signal, used when `end_signal_path` is unset
    pub signal: SignalKind,
    pub end_signal_path: Option<PathBuf>,
    pub begin_signal_path: Option<PathBuf>,
    /// Gain applied to the end-signal; above 6 dB it is ignored
    pub end_gain_db: f32,
    /// Capture file, `None` = timestamped name in the working directory
    pub output: Option<PathBuf>,
    /// Treat capture write failures as fatal
    pub strict_sink: bool,
    /// Write `<output>.json` with the session report
    pub write_report: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            timeout_sec: 15.0,
            record_buffer_bytes: 32,
            playback_buffer_bytes: 32,
            interval_sec: 2.0,
            usage: Usage::default(),
            content_type: ContentType::default(),
            performance_mode: PerformanceMode::default(),
            input_device: None,
            output_device: None,
            poll_interval_us: 1000,
            trigger: TriggerMode::default(),
            midi_port: None,
            usb_device: None,
            signal: SignalKind::default(),
            end_signal_path: None,
            begin_signal_path: None,
            end_gain_db: 0.0,
            output: None,
            strict_sink: false,
            write_report: true,
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Save as pretty JSON, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(io_err)?;
        tracing::info!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Check everything that can be checked without touching a device
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SAMPLE_RATE_RANGE.contains(&self.sample_rate) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if !self.timeout_sec.is_finite() || self.timeout_sec <= 0.0 {
            return Err(ConfigError::InvalidTimeout(self.timeout_sec));
        }
        if self.record_buffer_bytes % BYTES_PER_SAMPLE != 0 {
            return Err(ConfigError::OddBufferSize {
                which: "record",
                bytes: self.record_buffer_bytes,
            });
        }
        if self.playback_buffer_bytes % BYTES_PER_SAMPLE != 0 {
            return Err(ConfigError::OddBufferSize {
                which: "playback",
                bytes: self.playback_buffer_bytes,
            });
        }
        Ok(())
    }

    /// Probe interval actually used
    ///
    /// Device-triggered sessions never probe on a timer.
    pub fn effective_interval_sec(&self) -> f64 {
        match self.trigger {
            TriggerMode::Timer => self.interval_sec,
            TriggerMode::Midi | TriggerMode::Usb => -1.0,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    fn fallback_buffer_bytes(&self) -> usize {
        self.sample_rate as usize * FALLBACK_BUFFER_MS / 1000 * BYTES_PER_SAMPLE
    }

    /// Bytes of audio one poll interval spans, rounded up to a whole frame
    fn poll_period_bytes(&self) -> usize {
        let frames = (self.sample_rate as u64 * self.poll_interval_us).div_ceil(1_000_000);
        frames as usize * BYTES_PER_SAMPLE
    }

    /// Capture working buffer size
    ///
    /// Large enough to drain several poll periods per read, so capture keeps
    /// up with the device at any accepted sample rate.
    pub fn record_chunk_bytes(&self) -> usize {
        let base = match self.record_buffer_bytes {
            0 => self.fallback_buffer_bytes(),
            bytes => bytes,
        };
        (base * RECORD_CHUNK_FACTOR).max(self.poll_period_bytes() * POLL_HEADROOM)
    }

    /// Silence written per idle loop iteration
    pub fn silence_bytes(&self) -> usize {
        match self.playback_buffer_bytes {
            0 => self.fallback_buffer_bytes(),
            bytes => bytes,
        }
    }

    /// Playback fill level kept while idle: one buffer plus two poll periods
    pub fn silence_target_bytes(&self) -> usize {
        self.silence_bytes() + self.poll_period_bytes() * SILENCE_POLL_PERIODS
    }

    /// Capture file path, generating a timestamped name when unset
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            PathBuf::from(format!("audiolat_{}_{}.raw", timestamp, self.sample_rate))
        })
    }

    pub fn duplex_config(&self) -> DuplexConfig {
        DuplexConfig {
            playback: StreamConfig::mono16(
                self.sample_rate,
                self.playback_buffer_bytes,
                Direction::Playback,
            )
            .with_device(self.output_device.clone()),
            capture: StreamConfig::mono16(
                self.sample_rate,
                self.record_buffer_bytes,
                Direction::Capture,
            )
            .with_device(self.input_device.clone()),
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            sample_rate: self.sample_rate,
            timeout_sec: self.timeout_sec,
            interval_sec: self.effective_interval_sec(),
            record_chunk_bytes: self.record_chunk_bytes(),
            silence_bytes: self.silence_bytes(),
            silence_target_bytes: self.silence_target_bytes(),
            poll_interval: self.poll_interval(),
        }
    }

    /// Log the settings a session runs with
    pub fn log_settings(&self) {
        tracing::info!(
            sample_rate = self.sample_rate,
            timeout_sec = self.timeout_sec,
            record_buffer_bytes = self.record_buffer_bytes,
            playback_buffer_bytes = self.playback_buffer_bytes,
            interval_sec = self.effective_interval_sec(),
            trigger = ?self.trigger,
            signal = ?self.signal,
            end_gain_db = self.end_gain_db,
            usage = ?self.usage,
            content_type = ?self.content_type,
            performance_mode = ?self.performance_mode,
            "Session settings"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.timeout_sec, 15.0);
        assert_eq!(config.record_buffer_bytes, 32);
        assert_eq!(config.playback_buffer_bytes, 32);
        assert_eq!(config.interval_sec, 2.0);
        assert_eq!(config.usage, Usage::Game);
        assert_eq!(config.trigger, TriggerMode::Timer);
        assert_eq!(config.signal, SignalKind::Chirp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"sample_rate": 48000, "trigger": "usb"}"#).unwrap();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.trigger, TriggerMode::Usb);
        assert_eq!(config.timeout_sec, 15.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let config = SessionConfig {
            sample_rate: 48000,
            midi_port: Some("Launchpad".into()),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            SessionConfig::load(&missing),
            Err(ConfigError::Io { .. })
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            SessionConfig::load(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validation() {
        let bad_rate = SessionConfig {
            sample_rate: 4000,
            ..Default::default()
        };
        assert!(matches!(
            bad_rate.validate(),
            Err(ConfigError::InvalidSampleRate(4000))
        ));

        let bad_timeout = SessionConfig {
            timeout_sec: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            bad_timeout.validate(),
            Err(ConfigError::InvalidTimeout(_))
        ));

        let nan_timeout = SessionConfig {
            timeout_sec: f64::NAN,
            ..Default::default()
        };
        assert!(nan_timeout.validate().is_err());

        let odd = SessionConfig {
            playback_buffer_bytes: 33,
            ..Default::default()
        };
        assert!(matches!(
            odd.validate(),
            Err(ConfigError::OddBufferSize {
                which: "playback",
                ..
            })
        ));

        let device_minimum = SessionConfig {
            record_buffer_bytes: 0,
            playback_buffer_bytes: 0,
            ..Default::default()
        };
        assert!(device_minimum.validate().is_ok());
    }

    #[test]
    fn test_device_trigger_disables_timer() {
        let mut config = SessionConfig::default();
        assert_eq!(config.effective_interval_sec(), 2.0);
        config.trigger = TriggerMode::Midi;
        assert_eq!(config.effective_interval_sec(), -1.0);
        config.trigger = TriggerMode::Usb;
        assert_eq!(config.loop_config().interval_sec, -1.0);
    }

    #[test]
    fn test_buffer_sizing() {
        let config = SessionConfig::default();
        assert_eq!(config.record_chunk_bytes(), 128);
        assert_eq!(config.silence_bytes(), 32);

        let minimum = SessionConfig {
            record_buffer_bytes: 0,
            playback_buffer_bytes: 0,
            ..Default::default()
        };
        // 10 ms at 16 kHz
        assert_eq!(minimum.silence_bytes(), 320);
        assert_eq!(minimum.record_chunk_bytes(), 1280);
    }

    #[test]
    fn test_buffers_scale_with_rate_and_poll_interval() {
        // 1 ms poll at 192 kHz = 192 frames = 384 bytes per period
        let fast = SessionConfig {
            sample_rate: 192000,
            ..Default::default()
        };
        assert_eq!(fast.record_chunk_bytes(), 384 * 4);
        assert_eq!(fast.silence_target_bytes(), 32 + 384 * 2);
        assert_eq!(fast.loop_config().silence_target_bytes, 32 + 384 * 2);

        // Default rate: one period is 32 bytes
        let config = SessionConfig::default();
        assert_eq!(config.silence_target_bytes(), 32 + 64);

        // Yield-only loop keeps the plain sizes
        let yielding = SessionConfig {
            poll_interval_us: 0,
            ..Default::default()
        };
        assert_eq!(yielding.record_chunk_bytes(), 128);
        assert_eq!(yielding.silence_target_bytes(), 32);
    }

    #[test]
    fn test_hint_parsing() {
        assert_eq!("game".parse::<Usage>(), Ok(Usage::Game));
        assert_eq!(
            "voice-communication".parse::<Usage>(),
            Ok(Usage::VoiceCommunication)
        );
        assert_eq!("speech".parse::<ContentType>(), Ok(ContentType::Speech));
        assert_eq!(
            "LOW_LATENCY".parse::<PerformanceMode>(),
            Ok(PerformanceMode::LowLatency)
        );
        assert!("loud".parse::<Usage>().is_err());
    }

    #[test]
    fn test_output_path() {
        let config = SessionConfig {
            output: Some(PathBuf::from("/tmp/x.raw")),
            ..Default::default()
        };
        assert_eq!(config.output_path(), PathBuf::from("/tmp/x.raw"));

        let generated = SessionConfig::default().output_path();
        let name = generated.to_string_lossy();
        assert!(name.starts_with("audiolat_"));
        assert!(name.ends_with("_16000.raw"));
    }
}
