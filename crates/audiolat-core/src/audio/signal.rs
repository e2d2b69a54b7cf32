//! Probe signals
//!
//! Two signals take part in every probe:
//! - the *end-signal*, played to the output (a chirp or a noise burst)
//! - the *begin-signal*, overlaid into the captured file (a short impulse)
//!
//! Both are 16-bit little-endian mono PCM, loaded or generated once per
//! session and never mutated afterwards.

use crate::pcm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Default end-signal length
pub const END_SIGNAL_MS: u32 = 300;

/// Default begin-signal length
pub const BEGIN_SIGNAL_MS: u32 = 10;

/// Generated end-signal amplitude (-6dB for headroom)
const SIGNAL_AMPLITUDE: f32 = 0.5;

/// Fade in/out length for generated end-signals, avoids clicks at the edges
const FADE_MS: u32 = 5;

/// Errors while loading or building a signal
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Failed to read signal file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode WAV file {path}: {source}")]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("Unsupported WAV format in {path}: {channels} channel(s), {bits} bit, {format}")]
    UnsupportedWav {
        path: PathBuf,
        channels: u16,
        bits: u16,
        format: &'static str,
    },

    #[error("Signal has odd byte length {0}, expected whole 16-bit samples")]
    OddLength(usize),

    #[error("Signal is empty")]
    Empty,
}

/// Built-in end-signal shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Linear frequency sweep
    #[default]
    Chirp,
    /// Band-limited noise burst
    Noise,
}

impl SignalKind {
    /// Generate the default 300ms end-signal of this kind
    pub fn generate(self, sample_rate: u32) -> SignalBuffer {
        match self {
            SignalKind::Chirp => chirp(sample_rate, END_SIGNAL_MS),
            SignalKind::Noise => noise(sample_rate, END_SIGNAL_MS),
        }
    }
}

impl std::str::FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chirp" => Ok(SignalKind::Chirp),
            "noise" => Ok(SignalKind::Noise),
            other => Err(format!("unknown signal '{}', expected chirp or noise", other)),
        }
    }
}

/// Immutable 16-bit LE mono PCM buffer
///
/// Cloning is cheap; the bytes are shared.
///
/// # Example
/// ```
/// use audiolat_core::audio::signal::SignalBuffer;
///
/// let sig = SignalBuffer::from_samples(&[0, 100, -100]);
/// assert_eq!(sig.len_bytes(), 6);
/// assert_eq!(sig.frame_count(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalBuffer {
    bytes: Arc<[u8]>,
}

impl SignalBuffer {
    /// Wrap raw PCM bytes; rejects empty and odd-length input
    pub fn from_pcm_bytes(bytes: Vec<u8>) -> Result<Self, SignalError> {
        if bytes.is_empty() {
            return Err(SignalError::Empty);
        }
        if bytes.len() % 2 != 0 {
            return Err(SignalError::OddLength(bytes.len()));
        }
        Ok(Self {
            bytes: bytes.into(),
        })
    }

    pub fn from_samples(samples: &[i16]) -> Self {
        Self {
            bytes: pcm::i16_to_le_bytes(samples).into(),
        }
    }

    /// Load a signal file
    ///
    /// `.wav` files must be 16-bit integer mono; anything else is read as
    /// headerless 16-bit LE PCM. A WAV sample rate different from
    /// `sample_rate` is accepted with a warning since no resampling happens.
    pub fn load(path: &Path, sample_rate: u32) -> Result<Self, SignalError> {
        let is_wav = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);

        let signal = if is_wav {
            Self::load_wav(path, sample_rate)?
        } else {
            let bytes = std::fs::read(path).map_err(|source| SignalError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_pcm_bytes(bytes)?
        };

        tracing::debug!(
            path = %path.display(),
            frames = signal.frame_count(),
            "Loaded signal"
        );
        Ok(signal)
    }

    fn load_wav(path: &Path, sample_rate: u32) -> Result<Self, SignalError> {
        let wav_err = |source| SignalError::Wav {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = hound::WavReader::open(path).map_err(wav_err)?;
        let spec = reader.spec();

        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(SignalError::UnsupportedWav {
                path: path.to_path_buf(),
                channels: spec.channels,
                bits: spec.bits_per_sample,
                format: match spec.sample_format {
                    hound::SampleFormat::Int => "int",
                    hound::SampleFormat::Float => "float",
                },
            });
        }

        if spec.sample_rate != sample_rate {
            tracing::warn!(
                path = %path.display(),
                file_rate = spec.sample_rate,
                session_rate = sample_rate,
                "Signal sample rate differs from session rate"
            );
        }

        let samples = reader
            .samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(wav_err)?;
        if samples.is_empty() {
            return Err(SignalError::Empty);
        }
        Ok(Self::from_samples(&samples))
    }

    /// Copy of this signal with a gain applied
    ///
    /// Gains above [`pcm::MAX_GAIN_DB`] are refused and the copy is unchanged.
    pub fn with_gain_db(&self, gain_db: f32) -> Self {
        let mut bytes = self.bytes.to_vec();
        pcm::apply_gain_db(&mut bytes, gain_db);
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn frame_count(&self) -> usize {
        self.bytes.len() / 2
    }

    pub fn duration_sec(&self, sample_rate: u32) -> f64 {
        self.frame_count() as f64 / sample_rate as f64
    }
}

fn frames_for(sample_rate: u32, duration_ms: u32) -> usize {
    ((sample_rate as u64 * duration_ms as u64) / 1000).max(1) as usize
}

/// Linear fade at both ends
fn apply_fade(samples: &mut [f32], sample_rate: u32) {
    let fade = frames_for(sample_rate, FADE_MS).min(samples.len() / 2);
    if fade == 0 {
        return;
    }
    let len = samples.len();
    for i in 0..fade {
        let gain = i as f32 / fade as f32;
        samples[i] *= gain;
        samples[len - 1 - i] *= gain;
    }
}

fn encode(samples: &[f32]) -> SignalBuffer {
    SignalBuffer {
        bytes: pcm::float_to_samples_clamped(samples, pcm::Endian::Little).into(),
    }
}

/// Linear sweep from 100 Hz up to 40% of the sample rate
pub fn chirp(sample_rate: u32, duration_ms: u32) -> SignalBuffer {
    let frames = frames_for(sample_rate, duration_ms);
    let f0 = 100.0f64;
    let f1 = sample_rate as f64 * 0.4;
    let duration = frames as f64 / sample_rate as f64;
    let sweep_rate = (f1 - f0) / duration;

    let mut samples: Vec<f32> = (0..frames)
        .map(|i| {
            let t = i as f64 / sample_rate as f64;
            let phase = 2.0 * std::f64::consts::PI * (f0 * t + 0.5 * sweep_rate * t * t);
            (phase.sin() as f32) * SIGNAL_AMPLITUDE
        })
        .collect();
    apply_fade(&mut samples, sample_rate);
    encode(&samples)
}

/// White noise burst from a fixed-seed LCG, so every run plays the same burst
pub fn noise(sample_rate: u32, duration_ms: u32) -> SignalBuffer {
    let frames = frames_for(sample_rate, duration_ms);
    let mut seed: u32 = 0xDEADBEEF;
    let mut samples: Vec<f32> = (0..frames)
        .map(|_| {
            // glibc LCG constants
            seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
            let bits = (seed >> 16) & 0x7FFF;
            ((bits as f32 / 16384.0) - 1.0) * SIGNAL_AMPLITUDE
        })
        .collect();
    apply_fade(&mut samples, sample_rate);
    encode(&samples)
}

/// Dirac-style begin marker: one full-scale sample followed by silence
pub fn begin_marker(sample_rate: u32) -> SignalBuffer {
    let mut samples = vec![0i16; frames_for(sample_rate, BEGIN_SIGNAL_MS)];
    samples[0] = i16::MAX;
    SignalBuffer::from_samples(&samples)
}
