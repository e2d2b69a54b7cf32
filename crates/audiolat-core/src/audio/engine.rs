//! cpal-backed duplex streams
//!
//! cpal drives audio through callbacks on its own threads, while the loop
//! wants non-blocking read/write calls. Each direction is bridged with a
//! lock-free SPSC byte ring:
//! - playback: the loop pushes PCM bytes, the output callback pops one
//!   sample per frame and copies it to every channel (silence on underrun)
//! - capture: the input callback pushes channel 0 as PCM bytes, the loop pops
//!
//! Stream errors are forwarded through a bounded channel and surface as
//! [`StreamError::Device`] from `health()`. The `cpal::Stream` objects stay in
//! [`CpalControl`] on the thread that opened them.

use super::stream::{
    CaptureStream, Direction, DuplexConfig, OpenedDuplex, PlaybackStream, StreamConfig,
    StreamControl, StreamError, StreamProvider, StreamTimestamp,
};
use crate::pcm::FULL_SCALE;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleRate, Stream, StreamInstant};
use crossbeam_channel::{Receiver, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Ring size in seconds of audio for each direction
const RING_SECONDS: usize = 1;

/// Pending device errors kept before new ones are dropped
const ERROR_CHANNEL_DEPTH: usize = 8;

/// Sample rates probed when listing devices
const COMMON_RATES: [u32; 8] = [8000, 16000, 22050, 44100, 48000, 88200, 96000, 192000];

/// Audio device information
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    /// Default input or default output device
    pub is_default: bool,
    /// Supported rates among the common ones
    pub sample_rates: Vec<u32>,
    pub input_channels: u16,
    pub output_channels: u16,
}

/// Default-host cpal provider
#[derive(Debug, Clone, Default)]
pub struct CpalProvider;

impl CpalProvider {
    pub fn new() -> Self {
        Self
    }

    /// List devices of the default host
    pub fn list_devices() -> Result<Vec<DeviceInfo>, StreamError> {
        let host = cpal::default_host();
        let mut devices = Vec::new();

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let all = host
            .devices()
            .map_err(|e| StreamError::Open(e.to_string()))?;

        for device in all {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let is_default = default_input.as_deref() == Some(name.as_str())
                || default_output.as_deref() == Some(name.as_str());

            let input_channels = device
                .default_input_config()
                .map(|c| c.channels())
                .unwrap_or(0);
            let output_channels = device
                .default_output_config()
                .map(|c| c.channels())
                .unwrap_or(0);

            let mut sample_rates = Vec::new();
            let ranges: Vec<(u32, u32)> = device
                .supported_output_configs()
                .map(|configs| {
                    configs
                        .map(|c| (c.min_sample_rate().0, c.max_sample_rate().0))
                        .collect()
                })
                .unwrap_or_default();
            for &rate in &COMMON_RATES {
                if ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&rate)) {
                    sample_rates.push(rate);
                }
            }

            devices.push(DeviceInfo {
                name,
                is_default,
                sample_rates,
                input_channels,
                output_channels,
            });
        }

        Ok(devices)
    }

    fn find_device(host: &Host, config: &StreamConfig) -> Result<Device, StreamError> {
        match (&config.device, config.direction) {
            (None, Direction::Playback) => host
                .default_output_device()
                .ok_or_else(|| StreamError::DeviceNotFound("default output".into())),
            (None, Direction::Capture) => host
                .default_input_device()
                .ok_or_else(|| StreamError::DeviceNotFound("default input".into())),
            (Some(pattern), direction) => {
                let mut devices = match direction {
                    Direction::Playback => host.output_devices(),
                    Direction::Capture => host.input_devices(),
                }
                .map_err(|e| StreamError::Open(e.to_string()))?;
                devices
                    .find(|d| d.name().map(|n| n.contains(pattern.as_str())).unwrap_or(false))
                    .ok_or_else(|| StreamError::DeviceNotFound(pattern.clone()))
            }
        }
    }

    fn cpal_config(device: &Device, config: &StreamConfig) -> cpal::StreamConfig {
        let default = match config.direction {
            Direction::Playback => device.default_output_config(),
            Direction::Capture => device.default_input_config(),
        };
        let channels = default.map(|c| c.channels()).unwrap_or(1).max(1);
        cpal::StreamConfig {
            channels,
            sample_rate: SampleRate(config.sample_rate),
            buffer_size: match config.buffer_frames() {
                Some(frames) => cpal::BufferSize::Fixed(frames),
                None => cpal::BufferSize::Default,
            },
        }
    }
}

fn instant_nanos(instant: &StreamInstant) -> u64 {
    instant
        .duration_since(&StreamInstant::new(0, 0))
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn forward_error(tx: &Sender<String>, direction: Direction, err: cpal::StreamError) {
    tracing::error!(?direction, "Stream error: {}", err);
    let _ = tx.try_send(err.to_string());
}

fn drain_errors(rx: &Receiver<String>) -> Result<(), StreamError> {
    match rx.try_recv() {
        Ok(msg) => Err(StreamError::Device(msg)),
        Err(_) => Ok(()),
    }
}

impl StreamProvider for CpalProvider {
    type Playback = CpalPlayback;
    type Capture = CpalCapture;
    type Control = CpalControl;

    fn open(
        &self,
        config: &DuplexConfig,
    ) -> Result<OpenedDuplex<CpalPlayback, CpalCapture, CpalControl>, StreamError> {
        let host = cpal::default_host();
        let output_device = Self::find_device(&host, &config.playback)?;
        let input_device = Self::find_device(&host, &config.capture)?;

        let output_config = Self::cpal_config(&output_device, &config.playback);
        let input_config = Self::cpal_config(&input_device, &config.capture);

        let ring_bytes = config.playback.sample_rate as usize * 2 * RING_SECONDS;
        let (out_producer, mut out_consumer) = HeapRb::<u8>::new(ring_bytes).split();
        let (mut in_producer, in_consumer) = HeapRb::<u8>::new(ring_bytes).split();

        let (out_err_tx, out_err_rx) = crossbeam_channel::bounded::<String>(ERROR_CHANNEL_DEPTH);
        let (in_err_tx, in_err_rx) = crossbeam_channel::bounded::<String>(ERROR_CHANNEL_DEPTH);

        let running = Arc::new(AtomicBool::new(false));

        // Playback side
        let played_frames = Arc::new(AtomicU64::new(0));
        let underruns = Arc::new(AtomicU64::new(0));
        let out_timestamp = Arc::new(Mutex::new(None::<StreamTimestamp>));

        let cb_running = Arc::clone(&running);
        let cb_played = Arc::clone(&played_frames);
        let cb_underruns = Arc::clone(&underruns);
        let cb_timestamp = Arc::clone(&out_timestamp);
        let out_channels = output_config.channels as usize;
        let mut primed = false;

        let output_stream = output_device
            .build_output_stream(
                &output_config,
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                    if !cb_running.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }
                    let mut short = false;
                    let mut frames = 0u64;
                    for frame in data.chunks_mut(out_channels) {
                        let sample = if out_consumer.occupied_len() >= 2 {
                            let mut pair = [0u8; 2];
                            out_consumer.pop_slice(&mut pair);
                            primed = true;
                            i16::from_le_bytes(pair) as f32 / FULL_SCALE
                        } else {
                            short = true;
                            0.0
                        };
                        frame.fill(sample);
                        frames += 1;
                    }
                    if short && primed {
                        cb_underruns.fetch_add(1, Ordering::Relaxed);
                    }
                    let position = cb_played.fetch_add(frames, Ordering::Release) + frames;
                    if let Ok(mut ts) = cb_timestamp.try_lock() {
                        *ts = Some(StreamTimestamp {
                            frame_position: position,
                            host_time_ns: instant_nanos(&info.timestamp().playback),
                        });
                    }
                },
                move |err| forward_error(&out_err_tx, Direction::Playback, err),
                None,
            )
            .map_err(|e| StreamError::Open(format!("output: {}", e)))?;

        // Capture side
        let captured_frames = Arc::new(AtomicU64::new(0));
        let overruns = Arc::new(AtomicU64::new(0));
        let in_timestamp = Arc::new(Mutex::new(None::<StreamTimestamp>));

        let cb_running = Arc::clone(&running);
        let cb_captured = Arc::clone(&captured_frames);
        let cb_overruns = Arc::clone(&overruns);
        let cb_timestamp = Arc::clone(&in_timestamp);
        let in_channels = input_config.channels as usize;

        let input_stream = input_device
            .build_input_stream(
                &input_config,
                move |data: &[f32], info: &cpal::InputCallbackInfo| {
                    if !cb_running.load(Ordering::Relaxed) {
                        return;
                    }
                    let frames = (data.len() / in_channels) as u64;
                    if in_producer.vacant_len() < frames as usize * 2 {
                        cb_overruns.fetch_add(1, Ordering::Relaxed);
                    }
                    for frame in data.chunks(in_channels) {
                        let Some(&x) = frame.first() else { continue };
                        let s = (x * FULL_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32);
                        let bytes = (s as i16).to_le_bytes();
                        if in_producer.vacant_len() >= 2 {
                            in_producer.push_slice(&bytes);
                        }
                    }
                    let position = cb_captured.fetch_add(frames, Ordering::Release) + frames;
                    if let Ok(mut ts) = cb_timestamp.try_lock() {
                        *ts = Some(StreamTimestamp {
                            frame_position: position,
                            host_time_ns: instant_nanos(&info.timestamp().capture),
                        });
                    }
                },
                move |err| forward_error(&in_err_tx, Direction::Capture, err),
                None,
            )
            .map_err(|e| StreamError::Open(format!("input: {}", e)))?;

        let description = format!(
            "output '{}' {} ch @ {} Hz buffer {:?}, input '{}' {} ch @ {} Hz buffer {:?}",
            output_device.name().unwrap_or_default(),
            output_config.channels,
            output_config.sample_rate.0,
            output_config.buffer_size,
            input_device.name().unwrap_or_default(),
            input_config.channels,
            input_config.sample_rate.0,
            input_config.buffer_size,
        );
        tracing::info!(host = ?host.id(), "Opened duplex streams: {}", description);

        Ok(OpenedDuplex {
            playback: CpalPlayback {
                producer: out_producer,
                errors: out_err_rx,
                timestamp: out_timestamp,
                underruns,
            },
            capture: CpalCapture {
                consumer: in_consumer,
                errors: in_err_rx,
                timestamp: in_timestamp,
                overruns,
            },
            control: CpalControl {
                output: output_stream,
                input: input_stream,
                running,
                description,
            },
        })
    }
}

/// Loop-side playback handle
pub struct CpalPlayback {
    producer: HeapProd<u8>,
    errors: Receiver<String>,
    timestamp: Arc<Mutex<Option<StreamTimestamp>>>,
    underruns: Arc<AtomicU64>,
}

impl PlaybackStream for CpalPlayback {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, StreamError> {
        let n = bytes.len().min(self.producer.vacant_len()) & !1;
        Ok(self.producer.push_slice(&bytes[..n]))
    }

    fn queued_bytes(&self) -> Option<usize> {
        Some(self.producer.occupied_len())
    }

    fn timestamp(&self) -> Option<StreamTimestamp> {
        self.timestamp.lock().ok().and_then(|ts| *ts)
    }

    fn health(&mut self) -> Result<(), StreamError> {
        drain_errors(&self.errors)
    }

    fn xruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

/// Loop-side capture handle
pub struct CpalCapture {
    consumer: HeapCons<u8>,
    errors: Receiver<String>,
    timestamp: Arc<Mutex<Option<StreamTimestamp>>>,
    overruns: Arc<AtomicU64>,
}

impl CaptureStream for CpalCapture {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let n = buf.len().min(self.consumer.occupied_len()) & !1;
        Ok(self.consumer.pop_slice(&mut buf[..n]))
    }

    fn timestamp(&self) -> Option<StreamTimestamp> {
        self.timestamp.lock().ok().and_then(|ts| *ts)
    }

    fn health(&mut self) -> Result<(), StreamError> {
        drain_errors(&self.errors)
    }

    fn xruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// Owns the cpal streams; dropping it closes them
pub struct CpalControl {
    output: Stream,
    input: Stream,
    running: Arc<AtomicBool>,
    description: String,
}

impl StreamControl for CpalControl {
    fn start(&mut self) -> Result<(), StreamError> {
        self.running.store(true, Ordering::Release);
        self.input
            .play()
            .map_err(|e| StreamError::Control(format!("input: {}", e)))?;
        self.output
            .play()
            .map_err(|e| StreamError::Control(format!("output: {}", e)))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.running.store(false, Ordering::Release);
        let output = self.output.pause();
        let input = self.input.pause();
        output.map_err(|e| StreamError::Control(format!("output: {}", e)))?;
        input.map_err(|e| StreamError::Control(format!("input: {}", e)))?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

impl Drop for CpalControl {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        tracing::debug!("Released duplex streams");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_nanos() {
        assert_eq!(instant_nanos(&StreamInstant::new(0, 0)), 0);
        assert_eq!(instant_nanos(&StreamInstant::new(1, 500)), 1_000_000_500);
    }

    #[test]
    fn test_drain_errors() {
        let (tx, rx) = crossbeam_channel::bounded::<String>(2);
        assert!(drain_errors(&rx).is_ok());
        tx.send("device removed".into()).unwrap();
        assert_eq!(
            drain_errors(&rx),
            Err(StreamError::Device("device removed".into()))
        );
    }

    #[test]
    fn test_list_devices_does_not_panic() {
        // CI machines often have no audio hardware
        let _ = CpalProvider::list_devices();
    }
}
