//! In-process loopback stream provider
//!
//! Whatever is written to playback comes back on capture after a fixed delay,
//! as if a cable connected the output to the input. Used by `--simulate` and
//! by tests that need a full session without audio hardware.
//!
//! The capture side is the clock: each read "plays" the same number of bytes
//! from the playback queue (silence on underrun) into a delay line and returns
//! the bytes falling out of the far end.

use super::stream::{
    CaptureStream, DuplexConfig, OpenedDuplex, PlaybackStream, StreamControl, StreamError,
    StreamProvider, StreamTimestamp,
};
use crate::trigger::monotonic_nanos;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Playback queue size (about 2 s at 16 kHz)
const DEFAULT_QUEUE_BYTES: usize = 65536;

/// How capture reads are sized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Every read returns this many bytes (capped by the caller's buffer)
    Chunk(usize),
    /// Reads return what a real device would have captured since the first read
    RealTime,
}

/// Loopback provider with a simulated round-trip delay
#[derive(Debug, Clone)]
pub struct LoopbackProvider {
    delay_frames: usize,
    pacing: Pacing,
    queue_bytes: usize,
}

impl LoopbackProvider {
    pub fn new(delay_frames: usize) -> Self {
        Self {
            delay_frames,
            pacing: Pacing::RealTime,
            queue_bytes: DEFAULT_QUEUE_BYTES,
        }
    }

    pub fn from_delay_ms(delay_ms: f64, sample_rate: u32) -> Self {
        let frames = (delay_ms.max(0.0) * sample_rate as f64 / 1000.0).round() as usize;
        Self::new(frames)
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_queue_bytes(mut self, bytes: usize) -> Self {
        self.queue_bytes = bytes.max(2);
        self
    }

    pub fn delay_frames(&self) -> usize {
        self.delay_frames
    }
}

impl StreamProvider for LoopbackProvider {
    type Playback = LoopbackPlayback;
    type Capture = LoopbackCapture;
    type Control = LoopbackControl;

    fn open(
        &self,
        config: &DuplexConfig,
    ) -> Result<OpenedDuplex<LoopbackPlayback, LoopbackCapture, LoopbackControl>, StreamError>
    {
        if config.playback.sample_rate != config.capture.sample_rate {
            return Err(StreamError::Unsupported(format!(
                "loopback needs one sample rate, got {} and {}",
                config.playback.sample_rate, config.capture.sample_rate
            )));
        }
        let sample_rate = config.playback.sample_rate;

        let (producer, consumer) = HeapRb::<u8>::new(self.queue_bytes).split();
        let running = Arc::new(AtomicBool::new(false));
        let played_frames = Arc::new(AtomicU64::new(0));
        let delay_bytes = self.delay_frames * 2;

        tracing::debug!(
            delay_frames = self.delay_frames,
            queue_bytes = self.queue_bytes,
            pacing = ?self.pacing,
            "Opened loopback streams"
        );

        Ok(OpenedDuplex {
            playback: LoopbackPlayback {
                producer,
                running: Arc::clone(&running),
                played_frames: Arc::clone(&played_frames),
            },
            capture: LoopbackCapture {
                consumer,
                delay_line: VecDeque::from(vec![0u8; delay_bytes]),
                scratch: Vec::new(),
                pacing: self.pacing,
                sample_rate,
                epoch: None,
                delivered_bytes: 0,
                last_read_ns: 0,
                running: Arc::clone(&running),
                played_frames,
            },
            control: LoopbackControl {
                running,
                description: format!(
                    "loopback: {} Hz, delay {} frames, queue {} bytes",
                    sample_rate, self.delay_frames, self.queue_bytes
                ),
            },
        })
    }
}

pub struct LoopbackPlayback {
    producer: HeapProd<u8>,
    running: Arc<AtomicBool>,
    played_frames: Arc<AtomicU64>,
}

impl PlaybackStream for LoopbackPlayback {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, StreamError> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(0);
        }
        let n = bytes.len().min(self.producer.vacant_len()) & !1;
        Ok(self.producer.push_slice(&bytes[..n]))
    }

    fn queued_bytes(&self) -> Option<usize> {
        Some(self.producer.occupied_len())
    }

    fn timestamp(&self) -> Option<StreamTimestamp> {
        Some(StreamTimestamp {
            frame_position: self.played_frames.load(Ordering::Acquire),
            host_time_ns: monotonic_nanos(),
        })
    }
}

pub struct LoopbackCapture {
    consumer: HeapCons<u8>,
    delay_line: VecDeque<u8>,
    scratch: Vec<u8>,
    pacing: Pacing,
    sample_rate: u32,
    epoch: Option<Instant>,
    delivered_bytes: u64,
    last_read_ns: u64,
    running: Arc<AtomicBool>,
    played_frames: Arc<AtomicU64>,
}

impl LoopbackCapture {
    fn due_bytes(&mut self, max: usize) -> usize {
        let n = match self.pacing {
            Pacing::Chunk(bytes) => bytes,
            Pacing::RealTime => {
                let epoch = *self.epoch.get_or_insert_with(Instant::now);
                let frames = (epoch.elapsed().as_secs_f64() * self.sample_rate as f64) as u64;
                (frames * 2).saturating_sub(self.delivered_bytes) as usize
            }
        };
        n.min(max) & !1
    }
}

impl CaptureStream for LoopbackCapture {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(0);
        }
        let n = self.due_bytes(buf.len());
        if n == 0 {
            return Ok(0);
        }

        // Play n bytes: whatever is queued, silence for the rest
        self.scratch.clear();
        self.scratch.resize(n, 0);
        self.consumer.pop_slice(&mut self.scratch);
        self.delay_line.extend(self.scratch.iter().copied());

        for (dst, src) in buf[..n].iter_mut().zip(self.delay_line.drain(..n)) {
            *dst = src;
        }

        self.delivered_bytes += n as u64;
        self.last_read_ns = monotonic_nanos();
        self.played_frames.fetch_add((n / 2) as u64, Ordering::Release);
        Ok(n)
    }

    fn timestamp(&self) -> Option<StreamTimestamp> {
        Some(StreamTimestamp {
            frame_position: self.delivered_bytes / 2,
            host_time_ns: self.last_read_ns,
        })
    }
}

pub struct LoopbackControl {
    running: Arc<AtomicBool>,
    description: String,
}

impl StreamControl for LoopbackControl {
    fn start(&mut self) -> Result<(), StreamError> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stream::{Direction, StreamConfig};

    fn duplex(sample_rate: u32) -> DuplexConfig {
        DuplexConfig {
            playback: StreamConfig::mono16(sample_rate, 32, Direction::Playback),
            capture: StreamConfig::mono16(sample_rate, 32, Direction::Capture),
        }
    }

    #[test]
    fn test_delay_is_exact() {
        let provider = LoopbackProvider::new(10).with_pacing(Pacing::Chunk(8));
        let mut opened = provider.open(&duplex(16000)).unwrap();
        opened.control.start().unwrap();

        assert_eq!(opened.playback.write(&[5, 5, 6, 6]).unwrap(), 4);

        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        for _ in 0..5 {
            let n = opened.capture.read(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        // 10 frames of delay = 20 bytes of leading silence
        assert!(out[..20].iter().all(|&b| b == 0));
        assert_eq!(&out[20..24], &[5, 5, 6, 6]);
        assert!(out[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_not_running_before_start() {
        let provider = LoopbackProvider::new(0).with_pacing(Pacing::Chunk(8));
        let mut opened = provider.open(&duplex(16000)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(opened.playback.write(&[1, 1]).unwrap(), 0);
        assert_eq!(opened.capture.read(&mut buf).unwrap(), 0);

        opened.control.start().unwrap();
        opened.control.stop().unwrap();
        assert_eq!(opened.capture.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_queue_backpressure() {
        let provider = LoopbackProvider::new(0)
            .with_pacing(Pacing::Chunk(4))
            .with_queue_bytes(8);
        let mut opened = provider.open(&duplex(8000)).unwrap();
        opened.control.start().unwrap();

        assert_eq!(opened.playback.write(&[1; 12]).unwrap(), 8);
        assert_eq!(opened.playback.queued_bytes(), Some(8));
        assert_eq!(opened.playback.write(&[1; 2]).unwrap(), 0);

        let mut buf = [0u8; 4];
        opened.capture.read(&mut buf).unwrap();
        assert_eq!(opened.playback.queued_bytes(), Some(4));
        assert_eq!(opened.playback.timestamp().unwrap().frame_position, 2);
    }

    #[test]
    fn test_rejects_mismatched_rates() {
        let mut config = duplex(16000);
        config.capture.sample_rate = 48000;
        assert!(matches!(
            LoopbackProvider::new(0).open(&config),
            Err(StreamError::Unsupported(_))
        ));
    }

    #[test]
    fn test_realtime_pacing_delivers_over_time() {
        let provider = LoopbackProvider::new(0);
        let mut opened = provider.open(&duplex(16000)).unwrap();
        opened.control.start().unwrap();
        let mut buf = vec![0u8; 16000];
        opened.capture.read(&mut buf).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let n = opened.capture.read(&mut buf).unwrap();
        // At least 20 ms worth at 16 kHz
        assert!(n >= 640, "got {} bytes", n);
        assert_eq!(n % 2, 0);
    }

    #[test]
    fn test_from_delay_ms() {
        assert_eq!(LoopbackProvider::from_delay_ms(10.0, 16000).delay_frames(), 160);
        assert_eq!(LoopbackProvider::from_delay_ms(-3.0, 16000).delay_frames(), 0);
    }
}
