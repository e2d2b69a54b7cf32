//! USB-MIDI bulk stream decoding
//!
//! USB-MIDI packs every message into a 4-byte packet:
//!
//! ```text
//! byte 0: [high nibble: cable/channel][low nibble: event code]
//! byte 1..3: MIDI payload
//! ```
//!
//! Bulk transfers arrive in arbitrary sizes, so the decoder keeps up to three
//! trailing bytes between chunks and only decodes complete 4-byte groups.
//!
//! A probe is triggered by `event == 9` with the last payload byte equal to
//! zero, i.e. a note-on with velocity 0. This is the convention used by the
//! trigger hardware and is kept as-is.

use super::{monotonic_nanos, Debouncer, TriggerEvent, TriggerMailbox, TriggerSource};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thread_priority::ThreadPriority;

/// USB-MIDI packet size in bytes
pub const FRAME_SIZE: usize = 4;

/// Event code that can fire a probe
pub const TRIGGER_EVENT: u8 = 9;

/// Default bulk endpoint max packet size
pub const DEFAULT_PACKET_SIZE: usize = 64;

/// Sleep between polls when the source has nothing to offer
const IDLE_POLL: Duration = Duration::from_millis(10);

/// How many idle polls `stop` waits for the thread before detaching
const STOP_WAIT_POLLS: u32 = 5;

/// One decoded USB-MIDI packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbMidiFrame {
    /// High nibble of byte 0
    pub channel: u8,
    /// Low nibble of byte 0
    pub event: u8,
    pub data1: u8,
    pub data2: u8,
    pub data3: u8,
}

impl UsbMidiFrame {
    pub fn from_bytes(b: [u8; FRAME_SIZE]) -> Self {
        Self {
            channel: (b[0] >> 4) & 0x0F,
            event: b[0] & 0x0F,
            data1: b[1],
            data2: b[2],
            data3: b[3],
        }
    }

    /// Whether this packet fires a probe
    pub fn is_trigger(&self) -> bool {
        self.event == TRIGGER_EVENT && self.data3 == 0
    }
}

/// Incremental USB-MIDI decoder with carry-over and trigger debounce
#[derive(Debug, Clone, Default)]
pub struct UsbMidiDecoder {
    carry: Vec<u8>,
    debouncer: Debouncer,
}

impl UsbMidiDecoder {
    pub fn new() -> Self {
        Self {
            carry: Vec::with_capacity(FRAME_SIZE),
            debouncer: Debouncer::default(),
        }
    }

    /// Bytes held over from previous chunks (always < 4)
    pub fn pending_len(&self) -> usize {
        self.carry.len()
    }

    /// Decode all complete packets, keeping the incomplete tail
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<UsbMidiFrame> {
        self.carry.extend_from_slice(chunk);
        let usable = self.carry.len() / FRAME_SIZE * FRAME_SIZE;

        let frames = self.carry[..usable]
            .chunks_exact(FRAME_SIZE)
            .map(|c| UsbMidiFrame::from_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        self.carry.drain(..usable);
        frames
    }

    /// Decode a chunk captured at `timestamp_ns` and return a trigger if one fired
    ///
    /// Every trigger packet in the chunk shares the chunk's timestamp, so at
    /// most one survives the debounce.
    pub fn feed(&mut self, chunk: &[u8], timestamp_ns: u64) -> Option<TriggerEvent> {
        let mut fired = None;
        for frame in self.decode(chunk) {
            if !frame.is_trigger() {
                if frame.event == TRIGGER_EVENT {
                    tracing::trace!(velocity = frame.data3, "usb midi note on");
                }
                continue;
            }
            if self.debouncer.accept(timestamp_ns) {
                fired = Some(TriggerEvent::new(TriggerSource::Usb, timestamp_ns));
            } else {
                tracing::trace!(timestamp_ns, "usb midi trigger debounced");
            }
        }
        fired
    }
}

/// Handle to a running [`UsbMidiPoller`] thread
pub struct UsbPollerHandle {
    stop_flag: Arc<AtomicBool>,
    chunks_read: Arc<AtomicU64>,
    triggers: Arc<AtomicU64>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl UsbPollerHandle {
    /// Stop polling
    ///
    /// Joins the thread unless it is parked in a blocking read, in which case
    /// it exits on its own after the read returns.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(h) = self.thread.take() {
            for _ in 0..STOP_WAIT_POLLS {
                if h.is_finished() {
                    break;
                }
                std::thread::sleep(IDLE_POLL);
            }
            if h.is_finished() {
                let _ = h.join();
            } else {
                tracing::debug!("USB poller blocked in read, detaching");
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn chunks_read(&self) -> u64 {
        self.chunks_read.load(Ordering::Relaxed)
    }

    pub fn triggers(&self) -> u64 {
        self.triggers.load(Ordering::Relaxed)
    }
}

impl Drop for UsbPollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Polls a USB-MIDI byte source on a dedicated thread
pub struct UsbMidiPoller {
    packet_size: usize,
}

impl UsbMidiPoller {
    pub fn new(packet_size: usize) -> Self {
        Self {
            packet_size: packet_size.max(FRAME_SIZE),
        }
    }

    /// Spawn the poll thread, posting decoded triggers into `mailbox`
    pub fn start<R>(self, source: R, mailbox: TriggerMailbox) -> std::io::Result<UsbPollerHandle>
    where
        R: Read + Send + 'static,
    {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let chunks_read = Arc::new(AtomicU64::new(0));
        let triggers = Arc::new(AtomicU64::new(0));

        let flag = Arc::clone(&stop_flag);
        let chunks = Arc::clone(&chunks_read);
        let fired = Arc::clone(&triggers);

        let thread = std::thread::Builder::new()
            .name("usb-midi-poller".into())
            .spawn(move || {
                if let Err(e) = thread_priority::set_current_thread_priority(ThreadPriority::Max) {
                    tracing::debug!(error = ?e, "Could not raise USB poller priority");
                }
                self.poll_loop(source, mailbox, flag, chunks, fired);
            })?;

        Ok(UsbPollerHandle {
            stop_flag,
            chunks_read,
            triggers,
            thread: Some(thread),
        })
    }

    fn poll_loop<R: Read>(
        &self,
        mut source: R,
        mailbox: TriggerMailbox,
        stop_flag: Arc<AtomicBool>,
        chunks_read: Arc<AtomicU64>,
        triggers: Arc<AtomicU64>,
    ) {
        let mut decoder = UsbMidiDecoder::new();
        let mut buf = vec![0u8; self.packet_size];
        tracing::info!(packet_size = self.packet_size, "USB-MIDI poller running");

        while !stop_flag.load(Ordering::Acquire) {
            let len = match source.read(&mut buf) {
                Ok(0) => {
                    std::thread::sleep(IDLE_POLL);
                    continue;
                }
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    std::thread::sleep(IDLE_POLL);
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "USB-MIDI read failed, poller stopping");
                    break;
                }
            };

            let arrival = monotonic_nanos();
            chunks_read.fetch_add(1, Ordering::Relaxed);

            if let Some(event) = decoder.feed(&buf[..len], arrival) {
                triggers.fetch_add(1, Ordering::Relaxed);
                if mailbox.post(event) {
                    tracing::debug!(timestamp_ns = event.timestamp_ns, "USB-MIDI trigger");
                }
            }
        }

        tracing::info!(
            chunks = chunks_read.load(Ordering::Relaxed),
            triggers = triggers.load(Ordering::Relaxed),
            "USB-MIDI poller stopped"
        );
    }
}

impl Default for UsbMidiPoller {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_SIZE)
    }
}
