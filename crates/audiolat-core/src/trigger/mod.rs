//! Probe triggers
//!
//! Three producers can start a probe:
//! - the interval timer, evaluated on the loop thread in capture time ([`IntervalTimer`])
//! - an external MIDI device ([`external`])
//! - a raw USB-MIDI byte stream ([`usb`])
//!
//! All of them post a [`TriggerEvent`] into one shared [`TriggerMailbox`].
//! The mailbox holds at most one event and refuses new ones while a probe
//! started from it is still in flight.

pub mod external;
pub mod usb;

use serde::Serialize;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// Minimum spacing between accepted device triggers (1ms)
pub const DEBOUNCE_NS: u64 = 1_000_000;

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Process-wide monotonic clock in nanoseconds
///
/// Every trigger producer stamps events with this clock so timestamps from
/// different threads are directly comparable.
pub fn monotonic_nanos() -> u64 {
    let epoch = CLOCK_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Origin of a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Periodic probe derived from the capture frame counter
    Timer,
    /// Asynchronous event from an external device (MIDI port)
    ExternalDevice,
    /// Note event decoded from a USB-MIDI bulk stream
    Usb,
}

/// A request to fire a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TriggerEvent {
    pub source: TriggerSource,
    /// Arrival time on the [`monotonic_nanos`] clock
    pub timestamp_ns: u64,
}

impl TriggerEvent {
    pub fn new(source: TriggerSource, timestamp_ns: u64) -> Self {
        Self {
            source,
            timestamp_ns,
        }
    }

    /// Event stamped with the current monotonic time
    pub fn now(source: TriggerSource) -> Self {
        Self::new(source, monotonic_nanos())
    }
}

#[derive(Debug, Default)]
struct Slot {
    event: Option<TriggerEvent>,
    in_flight: bool,
    posted: u64,
    ignored: u64,
}

/// Single-slot mailbox between trigger producers and the loop thread
///
/// State machine: Idle -> Pending (`post`) -> InFlight (`begin`) -> Idle (`complete`).
/// While Pending, a later post replaces the earlier one. While InFlight,
/// posts are ignored.
#[derive(Debug, Clone, Default)]
pub struct TriggerMailbox {
    slot: Arc<Mutex<Slot>>,
}

impl TriggerMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an event; returns false if a probe is already in flight
    pub fn post(&self, event: TriggerEvent) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        if slot.in_flight {
            slot.ignored += 1;
            tracing::trace!(source = ?event.source, "trigger ignored, probe in flight");
            return false;
        }
        if let Some(previous) = slot.event.replace(event) {
            tracing::trace!(
                previous = ?previous.source,
                current = ?event.source,
                "pending trigger replaced"
            );
        }
        slot.posted += 1;
        true
    }

    /// Entry point for external device callbacks
    ///
    /// The payload content is not interpreted; only its arrival matters.
    pub fn post_external(&self, payload: &[u8], arrival_ns: u64) -> bool {
        tracing::debug!(
            len = payload.len(),
            arrival_ns,
            delay_us = monotonic_nanos().saturating_sub(arrival_ns) / 1000,
            "external trigger received"
        );
        self.post(TriggerEvent::new(TriggerSource::ExternalDevice, arrival_ns))
    }

    /// Move a pending event in flight and return it
    ///
    /// Returns `None` when nothing is pending or a probe is already in flight.
    pub fn begin(&self) -> Option<TriggerEvent> {
        let mut slot = self.slot.lock().ok()?;
        if slot.in_flight {
            return None;
        }
        let event = slot.event?;
        slot.in_flight = true;
        Some(event)
    }

    /// Finish the in-flight probe and re-arm the mailbox
    pub fn complete(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.event = None;
            slot.in_flight = false;
        }
    }

    /// Whether an event is waiting to be started
    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .map(|s| s.event.is_some() && !s.in_flight)
            .unwrap_or(false)
    }

    /// Whether a probe started from this mailbox is still running
    pub fn is_in_flight(&self) -> bool {
        self.slot.lock().map(|s| s.in_flight).unwrap_or(false)
    }

    /// (accepted, ignored) post counts
    pub fn counts(&self) -> (u64, u64) {
        self.slot
            .lock()
            .map(|s| (s.posted, s.ignored))
            .unwrap_or((0, 0))
    }
}

/// Drops events arriving too close to the last accepted one
///
/// Works in whatever clock domain the caller feeds it.
#[derive(Debug, Clone)]
pub struct Debouncer {
    min_gap_ns: u64,
    last_accepted_ns: Option<u64>,
}

impl Debouncer {
    pub fn new(min_gap_ns: u64) -> Self {
        Self {
            min_gap_ns,
            last_accepted_ns: None,
        }
    }

    /// Returns true and records the time if the event should pass
    pub fn accept(&mut self, timestamp_ns: u64) -> bool {
        if let Some(last) = self.last_accepted_ns {
            if timestamp_ns.saturating_sub(last) < self.min_gap_ns {
                return false;
            }
        }
        self.last_accepted_ns = Some(timestamp_ns);
        true
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEBOUNCE_NS)
    }
}

/// Periodic trigger in the capture clock domain
///
/// Disabled when the interval is zero or negative. The first probe fires
/// immediately at capture time zero.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    interval_sec: f64,
    last_probe_sec: f64,
}

impl IntervalTimer {
    pub fn new(interval_sec: f64) -> Self {
        Self {
            interval_sec,
            last_probe_sec: -interval_sec,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval_sec > 0.0
    }

    /// Whether a probe is due at `capture_sec`
    pub fn is_due(&self, capture_sec: f64) -> bool {
        self.is_enabled() && capture_sec - self.last_probe_sec >= self.interval_sec
    }

    /// Record that a probe (from any source) started at `capture_sec`
    pub fn mark(&mut self, capture_sec: f64) {
        self.last_probe_sec = capture_sec;
    }

    pub fn interval_sec(&self) -> f64 {
        self.interval_sec
    }
}
