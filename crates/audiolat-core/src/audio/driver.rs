//! Duplex loop driver
//!
//! Interleaves non-blocking playback writes and capture reads on one thread:
//!
//! 1. If no probe is running and a trigger is pending, start a probe. While a
//!    probe runs, feed the end-signal to the playback stream; otherwise feed
//!    silence.
//! 2. Read whatever capture data is available.
//! 3. On the first capture after a probe starts, overlay the begin-signal into
//!    the file stream. A begin-signal longer than one capture read continues
//!    at the head of the following reads, so it always lands contiguous in
//!    file order.
//! 4. Stop once captured time exceeds the timeout.
//!
//! All mutable loop state lives in [`LoopState`], owned by the loop thread.

use super::signal::SignalBuffer;
use super::sink::{CaptureSink, SinkError};
use super::stream::{CaptureStream, PlaybackStream, StreamError, StreamTimestamp};
use crate::trigger::{monotonic_nanos, IntervalTimer, TriggerEvent, TriggerMailbox, TriggerSource};
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative stop flag shared with the loop thread
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Loop parameters, fixed for a session
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub sample_rate: u32,
    pub timeout_sec: f64,
    /// Periodic probe interval; `<= 0` disables the timer
    pub interval_sec: f64,
    /// Capture working buffer size
    pub record_chunk_bytes: usize,
    /// Silence written per idle iteration when the backend cannot report its queue
    pub silence_bytes: usize,
    /// Playback fill level kept while idle, for backends that report their queue
    pub silence_target_bytes: usize,
    /// Sleep between iterations; zero only yields
    pub poll_interval: Duration,
}

impl LoopConfig {
    /// Frame count the capture must exceed to end the session
    pub fn timeout_frames(&self) -> u64 {
        (self.timeout_sec * self.sample_rate as f64).floor().max(0.0) as u64
    }
}

/// Per-session loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopCounters {
    pub iterations: u64,
    /// Reads that returned no data
    pub stalls: u64,
    pub probes_started: u64,
    pub probes_completed: u64,
    /// Probes ended early because playback accepted nothing
    pub probes_truncated: u64,
    /// Playback write calls carrying end-signal bytes
    pub signal_writes: u64,
    pub silence_writes: u64,
    /// Idle iterations where the playback queue was already fed
    pub silence_skipped: u64,
    pub overlays_started: u64,
    pub overlays_completed: u64,
}

/// Mutable loop state, owned by the loop thread
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub frames_captured: u64,
    /// Bytes of the end-signal already accepted by playback for the running probe
    pub player_offset: usize,
    /// Bytes of the begin-signal already overlaid into the capture
    pub rec_buffer_index: usize,
    /// A probe started and its overlay has not begun yet
    pub overlay_armed: bool,
    /// Trigger of the running probe
    pub probe: Option<TriggerEvent>,
    /// Capture time of the last probe start
    pub last_probe_sec: Option<f64>,
    /// Stream timestamps at the first captured data
    pub playback_start: Option<StreamTimestamp>,
    pub capture_start: Option<StreamTimestamp>,
    pub counters: LoopCounters,
}

impl LoopState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture_sec(&self, sample_rate: u32) -> f64 {
        self.frames_captured as f64 / sample_rate as f64
    }

    pub fn is_probe_active(&self) -> bool {
        self.probe.is_some()
    }
}

/// Why the loop stopped
#[derive(Debug)]
pub enum LoopOutcome {
    /// Captured time exceeded the timeout
    Timeout,
    /// Stop requested from outside
    Cancelled,
    /// A stream left the active state or failed an I/O call
    Stream(StreamError),
    /// Capture file write failed in strict mode
    Sink(SinkError),
}

/// Result of one loop iteration
#[derive(Debug)]
pub enum StepOutcome {
    Continue,
    Finished(LoopOutcome),
}

/// Steps the duplex loop over a playback stream, a capture stream and a sink
pub struct DuplexDriver<P, C, W: Write> {
    config: LoopConfig,
    playback: P,
    capture: C,
    sink: CaptureSink<W>,
    begin_signal: SignalBuffer,
    end_signal: SignalBuffer,
    mailbox: TriggerMailbox,
    timer: IntervalTimer,
    stop: StopHandle,
    silence: Vec<u8>,
    silence_len: usize,
    work: Vec<u8>,
    timeout_frames: u64,
}

impl<P, C, W> DuplexDriver<P, C, W>
where
    P: PlaybackStream,
    C: CaptureStream,
    W: Write,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LoopConfig,
        playback: P,
        capture: C,
        sink: CaptureSink<W>,
        begin_signal: SignalBuffer,
        end_signal: SignalBuffer,
        mailbox: TriggerMailbox,
        stop: StopHandle,
    ) -> Self {
        let silence_len = config.silence_bytes.max(2) & !1;
        let silence = vec![0u8; config.silence_target_bytes.max(silence_len) & !1];
        let work = vec![0u8; config.record_chunk_bytes.max(2) & !1];
        let timer = IntervalTimer::new(config.interval_sec);
        let timeout_frames = config.timeout_frames();
        Self {
            config,
            playback,
            capture,
            sink,
            begin_signal,
            end_signal,
            mailbox,
            timer,
            stop,
            silence,
            silence_len,
            work,
            timeout_frames,
        }
    }

    /// Run one iteration
    pub fn step(&mut self, state: &mut LoopState) -> StepOutcome {
        state.counters.iterations += 1;

        if self.stop.is_stop_requested() {
            return StepOutcome::Finished(LoopOutcome::Cancelled);
        }
        if let Err(e) = self.playback.health().and_then(|_| self.capture.health()) {
            return StepOutcome::Finished(LoopOutcome::Stream(e));
        }

        if let Err(e) = self.drive_playback(state) {
            return StepOutcome::Finished(LoopOutcome::Stream(e));
        }

        let captured = match self.capture.read(&mut self.work) {
            Ok(0) => {
                state.counters.stalls += 1;
                tracing::trace!(frames = state.frames_captured, "capture stall");
                return StepOutcome::Continue;
            }
            Ok(n) => n.min(self.work.len()) & !1,
            Err(e) => return StepOutcome::Finished(LoopOutcome::Stream(e)),
        };
        if captured == 0 {
            state.counters.stalls += 1;
            return StepOutcome::Continue;
        }

        if let Err(e) = self.write_capture(state, captured) {
            return StepOutcome::Finished(LoopOutcome::Sink(e));
        }

        state.frames_captured += (captured / 2) as u64;
        if state.capture_start.is_none() {
            state.capture_start = self.capture.timestamp();
            state.playback_start = self.playback.timestamp();
        }
        if state.frames_captured > self.timeout_frames {
            tracing::debug!(frames = state.frames_captured, "capture timeout reached");
            return StepOutcome::Finished(LoopOutcome::Timeout);
        }

        StepOutcome::Continue
    }

    /// Step until the loop finishes
    pub fn run(&mut self, state: &mut LoopState) -> LoopOutcome {
        loop {
            match self.step(state) {
                StepOutcome::Continue => {
                    if self.config.poll_interval.is_zero() {
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(self.config.poll_interval);
                    }
                }
                StepOutcome::Finished(outcome) => return outcome,
            }
        }
    }

    fn start_probe_if_pending(&mut self, state: &mut LoopState) {
        if state.probe.is_some() {
            return;
        }

        let capture_sec = state.capture_sec(self.config.sample_rate);
        if self.timer.is_due(capture_sec) {
            self.mailbox.post(TriggerEvent::now(TriggerSource::Timer));
        }

        let Some(event) = self.mailbox.begin() else {
            return;
        };

        state.probe = Some(event);
        state.overlay_armed = true;
        state.last_probe_sec = Some(capture_sec);
        state.counters.probes_started += 1;
        self.timer.mark(capture_sec);

        tracing::debug!(
            source = ?event.source,
            capture_sec,
            trigger_delay_us = monotonic_nanos().saturating_sub(event.timestamp_ns) / 1000,
            "probe started"
        );
    }

    fn drive_playback(&mut self, state: &mut LoopState) -> Result<(), StreamError> {
        self.start_probe_if_pending(state);

        if state.probe.is_some() {
            let end = self.end_signal.as_bytes();
            let accepted = self.playback.write(&end[state.player_offset..])?;
            state.counters.signal_writes += 1;
            state.player_offset = (state.player_offset + accepted).min(end.len());

            if state.player_offset >= end.len() || accepted == 0 {
                if accepted == 0 && state.player_offset < end.len() {
                    state.counters.probes_truncated += 1;
                    tracing::debug!(
                        offset = state.player_offset,
                        len = end.len(),
                        "playback accepted nothing, ending probe"
                    );
                }
                state.player_offset = 0;
                state.probe = None;
                state.counters.probes_completed += 1;
                self.mailbox.complete();
            }
            return Ok(());
        }

        // Top up to the target fill; unknown queues get one buffer per iteration
        let top_up = match self.playback.queued_bytes() {
            Some(queued) => self.silence.len().saturating_sub(queued) & !1,
            None => self.silence_len,
        };
        if top_up == 0 {
            state.counters.silence_skipped += 1;
        } else {
            self.playback.write(&self.silence[..top_up])?;
            state.counters.silence_writes += 1;
        }
        Ok(())
    }

    fn write_capture(&mut self, state: &mut LoopState, captured: usize) -> Result<(), SinkError> {
        let begin = self.begin_signal.as_bytes();
        let idx = state.rec_buffer_index;
        let overlay_active = (state.overlay_armed && idx == 0) || idx > 0;

        if !overlay_active {
            return self.sink.write(&self.work[..captured]);
        }

        let overlay = captured.min(begin.len() - idx);
        if idx == 0 {
            state.overlay_armed = false;
            state.counters.overlays_started += 1;
            self.sink.write(&self.work[..captured - overlay])?;
            self.sink.write(&begin[..overlay])?;
        } else {
            self.sink.write(&begin[idx..idx + overlay])?;
            self.sink.write(&self.work[overlay..captured])?;
        }

        state.rec_buffer_index += overlay;
        if state.rec_buffer_index >= begin.len() {
            state.rec_buffer_index = 0;
            state.counters.overlays_completed += 1;
            tracing::trace!(frames = state.frames_captured, "begin-signal overlay complete");
        }
        Ok(())
    }

    pub fn playback(&self) -> &P {
        &self.playback
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    pub fn sink(&self) -> &CaptureSink<W> {
        &self.sink
    }

    /// Give back the streams and the sink
    pub fn into_parts(self) -> (P, C, CaptureSink<W>) {
        (self.playback, self.capture, self.sink)
    }
}
