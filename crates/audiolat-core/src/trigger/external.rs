//! External MIDI device triggers (through midir)
//!
//! Any channel or system-common message arriving on the selected input port
//! is a trigger. The event is stamped when the callback runs, not when the
//! loop thread picks it up, so queueing delay does not skew the timestamp.

use super::{monotonic_nanos, Debouncer, TriggerMailbox};
use midir::{MidiInput, MidiInputConnection};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// First status byte of the system real-time range (clock, active sensing, ...)
const REALTIME_STATUS: u8 = 0xF8;

/// Error type for MIDI operations
#[derive(Debug, thiserror::Error)]
pub enum MidiError {
    #[error("Failed to initialize MIDI: {0}")]
    InitFailed(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// How to pick the MIDI input port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelector {
    /// First available port
    First,
    /// Port by enumeration index
    Index(usize),
    /// First port whose name contains the pattern
    Name(String),
}

impl PortSelector {
    /// Parse a CLI value: empty = first port, digits = index, otherwise a name pattern
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            PortSelector::First
        } else if let Ok(index) = value.parse::<usize>() {
            PortSelector::Index(index)
        } else {
            PortSelector::Name(value.to_string())
        }
    }
}

/// Information about a discovered MIDI port
#[derive(Debug, Clone)]
pub struct MidiPortInfo {
    pub index: usize,
    pub name: String,
}

/// List available MIDI input ports
pub fn list_input_ports() -> Result<Vec<MidiPortInfo>, MidiError> {
    let midi_in =
        MidiInput::new("audiolat-scan").map_err(|e| MidiError::InitFailed(e.to_string()))?;

    let ports = midi_in
        .ports()
        .iter()
        .enumerate()
        .filter_map(|(index, port)| {
            midi_in
                .port_name(port)
                .ok()
                .map(|name| MidiPortInfo { index, name })
        })
        .collect();

    Ok(ports)
}

/// Whether a raw MIDI message should fire a probe
pub fn is_trigger_message(data: &[u8]) -> bool {
    matches!(data.first(), Some(&status) if status < REALTIME_STATUS)
}

/// Active MIDI input feeding the trigger mailbox
pub struct MidiTriggerListener {
    connection: Option<MidiInputConnection<()>>,
    pub port_name: String,
    messages_received: Arc<AtomicU64>,
}

impl MidiTriggerListener {
    /// Open the selected port and start posting triggers
    pub fn open(selector: &PortSelector, mailbox: TriggerMailbox) -> Result<Self, MidiError> {
        let midi_in =
            MidiInput::new("audiolat-in").map_err(|e| MidiError::InitFailed(e.to_string()))?;

        let ports = midi_in.ports();
        let port = match selector {
            PortSelector::First => ports.first(),
            PortSelector::Index(i) => ports.get(*i),
            PortSelector::Name(pattern) => ports.iter().find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n.contains(pattern.as_str()))
                    .unwrap_or(false)
            }),
        }
        .ok_or_else(|| MidiError::PortNotFound(format!("{:?}", selector)))?;

        let port_name = midi_in
            .port_name(port)
            .map_err(|e| MidiError::ConnectionFailed(e.to_string()))?;

        let messages_received = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&messages_received);
        let mut debouncer = Debouncer::default();

        let connection = midi_in
            .connect(
                port,
                "audiolat-trigger",
                move |_device_us, data, _| {
                    let arrival = monotonic_nanos();
                    if !is_trigger_message(data) {
                        return;
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                    if debouncer.accept(arrival) {
                        mailbox.post_external(data, arrival);
                    } else {
                        debug!(arrival, "MIDI trigger debounced");
                    }
                },
                (),
            )
            .map_err(|e| MidiError::ConnectionFailed(e.to_string()))?;

        info!("Opened MIDI trigger input: {}", port_name);

        Ok(Self {
            connection: Some(connection),
            port_name,
            messages_received,
        })
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Close the connection
    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close();
            info!(
                messages = self.messages_received(),
                "Closed MIDI trigger input: {}", self.port_name
            );
        }
    }
}

impl Drop for MidiTriggerListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_selector_parse() {
        assert_eq!(PortSelector::parse(""), PortSelector::First);
        assert_eq!(PortSelector::parse("2"), PortSelector::Index(2));
        assert_eq!(
            PortSelector::parse("USB MIDI"),
            PortSelector::Name("USB MIDI".to_string())
        );
    }

    #[test]
    fn test_trigger_message_filter() {
        assert!(is_trigger_message(&[0x90, 0x40, 0x7F]));
        assert!(is_trigger_message(&[0x80, 0x40, 0x00]));
        assert!(!is_trigger_message(&[0xF8]));
        assert!(!is_trigger_message(&[0xFE]));
        assert!(!is_trigger_message(&[]));
    }
}
