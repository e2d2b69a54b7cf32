//! E2E tests for probe triggers
//!
//! Probes can start from the capture-clock timer, from an external device
//! callback posting into the session mailbox, or from a USB-MIDI byte source.
//! Whatever the source, a trigger only starts a probe when none is in flight.

use audiolat::audio::loopback::{LoopbackProvider, Pacing};
use audiolat::session::{Session, SessionStatus};
use audiolat::trigger::monotonic_nanos;
use audiolat::{SessionConfig, TriggerMode};
use std::io::Write;
use std::path::Path;

fn config(output: &Path) -> SessionConfig {
    SessionConfig {
        sample_rate: 16000,
        timeout_sec: 0.3,
        interval_sec: -1.0,
        poll_interval_us: 0,
        output: Some(output.to_path_buf()),
        write_report: false,
        ..Default::default()
    }
}

fn first_sample(path: &Path) -> i16 {
    let raw = std::fs::read(path).unwrap();
    i16::from_le_bytes([raw[0], raw[1]])
}

/// An external post before the loop starts fires exactly one probe
#[test]
fn test_external_trigger_starts_probe() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("external.raw");

    let session = Session::from_config(config(&output)).unwrap();
    assert!(session
        .mailbox()
        .post_external(&[0x90, 0x40, 0x00], monotonic_nanos()));

    let report = session
        .run(&LoopbackProvider::new(0).with_pacing(Pacing::Chunk(128)))
        .unwrap();

    assert_eq!(report.status, SessionStatus::Success);
    assert_eq!(report.counters.probes_started, 1);
    assert_eq!(report.counters.overlays_completed, 1);
    assert_eq!(report.triggers_posted, 1);
    assert_eq!(first_sample(&output), i16::MAX);
}

/// Timer and external trigger pending at once still start a single probe
#[test]
fn test_pending_triggers_coalesce() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("coalesce.raw");

    let session = Session::from_config(SessionConfig {
        interval_sec: 10.0,
        ..config(&output)
    })
    .unwrap();
    session.mailbox().post_external(&[], monotonic_nanos());

    let report = session
        .run(&LoopbackProvider::new(0).with_pacing(Pacing::Chunk(128)))
        .unwrap();

    assert_eq!(report.triggers_posted, 2);
    assert_eq!(report.counters.probes_started, 1);
}

/// A note-on with velocity 0 on the USB-MIDI source fires a probe
#[test]
fn test_usb_trigger_session() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("usb.raw");
    let device = dir.path().join("midi1");
    {
        let mut f = std::fs::File::create(&device).unwrap();
        // Note-off noise, then the trigger packet
        f.write_all(&[0x18, 0x81, 0x40, 0x00, 0x19, 0x91, 0x40, 0x00])
            .unwrap();
    }

    let session = Session::from_config(SessionConfig {
        trigger: TriggerMode::Usb,
        usb_device: Some(device),
        timeout_sec: 0.5,
        poll_interval_us: 1000,
        ..config(&output)
    })
    .unwrap();
    let report = session.run(&LoopbackProvider::new(0)).unwrap();

    assert_eq!(report.status, SessionStatus::Success);
    assert_eq!(report.triggers_posted, 1);
    assert_eq!(report.counters.probes_started, 1);
    assert_eq!(report.counters.overlays_started, 1);
}

/// A missing USB-MIDI source fails before the loop starts
#[test]
fn test_usb_source_missing() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("usb_missing.raw");

    let session = Session::from_config(SessionConfig {
        trigger: TriggerMode::Usb,
        usb_device: Some(dir.path().join("no-such-device")),
        ..config(&output)
    })
    .unwrap();
    let err = session
        .run(&LoopbackProvider::new(0).with_pacing(Pacing::Chunk(128)))
        .unwrap_err();

    assert_eq!(err.status(), SessionStatus::DeviceOpenFailed);
    assert!(!output.exists());
}
