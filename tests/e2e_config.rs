//! E2E tests for session configuration files
//!
//! A config file drives a whole session: missing keys fall back to defaults,
//! invalid values are rejected before any device or file is touched.

use audiolat::audio::loopback::{LoopbackProvider, Pacing};
use audiolat::config::{ConfigError, PerformanceMode, Usage};
use audiolat::session::{Session, SessionError, SessionStatus};
use audiolat::SessionConfig;

#[test]
fn test_config_file_drives_session() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("from_file.raw");
    let config_path = dir.path().join("audiolat.json");
    std::fs::write(
        &config_path,
        format!(
            r#"{{
                "sample_rate": 8000,
                "timeout_sec": 0.25,
                "interval_sec": 0.1,
                "poll_interval_us": 0,
                "usage": "media",
                "output": {:?}
            }}"#,
            output
        ),
    )
    .unwrap();

    let config = SessionConfig::load(&config_path).unwrap();
    assert_eq!(config.sample_rate, 8000);
    assert_eq!(config.usage, Usage::Media);
    assert_eq!(config.performance_mode, PerformanceMode::LowLatency);

    let report = Session::from_config(config)
        .unwrap()
        .run(&LoopbackProvider::new(0).with_pacing(Pacing::Chunk(128)))
        .unwrap();
    assert_eq!(report.status, SessionStatus::Success);
    assert_eq!(report.sample_rate, 8000);
    // Probes at 0, 0.1 and 0.2 s of capture time
    assert_eq!(report.counters.probes_started, 3);
}

#[test]
fn test_saved_config_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("saved.json");

    let config = SessionConfig {
        sample_rate: 48000,
        end_gain_db: -12.0,
        strict_sink: true,
        ..Default::default()
    };
    config.save(&path).unwrap();
    assert_eq!(SessionConfig::load(&path).unwrap(), config);
}

#[test]
fn test_invalid_config_rejected_by_session() {
    let config = SessionConfig {
        timeout_sec: 0.0,
        ..Default::default()
    };
    assert!(matches!(
        Session::from_config(config),
        Err(SessionError::Config(ConfigError::InvalidTimeout(_)))
    ));

    let config = SessionConfig {
        record_buffer_bytes: 33,
        ..Default::default()
    };
    assert!(matches!(
        Session::from_config(config),
        Err(SessionError::Config(ConfigError::OddBufferSize { .. }))
    ));
}
