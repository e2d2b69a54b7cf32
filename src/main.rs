//! Audiolat - round-trip audio latency probe
//!
//! Plays an end-signal on every probe, records the input to a raw 16-bit
//! mono file and stamps a begin-marker into the capture where each probe
//! started. The delay is the distance between marker and recorded signal.

use anyhow::{Context, Result};
use audiolat::audio::engine::CpalProvider;
use audiolat::audio::loopback::LoopbackProvider;
use audiolat::audio::signal::SignalKind;
use audiolat::config::{ContentType, PerformanceMode, SessionConfig, TriggerMode, Usage};
use audiolat::session::{Session, SessionReport, SessionStatus};
use audiolat::trigger::external::list_input_ports;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "audiolat", version, about = "Round-trip audio latency probe")]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sample rate in Hz
    #[arg(long = "sr")]
    sample_rate: Option<u32>,

    /// Stop after this many seconds of captured audio
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Record buffer size in bytes (0 = device minimum)
    #[arg(long = "rbs")]
    record_buffer: Option<usize>,

    /// Playback buffer size in bytes (0 = device minimum)
    #[arg(long = "pbs")]
    playback_buffer: Option<usize>,

    /// Seconds between periodic probes (<= 0 disables them)
    #[arg(long = "tbs", allow_negative_numbers = true)]
    interval: Option<f64>,

    /// Built-in end-signal: chirp or noise
    #[arg(long)]
    signal: Option<SignalKind>,

    /// Output usage hint
    #[arg(long)]
    usage: Option<Usage>,

    /// Output content type hint
    #[arg(long)]
    content_type: Option<ContentType>,

    /// Stream performance mode hint
    #[arg(long)]
    performance_mode: Option<PerformanceMode>,

    /// End-signal file (.wav or raw 16-bit LE mono)
    #[arg(long)]
    end_signal: Option<PathBuf>,

    /// Begin-marker file (.wav or raw 16-bit LE mono)
    #[arg(long)]
    begin_signal: Option<PathBuf>,

    /// Gain applied to the end-signal in dB
    #[arg(long, allow_negative_numbers = true)]
    end_gain_db: Option<f32>,

    /// Capture file (default: timestamped name in the working directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Capture device name substring
    #[arg(long)]
    input_device: Option<String>,

    /// Playback device name substring
    #[arg(long)]
    output_device: Option<String>,

    /// Trigger probes from a MIDI input port (name substring or index)
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    midi: Option<String>,

    /// Trigger probes from a USB-MIDI byte source
    #[arg(long, conflicts_with = "midi")]
    usb: Option<PathBuf>,

    /// Use an in-process loopback with this round-trip delay in ms
    #[arg(long)]
    simulate: Option<f64>,

    /// Stop the session when a capture write fails
    #[arg(long)]
    strict_sink: bool,

    /// Do not write the JSON report next to the capture file
    #[arg(long)]
    no_report: bool,

    /// List audio devices and MIDI inputs, then exit
    #[arg(short, long)]
    list: bool,
}

impl Cli {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SessionConfig::default(),
        };

        if let Some(v) = self.sample_rate {
            config.sample_rate = v;
        }
        if let Some(v) = self.timeout {
            config.timeout_sec = v;
        }
        if let Some(v) = self.record_buffer {
            config.record_buffer_bytes = v;
        }
        if let Some(v) = self.playback_buffer {
            config.playback_buffer_bytes = v;
        }
        if let Some(v) = self.interval {
            config.interval_sec = v;
        }
        if let Some(v) = self.signal {
            config.signal = v;
        }
        if let Some(v) = self.usage {
            config.usage = v;
        }
        if let Some(v) = self.content_type {
            config.content_type = v;
        }
        if let Some(v) = self.performance_mode {
            config.performance_mode = v;
        }
        if let Some(v) = &self.end_signal {
            config.end_signal_path = Some(v.clone());
        }
        if let Some(v) = &self.begin_signal {
            config.begin_signal_path = Some(v.clone());
        }
        if let Some(v) = self.end_gain_db {
            config.end_gain_db = v;
        }
        if let Some(v) = &self.output {
            config.output = Some(v.clone());
        }
        if let Some(v) = &self.input_device {
            config.input_device = Some(v.clone());
        }
        if let Some(v) = &self.output_device {
            config.output_device = Some(v.clone());
        }
        if let Some(port) = &self.midi {
            config.trigger = TriggerMode::Midi;
            config.midi_port = (!port.is_empty()).then(|| port.clone());
        }
        if let Some(path) = &self.usb {
            config.trigger = TriggerMode::Usb;
            config.usb_device = Some(path.clone());
        }
        if self.strict_sink {
            config.strict_sink = true;
        }
        if self.no_report {
            config.write_report = false;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() {
    let code = match run() {
        Ok(status) => exit_code(status),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<SessionStatus> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("audiolat=info")),
        )
        .init();

    info!(
        "audiolat v{} (built {})",
        audiolat::VERSION,
        audiolat::BUILD_DATE
    );

    if cli.list {
        list_devices()?;
        return Ok(SessionStatus::Success);
    }

    let config = cli.session_config()?;
    let session = Session::from_config(config)?;

    let stop = session.stop_handle();
    ctrlc::set_handler(move || {
        warn!("Stop requested");
        stop.request_stop();
    })
    .context("installing Ctrl+C handler")?;

    let result = match cli.simulate {
        Some(delay_ms) => {
            let provider = LoopbackProvider::from_delay_ms(delay_ms, session.config().sample_rate);
            info!(delay_frames = provider.delay_frames(), "Using simulated loopback");
            session.run(&provider)
        }
        None => session.run(&CpalProvider::new()),
    };

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(report.status)
        }
        Err(e) => {
            let status = e.status();
            error!(status = ?status, "Session failed: {}", e);
            eprintln!("Session failed: {}", e);
            Ok(status)
        }
    }
}

fn exit_code(status: SessionStatus) -> i32 {
    match status {
        SessionStatus::Success => 0,
        SessionStatus::DeviceOpenFailed => 2,
        SessionStatus::SinkOpenFailed => 3,
        SessionStatus::StreamError => 4,
        SessionStatus::SinkWriteFailed => 5,
    }
}

fn print_report(report: &SessionReport) {
    println!();
    let cancelled = if report.cancelled { " (cancelled)" } else { "" };
    println!("Session: {:?}{}", report.status, cancelled);
    println!("  Output:        {}", report.output.display());
    println!("  Streams:       {}", report.streams);
    println!(
        "  Captured:      {} frames ({:.2} s)",
        report.frames_captured, report.captured_sec
    );
    println!(
        "  Probes:        {} started, {} completed, {} truncated",
        report.counters.probes_started,
        report.counters.probes_completed,
        report.counters.probes_truncated
    );
    println!("  Markers:       {} stamped", report.counters.overlays_completed);
    println!(
        "  Triggers:      {} accepted, {} ignored",
        report.triggers_posted, report.triggers_ignored
    );
    println!(
        "  Xruns:         {} playback, {} capture",
        report.playback_xruns, report.capture_xruns
    );
    if report.sink.bytes_dropped > 0 {
        println!(
            "  Dropped:       {} bytes ({} write errors)",
            report.sink.bytes_dropped, report.sink.write_errors
        );
    }
    if let Some(skew) = report.start_skew_ms() {
        println!("  Start skew:    {:.3} ms", skew);
    }
    if let Some(e) = &report.error {
        println!("  Error:         {}", e);
    }
}

fn list_devices() -> Result<()> {
    println!("Audio devices:");
    for device in CpalProvider::list_devices()? {
        println!(
            "  {}{}  in:{} out:{}  rates: {:?}",
            device.name,
            if device.is_default { " (default)" } else { "" },
            device.input_channels,
            device.output_channels,
            device.sample_rates
        );
    }

    println!();
    println!("MIDI inputs:");
    match list_input_ports() {
        Ok(ports) if ports.is_empty() => println!("  (none)"),
        Ok(ports) => {
            for port in ports {
                println!("  [{}] {}", port.index, port.name);
            }
        }
        Err(e) => println!("  unavailable: {}", e),
    }
    Ok(())
}
