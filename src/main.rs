use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pemf::config::BridgeConfig;
use pemf::controller::{PlaybackController, RunState};
use pemf::handshake::detect;
use pemf::link::{available_ports, SerialConnection, SerialConnector};
use pemf::recovery::{echo_violations, recover, Fix};
use pemf::registry::DeviceType;
use pemf::sim::SimulatedDevice;
use pemf::trace::{parse_capture, ProtocolTrace};
use pemf::Treatment;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod monitor;

/// Operator tool for the PEMF protocol bridge.
#[derive(Parser)]
#[command(name = "pemf_cli", version)]
struct Cli {
    /// Bridge settings (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports.
    Ports,
    /// Rebuild corrected traces from capture logs.
    Reconstruct {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Variant the captures were taken from (MR72, EM272B, EM27, MR772).
        #[arg(long)]
        device: DeviceType,
        /// Directory for the JSON output. Printed to stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Identify the device on a port.
    Detect {
        #[arg(long)]
        port: String,
    },
    /// Store a treatment and play it with a live monitor.
    Play {
        #[arg(long)]
        port: String,
        /// Treatment JSON: {"name": ..., "rows": [{"frequency_hz": ..., "duration_ms": ...}]}
        #[arg(long)]
        treatment: PathBuf,
        #[arg(long, default_value_t = 0)]
        start_row: usize,
    },
    /// Act as a device on a serial port.
    Simulate {
        #[arg(long)]
        port: String,
        #[arg(long)]
        device: DeviceType,
        #[arg(long, default_value = "00000001")]
        serial: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };

    // The monitor owns the terminal, so playback logs go to a file.
    let log_file = match (&cli.log_file, &cli.command) {
        (Some(path), _) => Some(path.clone()),
        (None, Command::Play { .. }) => Some(PathBuf::from("pemf_cli.log")),
        (None, _) => None,
    };
    init_logging(&config.logging.filter, log_file.as_deref())?;

    match cli.command {
        Command::Ports => list_ports(),
        Command::Reconstruct { files, device, out } => reconstruct(&files, device, out.as_deref()),
        Command::Detect { port } => detect_device(&config, &port),
        Command::Play {
            port,
            treatment,
            start_row,
        } => play(config, &port, &treatment, start_row).await,
        Command::Simulate {
            port,
            device,
            serial,
        } => simulate(&config, &port, device, &serial),
    }
}

fn init_logging(default_filter: &str, file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match file {
        Some(path) => {
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder.with_writer(log_file).with_ansi(false).init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = available_ports().context("could not enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{:<20} {}", port.name, port.description);
    }
    Ok(())
}

#[derive(Serialize)]
struct Reconstruction<'a> {
    source: String,
    device: DeviceType,
    fixes: &'a [Fix],
    trace: &'a ProtocolTrace,
}

fn reconstruct(files: &[PathBuf], device: DeviceType, out: Option<&Path>) -> Result<()> {
    let table = device.profile().commands;
    if let Some(dir) = out {
        fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    }

    for file in files {
        let raw = fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;
        let trace =
            parse_capture(&raw).with_context(|| format!("cannot parse {}", file.display()))?;
        let recovery = recover(&trace, &table)
            .with_context(|| format!("cannot recover {}", file.display()))?;

        eprintln!(
            "{}: {} stages, {} operations, {} fixes",
            file.display(),
            recovery.trace.stages.len(),
            recovery.trace.len(),
            recovery.fixes.len()
        );
        for fix in &recovery.fixes {
            eprintln!(
                "  fixed {}[{}] @{}: read 0x{:02X}, restored 0x{:02X}",
                fix.stage, fix.index, fix.tick, fix.observed, fix.restored
            );
        }
        let violations = echo_violations(&recovery.trace, &table);
        if !violations.is_empty() {
            bail!(
                "{}: {} echo violations remain after recovery",
                file.display(),
                violations.len()
            );
        }

        let json = serde_json::to_string_pretty(&Reconstruction {
            source: file.display().to_string(),
            device,
            fixes: &recovery.fixes,
            trace: &recovery.trace,
        })?;
        match out {
            Some(dir) => {
                let stem = file.file_stem().unwrap_or(file.as_os_str());
                let target = dir.join(stem).with_extension("json");
                fs::write(&target, json)
                    .with_context(|| format!("cannot write {}", target.display()))?;
                info!(target = %target.display(), "trace written");
            }
            None => println!("{json}"),
        }
    }
    Ok(())
}

fn detect_device(config: &BridgeConfig, port: &str) -> Result<()> {
    let timeout = config.handshake_timeout();
    let mut conn = SerialConnection::open(port, config.serial.baud_rate, timeout)?;
    let device = detect(&mut conn, config.handshake.attempts, timeout)
        .with_context(|| format!("handshake on {port} failed"))?;
    println!("{device}");
    Ok(())
}

async fn play(config: BridgeConfig, port: &str, path: &Path, start_row: usize) -> Result<()> {
    let json = fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let treatment: Treatment = serde_json::from_str(&json)
        .with_context(|| format!("{} is not a treatment", path.display()))?;

    let connector = SerialConnector {
        baud_rate: config.serial.baud_rate,
        timeout: config.handshake_timeout(),
    };
    let controller = PlaybackController::spawn(connector, config)?;
    let device = controller.connect(port).await?;
    println!("Connected to {device} on {port}");

    controller.load_treatment(treatment).await?;
    let mut status = controller.subscribe();
    let loaded = status
        .wait_for(|s| s.run_state == RunState::Loaded || s.last_error.is_some())
        .await?
        .clone();
    if let Some(err) = loaded.last_error {
        bail!("storing the treatment failed: {err}");
    }

    controller.start(start_row).await?;
    monitor::run(&controller).await
}

// Serves a simulated device over a real port, one byte at a time.
fn simulate(
    config: &BridgeConfig,
    port_name: &str,
    device_type: DeviceType,
    serial: &str,
) -> Result<()> {
    let mut device = SimulatedDevice::new(device_type, serial);
    let mut port = serialport::new(port_name, config.serial.baud_rate)
        .timeout(Duration::from_millis(10))
        .open()
        .with_context(|| format!("failed to open port '{port_name}'"))?;

    println!(
        "Simulating {} #{} on {} at {} baud. Press Ctrl+C to exit.",
        device.device_type, device.serial_number, port_name, config.serial.baud_rate
    );

    let mut serial_buf = [0u8; 128];
    loop {
        match port.read(&mut serial_buf) {
            Ok(bytes_read) => {
                for &byte in &serial_buf[..bytes_read] {
                    let response = device.receive(byte);
                    if !response.is_empty() {
                        port.write_all(&response)
                            .context("failed to write to serial port")?;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => (),
            Err(e) => return Err(e).context("serial port error"),
        }
    }
}
