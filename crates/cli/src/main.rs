use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sdcc_core::{
    classify, CloneError, CloneReport, CommandRunner, DeviceCatalog, DeviceInfo, DevicePair,
    LoopOptions, Orchestrator, SysBlockProvider, SystemClock,
};

mod hardware;

use hardware::{
    GpioPanel, GpioSignal, SimulatedPanel, SimulatedProvider, SimulatedRunner, SimulatedSignal,
};

#[derive(Debug, Parser)]
#[command(
    name = "sdcc",
    version,
    about = "Headless one-button appliance that clones the smaller of two attached storage devices onto the larger."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the appliance loop against real GPIO hardware and block devices.
    Run(RunArgs),
    /// Run the appliance loop with simulated hardware and devices.
    Simulate(SimulateArgs),
    /// Show detected clone candidates and what a clone would pick.
    Doctor(DoctorArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Sysfs GPIO value file for the start button (active-low).
    #[arg(long, value_name = "FILE", default_value = "/sys/class/gpio/gpio17/value")]
    button: PathBuf,

    /// Sysfs GPIO value file for the Ready LED.
    #[arg(long, value_name = "FILE", default_value = "/sys/class/gpio/gpio22/value")]
    led_ready: PathBuf,

    /// Sysfs GPIO value file for the Cloning LED.
    #[arg(long, value_name = "FILE", default_value = "/sys/class/gpio/gpio23/value")]
    led_cloning: PathBuf,

    /// Sysfs GPIO value file for the Done LED.
    #[arg(long, value_name = "FILE", default_value = "/sys/class/gpio/gpio24/value")]
    led_done: PathBuf,

    /// Button sampling interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    poll_interval_ms: u64,

    /// Directory for temporary mount points during content copies.
    #[arg(long, value_name = "DIR", default_value = "/mnt")]
    scratch_dir: PathBuf,

    /// Write a JSON report for every attempt into this directory.
    #[arg(long, value_name = "DIR")]
    report_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// How many simulated button presses to run before exiting.
    #[arg(long, default_value_t = 1)]
    presses: u64,

    /// Seconds between simulated presses.
    #[arg(long, default_value_t = 10)]
    press_interval_secs: u64,

    /// Write a JSON report for every attempt into this directory.
    #[arg(long, value_name = "DIR")]
    report_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DoctorArgs {
    /// Optional JSON output file.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    devices: Vec<DeviceInfo>,
    pair: Option<DevicePair>,
    error: Option<String>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_command(args),
        Commands::Simulate(args) => simulate_command(args),
        Commands::Doctor(args) => doctor_command(args),
    }
}

fn run_command(args: RunArgs) -> Result<()> {
    warn_if_not_root();
    claim_hardware(&args)?;
    let cancel = install_shutdown_flag()?;

    let provider = SysBlockProvider::default();
    let runner = CommandRunner;
    let mut signal = GpioSignal::new(&args.button);
    let mut panel = GpioPanel::new(&args.led_ready, &args.led_cloning, &args.led_done);
    let mut clock = SystemClock::default();

    let options = LoopOptions {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        max_attempts: None,
        cancel_flag: Some(cancel),
    };

    let report_dir = args.report_dir.clone();
    let mut orchestrator = Orchestrator::new(&mut signal, &mut panel, &mut clock, &provider, &runner)
        .with_scratch_dir(&args.scratch_dir);
    orchestrator.run_loop(&options, &mut |report| {
        emit_report(report, report_dir.as_deref());
    });

    info!("appliance stopped");
    Ok(())
}

fn simulate_command(args: SimulateArgs) -> Result<()> {
    let cancel = install_shutdown_flag()?;

    let provider = SimulatedProvider;
    let runner = SimulatedRunner;
    let poll_interval = Duration::from_millis(100);
    let polls_per_press = args.press_interval_secs * 1000 / 100;
    let mut signal = SimulatedSignal::new(polls_per_press);
    let mut panel = SimulatedPanel::default();
    let mut clock = SystemClock::default();

    let options = LoopOptions {
        poll_interval,
        max_attempts: Some(args.presses),
        cancel_flag: Some(cancel),
    };

    info!(
        "simulation: {} press(es), one every {}s",
        args.presses, args.press_interval_secs
    );
    let report_dir = args.report_dir.clone();
    let mut orchestrator =
        Orchestrator::new(&mut signal, &mut panel, &mut clock, &provider, &runner);
    orchestrator.run_loop(&options, &mut |report| {
        emit_report(report, report_dir.as_deref());
    });

    info!("simulation finished");
    Ok(())
}

fn doctor_command(args: DoctorArgs) -> Result<()> {
    let provider = SysBlockProvider::default();
    let devices = DeviceCatalog::new(&provider).list_candidates();

    println!("Detected {} clone candidate(s):", devices.len());
    for device in &devices {
        println!(
            "  {} ({}) {:.2} GB - {}",
            device.path, device.kernel_name, device.size_gb, device.model
        );
    }

    let report = match classify(&devices) {
        Ok(pair) => {
            println!(
                "Source: {} ({:.2} GB)",
                pair.source.path, pair.source.size_gb
            );
            println!(
                "Destination: {} ({:.2} GB)",
                pair.destination.path, pair.destination.size_gb
            );
            if pair.ok {
                println!("Pair is valid; a button press would clone it.");
            } else {
                println!(
                    "Pair is invalid: {}",
                    pair.reason.as_deref().unwrap_or("unknown reason")
                );
            }
            DoctorReport {
                devices,
                pair: Some(pair),
                error: None,
            }
        }
        Err(CloneError::InsufficientDevices { found }) => {
            println!("Not enough devices to clone (found {found}, need 2).");
            DoctorReport {
                devices,
                pair: None,
                error: Some(format!("insufficient devices: {found}")),
            }
        }
        Err(err) => {
            println!("Classification failed: {err}");
            DoctorReport {
                devices,
                pair: None,
                error: Some(err.to_string()),
            }
        }
    };

    if let Some(output) = args.output {
        let payload = serde_json::to_string_pretty(&report)
            .context("failed to serialize doctor report")?;
        fs::write(&output, payload)
            .with_context(|| format!("failed to write {}", output.display()))?;
        println!("Doctor report written to {}", output.display());
    }

    Ok(())
}

/// Fails fast when the GPIO value files cannot be used, instead of letting
/// the loop spin against dead hardware.
fn claim_hardware(args: &RunArgs) -> Result<()> {
    fs::read_to_string(&args.button)
        .with_context(|| format!("cannot read button input {}", args.button.display()))?;
    for (name, path) in [
        ("ready", &args.led_ready),
        ("cloning", &args.led_cloning),
        ("done", &args.led_done),
    ] {
        fs::write(path, "0")
            .with_context(|| format!("cannot drive {name} led {}", path.display()))?;
    }
    Ok(())
}

fn warn_if_not_root() {
    let Ok(status) = fs::read_to_string("/proc/self/status") else {
        return;
    };
    let euid = status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().nth(1).map(str::to_string));
    if euid.is_some_and(|euid| euid != "0") {
        warn!("not running as root; block device access and mounts will likely fail");
    }
}

fn install_shutdown_flag() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install shutdown handler")?;
    Ok(cancel)
}

/// Logs the attempt outcome and, when a report directory is configured,
/// persists the full report as JSON. Persistence failures are logged and
/// never stop the loop.
fn emit_report(report: &CloneReport, report_dir: Option<&Path>) {
    if report.outcome.succeeded {
        info!("attempt {} succeeded", report.attempt_id);
    } else {
        warn!(
            "attempt {} failed: {}",
            report.attempt_id,
            report.outcome.error_detail.as_deref().unwrap_or("unknown")
        );
    }
    let Some(dir) = report_dir else {
        return;
    };
    if let Err(err) = write_report(report, dir) {
        warn!("failed to persist report {}: {err}", report.attempt_id);
    }
}

fn write_report(report: &CloneReport, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("clone-{}.json", report.attempt_id));
    let payload = serde_json::to_string_pretty(report)?;
    fs::write(&path, payload)?;
    info!("report written to {}", path.display());
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
