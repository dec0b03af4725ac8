//! Hardware-in-the-loop test runner.
//!
//! Builds, flashes and verifies every applicable test case on one attached
//! board, printing results in TAP format.
//!
//! Usage:
//!   cargo run --bin hil-runner -- --board nano_matter --variant matter
//!   PORT=/dev/ttyACM0 cargo run --bin hil-runner -- --board xg24devkit --variant matter --json target/hil.json

use clap::Parser;
use hil_harness::cases::{self, ALL_CASES};
use hil_harness::config::{
    DEFAULT_BAUD_RATE, DEFAULT_BUILD_TIMEOUT, DEFAULT_CLI_PATH, DEFAULT_PATTERN_TIMEOUT,
    DEFAULT_PLATFORM, DEFAULT_POLL_INTERVAL,
};
use hil_harness::serial::discovery::{get_board_port, list_available_ports, PortResult};
use hil_harness::{
    ArduinoCli, BoardTarget, CaseResult, HarnessConfig, Orchestrator, SerialPortFactory, Summary,
    TestCase, Variant,
};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(version, about = "Build, flash and verify firmware on a real board")]
struct Args {
    /// Board identifier known to the toolchain (e.g. nano_matter)
    #[arg(long, required_unless_present = "list")]
    board: Option<String>,

    /// Firmware variant to test (e.g. matter)
    #[arg(long, required_unless_present = "list")]
    variant: Option<String>,

    /// Serial port of the board; auto-detected when omitted
    #[arg(long, env = "PORT")]
    port: Option<String>,

    /// Only run the named test case (repeatable)
    #[arg(long = "case")]
    cases: Vec<String>,

    /// Directory that sketch paths are relative to
    #[arg(long, default_value = ".")]
    sketch_root: PathBuf,

    /// Toolchain executable
    #[arg(long, default_value = DEFAULT_CLI_PATH)]
    cli: PathBuf,

    /// Extra global toolchain argument (repeatable)
    #[arg(long = "cli-arg", allow_hyphen_values = true)]
    cli_args: Vec<String>,

    /// FQBN platform prefix
    #[arg(long, default_value = DEFAULT_PLATFORM)]
    platform: String,

    /// Build and flash timeout in seconds
    #[arg(long, default_value_t = DEFAULT_BUILD_TIMEOUT.as_secs())]
    build_timeout: u64,

    /// Per-pattern timeout in seconds
    #[arg(long, default_value_t = DEFAULT_PATTERN_TIMEOUT.as_secs())]
    pattern_timeout: u64,

    /// Serial poll interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    poll_interval_ms: u64,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Delay between flashing and opening the port, in milliseconds
    #[arg(long, default_value_t = 0)]
    settle_ms: u64,

    /// Write a JSON report to this path
    #[arg(long)]
    json: Option<PathBuf>,

    /// List test cases and exit
    #[arg(long)]
    list: bool,
}

impl Args {
    fn config(&self) -> HarnessConfig {
        HarnessConfig {
            cli_path: self.cli.clone(),
            cli_args: self.cli_args.clone(),
            platform: self.platform.clone(),
            sketch_root: self.sketch_root.clone(),
            build_timeout: Duration::from_secs(self.build_timeout),
            pattern_timeout: Duration::from_secs(self.pattern_timeout),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            baud_rate: self.baud,
            settle_delay: Duration::from_millis(self.settle_ms),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(args).await {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(2);
        }
    }
}

/// Returns whether every test case passed or was skipped.
async fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    if args.list {
        for case in ALL_CASES {
            println!("{:<24} [{}] {}", case.name, case.variant, case.description);
        }
        return Ok(true);
    }

    let selected = select_cases(&args.cases)?;
    let config = args.config();
    config.validate()?;

    let board = args.board.clone().ok_or("--board is required")?;
    let variant = Variant::new(args.variant.clone().ok_or("--variant is required")?);
    let port = resolve_port(args.port.clone())?;
    let target = BoardTarget::new(board, port);
    info!("Testing variant '{}' on {}", variant, target);

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let mut worker = tokio::task::spawn_blocking(move || {
        run_cases(&selected, &target, &variant, &config, worker_cancel)
    });

    let summary = tokio::select! {
        result = &mut worker => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping current test case...");
            cancel.cancel();
            worker.await?
        }
    };

    if let Some(path) = &args.json {
        summary.write_json(path)?;
        info!("Report written to {}", path.display());
    }

    Ok(summary.all_passed())
}

fn select_cases(names: &[String]) -> Result<Vec<&'static TestCase>, String> {
    if names.is_empty() {
        return Ok(ALL_CASES.iter().collect());
    }
    names
        .iter()
        .map(|name| cases::find(name).ok_or_else(|| format!("unknown test case '{}'", name)))
        .collect()
}

fn resolve_port(explicit: Option<String>) -> Result<String, String> {
    if let Some(port) = explicit {
        return Ok(port);
    }
    match get_board_port() {
        PortResult::Found(p) => Ok(p),
        PortResult::MultipleDevices(ports) => {
            eprintln!("\nMultiple boards found:");
            for port in &ports {
                eprintln!("  {}", port);
            }
            eprintln!("\nSet PORT environment variable or --port to specify which board to use.");
            Err("Multiple devices found, set PORT to specify device".into())
        }
        PortResult::NotFound => {
            let available = list_available_ports();
            eprintln!("\nNo board found. Check USB connection.");
            if !available.is_empty() {
                eprintln!("\nAvailable serial ports:");
                for port in &available {
                    eprintln!("  {}", port);
                }
            }
            Err("No board found".into())
        }
    }
}

fn run_cases(
    cases: &[&'static TestCase],
    target: &BoardTarget,
    variant: &Variant,
    config: &HarnessConfig,
    cancel: CancellationToken,
) -> Summary {
    let toolchain = ArduinoCli::new(config);
    let channels = SerialPortFactory::new(config.baud_rate);
    let orchestrator = Orchestrator::new(&toolchain, &channels, config, cancel);

    println!("{}", Summary::header(cases.len()));
    let mut summary = Summary::new();
    for case in cases {
        let outcome = orchestrator.run(case, target, variant);
        println!(
            "{}",
            summary.record(CaseResult::new(case, target, variant, &outcome))
        );
    }
    println!("{}", summary.footer());

    if !summary.all_passed() {
        error!("{} of {} test cases failed", summary.failed(), summary.ran());
        for result in summary.results().iter().filter(|r| r.is_failure()) {
            error!(
                "  {} failed at {}",
                result.case,
                result.stage.as_deref().unwrap_or("unknown stage")
            );
        }
    }
    summary
}
