use std::error::Error;
use std::panic;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::RecvTimeoutError;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use multi_disk_tester::device::SECTOR_SIZE;
use multi_disk_tester::log::current_timestamp;
use multi_disk_tester::{
    human_bytes, inspect_region, parse_size_with_suffix, DeviceSpec, FileDevice, Orchestrator,
    PatternGenerator, PatternKind, RegionDiff, RunConfig, RunLog, RunSnapshot, DEFAULT_SEED,
};

const DEFAULT_LOG_FILE: &str = "multi_disk_test.log";
const BAR_SCALE: u64 = 10_000;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DUMP_ROW: usize = 16;

type CliResult = Result<bool, Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Destructive write/verify test of many disks in parallel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Overwrite every byte of each device and read it back. DESTROYS ALL DATA on the devices.
    Run {
        #[arg(short = 'd', long = "device")]
        devices: Vec<PathBuf>,
        #[arg(long, value_parser = parse_size_with_suffix, default_value = "1M")]
        chunk_size: u64,
        /// Number of write+verify pass pairs.
        #[arg(long, default_value_t = 1)]
        passes: u32,
        #[arg(long, value_enum, default_value = "random")]
        pattern: PatternChoice,
        /// Decimal or 0x-prefixed hex.
        #[arg(long, value_parser = parse_seed)]
        seed: Option<u64>,
        #[arg(long)]
        direct_io: bool,
        /// Test the usable devices instead of refusing to start.
        #[arg(long)]
        skip_unusable: bool,
        #[arg(long, default_value = DEFAULT_LOG_FILE)]
        log_file: PathBuf,
        /// Print the final report as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Compare a region of a device against the pattern a given pass writes there.
    Inspect {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, value_parser = parse_size_with_suffix)]
        offset: u64,
        #[arg(long, value_parser = parse_size_with_suffix, default_value = "4K")]
        length: u64,
        /// Zero-based pass index.
        #[arg(long, default_value_t = 0)]
        pass: u32,
        #[arg(long, value_enum, default_value = "random")]
        pattern: PatternChoice,
        #[arg(long, value_parser = parse_seed)]
        seed: Option<u64>,
        #[arg(long)]
        direct_io: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PatternChoice {
    Random,
    Badblocks,
}

impl From<PatternChoice> for PatternKind {
    fn from(choice: PatternChoice) -> Self {
        match choice {
            PatternChoice::Random => PatternKind::Random,
            PatternChoice::Badblocks => PatternKind::Badblocks,
        }
    }
}

fn parse_seed(s: &str) -> Result<u64, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    }
    .map_err(|e| format!("invalid seed '{}': {}", s, e))
}

fn open_log(cli: &Cli, progress: &MultiProgress) -> RunLog {
    let log = match &cli.command {
        Commands::Run { log_file, .. } => match RunLog::open(log_file) {
            Ok(log) => log,
            Err(e) => {
                eprintln!(
                    "[{}] Failed to open log file '{}': {}. Further logs will only go to stderr.",
                    current_timestamp(),
                    log_file.display(),
                    e
                );
                RunLog::stderr()
            }
        },
        Commands::Inspect { .. } => RunLog::stderr(),
    };
    log.with_progress(progress.clone())
}

fn main() {
    let cli = Cli::parse();
    let progress = MultiProgress::new();
    let log = Arc::new(open_log(&cli, &progress));

    let main_result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        main_logic(cli, Arc::clone(&log), &progress)
    }));
    let exit_code = match main_result {
        Ok(Ok(true)) => 0,
        Ok(Ok(false)) => 1,
        Ok(Err(e)) => {
            log.info(format!("Error: {}", e));
            1
        }
        Err(payload) => {
            let mut msg = "A critical error occurred: the tester panicked!".to_string();
            if let Some(s) = payload.downcast_ref::<String>() {
                msg.push_str(&format!("\nPanic message: {}", s));
            } else if let Some(s) = payload.downcast_ref::<&str>() {
                msg.push_str(&format!("\nPanic message: {}", s));
            }
            log.info(msg);
            101
        }
    };
    process::exit(exit_code);
}

fn main_logic(cli: Cli, log: Arc<RunLog>, progress: &MultiProgress) -> CliResult {
    log.info(format!("CLI Command: {:?}", cli));
    match cli.command {
        Commands::Run {
            devices,
            chunk_size,
            passes,
            pattern,
            seed,
            direct_io,
            skip_unusable,
            log_file: _,
            json,
        } => {
            let chunk_size = usize::try_from(chunk_size)
                .map_err(|_| format!("chunk size {} does not fit in memory", chunk_size))?;
            let config = RunConfig::default()
                .with_pass_pairs(passes)
                .with_pattern(pattern.into())
                .with_seed(seed.unwrap_or(DEFAULT_SEED))
                .with_direct_io(direct_io)
                .with_skip_unusable(skip_unusable);
            let specs: Vec<DeviceSpec> = devices
                .iter()
                .map(|p| DeviceSpec::new(p).with_chunk_size(chunk_size))
                .collect();
            run_devices(&specs, config, log, progress, json)
        }
        Commands::Inspect {
            path,
            offset,
            length,
            pass,
            pattern,
            seed,
            direct_io,
        } => {
            let len = usize::try_from(length)?;
            if direct_io && (offset % SECTOR_SIZE as u64 != 0 || len % SECTOR_SIZE != 0) {
                return Err(format!(
                    "direct I/O needs offset and length in multiples of {} bytes",
                    SECTOR_SIZE
                )
                .into());
            }
            let mut device = FileDevice::open(&path, direct_io)?;
            let patterns = PatternGenerator::new(pattern.into(), seed.unwrap_or(DEFAULT_SEED));
            let diff = inspect_region(&mut device, &patterns, pass, offset, len)?;
            print_region(&diff);
            Ok(diff.difference.is_none())
        }
    }
}

/// Installed before any device is opened; the returned flag becomes the run's stop flag.
fn setup_signal_handler() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C; initiating graceful shutdown...");
        flag.store(true, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");
    stop
}

fn run_devices(
    specs: &[DeviceSpec],
    config: RunConfig,
    log: Arc<RunLog>,
    progress: &MultiProgress,
    json: bool,
) -> CliResult {
    let stop = setup_signal_handler();
    let style = ProgressStyle::with_template(
        "{prefix:>14} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {wide_msg}",
    )?
    .progress_chars("##-");

    log.info("Starting multi-disk test. ALL DATA ON THE LISTED DEVICES WILL BE DESTROYED.");
    let handle = Orchestrator::new(config)
        .with_log(Arc::clone(&log))
        .with_stop_flag(stop)
        .start(specs)?;
    let bars: Vec<ProgressBar> = handle
        .snapshot()
        .devices
        .iter()
        .map(|d| {
            let pb = progress.add(ProgressBar::new(BAR_SCALE));
            pb.set_style(style.clone());
            pb.set_prefix(d.device.to_string());
            pb
        })
        .collect();

    loop {
        match handle.events().recv_timeout(POLL_INTERVAL) {
            Ok(_) | Err(RecvTimeoutError::Timeout) => refresh_bars(&bars, &handle.snapshot()),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    refresh_bars(&bars, &handle.snapshot());
    for pb in &bars {
        pb.finish();
    }

    let result = handle.wait();
    if json {
        println!("{}", serde_json::to_string_pretty(&result.to_json())?);
    }
    Ok(result.success)
}

fn refresh_bars(bars: &[ProgressBar], snapshot: &RunSnapshot) {
    for (pb, device) in bars.iter().zip(&snapshot.devices) {
        pb.set_position((device.overall_fraction() * BAR_SCALE as f64) as u64);
        pb.set_message(format!(
            "{} ({} of {}) | faults: {}",
            device.state,
            human_bytes(device.bytes_processed),
            human_bytes(device.total_bytes),
            device.fault_count
        ));
    }
}

fn hex_row(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_region(diff: &RegionDiff) {
    println!(
        "Pass {} pattern vs device contents, {} bytes at offset {}:",
        diff.pass,
        diff.actual.len(),
        diff.offset
    );
    println!("{:>16}  {:<47}  {:<47}", "offset", "expected", "actual");
    for (row, (exp, act)) in diff
        .expected
        .chunks(DUMP_ROW)
        .zip(diff.actual.chunks(DUMP_ROW))
        .enumerate()
    {
        let marker = if exp != act { "*" } else { " " };
        println!(
            "{:016X}  {:<47}  {:<47} {}",
            diff.offset + (row * DUMP_ROW) as u64,
            hex_row(exp),
            hex_row(act),
            marker
        );
    }
    match &diff.difference {
        None => println!("Region matches the pattern."),
        Some(d) => println!(
            "{} of {} bytes differ; first at byte {} (expected {:#04X}, found {:#04X})",
            d.count,
            diff.actual.len(),
            diff.offset + d.first as u64,
            diff.expected[d.first],
            diff.actual[d.first]
        ),
    }
}
