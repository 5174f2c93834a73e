//! Run setup, fan-out of one worker thread per device, and fan-in of their
//! reports into a single [`RunResult`].

use std::collections::HashSet;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossbeam_channel::{unbounded, Receiver};
use serde_json::json;

use crate::device::{BlockTarget, FileDevice, SECTOR_SIZE};
use crate::error::{ConfigError, SetupError, SetupErrorKind};
use crate::fault::{Fault, FaultKind, FaultTracker};
use crate::log::RunLog;
use crate::pattern::{PatternGenerator, PatternKind, DEFAULT_SEED};
use crate::progress::{DeviceState, DeviceStatus, ProgressAggregator, ProgressSnapshot, RunSnapshot};
use crate::units::human_bytes;
use crate::worker::{panic_message, DeviceReport, DeviceWorker, RunContext, RunEvent};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// A device node to test and the size of each I/O against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub path: PathBuf,
    pub chunk_size: usize,
}

impl DeviceSpec {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// An already-open target, for callers that supply their own [`BlockTarget`].
pub struct TargetSpec {
    pub name: String,
    pub target: Box<dyn BlockTarget>,
    pub chunk_size: usize,
}

impl TargetSpec {
    pub fn new<T: BlockTarget + 'static>(name: impl Into<String>, target: T, chunk_size: usize) -> Self {
        Self {
            name: name.into(),
            target: Box::new(target),
            chunk_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Number of (write, verify) sweeps per device; at least 1.
    pub pass_pairs: u32,
    pub pattern: PatternKind,
    pub seed: u64,
    /// Bypass the page cache (O_DIRECT and friends).
    pub direct_io: bool,
    /// Leave unusable devices out of the run instead of refusing to start.
    pub skip_unusable: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pass_pairs: 1,
            pattern: PatternKind::Random,
            seed: DEFAULT_SEED,
            direct_io: false,
            skip_unusable: false,
        }
    }
}

impl RunConfig {
    pub fn with_pass_pairs(mut self, pass_pairs: u32) -> Self {
        self.pass_pairs = pass_pairs;
        self
    }

    pub fn with_pattern(mut self, pattern: PatternKind) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }

    pub fn with_skip_unusable(mut self, skip_unusable: bool) -> Self {
        self.skip_unusable = skip_unusable;
        self
    }

    pub fn patterns(&self) -> PatternGenerator {
        PatternGenerator::new(self.pattern, self.seed)
    }
}

/// Start a run over `devices` with default settings and `pass_pairs` sweeps.
pub fn start_run(devices: &[DeviceSpec], pass_pairs: u32) -> Result<RunHandle, ConfigError> {
    Orchestrator::new(RunConfig::default().with_pass_pairs(pass_pairs)).start(devices)
}

struct Candidate {
    name: String,
    chunk_size: usize,
    opened: Result<Box<dyn BlockTarget>, String>,
}

pub struct Orchestrator {
    config: RunConfig,
    log: Arc<RunLog>,
    stop: Option<Arc<AtomicBool>>,
}

impl Orchestrator {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            log: Arc::new(RunLog::quiet()),
            stop: None,
        }
    }

    pub fn with_log(mut self, log: Arc<RunLog>) -> Self {
        self.log = log;
        self
    }

    /// Use `stop` as the run's stop flag, so a signal handler installed
    /// before the run starts can cancel it. Setting it before `start`
    /// cancels every device before its first chunk.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Open every device in `devices` and start testing them all.
    pub fn start(&self, devices: &[DeviceSpec]) -> Result<RunHandle, ConfigError> {
        self.check_layout(
            devices
                .iter()
                .map(|d| (d.path.display().to_string(), d.chunk_size)),
        )?;
        let candidates = devices
            .iter()
            .map(|d| Candidate {
                name: d.path.display().to_string(),
                chunk_size: d.chunk_size,
                opened: FileDevice::open(&d.path, self.config.direct_io)
                    .map(|dev| Box::new(dev) as Box<dyn BlockTarget>)
                    .map_err(|e| e.to_string()),
            })
            .collect();
        self.launch(candidates)
    }

    pub fn start_targets(&self, targets: Vec<TargetSpec>) -> Result<RunHandle, ConfigError> {
        self.check_layout(targets.iter().map(|t| (t.name.clone(), t.chunk_size)))?;
        let candidates = targets
            .into_iter()
            .map(|t| Candidate {
                name: t.name,
                chunk_size: t.chunk_size,
                opened: Ok(t.target),
            })
            .collect();
        self.launch(candidates)
    }

    /// Checks that need no device access.
    fn check_layout(&self, devices: impl Iterator<Item = (String, usize)>) -> Result<(), ConfigError> {
        let devices: Vec<(String, usize)> = devices.collect();
        if devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        if self.config.pass_pairs == 0 {
            return Err(ConfigError::InvalidPassCount(self.config.pass_pairs));
        }
        let mut seen = HashSet::new();
        for (name, chunk_size) in devices {
            if chunk_size == 0 {
                return Err(ConfigError::InvalidChunkSize {
                    device: name,
                    chunk_size,
                });
            }
            if self.config.direct_io && chunk_size % SECTOR_SIZE != 0 {
                return Err(ConfigError::MisalignedChunk {
                    device: name,
                    chunk_size,
                    alignment: SECTOR_SIZE,
                });
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateDevice(name));
            }
        }
        Ok(())
    }

    fn launch(&self, candidates: Vec<Candidate>) -> Result<RunHandle, ConfigError> {
        let mut accepted: Vec<(Arc<str>, Box<dyn BlockTarget>, usize)> = Vec::new();
        let mut rejected = Vec::new();
        for candidate in candidates {
            let kind = match candidate.opened {
                Err(reason) => SetupErrorKind::Unreadable(reason),
                Ok(target) => {
                    let size = target.size();
                    if size == 0 {
                        SetupErrorKind::ZeroLength
                    } else if self.config.direct_io && size % SECTOR_SIZE as u64 != 0 {
                        SetupErrorKind::MisalignedSize {
                            size,
                            alignment: SECTOR_SIZE,
                        }
                    } else {
                        accepted.push((Arc::from(candidate.name), target, candidate.chunk_size));
                        continue;
                    }
                }
            };
            rejected.push(SetupError {
                device: candidate.name,
                kind,
            });
        }
        for err in &rejected {
            self.log.info(format!("Rejected {}", err));
        }
        if accepted.is_empty() || (!rejected.is_empty() && !self.config.skip_unusable) {
            return Err(ConfigError::DeviceSetup(rejected));
        }

        let pass_pairs = self.config.pass_pairs;
        let progress = Arc::new(ProgressAggregator::new(
            accepted
                .iter()
                .map(|(name, target, _)| ProgressSnapshot::new(Arc::clone(name), target.size(), pass_pairs))
                .collect(),
        ));
        let faults = Arc::new(FaultTracker::new());
        let stop = self
            .stop
            .clone()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        let (events_tx, events_rx) = unbounded();
        let ctx = RunContext {
            faults: Arc::clone(&faults),
            progress: Arc::clone(&progress),
            events: events_tx,
            stop: Arc::clone(&stop),
            log: Arc::clone(&self.log),
            patterns: self.config.patterns(),
            pass_pairs,
        };

        self.log.info(format!(
            "Starting run: {} device(s), {} pass pair(s), {:?} pattern (seed {:#x}), direct I/O {}",
            accepted.len(),
            pass_pairs,
            self.config.pattern,
            self.config.seed,
            self.config.direct_io
        ));
        let started_at = Local::now();
        let started = Instant::now();
        let mut workers = Vec::with_capacity(accepted.len());
        for (idx, (name, target, chunk_size)) in accepted.into_iter().enumerate() {
            let size = target.size();
            self.log.info(format!(
                "{}: {} ({} bytes), {} chunks",
                name,
                human_bytes(size),
                size,
                human_bytes(chunk_size as u64)
            ));
            let worker = DeviceWorker::new(Arc::clone(&name), target, chunk_size, ctx.clone());
            let handle = thread::Builder::new()
                .name(format!("disk-worker-{}", idx))
                .spawn(move || worker.run());
            let handle = match handle {
                Ok(h) => Some(h),
                Err(e) => {
                    record_failure(
                        &faults,
                        &progress,
                        &self.log,
                        &name,
                        format!("could not start worker thread: {}", e),
                    );
                    None
                }
            };
            workers.push(WorkerSlot {
                name,
                size,
                chunk_size,
                handle,
            });
        }
        // Workers hold the only senders from here on; the event stream ends with the last one.
        drop(ctx);

        Ok(RunHandle {
            pass_pairs,
            progress: Arc::clone(&progress),
            faults,
            canceller: Canceller {
                stop,
                progress,
                log: Arc::clone(&self.log),
            },
            events: events_rx,
            workers,
            setup_errors: rejected,
            log: Arc::clone(&self.log),
            started_at,
            started,
        })
    }
}

/// Fail a device whose worker never ran or died outside its own fault
/// handling, recording a fault unless the device already has a fatal one.
fn record_failure(
    faults: &FaultTracker,
    progress: &ProgressAggregator,
    log: &RunLog,
    name: &Arc<str>,
    detail: String,
) {
    let already_fatal = faults
        .for_device(name)
        .iter()
        .any(|f| f.kind.is_fatal());
    let mut snapshot = progress.get(name);
    if !already_fatal {
        let fault = Fault {
            device: Arc::clone(name),
            offset: 0,
            kind: FaultKind::WriteError,
            pass: snapshot.as_ref().and_then(|s| s.state.pass()).map_or(0, |(_, n)| n),
            detail: Some(detail),
        };
        log.fault(&fault, None, None);
        faults.record(fault);
        if let Some(s) = snapshot.as_mut() {
            s.fault_count += 1;
        }
    }
    if let Some(mut s) = snapshot {
        s.state = DeviceState::Failed;
        progress.publish(s);
    }
}

struct WorkerSlot {
    name: Arc<str>,
    size: u64,
    chunk_size: usize,
    handle: Option<JoinHandle<DeviceReport>>,
}

/// Cloneable stop switch for a run, usable from a signal handler.
#[derive(Clone)]
pub struct Canceller {
    stop: Arc<AtomicBool>,
    progress: Arc<ProgressAggregator>,
    log: Arc<RunLog>,
}

impl Canceller {
    /// Ask every worker to stop after its in-flight chunk. Idempotent; does
    /// nothing once every device is terminal.
    pub fn cancel(&self) {
        if self.progress.all_terminal() {
            return;
        }
        if !self.stop.swap(true, Ordering::SeqCst) {
            self.log
                .info("Cancellation requested; finishing in-flight chunks...");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// A run in progress.
pub struct RunHandle {
    pass_pairs: u32,
    progress: Arc<ProgressAggregator>,
    faults: Arc<FaultTracker>,
    canceller: Canceller,
    events: Receiver<RunEvent>,
    workers: Vec<WorkerSlot>,
    setup_errors: Vec<SetupError>,
    log: Arc<RunLog>,
    started_at: DateTime<Local>,
    started: Instant,
}

impl RunHandle {
    pub fn snapshot(&self) -> RunSnapshot {
        self.progress.snapshot(self.canceller.is_cancelled())
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Faults, state changes and completions as workers produce them. The
    /// channel disconnects once every worker has finished.
    pub fn events(&self) -> &Receiver<RunEvent> {
        &self.events
    }

    pub fn faults(&self) -> &FaultTracker {
        &self.faults
    }

    /// Devices left out of the run (only non-empty with `skip_unusable`).
    pub fn setup_errors(&self) -> &[SetupError] {
        &self.setup_errors
    }

    pub fn is_finished(&self) -> bool {
        self.workers
            .iter()
            .all(|w| w.handle.as_ref().map_or(true, JoinHandle::is_finished))
    }

    /// Block until every device is terminal and produce the final result.
    pub fn wait(mut self) -> RunResult {
        let workers = mem::take(&mut self.workers);
        let mut devices = Vec::with_capacity(workers.len());
        for slot in workers {
            let joined = match slot.handle {
                Some(handle) => handle
                    .join()
                    .map_err(|payload| format!("worker panicked: {}", panic_message(&*payload))),
                None => Err("worker thread never started".to_string()),
            };
            let report = match joined {
                Ok(report) => report,
                Err(reason) => {
                    record_failure(&self.faults, &self.progress, &self.log, &slot.name, reason);
                    let last = self.progress.get(&slot.name);
                    DeviceReport {
                        device: Arc::clone(&slot.name),
                        size: slot.size,
                        chunk_size: slot.chunk_size,
                        status: DeviceStatus::Failed,
                        passes_completed: last.as_ref().map_or(0, |s| s.passes_completed),
                        bytes_written: 0,
                        bytes_verified: 0,
                        fault_count: last.as_ref().map_or(0, |s| s.fault_count),
                        elapsed: self.started.elapsed(),
                    }
                }
            };
            devices.push(report);
        }

        let faults = self.faults.all();
        let cancelled = devices.iter().any(|d| d.status == DeviceStatus::Cancelled);
        let success = faults.is_empty()
            && self.setup_errors.is_empty()
            && devices.iter().all(|d| d.status != DeviceStatus::Failed);
        let result = RunResult {
            started_at: self.started_at,
            finished_at: Local::now(),
            elapsed: self.started.elapsed(),
            pass_pairs: self.pass_pairs,
            devices,
            faults,
            setup_errors: mem::take(&mut self.setup_errors),
            cancelled,
            success,
        };
        for line in result.summary_lines() {
            self.log.info(line);
        }
        for device in &result.devices {
            let recurring = self.faults.recurring_offsets(&device.device);
            if !recurring.is_empty() {
                self.log.info(format!(
                    "{}: offsets faulting in more than one pass: {:?}",
                    device.device, recurring
                ));
            }
        }
        result
    }
}

/// A handle dropped before `wait` stops its workers after their in-flight
/// chunk and joins them, so no device I/O outlives the handle.
impl Drop for RunHandle {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.cancel();
        for slot in self.workers.drain(..) {
            if let Some(handle) = slot.handle {
                let _ = handle.join();
            }
        }
    }
}

/// Terminal record of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub elapsed: Duration,
    pub pass_pairs: u32,
    pub devices: Vec<DeviceReport>,
    pub faults: Vec<Fault>,
    pub setup_errors: Vec<SetupError>,
    pub cancelled: bool,
    /// No faults, no failed device and no excluded device.
    pub success: bool,
}

impl RunResult {
    pub fn device(&self, name: &str) -> Option<&DeviceReport> {
        self.devices.iter().find(|d| &*d.device == name)
    }

    pub fn status_of(&self, name: &str) -> Option<DeviceStatus> {
        self.device(name).map(|d| d.status)
    }

    pub fn faults_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Fault> + 'a {
        self.faults.iter().filter(move |f| &*f.device == name)
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec!["--- Run Summary ---".to_string()];
        for d in &self.devices {
            lines.push(format!(
                "  {}: {} ({} of {} pass pairs, {} written, {} verified, {} faults)",
                d.device,
                d.status.label(),
                d.passes_completed,
                self.pass_pairs,
                human_bytes(d.bytes_written),
                human_bytes(d.bytes_verified),
                d.fault_count
            ));
        }
        for e in &self.setup_errors {
            lines.push(format!("  {} (not tested)", e));
        }
        lines.push(format!("  Total faults: {}", self.faults.len()));
        lines.push(format!("  Elapsed: {:.2?}", self.elapsed));
        lines.push(if self.success {
            "All devices passed. No faults detected.".to_string()
        } else {
            "Run FAILED.".to_string()
        });
        lines
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.to_rfc3339(),
            "elapsed_seconds": self.elapsed.as_secs_f64(),
            "pass_pairs": self.pass_pairs,
            "success": self.success,
            "cancelled": self.cancelled,
            "devices": self.devices.iter().map(DeviceReport::to_json).collect::<Vec<_>>(),
            "faults": self.faults.iter().map(Fault::to_json).collect::<Vec<_>>(),
            "setup_errors": self.setup_errors.iter().map(|e| json!({
                "device": e.device,
                "reason": e.kind.to_string(),
            })).collect::<Vec<_>>(),
        })
    }
}
