//! Live per-device progress and the run-wide view derived from it.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Write,
    Verify,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PassKind::Write => "write",
            PassKind::Verify => "verify",
        })
    }
}

/// Per-device state machine:
/// `Idle -> Writing(n) -> Verifying(n) -> [Writing(n + 1) | Completed]`,
/// with `Failed` and `Cancelled` reachable from either sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Writing(u32),
    Verifying(u32),
    Completed,
    Failed,
    Cancelled,
}

impl DeviceState {
    pub fn status(self) -> DeviceStatus {
        match self {
            DeviceState::Idle => DeviceStatus::Pending,
            DeviceState::Writing(_) | DeviceState::Verifying(_) => DeviceStatus::Running,
            DeviceState::Completed => DeviceStatus::Completed,
            DeviceState::Failed => DeviceStatus::Failed,
            DeviceState::Cancelled => DeviceStatus::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.status().is_terminal()
    }

    pub fn pass(self) -> Option<(PassKind, u32)> {
        match self {
            DeviceState::Writing(n) => Some((PassKind::Write, n)),
            DeviceState::Verifying(n) => Some((PassKind::Verify, n)),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Idle => f.write_str("waiting"),
            DeviceState::Writing(n) => write!(f, "writing pass {}", n + 1),
            DeviceState::Verifying(n) => write!(f, "verifying pass {}", n + 1),
            DeviceState::Completed => f.write_str("completed"),
            DeviceState::Failed => f.write_str("failed"),
            DeviceState::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl DeviceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeviceStatus::Completed | DeviceStatus::Failed | DeviceStatus::Cancelled
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Running => "running",
            DeviceStatus::Completed => "completed",
            DeviceStatus::Failed => "failed",
            DeviceStatus::Cancelled => "cancelled",
        }
    }
}

/// Latest known state of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub device: Arc<str>,
    pub state: DeviceState,
    /// Bytes covered so far in the current sweep; reset at each sweep start.
    pub bytes_processed: u64,
    pub total_bytes: u64,
    pub passes_completed: u32,
    pub total_passes: u32,
    pub fault_count: usize,
}

impl ProgressSnapshot {
    pub fn new(device: Arc<str>, total_bytes: u64, total_passes: u32) -> Self {
        Self {
            device,
            state: DeviceState::Idle,
            bytes_processed: 0,
            total_bytes,
            passes_completed: 0,
            total_passes,
            fault_count: 0,
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.status()
    }

    /// Fraction of all sweeps (two per pass pair) done, in `[0, 1]`.
    pub fn overall_fraction(&self) -> f64 {
        if self.state == DeviceState::Completed {
            return 1.0;
        }
        let sweeps_total = u64::from(self.total_passes) * 2;
        if sweeps_total == 0 || self.total_bytes == 0 {
            return 0.0;
        }
        let sweeps_done = u64::from(self.passes_completed) * 2
            + u64::from(matches!(self.state, DeviceState::Verifying(_)));
        let done = sweeps_done as f64 * self.total_bytes as f64 + self.bytes_processed as f64;
        (done / (sweeps_total as f64 * self.total_bytes as f64)).min(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    /// Stop requested; workers are finishing their in-flight chunk.
    Cancelling,
    Finished,
}

/// Consolidated view over every device in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub devices: Vec<ProgressSnapshot>,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub fault_count: usize,
    pub status: RunStatus,
}

impl RunSnapshot {
    pub fn overall_fraction(&self) -> f64 {
        let weight: u64 = self.devices.iter().map(|d| d.total_bytes).sum();
        if weight == 0 {
            return 0.0;
        }
        self.devices
            .iter()
            .map(|d| d.overall_fraction() * d.total_bytes as f64)
            .sum::<f64>()
            / weight as f64
    }
}

/// Holds the most recent [`ProgressSnapshot`] per device. Updates overwrite;
/// each device's entry is independent, so a slow device never holds up reads
/// of the others.
#[derive(Debug)]
pub struct ProgressAggregator {
    order: Vec<Arc<str>>,
    latest: DashMap<Arc<str>, ProgressSnapshot>,
}

impl ProgressAggregator {
    /// The device set is fixed here; snapshots list devices in this order.
    pub fn new(initial: Vec<ProgressSnapshot>) -> Self {
        let order = initial.iter().map(|s| Arc::clone(&s.device)).collect();
        let latest = DashMap::with_capacity(initial.len());
        for snapshot in initial {
            latest.insert(Arc::clone(&snapshot.device), snapshot);
        }
        Self { order, latest }
    }

    /// Replace the stored state for `snapshot.device`. Unknown devices are ignored.
    pub fn publish(&self, snapshot: ProgressSnapshot) {
        if let Some(mut entry) = self.latest.get_mut(&*snapshot.device) {
            *entry = snapshot;
        }
    }

    pub fn get(&self, device: &str) -> Option<ProgressSnapshot> {
        self.latest.get(device).map(|entry| entry.value().clone())
    }

    pub fn all_terminal(&self) -> bool {
        self.latest.iter().all(|entry| entry.value().state.is_terminal())
    }

    pub fn snapshot(&self, cancel_requested: bool) -> RunSnapshot {
        let devices: Vec<ProgressSnapshot> =
            self.order.iter().filter_map(|name| self.get(name)).collect();
        let mut run = RunSnapshot {
            devices: Vec::new(),
            bytes_processed: 0,
            total_bytes: 0,
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            fault_count: 0,
            status: RunStatus::Running,
        };
        for device in &devices {
            run.bytes_processed += device.bytes_processed;
            run.total_bytes += device.total_bytes;
            run.fault_count += device.fault_count;
            match device.status() {
                DeviceStatus::Pending => run.pending += 1,
                DeviceStatus::Running => run.running += 1,
                DeviceStatus::Completed => run.completed += 1,
                DeviceStatus::Failed => run.failed += 1,
                DeviceStatus::Cancelled => run.cancelled += 1,
            }
        }
        run.status = if devices.iter().all(|d| d.state.is_terminal()) {
            RunStatus::Finished
        } else if cancel_requested {
            RunStatus::Cancelling
        } else {
            RunStatus::Running
        };
        run.devices = devices;
        run
    }
}
