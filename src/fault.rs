//! Fault records and the shared, append-only store they are collected in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    WriteError,
    ShortWrite,
    ReadError,
    ShortRead,
    Mismatch,
}

impl FaultKind {
    /// Fatal faults end testing of the device they occur on.
    pub fn is_fatal(self) -> bool {
        !matches!(self, FaultKind::Mismatch)
    }

    pub fn label(self) -> &'static str {
        match self {
            FaultKind::WriteError => "Write Error",
            FaultKind::ShortWrite => "Short Write",
            FaultKind::ReadError => "Read Error",
            FaultKind::ShortRead => "Short Read",
            FaultKind::Mismatch => "Data Mismatch",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One detected defect. Never modified after it is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub device: Arc<str>,
    /// Absolute byte offset; for mismatches, the first differing byte.
    pub offset: u64,
    pub kind: FaultKind,
    pub pass: u32,
    pub detail: Option<String>,
}

impl Fault {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "device": &*self.device,
            "offset": self.offset,
            "kind": self.kind.label(),
            "pass": self.pass,
            "detail": self.detail,
        })
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} at byte {} (pass {})",
            self.device, self.kind, self.offset, self.pass
        )?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// Collects faults from every worker. Records are kept in arrival order and
/// are never merged or dropped, so a fault repeating at one offset across
/// passes shows up once per pass.
#[derive(Debug, Default)]
pub struct FaultTracker {
    faults: Mutex<Vec<Fault>>,
}

impl FaultTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub fn len(&self) -> usize {
        self.faults.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Fault> {
        self.faults.lock().clone()
    }

    /// Faults recorded after the first `seen`, for incremental display.
    pub fn since(&self, seen: usize) -> Vec<Fault> {
        let faults = self.faults.lock();
        faults.get(seen..).map(<[Fault]>::to_vec).unwrap_or_default()
    }

    pub fn for_device(&self, device: &str) -> Vec<Fault> {
        self.filtered(|f| &*f.device == device)
    }

    pub fn for_pass(&self, pass: u32) -> Vec<Fault> {
        self.filtered(|f| f.pass == pass)
    }

    pub fn count_for_device(&self, device: &str) -> usize {
        self.faults
            .lock()
            .iter()
            .filter(|f| &*f.device == device)
            .count()
    }

    /// Offsets on `device` that faulted in more than one pass: a persistent
    /// bad block rather than a one-off.
    pub fn recurring_offsets(&self, device: &str) -> Vec<u64> {
        let mut passes_by_offset: BTreeMap<u64, BTreeSet<u32>> = BTreeMap::new();
        for fault in self.faults.lock().iter().filter(|f| &*f.device == device) {
            passes_by_offset
                .entry(fault.offset)
                .or_default()
                .insert(fault.pass);
        }
        passes_by_offset
            .into_iter()
            .filter(|(_, passes)| passes.len() > 1)
            .map(|(offset, _)| offset)
            .collect()
    }

    fn filtered(&self, keep: impl Fn(&Fault) -> bool) -> Vec<Fault> {
        self.faults.lock().iter().filter(|f| keep(*f)).cloned().collect()
    }
}
