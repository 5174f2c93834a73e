//! One worker per device: sequential write and verify sweeps over the whole
//! byte range, chunk by chunk, for every configured pass pair.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use serde_json::json;

use crate::device::{chunk_buffer, read_chunk, write_chunk, BlockTarget, ChunkIoError};
use crate::fault::{Fault, FaultKind, FaultTracker};
use crate::log::RunLog;
use crate::pattern::PatternGenerator;
use crate::progress::{DeviceState, DeviceStatus, PassKind, ProgressAggregator, ProgressSnapshot};

/// Notifications sent to the run's caller while devices are tested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    StateChanged {
        device: Arc<str>,
        state: DeviceState,
    },
    Fault(Fault),
    Finished {
        device: Arc<str>,
        status: DeviceStatus,
    },
}

/// Final account of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub device: Arc<str>,
    pub size: u64,
    pub chunk_size: usize,
    pub status: DeviceStatus,
    pub passes_completed: u32,
    pub bytes_written: u64,
    pub bytes_verified: u64,
    pub fault_count: usize,
    pub elapsed: Duration,
}

impl DeviceReport {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "device": &*self.device,
            "size": self.size,
            "chunk_size": self.chunk_size,
            "status": self.status.label(),
            "passes_completed": self.passes_completed,
            "bytes_written": self.bytes_written,
            "bytes_verified": self.bytes_verified,
            "fault_count": self.fault_count,
            "elapsed_seconds": self.elapsed.as_secs_f64(),
        })
    }
}

/// State shared by every worker of one run.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub faults: Arc<FaultTracker>,
    pub progress: Arc<ProgressAggregator>,
    pub events: Sender<RunEvent>,
    pub stop: Arc<AtomicBool>,
    pub log: Arc<RunLog>,
    pub patterns: PatternGenerator,
    pub pass_pairs: u32,
}

enum SweepEnd {
    Done,
    Fatal,
    Cancelled,
}

/// Where two equal-length buffers disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Difference {
    pub first: usize,
    pub count: usize,
}

pub fn compare(expected: &[u8], actual: &[u8]) -> Option<Difference> {
    if expected == actual {
        return None;
    }
    let first = expected.iter().zip(actual).position(|(e, a)| e != a)?;
    let count = expected[first..]
        .iter()
        .zip(&actual[first..])
        .filter(|(e, a)| e != a)
        .count();
    Some(Difference { first, count })
}

pub struct DeviceWorker {
    name: Arc<str>,
    target: Box<dyn BlockTarget>,
    chunk_size: usize,
    ctx: RunContext,
    snapshot: ProgressSnapshot,
    /// Offset of the chunk currently being transferred.
    position: u64,
    bytes_written: u64,
    bytes_verified: u64,
}

/// Text of a panic payload, as far as it can be recovered.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "payload not recognized as string".to_string()
    }
}

impl DeviceWorker {
    pub(crate) fn new(
        name: Arc<str>,
        target: Box<dyn BlockTarget>,
        chunk_size: usize,
        ctx: RunContext,
    ) -> Self {
        let snapshot = ProgressSnapshot::new(Arc::clone(&name), target.size(), ctx.pass_pairs);
        Self {
            name,
            target,
            chunk_size,
            ctx,
            snapshot,
            position: 0,
            bytes_written: 0,
            bytes_verified: 0,
        }
    }

    /// Drive the device to a terminal state. The target is closed when this returns.
    pub fn run(mut self) -> DeviceReport {
        let started = Instant::now();
        let state = match panic::catch_unwind(AssertUnwindSafe(|| self.run_passes())) {
            Ok(state) => state,
            Err(payload) => {
                self.report_panic(&panic_message(&*payload));
                DeviceState::Failed
            }
        };
        self.snapshot.state = state;
        self.publish();
        let _ = self.ctx.events.send(RunEvent::Finished {
            device: Arc::clone(&self.name),
            status: state.status(),
        });
        let elapsed = started.elapsed();
        self.ctx.log.info(format!(
            "{}: {} after {:.2?} ({} of {} pass pairs, {} faults)",
            self.name,
            state,
            elapsed,
            self.snapshot.passes_completed,
            self.ctx.pass_pairs,
            self.snapshot.fault_count
        ));
        DeviceReport {
            device: Arc::clone(&self.name),
            size: self.target.size(),
            chunk_size: self.chunk_size,
            status: state.status(),
            passes_completed: self.snapshot.passes_completed,
            bytes_written: self.bytes_written,
            bytes_verified: self.bytes_verified,
            fault_count: self.snapshot.fault_count,
            elapsed,
        }
    }

    fn run_passes(&mut self) -> DeviceState {
        // Two chunk buffers for the whole run, whatever the device size.
        let mut expected = chunk_buffer(self.chunk_size);
        let mut actual = chunk_buffer(self.chunk_size);
        for pass in 0..self.ctx.pass_pairs {
            for kind in [PassKind::Write, PassKind::Verify] {
                match self.sweep(kind, pass, &mut expected, &mut actual) {
                    SweepEnd::Done => {}
                    SweepEnd::Fatal => return DeviceState::Failed,
                    SweepEnd::Cancelled => return DeviceState::Cancelled,
                }
            }
            self.snapshot.passes_completed = pass + 1;
        }
        DeviceState::Completed
    }

    fn sweep(
        &mut self,
        kind: PassKind,
        pass: u32,
        expected: &mut [u8],
        actual: &mut [u8],
    ) -> SweepEnd {
        let size = self.target.size();
        self.enter(kind, pass);
        let mut cursor = 0u64;
        let mut last_chunk = 0u64;
        while cursor < size {
            if self.ctx.stop.load(Ordering::SeqCst) {
                return SweepEnd::Cancelled;
            }
            self.position = cursor;
            let len = (size - cursor).min(self.chunk_size as u64) as usize;
            let expected = &mut expected[..len];
            self.ctx.patterns.fill(pass, cursor, expected);
            let fatal = match kind {
                PassKind::Write => self.write_pass_chunk(pass, cursor, expected),
                PassKind::Verify => self.verify_pass_chunk(pass, cursor, expected, &mut actual[..len]),
            };
            if fatal {
                self.publish();
                return SweepEnd::Fatal;
            }
            last_chunk = cursor;
            cursor += len as u64;
            match kind {
                PassKind::Write => self.bytes_written += len as u64,
                PassKind::Verify => self.bytes_verified += len as u64,
            }
            self.snapshot.bytes_processed = cursor;
            self.publish();
        }
        if kind == PassKind::Write {
            self.position = last_chunk;
            if let Err(e) = self.target.flush() {
                self.report(
                    Fault {
                        device: Arc::clone(&self.name),
                        offset: last_chunk,
                        kind: FaultKind::WriteError,
                        pass,
                        detail: Some(format!("flush after write pass failed: {}", e)),
                    },
                    None,
                );
                return SweepEnd::Fatal;
            }
        }
        SweepEnd::Done
    }

    fn write_pass_chunk(&mut self, pass: u32, offset: u64, data: &[u8]) -> bool {
        match write_chunk(&mut *self.target, data, offset) {
            Ok(()) => false,
            Err(e) => {
                let kind = if e.is_partial() {
                    FaultKind::ShortWrite
                } else {
                    FaultKind::WriteError
                };
                self.report_io(kind, pass, offset, &e);
                true
            }
        }
    }

    fn verify_pass_chunk(
        &mut self,
        pass: u32,
        offset: u64,
        expected: &[u8],
        actual: &mut [u8],
    ) -> bool {
        if let Err(e) = read_chunk(&mut *self.target, actual, offset) {
            let kind = if e.is_partial() {
                FaultKind::ShortRead
            } else {
                FaultKind::ReadError
            };
            self.report_io(kind, pass, offset, &e);
            return true;
        }
        if let Some(diff) = compare(expected, actual) {
            let at = diff.first;
            self.report(
                Fault {
                    device: Arc::clone(&self.name),
                    offset: offset + at as u64,
                    kind: FaultKind::Mismatch,
                    pass,
                    detail: Some(format!(
                        "{} of {} bytes in chunk at {} differ; first expected {:#04x}, found {:#04x}",
                        diff.count,
                        expected.len(),
                        offset,
                        expected[at],
                        actual[at]
                    )),
                },
                Some((&expected[at..], &actual[at..])),
            );
        }
        false
    }

    fn report_io(&mut self, kind: FaultKind, pass: u32, offset: u64, err: &ChunkIoError) {
        self.report(
            Fault {
                device: Arc::clone(&self.name),
                offset,
                kind,
                pass,
                detail: Some(err.to_string()),
            },
            None,
        );
    }

    /// A panic mid-sweep is one fatal fault at the chunk in flight.
    fn report_panic(&mut self, message: &str) {
        let (kind, pass) = match self.snapshot.state {
            DeviceState::Verifying(pass) => (FaultKind::ReadError, pass),
            DeviceState::Writing(pass) => (FaultKind::WriteError, pass),
            _ => (FaultKind::WriteError, 0),
        };
        self.report(
            Fault {
                device: Arc::clone(&self.name),
                offset: self.position,
                kind,
                pass,
                detail: Some(format!("worker panicked: {}", message)),
            },
            None,
        );
    }

    fn report(&mut self, fault: Fault, dump: Option<(&[u8], &[u8])>) {
        self.ctx
            .log
            .fault(&fault, dump.map(|(e, _)| e), dump.map(|(_, a)| a));
        self.snapshot.fault_count += 1;
        self.ctx.faults.record(fault.clone());
        let _ = self.ctx.events.send(RunEvent::Fault(fault));
    }

    fn enter(&mut self, kind: PassKind, pass: u32) {
        let state = match kind {
            PassKind::Write => DeviceState::Writing(pass),
            PassKind::Verify => DeviceState::Verifying(pass),
        };
        self.snapshot.state = state;
        self.snapshot.bytes_processed = 0;
        self.publish();
        self.ctx.log.info(format!("{}: {}", self.name, state));
        let _ = self.ctx.events.send(RunEvent::StateChanged {
            device: Arc::clone(&self.name),
            state,
        });
    }

    fn publish(&self) {
        self.ctx.progress.publish(self.snapshot.clone());
    }
}

/// Expected and actual bytes of one region, for diagnosing a reported fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDiff {
    pub offset: u64,
    pub pass: u32,
    pub expected: Vec<u8>,
    pub actual: Vec<u8>,
    pub difference: Option<Difference>,
}

/// Read `len` bytes at `offset` and set them against what pass `pass` writes there.
pub fn inspect_region<T: BlockTarget + ?Sized>(
    target: &mut T,
    patterns: &PatternGenerator,
    pass: u32,
    offset: u64,
    len: usize,
) -> Result<RegionDiff, ChunkIoError> {
    let mut buf = chunk_buffer(len);
    read_chunk(target, buf.as_mut_slice(), offset)?;
    let expected = patterns.generate(pass, offset, len);
    let difference = compare(&expected, buf.as_slice());
    Ok(RegionDiff {
        offset,
        pass,
        expected,
        actual: buf.as_slice().to_vec(),
        difference,
    })
}
