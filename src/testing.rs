//! In-memory targets with injectable faults for engine tests.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::device::BlockTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Write { offset: u64, len: usize },
    Read { offset: u64, len: usize },
    Flush,
}

pub(crate) type OpLog = Arc<Mutex<Vec<Op>>>;

#[derive(Debug, Default)]
pub(crate) struct MemoryDevice {
    data: Vec<u8>,
    fail_write_at: Option<u64>,
    fail_read_at: Option<u64>,
    short_write_at: Option<u64>,
    short_read_at: Option<u64>,
    corrupt_on_flush: Vec<(u64, u8)>,
    fail_flush: bool,
    delay: Option<Duration>,
    ops: Option<OpLog>,
}

fn covers(offset: u64, len: usize, at: Option<u64>) -> Option<u64> {
    at.filter(|&at| at >= offset && at < offset + len as u64)
}

impl MemoryDevice {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            ..Self::default()
        }
    }

    /// Any write touching `offset` fails with EIO.
    pub fn fail_write_at(mut self, offset: u64) -> Self {
        self.fail_write_at = Some(offset);
        self
    }

    pub fn fail_read_at(mut self, offset: u64) -> Self {
        self.fail_read_at = Some(offset);
        self
    }

    /// Writes stop transferring at `offset`.
    pub fn short_write_at(mut self, offset: u64) -> Self {
        self.short_write_at = Some(offset);
        self
    }

    /// Reads stop transferring at `offset`.
    pub fn short_read_at(mut self, offset: u64) -> Self {
        self.short_read_at = Some(offset);
        self
    }

    /// XOR `mask` into the byte at `offset` every time the device is flushed,
    /// i.e. after each write sweep and before the verify sweep reads it.
    pub fn corrupt_on_flush(mut self, offset: u64, mask: u8) -> Self {
        self.corrupt_on_flush.push((offset, mask));
        self
    }

    pub fn fail_flush(mut self) -> Self {
        self.fail_flush = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_op_log(mut self, log: OpLog) -> Self {
        self.ops = Some(log);
        self
    }

    fn note(&self, op: Op) {
        if let Some(ops) = &self.ops {
            ops.lock().push(op);
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
    }
}

fn eio() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "injected EIO")
}

impl BlockTarget for MemoryDevice {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.note(Op::Write {
            offset,
            len: buf.len(),
        });
        if covers(offset, buf.len(), self.fail_write_at).is_some() {
            return Err(eio());
        }
        let start = (offset as usize).min(self.data.len());
        let mut len = buf.len().min(self.data.len().saturating_sub(start));
        if let Some(at) = covers(offset, len, self.short_write_at) {
            len = (at - offset) as usize;
        }
        self.data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(len)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.note(Op::Read {
            offset,
            len: buf.len(),
        });
        if covers(offset, buf.len(), self.fail_read_at).is_some() {
            return Err(eio());
        }
        let start = (offset as usize).min(self.data.len());
        let mut len = buf.len().min(self.data.len().saturating_sub(start));
        if let Some(at) = covers(offset, len, self.short_read_at) {
            len = (at - offset) as usize;
        }
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.note(Op::Flush);
        if self.fail_flush {
            return Err(eio());
        }
        for &(offset, mask) in &self.corrupt_on_flush {
            if let Some(byte) = self.data.get_mut(offset as usize) {
                *byte ^= mask;
            }
        }
        Ok(())
    }
}
