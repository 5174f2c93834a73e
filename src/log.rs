//! Timestamped run log: stderr (or the live progress display) plus an
//! optional append-only log file.

use std::cmp;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::Local;
use indicatif::MultiProgress;
use parking_lot::Mutex;

use crate::fault::Fault;

const MAX_DUMP_LEN: usize = 64;

pub fn current_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug, Default)]
pub struct RunLog {
    file: Option<Mutex<File>>,
    progress: Option<MultiProgress>,
    echo: bool,
}

impl RunLog {
    /// Discards everything.
    pub fn quiet() -> Self {
        Self::default()
    }

    pub fn stderr() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// Append to `path` and echo to stderr.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Mutex::new(file)),
            progress: None,
            echo: true,
        })
    }

    /// Route echoed lines above the live bars instead of through stderr.
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn info<S: AsRef<str>>(&self, msg: S) {
        self.emit(format!("[{}] {}", current_timestamp(), msg.as_ref()));
    }

    /// Log a fault; for mismatches pass the chunk tails starting at the
    /// first differing byte to get a hex dump of both.
    pub fn fault(&self, fault: &Fault, expected: Option<&[u8]>, actual: Option<&[u8]>) {
        let mut message = format!(
            "[{}] [{}] {} at byte {} (pass {})",
            current_timestamp(),
            fault.device,
            fault.kind,
            fault.offset,
            fault.pass
        );
        if let Some(detail) = &fault.detail {
            message.push_str(": ");
            message.push_str(detail);
        }
        if let (Some(exp), Some(act)) = (expected, actual) {
            let exp = &exp[..cmp::min(exp.len(), MAX_DUMP_LEN)];
            let act = &act[..cmp::min(act.len(), MAX_DUMP_LEN)];
            message.push_str(&format!(
                "\nExpected (first {} bytes): {:02X?}\nActual   (first {} bytes): {:02X?}",
                exp.len(),
                exp,
                act.len(),
                act
            ));
        }
        self.emit(message);
    }

    fn emit(&self, line: String) {
        if self.echo {
            match &self.progress {
                Some(mp) if !mp.is_hidden() => {
                    let _ = mp.println(&line);
                }
                _ => eprintln!("{}", line),
            }
        }
        if let Some(file) = &self.file {
            let mut guard = file.lock();
            let _ = writeln!(*guard, "{}", line);
            let _ = guard.flush();
        }
    }
}
