use std::fmt;

use thiserror::Error;

/// Why a device could not join a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupErrorKind {
    #[error("cannot open for read/write: {0}")]
    Unreadable(String),
    #[error("reports a size of zero bytes")]
    ZeroLength,
    #[error("size {size} is not a multiple of the {alignment}-byte direct I/O alignment")]
    MisalignedSize { size: u64, alignment: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{device}: {kind}")]
pub struct SetupError {
    pub device: String,
    pub kind: SetupErrorKind,
}

/// Invalid run setup. A run that fails with one of these never starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no devices were given")]
    NoDevices,
    #[error("pass pair count must be at least 1 (got {0})")]
    InvalidPassCount(u32),
    #[error("{device}: chunk size must be non-zero (got {chunk_size})")]
    InvalidChunkSize { device: String, chunk_size: usize },
    #[error("{device}: direct I/O needs a chunk size that is a multiple of {alignment} (got {chunk_size})")]
    MisalignedChunk {
        device: String,
        chunk_size: usize,
        alignment: usize,
    },
    #[error("{0} was given more than once")]
    DuplicateDevice(String),
    #[error("unusable devices: {}", SetupErrors(.0))]
    DeviceSetup(Vec<SetupError>),
}

struct SetupErrors<'a>(&'a [SetupError]);

impl fmt::Display for SetupErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}
