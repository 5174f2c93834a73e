//! Raw device access: the [`BlockTarget`] seam the workers drive, the
//! file/block-device implementation, and aligned chunk buffers.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use aligned_vec::{AVec, ConstAlign};
use thiserror::Error;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(target_os = "windows")]
use std::os::windows::fs::OpenOptionsExt;
#[cfg(target_os = "windows")]
use winapi::um::winbase::{FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH};

/// Buffer alignment that satisfies O_DIRECT on every common logical block size.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;
/// Direct I/O transfer sizes and device sizes must be multiples of this.
pub const SECTOR_SIZE: usize = 512;

pub type ChunkBuf = AVec<u8, ConstAlign<DIRECT_IO_ALIGNMENT>>;

/// Zeroed, page-aligned buffer of `len` bytes.
pub fn chunk_buffer(len: usize) -> ChunkBuf {
    let mut buf = ChunkBuf::with_capacity(DIRECT_IO_ALIGNMENT, len);
    for _ in 0..len {
        buf.push(0);
    }
    buf
}

/// A byte-addressed storage target exclusively owned by one worker.
pub trait BlockTarget: Send {
    /// Addressable length in bytes, fixed for the life of the target.
    fn size(&self) -> u64;

    /// One positional write. May transfer fewer bytes than `buf.len()`.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// One positional read. May transfer fewer bytes than `buf.len()`;
    /// `Ok(0)` means end of device.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Push written data to stable storage so later reads hit the medium.
    fn flush(&mut self) -> io::Result<()>;
}

impl<T: BlockTarget + ?Sized> BlockTarget for Box<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        (**self).write_at(buf, offset)
    }
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Failure of a whole-chunk transfer.
#[derive(Debug, Error)]
pub enum ChunkIoError {
    #[error("device accepted only {transferred} of {expected} bytes")]
    Short { transferred: usize, expected: usize },
    #[error("I/O error after {transferred} bytes: {source}")]
    Failed {
        transferred: usize,
        #[source]
        source: io::Error,
    },
}

impl ChunkIoError {
    /// True when part of the chunk moved before the transfer stopped.
    pub fn is_partial(&self) -> bool {
        match self {
            ChunkIoError::Short { .. } => true,
            ChunkIoError::Failed { transferred, .. } => *transferred > 0,
        }
    }
}

/// Write all of `buf` at `offset`, continuing after partial transfers.
pub fn write_chunk<T: BlockTarget + ?Sized>(
    target: &mut T,
    buf: &[u8],
    offset: u64,
) -> Result<(), ChunkIoError> {
    let mut done = 0usize;
    while done < buf.len() {
        match target.write_at(&buf[done..], offset + done as u64) {
            Ok(0) => {
                return Err(ChunkIoError::Short {
                    transferred: done,
                    expected: buf.len(),
                })
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(source) => {
                return Err(ChunkIoError::Failed {
                    transferred: done,
                    source,
                })
            }
        }
    }
    Ok(())
}

/// Fill all of `buf` from `offset`, continuing after partial transfers.
pub fn read_chunk<T: BlockTarget + ?Sized>(
    target: &mut T,
    buf: &mut [u8],
    offset: u64,
) -> Result<(), ChunkIoError> {
    let expected = buf.len();
    let mut done = 0usize;
    while done < expected {
        match target.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => {
                return Err(ChunkIoError::Short {
                    transferred: done,
                    expected,
                })
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(source) => {
                return Err(ChunkIoError::Failed {
                    transferred: done,
                    source,
                })
            }
        }
    }
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            std::os::unix::fs::FileExt::read_at(file, buf, offset)
        }
        fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
            std::os::unix::fs::FileExt::write_at(file, buf, offset)
        }
        fn is_block_device(path: &Path) -> bool {
            use std::os::unix::fs::FileTypeExt;
            std::fs::metadata(path)
                .map(|m| m.file_type().is_block_device())
                .unwrap_or(false)
        }
    } else if #[cfg(windows)] {
        fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            std::os::windows::fs::FileExt::seek_read(file, buf, offset)
        }
        fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
            std::os::windows::fs::FileExt::seek_write(file, buf, offset)
        }
        fn is_block_device(_path: &Path) -> bool {
            false
        }
    }
}

fn open_options(direct_io: bool, exclusive: bool) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    #[cfg(target_os = "linux")]
    {
        let mut flags = 0;
        if direct_io {
            flags |= libc::O_DIRECT;
        }
        // Without O_CREAT, O_EXCL on a block device fails with EBUSY if it is mounted.
        if exclusive {
            flags |= libc::O_EXCL;
        }
        opts.custom_flags(flags);
    }
    #[cfg(target_os = "windows")]
    {
        if direct_io {
            opts.custom_flags(FILE_FLAG_NO_BUFFERING | FILE_FLAG_WRITE_THROUGH);
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    let _ = (direct_io, exclusive);
    opts
}

#[cfg(target_os = "macos")]
fn enable_nocache(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    if unsafe { libc::fcntl(fd, libc::F_RDAHEAD, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_NOCACHE, 1) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn raw_disk_length(file: &File) -> io::Result<u64> {
    use std::os::windows::io::AsRawHandle;
    use std::{mem, ptr};
    use winapi::um::ioapiset::DeviceIoControl;

    // CTL_CODE(IOCTL_DISK_BASE, 0x17, METHOD_BUFFERED, FILE_READ_ACCESS)
    const IOCTL_DISK_GET_LENGTH_INFO: u32 = 0x0007_405C;
    let mut length: i64 = 0;
    let mut bytes = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            file.as_raw_handle() as _,
            IOCTL_DISK_GET_LENGTH_INFO,
            ptr::null_mut(),
            0,
            &mut length as *mut i64 as *mut _,
            mem::size_of::<i64>() as u32,
            &mut bytes,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(length as u64)
}

/// Addressable length of an open device or file.
fn device_size(file: &mut File) -> io::Result<u64> {
    // Raw disks (\\.\PhysicalDriveN) do not support seeking to the end.
    #[cfg(target_os = "windows")]
    {
        if let Ok(len) = raw_disk_length(file) {
            return Ok(len);
        }
    }
    // Block devices report a metadata length of zero; seeking to the end does not.
    file.seek(SeekFrom::End(0))
}

/// A block device node (or a regular file standing in for one).
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: File,
    size: u64,
    direct_io: bool,
}

impl FileDevice {
    /// Open `path` read/write, exclusively where the OS allows it, and
    /// discover its size.
    pub fn open<P: AsRef<Path>>(path: P, direct_io: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let mut file = open_options(direct_io, is_block_device(path)).open(path)?;
        #[cfg(target_os = "macos")]
        {
            if direct_io {
                enable_nocache(&file)?;
            }
        }
        let size = device_size(&mut file)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            direct_io,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn direct_io(&self) -> bool {
        self.direct_io
    }
}

impl BlockTarget for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        pwrite(&self.file, buf, offset)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        pread(&self.file, buf, offset)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_all()?;
        #[cfg(target_os = "linux")]
        {
            if !self.direct_io {
                use std::os::unix::io::AsRawFd;
                let ret = unsafe {
                    libc::posix_fadvise(self.file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED)
                };
                if ret != 0 {
                    return Err(io::Error::from_raw_os_error(ret));
                }
            }
        }
        Ok(())
    }
}
