//! Read-only memory-mapped views of persisted column files.

use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::{Result, SinkbufError};

/// Maximum map size for different architectures
#[cfg(any(target_arch = "x86", target_arch = "arm"))]
pub const MAX_MAP_SIZE: usize = 0x7FFFFFFF; // 2GB for 32-bit

#[cfg(not(any(target_arch = "x86", target_arch = "arm")))]
pub const MAX_MAP_SIZE: usize = usize::MAX;

/// A read-only mapping of one file. Keeps the file handle open for as long
/// as the mapping lives.
#[derive(Debug)]
pub struct PlatformMmap {
    mmap: Option<Mmap>,
    _file: File,
    path: PathBuf,
}

impl PlatformMmap {
    /// Maps the whole file at `path`. Empty files get an empty view, since
    /// zero-length mappings are rejected by some platforms.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| SinkbufError::io_at(path, e))?;
        let length = file
            .metadata()
            .map_err(|e| SinkbufError::io_at(path, e))?
            .len() as usize;

        if length > MAX_MAP_SIZE {
            return Err(SinkbufError::MemoryMap {
                path: path.to_path_buf(),
                details: format!(
                    "map size {} exceeds maximum {} for this architecture",
                    length, MAX_MAP_SIZE
                ),
            });
        }

        let mmap = if length == 0 {
            None
        } else {
            let mmap = unsafe { MmapOptions::new().len(length).map(&file) }.map_err(|e| {
                SinkbufError::MemoryMap {
                    path: path.to_path_buf(),
                    details: e.to_string(),
                }
            })?;
            Some(mmap)
        };

        Ok(Self {
            mmap,
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Returns the memory-mapped data as a byte slice
    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Returns the length of the mapped region
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hints that rows will be read by position rather than sequentially.
    pub fn advise_random(&self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(mmap) = &self.mmap {
            return unix::madvise_random(mmap);
        }
        Ok(())
    }
}

#[cfg(unix)]
mod unix {
    use memmap2::Mmap;
    use std::io;

    /// Advises the kernel to expect random access patterns
    pub fn madvise_random(mmap: &Mmap) -> io::Result<()> {
        use libc::{MADV_RANDOM, madvise};

        let ret = unsafe { madvise(mmap.as_ptr() as *mut libc::c_void, mmap.len(), MADV_RANDOM) };

        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}
