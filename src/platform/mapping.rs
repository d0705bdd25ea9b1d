//! Shared memory region management using mmap.
//!
//! Creates or opens a named memory-mapped file holding a fixed-size
//! header followed by a contiguous slot array. A sibling zero-byte
//! "management" file is used purely to ask the host, on close, whether
//! any other process still has the mapping open (§6, Management file).
use std::fs::{self, File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::process::Command;

use memmap2::MmapMut;

use crate::error::{Result, RowlockError};

/// A header type that can live at offset 0 of a `ShmMapping`.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, contain no padding that leaks
/// uninitialized bytes into cross-process comparisons of `MAGIC`, and
/// must only be constructed in place via `initialize`.
pub unsafe trait SegmentHeader: Sized {
    /// Tag validating that a mapping is the kind of segment this type expects.
    const MAGIC: [u8; 8];

    /// Read the initialization flag. Must not assume any other field is
    /// meaningful until this returns `true`.
    fn is_initialized(&self) -> bool;

    /// Initialize every field of a freshly-zeroed header in place,
    /// finishing by setting the field `is_initialized` reads as `true`.
    ///
    /// # Safety
    /// Caller must hold the bootstrap `flock` on the backing file (see
    /// `ShmMapping::create_or_open`) for the duration of this call —
    /// the embedded mutex does not exist yet and cannot guard its own
    /// construction.
    unsafe fn initialize(this: *mut Self, capacity: u64) -> io::Result<()>;
}

/// The shared-memory mapping for one lock class (row or table), owning
/// the mmap handle and the presence-management file descriptor.
pub struct ShmMapping<H> {
    mmap: MmapMut,
    path: PathBuf,
    mng_path: PathBuf,
    // Kept open for the lifetime of the mapping so a concurrent `fuser`
    // query from another process's close path sees us as a user.
    _mng_file: File,
    _marker: PhantomData<H>,
}

impl<H: SegmentHeader> ShmMapping<H> {
    /// Create the mapping if it doesn't exist (or is too small /
    /// uninitialized), otherwise open the existing one.
    pub fn create_or_open(path: PathBuf, alloc_size: u64, capacity: u64) -> Result<Self> {
        let mng_path = super::path::management_path(&path);

        let map_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|source| RowlockError::CantOpen {
                path: path.clone(),
                source,
            })?;

        let mng_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&mng_path)
            .map_err(|source| RowlockError::CantOpen {
                path: mng_path.clone(),
                source,
            })?;

        // Bootstrap exclusion: the header's own embedded mutex can't
        // guard its own construction, so a one-time `flock` on the
        // mapping file serializes "am I the first opener" across
        // processes. Released automatically when `map_file` is dropped
        // at the end of this function (flock is per fd-table-entry, not
        // held past the open file's lifetime, so no separate guard type
        // is needed here).
        lock_exclusive(&map_file).map_err(|source| RowlockError::CantOpen {
            path: path.clone(),
            source,
        })?;

        let current_len = map_file
            .metadata()
            .map_err(|source| RowlockError::IoSeek {
                path: path.clone(),
                source,
            })?
            .len();

        if current_len < alloc_size {
            map_file
                .set_len(alloc_size)
                .map_err(|source| RowlockError::IoWrite {
                    path: path.clone(),
                    source,
                })?;
        }

        let mut mmap = unsafe {
            MmapMut::map_mut(&map_file).map_err(|source| RowlockError::IoShmmap {
                path: path.clone(),
                source,
            })?
        };

        let header_ptr = mmap.as_mut_ptr() as *mut H;
        let already_initialized = unsafe { (*header_ptr).is_initialized() };
        if !already_initialized {
            unsafe { H::initialize(header_ptr, capacity) }.map_err(|source| {
                RowlockError::CantOpen {
                    path: path.clone(),
                    source,
                }
            })?;
        }
        let _ = mmap.flush();

        // flock is released when `map_file` goes out of scope below.
        drop(map_file);

        Ok(ShmMapping {
            mmap,
            path,
            mng_path,
            _mng_file: mng_file,
            _marker: PhantomData,
        })
    }

    pub fn header(&self) -> &H {
        unsafe { &*(self.mmap.as_ptr() as *const H) }
    }

    /// Obtain a mutable header reference.
    ///
    /// # Safety
    /// Caller must hold this class's cross-process mutex.
    pub unsafe fn header_mut(&self) -> &mut H {
        &mut *(self.mmap.as_ptr() as *mut H)
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// # Safety
    /// Caller must hold this class's cross-process mutex.
    pub unsafe fn base_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }
}

impl<H> Drop for ShmMapping<H> {
    fn drop(&mut self) {
        // Best-effort: if nobody else has the mapping open, remove the
        // backing files so the last closer garbage-collects the segment
        // (§3, Lifecycle).
        match other_users(&self.mng_path) {
            Ok(Presence::None) | Ok(Presence::Me) => {
                let _ = fs::remove_file(&self.path);
                let _ = fs::remove_file(&self.mng_path);
            }
            _ => {}
        }
    }
}

enum Presence {
    None,
    Me,
    Other,
}

/// Ask the host "who has `path` open?" via the `fuser`-equivalent
/// tool, as specified in §6 (Management file). Best-effort: any failure
/// to run the tool is treated as "someone else might still have it
/// open", which is the safe (non-destructive) assumption.
fn other_users(path: &Path) -> io::Result<Presence> {
    let output = Command::new("fuser").arg(path).output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let me = std::process::id();

    let mut saw_other = false;
    let mut saw_me = false;
    for token in text.split_whitespace() {
        if let Ok(pid) = token.trim_end_matches(|c: char| !c.is_ascii_digit()).parse::<u32>() {
            if pid == me {
                saw_me = true;
            } else {
                saw_other = true;
            }
        }
    }

    Ok(if saw_other {
        Presence::Other
    } else if saw_me {
        Presence::Me
    } else {
        Presence::None
    })
}

fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mutex::RawMutex;

    #[repr(C)]
    struct TestHeader {
        initialized: u32,
        _pad: u32,
        mutex: RawMutex,
    }

    unsafe impl SegmentHeader for TestHeader {
        const MAGIC: [u8; 8] = *b"TESTHDR\0";

        fn is_initialized(&self) -> bool {
            self.initialized == 1
        }

        unsafe fn initialize(this: *mut Self, _capacity: u64) -> io::Result<()> {
            (*this).mutex.init()?;
            (*this).initialized = 1;
            Ok(())
        }
    }

    #[test]
    fn create_then_reopen_preserves_initialization() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rowlock-test-{}.seg", std::process::id()));
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(super::super::path::management_path(&path));

        let alloc = std::mem::size_of::<TestHeader>() as u64 + 4096;
        let mapping: ShmMapping<TestHeader> =
            ShmMapping::create_or_open(path.clone(), alloc, 10).unwrap();
        assert!(mapping.header().is_initialized());

        let reopened: ShmMapping<TestHeader> =
            ShmMapping::create_or_open(path.clone(), alloc, 10).unwrap();
        assert!(reopened.header().is_initialized());

        drop(mapping);
        drop(reopened);
        let _ = fs::remove_file(&path);
    }
}
