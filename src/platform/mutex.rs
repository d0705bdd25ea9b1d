//! Cross-process robust recursive mutex, embedded directly in the shared
//! mapping's header.
//!
//! Uses POSIX `pthread_mutex_t` with `PTHREAD_MUTEX_RECURSIVE`,
//! `PTHREAD_PROCESS_SHARED` and `PTHREAD_MUTEX_ROBUST`. Recursive so a
//! thread re-entering `lock_record`/`lock_table` for a row or table it
//! already holds doesn't deadlock against itself. Robust so that if the
//! holding process dies while the mutex is held, the next acquirer is
//! told via `EOWNERDEAD` rather than blocking forever.
use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;

/// Embedded mutex state. Lives inside the mapped header, so its layout
/// must be identical across every process and binary build sharing the
/// segment — this only holds on hosts where `libc::pthread_mutex_t` has
/// a stable in-memory representation for a given libc, i.e. Linux.
#[repr(C)]
pub struct RawMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: the mutex is explicitly designed to be shared across threads
// and processes; all access to the data it protects is serialized by
// `enter`/`leave`.
unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    /// Initialize a mutex at rest in freshly-zeroed shared memory.
    ///
    /// # Safety
    /// `self` must point into shared memory that is not concurrently
    /// accessed by another process until initialization completes. The
    /// caller (the segment-creation path, which holds an exclusive
    /// `flock` on the backing file) is responsible for that exclusion;
    /// see `platform::mapping` for why the mutex cannot guard its own
    /// construction.
    pub unsafe fn init(&self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        let ret = libc::pthread_mutexattr_init(attr.as_mut_ptr());
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        let mut attr = attr.assume_init();

        let ret = libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_RECURSIVE);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutex_init(self.inner.get(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        Ok(())
    }

    /// Acquire the mutex. Blocks until available.
    ///
    /// Returns `true` if the previous holder died while holding the
    /// mutex (`EOWNERDEAD`); the mutex has already been marked
    /// consistent by the time this returns, but the caller must still
    /// reconcile any state the dead holder may have left mid-mutation
    /// (see `Registry`'s sweep-on-dead-owner behavior).
    ///
    /// # Safety
    /// Must only be called on a mutex that has been `init`-ed.
    pub unsafe fn enter(&self) -> bool {
        let ret = libc::pthread_mutex_lock(self.inner.get());
        if ret == libc::EOWNERDEAD {
            // Safe to make consistent: we now hold the lock.
            libc::pthread_mutex_consistent(self.inner.get());
            true
        } else {
            debug_assert_eq!(ret, 0, "pthread_mutex_lock failed: {ret}");
            false
        }
    }

    /// Release the mutex.
    ///
    /// # Safety
    /// Caller must currently hold the mutex (i.e. have called `enter`
    /// one more time than `leave` on this thread).
    pub unsafe fn leave(&self) {
        let ret = libc::pthread_mutex_unlock(self.inner.get());
        debug_assert_eq!(ret, 0, "pthread_mutex_unlock failed: {ret}");
    }
}

/// RAII guard returned by `Registry`'s internal `lock()` helpers.
///
/// Unlike a `std::sync::MutexGuard`, this does not give access to the
/// protected data directly — the protected data is the entire shared
/// segment, accessed through raw pointers elsewhere in this crate. The
/// guard's only job is to guarantee `leave` runs once per `enter`, even
/// on an early return or panic unwind.
pub struct MutexGuard<'a> {
    mutex: &'a RawMutex,
    /// Set if this class's mutex reported a dead former holder when
    /// this guard was acquired.
    pub owner_died: bool,
}

impl<'a> MutexGuard<'a> {
    /// # Safety
    /// `mutex` must be an initialized `RawMutex` living in shared memory
    /// that outlives the guard.
    pub unsafe fn acquire(mutex: &'a RawMutex) -> Self {
        let owner_died = mutex.enter();
        MutexGuard { mutex, owner_died }
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.mutex.leave() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    #[test]
    fn init_enter_leave_round_trip() {
        let mutex: RawMutex = unsafe { MaybeUninit::zeroed().assume_init() };
        unsafe {
            mutex.init().unwrap();
            let died = mutex.enter();
            assert!(!died);
            // Recursive: re-entering from the same thread must not deadlock.
            let died_again = mutex.enter();
            assert!(!died_again);
            mutex.leave();
            mutex.leave();
        }
    }
}
