//! Process-shared mutex serializing every pool mutation (spec §4.4, §5).
//!
//! Grounded on `examples/original_source/src/core/ngx_shmtx.h`: the
//! `ngx_shmtx_sh_t` (`lock`/`wait` words that live *in* the shared region)
//! and `ngx_shmtx_t` (the process-local handle wrapping them, plus a
//! `semaphore`/`sem_t`/`fd`/`name`/`spin` side) are kept as two separate
//! Rust types here (`ShmMutexState` for the shared bytes, `ShmMutex` for
//! the process-local handle), since Rust's ownership model makes the split
//! explicit where the C header left it implicit in field layout.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Bytes embedded in the shared region at a fixed offset (spec §6.2: offset
/// 0 is the lock word, offset `W/8` the waiter counter). `0` means free;
/// any other value is an owner identifier (a process id on Unix, a
/// `GetCurrentProcessId()` value on Windows).
#[repr(C)]
pub struct ShmMutexState {
    lock: AtomicUsize,
    waiters: AtomicUsize,
    #[cfg(all(not(windows), target_os = "linux"))]
    sem: libc::sem_t,
}

impl ShmMutexState {
    /// Initializes a zeroed slice of shared bytes as a fresh, unlocked
    /// mutex state. Must be called exactly once per region, before any
    /// process calls `ShmMutex::lock`.
    ///
    /// # Safety
    /// `ptr` must point to at least `size_of::<ShmMutexState>()` writable
    /// bytes that no other process is concurrently reading or writing.
    pub unsafe fn init(ptr: *mut ShmMutexState) {
        core::ptr::write(
            ptr,
            ShmMutexState {
                lock: AtomicUsize::new(0),
                waiters: AtomicUsize::new(0),
                #[cfg(all(not(windows), target_os = "linux"))]
                sem: core::mem::zeroed(),
            },
        );
        #[cfg(all(not(windows), target_os = "linux"))]
        {
            let sem_ptr = core::ptr::addr_of_mut!((*ptr).sem);
            // pshared=1: the semaphore is shared between processes, not just threads.
            libc::sem_init(sem_ptr, 1, 0);
        }
    }
}

/// How `ShmMutex` waits once its bounded spin loop gives up.
enum WaitStrategy {
    /// Block on the POSIX semaphore embedded in `ShmMutexState`.
    #[cfg(all(not(windows), target_os = "linux"))]
    Semaphore,
    /// Sleep for a short fixed interval and retry (spec §4.4's explicitly
    /// permitted alternative to a semaphore; used on platforms without a
    /// process-shared semaphore, and always on Windows).
    Sleep(Duration),
}

/// Number of CAS attempts before falling back to `WaitStrategy` (spec:
/// "spin count configured per build").
const DEFAULT_SPIN_COUNT: u32 = 1000;

/// A process-local handle onto a process-shared mutex. Any number of
/// `ShmMutex` handles, one per process typically, may point at the same
/// `ShmMutexState` bytes.
pub struct ShmMutex {
    state: *mut ShmMutexState,
    owner_id: usize,
    spin_count: u32,
    wait: WaitStrategy,
}

unsafe impl Send for ShmMutex {}

impl ShmMutex {
    /// Wraps already-initialized shared bytes. `owner_id` identifies this
    /// process for `force_unlock`'s comparison; pass the OS process id.
    ///
    /// # Safety
    /// `state` must point to a `ShmMutexState` initialized by
    /// `ShmMutexState::init` and must outlive this handle.
    pub unsafe fn create(state: *mut ShmMutexState, owner_id: usize) -> ShmMutex {
        #[cfg(all(not(windows), target_os = "linux"))]
        let wait = WaitStrategy::Semaphore;
        #[cfg(not(all(not(windows), target_os = "linux")))]
        let wait = WaitStrategy::Sleep(Duration::from_micros(100));
        ShmMutex { state, owner_id, spin_count: DEFAULT_SPIN_COUNT, wait }
    }

    #[inline]
    fn lock_word(&self) -> &AtomicUsize {
        unsafe { &(*self.state).lock }
    }

    #[inline]
    fn waiters(&self) -> &AtomicUsize {
        unsafe { &(*self.state).waiters }
    }

    /// Non-blocking acquire attempt.
    pub fn trylock(&self) -> bool {
        self.lock_word()
            .compare_exchange(0, self.owner_id, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Blocks until the lock is acquired. Spins for `spin_count` iterations
    /// hinting the CPU to yield between attempts, then falls back to
    /// `WaitStrategy`, registering as a waiter first so `unlock` knows to
    /// post.
    pub fn lock(&self) {
        for _ in 0..self.spin_count {
            if self.trylock() {
                return;
            }
            core::hint::spin_loop();
        }
        loop {
            self.waiters().fetch_add(1, Ordering::SeqCst);
            if self.trylock() {
                self.waiters().fetch_sub(1, Ordering::SeqCst);
                return;
            }
            match &self.wait {
                #[cfg(all(not(windows), target_os = "linux"))]
                WaitStrategy::Semaphore => unsafe {
                    let sem_ptr = core::ptr::addr_of_mut!((*self.state).sem);
                    libc::sem_wait(sem_ptr);
                },
                WaitStrategy::Sleep(d) => std::thread::sleep(*d),
            }
            self.waiters().fetch_sub(1, Ordering::SeqCst);
            if self.trylock() {
                return;
            }
        }
    }

    /// Releases the lock. A release barrier precedes the store (spec
    /// §4.4's memory-ordering requirement); if any waiter is registered,
    /// exactly one is woken.
    pub fn unlock(&self) {
        self.lock_word().store(0, Ordering::Release);
        if self.waiters().load(Ordering::SeqCst) > 0 {
            match &self.wait {
                #[cfg(all(not(windows), target_os = "linux"))]
                WaitStrategy::Semaphore => unsafe {
                    let sem_ptr = core::ptr::addr_of_mut!((*self.state).sem);
                    libc::sem_post(sem_ptr);
                },
                WaitStrategy::Sleep(_) => {}
            }
        }
    }

    /// Supervisor-initiated release after reaping a dead worker (spec
    /// §4.4/§5 "Crash handling"): clears the lock only if `owner` still
    /// holds it, then posts the semaphore. Returns whether it actually
    /// cleared anything; this is the only legitimate third-party mutation
    /// of the lock word.
    pub fn force_unlock(&self, owner: usize) -> bool {
        let cleared = self
            .lock_word()
            .compare_exchange(owner, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok();
        if cleared {
            match &self.wait {
                #[cfg(all(not(windows), target_os = "linux"))]
                WaitStrategy::Semaphore => unsafe {
                    let sem_ptr = core::ptr::addr_of_mut!((*self.state).sem);
                    libc::sem_post(sem_ptr);
                },
                WaitStrategy::Sleep(_) => {}
            }
        }
        cleared
    }
}

impl Drop for ShmMutexState {
    fn drop(&mut self) {
        #[cfg(all(not(windows), target_os = "linux"))]
        unsafe {
            libc::sem_destroy(&mut self.sem);
        }
    }
}

/// Advisory file-lock fallback (spec §4.4), used in place of
/// `ShmMutex`/`ShmMutexState` on platforms without the required atomic
/// operations. Each process opens its own file descriptor against the same
/// path; the kernel arbitrates, so no bytes need to live in the shared
/// region at all. POSIX-only: `flock` has no Windows equivalent, where the
/// CAS-plus-sleep `ShmMutex` path is used unconditionally instead.
#[cfg(not(windows))]
pub struct FileLockMutex {
    fd: libc::c_int,
}

#[cfg(not(windows))]
unsafe impl Send for FileLockMutex {}

#[cfg(not(windows))]
impl FileLockMutex {
    pub fn create(path: &std::path::Path) -> std::io::Result<FileLockMutex> {
        use std::os::unix::ffi::OsStrExt;
        let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o600) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(FileLockMutex { fd })
    }

    pub fn trylock(&self) -> bool {
        unsafe { libc::flock(self.fd, libc::LOCK_EX | libc::LOCK_NB) == 0 }
    }

    pub fn lock(&self) {
        unsafe {
            libc::flock(self.fd, libc::LOCK_EX);
        }
    }

    pub fn unlock(&self) {
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
        }
    }
}

#[cfg(not(windows))]
impl Drop for FileLockMutex {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_state() -> Box<ShmMutexState> {
        let mut boxed = Box::new(std::mem::MaybeUninit::<ShmMutexState>::uninit());
        unsafe {
            ShmMutexState::init(boxed.as_mut_ptr());
            std::mem::transmute(boxed)
        }
    }

    #[test]
    fn trylock_then_trylock_fails() {
        let mut state = make_state();
        let m = unsafe { ShmMutex::create(state.as_mut() as *mut _, 1) };
        assert!(m.trylock());
        assert!(!m.trylock());
        m.unlock();
        assert!(m.trylock());
    }

    #[test]
    fn force_unlock_only_clears_matching_owner() {
        let mut state = make_state();
        let m = unsafe { ShmMutex::create(state.as_mut() as *mut _, 42) };
        assert!(m.trylock());
        assert!(!m.force_unlock(999));
        assert!(!m.trylock()); // still held by 42
        assert!(m.force_unlock(42));
        assert!(m.trylock());
    }

    #[test]
    fn lock_blocks_until_unlocked_from_another_thread() {
        let mut state = make_state();
        let state_ptr = state.as_mut() as *mut ShmMutexState as usize;
        let m1 = unsafe { ShmMutex::create(state_ptr as *mut ShmMutexState, 1) };
        m1.lock();
        let handle = std::thread::spawn(move || {
            let m2 = unsafe { ShmMutex::create(state_ptr as *mut ShmMutexState, 2) };
            m2.lock();
            m2.unlock();
        });
        std::thread::sleep(Duration::from_millis(20));
        m1.unlock();
        handle.join().unwrap();
    }
}
