//! Host integration traits
//!
//! A host that runs its own scheduler (green threads, coroutines) supplies
//! its notion of "thread" and "mutex" through [`ThreadingProvider`], and its
//! readiness primitive through [`Poller`]. Plain OS-threaded programs need
//! neither: [`OsThreading`] and [`SystemPoller`] are the stock versions.

use std::io;

use crate::spinlock::SpinLock;

/// A mutex as seen by the registry: explicit lock and unlock, no data
pub trait RawLock: Send + Sync {
    fn lock(&self);
    fn unlock(&self);
}

/// Thread identity plus a mutex factory
///
/// Installed at most once per process, before any client exists.
pub trait ThreadingProvider: Send + Sync {
    /// Identity of the calling thread. Must be stable for the thread's life
    /// and distinct between live threads.
    fn thread_id(&self) -> u64;

    fn new_lock(&self) -> Box<dyn RawLock>;
}

/// Holds a [`RawLock`] until dropped
pub struct RawLockGuard<'a> {
    lock: &'a dyn RawLock,
}

impl<'a> RawLockGuard<'a> {
    pub fn new(lock: &'a dyn RawLock) -> Self {
        lock.lock();
        RawLockGuard { lock }
    }
}

impl Drop for RawLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// The readiness wait every dispatcher funnels through.
///
/// Same contract as `poll(2)`: returns the number of descriptors with
/// non-zero `revents`, `0` on timeout. A negative timeout waits forever.
pub trait Poller: Send + Sync {
    fn poll(&self, fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize>;
}

// ── Stock implementations ──

/// `poll(2)` directly
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPoller;

impl Poller for SystemPoller {
    fn poll(&self, fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
        // Safety: fds is a valid, exclusively borrowed pollfd array
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

/// OS threads: kernel thread id and a spinning lock
#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreading;

impl ThreadingProvider for OsThreading {
    fn thread_id(&self) -> u64 {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                // Safety: gettid has no preconditions
                unsafe { libc::syscall(libc::SYS_gettid) as u64 }
            } else {
                // Safety: pthread_self has no preconditions
                unsafe { libc::pthread_self() as u64 }
            }
        }
    }

    fn new_lock(&self) -> Box<dyn RawLock> {
        Box::new(SpinRawLock::default())
    }
}

#[derive(Default)]
struct SpinRawLock {
    held: SpinLock<()>,
}

impl RawLock for SpinRawLock {
    fn lock(&self) {
        // The guard is forgotten so the flag stays set until unlock()
        core::mem::forget(self.held.lock());
    }

    fn unlock(&self) {
        // Safety: only called by the holder that forgot its guard in lock()
        unsafe { self.held.force_unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_os_thread_ids_differ() {
        let here = OsThreading.thread_id();
        assert_eq!(here, OsThreading.thread_id());
        let there = std::thread::spawn(|| OsThreading.thread_id()).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_raw_lock_excludes() {
        let lock: Arc<dyn RawLock> = Arc::from(OsThreading.new_lock());
        let count = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let count = Arc::clone(&count);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let _g = RawLockGuard::new(&*lock);
                        // Non-atomic read-modify-write under the lock
                        let v = count.load(Ordering::Relaxed);
                        count.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(count.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn test_system_poller_timeout() {
        let mut fds: [libc::pollfd; 0] = [];
        assert_eq!(SystemPoller.poll(&mut fds, 1).unwrap(), 0);
    }
}
