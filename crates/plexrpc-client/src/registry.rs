//! Thread registry
//!
//! Maps a thread identity to that thread's dispatcher, creating it when the
//! first client of the thread attaches and dropping it when the last one
//! goes. Thread identity and the registry mutex come from the installed
//! [`ThreadingProvider`]; without one every caller shares identity 0.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use plexrpc_core::{kdebug, OsThreading, RawLock, RawLockGuard, ThreadingProvider};

use crate::dispatcher::Dispatcher;

pub(crate) type SharedDispatcher = Arc<Mutex<Dispatcher>>;

pub struct Registry {
    provider: OnceLock<Box<dyn ThreadingProvider>>,
    /// Set by the first attach; no provider may be installed afterwards
    sealed: AtomicBool,
    lock: OnceLock<Box<dyn RawLock>>,
    dispatchers: UnsafeCell<BTreeMap<u64, (usize, SharedDispatcher)>>,
}

// Safety: `dispatchers` is only accessed while holding `lock`
unsafe impl Sync for Registry {}

static REGISTRY: Registry = Registry::new();

pub(crate) fn registry() -> &'static Registry {
    &REGISTRY
}

/// Install the host's threading model.
///
/// # Panics
///
/// If a provider was already installed, or if any client exists or has
/// existed in this process.
pub fn set_threading_provider(provider: Box<dyn ThreadingProvider>) {
    REGISTRY.install(provider);
}

/// Identity of the calling thread as the registry sees it
pub fn current_thread_id() -> u64 {
    REGISTRY.thread_id()
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            provider: OnceLock::new(),
            sealed: AtomicBool::new(false),
            lock: OnceLock::new(),
            dispatchers: UnsafeCell::new(BTreeMap::new()),
        }
    }

    pub fn install(&self, provider: Box<dyn ThreadingProvider>) {
        assert!(
            !self.sealed.load(Ordering::Acquire),
            "threading provider installed after a client was created"
        );
        assert!(
            self.provider.set(provider).is_ok(),
            "threading provider installed twice"
        );
    }

    pub fn has_provider(&self) -> bool {
        self.provider.get().is_some()
    }

    pub fn thread_id(&self) -> u64 {
        self.provider.get().map_or(0, |p| p.thread_id())
    }

    fn lock(&self) -> &dyn RawLock {
        self.lock
            .get_or_init(|| match self.provider.get() {
                Some(p) => p.new_lock(),
                None => OsThreading.new_lock(),
            })
            .as_ref()
    }

    /// Dispatcher of `thread_id`, created on first use
    pub(crate) fn attach(&self, thread_id: u64) -> SharedDispatcher {
        self.sealed.store(true, Ordering::Release);
        let _guard = RawLockGuard::new(self.lock());
        // Safety: the registry lock is held
        let map = unsafe { &mut *self.dispatchers.get() };
        let entry = map.entry(thread_id).or_insert_with(|| {
            kdebug!("registry: new dispatcher for thread {}", thread_id);
            (0, Arc::new(Mutex::new(Dispatcher::new(true))))
        });
        entry.0 += 1;
        Arc::clone(&entry.1)
    }

    /// Release one attachment; the dispatcher goes with the last one
    pub(crate) fn detach(&self, thread_id: u64) {
        let _guard = RawLockGuard::new(self.lock());
        // Safety: the registry lock is held
        let map = unsafe { &mut *self.dispatchers.get() };
        let last = match map.get_mut(&thread_id) {
            Some(entry) => {
                entry.0 = entry.0.saturating_sub(1);
                entry.0 == 0
            }
            None => false,
        };
        if last {
            map.remove(&thread_id);
            kdebug!("registry: dropped dispatcher for thread {}", thread_id);
        }
    }

    /// Threads with a live dispatcher
    pub fn dispatcher_count(&self) -> usize {
        let _guard = RawLockGuard::new(self.lock());
        // Safety: the registry lock is held
        let map = unsafe { &*self.dispatchers.get() };
        map.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
