//! The big per-mount lock and its suspension discipline.
//!
//! Every vnode op runs under this lock. Any section that can block on the
//! daemon or on the page cache (transport waits, uiomove, cluster calls,
//! name-cache lookups) must run with the lock released, or a daemon that
//! re-enters the filesystem (paging against its own backing store) deadlocks
//! against the kernel. [`OpGuard::suspend`] is the only way to release it,
//! and re-acquires on every exit path by construction.

use std::sync::{Mutex, MutexGuard};

/// Exclusive per-mount lock.
#[derive(Default)]
pub struct BigLock {
    inner: Mutex<()>,
}

/// Proof that the current thread holds the big lock for one vnode op.
pub struct OpGuard<'l> {
    lock: &'l BigLock,
    held: Option<MutexGuard<'l, ()>>,
}

impl BigLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a vnode op. Blocks until the lock is available.
    pub fn enter(&self) -> OpGuard<'_> {
        OpGuard {
            lock: self,
            held: Some(lock_ignoring_poison(&self.inner)),
        }
    }
}

impl<'l> OpGuard<'l> {
    /// Run `f` with the big lock released, then re-acquire it.
    ///
    /// The guard is unusable as proof-of-lock while `f` runs, which is the
    /// point: code inside `f` must not touch lock-protected state.
    pub fn suspend<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.held = None;
        let out = f();
        self.held = Some(lock_ignoring_poison(&self.lock.inner));
        out
    }
}

/// A panicking op on another thread must not wedge the whole mount.
fn lock_ignoring_poison<'a>(m: &'a Mutex<()>) -> MutexGuard<'a, ()> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
