//! Bridge view of the host name cache.
//!
//! Entries map `(parent, name)` to either a live child vnode or a negative
//! marker, each with the expiry the daemon attached to the lookup reply.
//! The cache is shared with concurrent ops that run with the big lock
//! released, so it carries its own mutex and is only ever purged, never
//! mutated in place.

use std::ffi::{OsStr, OsString};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::node::{NodeId, Vnode};

/// What a cache consultation produced.
#[derive(Debug)]
pub enum CacheOutcome {
    /// Positive entry; the child vnode is alive.
    Hit(Arc<Vnode>),
    /// The name is known absent.
    Negative,
    /// Nothing cached (or the entry aged out / its vnode died).
    Miss,
}

enum NameEntry {
    Positive { vp: Weak<Vnode>, expires: Option<Instant> },
    Negative { expires: Option<Instant> },
}

impl NameEntry {
    fn expired(&self, now: Instant) -> bool {
        let expires = match self {
            NameEntry::Positive { expires, .. } | NameEntry::Negative { expires } => expires,
        };
        expires.is_some_and(|deadline| now > deadline)
    }
}

#[derive(Default)]
pub struct NameCache {
    entries: Mutex<FxHashMap<(NodeId, OsString), NameEntry>>,
}

impl NameCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, parent: NodeId, name: &OsStr) -> CacheOutcome {
        let mut entries = self.lock();
        let key = (parent, name.to_os_string());
        let now = Instant::now();
        match entries.get(&key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(&key);
                CacheOutcome::Miss
            }
            Some(NameEntry::Positive { vp, .. }) => match vp.upgrade() {
                Some(vp) => CacheOutcome::Hit(vp),
                None => {
                    entries.remove(&key);
                    CacheOutcome::Miss
                }
            },
            Some(NameEntry::Negative { .. }) => CacheOutcome::Negative,
            None => CacheOutcome::Miss,
        }
    }

    /// Record a positive entry valid until `expires` (forever if `None`).
    pub fn enter(&self, parent: NodeId, name: &OsStr, vp: &Arc<Vnode>, expires: Option<Instant>) {
        trace!(parent = parent.0, ?name, child = vp.id.0, "cache enter");
        self.lock().insert(
            (parent, name.to_os_string()),
            NameEntry::Positive {
                vp: Arc::downgrade(vp),
                expires,
            },
        );
    }

    /// Record that `name` does not exist under `parent`.
    pub fn enter_negative(&self, parent: NodeId, name: &OsStr, expires: Option<Instant>) {
        trace!(parent = parent.0, ?name, "cache enter negative");
        self.lock()
            .insert((parent, name.to_os_string()), NameEntry::Negative { expires });
    }

    /// Drop every entry that references `vp`, as parent or as child.
    pub fn purge(&self, vp: &Vnode) {
        trace!(node = vp.id.0, "cache purge");
        self.lock().retain(|(parent, _), entry| {
            if *parent == vp.id {
                return false;
            }
            match entry {
                NameEntry::Positive { vp: weak, .. } => {
                    weak.upgrade().is_none_or(|child| child.id != vp.id)
                }
                NameEntry::Negative { .. } => true,
            }
        });
    }

    /// Drop the negative entries under `parent`; a successful create just
    /// contradicted them.
    pub fn purge_negatives(&self, parent: NodeId) {
        self.lock().retain(|(p, _), entry| {
            *p != parent || !matches!(entry, NameEntry::Negative { .. })
        });
    }

    /// Forced unmount: drop everything.
    pub fn purge_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<(NodeId, OsString), NameEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
