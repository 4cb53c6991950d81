//! Per-vnode attribute cache with monotonic-clock expiry.

use std::time::{Duration, Instant};

use crate::proto::Attr;

/// Cached stat plus the deadline it is valid until. An entry is fresh iff
/// `now <= deadline`; invalidation simply drops the deadline.
#[derive(Debug, Default)]
pub struct AttrCache {
    attr: Option<Attr>,
    deadline: Option<Instant>,
}

impl AttrCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached attributes, only while fresh.
    #[must_use]
    pub fn load(&self) -> Option<&Attr> {
        let deadline = self.deadline?;
        if Instant::now() <= deadline {
            self.attr.as_ref()
        } else {
            None
        }
    }

    /// The cached attributes regardless of freshness. Used where stale data
    /// is better than nothing (fabricated stats, nlink checks).
    #[must_use]
    pub fn peek(&self) -> Option<&Attr> {
        self.attr.as_ref()
    }

    /// Store fresh attributes valid for `valid` from now.
    pub fn store(&mut self, attr: Attr, valid: Duration) {
        self.attr = Some(attr);
        self.deadline = Instant::now().checked_add(valid);
    }

    /// Expire the entry. The attribute bytes are kept for `peek`.
    pub fn invalidate(&mut self) {
        self.deadline = None;
    }
}
