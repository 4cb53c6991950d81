//! Per-mount table of operations the daemon actually implements.
//!
//! "Not implemented" is modeled as data rather than as an error threaded
//! through the dispatch stack: the first `ENOSYS` for an optional opcode
//! clears its bit, and every later call short-circuits to `ENOTSUP` without
//! a round trip. Bits are never set back within a mount lifetime.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::proto::Opcode;

/// Monotonic bitset of daemon-side capabilities.
#[derive(Default)]
pub struct CapabilityTable {
    /// A set bit means the opcode has been observed unimplemented.
    disabled: AtomicU64,
}

impl CapabilityTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True unless the opcode has been downgraded.
    #[must_use]
    pub fn implemented(&self, op: Opcode) -> bool {
        self.disabled.load(Ordering::Relaxed) & op.bit() == 0
    }

    /// Record an `ENOSYS` for `op`. Permanent for this mount.
    pub fn downgrade(&self, op: Opcode) {
        self.disabled.fetch_or(op.bit(), Ordering::Relaxed);
    }
}
