//! The downward seam: how a built request reaches the daemon.
//!
//! The transport owns serialization, queueing, and waiter wakeup. From the
//! dispatcher's point of view it is a blocking function that either produces
//! a typed [`Reply`](crate::proto::Reply) or fails with one of the errors
//! below. Reply delivery is per-waiter; no ordering is guaranteed across
//! concurrent requests.

use thiserror::Error;

use crate::errno::Errno;
use crate::node::NodeId;
use crate::proto::{Opcode, Reply, Request};

/// Why a round trip failed before a usable reply was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The mount was marked dead while the request was queued or in flight.
    #[error("filesystem is dead")]
    Dead,
    /// The daemon stayed unresponsive beyond the mount's configured limit.
    #[error("daemon is not connected")]
    NotConnected,
    /// The waiting thread was interrupted.
    #[error("wait interrupted")]
    Interrupted,
    /// The daemon answered with an error instead of a reply body.
    #[error("daemon replied errno {0}")]
    Daemon(i32),
}

impl TransportError {
    /// Errno as seen by a vnode-op handler. `Daemon(ENOSYS)` intentionally
    /// maps to `ENOSYS` here; the handlers are responsible for downgrading
    /// it before it can escape upward.
    #[must_use]
    pub fn errno(self) -> Errno {
        match self {
            TransportError::Dead => Errno::ENXIO,
            TransportError::NotConnected => Errno::ENOTCONN,
            TransportError::Interrupted => Errno::EINTR,
            TransportError::Daemon(e) => Errno(e),
        }
    }
}

/// Header accompanying every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Ticket number; unique within the mount.
    pub unique: u64,
    pub opcode: Opcode,
    /// Target node, or the null id for mount-scoped requests.
    pub nodeid: NodeId,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// Blocking conduit to the daemon.
///
/// `round_trip` is entered with the big mount lock *released* (the ticket
/// helper suspends it); implementations are free to block indefinitely and
/// must return [`TransportError::Dead`] for every parked waiter when the
/// mount dies.
pub trait Transport: Send + Sync {
    /// Send one request and block until its reply or failure.
    fn round_trip(&self, header: RequestHeader, body: Request) -> Result<Reply, TransportError>;

    /// Queue a request whose reply nobody will wait for (FORGET, compensating
    /// RELEASE). Errors are deliberately unreported.
    fn send_and_forget(&self, header: RequestHeader, body: Request);

    /// Accounting hook: the ticket owning reply `unique` was dropped.
    /// `killed` reports whether the reply body was discarded unread.
    fn reply_dropped(&self, unique: u64, killed: bool) {
        let _ = (unique, killed);
    }
}
