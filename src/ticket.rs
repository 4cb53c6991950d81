//! Scoped RPC: one ticket per round trip.
//!
//! A ticket owns its request for the duration of one dispatch and its reply
//! afterwards. It is released exactly once, on drop, on every exit path,
//! including the paths between a failed wait and reply interpretation where
//! ad-hoc release calls historically leak. A ticket marked killed tells the
//! transport the reply body was never wanted, so oversized buffers can be
//! reclaimed without a user copy.

use tracing::trace;

use crate::biglock::OpGuard;
use crate::errno::{Errno, OpResult};
use crate::host::Credentials;
use crate::mount::Mount;
use crate::node::NodeId;
use crate::proto::{Reply, Request};
use crate::transport::RequestHeader;

pub struct Ticket<'m> {
    mount: &'m Mount,
    unique: u64,
    killed: bool,
    released: bool,
    reply: Option<Reply>,
}

impl<'m> Ticket<'m> {
    /// Allocate a ticket. Nothing is sent yet.
    #[must_use]
    pub fn new(mount: &'m Mount) -> Self {
        Ticket {
            mount,
            unique: mount.next_unique(),
            killed: false,
            released: false,
            reply: None,
        }
    }

    /// Mark the eventual reply unwanted. Set before waiting when the caller
    /// only needs the reply's size fields.
    pub fn kill(&mut self) {
        self.killed = true;
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Ticket number, for correlation in traces and tests.
    #[must_use]
    pub fn unique(&self) -> u64 {
        self.unique
    }

    /// Send `body` to `nodeid` and block until the daemon answers.
    ///
    /// The big lock is suspended for the duration of the wait. On success
    /// the reply is owned by this ticket and borrowed through
    /// [`Ticket::reply`]; on failure the ticket holds nothing and remains
    /// safe to drop.
    pub fn dispatch_and_wait(
        &mut self,
        guard: &mut OpGuard<'_>,
        nodeid: NodeId,
        cred: &Credentials,
        body: Request,
    ) -> OpResult<()> {
        debug_assert!(self.reply.is_none(), "ticket dispatched twice");
        let header = RequestHeader {
            unique: self.unique,
            opcode: body.opcode(),
            nodeid,
            uid: cred.uid,
            gid: cred.gid,
            pid: cred.pid,
        };
        trace!(unique = self.unique, opcode = %header.opcode, node = nodeid.0, "dispatch");
        let outcome = guard.suspend(|| self.mount.transport().round_trip(header, body));
        match outcome {
            Ok(reply) => {
                self.reply = Some(reply);
                Ok(())
            }
            Err(err) => {
                trace!(unique = self.unique, %err, "dispatch failed");
                Err(err.errno())
            }
        }
    }

    /// Borrow the reply delivered by a successful wait.
    pub fn reply(&self) -> OpResult<&Reply> {
        self.reply.as_ref().ok_or(Errno::EIO)
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.mount
                .transport()
                .reply_dropped(self.unique, self.killed);
        }
    }
}

/// One-shot round trip for requests with no interesting payload handling:
/// init, dispatch, wait, and hand the ticket back for reply interpretation.
pub fn simple_put_get<'m>(
    mount: &'m Mount,
    guard: &mut OpGuard<'_>,
    nodeid: NodeId,
    cred: &Credentials,
    body: Request,
) -> OpResult<Ticket<'m>> {
    let mut ticket = Ticket::new(mount);
    ticket.dispatch_and_wait(guard, nodeid, cred, body)?;
    Ok(ticket)
}
