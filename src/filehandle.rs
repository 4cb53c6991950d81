//! The per-vnode file-handle table.
//!
//! Each vnode carries three slots, one per access mode. A slot is valid iff
//! its open count is positive, and a valid slot corresponds to exactly one
//! outstanding OPEN at the daemon; coalescing happens by bumping the count.
//! The 1 -> 0 transition is the only thing that emits a RELEASE.

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::errno::{Errno, OpResult};
use crate::host::Credentials;
use crate::mount::Mount;
use crate::node::{Vnode, VnodeType};
use crate::proto::{OpenOut, OpenReplyFlags, Request};
use crate::ticket::Ticket;
use crate::biglock::OpGuard;

bitflags! {
    /// Host open-mode bits as handed to open/close/ioctl.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FFlags: u32 {
        const READ    = 0x0001;
        const WRITE   = 0x0002;
        const NONBLOCK = 0x0004;
        const APPEND  = 0x0008;
        /// Set (alone) on the close issued by vnode cleaning.
        const NDELAY  = 0x0010;
    }
}

bitflags! {
    /// mmap protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapProt: u32 {
        const READ  = 0x1;
        const WRITE = 0x2;
        const EXEC  = 0x4;
    }
}

/// Access mode indexing the three handle slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl HandleMode {
    pub const ALL: [HandleMode; 3] = [
        HandleMode::ReadOnly,
        HandleMode::WriteOnly,
        HandleMode::ReadWrite,
    ];

    fn index(self) -> usize {
        match self {
            HandleMode::ReadOnly => 0,
            HandleMode::WriteOnly => 1,
            HandleMode::ReadWrite => 2,
        }
    }

    /// Map host open-mode bits to a slot. Zero fflags have been observed from
    /// in-kernel callers that mean to read; treat them as read-only.
    #[must_use]
    pub fn from_fflags(fflags: FFlags) -> HandleMode {
        if fflags.contains(FFlags::READ | FFlags::WRITE) {
            HandleMode::ReadWrite
        } else if fflags.contains(FFlags::WRITE) {
            HandleMode::WriteOnly
        } else {
            HandleMode::ReadOnly
        }
    }

    /// Map mmap protections to a slot. `None` when no accessibility was
    /// requested at all.
    #[must_use]
    pub fn from_mmap_prot(prot: MmapProt) -> Option<HandleMode> {
        if prot.contains(MmapProt::WRITE) {
            if prot.intersects(MmapProt::READ | MmapProt::EXEC) {
                Some(HandleMode::ReadWrite)
            } else {
                Some(HandleMode::WriteOnly)
            }
        } else if prot.intersects(MmapProt::READ | MmapProt::EXEC) {
            Some(HandleMode::ReadOnly)
        } else {
            None
        }
    }

    /// The open flags sent to the daemon for this slot.
    #[must_use]
    pub fn to_open_flags(self) -> i32 {
        match self {
            HandleMode::ReadOnly => libc::O_RDONLY,
            HandleMode::WriteOnly => libc::O_WRONLY,
            HandleMode::ReadWrite => libc::O_RDWR,
        }
    }

    #[must_use]
    pub fn writes(self) -> bool {
        matches!(self, HandleMode::WriteOnly | HandleMode::ReadWrite)
    }

    #[must_use]
    pub fn reads(self) -> bool {
        matches!(self, HandleMode::ReadOnly | HandleMode::ReadWrite)
    }
}

/// One open daemon handle.
#[derive(Debug, Clone, Copy)]
pub struct FileHandle {
    /// Opaque daemon-assigned id.
    pub fh: u64,
    /// Usage count; the slot dies when this reaches zero.
    pub open_count: u32,
    /// Flags the OPEN was issued with.
    pub flags: i32,
    /// Flags the daemon attached to its reply.
    pub reply_flags: OpenReplyFlags,
}

/// The three-slot table.
#[derive(Debug, Default)]
pub struct HandleTable {
    slots: [Option<FileHandle>; 3],
}

impl HandleTable {
    #[must_use]
    pub fn slot(&self, mode: HandleMode) -> Option<&FileHandle> {
        self.slots[mode.index()].as_ref()
    }

    pub fn slot_mut(&mut self, mode: HandleMode) -> Option<&mut FileHandle> {
        self.slots[mode.index()].as_mut()
    }

    #[must_use]
    pub fn is_valid(&self, mode: HandleMode) -> bool {
        self.slot(mode).is_some_and(|h| h.open_count > 0)
    }

    /// Install a freshly opened handle with a use count of one.
    pub fn install(&mut self, mode: HandleMode, out: OpenOut, flags: i32) {
        debug_assert!(!self.is_valid(mode), "slot {mode:?} double-populated");
        self.slots[mode.index()] = Some(FileHandle {
            fh: out.fh,
            open_count: 1,
            flags,
            reply_flags: out.open_flags,
        });
    }

    /// Bump the use count of a valid slot.
    pub fn use_inc(&mut self, mode: HandleMode) {
        if let Some(h) = self.slot_mut(mode) {
            h.open_count += 1;
        }
    }

    /// Drop one use. Returns the handle when the count hit zero and the slot
    /// was cleared, so the caller can emit the RELEASE.
    pub fn use_dec(&mut self, mode: HandleMode) -> Option<FileHandle> {
        let slot = &mut self.slots[mode.index()];
        let h = slot.as_mut()?;
        h.open_count = h.open_count.saturating_sub(1);
        if h.open_count == 0 {
            slot.take()
        } else {
            None
        }
    }

    /// Clear a slot unconditionally, returning the handle if it was valid.
    /// Used by inactive/reclaim, which release regardless of use count.
    pub fn reset(&mut self, mode: HandleMode) -> Option<FileHandle> {
        self.slots[mode.index()].take().filter(|h| h.open_count > 0)
    }

    /// Modes whose slots are currently valid.
    #[must_use]
    pub fn valid_modes(&self) -> Vec<HandleMode> {
        HandleMode::ALL
            .into_iter()
            .filter(|m| self.is_valid(*m))
            .collect()
    }
}

/// Get a usable handle of `mode` on `vp`, opening one at the daemon if the
/// slot is invalid. The caller ends up owning one use of the slot.
pub fn handle_get(
    mount: &Mount,
    guard: &mut OpGuard<'_>,
    vp: &Vnode,
    cred: &Credentials,
    mode: HandleMode,
) -> OpResult<()> {
    {
        let mut state = vp.state();
        if state.handles.is_valid(mode) {
            state.handles.use_inc(mode);
            mount.stats.fh_reuse.bump();
            return Ok(());
        }
        // A create may have parked its handle in the read-write slot with
        // its use count already at one; the first open claims that handle,
        // moving it into whichever slot the open maps to.
        if state.flags.contains(crate::node::NodeFlags::CREATE_STASH)
            && state.handles.is_valid(HandleMode::ReadWrite)
        {
            state.flags.remove(crate::node::NodeFlags::CREATE_STASH);
            if mode != HandleMode::ReadWrite {
                if let Some(stashed) = state.handles.reset(HandleMode::ReadWrite) {
                    state.handles.install(
                        mode,
                        OpenOut {
                            fh: stashed.fh,
                            open_flags: stashed.reply_flags,
                        },
                        stashed.flags,
                    );
                }
            }
            return Ok(());
        }
    }

    let is_dir = vp.vtype == VnodeType::Directory;
    let flags = mode.to_open_flags();
    let body = if is_dir {
        Request::Opendir { flags }
    } else {
        Request::Open { flags }
    };

    let mut ticket = Ticket::new(mount);
    let result = ticket.dispatch_and_wait(guard, vp.id, cred, body);
    let out = match result.and_then(|()| ticket.reply()?.open().copied()) {
        Ok(out) => out,
        Err(err) => {
            if err == Errno::ENOENT {
                // The name went away underneath the open.
                guard.suspend(|| mount.namecache.purge(vp));
            }
            debug!(node = vp.id.0, ?mode, ?err, "open failed");
            return Err(err);
        }
    };

    let mut state = vp.state();
    if state.handles.is_valid(mode) {
        // Another thread opened the same slot while we were suspended on the
        // daemon. Keep its handle, return ours, and take a use of the winner.
        state.handles.use_inc(mode);
        mount.stats.fh_reuse.bump();
        drop(state);
        warn!(node = vp.id.0, ?mode, "lost open race, releasing duplicate");
        send_release(mount, vp.id, out.fh, flags, is_dir);
        return Ok(());
    }
    state.handles.install(mode, out, flags);
    drop(state);
    mount.stats.fh_current.bump();
    Ok(())
}

/// Drop one use of `mode` on `vp`, releasing the daemon handle on the last
/// one. A put on an invalid slot is a successful no-op.
pub fn handle_put(
    mount: &Mount,
    guard: &mut OpGuard<'_>,
    vp: &Vnode,
    cred: &Credentials,
    mode: HandleMode,
) -> OpResult<()> {
    let Some(handle) = vp.state().handles.use_dec(mode) else {
        return Ok(());
    };
    release_handle(mount, guard, vp, cred, handle, mode)
}

/// Zero a slot's use count and release it. Used by inactive and reclaim,
/// where lingering mmap references keep counts above one.
pub fn handle_release_slot(
    mount: &Mount,
    guard: &mut OpGuard<'_>,
    vp: &Vnode,
    cred: &Credentials,
    mode: HandleMode,
) -> OpResult<()> {
    let Some(handle) = vp.state().handles.reset(mode) else {
        return Ok(());
    };
    release_handle(mount, guard, vp, cred, handle, mode)
}

fn release_handle(
    mount: &Mount,
    guard: &mut OpGuard<'_>,
    vp: &Vnode,
    cred: &Credentials,
    handle: FileHandle,
    mode: HandleMode,
) -> OpResult<()> {
    mount.stats.fh_current.drop_one();
    if mount.is_dead() {
        // Dead filesystems get no RPCs; the daemon side is gone anyway.
        return Ok(());
    }
    let is_dir = vp.vtype == VnodeType::Directory;
    let body = if is_dir {
        Request::Releasedir {
            fh: handle.fh,
            flags: handle.flags,
        }
    } else {
        Request::Release {
            fh: handle.fh,
            flags: handle.flags,
        }
    };
    let mut ticket = Ticket::new(mount);
    let result = ticket.dispatch_and_wait(guard, vp.id, cred, body);
    if let Err(err) = result {
        debug!(node = vp.id.0, ?mode, ?err, "release failed");
        return Err(err);
    }
    Ok(())
}

/// Fire-and-forget release used where no caller can wait (create
/// compensation, reclaim of a racing duplicate).
pub(crate) fn send_release(
    mount: &Mount,
    nodeid: crate::node::NodeId,
    fh: u64,
    flags: i32,
    is_dir: bool,
) {
    let body = if is_dir {
        Request::Releasedir { fh, flags }
    } else {
        Request::Release { fh, flags }
    };
    mount.send_and_forget(nodeid, body);
}

/// Ask the host authorization layer whether `mode` access would be granted,
/// before paying for an OPEN that would be immediately undone. Only regular
/// files on synchronous, non-auth-opaque mounts are worth preflighting.
pub fn preflight(
    mount: &Mount,
    guard: &mut OpGuard<'_>,
    vp: &Vnode,
    cred: &Credentials,
    mode: HandleMode,
) -> OpResult<()> {
    if vp.vtype != VnodeType::Regular {
        return Ok(());
    }
    let action = crate::host::AuthAction {
        read: mode.reads(),
        write: mode.writes(),
    };
    guard.suspend(|| mount.host().authorize(vp.id, action, cred))
}
