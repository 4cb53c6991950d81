//! The vnode-op dispatcher: one handler per host VFS entry point.
//!
//! Handlers share a prologue: dead mounts short-circuit, uninitialized
//! mounts admit only the daemon's owner and the superuser at the root, and
//! the blanket-denial policy runs before any RPC. Each handler then consults
//! the capability table and the caches, performs at most a handful of round
//! trips through the ticket helper, and translates the reply back into VFS
//! semantics. Every handler runs under the big mount lock its caller holds,
//! passed in as the [`OpGuard`].

mod attr;
mod dirops;
mod file;
mod io;
mod lookup;
mod reclaim;
mod xattr;

pub use dirops::{ReaddirFlags, RemoveFlags};
pub use file::PathconfName;
pub use io::BlockMapping;
pub use lookup::{LookupIntent, LookupStatus};

use std::sync::Arc;

use bitflags::bitflags;
use tracing::instrument;

use crate::biglock::OpGuard;
use crate::errno::{Errno, OpResult};
use crate::host::Credentials;
use crate::mount::Mount;
use crate::node::{Vnode, VnodeType};
use crate::proto::Attr;

bitflags! {
    /// Rights tested by the access entry point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// The handler table. One instance per mount; the host VFS routes each op
/// descriptor to the method of the same name. Descriptors with no method
/// here fall back to the host defaults (`allocate` and `revoke` are stubs,
/// everything else errors host-side).
pub struct Dispatch {
    mount: Arc<Mount>,
}

impl Dispatch {
    #[must_use]
    pub fn new(mount: Arc<Mount>) -> Self {
        Dispatch { mount }
    }

    #[must_use]
    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// Dead filesystems fail everything with device-gone.
    pub(crate) fn dead_check(&self, _vp: &Vnode) -> OpResult<()> {
        if self.mount.is_dead() {
            Err(Errno::ENXIO)
        } else {
            Ok(())
        }
    }

    /// Mount-wide credential gate, run before building any request.
    pub(crate) fn blanket_check(&self, cred: &Credentials, deny: Errno) -> OpResult<()> {
        if self.mount.blanket_denied(cred) {
            Err(deny)
        } else {
            Ok(())
        }
    }

    /// access: symlinks always permit, the dead root permits, everything
    /// else is evaluated against the daemon's attributes.
    #[instrument(name = "vnop::access", skip(self, guard, vp, cred), fields(node = vp.id.0))]
    pub fn access(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        action: AccessMode,
        cred: &Credentials,
    ) -> OpResult<()> {
        if self.mount.is_dead() {
            return if vp.is_root() { Ok(()) } else { Err(Errno::ENXIO) };
        }

        if !self.mount.is_inited() {
            if vp.is_root() && (cred.is_superuser() || self.mount.is_daemon(cred)) {
                return Ok(());
            }
            return Err(Errno::EBADF);
        }

        if vp.vtype == VnodeType::Symlink {
            return Ok(());
        }

        self.blanket_check(cred, Errno::EACCES)?;

        if action.contains(AccessMode::WRITE)
            && self
                .mount
                .has_option(crate::mount::MountOptions::READ_ONLY)
        {
            return Err(Errno::EROFS);
        }

        let attr = self.fetch_attrs(guard, vp, cred)?;
        evaluate_access(&attr, vp.vtype, cred, action)
    }

    /// select: a userspace filesystem is always ready.
    pub fn select(&self, _vp: &Arc<Vnode>) -> OpResult<i32> {
        Ok(1)
    }

    /// allocate: stub until a fallocate opcode exists.
    pub fn allocate(&self, _vp: &Arc<Vnode>) -> OpResult<()> {
        Ok(())
    }

    /// revoke: the host default does the work.
    pub fn revoke(&self, _vp: &Arc<Vnode>) -> OpResult<()> {
        Ok(())
    }

    /// Attributes for internal use: cache when fresh, one GETATTR otherwise.
    pub(crate) fn fetch_attrs(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        cred: &Credentials,
    ) -> OpResult<Attr> {
        if let Some(attr) = vp.state().attrs.load() {
            return Ok(*attr);
        }
        self.getattr_rpc(guard, vp, cred)
    }
}

/// Classic owner/group/other evaluation of the daemon-reported mode bits.
fn evaluate_access(
    attr: &Attr,
    vtype: VnodeType,
    cred: &Credentials,
    action: AccessMode,
) -> OpResult<()> {
    if cred.is_superuser() {
        // Root passes everything except executing a file with no x bit.
        if action.contains(AccessMode::EXECUTE)
            && vtype == VnodeType::Regular
            && attr.mode & 0o111 == 0
        {
            return Err(Errno::EACCES);
        }
        return Ok(());
    }

    let triplet = if cred.uid == attr.uid {
        (attr.mode >> 6) & 0o7
    } else if cred.gid == attr.gid {
        (attr.mode >> 3) & 0o7
    } else {
        attr.mode & 0o7
    };

    let mut need = 0;
    if action.contains(AccessMode::READ) {
        need |= 0o4;
    }
    if action.contains(AccessMode::WRITE) {
        need |= 0o2;
    }
    if action.contains(AccessMode::EXECUTE) {
        need |= 0o1;
    }

    if triplet & need == need {
        Ok(())
    } else {
        Err(Errno::EACCES)
    }
}
