//! getattr and setattr.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, instrument};

use crate::biglock::OpGuard;
use crate::errno::{Errno, OpResult};
use crate::host::Credentials;
use crate::node::{Vnode, VnodeType};
use crate::proto::{Attr, Request, SetattrIn};
use crate::ticket::Ticket;

use super::Dispatch;

impl Dispatch {
    /// getattr: cache hit answers locally; a miss costs one GETATTR. The
    /// root of a dead or never-connected mount fabricates a stat so unmount
    /// tooling can still walk to it.
    #[instrument(name = "vnop::getattr", skip(self, guard, vp, cred), fields(node = vp.id.0))]
    pub fn getattr(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        cred: &Credentials,
    ) -> OpResult<Attr> {
        let mount = self.mount().clone();

        if mount.is_dead() {
            if vp.is_root() {
                return Ok(self.fabricated_attr(vp));
            }
            return Err(Errno::ENXIO);
        }

        if !(vp.is_root() && cred.is_superuser()) {
            self.blanket_check(cred, Errno::ENOENT)?;
        }

        if let Some(attr) = vp.state().attrs.load() {
            return Ok(*attr);
        }

        if !mount.is_inited() {
            if vp.is_root() {
                return Ok(self.fabricated_attr(vp));
            }
            // A stat that beats the handshake means the daemon is wedged.
            mount.mark_dead();
            return Err(Errno::ENOTCONN);
        }

        match self.getattr_rpc(guard, vp, cred) {
            Ok(attr) => Ok(attr),
            Err(Errno::ENOTCONN) if vp.is_root() => Ok(self.fabricated_attr(vp)),
            Err(err) => Err(err),
        }
    }

    /// setattr: every dirty field rides one SETATTR. A type change observed
    /// in the reply ditches the stale vnode and asks the host to try again.
    #[instrument(name = "vnop::setattr", skip(self, guard, vp, sa, cred), fields(node = vp.id.0))]
    pub fn setattr(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        sa: &SetattrIn,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.dead_check(vp)?;
        self.blanket_check(cred, Errno::ENOENT)?;

        if sa.is_empty() {
            return Ok(());
        }

        let new_size = sa.size;
        if new_size.is_some() && vp.vtype == VnodeType::Directory {
            return Err(Errno::EISDIR);
        }
        if mount.has_option(crate::mount::MountOptions::READ_ONLY)
            && (sa.touches_metadata() || vp.vtype == VnodeType::Regular)
        {
            return Err(Errno::EROFS);
        }

        let mut ticket = Ticket::new(&mount);
        if let Err(err) = ticket.dispatch_and_wait(guard, vp.id, cred, Request::Setattr(*sa)) {
            vp.invalidate_attrs();
            return Err(err);
        }
        let out = *ticket.reply()?.attr()?;

        match out.attr.vnode_type() {
            None => return Err(Errno::EIO),
            Some(vtype) if vtype != vp.vtype => {
                debug!(node = vp.id.0, ?vtype, "type changed during setattr");
                guard.suspend(|| mount.namecache.purge(vp));
                return Err(Errno::EAGAIN);
            }
            Some(_) => {}
        }

        if let Some(size) = new_size {
            // The daemon has truncated or extended; our cached view follows.
            vp.invalidate_attrs();
            vp.state().filesize = size;
            vp.ubc.set_size(size);
        } else {
            mount.cache_attrs(vp, &out.attr, out.attr_valid);
        }
        Ok(())
    }

    /// One GETATTR round trip, with cache refresh, the direct-I/O size
    /// catch-up, and staleness detection.
    pub(crate) fn getattr_rpc(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        cred: &Credentials,
    ) -> OpResult<Attr> {
        let mount = self.mount().clone();
        let mut ticket = Ticket::new(&mount);
        if let Err(err) = ticket.dispatch_and_wait(guard, vp.id, cred, Request::Getattr) {
            if err == Errno::ENOENT {
                // The daemon no longer knows the node; stale names go too.
                guard.suspend(|| mount.namecache.purge(vp));
            }
            return Err(err);
        }
        let out = *ticket.reply()?.attr()?;
        drop(ticket);

        let Some(vtype) = out.attr.vnode_type() else {
            return Err(Errno::EIO);
        };
        mount.cache_attrs(vp, &out.attr, out.attr_valid);

        if vtype != vp.vtype {
            // The inode changed type behind our back; ditch the vnode.
            debug!(node = vp.id.0, cached = ?vp.vtype, returned = ?vtype, "stale vnode");
            guard.suspend(|| mount.namecache.purge(vp));
            return Err(Errno::EIO);
        }
        Ok(out.attr)
    }

    fn fabricated_attr(&self, vp: &Vnode) -> Attr {
        let daemon = self.mount().daemon_credentials();
        Attr {
            ino: vp.id.0,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            mode: vtype_bits(vp.vtype) | 0o700,
            nlink: 1,
            uid: daemon.uid,
            gid: daemon.gid,
            rdev: 0,
        }
    }
}

fn vtype_bits(vtype: VnodeType) -> u32 {
    (match vtype {
        VnodeType::Regular => libc::S_IFREG,
        VnodeType::Directory => libc::S_IFDIR,
        VnodeType::Symlink => libc::S_IFLNK,
        VnodeType::CharDevice => libc::S_IFCHR,
        VnodeType::BlockDevice => libc::S_IFBLK,
        VnodeType::NamedPipe => libc::S_IFIFO,
        VnodeType::Socket => libc::S_IFSOCK,
    }) as u32
}
