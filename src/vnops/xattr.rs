//! Extended-attribute ops: getxattr, setxattr, listxattr, removexattr.
//!
//! All four share the same gauntlet: empty names are invalid, the reserved
//! host namespace is off-limits when the mount opts out of it, auto-xattr
//! mounts and downgraded capabilities short-circuit without a round trip.
//! Size-only probes send `size = 0`; a probe whose reply is known to be
//! oversized marks its ticket killed so the body dies in the transport.

use std::ffi::OsStr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::instrument;

use crate::biglock::OpGuard;
use crate::errno::{Errno, OpResult};
use crate::host::{Credentials, Uio};
use crate::mount::{MountOptions, HOST_XATTR_PREFIX};
use crate::node::{NodeFlags, Vnode};
use crate::proto::{Opcode, Request, REASONABLE_XATTR_SIZE};
use crate::ticket::Ticket;

use super::Dispatch;

impl Dispatch {
    /// Common entry checks. Returns `ENOTSUP` for paths that must not reach
    /// the daemon at all.
    fn xattr_prologue(
        &self,
        vp: &Arc<Vnode>,
        name: Option<&OsStr>,
        op: Opcode,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount();
        self.dead_check(vp)?;
        self.blanket_check(cred, Errno::ENOENT)?;

        if let Some(name) = name {
            if name.is_empty() {
                return Err(Errno::EINVAL);
            }
            if mount.has_option(MountOptions::NO_HOST_XATTR)
                && name
                    .as_encoded_bytes()
                    .starts_with(HOST_XATTR_PREFIX.as_bytes())
            {
                return Err(Errno::EPERM);
            }
        }
        if mount.has_option(MountOptions::AUTO_XATTR) {
            return Err(Errno::ENOTSUP);
        }
        if !mount.caps.implemented(op) {
            return Err(Errno::ENOTSUP);
        }
        Ok(())
    }

    /// getxattr: with a sink, fill it (or fail `ERANGE`); without one,
    /// report the value's size.
    #[instrument(name = "vnop::getxattr", skip(self, guard, vp, name, uio, cred), fields(node = vp.id.0, ?name))]
    pub fn getxattr(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        name: &OsStr,
        uio: Option<&mut Uio>,
        position: u32,
        cred: &Credentials,
    ) -> OpResult<usize> {
        let mount = self.mount().clone();
        self.xattr_prologue(vp, Some(name), Opcode::Getxattr, cred)?;

        let size = uio.as_ref().map_or(0, |u| u.resid() as u32);

        let mut ticket = Ticket::new(&mount);
        if size > REASONABLE_XATTR_SIZE {
            // We already know we will not copy a body this large.
            ticket.kill();
        }
        let sent = ticket.dispatch_and_wait(
            guard,
            vp.id,
            cred,
            Request::Getxattr {
                name: name.to_os_string(),
                size,
                position,
            },
        );
        if let Err(err) = sent {
            return Err(self.xattr_error(vp, guard, Opcode::Getxattr, err));
        }

        match uio {
            Some(uio) => {
                let data = ticket.reply()?.data()?.clone();
                drop(ticket);
                if data.len() > uio.resid() {
                    return Err(Errno::ERANGE);
                }
                let len = data.len();
                guard.suspend(|| uio.move_in(&data));
                Ok(len)
            }
            None => Ok(ticket.reply()?.xattr_size()?.size as usize),
        }
    }

    /// setxattr: value travels inline in the request.
    #[instrument(name = "vnop::setxattr", skip(self, guard, vp, name, uio, cred), fields(node = vp.id.0, ?name))]
    pub fn setxattr(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        name: &OsStr,
        uio: &mut Uio,
        options: i32,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.xattr_prologue(vp, Some(name), Opcode::Setxattr, cred)?;

        let attrsize = uio.resid();
        if attrsize > mount.user_buffer_max() as usize {
            return Err(Errno::E2BIG);
        }
        let position = uio.offset() as u32;
        let mark = uio.mark();

        let value = guard.suspend(|| Bytes::from(uio.move_out(attrsize)));

        let mut ticket = Ticket::new(&mount);
        if attrsize > REASONABLE_XATTR_SIZE as usize {
            ticket.kill();
        }
        let sent = ticket.dispatch_and_wait(
            guard,
            vp.id,
            cred,
            Request::Setxattr {
                name: name.to_os_string(),
                value,
                flags: options,
                position,
            },
        );

        match sent {
            Ok(()) => {
                drop(ticket);
                vp.invalidate_attrs();
                vp.state().flags.insert(NodeFlags::TIMES_DIRTY);
                Ok(())
            }
            Err(err) if err.is_enosys() || err == Errno::ENOTSUP => {
                if err.is_enosys() {
                    mount.caps.downgrade(Opcode::Setxattr);
                }
                // Hand the untouched payload back for the host's fallback.
                uio.restore(mark);
                Err(Errno::ENOTSUP)
            }
            Err(err) => Err(self.xattr_error(vp, guard, Opcode::Setxattr, err)),
        }
    }

    /// listxattr: same two shapes as getxattr, minus the name.
    #[instrument(name = "vnop::listxattr", skip(self, guard, vp, uio, cred), fields(node = vp.id.0))]
    pub fn listxattr(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        uio: Option<&mut Uio>,
        cred: &Credentials,
    ) -> OpResult<usize> {
        let mount = self.mount().clone();
        self.xattr_prologue(vp, None, Opcode::Listxattr, cred)?;

        let size = uio.as_ref().map_or(0, |u| u.resid() as u32);

        let mut ticket = Ticket::new(&mount);
        if size > REASONABLE_XATTR_SIZE {
            ticket.kill();
        }
        let sent = ticket.dispatch_and_wait(guard, vp.id, cred, Request::Listxattr { size });
        if let Err(err) = sent {
            return Err(self.xattr_error(vp, guard, Opcode::Listxattr, err));
        }

        match uio {
            Some(uio) => {
                let data = ticket.reply()?.data()?.clone();
                drop(ticket);
                if data.len() > uio.resid() {
                    return Err(Errno::ERANGE);
                }
                let len = data.len();
                guard.suspend(|| uio.move_in(&data));
                Ok(len)
            }
            None => Ok(ticket.reply()?.xattr_size()?.size as usize),
        }
    }

    /// removexattr.
    #[instrument(name = "vnop::removexattr", skip(self, guard, vp, name, cred), fields(node = vp.id.0, ?name))]
    pub fn removexattr(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        name: &OsStr,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.xattr_prologue(vp, Some(name), Opcode::Removexattr, cred)?;

        let mut ticket = Ticket::new(&mount);
        let sent = ticket.dispatch_and_wait(
            guard,
            vp.id,
            cred,
            Request::Removexattr {
                name: name.to_os_string(),
            },
        );
        match sent {
            Ok(()) => {
                drop(ticket);
                vp.invalidate_attrs();
                vp.state().flags.insert(NodeFlags::TIMES_DIRTY);
                Ok(())
            }
            Err(err) => Err(self.xattr_error(vp, guard, Opcode::Removexattr, err)),
        }
    }

    /// Shared error policy: ENOSYS downgrades the capability and surfaces as
    /// ENOTSUP; ENOENT purges the name cache on its way out.
    fn xattr_error(
        &self,
        vp: &Arc<Vnode>,
        guard: &mut OpGuard<'_>,
        op: Opcode,
        err: Errno,
    ) -> Errno {
        let mount = self.mount();
        if err.is_enosys() {
            mount.caps.downgrade(op);
            return Errno::ENOTSUP;
        }
        if err == Errno::ENOENT {
            guard.suspend(|| mount.namecache.purge(vp));
        }
        err
    }
}
