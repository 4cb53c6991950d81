//! File-level ops: open, close, mmap, mnomap, fsync, ioctl, exchange, and
//! pathconf.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::biglock::OpGuard;
use crate::errno::{Errno, OpResult};
use crate::filehandle::{self, FFlags, HandleMode, MmapProt};
use crate::host::{Credentials, IoFlags};
use crate::mount::{is_double_name, MountOptions};
use crate::node::{NodeFlags, Vnode, VnodeType};
use crate::proto::{OpenReplyFlags, Opcode, Request, LINK_MAX, NAME_MAX, PATH_MAX};
use crate::ticket::Ticket;

use super::Dispatch;

/// ioctl direction bits and parameter-length field, host encoding.
const IOC_OUT: u64 = 0x4000_0000;
const IOC_IN: u64 = 0x8000_0000;
const IOCPARM_MASK: u64 = 0x1fff;

fn iocparm_len(cmd: u64) -> usize {
    ((cmd >> 16) & IOCPARM_MASK) as usize
}

/// Pathconf selectors the host may query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathconfName {
    LinkMax,
    NameMax,
    PathMax,
    PipeBuf,
    ChownRestricted,
    NoTrunc,
    NameCharsMax,
    CaseSensitive,
    CasePreserving,
    MaxCanon,
    MaxInput,
    Vdisable,
}

impl Dispatch {
    /// open: coalesce onto the slot for the fflags-derived mode, then act on
    /// the daemon's open-reply flags.
    #[instrument(name = "vnop::open", skip(self, guard, vp, cred), fields(node = vp.id.0))]
    pub fn open(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        fflags: FFlags,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.dead_check(vp)?;
        if vp.vtype == VnodeType::NamedPipe {
            return Err(Errno::EPERM);
        }
        self.blanket_check(cred, Errno::ENOENT)?;

        let mode = if vp.vtype == VnodeType::Directory {
            HandleMode::ReadOnly
        } else {
            HandleMode::from_fflags(fflags)
        };

        filehandle::handle_get(&mount, guard, vp, cred, mode)?;

        let reply_flags = vp
            .state()
            .handles
            .slot(mode)
            .map(|h| h.reply_flags)
            .unwrap_or(OpenReplyFlags::empty());

        if reply_flags.contains(OpenReplyFlags::DIRECT_IO)
            || vp.is_directio(mount.has_option(MountOptions::DIRECT_IO))
        {
            // Direct I/O shuts the page cache out of this vnode entirely,
            // and disables delayed writes for the whole mount.
            guard.suspend(|| vp.ubc.flush_and_invalidate());
            vp.ubc.set_nocache(true);
            vp.ubc.set_noreadahead(true);
            mount.clear_option(MountOptions::NO_SYNCWRITES);
            vp.state().flags.insert(NodeFlags::DIRECT_IO);
            return Ok(());
        }

        if reply_flags.contains(OpenReplyFlags::PURGE_UBC) {
            guard.suspend(|| vp.ubc.flush_and_invalidate());
            if let Some(h) = vp.state().handles.slot_mut(mode) {
                h.reply_flags.remove(OpenReplyFlags::PURGE_UBC);
            }
            if reply_flags.contains(OpenReplyFlags::PURGE_ATTR) {
                vp.invalidate_attrs();
                if let Ok(attr) = self.getattr_rpc(guard, vp, cred) {
                    vp.state().filesize = attr.size;
                    vp.ubc.set_size(attr.size);
                }
                if let Some(h) = vp.state().handles.slot_mut(mode) {
                    h.reply_flags.remove(OpenReplyFlags::PURGE_ATTR);
                }
            }
        }

        if mount.has_option(MountOptions::NO_READAHEAD) {
            vp.ubc.set_noreadahead(true);
        }
        Ok(())
    }

    /// close: flush what must not be lost, then drop one use of the slot.
    #[instrument(name = "vnop::close", skip(self, guard, vp, cred), fields(node = vp.id.0))]
    pub fn close(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        fflags: FFlags,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        if mount.is_dead() {
            return Ok(());
        }
        if fflags.contains(FFlags::NDELAY) {
            // Vnode cleaning closes with no-delay; reclaim will flush and
            // release instead.
            return Ok(());
        }

        let mode = if vp.vtype == VnodeType::Directory {
            HandleMode::ReadOnly
        } else {
            HandleMode::from_fflags(fflags)
        };

        let fh = match vp.state().handles.slot(mode).filter(|h| h.open_count > 0) {
            Some(h) => h.fh,
            None => {
                warn!(node = vp.id.0, ?mode, "close on invalid handle slot");
                return Ok(());
            }
        };

        let mut err = Ok(());
        if vp.vtype != VnodeType::Directory {
            // Sync-on-close keeps writable descriptors honest: data written
            // through an O_RDWR handle on an unwritable file must land
            // before the last close.
            if vp.ubc.has_dirty() && !mount.has_option(MountOptions::NO_SYNCONCLOSE) {
                guard.suspend(|| vp.ubc.push_dirty(IoFlags::SYNC | IoFlags::CLOSE));
            }

            if mount.caps.implemented(Opcode::Flush) {
                let mut ticket = Ticket::new(&mount);
                match ticket.dispatch_and_wait(guard, vp.id, cred, Request::Flush { fh }) {
                    Ok(()) => {}
                    Err(e) if e.is_enosys() => {
                        mount.caps.downgrade(Opcode::Flush);
                    }
                    Err(e) => err = Err(e),
                }
            }
        }

        filehandle::handle_put(&mount, guard, vp, cred, mode)?;
        err
    }

    /// mmap: obtain a handle matching the mapping's protections, preflighting
    /// through host authorization to avoid an open that is immediately
    /// undone, and falling back to read-only once when a writable open is
    /// denied.
    #[instrument(name = "vnop::mmap", skip(self, guard, vp, cred), fields(node = vp.id.0))]
    pub fn mmap(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        prot: MmapProt,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.dead_check(vp)?;
        if vp.is_directio(mount.has_option(MountOptions::DIRECT_IO)) {
            return Err(Errno::EPERM);
        }
        self.blanket_check(cred, Errno::ENOENT)?;

        let Some(mut mode) = HandleMode::from_mmap_prot(prot) else {
            return Ok(());
        };

        let mut deleted = false;
        let mut retried = false;
        loop {
            {
                let mut state = vp.state();
                if state.handles.is_valid(mode) {
                    state.handles.use_inc(mode);
                    mount.stats.fh_reuse.bump();
                    return Ok(());
                }
            }

            let mut err = Ok(());
            if !deleted {
                match filehandle::preflight(&mount, guard, vp, cred, mode) {
                    Ok(()) => {}
                    Err(Errno::ENOENT) => {
                        // Mapped after unlink; the daemon will still honor
                        // the open against the live handle.
                        deleted = true;
                    }
                    Err(e) => err = Err(e),
                }
            }
            if err.is_ok() {
                err = filehandle::handle_get(&mount, guard, vp, cred, mode);
            }

            match err {
                Ok(()) => return Ok(()),
                Err(Errno::EACCES) if !retried && mode.writes() => {
                    // The host gives no MAP_SHARED hint; retry read-only so
                    // shared-library mappings still work.
                    debug!(node = vp.id.0, "mmap open denied, retrying read-only");
                    mode = HandleMode::ReadOnly;
                    retried = true;
                }
                Err(e) => {
                    warn!(node = vp.id.0, ?e, "mmap failed to obtain handle");
                    return Err(Errno::EPERM);
                }
            }
        }
    }

    /// mnomap: handle cleanup happens at inactive/reclaim.
    pub fn mnomap(&self, vp: &Arc<Vnode>) -> OpResult<()> {
        if self.mount().is_dead() {
            return Ok(());
        }
        if vp.is_directio(self.mount().has_option(MountOptions::DIRECT_IO)) {
            return Err(Errno::ENODEV);
        }
        Ok(())
    }

    /// fsync: push the page cache, then FSYNC every valid handle.
    #[instrument(name = "vnop::fsync", skip(self, guard, vp, cred), fields(node = vp.id.0))]
    pub fn fsync(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        if mount.is_dead() {
            return Ok(());
        }

        guard.suspend(|| vp.ubc.push_dirty(IoFlags::empty()));

        let is_dir = vp.vtype == VnodeType::Directory;
        let op = if is_dir { Opcode::Fsyncdir } else { Opcode::Fsync };

        let mut err = Ok(());
        if !mount.caps.implemented(op) {
            err = Err(Errno::ENOSYS);
        } else {
            let modes = vp.state().handles.valid_modes();
            for mode in modes {
                let Some(fh) = vp.state().handles.slot(mode).map(|h| h.fh) else {
                    continue;
                };
                let body = if is_dir {
                    Request::Fsyncdir { fh, datasync: false }
                } else {
                    Request::Fsync { fh, datasync: false }
                };
                let mut ticket = Ticket::new(&mount);
                if let Err(e) = ticket.dispatch_and_wait(guard, vp.id, cred, body) {
                    err = Err(e);
                }
            }
        }

        match err {
            Err(e) if e.is_enosys() => {
                mount.caps.downgrade(op);
                if mount.has_option(MountOptions::NO_SYNCWRITES) {
                    Err(Errno::ENOTSUP)
                } else {
                    // Nothing was lost; writes are synchronous anyway.
                    Ok(())
                }
            }
            other => other,
        }
    }

    /// ioctl: pass the parameter block through, honoring the direction bits.
    #[instrument(name = "vnop::ioctl", skip(self, guard, vp, data, cred), fields(node = vp.id.0))]
    pub fn ioctl(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        cmd: u64,
        data: &mut [u8],
        fflags: FFlags,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.dead_check(vp)?;
        self.blanket_check(cred, Errno::EPERM)?;

        if !mount.caps.implemented(Opcode::Ioctl) {
            return Err(Errno::ENOTSUP);
        }

        let mode = HandleMode::from_fflags(fflags);
        let Some(fh) = vp
            .state()
            .handles
            .slot(mode)
            .filter(|h| h.open_count > 0)
            .map(|h| h.fh)
        else {
            return Err(Errno::EIO);
        };

        let len = iocparm_len(cmd).min(data.len());
        let in_data = if cmd & IOC_IN != 0 {
            Bytes::copy_from_slice(&data[..len])
        } else {
            Bytes::new()
        };
        let out_size = if cmd & IOC_OUT != 0 { len as u32 } else { 0 };

        let mut ticket = Ticket::new(&mount);
        match ticket.dispatch_and_wait(
            guard,
            vp.id,
            cred,
            Request::Ioctl { fh, cmd, in_data, out_size },
        ) {
            Ok(()) => {
                if cmd & IOC_OUT != 0 {
                    let out = ticket.reply()?.ioctl_out()?;
                    if out.len() != len {
                        return Err(Errno::EIO);
                    }
                    data[..len].copy_from_slice(out);
                }
                Ok(())
            }
            Err(e) if e.is_enosys() => {
                mount.caps.downgrade(Opcode::Ioctl);
                Err(Errno::ENOTSUP)
            }
            Err(e) => Err(e),
        }
    }

    /// exchange: atomically swap the data forks of two regular files.
    #[instrument(name = "vnop::exchange", skip(self, guard, fvp, tvp, cred))]
    pub fn exchange(
        &self,
        guard: &mut OpGuard<'_>,
        fvp: &Arc<Vnode>,
        tvp: &Arc<Vnode>,
        options: u64,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();

        if !mount.caps.implemented(Opcode::Exchange) {
            return Err(Errno::ENOTSUP);
        }
        if mount.has_option(MountOptions::NO_NAMECACHE) {
            return Err(Errno::ENOTSUP);
        }
        if Arc::ptr_eq(fvp, tvp) {
            return Err(Errno::EINVAL);
        }
        if fvp.vtype != VnodeType::Regular || tvp.vtype != VnodeType::Regular {
            return Err(Errno::EINVAL);
        }
        self.dead_check(fvp)?;

        let (from_dir, from) = {
            let state = fvp.state();
            (state.parent_id, state.name.clone())
        };
        let (to_dir, to) = {
            let state = tvp.state();
            (state.parent_id, state.name.clone())
        };
        if from.is_empty() || to.is_empty() {
            return Err(Errno::EIO);
        }
        // Double files are metadata shadows; swapping either side corrupts
        // the pairing.
        if is_double_name(&from) || is_double_name(&to) {
            return Err(Errno::EINVAL);
        }

        let mut ticket = Ticket::new(&mount);
        match ticket.dispatch_and_wait(
            guard,
            fvp.id,
            cred,
            Request::Exchange { from_dir, from, to_dir, to, options },
        ) {
            Ok(()) => {}
            Err(e) if e.is_enosys() => {
                mount.caps.downgrade(Opcode::Exchange);
                return Err(Errno::ENOTSUP);
            }
            Err(e) => return Err(e),
        }

        guard.suspend(|| {
            mount.namecache.purge(fvp);
            mount.namecache.purge(tvp);
        });
        fvp.invalidate_attrs();
        tvp.invalidate_attrs();
        for dir in [from_dir, to_dir] {
            if let Some(dvp) = mount.node_by_id(dir) {
                dvp.invalidate_attrs();
            }
        }
        Ok(())
    }

    /// pathconf: protocol maxima and fixed host answers; terminal-device
    /// queries have no meaning here.
    pub fn pathconf(
        &self,
        vp: &Arc<Vnode>,
        name: PathconfName,
        cred: &Credentials,
    ) -> OpResult<i64> {
        self.dead_check(vp)?;
        self.blanket_check(cred, Errno::ENOENT)?;

        match name {
            PathconfName::LinkMax => Ok(i64::from(LINK_MAX)),
            PathconfName::NameMax => Ok(NAME_MAX as i64),
            PathconfName::PathMax => Ok(PATH_MAX),
            PathconfName::PipeBuf => Ok(512),
            PathconfName::ChownRestricted => Ok(1),
            PathconfName::NoTrunc => Ok(0),
            PathconfName::NameCharsMax => Ok(255),
            PathconfName::CaseSensitive | PathconfName::CasePreserving => Ok(1),
            PathconfName::MaxCanon | PathconfName::MaxInput | PathconfName::Vdisable => {
                Err(Errno::EINVAL)
            }
        }
    }
}
