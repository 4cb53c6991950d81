//! Data-path ops: read, write, strategy, the block translations, and the
//! pager entry points.
//!
//! Reads and writes have two personalities. Buffered I/O delegates to the
//! host cluster layer against the cached file size. Direct I/O loops over
//! READ/WRITE round trips in chunks bounded by the negotiated I/O size,
//! falling back from a missing single-mode handle to the read-write one.

use std::sync::Arc;

use bytes::Bytes;
use tracing::instrument;

use crate::biglock::OpGuard;
use crate::errno::{Errno, OpResult};
use crate::filehandle::HandleMode;
use crate::host::{Buf, BufKind, Credentials, IoFlags, PageList, PageListFlags, Uio};
use crate::mount::MountOptions;
use crate::node::{Vnode, VnodeType};
use crate::proto::Request;
use crate::ticket::Ticket;

use super::Dispatch;

/// Block-number mapping produced by blockmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapping {
    pub bpn: u64,
    pub run: usize,
    pub poff: u32,
}

/// First valid handle among `order`, if any.
fn pick_handle(vp: &Vnode, order: &[HandleMode]) -> Option<u64> {
    let state = vp.state();
    order
        .iter()
        .find(|m| state.handles.is_valid(**m))
        .and_then(|m| state.handles.slot(*m).map(|h| h.fh))
}

impl Dispatch {
    #[instrument(name = "vnop::read", skip(self, guard, vp, uio, cred), fields(node = vp.id.0))]
    pub fn read(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        uio: &mut Uio,
        ioflags: IoFlags,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        if mount.is_dead() {
            return if vp.vtype == VnodeType::CharDevice {
                Ok(())
            } else {
                Err(Errno::ENXIO)
            };
        }
        if vp.vtype != VnodeType::Regular {
            return if vp.vtype == VnodeType::Directory {
                Err(Errno::EISDIR)
            } else {
                Err(Errno::EPERM)
            };
        }
        if uio.resid() == 0 {
            return Ok(());
        }
        if uio.offset() < 0 {
            return Err(Errno::EINVAL);
        }

        if vp.is_directio(mount.has_option(MountOptions::DIRECT_IO)) {
            let Some(fh) = pick_handle(vp, &[HandleMode::ReadOnly, HandleMode::ReadWrite]) else {
                return Err(Errno::EIO);
            };
            let iosize = mount.iosize() as usize;
            while uio.resid() > 0 {
                let want = uio.resid().min(iosize) as u32;
                let mut ticket = Ticket::new(&mount);
                ticket.dispatch_and_wait(
                    guard,
                    vp.id,
                    cred,
                    Request::Read {
                        fh,
                        offset: uio.offset() as u64,
                        size: want,
                    },
                )?;
                let data = ticket.reply()?.data()?.clone();
                drop(ticket);

                let got = data.len();
                guard.suspend(|| uio.move_in(&data));
                if got < want as usize {
                    break;
                }
            }
            return Ok(());
        }

        let filesize = vp.state().filesize;
        guard.suspend(|| {
            mount
                .host()
                .cluster()
                .read(vp.ubc.as_ref(), uio, filesize, ioflags)
        })
    }

    #[instrument(name = "vnop::write", skip(self, guard, vp, uio, cred), fields(node = vp.id.0))]
    pub fn write(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        uio: &mut Uio,
        ioflags: IoFlags,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.dead_check(vp)?;
        match vp.vtype {
            VnodeType::Regular => {}
            VnodeType::Directory => return Err(Errno::EISDIR),
            _ => return Err(Errno::EPERM),
        }
        if uio.resid() == 0 {
            return Ok(());
        }
        if uio.offset() < 0 {
            return Err(Errno::EINVAL);
        }

        if vp.is_directio(mount.has_option(MountOptions::DIRECT_IO)) {
            self.write_direct(guard, vp, uio, ioflags, cred)
        } else {
            self.write_buffered(guard, vp, uio, ioflags)
        }
    }

    fn write_direct(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        uio: &mut Uio,
        ioflags: IoFlags,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        let Some(fh) = pick_handle(vp, &[HandleMode::WriteOnly, HandleMode::ReadWrite]) else {
            return Err(Errno::EIO);
        };

        let iosize = mount.iosize() as usize;
        let mark = uio.mark();
        let unit_restore = |uio: &mut Uio| {
            if ioflags.contains(IoFlags::UNIT) {
                uio.restore(mark);
            }
        };

        while uio.resid() > 0 {
            let chunk = uio.resid().min(iosize);
            let offset = uio.offset() as u64;
            let data = guard.suspend(|| Bytes::from(uio.move_out(chunk)));

            let mut ticket = Ticket::new(&mount);
            if let Err(err) =
                ticket.dispatch_and_wait(guard, vp.id, cred, Request::Write { fh, offset, data })
            {
                unit_restore(uio);
                return Err(err);
            }
            let wrote = ticket.reply()?.write()?.size as usize;
            drop(ticket);

            if wrote > chunk || wrote == 0 {
                unit_restore(uio);
                return Err(if wrote == 0 { Errno::EIO } else { Errno::EINVAL });
            }
            let short = chunk - wrote;
            if short > 0 {
                uio.rewind(short);
            }
        }

        vp.invalidate_attrs();
        Ok(())
    }

    fn write_buffered(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        uio: &mut Uio,
        ioflags: IoFlags,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        let original_resid = uio.resid();
        let original_size = vp.state().filesize;

        if ioflags.contains(IoFlags::APPEND) {
            uio.set_offset(original_size as i64);
        }
        if uio.offset() < 0 {
            // An append rebase past the signed range has nowhere to go.
            return Err(Errno::EFBIG);
        }
        let offset = uio.offset() as u64;

        let new_eof = (offset + original_resid as u64).max(original_size);
        if new_eof > original_size {
            vp.state().filesize = new_eof;
        }

        let mut lflag = ioflags & (IoFlags::SYNC | IoFlags::NOCACHE);
        let zero_from = if offset > original_size {
            lflag |= IoFlags::HEADZEROFILL;
            original_size
        } else {
            0
        };

        let mark = uio.mark();
        let result = guard.suspend(|| {
            mount.host().cluster().write(
                vp.ubc.as_ref(),
                uio,
                original_size,
                new_eof,
                zero_from,
                lflag,
            )
        });

        match result {
            Ok(()) => {
                let end = uio.offset() as u64;
                let mut state = vp.state();
                if end > original_size {
                    state.filesize = end;
                    drop(state);
                    vp.ubc.set_size(end);
                } else {
                    state.filesize = original_size;
                    drop(state);
                }
                vp.invalidate_attrs();
                Ok(())
            }
            Err(err) => {
                vp.state().filesize = original_size;
                if ioflags.contains(IoFlags::UNIT) {
                    uio.restore(mark);
                    Err(err)
                } else if uio.resid() != original_resid {
                    // Partial progress counts when unit semantics are off.
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// strategy: a dead filesystem errors the buffer synchronously; anything
    /// else turns the buffer into READ/WRITE round trips.
    #[instrument(name = "vnop::strategy", skip(self, guard, vp, buf, cred), fields(node = vp.id.0))]
    pub fn strategy(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        buf: &mut Buf,
        cred: &Credentials,
    ) -> OpResult<()> {
        if self.mount().is_dead() {
            buf.set_error(Errno::EIO);
            buf.biodone();
            return Err(Errno::ENXIO);
        }
        let result = self.strategy_io(guard, vp, buf, cred);
        if let Err(err) = result {
            buf.set_error(err);
        }
        buf.biodone();
        result
    }

    fn strategy_io(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        buf: &mut Buf,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        let iosize = mount.iosize() as usize;
        let base = buf.lblkno * u64::from(mount.block_size());

        match buf.kind {
            BufKind::Read => {
                let Some(fh) = pick_handle(vp, &[HandleMode::ReadOnly, HandleMode::ReadWrite])
                else {
                    return Err(Errno::EIO);
                };
                let mut filled = 0;
                while filled < buf.data.len() {
                    let want = (buf.data.len() - filled).min(iosize) as u32;
                    let mut ticket = Ticket::new(&mount);
                    ticket.dispatch_and_wait(
                        guard,
                        vp.id,
                        cred,
                        Request::Read {
                            fh,
                            offset: base + filled as u64,
                            size: want,
                        },
                    )?;
                    let data = ticket.reply()?.data()?;
                    buf.data[filled..filled + data.len()].copy_from_slice(data);
                    let got = data.len();
                    drop(ticket);
                    filled += got;
                    if got < want as usize {
                        // Past EOF; the rest of the buffer stays zeroed.
                        break;
                    }
                }
                Ok(())
            }
            BufKind::Write => {
                let Some(fh) = pick_handle(vp, &[HandleMode::WriteOnly, HandleMode::ReadWrite])
                else {
                    return Err(Errno::EIO);
                };
                let mut sent = 0;
                while sent < buf.data.len() {
                    let chunk = (buf.data.len() - sent).min(iosize);
                    let data = Bytes::copy_from_slice(&buf.data[sent..sent + chunk]);
                    let mut ticket = Ticket::new(&mount);
                    ticket.dispatch_and_wait(
                        guard,
                        vp.id,
                        cred,
                        Request::Write {
                            fh,
                            offset: base + sent as u64,
                            data,
                        },
                    )?;
                    let wrote = ticket.reply()?.write()?.size as usize;
                    if wrote == 0 || wrote > chunk {
                        return Err(Errno::EIO);
                    }
                    sent += wrote;
                }
                Ok(())
            }
        }
    }

    /// blktooff: logical block to byte offset.
    pub fn blktooff(&self, vp: &Arc<Vnode>, lblkno: u64) -> OpResult<u64> {
        self.dead_check(vp)?;
        Ok(lblkno * u64::from(self.mount().block_size()))
    }

    /// offtoblk: byte offset to logical block.
    pub fn offtoblk(&self, vp: &Arc<Vnode>, offset: u64) -> OpResult<u64> {
        self.dead_check(vp)?;
        Ok(offset / u64::from(self.mount().block_size()))
    }

    /// blockmap: everything is contiguous up to the cached EOF.
    pub fn blockmap(
        &self,
        vp: &Arc<Vnode>,
        foffset: u64,
        size: usize,
    ) -> OpResult<BlockMapping> {
        self.dead_check(vp)?;
        if vp.vtype == VnodeType::Directory {
            return Err(Errno::ENOTSUP);
        }
        let bs = u64::from(self.mount().block_size());
        let bpn = foffset / bs;
        let filesize = vp.state().filesize;
        let contiguous = filesize.saturating_sub(bpn * bs).min(size as u64);
        Ok(BlockMapping {
            bpn,
            run: contiguous as usize,
            poff: 0,
        })
    }

    /// pagein: dead or direct-I/O vnodes abort the pages (pager error);
    /// everything else rides the cluster layer.
    #[instrument(name = "vnop::pagein", skip(self, guard, vp, pages), fields(node = vp.id.0))]
    pub fn pagein(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        pages: &mut PageList,
        f_offset: u64,
        size: usize,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        if mount.is_dead() || vp.is_directio(mount.has_option(MountOptions::DIRECT_IO)) {
            if !pages.flags.contains(PageListFlags::NOCOMMIT) {
                pages.abort();
            }
            return Err(Errno::ENOTSUP);
        }
        let filesize = vp.state().filesize;
        guard.suspend(|| {
            mount
                .host()
                .cluster()
                .pagein(vp.ubc.as_ref(), pages, f_offset, size, filesize)
        })
    }

    /// pageout: same gatekeeping as pagein.
    #[instrument(name = "vnop::pageout", skip(self, guard, vp, pages), fields(node = vp.id.0))]
    pub fn pageout(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        pages: &mut PageList,
        f_offset: u64,
        size: usize,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        if mount.is_dead() || vp.is_directio(mount.has_option(MountOptions::DIRECT_IO)) {
            if !pages.flags.contains(PageListFlags::NOCOMMIT) {
                pages.abort();
            }
            return Err(Errno::ENOTSUP);
        }
        let filesize = vp.state().filesize;
        guard.suspend(|| {
            mount
                .host()
                .cluster()
                .pageout(vp.ubc.as_ref(), pages, f_offset, size, filesize)
        })
    }
}
