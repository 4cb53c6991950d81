//! Namespace mutations and directory reads: create, mkdir, mknod, symlink,
//! link, remove, rmdir, rename, readdir, readlink.

use std::ffi::OsStr;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, instrument};

use crate::biglock::OpGuard;
use crate::errno::{Errno, OpResult};
use crate::filehandle::{self, HandleMode};
use crate::host::{Credentials, Uio};
use crate::mount::{is_double_name, MountOptions};
use crate::node::{Vnode, VnodeType, ROOT_ID};
use crate::proto::{Dirent, EntryOut, Opcode, Request, LINK_MAX};
use crate::ticket::{simple_put_get, Ticket};

use super::Dispatch;

bitflags! {
    /// Host flags on the remove entry point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RemoveFlags: u32 {
        /// Fail with `EBUSY` instead of deleting a file that is in use.
        const NODELETEBUSY = 1 << 0;
    }
}

bitflags! {
    /// Host flags on the readdir entry point. Neither variant is supported;
    /// plain dirents only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReaddirFlags: u32 {
        /// Entries must carry seek-offset cookies.
        const REQUIRE_SEEK_OFF = 1 << 0;
        /// Extended dirent format.
        const EXTENDED         = 1 << 1;
    }
}

/// Validate an entry reply against the type the caller expects.
fn check_entry(entry: &EntryOut, expected: VnodeType) -> OpResult<()> {
    if entry.nodeid == ROOT_ID {
        return Err(Errno::EINVAL);
    }
    match entry.attr.vnode_type() {
        None => Err(Errno::EIO),
        Some(vtype) if vtype != expected => Err(Errno::EINVAL),
        Some(_) => Ok(()),
    }
}

impl Dispatch {
    /// create: one CREATE round trip when the daemon has it, with the handle
    /// installed read-write for the impending open; MKNOD otherwise.
    #[instrument(
        name = "vnop::create",
        skip(self, guard, dvp, name, cred),
        fields(parent = dvp.id.0, ?name)
    )]
    pub fn create(
        &self,
        guard: &mut OpGuard<'_>,
        dvp: &Arc<Vnode>,
        name: &OsStr,
        mode: u32,
        vtype: VnodeType,
        cred: &Credentials,
    ) -> OpResult<Arc<Vnode>> {
        let mount = self.mount().clone();
        self.dead_check(dvp)?;
        self.blanket_check(cred, Errno::EPERM)?;
        if mount.has_option(MountOptions::NO_DOUBLE_FILES) && is_double_name(name) {
            return Err(Errno::EPERM);
        }

        if mount.caps.implemented(Opcode::Create) && vtype == VnodeType::Regular {
            let mut ticket = Ticket::new(&mount);
            let sent = ticket.dispatch_and_wait(
                guard,
                dvp.id,
                cred,
                Request::Create {
                    name: name.to_os_string(),
                    mode,
                    // Created exactly the way the host will open it next.
                    flags: libc::O_CREAT | libc::O_RDWR,
                },
            );
            match sent {
                Err(err) if err.is_enosys() => {
                    mount.caps.downgrade(Opcode::Create);
                    debug!(parent = dvp.id.0, "daemon lacks atomic create, using mknod");
                }
                Err(err) => return Err(err),
                Ok(()) => {
                    let (entry, open) = {
                        let (e, o) = ticket.reply()?.created()?;
                        (*e, *o)
                    };
                    drop(ticket);
                    check_entry(&entry, VnodeType::Regular)?;

                    let vp = match mount.vget(&entry, Some(dvp), Some(name)) {
                        Ok(vp) => vp,
                        Err(err) => {
                            // The daemon holds an open handle and a lookup
                            // reference for a vnode we failed to produce;
                            // repay both so its accounting stays whole.
                            filehandle::send_release(
                                &mount,
                                entry.nodeid,
                                open.fh,
                                libc::O_RDWR,
                                false,
                            );
                            mount.send_and_forget(entry.nodeid, Request::Forget { nlookup: 1 });
                            return Err(err);
                        }
                    };

                    // The use count parks here until open claims the slot.
                    {
                        let mut state = vp.state();
                        state.handles.install(HandleMode::ReadWrite, open, libc::O_RDWR);
                        state.flags.insert(crate::node::NodeFlags::CREATE_STASH);
                    }
                    mount.stats.fh_current.bump();
                    mount.namecache.purge_negatives(dvp.id);
                    return Ok(vp);
                }
            }
        }

        let mut ticket = Ticket::new(&mount);
        ticket.dispatch_and_wait(
            guard,
            dvp.id,
            cred,
            Request::Mknod {
                name: name.to_os_string(),
                mode,
                rdev: 0,
            },
        )?;
        let entry = *ticket.reply()?.entry()?;
        drop(ticket);
        check_entry(&entry, VnodeType::Regular)?;

        let vp = match mount.vget(&entry, Some(dvp), Some(name)) {
            Ok(vp) => vp,
            Err(err) => {
                mount.send_and_forget(entry.nodeid, Request::Forget { nlookup: 1 });
                return Err(err);
            }
        };
        mount.namecache.purge_negatives(dvp.id);
        Ok(vp)
    }

    #[instrument(
        name = "vnop::mkdir",
        skip(self, guard, dvp, name, cred),
        fields(parent = dvp.id.0, ?name)
    )]
    pub fn mkdir(
        &self,
        guard: &mut OpGuard<'_>,
        dvp: &Arc<Vnode>,
        name: &OsStr,
        mode: u32,
        cred: &Credentials,
    ) -> OpResult<Arc<Vnode>> {
        self.dead_check(dvp)?;
        self.blanket_check(cred, Errno::EPERM)?;
        let body = Request::Mkdir {
            name: name.to_os_string(),
            mode,
        };
        let vp = self.new_entry(guard, dvp, name, body, VnodeType::Directory, cred)?;
        dvp.invalidate_attrs();
        Ok(vp)
    }

    #[instrument(
        name = "vnop::mknod",
        skip(self, guard, dvp, name, cred),
        fields(parent = dvp.id.0, ?name)
    )]
    pub fn mknod(
        &self,
        guard: &mut OpGuard<'_>,
        dvp: &Arc<Vnode>,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        vtype: VnodeType,
        cred: &Credentials,
    ) -> OpResult<Arc<Vnode>> {
        self.dead_check(dvp)?;
        self.blanket_check(cred, Errno::EPERM)?;
        let body = Request::Mknod {
            name: name.to_os_string(),
            mode,
            rdev,
        };
        let vp = self.new_entry(guard, dvp, name, body, vtype, cred)?;
        dvp.invalidate_attrs();
        Ok(vp)
    }

    #[instrument(
        name = "vnop::symlink",
        skip(self, guard, dvp, name, target, cred),
        fields(parent = dvp.id.0, ?name)
    )]
    pub fn symlink(
        &self,
        guard: &mut OpGuard<'_>,
        dvp: &Arc<Vnode>,
        name: &OsStr,
        target: &OsStr,
        cred: &Credentials,
    ) -> OpResult<Arc<Vnode>> {
        self.dead_check(dvp)?;
        self.blanket_check(cred, Errno::EPERM)?;
        let body = Request::Symlink {
            name: name.to_os_string(),
            target: target.to_os_string(),
        };
        let vp = self.new_entry(guard, dvp, name, body, VnodeType::Symlink, cred)?;
        dvp.invalidate_attrs();
        Ok(vp)
    }

    /// link: the entry reply reveals the existing inode once more, so the
    /// lookup count goes up with it.
    #[instrument(
        name = "vnop::link",
        skip(self, guard, vp, tdvp, name, cred),
        fields(node = vp.id.0, ?name)
    )]
    pub fn link(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        tdvp: &Arc<Vnode>,
        name: &OsStr,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.dead_check(vp)?;
        if vp
            .state()
            .attrs
            .peek()
            .is_some_and(|a| a.nlink >= LINK_MAX)
        {
            return Err(Errno::EMLINK);
        }
        self.blanket_check(cred, Errno::EPERM)?;

        let mut ticket = Ticket::new(&mount);
        ticket.dispatch_and_wait(
            guard,
            tdvp.id,
            cred,
            Request::Link {
                oldnodeid: vp.id,
                name: name.to_os_string(),
            },
        )?;
        let entry = *ticket.reply()?.entry()?;
        drop(ticket);

        let checked = check_entry(&entry, vp.vtype);
        tdvp.invalidate_attrs();
        vp.invalidate_attrs();
        if checked.is_ok() {
            vp.state().nlookup += 1;
        }
        checked
    }

    /// remove: purge before and after so no stale name survives the unlink.
    #[instrument(
        name = "vnop::remove",
        skip(self, guard, dvp, vp, name, cred),
        fields(node = vp.id.0, ?name)
    )]
    pub fn remove(
        &self,
        guard: &mut OpGuard<'_>,
        dvp: &Arc<Vnode>,
        vp: &Arc<Vnode>,
        name: &OsStr,
        flags: RemoveFlags,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.dead_check(vp)?;
        self.blanket_check(cred, Errno::ENOENT)?;
        if vp.vtype == VnodeType::Directory {
            return Err(Errno::EPERM);
        }
        if flags.contains(RemoveFlags::NODELETEBUSY) && mount.host().vnode_in_use(vp.id) {
            return Err(Errno::EBUSY);
        }

        guard.suspend(|| mount.namecache.purge(vp));

        let ticket = simple_put_get(
            &mount,
            guard,
            dvp.id,
            cred,
            Request::Unlink {
                name: name.to_os_string(),
            },
        )?;
        drop(ticket);

        guard.suspend(|| mount.namecache.purge(vp));
        dvp.invalidate_attrs();
        Ok(())
    }

    #[instrument(
        name = "vnop::rmdir",
        skip(self, guard, dvp, vp, name, cred),
        fields(node = vp.id.0, ?name)
    )]
    pub fn rmdir(
        &self,
        guard: &mut OpGuard<'_>,
        dvp: &Arc<Vnode>,
        vp: &Arc<Vnode>,
        name: &OsStr,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.dead_check(vp)?;
        self.blanket_check(cred, Errno::ENOENT)?;
        if vp.id == dvp.id {
            return Err(Errno::EINVAL);
        }

        guard.suspend(|| mount.namecache.purge(vp));

        let ticket = simple_put_get(
            &mount,
            guard,
            dvp.id,
            cred,
            Request::Rmdir {
                name: name.to_os_string(),
            },
        )?;
        drop(ticket);

        dvp.invalidate_attrs();
        Ok(())
    }

    /// rename: purge the moving vnode first, round-trip, then fix up every
    /// cache that named either end.
    #[instrument(
        name = "vnop::rename",
        skip(self, guard, fdvp, fvp, fname, tdvp, tvp, tname, cred),
        fields(node = fvp.id.0)
    )]
    #[expect(clippy::too_many_arguments, reason = "mirrors the host rename entry point")]
    pub fn rename(
        &self,
        guard: &mut OpGuard<'_>,
        fdvp: &Arc<Vnode>,
        fvp: &Arc<Vnode>,
        fname: &OsStr,
        tdvp: &Arc<Vnode>,
        tvp: Option<&Arc<Vnode>>,
        tname: &OsStr,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        self.dead_check(fdvp)?;
        self.blanket_check(cred, Errno::ENOENT)?;

        guard.suspend(|| mount.namecache.purge(fvp));

        let result = simple_put_get(
            &mount,
            guard,
            fdvp.id,
            cred,
            Request::Rename {
                from: fname.to_os_string(),
                to_dir: tdvp.id,
                to: tname.to_os_string(),
            },
        )
        .map(drop);

        if result.is_ok() {
            fdvp.invalidate_attrs();
            if tdvp.id != fdvp.id {
                tdvp.invalidate_attrs();
            }
            let mut state = fvp.state();
            state.parent_id = tdvp.id;
            state.parent = Arc::downgrade(tdvp);
            state.name = tname.to_os_string();
        }

        if let Some(tvp) = tvp {
            // The displaced target's name must not resolve anymore.
            if !Arc::ptr_eq(tvp, fvp) {
                guard.suspend(|| mount.namecache.purge(tvp));
            }
        }

        if fvp.vtype == VnodeType::Directory {
            if tvp.is_some_and(|t| t.vtype == VnodeType::Directory) {
                guard.suspend(|| mount.namecache.purge(tdvp));
            }
            guard.suspend(|| mount.namecache.purge(fdvp));
        }

        result
    }

    /// readdir: stream entries through the read-only handle until the reply
    /// runs dry or the destination budget is spent.
    #[instrument(name = "vnop::readdir", skip(self, guard, vp, cred), fields(node = vp.id.0))]
    pub fn readdir(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        offset: u64,
        max_bytes: usize,
        flags: ReaddirFlags,
        cred: &Credentials,
    ) -> OpResult<(Vec<Dirent>, bool)> {
        let mount = self.mount().clone();
        self.dead_check(vp)?;
        self.blanket_check(cred, Errno::EPERM)?;
        if !flags.is_empty() {
            // No cookies, no extended dirents.
            return Err(Errno::EINVAL);
        }
        if vp.vtype != VnodeType::Directory {
            return Err(Errno::ENOTDIR);
        }
        if max_bytes < Dirent::MIN_SIZE {
            return Err(Errno::EINVAL);
        }

        filehandle::handle_get(&mount, guard, vp, cred, HandleMode::ReadOnly)?;
        let result = self.readdir_loop(guard, vp, offset, max_bytes, cred);
        filehandle::handle_put(&mount, guard, vp, cred, HandleMode::ReadOnly)?;
        vp.invalidate_attrs();
        result
    }

    fn readdir_loop(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        mut offset: u64,
        max_bytes: usize,
        cred: &Credentials,
    ) -> OpResult<(Vec<Dirent>, bool)> {
        let mount = self.mount().clone();
        let Some(fh) = vp
            .state()
            .handles
            .slot(HandleMode::ReadOnly)
            .map(|h| h.fh)
        else {
            return Err(Errno::EIO);
        };

        let mut entries = Vec::new();
        let mut spent = 0usize;
        loop {
            let budget = max_bytes - spent;
            let mut ticket = Ticket::new(&mount);
            ticket.dispatch_and_wait(
                guard,
                vp.id,
                cred,
                Request::Readdir {
                    fh,
                    offset,
                    size: budget as u32,
                },
            )?;
            let batch = ticket.reply()?.dirents()?.clone();
            drop(ticket);

            if batch.is_empty() {
                return Ok((entries, true));
            }
            for entry in batch {
                let cost = Dirent::MIN_SIZE + entry.name.len();
                if spent + cost > max_bytes {
                    return Ok((entries, false));
                }
                spent += cost;
                offset = entry.next_offset;
                entries.push(entry);
            }
        }
    }

    /// readlink: one round trip; jailed mounts rebase absolute targets at
    /// the mount point.
    #[instrument(name = "vnop::readlink", skip(self, guard, vp, uio, cred), fields(node = vp.id.0))]
    pub fn readlink(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        uio: &mut Uio,
        cred: &Credentials,
    ) -> OpResult<()> {
        self.dead_check(vp)?;
        self.blanket_check(cred, Errno::ENOENT)?;
        if vp.vtype != VnodeType::Symlink {
            return Err(Errno::EINVAL);
        }

        let result = self.readlink_rpc(guard, vp, uio, cred);
        // The access time moved whether or not the round trip delivered.
        vp.invalidate_attrs();
        result
    }

    fn readlink_rpc(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        uio: &mut Uio,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        let ticket = simple_put_get(&mount, guard, vp.id, cred, Request::Readlink)?;
        let data = ticket.reply()?.data()?.clone();
        drop(ticket);

        if mount.has_option(MountOptions::JAIL_SYMLINKS) && data.first() == Some(&b'/') {
            let prefix = mount.mount_path().as_os_str().as_encoded_bytes().to_vec();
            guard.suspend(|| uio.move_in(&prefix));
        }
        guard.suspend(|| uio.move_in(&data));
        Ok(())
    }

    fn new_entry(
        &self,
        guard: &mut OpGuard<'_>,
        dvp: &Arc<Vnode>,
        name: &OsStr,
        body: Request,
        expected: VnodeType,
        cred: &Credentials,
    ) -> OpResult<Arc<Vnode>> {
        let mount = self.mount().clone();
        let mut ticket = Ticket::new(&mount);
        ticket.dispatch_and_wait(guard, dvp.id, cred, body)?;
        let entry = *ticket.reply()?.entry()?;
        drop(ticket);
        check_entry(&entry, expected)?;

        match mount.vget(&entry, Some(dvp), Some(name)) {
            Ok(vp) => Ok(vp),
            Err(err) => {
                mount.send_and_forget(entry.nodeid, Request::Forget { nlookup: 1 });
                Err(err)
            }
        }
    }
}
