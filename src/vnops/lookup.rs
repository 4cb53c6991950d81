//! The name-lookup bridge.

use std::ffi::OsStr;
use std::sync::Arc;

use tracing::{instrument, trace};

use crate::biglock::OpGuard;
use crate::errno::{Errno, OpResult};
use crate::host::{CacheOutcome, Credentials};
use crate::mount::{is_double_name, MountOptions};
use crate::node::{Vnode, VnodeType, NULL_ID, ROOT_ID};
use crate::proto::{Request, NAME_MAX};
use crate::ticket::Ticket;

use super::Dispatch;

/// What the host intends to do with the name once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupIntent {
    Lookup,
    Create,
    Delete,
    Rename,
}

impl LookupIntent {
    fn mutates(self) -> bool {
        !matches!(self, LookupIntent::Lookup)
    }
}

/// Outcome of a lookup.
#[derive(Debug)]
pub enum LookupStatus {
    Found(Arc<Vnode>),
    /// The name is absent but the parent is usable: the host may proceed
    /// with its create or rename.
    JustReturn,
}

impl Dispatch {
    /// Resolve `name` under `dvp`.
    #[instrument(
        name = "vnop::lookup",
        skip(self, guard, dvp, name, cred),
        fields(parent = dvp.id.0, ?name)
    )]
    pub fn lookup(
        &self,
        guard: &mut OpGuard<'_>,
        dvp: &Arc<Vnode>,
        name: &OsStr,
        intent: LookupIntent,
        is_last: bool,
        cred: &Credentials,
    ) -> OpResult<LookupStatus> {
        let mount = self.mount().clone();
        self.dead_check(dvp)?;

        if mount.has_option(MountOptions::NO_DOUBLE_FILES) && is_double_name(name) {
            return Err(Errno::ENOENT);
        }
        if dvp.vtype != VnodeType::Directory {
            return Err(Errno::ENOTDIR);
        }
        if is_last && intent.mutates() && mount.has_option(MountOptions::READ_ONLY) {
            return Err(Errno::EROFS);
        }
        if name.len() > NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }

        let bytes = name.as_encoded_bytes();
        if bytes == b"." {
            if intent == LookupIntent::Rename && is_last {
                return Err(Errno::EISDIR);
            }
            // Including delete-at-last-component, where the VFS wants the
            // directory itself back.
            return Ok(LookupStatus::Found(Arc::clone(dvp)));
        }
        if bytes == b".." {
            return self.lookup_dotdot(guard, dvp, cred);
        }

        if mount.has_option(MountOptions::NO_NAMECACHE) {
            // Pretend it was a miss.
            mount.stats.lookup_cache_overrides.bump();
        } else {
            let outcome = guard.suspend(|| mount.namecache.lookup(dvp.id, name));
            match outcome {
                CacheOutcome::Hit(vp) => {
                    mount.stats.lookup_cache_hits.bump();
                    return Ok(LookupStatus::Found(vp));
                }
                CacheOutcome::Negative => {
                    let creating = intent == LookupIntent::Create || intent == LookupIntent::Rename;
                    return if creating && is_last {
                        Ok(LookupStatus::JustReturn)
                    } else {
                        Err(Errno::ENOENT)
                    };
                }
                CacheOutcome::Miss => {
                    mount.stats.lookup_cache_misses.bump();
                }
            }
        }

        let mut ticket = Ticket::new(&mount);
        let sent = ticket.dispatch_and_wait(
            guard,
            dvp.id,
            cred,
            Request::Lookup {
                name: name.to_os_string(),
            },
        );

        let entry = match sent {
            Err(Errno::ENOENT) => {
                // The daemon replied with a bare negative.
                return self.negative_lookup(dvp, name, intent, is_last, None);
            }
            Err(err) => return Err(err),
            Ok(()) => *ticket.reply()?.entry()?,
        };
        drop(ticket);

        if entry.nodeid == NULL_ID {
            return self.negative_lookup(dvp, name, intent, is_last, Some(entry.entry_valid));
        }
        if entry.nodeid == ROOT_ID {
            // The daemon may never resolve a name to the root.
            return Err(Errno::EINVAL);
        }
        if entry.attr.vnode_type().is_none() {
            return Err(Errno::EIO);
        }

        let vp = match mount.vget(&entry, Some(dvp), Some(name)) {
            Ok(vp) => vp,
            Err(err) => {
                // The daemon believes we accepted the reply; forgive it.
                mount.send_and_forget(entry.nodeid, Request::Forget { nlookup: 1 });
                return Err(err);
            }
        };

        if !is_last
            && vp.vtype != VnodeType::Directory
            && vp.vtype != VnodeType::Symlink
        {
            // Mid-path components must be traversable. The lookup count
            // stays on the node; reclaim repays it.
            return Err(Errno::ENOTDIR);
        }

        trace!(node = vp.id.0, "lookup resolved");
        Ok(LookupStatus::Found(vp))
    }

    fn negative_lookup(
        &self,
        dvp: &Arc<Vnode>,
        name: &OsStr,
        intent: LookupIntent,
        is_last: bool,
        valid: Option<std::time::Duration>,
    ) -> OpResult<LookupStatus> {
        let mount = self.mount();
        if (intent == LookupIntent::Create || intent == LookupIntent::Rename) && is_last {
            return Ok(LookupStatus::JustReturn);
        }
        if mount.has_option(MountOptions::NEGATIVE_NAMECACHE)
            && !mount.has_option(MountOptions::NO_NAMECACHE)
            && intent != LookupIntent::Create
        {
            let expires = valid
                .filter(|v| !v.is_zero())
                .and_then(|v| std::time::Instant::now().checked_add(v));
            mount.namecache.enter_negative(dvp.id, name, expires);
        }
        Err(Errno::ENOENT)
    }

    /// Dotdot rides the weak parent link; when the parent vnode is gone the
    /// recorded parent identifier is revalidated with a GETATTR.
    fn lookup_dotdot(
        &self,
        guard: &mut OpGuard<'_>,
        dvp: &Arc<Vnode>,
        cred: &Credentials,
    ) -> OpResult<LookupStatus> {
        let mount = self.mount().clone();
        let (parent_id, parent) = {
            let state = dvp.state();
            (state.parent_id, state.parent.upgrade())
        };
        if let Some(parent) = parent {
            return Ok(LookupStatus::Found(parent));
        }

        let mut ticket = Ticket::new(&mount);
        ticket.dispatch_and_wait(guard, parent_id, cred, Request::Getattr)?;
        let out = *ticket.reply()?.attr()?;
        if out.attr.vnode_type().is_none() {
            return Err(Errno::EIO);
        }

        match mount.node_by_id(parent_id) {
            Some(parent) => {
                mount.cache_attrs(&parent, &out.attr, out.attr_valid);
                Ok(LookupStatus::Found(parent))
            }
            None => Err(Errno::ENOENT),
        }
    }
}
