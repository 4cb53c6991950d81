//! Per-inode state shared between a vnode and its daemon-side node.
//!
//! A vnode exclusively owns its [`Node`] state; the parent link is weak so
//! the vnode graph never owns a cycle. The daemon's view of the node stays
//! alive exactly while the lookup count is nonzero; the count is repaid with
//! a single FORGET on reclaim.

use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bitflags::bitflags;

use crate::attrcache::AttrCache;
use crate::filehandle::HandleTable;
use crate::host::PageCache;

/// Identifier by which the daemon names an inode. Unique within a mount for
/// as long as its lookup count is positive.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub u64);

/// The reserved root identifier.
pub const ROOT_ID: NodeId = NodeId(1);

/// The null identifier; a LOOKUP reply carrying it is a negative entry.
pub const NULL_ID: NodeId = NodeId(0);

/// File type of a vnode, fixed at creation. A daemon that reports a
/// different type later has replaced the inode behind our back; the stale
/// vnode is ditched rather than mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VnodeType {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    NamedPipe,
    Socket,
}

impl VnodeType {
    /// Decode from `S_IFMT` mode bits. `None` for an empty type field.
    #[must_use]
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & libc::S_IFMT as u32 {
            x if x == libc::S_IFREG as u32 => Some(VnodeType::Regular),
            x if x == libc::S_IFDIR as u32 => Some(VnodeType::Directory),
            x if x == libc::S_IFLNK as u32 => Some(VnodeType::Symlink),
            x if x == libc::S_IFCHR as u32 => Some(VnodeType::CharDevice),
            x if x == libc::S_IFBLK as u32 => Some(VnodeType::BlockDevice),
            x if x == libc::S_IFIFO as u32 => Some(VnodeType::NamedPipe),
            x if x == libc::S_IFSOCK as u32 => Some(VnodeType::Socket),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// The page cache is bypassed for this vnode.
        const DIRECT_IO    = 1 << 0;
        /// Change time needs pushing to the daemon.
        const TIMES_DIRTY  = 1 << 1;
        /// The vnode has been force-revoked.
        const REVOKED      = 1 << 2;
        /// A create parked its handle in the read-write slot; the next open
        /// claims it instead of opening again.
        const CREATE_STASH = 1 << 3;
    }
}

/// Mutable node state, guarded by the vnode's leaf mutex. The big mount lock
/// orders access; the leaf mutex only makes the state `Sync` for suspended
/// sections that must not touch it.
#[derive(Debug)]
pub struct NodeState {
    /// Daemon identifier of the parent directory.
    pub parent_id: NodeId,
    /// Non-owning handle on the parent vnode; may be gone.
    pub parent: Weak<Vnode>,
    /// Name this vnode was last reached by; exchange and rename read it.
    pub name: OsString,
    pub handles: HandleTable,
    pub attrs: AttrCache,
    /// Cached file size. Authoritative for buffered I/O; under direct-I/O it
    /// only tracks the latest attribute reply.
    pub filesize: u64,
    /// LOOKUP replies accepted and not yet forgiven.
    pub nlookup: u64,
    pub flags: NodeFlags,
}

/// One vnode and its node state.
pub struct Vnode {
    pub id: NodeId,
    pub generation: u64,
    pub vtype: VnodeType,
    /// This vnode's window into the unified buffer cache.
    pub ubc: Arc<dyn PageCache>,
    state: Mutex<NodeState>,
}

impl Vnode {
    pub(crate) fn new(
        id: NodeId,
        generation: u64,
        vtype: VnodeType,
        parent_id: NodeId,
        parent: Weak<Vnode>,
        name: OsString,
        ubc: Arc<dyn PageCache>,
    ) -> Arc<Vnode> {
        Arc::new(Vnode {
            id,
            generation,
            vtype,
            ubc,
            state: Mutex::new(NodeState {
                parent_id,
                parent,
                name,
                handles: HandleTable::default(),
                attrs: AttrCache::new(),
                filesize: 0,
                nlookup: 0,
                flags: NodeFlags::empty(),
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    /// Whether reads and writes bypass the page cache, either because the
    /// daemon asked for it on open or because the whole mount is direct.
    #[must_use]
    pub fn is_directio(&self, mount_wide: bool) -> bool {
        mount_wide || self.state().flags.contains(NodeFlags::DIRECT_IO)
    }

    /// Drop attribute freshness; metadata mutations call this.
    pub fn invalidate_attrs(&self) {
        self.state().attrs.invalidate();
    }
}

impl std::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vnode")
            .field("id", &self.id.0)
            .field("vtype", &self.vtype)
            .finish_non_exhaustive()
    }
}
