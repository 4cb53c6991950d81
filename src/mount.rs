//! Per-mount state: lifecycle, options, the node table, and statistics.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::biglock::{BigLock, OpGuard};
use crate::caps::CapabilityTable;
use crate::errno::{Errno, OpResult};
use crate::host::{Credentials, HostVfs, NameCache};
use crate::node::{NodeFlags, NodeId, Vnode, VnodeType, ROOT_ID};
use crate::proto::{Attr, EntryOut, Request};
use crate::ticket::Ticket;
use crate::transport::{RequestHeader, Transport};

/// Protocol revision sent in the INIT handshake.
pub const PROTO_MAJOR: u32 = 7;
pub const PROTO_MINOR: u32 = 19;

/// Xattr namespace reserved to the host; rejected when the mount opts out.
pub const HOST_XATTR_PREFIX: &str = "com.apple.";

/// Prefix of daemon-hidden double files.
pub const DOUBLE_NAME_PREFIX: &[u8] = b"._";

bitflags! {
    /// Mount-wide behavior switches. These arrive fully parsed; option
    /// string handling lives with the mount glue, not here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountOptions: u32 {
        const READ_ONLY          = 1 << 0;
        /// Let credentials other than the daemon's through.
        const ALLOW_OTHER        = 1 << 1;
        /// The daemon fabricates xattrs itself; never round-trip them.
        const AUTO_XATTR         = 1 << 2;
        /// Bypass the page cache mount-wide.
        const DIRECT_IO          = 1 << 3;
        /// Cache negative lookup replies.
        const NEGATIVE_NAMECACHE = 1 << 4;
        /// Hide `._` double files from the daemon.
        const NO_DOUBLE_FILES    = 1 << 5;
        /// Reject xattrs in the reserved host namespace.
        const NO_HOST_XATTR      = 1 << 6;
        const NO_ATTRCACHE       = 1 << 7;
        const NO_NAMECACHE       = 1 << 8;
        const NO_READAHEAD       = 1 << 9;
        const NO_SYNCONCLOSE     = 1 << 10;
        const NO_SYNCWRITES      = 1 << 11;
        const NO_UBC             = 1 << 12;
        /// Rebase absolute symlink targets at the mount point.
        const JAIL_SYMLINKS      = 1 << 13;
    }
}

/// Fully parsed mount parameters.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub options: MountOptions,
    pub daemon_credentials: Credentials,
    pub block_size: u32,
    /// Upper bound on one READ/WRITE chunk, possibly lowered by INIT.
    pub iosize: u32,
    /// Largest xattr payload accepted from a caller.
    pub user_buffer_max: u32,
    /// Where the volume is mounted; jailed symlinks resolve against it.
    pub mount_path: PathBuf,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            options: MountOptions::empty(),
            daemon_credentials: Credentials { uid: 0, gid: 0, pid: 0 },
            block_size: 4096,
            iosize: 1 << 16,
            user_buffer_max: 1 << 22,
            mount_path: PathBuf::from("/"),
        }
    }
}

/// Lifecycle of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountPhase {
    /// Device opened, INIT not yet answered.
    Uninitialized,
    Live,
    /// Daemon gone or unmount forced; ops short-circuit.
    Dead,
}

/// One atomically updated counter, mirrored out to the host's statistics
/// surface.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drop_one(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Observable engine counters.
#[derive(Default)]
pub struct MountStats {
    pub lookup_cache_hits: Counter,
    pub lookup_cache_misses: Counter,
    pub lookup_cache_overrides: Counter,
    pub fh_reuse: Counter,
    pub fh_current: Counter,
    pub fh_zombies: Counter,
    pub vnodes_current: Counter,
}

/// Everything the dispatcher shares per mount.
pub struct Mount {
    config: MountConfig,
    options: AtomicU32,
    phase: AtomicU8,
    iosize: AtomicU32,
    transport: Arc<dyn Transport>,
    host: Arc<dyn HostVfs>,
    pub namecache: NameCache,
    pub caps: CapabilityTable,
    pub stats: MountStats,
    nodes: Mutex<BTreeMap<NodeId, Arc<Vnode>>>,
    root: OnceLock<Arc<Vnode>>,
    ticketer: AtomicU64,
    biglock: BigLock,
}

impl Mount {
    /// Build the mount and its root vnode. The mount starts uninitialized;
    /// run [`Mount::init_handshake`] before dispatching regular ops.
    pub fn new(
        config: MountConfig,
        transport: Arc<dyn Transport>,
        host: Arc<dyn HostVfs>,
    ) -> OpResult<Arc<Mount>> {
        let mount = Arc::new(Mount {
            options: AtomicU32::new(config.options.bits()),
            iosize: AtomicU32::new(config.iosize),
            phase: AtomicU8::new(MountPhase::Uninitialized as u8),
            transport,
            host: Arc::clone(&host),
            namecache: NameCache::new(),
            caps: CapabilityTable::new(),
            stats: MountStats::default(),
            nodes: Mutex::new(BTreeMap::new()),
            root: OnceLock::new(),
            ticketer: AtomicU64::new(1),
            biglock: BigLock::new(),
            config,
        });

        let ubc = host.allocate_vnode(ROOT_ID, VnodeType::Directory)?;
        let root = Vnode::new(
            ROOT_ID,
            0,
            VnodeType::Directory,
            ROOT_ID,
            std::sync::Weak::new(),
            OsStr::new("/").into(),
            ubc,
        );
        mount.insert_node(Arc::clone(&root));
        mount.stats.vnodes_current.bump();
        let _ = mount.root.set(root);
        Ok(mount)
    }

    #[must_use]
    pub fn root(&self) -> Arc<Vnode> {
        Arc::clone(self.root.get().expect("root set in Mount::new"))
    }

    /// Take the big lock for one vnode op.
    pub fn enter_op(&self) -> OpGuard<'_> {
        self.biglock.enter()
    }

    #[must_use]
    pub fn options(&self) -> MountOptions {
        MountOptions::from_bits_truncate(self.options.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn has_option(&self, opt: MountOptions) -> bool {
        self.options().contains(opt)
    }

    /// Drop an option mount-wide. Direct-I/O opens use this to clear
    /// `NO_SYNCWRITES`.
    pub fn clear_option(&self, opt: MountOptions) {
        self.options.fetch_and(!opt.bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn phase(&self) -> MountPhase {
        match self.phase.load(Ordering::Acquire) {
            x if x == MountPhase::Live as u8 => MountPhase::Live,
            x if x == MountPhase::Dead as u8 => MountPhase::Dead,
            _ => MountPhase::Uninitialized,
        }
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.phase() == MountPhase::Dead
    }

    #[must_use]
    pub fn is_inited(&self) -> bool {
        self.phase() == MountPhase::Live
    }

    /// Mark the filesystem dead. The transport is responsible for waking
    /// parked waiters with [`TransportError::Dead`](crate::transport::TransportError::Dead).
    pub fn mark_dead(&self) {
        let was = self.phase.swap(MountPhase::Dead as u8, Ordering::AcqRel);
        if was != MountPhase::Dead as u8 {
            warn!("mount marked dead");
        }
    }

    /// Forced unmount entry: mark dead and drop every name-cache entry.
    /// Reclaim of the surviving vnodes elides RPCs from here on.
    pub fn force_unmount(&self) {
        self.mark_dead();
        self.namecache.purge_all();
    }

    /// Run the INIT round trip and transition to `Live`.
    pub fn init_handshake(&self, guard: &mut OpGuard<'_>, cred: &Credentials) -> OpResult<()> {
        let mut ticket = Ticket::new(self);
        ticket.dispatch_and_wait(
            guard,
            ROOT_ID,
            cred,
            Request::Init {
                major: PROTO_MAJOR,
                minor: PROTO_MINOR,
            },
        )?;
        let init = *ticket.reply()?.init()?;
        if init.max_write > 0 {
            let negotiated = init.max_write.min(self.config.iosize);
            self.iosize.store(negotiated, Ordering::Relaxed);
        }
        self.phase.store(MountPhase::Live as u8, Ordering::Release);
        info!(major = init.major, minor = init.minor, "init handshake complete");
        Ok(())
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    /// Negotiated READ/WRITE chunk bound.
    #[must_use]
    pub fn iosize(&self) -> u32 {
        self.iosize.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn user_buffer_max(&self) -> u32 {
        self.config.user_buffer_max
    }

    #[must_use]
    pub fn mount_path(&self) -> &std::path::Path {
        &self.config.mount_path
    }

    #[must_use]
    pub fn daemon_credentials(&self) -> Credentials {
        self.config.daemon_credentials
    }

    #[must_use]
    pub fn is_daemon(&self, cred: &Credentials) -> bool {
        cred.uid == self.config.daemon_credentials.uid
    }

    /// Mount-wide policy gate run before any RPC: with `ALLOW_OTHER` off,
    /// only the daemon's owner and the superuser get in.
    #[must_use]
    pub fn blanket_denied(&self, cred: &Credentials) -> bool {
        !(self.has_option(MountOptions::ALLOW_OTHER)
            || cred.is_superuser()
            || self.is_daemon(cred))
    }

    pub(crate) fn next_unique(&self) -> u64 {
        self.ticketer.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    #[must_use]
    pub fn host(&self) -> &dyn HostVfs {
        self.host.as_ref()
    }

    /// Queue a request with no waiter, under the daemon's own credentials.
    pub(crate) fn send_and_forget(&self, nodeid: NodeId, body: Request) {
        if self.is_dead() {
            return;
        }
        let cred = self.config.daemon_credentials;
        let header = RequestHeader {
            unique: self.next_unique(),
            opcode: body.opcode(),
            nodeid,
            uid: cred.uid,
            gid: cred.gid,
            pid: cred.pid,
        };
        self.transport.send_and_forget(header, body);
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, BTreeMap<NodeId, Arc<Vnode>>> {
        self.nodes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn node_by_id(&self, id: NodeId) -> Option<Arc<Vnode>> {
        self.lock_nodes().get(&id).cloned()
    }

    /// Snapshot of every live node, ordered by identifier. Forced unmount
    /// walks this to reclaim stragglers.
    #[must_use]
    pub fn live_nodes(&self) -> Vec<Arc<Vnode>> {
        self.lock_nodes().values().cloned().collect()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.lock_nodes().len()
    }

    pub(crate) fn insert_node(&self, vp: Arc<Vnode>) {
        self.lock_nodes().insert(vp.id, vp);
    }

    pub(crate) fn remove_node(&self, id: NodeId) {
        self.lock_nodes().remove(&id);
    }

    /// Intern the node named by an entry reply and produce its vnode.
    ///
    /// Every call accounts for exactly one accepted LOOKUP reply: the lookup
    /// count is bumped on the existing node or starts at one on a fresh one.
    /// A type disagreement with an interned vnode purges the name cache and
    /// fails with `EIO` so the host retries with a clean slate.
    pub fn vget(
        &self,
        entry: &EntryOut,
        dvp: Option<&Arc<Vnode>>,
        name: Option<&OsStr>,
    ) -> OpResult<Arc<Vnode>> {
        let vtype = entry.attr.vnode_type().ok_or(Errno::EIO)?;

        if let Some(existing) = self.node_by_id(entry.nodeid) {
            if existing.vtype != vtype {
                debug!(
                    node = entry.nodeid.0,
                    cached = ?existing.vtype,
                    returned = ?vtype,
                    "vnode type changed behind our back"
                );
                self.namecache.purge(&existing);
                return Err(Errno::EIO);
            }
            {
                let mut state = existing.state();
                state.nlookup += 1;
                if let Some(dvp) = dvp {
                    state.parent_id = dvp.id;
                    state.parent = Arc::downgrade(dvp);
                }
                if let Some(name) = name {
                    state.name = name.to_os_string();
                }
            }
            self.cache_attrs(&existing, &entry.attr, entry.attr_valid);
            self.enter_namecache(&existing, dvp, name, entry.entry_valid);
            return Ok(existing);
        }

        let ubc = self.host.allocate_vnode(entry.nodeid, vtype)?;
        let vp = Vnode::new(
            entry.nodeid,
            entry.generation,
            vtype,
            dvp.map_or(ROOT_ID, |d| d.id),
            dvp.map_or_else(std::sync::Weak::new, Arc::downgrade),
            name.map(OsStr::to_os_string).unwrap_or_default(),
            ubc,
        );
        {
            let mut state = vp.state();
            state.nlookup = 1;
            state.filesize = entry.attr.size;
        }
        self.cache_attrs(&vp, &entry.attr, entry.attr_valid);
        self.insert_node(Arc::clone(&vp));
        self.stats.vnodes_current.bump();
        self.enter_namecache(&vp, dvp, name, entry.entry_valid);
        Ok(vp)
    }

    /// Opportunistic attribute refresh from any reply that carries them.
    /// Under direct-I/O the node's size field follows every reply.
    pub fn cache_attrs(&self, vp: &Vnode, attr: &Attr, valid: Duration) {
        let valid = if self.has_option(MountOptions::NO_ATTRCACHE) {
            Duration::ZERO
        } else {
            valid
        };
        let directio = self.has_option(MountOptions::DIRECT_IO);
        let mut state = vp.state();
        if vp.vtype == VnodeType::Regular
            && (directio || state.flags.contains(NodeFlags::DIRECT_IO))
        {
            state.filesize = attr.size;
        }
        state.attrs.store(*attr, valid);
    }

    fn enter_namecache(
        &self,
        vp: &Arc<Vnode>,
        dvp: Option<&Arc<Vnode>>,
        name: Option<&OsStr>,
        entry_valid: Duration,
    ) {
        if self.has_option(MountOptions::NO_NAMECACHE) || entry_valid.is_zero() {
            return;
        }
        if let (Some(dvp), Some(name)) = (dvp, name) {
            let expires = Instant::now().checked_add(entry_valid);
            self.namecache.enter(dvp.id, name, vp, expires);
        }
    }
}

/// True when `name` uses the hidden double-file convention.
#[must_use]
pub fn is_double_name(name: &OsStr) -> bool {
    name.as_encoded_bytes().starts_with(DOUBLE_NAME_PREFIX)
}
