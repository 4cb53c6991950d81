//! Host-side doubles: page caches, the cluster layer, authorization.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use relayfs::errno::{Errno, OpResult};
use relayfs::host::{
    AuthAction, ClusterIo, Credentials, HostVfs, IoFlags, PageCache, PageList, Uio,
};
use relayfs::node::VnodeType;
use relayfs::NodeId;

/// A page cache that records what the engine does to it.
#[derive(Default)]
pub struct TestPageCache {
    size: AtomicU64,
    dirty: AtomicBool,
    nocache: AtomicBool,
    noreadahead: AtomicBool,
    events: Mutex<Vec<String>>,
}

impl TestPageCache {
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn saw(&self, event: &str) -> bool {
        lock(&self.events).iter().any(|e| e == event)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    pub fn nocache(&self) -> bool {
        self.nocache.load(Ordering::SeqCst)
    }

    pub fn noreadahead(&self) -> bool {
        self.noreadahead.load(Ordering::SeqCst)
    }
}

impl PageCache for TestPageCache {
    fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
        lock(&self.events).push(format!("set_size:{size}"));
    }

    fn has_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn push_dirty(&self, flags: IoFlags) {
        self.dirty.store(false, Ordering::SeqCst);
        let sync = flags.contains(IoFlags::SYNC);
        lock(&self.events).push(format!("push_dirty:sync={sync}"));
    }

    fn flush_and_invalidate(&self) {
        self.dirty.store(false, Ordering::SeqCst);
        lock(&self.events).push("flush_and_invalidate".into());
    }

    fn set_nocache(&self, on: bool) {
        self.nocache.store(on, Ordering::SeqCst);
    }

    fn set_noreadahead(&self, on: bool) {
        self.noreadahead.store(on, Ordering::SeqCst);
    }
}

/// Cluster layer double: reads produce zeros bounded by EOF, writes consume
/// the uio, page ops commit. Everything is logged.
#[derive(Default)]
pub struct MockCluster {
    log: Mutex<Vec<String>>,
    fail_writes: AtomicBool,
}

impl MockCluster {
    pub fn log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl ClusterIo for MockCluster {
    fn read(
        &self,
        _ubc: &dyn PageCache,
        uio: &mut Uio,
        filesize: u64,
        _flags: IoFlags,
    ) -> OpResult<()> {
        let avail = filesize.saturating_sub(uio.offset().max(0) as u64) as usize;
        let n = uio.resid().min(avail);
        lock(&self.log).push(format!("read:off={} n={n}", uio.offset()));
        uio.move_in(&vec![0u8; n]);
        Ok(())
    }

    fn write(
        &self,
        _ubc: &dyn PageCache,
        uio: &mut Uio,
        old_eof: u64,
        new_eof: u64,
        zero_from: u64,
        flags: IoFlags,
    ) -> OpResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Errno::EIO);
        }
        let n = uio.resid();
        lock(&self.log).push(format!(
            "write:off={} n={n} old={old_eof} new={new_eof} zero={zero_from} sync={}",
            uio.offset(),
            flags.contains(IoFlags::SYNC)
        ));
        uio.move_out(n);
        Ok(())
    }

    fn pagein(
        &self,
        _ubc: &dyn PageCache,
        pages: &mut PageList,
        offset: u64,
        size: usize,
        filesize: u64,
    ) -> OpResult<()> {
        lock(&self.log).push(format!("pagein:off={offset} n={size} eof={filesize}"));
        pages.commit();
        Ok(())
    }

    fn pageout(
        &self,
        _ubc: &dyn PageCache,
        pages: &mut PageList,
        offset: u64,
        size: usize,
        filesize: u64,
    ) -> OpResult<()> {
        lock(&self.log).push(format!("pageout:off={offset} n={size} eof={filesize}"));
        pages.commit();
        Ok(())
    }
}

/// The host VFS double.
pub struct MockHost {
    pub cluster: MockCluster,
    pages: Mutex<HashMap<NodeId, Arc<TestPageCache>>>,
    fail_alloc: AtomicBool,
    auth_errno: Mutex<Option<i32>>,
    in_use: Mutex<HashSet<NodeId>>,
}

impl MockHost {
    pub fn new() -> Self {
        MockHost {
            cluster: MockCluster::default(),
            pages: Mutex::new(HashMap::new()),
            fail_alloc: AtomicBool::new(false),
            auth_errno: Mutex::new(None),
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// The page-cache double behind a vnode the engine allocated.
    pub fn pages_for(&self, id: NodeId) -> Arc<TestPageCache> {
        lock(&self.pages)
            .get(&id)
            .cloned()
            .expect("no page cache allocated for node")
    }

    /// Make the next vnode allocations fail, for compensation tests.
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }

    /// Force `authorize` to a fixed errno (None passes).
    pub fn deny_authorization(&self, errno: Option<i32>) {
        *lock(&self.auth_errno) = errno;
    }

    pub fn set_in_use(&self, id: NodeId, used: bool) {
        let mut set = lock(&self.in_use);
        if used {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }
}

impl HostVfs for MockHost {
    fn allocate_vnode(&self, id: NodeId, _vtype: VnodeType) -> OpResult<Arc<dyn PageCache>> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return Err(Errno(libc::ENOMEM));
        }
        let pages = Arc::new(TestPageCache::default());
        lock(&self.pages).insert(id, Arc::clone(&pages));
        Ok(pages)
    }

    fn cluster(&self) -> &dyn ClusterIo {
        &self.cluster
    }

    fn authorize(&self, _node: NodeId, _action: AuthAction, _cred: &Credentials) -> OpResult<()> {
        match *lock(&self.auth_errno) {
            Some(errno) => Err(Errno(errno)),
            None => Ok(()),
        }
    }

    fn vnode_in_use(&self, node: NodeId) -> bool {
        lock(&self.in_use).contains(&node)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
