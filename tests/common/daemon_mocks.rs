//! A scripted in-process daemon behind the `Transport` trait.
//!
//! Every request is logged before it is answered, so tests can assert on
//! opcode counts (opens vs releases, lookups vs forgets). Default replies
//! model a tiny obliging filesystem; individual opcodes can be overridden
//! with closures or forced errnos, and a gate can park round trips to stage
//! forced-unmount races.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use relayfs::proto::{
    Attr, AttrOut, Dirent, EntryOut, InitOut, OpenOut, OpenReplyFlags, Opcode, Reply, Request,
    WriteOut, XattrSizeOut,
};
use relayfs::transport::{RequestHeader, Transport, TransportError};
use relayfs::NodeId;

type Handler =
    Box<dyn Fn(&RequestHeader, &Request) -> Result<Reply, TransportError> + Send + Sync>;

#[derive(Default)]
struct Namespace {
    /// (parent, name) -> child.
    names: HashMap<(NodeId, OsString), NodeId>,
    attrs: HashMap<NodeId, Attr>,
}

pub struct MockDaemon {
    log: Mutex<Vec<(Opcode, NodeId)>>,
    requests: Mutex<Vec<(RequestHeader, Request)>>,
    dropped: Mutex<Vec<(u64, bool)>>,
    handlers: Mutex<HashMap<Opcode, Handler>>,
    namespace: Mutex<Namespace>,
    dead: AtomicBool,
    held: Mutex<Vec<Opcode>>,
    gate: Condvar,
    next_fh: AtomicU64,
    next_node: AtomicU64,
    /// Attribute validity attached to every attr-bearing reply.
    pub attr_valid: Mutex<Duration>,
    /// Entry validity attached to every entry reply.
    pub entry_valid: Mutex<Duration>,
}

pub fn file_attr(ino: u64, size: u64) -> Attr {
    Attr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        mode: libc::S_IFREG as u32 | 0o644,
        nlink: 1,
        uid: 501,
        gid: 20,
        rdev: 0,
    }
}

pub fn dir_attr(ino: u64) -> Attr {
    Attr {
        mode: libc::S_IFDIR as u32 | 0o755,
        nlink: 2,
        ..file_attr(ino, 0)
    }
}

impl MockDaemon {
    pub fn new() -> Self {
        MockDaemon {
            log: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            namespace: Mutex::new(Namespace::default()),
            dead: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            gate: Condvar::new(),
            next_fh: AtomicU64::new(1),
            next_node: AtomicU64::new(100),
            attr_valid: Mutex::new(Duration::from_secs(60)),
            entry_valid: Mutex::new(Duration::from_secs(60)),
        }
    }

    // -- scripting --------------------------------------------------------

    pub fn on<F>(&self, op: Opcode, f: F)
    where
        F: Fn(&RequestHeader, &Request) -> Result<Reply, TransportError> + Send + Sync + 'static,
    {
        lock(&self.handlers).insert(op, Box::new(f));
    }

    pub fn on_error(&self, op: Opcode, errno: i32) {
        self.on(op, move |_, _| Err(TransportError::Daemon(errno)));
    }

    pub fn clear_handler(&self, op: Opcode) {
        lock(&self.handlers).remove(&op);
    }

    pub fn add_file(&self, parent: NodeId, name: &str, id: NodeId, size: u64) {
        let mut ns = lock(&self.namespace);
        ns.names.insert((parent, OsString::from(name)), id);
        ns.attrs.insert(id, file_attr(id.0, size));
    }

    pub fn add_dir(&self, parent: NodeId, name: &str, id: NodeId) {
        let mut ns = lock(&self.namespace);
        ns.names.insert((parent, OsString::from(name)), id);
        ns.attrs.insert(id, dir_attr(id.0));
    }

    pub fn set_attr(&self, id: NodeId, attr: Attr) {
        lock(&self.namespace).attrs.insert(id, attr);
    }

    pub fn set_valid(&self, attr: Duration, entry: Duration) {
        *lock(&self.attr_valid) = attr;
        *lock(&self.entry_valid) = entry;
    }

    /// Park round trips for `op` until the daemon dies or the hold lifts.
    pub fn hold(&self, op: Opcode) {
        lock(&self.held).push(op);
    }

    pub fn release_held(&self) {
        lock(&self.held).clear();
        self.gate.notify_all();
    }

    /// The daemon goes away: parked and future round trips fail dead.
    pub fn die(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.gate.notify_all();
    }

    // -- observation ------------------------------------------------------

    pub fn count(&self, op: Opcode) -> usize {
        lock(&self.log).iter().filter(|(o, _)| *o == op).count()
    }

    pub fn log(&self) -> Vec<(Opcode, NodeId)> {
        lock(&self.log).clone()
    }

    pub fn clear_log(&self) {
        lock(&self.log).clear();
        lock(&self.requests).clear();
    }

    pub fn requests_for(&self, op: Opcode) -> Vec<Request> {
        lock(&self.requests)
            .iter()
            .filter(|(h, _)| h.opcode == op)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Forget totals per node, summed across FORGET requests.
    pub fn forgotten(&self, id: NodeId) -> u64 {
        lock(&self.requests)
            .iter()
            .filter(|(h, _)| h.opcode == Opcode::Forget && h.nodeid == id)
            .map(|(_, r)| match r {
                Request::Forget { nlookup } => *nlookup,
                _ => 0,
            })
            .sum()
    }

    /// Ticket drops observed, as `(unique, killed)`.
    pub fn drops(&self) -> Vec<(u64, bool)> {
        lock(&self.dropped).clone()
    }

    pub fn killed_drops(&self) -> usize {
        lock(&self.dropped).iter().filter(|(_, k)| *k).count()
    }

    // -- default replies --------------------------------------------------

    fn entry_out(&self, id: NodeId, attr: Attr) -> EntryOut {
        EntryOut {
            nodeid: id,
            generation: 0,
            entry_valid: *lock(&self.entry_valid),
            attr_valid: *lock(&self.attr_valid),
            attr,
        }
    }

    fn fresh_open(&self) -> OpenOut {
        OpenOut {
            fh: self.next_fh.fetch_add(1, Ordering::SeqCst),
            open_flags: OpenReplyFlags::empty(),
        }
    }

    fn default_reply(
        &self,
        header: &RequestHeader,
        body: &Request,
    ) -> Result<Reply, TransportError> {
        match body {
            Request::Init { .. } => Ok(Reply::Init(InitOut {
                major: 7,
                minor: 19,
                max_write: 1 << 17,
            })),
            Request::Lookup { name } => {
                let ns = lock(&self.namespace);
                match ns.names.get(&(header.nodeid, name.clone())) {
                    Some(id) => {
                        let attr = ns.attrs[id];
                        let id = *id;
                        drop(ns);
                        Ok(Reply::Entry(self.entry_out(id, attr)))
                    }
                    None => Err(TransportError::Daemon(libc::ENOENT)),
                }
            }
            Request::Getattr => {
                let ns = lock(&self.namespace);
                let attr = ns
                    .attrs
                    .get(&header.nodeid)
                    .copied()
                    .unwrap_or_else(|| file_attr(header.nodeid.0, 0));
                drop(ns);
                Ok(Reply::Attr(AttrOut {
                    attr_valid: *lock(&self.attr_valid),
                    attr,
                }))
            }
            Request::Setattr(sa) => {
                let mut ns = lock(&self.namespace);
                let mut attr = ns
                    .attrs
                    .get(&header.nodeid)
                    .copied()
                    .unwrap_or_else(|| file_attr(header.nodeid.0, 0));
                if let Some(size) = sa.size {
                    attr.size = size;
                }
                if let Some(mode) = sa.mode {
                    attr.mode = (attr.mode & libc::S_IFMT as u32) | (mode & 0o7777);
                }
                ns.attrs.insert(header.nodeid, attr);
                drop(ns);
                Ok(Reply::Attr(AttrOut {
                    attr_valid: *lock(&self.attr_valid),
                    attr,
                }))
            }
            Request::Open { .. } | Request::Opendir { .. } => Ok(Reply::Open(self.fresh_open())),
            Request::Create { name, mode, .. } => {
                let id = NodeId(self.next_node.fetch_add(1, Ordering::SeqCst));
                let mut attr = file_attr(id.0, 0);
                attr.mode = libc::S_IFREG as u32 | (mode & 0o7777);
                let mut ns = lock(&self.namespace);
                ns.names.insert((header.nodeid, name.clone()), id);
                ns.attrs.insert(id, attr);
                drop(ns);
                Ok(Reply::Create {
                    entry: self.entry_out(id, attr),
                    open: self.fresh_open(),
                })
            }
            Request::Mknod { name, mode, .. } => {
                let id = NodeId(self.next_node.fetch_add(1, Ordering::SeqCst));
                let mut attr = file_attr(id.0, 0);
                attr.mode = libc::S_IFREG as u32 | (mode & 0o7777);
                let mut ns = lock(&self.namespace);
                ns.names.insert((header.nodeid, name.clone()), id);
                ns.attrs.insert(id, attr);
                drop(ns);
                Ok(Reply::Entry(self.entry_out(id, attr)))
            }
            Request::Mkdir { name, .. } => {
                let id = NodeId(self.next_node.fetch_add(1, Ordering::SeqCst));
                let attr = dir_attr(id.0);
                let mut ns = lock(&self.namespace);
                ns.names.insert((header.nodeid, name.clone()), id);
                ns.attrs.insert(id, attr);
                drop(ns);
                Ok(Reply::Entry(self.entry_out(id, attr)))
            }
            Request::Symlink { name, .. } => {
                let id = NodeId(self.next_node.fetch_add(1, Ordering::SeqCst));
                let mut attr = file_attr(id.0, 0);
                attr.mode = libc::S_IFLNK as u32 | 0o777;
                let mut ns = lock(&self.namespace);
                ns.names.insert((header.nodeid, name.clone()), id);
                ns.attrs.insert(id, attr);
                drop(ns);
                Ok(Reply::Entry(self.entry_out(id, attr)))
            }
            Request::Link { oldnodeid, name } => {
                let ns = lock(&self.namespace);
                let attr = ns
                    .attrs
                    .get(oldnodeid)
                    .copied()
                    .unwrap_or_else(|| file_attr(oldnodeid.0, 0));
                let id = *oldnodeid;
                drop(ns);
                lock(&self.namespace)
                    .names
                    .insert((header.nodeid, name.clone()), id);
                Ok(Reply::Entry(self.entry_out(id, attr)))
            }
            Request::Read { size, .. } => Ok(Reply::Data(vec![0u8; *size as usize].into())),
            Request::Write { data, .. } => Ok(Reply::Write(WriteOut {
                size: data.len() as u32,
            })),
            Request::Readdir { .. } => Ok(Reply::Dirents(Vec::new())),
            Request::Readlink => Ok(Reply::Data(bytes::Bytes::from_static(b"target"))),
            Request::Getxattr { size, .. } | Request::Listxattr { size } => {
                if *size == 0 {
                    Ok(Reply::XattrSize(XattrSizeOut { size: 0 }))
                } else {
                    Ok(Reply::Data(bytes::Bytes::new()))
                }
            }
            Request::Ioctl { out_size, .. } => Ok(Reply::Ioctl {
                out_data: vec![0u8; *out_size as usize].into(),
            }),
            Request::Forget { .. } => Ok(Reply::Empty),
            _ => Ok(Reply::Empty),
        }
    }

    fn wait_if_held(&self, op: Opcode) {
        let mut held = lock(&self.held);
        while held.contains(&op) && !self.dead.load(Ordering::SeqCst) {
            held = self
                .gate
                .wait(held)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

impl Transport for MockDaemon {
    fn round_trip(&self, header: RequestHeader, body: Request) -> Result<Reply, TransportError> {
        lock(&self.log).push((header.opcode, header.nodeid));
        lock(&self.requests).push((header, body.clone()));

        self.wait_if_held(header.opcode);
        if self.dead.load(Ordering::SeqCst) {
            return Err(TransportError::Dead);
        }

        let handlers = lock(&self.handlers);
        if let Some(handler) = handlers.get(&header.opcode) {
            return handler(&header, &body);
        }
        drop(handlers);
        self.default_reply(&header, &body)
    }

    fn send_and_forget(&self, header: RequestHeader, body: Request) {
        lock(&self.log).push((header.opcode, header.nodeid));
        lock(&self.requests).push((header, body));
    }

    fn reply_dropped(&self, unique: u64, killed: bool) {
        lock(&self.dropped).push((unique, killed));
    }
}

impl MockDaemon {
    /// Register an existing node under an additional name.
    pub fn add_link(&self, parent: NodeId, name: &OsStr, id: NodeId) {
        lock(&self.namespace)
            .names
            .insert((parent, name.to_os_string()), id);
    }

    /// Register a symlink node.
    pub fn add_symlink(&self, parent: NodeId, name: &str, id: NodeId, target: &str) {
        let mut attr = file_attr(id.0, target.len() as u64);
        attr.mode = libc::S_IFLNK as u32 | 0o777;
        let mut ns = lock(&self.namespace);
        ns.names.insert((parent, OsString::from(name)), id);
        ns.attrs.insert(id, attr);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
