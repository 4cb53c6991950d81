//! Typed view of the bridge protocol.
//!
//! The byte layout of requests and replies is the transport's concern; the
//! dispatcher only ever speaks in terms of [`Opcode`], the typed payloads in
//! [`Request`], and the typed reply bodies in [`Reply`]. A reply of the wrong
//! shape for the request that produced it is a protocol violation and maps to
//! `EIO` at the accessors below.

use std::ffi::OsString;
use std::fmt;
use std::time::{Duration, SystemTime};

use bitflags::bitflags;
use bytes::Bytes;

use crate::errno::{Errno, OpResult};
use crate::node::NodeId;

/// Longest name the protocol accepts, in bytes.
pub const NAME_MAX: usize = 255;

/// Hard links per file as reported through pathconf.
pub const LINK_MAX: u32 = 32767;

/// Host path-length maximum as reported through pathconf.
pub const PATH_MAX: i64 = 1024;

/// Xattr replies larger than this are requested with the ticket pre-killed
/// so the body is discarded without a user copy.
pub const REASONABLE_XATTR_SIZE: u32 = 64 * 1024;

/// Every operation the dispatcher may send downward.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u32)]
pub enum Opcode {
    Lookup,
    Forget,
    Getattr,
    Setattr,
    Readlink,
    Symlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Link,
    Open,
    Read,
    Write,
    Release,
    Fsync,
    Flush,
    Init,
    Opendir,
    Readdir,
    Releasedir,
    Fsyncdir,
    Getxattr,
    Setxattr,
    Listxattr,
    Removexattr,
    Create,
    Ioctl,
    Exchange,
}

impl Opcode {
    pub(crate) fn bit(self) -> u64 {
        1u64 << (self as u32)
    }
}

bitflags! {
    /// Flags a daemon may attach to an OPEN / OPENDIR / CREATE reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenReplyFlags: u32 {
        /// Bypass the page cache for this handle's vnode.
        const DIRECT_IO  = 1 << 0;
        /// Keep previously cached pages on open.
        const KEEP_CACHE = 1 << 1;
        /// Flush and invalidate cached pages before first use.
        const PURGE_UBC  = 1 << 2;
        /// Additionally drop cached attributes and re-fetch them.
        const PURGE_ATTR = 1 << 3;
    }
}

/// Wire-level stat of one inode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    /// Type and permission bits, `S_IFMT`-encoded.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
}

impl Attr {
    /// Decode the file type from the mode bits. `None` means the daemon sent
    /// a mode with an empty type field, which callers treat as `EIO`.
    #[must_use]
    pub fn vnode_type(&self) -> Option<crate::node::VnodeType> {
        crate::node::VnodeType::from_mode(self.mode)
    }
}

/// Reply body of LOOKUP, MKNOD, MKDIR, SYMLINK, LINK, and the entry half of
/// CREATE.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryOut {
    pub nodeid: NodeId,
    pub generation: u64,
    pub entry_valid: Duration,
    pub attr_valid: Duration,
    pub attr: Attr,
}

/// Reply body of GETATTR and SETATTR.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttrOut {
    pub attr_valid: Duration,
    pub attr: Attr,
}

/// Reply body of OPEN and OPENDIR, and the open half of CREATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: OpenReplyFlags,
}

/// Reply body of WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOut {
    pub size: u32,
}

/// Size-only reply of GETXATTR / LISTXATTR probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XattrSizeOut {
    pub size: u32,
}

/// Reply body of INIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_write: u32,
}

/// One directory entry from a READDIR reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    /// Opaque cookie naming the position after this entry.
    pub next_offset: u64,
    pub kind: crate::node::VnodeType,
    pub name: OsString,
}

impl Dirent {
    /// Smallest wire footprint of a dirent; readdir destination buffers
    /// shorter than this are rejected.
    pub const MIN_SIZE: usize = 24;
}

/// Metadata fields a SETATTR request may carry. Unset fields are untouched
/// at the daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SetattrIn {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub crtime: Option<SystemTime>,
    pub bkuptime: Option<SystemTime>,
}

impl SetattrIn {
    /// True when no field is set; such a request is not worth a round trip.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == SetattrIn::default()
    }

    /// True when any field other than the size is set.
    #[must_use]
    pub fn touches_metadata(&self) -> bool {
        let mut probe = *self;
        probe.size = None;
        !probe.is_empty()
    }
}

/// Typed request payloads, one variant per opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Lookup { name: OsString },
    Forget { nlookup: u64 },
    Getattr,
    Setattr(SetattrIn),
    Readlink,
    Symlink { name: OsString, target: OsString },
    Mknod { name: OsString, mode: u32, rdev: u32 },
    Mkdir { name: OsString, mode: u32 },
    Unlink { name: OsString },
    Rmdir { name: OsString },
    Rename { from: OsString, to_dir: NodeId, to: OsString },
    Link { oldnodeid: NodeId, name: OsString },
    Open { flags: i32 },
    Read { fh: u64, offset: u64, size: u32 },
    Write { fh: u64, offset: u64, data: Bytes },
    Release { fh: u64, flags: i32 },
    Fsync { fh: u64, datasync: bool },
    Flush { fh: u64 },
    Init { major: u32, minor: u32 },
    Opendir { flags: i32 },
    Readdir { fh: u64, offset: u64, size: u32 },
    Releasedir { fh: u64, flags: i32 },
    Fsyncdir { fh: u64, datasync: bool },
    Getxattr { name: OsString, size: u32, position: u32 },
    Setxattr { name: OsString, value: Bytes, flags: i32, position: u32 },
    Listxattr { size: u32 },
    Removexattr { name: OsString },
    Create { name: OsString, mode: u32, flags: i32 },
    Ioctl { fh: u64, cmd: u64, in_data: Bytes, out_size: u32 },
    Exchange { from_dir: NodeId, from: OsString, to_dir: NodeId, to: OsString, options: u64 },
}

impl Request {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Lookup { .. } => Opcode::Lookup,
            Request::Forget { .. } => Opcode::Forget,
            Request::Getattr => Opcode::Getattr,
            Request::Setattr(_) => Opcode::Setattr,
            Request::Readlink => Opcode::Readlink,
            Request::Symlink { .. } => Opcode::Symlink,
            Request::Mknod { .. } => Opcode::Mknod,
            Request::Mkdir { .. } => Opcode::Mkdir,
            Request::Unlink { .. } => Opcode::Unlink,
            Request::Rmdir { .. } => Opcode::Rmdir,
            Request::Rename { .. } => Opcode::Rename,
            Request::Link { .. } => Opcode::Link,
            Request::Open { .. } => Opcode::Open,
            Request::Read { .. } => Opcode::Read,
            Request::Write { .. } => Opcode::Write,
            Request::Release { .. } => Opcode::Release,
            Request::Fsync { .. } => Opcode::Fsync,
            Request::Flush { .. } => Opcode::Flush,
            Request::Init { .. } => Opcode::Init,
            Request::Opendir { .. } => Opcode::Opendir,
            Request::Readdir { .. } => Opcode::Readdir,
            Request::Releasedir { .. } => Opcode::Releasedir,
            Request::Fsyncdir { .. } => Opcode::Fsyncdir,
            Request::Getxattr { .. } => Opcode::Getxattr,
            Request::Setxattr { .. } => Opcode::Setxattr,
            Request::Listxattr { .. } => Opcode::Listxattr,
            Request::Removexattr { .. } => Opcode::Removexattr,
            Request::Create { .. } => Opcode::Create,
            Request::Ioctl { .. } => Opcode::Ioctl,
            Request::Exchange { .. } => Opcode::Exchange,
        }
    }
}

/// Typed reply bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Empty,
    Entry(EntryOut),
    Attr(AttrOut),
    Open(OpenOut),
    Write(WriteOut),
    /// Raw payload of READ, READLINK, and sized GETXATTR / LISTXATTR.
    Data(Bytes),
    Dirents(Vec<Dirent>),
    XattrSize(XattrSizeOut),
    Create { entry: EntryOut, open: OpenOut },
    Ioctl { out_data: Bytes },
    Init(InitOut),
}

macro_rules! reply_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        /// Borrow this reply as the expected body, or `EIO` on a protocol
        /// violation.
        pub fn $fn_name(&self) -> OpResult<&$ty> {
            match self {
                Reply::$variant(inner) => Ok(inner),
                _ => Err(Errno::EIO),
            }
        }
    };
}

impl Reply {
    reply_accessor!(entry, Entry, EntryOut);
    reply_accessor!(attr, Attr, AttrOut);
    reply_accessor!(open, Open, OpenOut);
    reply_accessor!(write, Write, WriteOut);
    reply_accessor!(data, Data, Bytes);
    reply_accessor!(dirents, Dirents, Vec<Dirent>);
    reply_accessor!(xattr_size, XattrSize, XattrSizeOut);
    reply_accessor!(init, Init, InitOut);

    pub fn created(&self) -> OpResult<(&EntryOut, &OpenOut)> {
        match self {
            Reply::Create { entry, open } => Ok((entry, open)),
            _ => Err(Errno::EIO),
        }
    }

    pub fn ioctl_out(&self) -> OpResult<&Bytes> {
        match self {
            Reply::Ioctl { out_data } => Ok(out_data),
            _ => Err(Errno::EIO),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
