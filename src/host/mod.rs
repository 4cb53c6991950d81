//! Collaborator surface of the host VFS.
//!
//! The kernel around us supplies credentials, scatter/gather buffers, the
//! unified buffer cache, the cluster I/O layer, and vnode allocation. The
//! dispatcher only ever touches these through the types and traits here, so
//! the whole engine is drivable from tests with scripted doubles.

pub mod namecache;
pub mod pagecache;

pub use namecache::{CacheOutcome, NameCache};
pub use pagecache::{Buf, BufKind, ClusterIo, PageCache, PageList, PageListFlags, PageListStatus};

use std::sync::Arc;

use bitflags::bitflags;

use crate::errno::OpResult;
use crate::node::{NodeId, VnodeType};

/// Identity of the thread entering a vnode op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl Credentials {
    #[must_use]
    pub fn is_superuser(&self) -> bool {
        self.uid == 0
    }
}

/// Rights requested from the host authorization layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthAction {
    pub read: bool,
    pub write: bool,
}

bitflags! {
    /// Per-call I/O modifiers handed down by the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoFlags: u32 {
        const APPEND       = 1 << 0;
        const SYNC         = 1 << 1;
        const NOCACHE      = 1 << 2;
        /// All-or-nothing semantics: on error the uio is restored.
        const UNIT         = 1 << 3;
        const CLOSE        = 1 << 4;
        const HEADZEROFILL = 1 << 5;
    }
}

/// What the host kernel does for us.
pub trait HostVfs: Send + Sync {
    /// Allocate the host half of a new vnode and hand back its page-cache
    /// window. May fail under memory pressure; callers compensate.
    fn allocate_vnode(&self, id: NodeId, vtype: VnodeType) -> OpResult<Arc<dyn PageCache>>;

    /// The cluster read/write/page layer.
    fn cluster(&self) -> &dyn ClusterIo;

    /// Host-side access check, used to preflight opens.
    fn authorize(&self, node: NodeId, action: AuthAction, cred: &Credentials) -> OpResult<()>;

    /// Whether the host still holds usable references on the vnode. Drives
    /// the no-delete-busy semantics of remove.
    fn vnode_in_use(&self, node: NodeId) -> bool {
        let _ = node;
        false
    }
}

/// Scatter/gather buffer crossing the kernel/user boundary.
///
/// A `Uio` is either a *source* (data flowing from the caller into the
/// filesystem, i.e. write-shaped) or a *sink* (read-shaped). The file
/// position is signed, as the host's `off_t` is: callers can and do hand
/// down negative offsets, and the read/write handlers reject them rather
/// than letting them near the protocol. `mark`/`restore` implement the
/// unit-semantics rollback that failed writes need.
#[derive(Debug)]
pub struct Uio {
    dir: UioDir,
    buf: Vec<u8>,
    /// Sink capacity; unused for sources.
    cap: usize,
    /// Source cursor; sinks never advance it.
    pos: usize,
    offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UioDir {
    Source,
    Sink,
}

/// Saved cursor state for rollback.
#[derive(Debug, Clone, Copy)]
pub struct UioMark {
    pos: usize,
    offset: i64,
    filled: usize,
}

impl Uio {
    /// A source carrying `data`, positioned at `offset`.
    #[must_use]
    pub fn write_from(data: impl Into<Vec<u8>>, offset: i64) -> Self {
        Uio {
            dir: UioDir::Source,
            buf: data.into(),
            cap: 0,
            pos: 0,
            offset,
        }
    }

    /// A sink accepting up to `cap` bytes, positioned at `offset`.
    #[must_use]
    pub fn read_into(cap: usize, offset: i64) -> Self {
        Uio {
            dir: UioDir::Sink,
            buf: Vec::new(),
            cap,
            pos: 0,
            offset,
        }
    }

    /// Bytes left to transfer.
    #[must_use]
    pub fn resid(&self) -> usize {
        match self.dir {
            UioDir::Source => self.buf.len() - self.pos,
            UioDir::Sink => self.cap.saturating_sub(self.buf.len()),
        }
    }

    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: i64) {
        self.offset = offset;
    }

    /// Consume up to `max` bytes from a source, advancing the file offset.
    pub fn move_out(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.buf.len() - self.pos);
        let chunk = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        self.offset += n as i64;
        chunk
    }

    /// Copy bytes into a sink, advancing the file offset. Returns how many
    /// were accepted.
    pub fn move_in(&mut self, src: &[u8]) -> usize {
        let room = self.cap.saturating_sub(self.buf.len());
        let n = room.min(src.len());
        self.buf.extend_from_slice(&src[..n]);
        self.offset += n as i64;
        n
    }

    /// Un-consume `n` source bytes (short write at the daemon).
    pub fn rewind(&mut self, n: usize) {
        let n = n.min(self.pos);
        self.pos -= n;
        self.offset -= n as i64;
    }

    #[must_use]
    pub fn mark(&self) -> UioMark {
        UioMark {
            pos: self.pos,
            offset: self.offset,
            filled: self.buf.len(),
        }
    }

    /// Roll the cursor back to `mark`. Sink contents past the mark are
    /// discarded.
    pub fn restore(&mut self, mark: UioMark) {
        self.pos = mark.pos;
        self.offset = mark.offset;
        if self.dir == UioDir::Sink {
            self.buf.truncate(mark.filled);
        }
    }

    /// Bytes accumulated in a sink.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_consume_and_rewind() {
        let mut uio = Uio::write_from(vec![1u8, 2, 3, 4, 5], 100);
        assert_eq!(uio.resid(), 5);

        let chunk = uio.move_out(3);
        assert_eq!(chunk, vec![1, 2, 3]);
        assert_eq!(uio.resid(), 2);
        assert_eq!(uio.offset(), 103);

        uio.rewind(1);
        assert_eq!(uio.resid(), 3);
        assert_eq!(uio.offset(), 102);
        assert_eq!(uio.move_out(10), vec![3, 4, 5]);
    }

    #[test]
    fn sink_fill_and_restore() {
        let mut uio = Uio::read_into(4, 0);
        assert_eq!(uio.resid(), 4);

        let mark = uio.mark();
        assert_eq!(uio.move_in(&[9, 9, 9]), 3);
        assert_eq!(uio.resid(), 1);
        assert_eq!(uio.move_in(&[9, 9]), 1);
        assert_eq!(uio.resid(), 0);

        uio.restore(mark);
        assert_eq!(uio.resid(), 4);
        assert!(uio.data().is_empty());
    }

    #[test]
    fn unit_rollback_roundtrip() {
        let mut uio = Uio::write_from(vec![0u8; 16], 8);
        let mark = uio.mark();
        uio.move_out(16);
        uio.restore(mark);
        assert_eq!(uio.resid(), 16);
        assert_eq!(uio.offset(), 8);
    }

    #[test]
    fn negative_offsets_are_representable() {
        // The host's off_t is signed; rejection is the handlers' job.
        let uio = Uio::write_from(vec![1u8; 4], -3);
        assert_eq!(uio.offset(), -3);
        let uio = Uio::read_into(4, -1);
        assert_eq!(uio.offset(), -1);
    }
}
