//! Page-cache and cluster-layer collaborator traits.
//!
//! The unified buffer cache belongs to the host and is mutated only through
//! these entry points; the bridge never touches page contents directly. The
//! cluster layer performs buffered reads/writes and page I/O against the
//! cached file size the dispatcher passes in.

use bitflags::bitflags;

use crate::errno::{Errno, OpResult};
use crate::host::{IoFlags, Uio};

/// One vnode's window into the unified buffer cache.
pub trait PageCache: Send + Sync {
    /// Current UBC size for the vnode.
    fn size(&self) -> u64;

    /// Resize the UBC view (truncate/extend).
    fn set_size(&self, size: u64);

    /// Whether dirty blocks are queued for this vnode.
    fn has_dirty(&self) -> bool;

    /// Push dirty blocks to the backing store, synchronously if asked.
    fn push_dirty(&self, flags: IoFlags);

    /// Push everything and drop the cached pages.
    fn flush_and_invalidate(&self);

    /// Disable caching of this vnode's pages.
    fn set_nocache(&self, on: bool);

    /// Disable read-ahead for this vnode.
    fn set_noreadahead(&self, on: bool);
}

/// Buffered I/O through the host cluster layer.
pub trait ClusterIo: Send + Sync {
    fn read(
        &self,
        ubc: &dyn PageCache,
        uio: &mut Uio,
        filesize: u64,
        flags: IoFlags,
    ) -> OpResult<()>;

    /// `old_eof`/`new_eof` bracket a possible extension; bytes between
    /// `zero_from` and the write offset are zero-filled when
    /// [`IoFlags::HEADZEROFILL`] is set.
    fn write(
        &self,
        ubc: &dyn PageCache,
        uio: &mut Uio,
        old_eof: u64,
        new_eof: u64,
        zero_from: u64,
        flags: IoFlags,
    ) -> OpResult<()>;

    fn pagein(
        &self,
        ubc: &dyn PageCache,
        pages: &mut PageList,
        offset: u64,
        size: usize,
        filesize: u64,
    ) -> OpResult<()>;

    fn pageout(
        &self,
        ubc: &dyn PageCache,
        pages: &mut PageList,
        offset: u64,
        size: usize,
        filesize: u64,
    ) -> OpResult<()>;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageListFlags: u32 {
        /// The caller will commit or abort the pages itself.
        const NOCOMMIT = 1 << 0;
    }
}

/// Outcome recorded on a page list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageListStatus {
    Pending,
    Committed,
    Aborted,
}

/// A run of pages handed to pagein/pageout by the pager.
#[derive(Debug)]
pub struct PageList {
    pub flags: PageListFlags,
    status: PageListStatus,
}

impl PageList {
    #[must_use]
    pub fn new(flags: PageListFlags) -> Self {
        PageList {
            flags,
            status: PageListStatus::Pending,
        }
    }

    /// Abort the run; the pager reports an error for these pages.
    pub fn abort(&mut self) {
        self.status = PageListStatus::Aborted;
    }

    pub fn commit(&mut self) {
        self.status = PageListStatus::Committed;
    }

    #[must_use]
    pub fn status(&self) -> PageListStatus {
        self.status
    }
}

/// Direction of a strategy buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufKind {
    Read,
    Write,
}

/// A block-aligned kernel buffer passed to the strategy entry point.
#[derive(Debug)]
pub struct Buf {
    pub kind: BufKind,
    /// Logical block number; byte offset is `lblkno * blocksize`.
    pub lblkno: u64,
    pub data: Vec<u8>,
    error: Option<Errno>,
    done: bool,
}

impl Buf {
    #[must_use]
    pub fn read(lblkno: u64, len: usize) -> Self {
        Buf {
            kind: BufKind::Read,
            lblkno,
            data: vec![0; len],
            error: None,
            done: false,
        }
    }

    #[must_use]
    pub fn write(lblkno: u64, data: Vec<u8>) -> Self {
        Buf {
            kind: BufKind::Write,
            lblkno,
            data,
            error: None,
            done: false,
        }
    }

    pub fn set_error(&mut self, err: Errno) {
        self.error = Some(err);
    }

    /// Complete the buffer; the host wakes whoever waits on it.
    pub fn biodone(&mut self) {
        self.done = true;
    }

    #[must_use]
    pub fn error(&self) -> Option<Errno> {
        self.error
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }
}
