//! Errno values crossing the upward (host VFS) boundary.
//!
//! Handlers return [`Errno`] rather than a structured error because the host
//! consumes raw errno codes. The one value that must never cross upward is
//! `ENOSYS`: it means "the daemon does not implement this operation" and is
//! always converted to a capability downgrade plus `ENOTSUP` (or swallowed
//! entirely) before a handler returns.

use std::fmt;

/// A raw errno as handed back to the host VFS.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

/// Result type of every vnode-op handler.
pub type OpResult<T> = Result<T, Errno>;

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(pub const $name: Errno = Errno(libc::$name);)*
        }

        impl fmt::Debug for Errno {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $(libc::$name => write!(f, stringify!($name)),)*
                    other => write!(f, "Errno({other})"),
                }
            }
        }
    };
}

errno_consts!(
    EPERM, ENOENT, EINTR, EIO, ENXIO, E2BIG, EBADF, EAGAIN, EACCES, EBUSY,
    EEXIST, EXDEV, ENODEV, ENOTDIR, EISDIR, EINVAL, EFBIG, EROFS, EMLINK,
    ERANGE, ENAMETOOLONG, ENOSYS, ENOTSUP, ENOTCONN,
);

impl Errno {
    /// The raw value handed to the host.
    #[must_use]
    pub fn raw(self) -> i32 {
        self.0
    }

    #[must_use]
    pub fn is_enosys(self) -> bool {
        self == Errno::ENOSYS
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<Errno> for i32 {
    fn from(e: Errno) -> Self {
        e.0
    }
}
