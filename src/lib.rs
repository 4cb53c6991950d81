//! relayfs: the vnode-operation layer of a userspace-filesystem bridge.
//!
//! This crate is the seam between a preemptive kernel with strict VFS
//! contracts and an untrusted userspace daemon that may be slow, buggy, or
//! gone. Host VFS upcalls enter through [`vnops::Dispatch`], are translated
//! into protocol round trips over a [`transport::Transport`], and the
//! replies flow back out as VFS semantics, with the attribute cache, the
//! name-lookup bridge, the per-vnode file-handle table, and the per-mount
//! capability table mediating along the way.

pub mod attrcache;
pub mod biglock;
pub mod caps;
pub mod errno;
pub mod filehandle;
pub mod host;
pub mod mount;
pub mod node;
pub mod proto;
pub mod ticket;
pub mod transport;
pub mod vnops;

pub use errno::{Errno, OpResult};
pub use mount::{Mount, MountConfig, MountOptions, MountPhase};
pub use node::{NodeId, Vnode, VnodeType, NULL_ID, ROOT_ID};
pub use vnops::{Dispatch, LookupIntent, LookupStatus};
