//! Shared fixture: a relayfs mount wired to a scripted daemon and host
//! doubles that record everything the engine does to them.

#![allow(dead_code)]

pub mod daemon_mocks;
pub mod host_mocks;

pub use daemon_mocks::MockDaemon;
pub use host_mocks::{MockCluster, MockHost, TestPageCache};

use std::ffi::OsStr;
use std::sync::{Arc, Once};

use relayfs::host::Credentials;
use relayfs::proto::Opcode;
use relayfs::vnops::{LookupIntent, LookupStatus};
use relayfs::{Dispatch, Mount, MountConfig, MountOptions, NodeId, Vnode};

/// Install a subscriber once per test binary so `RUST_LOG=trace` surfaces
/// the dispatcher's spans when a test goes sideways.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Credentials of the user the daemon runs as; passes the blanket check.
pub fn cred() -> Credentials {
    Credentials {
        uid: 501,
        gid: 20,
        pid: 1000,
    }
}

/// Somebody else entirely.
pub fn stranger() -> Credentials {
    Credentials {
        uid: 777,
        gid: 777,
        pid: 2000,
    }
}

pub struct Fixture {
    pub mount: Arc<Mount>,
    pub dispatch: Dispatch,
    pub daemon: Arc<MockDaemon>,
    pub host: Arc<MockHost>,
}

impl Fixture {
    /// Mount with `options` and run the INIT handshake.
    pub fn new(options: MountOptions) -> Fixture {
        Fixture::with_config(MountConfig {
            options,
            daemon_credentials: cred(),
            ..MountConfig::default()
        })
    }

    pub fn with_config(config: MountConfig) -> Fixture {
        init_tracing();
        let daemon = Arc::new(MockDaemon::new());
        let host = Arc::new(MockHost::new());
        let mount = Mount::new(config, daemon.clone(), host.clone()).expect("mount");
        {
            let mut guard = mount.enter_op();
            mount
                .init_handshake(&mut guard, &cred())
                .expect("init handshake");
        }
        daemon.clear_log();
        Fixture {
            dispatch: Dispatch::new(Arc::clone(&mount)),
            mount,
            daemon,
            host,
        }
    }

    /// Mount without running INIT; the mount stays `Uninitialized`.
    pub fn uninitialized(options: MountOptions) -> Fixture {
        init_tracing();
        let daemon = Arc::new(MockDaemon::new());
        let host = Arc::new(MockHost::new());
        let config = MountConfig {
            options,
            daemon_credentials: cred(),
            ..MountConfig::default()
        };
        let mount = Mount::new(config, daemon.clone(), host.clone()).expect("mount");
        Fixture {
            dispatch: Dispatch::new(Arc::clone(&mount)),
            mount,
            daemon,
            host,
        }
    }

    /// Register `name` under the root and resolve it to a vnode.
    pub fn lookup_file(&self, name: &str, ino: u64, size: u64) -> Arc<Vnode> {
        self.daemon
            .add_file(relayfs::ROOT_ID, name, NodeId(ino), size);
        self.resolve(name)
    }

    /// Register a directory under the root and resolve it.
    pub fn lookup_dir(&self, name: &str, ino: u64) -> Arc<Vnode> {
        self.daemon.add_dir(relayfs::ROOT_ID, name, NodeId(ino));
        self.resolve(name)
    }

    /// Plain last-component lookup from the root; panics on a miss.
    pub fn resolve(&self, name: &str) -> Arc<Vnode> {
        let root = self.mount.root();
        let mut guard = self.mount.enter_op();
        match self
            .dispatch
            .lookup(
                &mut guard,
                &root,
                OsStr::new(name),
                LookupIntent::Lookup,
                true,
                &cred(),
            )
            .expect("lookup")
        {
            LookupStatus::Found(vp) => vp,
            LookupStatus::JustReturn => panic!("unexpected just-return for {name}"),
        }
    }

    pub fn sent(&self, op: Opcode) -> usize {
        self.daemon.count(op)
    }
}
