//! Handle accounting: across a vnode's lifetime, every OPEN the daemon saw
//! is paired with exactly one RELEASE.

mod common;

use common::{cred, Fixture};
use relayfs::filehandle::{FFlags, MmapProt};
use relayfs::proto::Opcode;
use relayfs::vnops::ReaddirFlags;
use relayfs::MountOptions;

fn opens(fx: &Fixture) -> usize {
    fx.sent(Opcode::Open) + fx.sent(Opcode::Opendir) + fx.sent(Opcode::Create)
}

fn releases(fx: &Fixture) -> usize {
    fx.sent(Opcode::Release) + fx.sent(Opcode::Releasedir)
}

#[test]
fn open_close_coalesces_per_mode() {
    let fx = Fixture::new(MountOptions::empty());
    let vp = fx.lookup_file("f", 10, 0);
    let mut guard = fx.mount.enter_op();

    fx.dispatch.open(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    fx.dispatch.open(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    assert_eq!(fx.sent(Opcode::Open), 1, "second open reuses the slot");

    fx.dispatch.close(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    assert_eq!(fx.sent(Opcode::Release), 0, "slot still in use");
    fx.dispatch.close(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    assert_eq!(fx.sent(Opcode::Release), 1);

    assert_eq!(opens(&fx), releases(&fx));
}

#[test]
fn modes_use_separate_slots() {
    let fx = Fixture::new(MountOptions::empty());
    let vp = fx.lookup_file("f", 11, 0);
    let mut guard = fx.mount.enter_op();

    fx.dispatch.open(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    fx.dispatch.open(&mut guard, &vp, FFlags::WRITE, &cred()).unwrap();
    fx.dispatch
        .open(&mut guard, &vp, FFlags::READ | FFlags::WRITE, &cred())
        .unwrap();
    assert_eq!(fx.sent(Opcode::Open), 3);

    fx.dispatch.close(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    fx.dispatch.close(&mut guard, &vp, FFlags::WRITE, &cred()).unwrap();
    fx.dispatch
        .close(&mut guard, &vp, FFlags::READ | FFlags::WRITE, &cred())
        .unwrap();
    assert_eq!(fx.sent(Opcode::Release), 3);
    assert_eq!(opens(&fx), releases(&fx));
}

#[test]
fn close_on_invalid_slot_is_a_successful_noop() {
    let fx = Fixture::new(MountOptions::empty());
    let vp = fx.lookup_file("f", 12, 0);
    let mut guard = fx.mount.enter_op();

    fx.dispatch.close(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    assert_eq!(fx.sent(Opcode::Release), 0);
    assert_eq!(fx.sent(Opcode::Flush), 0);
}

#[test]
fn readdir_pairs_opendir_with_releasedir() {
    let fx = Fixture::new(MountOptions::empty());
    let dir = fx.lookup_dir("d", 13);
    let mut guard = fx.mount.enter_op();

    fx.dispatch.readdir(&mut guard, &dir, 0, 4096, ReaddirFlags::empty(), &cred()).unwrap();
    fx.dispatch.readdir(&mut guard, &dir, 0, 4096, ReaddirFlags::empty(), &cred()).unwrap();

    assert_eq!(fx.sent(Opcode::Opendir), fx.sent(Opcode::Releasedir));
    assert!(fx.sent(Opcode::Opendir) >= 1);
}

#[test]
fn mmap_handle_released_at_inactive() {
    let fx = Fixture::new(MountOptions::empty());
    let vp = fx.lookup_file("f", 14, 0);
    let mut guard = fx.mount.enter_op();

    fx.dispatch.mmap(&mut guard, &vp, MmapProt::READ, &cred()).unwrap();
    assert_eq!(fx.sent(Opcode::Open), 1);
    assert_eq!(fx.sent(Opcode::Release), 0);

    fx.dispatch.inactive(&mut guard, &vp, &cred()).unwrap();
    assert_eq!(fx.sent(Opcode::Release), 1);
    assert!(vp.state().handles.valid_modes().is_empty());
}

#[test]
fn reclaim_releases_every_valid_slot() {
    let fx = Fixture::new(MountOptions::empty());
    let vp = fx.lookup_file("f", 15, 0);
    let mut guard = fx.mount.enter_op();

    fx.dispatch.open(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    fx.dispatch
        .open(&mut guard, &vp, FFlags::READ | FFlags::WRITE, &cred())
        .unwrap();
    fx.dispatch.reclaim(&mut guard, &vp, &cred(), false).unwrap();

    assert_eq!(opens(&fx), releases(&fx));
    assert!(vp.state().handles.valid_modes().is_empty());
    assert!(fx.mount.node_by_id(vp.id).is_none());
}

#[test]
fn create_stash_is_claimed_by_the_first_open() {
    let fx = Fixture::new(MountOptions::empty());
    let root = fx.mount.root();
    let mut guard = fx.mount.enter_op();

    let vp = fx
        .dispatch
        .create(
            &mut guard,
            &root,
            std::ffi::OsStr::new("n"),
            0o644,
            relayfs::VnodeType::Regular,
            &cred(),
        )
        .unwrap();
    assert_eq!(fx.sent(Opcode::Create), 1);

    // The open that follows the create claims the parked handle.
    fx.dispatch.open(&mut guard, &vp, FFlags::WRITE, &cred()).unwrap();
    assert_eq!(fx.sent(Opcode::Open), 0, "create's handle was claimed");

    fx.dispatch.close(&mut guard, &vp, FFlags::WRITE, &cred()).unwrap();
    assert_eq!(fx.sent(Opcode::Release), 1);
    assert_eq!(opens(&fx), releases(&fx));
}

#[test]
fn handle_reuse_is_counted() {
    let fx = Fixture::new(MountOptions::empty());
    let vp = fx.lookup_file("f", 16, 0);
    let mut guard = fx.mount.enter_op();

    fx.dispatch.open(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    fx.dispatch.open(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    fx.dispatch.open(&mut guard, &vp, FFlags::READ, &cred()).unwrap();
    assert_eq!(fx.mount.stats.fh_reuse.get(), 2);
    assert_eq!(fx.mount.stats.fh_current.get(), 1);
}
