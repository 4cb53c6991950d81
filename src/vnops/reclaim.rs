//! End-of-life ops: inactive and reclaim.

use std::sync::Arc;

use tracing::instrument;

use crate::biglock::OpGuard;
use crate::errno::OpResult;
use crate::filehandle;
use crate::host::Credentials;
use crate::node::Vnode;
use crate::proto::Request;

use super::Dispatch;

impl Dispatch {
    /// inactive: the host dropped its last use; zombie handles from
    /// open-mmap-close sequences get released here.
    #[instrument(name = "vnop::inactive", skip(self, guard, vp, cred), fields(node = vp.id.0))]
    pub fn inactive(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        cred: &Credentials,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        let modes = vp.state().handles.valid_modes();
        for mode in modes {
            let _ = filehandle::handle_release_slot(&mount, guard, vp, cred, mode);
        }
        Ok(())
    }

    /// reclaim: release every valid slot, repay the lookup count with one
    /// FORGET, and unhook the node. Best-effort by contract; the host will
    /// not accept a failure here.
    #[instrument(name = "vnop::reclaim", skip(self, guard, vp, cred), fields(node = vp.id.0))]
    pub fn reclaim(
        &self,
        guard: &mut OpGuard<'_>,
        vp: &Arc<Vnode>,
        cred: &Credentials,
        forced: bool,
    ) -> OpResult<()> {
        let mount = self.mount().clone();
        let dead = mount.is_dead();

        let modes = vp.state().handles.valid_modes();
        for mode in modes {
            if !forced && !dead {
                // Valid handles at reclaim time without a forced unmount
                // come from open-mmap-close-pagein chains.
                mount.stats.fh_zombies.bump();
            }
            let _ = filehandle::handle_release_slot(&mount, guard, vp, cred, mode);
        }

        let nlookup = {
            let mut state = vp.state();
            std::mem::take(&mut state.nlookup)
        };
        if nlookup > 0 && !dead {
            mount.send_and_forget(vp.id, Request::Forget { nlookup });
        }

        guard.suspend(|| mount.namecache.purge(vp));
        mount.remove_node(vp.id);
        mount.stats.vnodes_current.drop_one();
        Ok(())
    }
}
