//! Processors coming online and going offline.
//!
//! A transition only edits the leaf's `qsmaskinitnext`; the next grace
//! period folds it into the masks it waits on. A processor going offline
//! first reports any quiescent state it owes and then hands its callbacks
//! to the lowest-numbered online processor.
//!
//! 处理器的上线与下线。
//! 状态转换只修改叶节点的 `qsmaskinitnext`；下一个宽限期会将其合入所等待的掩码。
//! 下线的处理器首先报告它所欠的静止状态，然后将其回调移交给编号最小的在线处理器。

use crate::cpu::{CpuData, lock_pair};
use crate::state::RcuState;
use crate::stats::Stats;
use crate::sync::Ordering;

impl RcuState {
    /// Bring processor `cpu` online. Returns `false` if it already was.
    /// 使处理器 `cpu` 上线。若其已在线则返回 `false`。
    pub(crate) fn cpu_online(&self, cpu: usize) -> bool {
        let _hotplug = self.hotplug_lock.lock();
        if self.is_online(cpu) {
            log::warn!("processor {cpu} is already online");
            return false;
        }
        let rdp = &self.cpus[cpu];
        let leaf = self.tree.node(rdp.leaf);

        // Start from the leaf's current view, owing nothing yet.
        {
            let mut local = rdp.lock();
            let guard = leaf.lock();
            local.set_gp_seq(guard.gp_seq());
            rdp.set_gp_seq_needed(guard.gp_seq());
            local.clear_gpwrap();
            local.cpu_no_qs = true;
            local.core_needs_qs = false;
            local.blimit = self.tun.blimit;
            local.qlen_last_fqs_check = 0;
            local.n_force_qs_snap = self.n_force_qs.load(Ordering::Acquire);
        }

        let _ofl = self.ofl_lock.lock();
        let barrier = self.barrier.lock.lock();
        let mut guard = leaf.lock();
        let mask = guard.qsmaskinitnext() | rdp.grpmask;
        guard.set_qsmaskinitnext(mask);
        drop(barrier);
        self.gpnum_ovf(rdp, guard.gp_seq());
        self.n_online.fetch_add(1, Ordering::AcqRel);
        log::info!("processor {cpu} online");

        if guard.qsmask() & rdp.grpmask != 0 {
            // Cannot happen: an offline processor is never waited on.
            self.anomaly(format_args!("processor {cpu} owed a quiescent state while offline"));
            self.disable_urgency(rdp);
            let gps = guard.gp_seq();
            self.report_qs_rnp(rdp.grpmask, guard, gps);
        }
        true
    }

    /// Take processor `cpu` offline. Returns `false` if it already was, or if
    /// it is the last one online.
    ///
    /// 使处理器 `cpu` 下线。若其已下线或是最后一个在线处理器则返回 `false`。
    pub(crate) fn cpu_offline(&self, cpu: usize) -> bool {
        let _hotplug = self.hotplug_lock.lock();
        if !self.is_online(cpu) {
            log::warn!("processor {cpu} is already offline");
            return false;
        }
        if self.n_online.load(Ordering::Acquire) <= 1 {
            log::warn!("refusing to take processor {cpu} offline: it is the last one online");
            return false;
        }
        let rdp = &self.cpus[cpu];
        let leaf = self.tree.node(rdp.leaf);
        {
            let _ofl = self.ofl_lock.lock();
            let mut guard = leaf.lock();
            if guard.qsmask() & rdp.grpmask != 0 {
                // Report the quiescent state this processor would have owed.
                self.disable_urgency(rdp);
                Stats::bump(&self.stats.offline_credits);
                let gps = guard.gp_seq();
                self.report_qs_rnp(rdp.grpmask, guard, gps);
                guard = leaf.lock();
            }
            let mask = guard.qsmaskinitnext() & !rdp.grpmask;
            guard.set_qsmaskinitnext(mask);
        }
        self.n_online.fetch_sub(1, Ordering::AcqRel);
        log::info!("processor {cpu} offline");

        self.migrate_callbacks(rdp);
        true
    }

    /// Hand the callbacks of offline `rdp` to the lowest-numbered online
    /// processor, keeping any barrier in progress accounted for.
    ///
    /// 将已下线的 `rdp` 的回调移交给编号最小的在线处理器，同时保持正在进行的屏障计数正确。
    fn migrate_callbacks(&self, rdp: &CpuData) {
        if rdp.is_offloaded() {
            return;
        }
        let Some(target) = self.first_online() else {
            self.anomaly(format_args!("no online processor to adopt callbacks"));
            return;
        };
        let target = &self.cpus[target];

        // An invoker working on `rdp` must finish before its list moves.
        let _claim = rdp.claim_invoke();
        let barrier = self.barrier.lock.lock();
        let (mut src, mut dst) = lock_pair(rdp, target);
        if src.cblist.len() == 0 {
            return;
        }
        self.barrier_entrain(&mut src);

        let mut guard = self.tree.node(target.leaf).lock();
        let mut needwake = self.advance_cbs(&mut guard, &mut src);
        needwake |= self.advance_cbs(&mut guard, &mut dst);
        let moved = src.cblist.len();
        dst.cblist.merge(&mut src.cblist);
        drop(barrier);
        needwake |= self.advance_cbs(&mut guard, &mut dst);
        let len = dst.cblist.len();
        self.check_cb_ovld_locked(target, len, &mut guard);
        let ready = dst.cblist.ready_cbs();
        drop(guard);
        drop(dst);
        drop(src);

        Stats::add(&self.stats.cbs_migrated, moved);
        log::debug!(
            "moved {moved} callbacks from processor {} to processor {}",
            rdp.cpu,
            target.cpu
        );
        if needwake {
            self.wake_gp_worker();
        }
        if ready || self.helpers {
            target.kick();
        }
    }
}
