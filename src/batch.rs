//! Callback enqueue and invocation.
//!
//! 回调入队与调用。

use crate::config::TIME_CHECKED_BATCH;
use crate::cpu::{CpuData, CpuGuard, InvokeClaim};
use crate::segcblist::{Callback, DONE, NEXT_READY};
use crate::state::RcuState;
use crate::stats::Stats;
use crate::sync::{Arc, Ordering};
use crate::tree::NodeGuard;
use std::time::Instant;

/// How long one invocation pass may run.
/// 一次调用过程可以运行多久。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Budget {
    /// Inline at a processor checkpoint: the batch limit and the time limit.
    Checkpoint,
    /// On a helper thread: the time limit only.
    Helper,
    /// Until `DONE` is empty.
    Unbounded,
}

impl RcuState {
    /// Queue `cb` on `rdp` and request the grace period it needs.
    ///
    /// 将 `cb` 排入 `rdp` 并请求其所需的宽限期。
    pub(crate) fn enqueue_callback(&self, rdp: &CpuData, cb: Callback) {
        let mut local = rdp.lock();
        local.cblist.enqueue(cb);
        Stats::bump(&self.stats.cbs_queued);

        // Retire finished segments first so the new callback finds a free one.
        self.note_gp_changes(&mut local);
        self.accelerate_cbs_unlocked(&mut local);
        self.call_rcu_core(&mut local);

        let len = local.cblist.len();
        let offloaded = rdp.is_offloaded();
        drop(local);
        self.check_cb_ovld(rdp, len);
        if offloaded {
            rdp.kick();
        }
    }

    /// React to a processor flooding itself with callbacks.
    /// 对处理器被回调淹没的情况做出反应。
    fn call_rcu_core(&self, local: &mut CpuGuard<'_>) {
        let len = local.cblist.len();
        if len <= local.qlen_last_fqs_check + self.tun.qhimark {
            return;
        }

        self.note_gp_changes(local);
        if !self.gp_in_progress() {
            self.accelerate_cbs_unlocked(local);
            return;
        }

        Stats::bump(&self.stats.overloads);
        local.blimit = self.tun.max_blimit;
        let n_force_qs = self.n_force_qs.load(Ordering::Acquire);
        if local.n_force_qs_snap == n_force_qs && local.cblist.pend_len() > 1 {
            log::debug!(
                "processor {} holds {len} callbacks, forcing quiescent states",
                local.rdp.cpu
            );
            self.force_quiescent_state(local.rdp.leaf);
        }
        local.n_force_qs_snap = self.n_force_qs.load(Ordering::Acquire);
        local.qlen_last_fqs_check = len;
    }

    /// Track whether `rdp` is above the overload threshold in its leaf.
    pub(crate) fn check_cb_ovld(&self, rdp: &CpuData, len: usize) {
        if self.tun.qovld == 0 {
            return;
        }
        let leaf = self.tree.node(rdp.leaf);
        let over = len >= self.tun.qovld;
        if over == (leaf.cbovldmask() & rdp.grpmask != 0) {
            return;
        }
        let mut guard = leaf.lock();
        self.check_cb_ovld_locked(rdp, len, &mut guard);
    }

    pub(crate) fn check_cb_ovld_locked(&self, rdp: &CpuData, len: usize, guard: &mut NodeGuard<'_>) {
        if self.tun.qovld == 0 {
            return;
        }
        let mask = guard.cbovldmask();
        if len >= self.tun.qovld {
            guard.set_cbovldmask(mask | rdp.grpmask);
        } else {
            guard.set_cbovldmask(mask & !rdp.grpmask);
        }
    }

    /// Per-processor callback work: report a pending quiescent state, make
    /// sure waiting callbacks have a grace period, and invoke ready ones.
    /// Returns `true` if ready callbacks remain.
    ///
    /// 每处理器的回调工作：报告待处理的静止状态，确保等待中的回调有宽限期，并调用就绪的回调。
    /// 若仍有就绪回调则返回 `true`。
    pub(crate) fn rcu_core(&self, rdp: &CpuData, budget: Budget) -> bool {
        if !self.is_online(rdp.cpu) {
            return false;
        }
        {
            let mut local = rdp.lock();
            self.check_quiescent_state(&mut local);
            if !self.gp_in_progress() && !rdp.is_offloaded() && !local.cblist.restempty(NEXT_READY) {
                self.accelerate_cbs_unlocked(&mut local);
            }
        }
        if rdp.is_offloaded() {
            return false;
        }
        match rdp.try_claim_invoke() {
            Some(claim) => self.do_batch(rdp, &claim, budget).1,
            None => false,
        }
    }

    /// Invoke ready callbacks of `rdp` within `budget`.
    /// Returns how many ran and whether ready callbacks remain.
    ///
    /// 在 `budget` 内调用 `rdp` 的就绪回调。返回运行的数量以及是否仍有就绪回调。
    pub(crate) fn do_batch(&self, rdp: &CpuData, _claim: &InvokeClaim<'_>, budget: Budget) -> (usize, bool) {
        let (mut rcl, bl) = {
            let mut local = rdp.lock();
            if !local.cblist.ready_cbs() {
                return (0, false);
            }
            let pending = local.cblist.seg_len(DONE);
            let bl = local.blimit.max(pending >> self.tun.divisor);
            (local.cblist.extract_done(), bl)
        };

        let tlimit = (budget != Budget::Unbounded && bl > TIME_CHECKED_BATCH)
            .then(|| Instant::now() + self.tun.batch_time_limit);
        let mut count = 0;
        while let Some(cb) = rcl.pop_front() {
            cb.invoke();
            count += 1;
            if budget == Budget::Checkpoint && count >= bl {
                break;
            }
            if count & 31 == 0 && tlimit.is_some_and(|tlimit| Instant::now() >= tlimit) {
                break;
            }
        }

        let mut local = rdp.lock();
        local.cblist.insert_done(rcl);
        local.cblist.sub_len(count);
        Stats::add(&self.stats.cbs_invoked, count);

        let len = local.cblist.len();
        if local.blimit >= self.tun.max_blimit && len <= self.tun.qlowmark {
            local.blimit = self.tun.blimit;
        }
        if len == 0 && local.qlen_last_fqs_check != 0 {
            local.qlen_last_fqs_check = 0;
            local.n_force_qs_snap = self.n_force_qs.load(Ordering::Acquire);
        } else if len < local.qlen_last_fqs_check.saturating_sub(self.tun.qhimark) {
            local.qlen_last_fqs_check = len;
        }
        let more = local.cblist.ready_cbs();
        drop(local);

        if count > 0 {
            log::trace!("processor {} invoked {count} callbacks, {len} left", rdp.cpu);
        }
        self.check_cb_ovld(rdp, len);
        (count, more)
    }

    /// Invoke every callback of `rdp` whose grace period has completed.
    /// With `wait`, blocks until any concurrent invoker is done.
    ///
    /// 调用 `rdp` 中所有宽限期已完成的回调。若 `wait` 为真，则阻塞直到并发的调用者结束。
    pub(crate) fn drain_ready(&self, rdp: &CpuData, wait: bool) -> usize {
        if rdp.n_cbs() == 0 {
            return 0;
        }
        let claim = if wait {
            rdp.claim_invoke()
        } else {
            match rdp.try_claim_invoke() {
                Some(claim) => claim,
                None => return 0,
            }
        };
        {
            let mut local = rdp.lock();
            if rdp.is_offloaded() {
                let mut guard = self.tree.node(rdp.leaf).lock();
                let needwake = self.advance_cbs(&mut guard, &mut local);
                drop(guard);
                if needwake {
                    self.wake_gp_worker();
                }
            } else {
                self.note_gp_changes(&mut local);
            }
        }
        self.do_batch(rdp, &claim, Budget::Unbounded).0
    }

    /// Drain every processor that is not offloaded.
    pub(crate) fn drain_all(&self, wait: bool) -> usize {
        self.cpus
            .iter()
            .filter(|rdp| !rdp.is_offloaded())
            .map(|rdp| self.drain_ready(rdp, wait))
            .sum()
    }

    /// After a grace period: wake whoever invokes callbacks on processors that have some.
    /// 宽限期结束后：唤醒负责在有回调的处理器上调用回调的线程。
    pub(crate) fn kick_callbacks(&self) {
        for rdp in self.cpus.iter() {
            if rdp.n_cbs() > 0 && (self.helpers || rdp.is_offloaded()) {
                rdp.kick();
            }
        }
    }

    /// Body of a per-processor callback helper thread.
    /// 每处理器回调辅助线程的主体。
    pub(crate) fn callback_helper(self: Arc<Self>, cpu: usize) {
        let rdp = &self.cpus[cpu];
        log::debug!("callback helper for processor {cpu} running");
        while rdp.wait_for_work(None, || self.stopping(), || !rdp.is_offloaded()) {
            if self.rcu_core(rdp, Budget::Helper) {
                rdp.kick();
            }
        }
        log::debug!("callback helper for processor {cpu} stopped");
    }
}
