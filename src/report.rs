//! Quiescent-state reporting and grace-period requests.
//!
//! Reports travel leaf to root: a processor clears its bit in its leaf, the
//! last child of a node clears the node's bit in its parent, and the last
//! report at the root ends the grace period. Requests travel the same way
//! and stop at the first node that already knows about them.
//!
//! 静止状态报告与宽限期请求。
//! 报告从叶到根传播：处理器清除其在叶节点中的位，节点的最后一个子节点清除该节点在父节点中的位，
//! 根节点上的最后一次报告结束宽限期。请求以同样的方式传播，并在第一个已知晓该请求的节点处停止。

use crate::cpu::{CpuData, CpuGuard};
use crate::seq;
use crate::state::{GP_FLAG_FQS, GP_FLAG_INIT, RcuState};
use crate::stats::Stats;
use crate::sync::Ordering;
use crate::tree::NodeGuard;

impl RcuState {
    /// Clear `mask` in the node held by `guard` for grace period `gps`, and
    /// keep walking up while nodes become fully quiescent. Ending at the root
    /// wakes the worker to clean up the grace period.
    ///
    /// Stale reports (another grace period, or bits already clear) are dropped.
    ///
    /// 为宽限期 `gps` 清除 `guard` 所持节点中的 `mask`，并在节点完全静止时继续向上传播。
    /// 到达根节点时唤醒工作线程来清理宽限期。过期的报告（其他宽限期或已清除的位）会被丢弃。
    pub(crate) fn report_qs_rnp<'a>(&'a self, mut mask: usize, mut guard: NodeGuard<'a>, gps: usize) {
        loop {
            if (guard.qsmask() & mask == 0 && mask != 0) || guard.gp_seq() != gps {
                return;
            }
            debug_assert!(
                seq::in_progress(gps),
                "BUG: reporting a quiescent state for idle sequence {gps:#x}"
            );
            let qsmask = guard.qsmask() & !mask;
            guard.set_qsmask(qsmask);
            log::trace!(
                "node {} (level {}) cleared {mask:#x} for gp {}, {qsmask:#x} outstanding",
                guard.node.index,
                guard.node.level,
                seq::gp_num(gps)
            );
            if qsmask != 0 {
                return;
            }
            guard.completedqs = gps;
            mask = guard.node.grpmask;
            match self.tree.parent(guard.node) {
                None => break,
                Some(parent) => {
                    drop(guard);
                    guard = parent.lock();
                }
            }
        }

        // The root is fully quiescent: hand the grace period to cleanup.
        self.gp_flags.fetch_or(GP_FLAG_FQS, Ordering::AcqRel);
        drop(guard);
        self.gp_wq.wake_all();
    }

    /// Report this processor's quiescent state if it is still owed for the
    /// grace period it last noted.
    ///
    /// 如果本处理器仍欠其最近记录的宽限期一个静止状态，则报告之。
    pub(crate) fn report_qs_rdp(&self, local: &mut CpuGuard<'_>) {
        let rdp = local.rdp;
        let mut guard = self.tree.node(rdp.leaf).lock();
        if local.cpu_no_qs || rdp.gp_seq() != guard.gp_seq() || rdp.gpwrap() {
            // The quiescent state predates the current grace period.
            local.cpu_no_qs = true;
            return;
        }
        local.core_needs_qs = false;
        if guard.qsmask() & rdp.grpmask == 0 {
            return;
        }
        // Callbacks queued so far only need the next grace period.
        let needwake = !rdp.is_offloaded() && self.accelerate_cbs(&mut guard, local);
        self.disable_urgency(rdp);
        let gps = guard.gp_seq();
        self.report_qs_rnp(rdp.grpmask, guard, gps);
        if needwake {
            self.wake_gp_worker();
        }
    }

    /// Catch up on grace-period changes and report a quiescent state if one
    /// has been recorded since the current grace period began.
    ///
    /// 追赶宽限期的变化，并在当前宽限期开始后已记录静止状态时进行报告。
    pub(crate) fn check_quiescent_state(&self, local: &mut CpuGuard<'_>) {
        self.note_gp_changes(local);
        if !local.core_needs_qs || local.cpu_no_qs {
            return;
        }
        self.report_qs_rdp(local);
    }

    /// Bring the processor's view of grace periods up to date with its leaf.
    /// 使处理器对宽限期的视图与其叶节点保持一致。
    pub(crate) fn note_gp_changes(&self, local: &mut CpuGuard<'_>) {
        let rdp = local.rdp;
        let node = self.tree.node(rdp.leaf);
        if rdp.gp_seq() == node.gp_seq() && !rdp.gpwrap() {
            return;
        }
        let mut guard = node.lock();
        let needwake = self.note_gp_changes_locked(&mut guard, local);
        drop(guard);
        if needwake {
            self.wake_gp_worker();
        }
    }

    /// Returns `true` if the worker must be woken for a new grace period.
    pub(crate) fn note_gp_changes_locked<'a>(
        &'a self,
        guard: &mut NodeGuard<'a>,
        local: &mut CpuGuard<'_>,
    ) -> bool {
        let rdp = local.rdp;
        let node_seq = guard.gp_seq();
        let old = rdp.gp_seq();
        if old == node_seq {
            return false;
        }

        let wrapped = rdp.gpwrap();
        let offloaded = rdp.is_offloaded();
        let mut ret = false;

        if seq::completed_gp(old, node_seq) || wrapped {
            if !offloaded {
                ret = self.advance_cbs(guard, local);
            }
            local.core_needs_qs = false;
        } else {
            if !offloaded {
                ret = self.accelerate_cbs(guard, local);
            }
            if local.core_needs_qs {
                local.core_needs_qs = guard.qsmask() & rdp.grpmask != 0;
            }
        }

        if seq::new_gp(old, node_seq) || wrapped {
            let need_qs = guard.qsmask() & rdp.grpmask != 0;
            local.cpu_no_qs = need_qs;
            local.core_needs_qs = need_qs;
        }

        local.set_gp_seq(node_seq);
        let needed = guard.gp_seq_needed();
        if seq::cmp_lt(rdp.gp_seq_needed(), needed) || wrapped {
            rdp.set_gp_seq_needed(needed);
        }
        if wrapped {
            local.clear_gpwrap();
        }
        self.gpnum_ovf(rdp, node_seq);
        ret
    }

    /// Flag a processor whose view lags so far behind that sequence
    /// comparisons against it are no longer trustworthy.
    ///
    /// 标记视图落后过多、与其进行序列比较已不可靠的处理器。
    pub(crate) fn gpnum_ovf(&self, rdp: &CpuData, leaf_gp_seq: usize) {
        if seq::cmp_lt(rdp.gp_seq().wrapping_add(self.tun.gpwrap_lag), leaf_gp_seq) && !rdp.gpwrap() {
            rdp.set_gpwrap();
            Stats::bump(&self.stats.gpwraps);
            log::warn!(
                "processor {} lags {} grace periods behind, treating its view as wrapped",
                rdp.cpu,
                seq::diff(leaf_gp_seq, rdp.gp_seq())
            );
        }
    }

    /// A quiescent state was found: stop asking for one.
    #[inline]
    pub(crate) fn disable_urgency(&self, rdp: &CpuData) {
        rdp.urgent_qs.store(false, Ordering::Relaxed);
        rdp.need_heavy_qs.store(false, Ordering::Relaxed);
    }

    /// Assign a grace period to callbacks that lack one and request it.
    /// Returns `true` if the worker must be woken.
    ///
    /// 为尚未分配宽限期的回调分配宽限期并请求它。若必须唤醒工作线程则返回 `true`。
    pub(crate) fn accelerate_cbs<'a>(
        &'a self,
        guard: &mut NodeGuard<'a>,
        local: &mut CpuGuard<'_>,
    ) -> bool {
        if !local.cblist.pend_cbs() {
            return false;
        }
        // Any grace period started after this read is long enough.
        let req = seq::snap(self.gp_seq.load(Ordering::Acquire));
        if local.cblist.accelerate(req) {
            self.start_this_gp(guard, Some(local.rdp), req)
        } else {
            false
        }
    }

    /// Move callbacks whose grace period ended to `DONE`, then accelerate.
    pub(crate) fn advance_cbs<'a>(&'a self, guard: &mut NodeGuard<'a>, local: &mut CpuGuard<'_>) -> bool {
        if !local.cblist.pend_cbs() {
            return false;
        }
        local.cblist.advance(guard.gp_seq());
        self.accelerate_cbs(guard, local)
    }

    /// Accelerate without the leaf lock when this processor already asked
    /// for a late enough grace period.
    ///
    /// 若本处理器已请求了足够晚的宽限期，则在不持有叶节点锁的情况下加速。
    pub(crate) fn accelerate_cbs_unlocked(&self, local: &mut CpuGuard<'_>) {
        let rdp = local.rdp;
        let c = seq::snap(self.gp_seq.load(Ordering::Acquire));
        if !rdp.gpwrap() && seq::cmp_ge(rdp.gp_seq_needed(), c) {
            local.cblist.accelerate(c);
            return;
        }
        let mut guard = self.tree.node(rdp.leaf).lock();
        let needwake = self.accelerate_cbs(&mut guard, local);
        drop(guard);
        if needwake {
            self.wake_gp_worker();
        }
    }

    /// Record a request for grace period `req`, funnelling from the node held
    /// by `start` toward the root until some node already knows of it.
    ///
    /// Returns `true` if the worker must be woken to start it.
    ///
    /// 记录对宽限期 `req` 的请求，从 `start` 所持节点向根节点漏斗式传播，直到某个节点已知晓该请求。
    /// 若必须唤醒工作线程来启动它则返回 `true`。
    pub(crate) fn start_this_gp<'a>(
        &'a self,
        start: &mut NodeGuard<'a>,
        rdp: Option<&CpuData>,
        req: usize,
    ) -> bool {
        let mut upper: Option<NodeGuard<'a>> = None;
        let mut needwake = false;

        'funnel: {
            loop {
                let at_start = upper.is_none();
                let guard: &mut NodeGuard<'a> = match upper.as_mut() {
                    Some(guard) => guard,
                    None => &mut *start,
                };
                let gp_seq = guard.gp_seq();
                if seq::cmp_ge(guard.gp_seq_needed(), req)
                    || seq::started(gp_seq, req)
                    || (!at_start && seq::in_progress(gp_seq))
                {
                    break 'funnel;
                }
                guard.set_gp_seq_needed(req);
                if seq::in_progress(gp_seq) {
                    // The grace period running here will notice the request at its end.
                    break 'funnel;
                }
                let Some(parent) = self.tree.parent(guard.node) else {
                    break;
                };
                // Release the previous interior node before taking its parent.
                upper = None;
                upper = Some(parent.lock());
            }

            // At the root.
            if self.gp_in_progress() {
                break 'funnel;
            }
            self.gp_flags.fetch_or(GP_FLAG_INIT, Ordering::AcqRel);
            needwake = true;
            log::trace!("requested grace period {}", seq::gp_num(req));
        }

        // Push the furthest known request back down to where this one started.
        let furthest = match upper.as_ref() {
            Some(guard) => guard.gp_seq_needed(),
            None => start.gp_seq_needed(),
        };
        if seq::cmp_lt(req, furthest) {
            start.set_gp_seq_needed(furthest);
            if let Some(rdp) = rdp {
                rdp.set_gp_seq_needed(furthest);
            }
        }
        needwake
    }

    /// End-of-grace-period bookkeeping for one node. Returns `true` if a later
    /// grace period was requested through it.
    ///
    /// 单个节点在宽限期结束时的记录。若有更晚的宽限期通过该节点被请求则返回 `true`。
    pub(crate) fn future_gp_cleanup(&self, guard: &mut NodeGuard<'_>) -> bool {
        let needed = guard.gp_seq_needed();
        let needmore = seq::cmp_lt(guard.gp_seq(), needed);
        if !needmore {
            // Avoid counter wrap.
            let gp_seq = guard.gp_seq();
            guard.set_gp_seq_needed(gp_seq);
        }
        needmore
    }

    /// Ask the worker to scan for quiescent states now.
    ///
    /// Concurrent callers funnel through per-node try-locks from `leaf` to
    /// the root so only one of them reaches it.
    ///
    /// 请求工作线程立即扫描静止状态。并发调用者从 `leaf` 到根节点经过每节点的尝试锁漏斗，
    /// 因此只有其中一个能到达根节点。
    pub(crate) fn force_quiescent_state(&self, leaf: usize) {
        if !self.gp_in_progress() {
            return;
        }
        let mut held: Option<&crate::tree::Node> = None;
        let mut next = Some(self.tree.node(leaf));
        while let Some(node) = next {
            let lost = self.gp_flags.load(Ordering::Acquire) & GP_FLAG_FQS != 0
                || node.fqs_lock.swap(true, Ordering::Acquire);
            if let Some(prev) = held.take() {
                prev.fqs_lock.store(false, Ordering::Release);
            }
            if lost {
                return;
            }
            held = Some(node);
            next = self.tree.parent(node);
        }

        let root = self.tree.root();
        let guard = root.lock();
        root.fqs_lock.store(false, Ordering::Release);
        if self.gp_flags.load(Ordering::Acquire) & GP_FLAG_FQS != 0 {
            return;
        }
        self.gp_flags.fetch_or(GP_FLAG_FQS, Ordering::AcqRel);
        drop(guard);
        log::debug!("forcing a quiescent-state scan");
        self.gp_wq.wake_all();
    }
}
