//! The grace-period state machine.
//!
//! One grace period runs at a time: `gp_init` starts it and snapshots which
//! processors must report, the force-quiescent-state loop credits idle
//! processors and escalates on the rest, and `gp_cleanup` publishes the end
//! to every node. The same steps are driven either by the worker thread or
//! one at a time through [`Rcu::step_grace_period`](crate::Rcu::step_grace_period).
//!
//! 宽限期状态机。
//! 同一时刻只运行一个宽限期：`gp_init` 启动它并快照哪些处理器必须报告，
//! 强制静止状态循环为空闲处理器记账并对其余处理器升级处理，`gp_cleanup` 将结束发布到每个节点。
//! 这些步骤由工作线程驱动，或者通过 `Rcu::step_grace_period` 逐步驱动。

use crate::cpu::CpuData;
use crate::hooks::StallReport;
use crate::seq;
use crate::state::{GP_FLAG_FQS, GP_FLAG_INIT, GP_FLAG_OVLD, GpPhase, RcuState};
use crate::stats::Stats;
use crate::sync::{Arc, Ordering, fence};
use std::time::Duration;

/// Outcome of one manual step of the state machine.
/// 状态机一次手动步进的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpStep {
    /// Nothing requested, nothing running.
    Idle,
    /// A grace period was started.
    Started,
    /// A quiescent-state scan ran and processors still owe reports.
    Forced,
    /// The running grace period completed.
    Completed,
}

/// What a scan concluded about one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pending,
    Quiescent,
    Resched,
}

const fn nanos(d: Duration) -> u64 {
    d.as_nanos() as u64
}

impl RcuState {
    /// Start a grace period if one was requested. Returns `false` if none was.
    ///
    /// 如果有请求则启动一个宽限期。没有请求时返回 `false`。
    pub(crate) fn gp_init(&self) -> bool {
        let root = self.tree.root();
        let guard = root.lock();
        if self.gp_flags.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.gp_flags.store(0, Ordering::Release);
        if self.gp_in_progress() {
            drop(guard);
            self.anomaly(format_args!("grace-period start requested while one is running"));
            return false;
        }

        let now = self.now();
        self.gp_start.store(now, Ordering::Relaxed);
        self.jiffies_resched
            .store(now + nanos(self.tun.stall_timeout) / 2, Ordering::Relaxed);
        self.jiffies_stall
            .store(now + nanos(self.tun.stall_timeout), Ordering::Relaxed);

        let start_new_poll = self.sr_normal_gp_init();
        let new = seq::start(self.gp_seq.load(Ordering::Relaxed));
        self.gp_seq.store(new, Ordering::Release);
        // Order everything the updaters did before the request before any
        // processor can observe the new grace period.
        fence(Ordering::SeqCst);
        drop(guard);

        Stats::bump(&self.stats.gps_started);
        log::debug!("grace period {} started", seq::gp_num(new));

        if start_new_poll {
            self.start_poll();
        }

        // Fold processors that came or went since the last grace period into
        // the masks this one waits on.
        self.set_phase(GpPhase::Onoff);
        for leaf in self.tree.leaves() {
            let _ofl = self.ofl_lock.lock();
            let mut guard = leaf.lock();
            let next = guard.qsmaskinitnext();
            if guard.qsmaskinit == next {
                continue;
            }
            let oldmask = guard.qsmaskinit;
            guard.qsmaskinit = next;
            if (oldmask == 0) != (next == 0) {
                if oldmask == 0 {
                    self.tree.init_new_leaf(leaf);
                } else {
                    self.tree.cleanup_dead_leaf(leaf);
                }
            }
        }

        // Broadcast, parents first, so a processor never sees its leaf in the
        // new grace period while an ancestor still sits in the old one.
        self.set_phase(GpPhase::Init);
        for node in self.tree.breadth_first() {
            let mut guard = node.lock();
            let init = guard.qsmaskinit;
            guard.set_qsmask(init);
            guard.set_gp_seq(new);
            let gone = init & !guard.qsmaskinitnext();
            if node.is_leaf && gone != 0 {
                // Went offline after the ONOFF pass: nothing to wait for.
                Stats::add(&self.stats.offline_credits, gone.count_ones() as usize);
                self.report_qs_rnp(gone, guard, new);
            }
        }
        true
    }

    /// Whether the worker should stop waiting and look at the grace period.
    /// `gf` carries the flags seen, seeded with overload on the first pass.
    fn fqs_check_wake(&self, gf: &mut usize) -> bool {
        if *gf & GP_FLAG_OVLD != 0 {
            return true;
        }
        *gf = self.gp_flags.load(Ordering::Acquire);
        if *gf & GP_FLAG_FQS != 0 {
            return true;
        }
        self.tree.root().qsmask() == 0
    }

    /// One scan for quiescent states.
    /// 一次静止状态扫描。
    pub(crate) fn gp_fqs(&self, first_time: bool) {
        self.n_force_qs.fetch_add(1, Ordering::AcqRel);
        Stats::bump(&self.stats.fqs_scans);
        if first_time {
            self.force_qs_rnp(Self::watching_snap_save);
        } else {
            self.force_qs_rnp(Self::watching_snap_recheck);
            self.boost_blocking_readers();
        }
        if self.gp_flags.load(Ordering::Acquire) & GP_FLAG_FQS != 0 {
            let _guard = self.tree.root().lock();
            self.gp_flags.fetch_and(!GP_FLAG_FQS, Ordering::AcqRel);
        }
    }

    /// Apply `check` to every processor that still owes a quiescent state,
    /// report the ones it credits, and ask the environment to reschedule the
    /// ones it flags.
    ///
    /// 对每个仍欠静止状态的处理器应用 `check`，报告被记账的处理器，并请求运行环境重新调度被标记的处理器。
    fn force_qs_rnp(&self, check: fn(&Self, &CpuData, usize) -> Verdict) {
        self.cbovld
            .store(self.cbovldnext.swap(false, Ordering::AcqRel), Ordering::Release);

        for leaf in self.tree.leaves() {
            let guard = leaf.lock();
            if guard.cbovldmask() != 0 {
                self.cbovldnext.store(true, Ordering::Release);
            }
            let qsmask = guard.qsmask();
            if qsmask == 0 {
                continue;
            }

            let mut mask = 0;
            let mut rsmask = 0;
            for cpu in leaf.cpus_in(qsmask) {
                let rdp = &self.cpus[cpu];
                match check(self, rdp, guard.gp_seq()) {
                    Verdict::Quiescent => {
                        mask |= rdp.grpmask;
                        self.disable_urgency(rdp);
                    }
                    Verdict::Resched => rsmask |= rdp.grpmask,
                    Verdict::Pending => {}
                }
            }

            if mask != 0 {
                let gps = guard.gp_seq();
                self.report_qs_rnp(mask, guard, gps);
            } else {
                drop(guard);
            }
            for cpu in leaf.cpus_in(rsmask) {
                Stats::bump(&self.stats.resched_requests);
                self.hooks.resched_processor(cpu);
            }
        }
    }

    /// First scan: sample each counter, crediting processors idle right now.
    fn watching_snap_save(&self, rdp: &CpuData, leaf_gp_seq: usize) -> Verdict {
        let snap = rdp.watching();
        rdp.watching_snap.store(snap, Ordering::Relaxed);
        if snap & 1 == 0 {
            self.gpnum_ovf(rdp, leaf_gp_seq);
            Stats::bump(&self.stats.idle_credits);
            return Verdict::Quiescent;
        }
        Verdict::Pending
    }

    /// Later scans: credit processors that passed through idle since the
    /// first scan, and escalate on the rest as the grace period ages.
    ///
    /// 后续扫描：为自第一次扫描以来经过空闲的处理器记账，并随着宽限期变老对其余处理器升级处理。
    fn watching_snap_recheck(&self, rdp: &CpuData, leaf_gp_seq: usize) -> Verdict {
        let snap = rdp.watching_snap.load(Ordering::Relaxed);
        if rdp.watching() != snap {
            self.gpnum_ovf(rdp, leaf_gp_seq);
            Stats::bump(&self.stats.idle_credits);
            return Verdict::Quiescent;
        }

        let leaf = self.tree.node(rdp.leaf);
        if leaf.qsmaskinitnext() & rdp.grpmask == 0 {
            self.anomaly(format_args!(
                "offline processor {} still blocks grace period {}",
                rdp.cpu,
                seq::gp_num(leaf_gp_seq)
            ));
            Stats::bump(&self.stats.offline_credits);
            return Verdict::Quiescent;
        }

        let now = self.now();
        let gp_start = self.gp_start.load(Ordering::Relaxed);
        let jtsq = nanos(self.tun.sched_qs);
        let resched_at = self.jiffies_resched.load(Ordering::Relaxed);
        if !rdp.need_heavy_qs.load(Ordering::Relaxed)
            && (now > gp_start + 2 * jtsq || now > resched_at || self.cbovld.load(Ordering::Acquire))
        {
            rdp.need_heavy_qs.store(true, Ordering::Release);
            rdp.urgent_qs.store(true, Ordering::Release);
        } else if now > gp_start + jtsq {
            rdp.urgent_qs.store(true, Ordering::Release);
        }

        if now > resched_at && now > rdp.last_fqs_resched.load(Ordering::Relaxed) + jtsq {
            rdp.last_fqs_resched.store(now, Ordering::Relaxed);
            return Verdict::Resched;
        }
        Verdict::Pending
    }

    /// Tell the environment, once per grace period, about processors whose
    /// readers have held it up past the boost delay.
    ///
    /// 每个宽限期一次，告知运行环境哪些处理器的读者阻塞宽限期已超过提升延迟。
    fn boost_blocking_readers(&self) {
        let age = Duration::from_nanos(
            self.now()
                .saturating_sub(self.gp_start.load(Ordering::Relaxed)),
        );
        if age <= self.tun.boost_delay {
            return;
        }
        for leaf in self.tree.leaves() {
            let gp_seq = leaf.gp_seq();
            for cpu in leaf.cpus_in(leaf.qsmask()) {
                let rdp = &self.cpus[cpu];
                if rdp.boost_gp.swap(gp_seq, Ordering::AcqRel) != gp_seq {
                    Stats::bump(&self.stats.boosts);
                    self.hooks.boost_readers(cpu, age);
                }
            }
        }
    }

    /// Report a grace period that has run past the stall timeout, once per
    /// timeout interval.
    ///
    /// 报告运行超过停滞超时的宽限期，每个超时间隔报告一次。
    pub(crate) fn check_stall(&self) {
        let now = self.now();
        let stall_at = self.jiffies_stall.load(Ordering::Relaxed);
        if now < stall_at || !self.gp_in_progress() {
            return;
        }
        let rearm = now + 3 * nanos(self.tun.stall_timeout);
        if self
            .jiffies_stall
            .compare_exchange(stall_at, rearm, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let blocking: Vec<usize> = self
            .tree
            .leaves()
            .iter()
            .flat_map(|leaf| leaf.cpus_in(leaf.qsmask()))
            .collect();
        let report = StallReport {
            gp_num: seq::gp_num(self.gp_seq.load(Ordering::Acquire)),
            elapsed: Duration::from_nanos(now.saturating_sub(self.gp_start.load(Ordering::Relaxed))),
            phase: self.phase(),
            blocking,
        };
        Stats::bump(&self.stats.stalls);
        log::warn!(
            "grace period {} stalled for {:?}, blocked by processors {:?}",
            report.gp_num,
            report.elapsed,
            report.blocking
        );
        self.hooks.stall_detected(&report);
    }

    /// Scan until the root is quiescent. Returns `false` if the domain is
    /// shutting down or another driver finished the grace period.
    ///
    /// 扫描直到根节点静止。若域正在关闭或另一个驱动者已完成宽限期则返回 `false`。
    fn gp_fqs_loop(&self) -> bool {
        let root = self.tree.root();
        let mut j = nanos(self.tun.first_fqs);
        let mut gf = if self.cbovld.load(Ordering::Acquire) {
            GP_FLAG_OVLD
        } else {
            0
        };
        let mut spurious = false;

        loop {
            if self.cbovld.load(Ordering::Acquire) {
                j = j.div_ceil(3).max(nanos(Duration::from_millis(1)));
            }
            let now = self.now();
            if !spurious || now + j < self.jiffies_force_qs.load(Ordering::Relaxed) {
                self.jiffies_force_qs.store(now + j, Ordering::Relaxed);
            }
            self.set_phase(GpPhase::WaitingFqs);
            let deadline = self.deadline(self.jiffies_force_qs.load(Ordering::Relaxed));
            self.gp_wq
                .wait_until(Some(deadline), || self.stopping() || self.fqs_check_wake(&mut gf));
            if self.stopping() {
                return false;
            }
            self.set_phase(GpPhase::DoingFqs);

            if root.qsmask() == 0 {
                return true;
            }
            let now = self.now();
            if now >= self.jiffies_force_qs.load(Ordering::Relaxed)
                || gf & (GP_FLAG_FQS | GP_FLAG_OVLD) != 0
            {
                let mut driver = self.driver.lock();
                if !driver.forcing {
                    return false;
                }
                self.gp_fqs(driver.first_fqs);
                driver.first_fqs = false;
                drop(driver);
                self.check_stall();
                gf = 0;
                j = nanos(self.tun.next_fqs);
                spurious = false;
            } else {
                // Woken early with nothing to do: sleep out the remainder.
                j = self
                    .jiffies_force_qs
                    .load(Ordering::Relaxed)
                    .saturating_sub(now)
                    .max(1);
                gf = 0;
                spurious = true;
            }
        }
    }

    /// Publish the end of the running grace period and decide whether
    /// another one is needed.
    ///
    /// 发布正在运行的宽限期的结束，并决定是否需要下一个宽限期。
    pub(crate) fn gp_cleanup(&self) {
        self.set_phase(GpPhase::Cleanup);
        let root = self.tree.root();
        let elapsed = self
            .now()
            .saturating_sub(self.gp_start.load(Ordering::Relaxed));
        self.gp_max.fetch_max(elapsed, Ordering::Relaxed);

        let new = seq::end(self.gp_seq.load(Ordering::Relaxed));
        let mut needgp = false;
        for node in self.tree.breadth_first() {
            let mut guard = node.lock();
            if guard.qsmask() != 0 {
                self.anomaly(format_args!(
                    "node {} still owes {:#x} at cleanup",
                    node.index,
                    guard.qsmask()
                ));
            }
            guard.set_gp_seq(new);
            needgp |= self.future_gp_cleanup(&mut guard);
            if node.is_leaf {
                for cpu in node.cpus_in(guard.cbovldmask()) {
                    let rdp = &self.cpus[cpu];
                    self.check_cb_ovld_locked(rdp, rdp.n_cbs(), &mut guard);
                }
            }
        }

        let guard = root.lock();
        self.gp_seq.store(new, Ordering::Release);
        fence(Ordering::SeqCst);
        self.set_phase(GpPhase::Idle);
        if !needgp && seq::cmp_lt(guard.gp_seq(), guard.gp_seq_needed()) {
            needgp = true;
        }
        if needgp {
            self.gp_flags.store(GP_FLAG_INIT, Ordering::Release);
        } else {
            // Keep a start request that raced with cleanup; drop stale scan requests.
            self.gp_flags.fetch_and(GP_FLAG_INIT, Ordering::AcqRel);
        }
        drop(guard);

        Stats::bump(&self.stats.gps_completed);
        log::debug!(
            "grace period {} completed after {:?}",
            seq::gp_num(new).wrapping_sub(1),
            Duration::from_nanos(elapsed)
        );

        self.sr_normal_gp_cleanup();
        self.kick_callbacks();
    }

    /// Advance the state machine by one step without waiting.
    ///
    /// 不等待地将状态机推进一步。
    pub(crate) fn step(&self) -> GpStep {
        let mut driver = self.driver.lock();
        if !driver.forcing {
            if self.gp_flags.load(Ordering::Acquire) & GP_FLAG_INIT == 0 || !self.gp_init() {
                return GpStep::Idle;
            }
            driver.forcing = true;
            driver.first_fqs = true;
            if self.threaded {
                // Let the worker take over the scans.
                self.gp_wq.wake_all();
            }
            return GpStep::Started;
        }

        if self.tree.root().qsmask() != 0 {
            self.gp_fqs(driver.first_fqs);
            driver.first_fqs = false;
            self.check_stall();
            if self.tree.root().qsmask() != 0 {
                return GpStep::Forced;
            }
        }
        self.gp_cleanup();
        driver.forcing = false;
        GpStep::Completed
    }

    /// Body of the grace-period worker thread.
    /// 宽限期工作线程的主体。
    pub(crate) fn gp_kthread(self: Arc<Self>) {
        log::debug!("grace-period worker running");
        'outer: loop {
            loop {
                let mut driver = self.driver.lock();
                // A manual step may have started one: drive it from here.
                if driver.forcing {
                    break;
                }
                if self.gp_flags.load(Ordering::Acquire) & GP_FLAG_INIT != 0 && self.gp_init() {
                    driver.forcing = true;
                    driver.first_fqs = true;
                    break;
                }
                drop(driver);

                self.set_phase(GpPhase::WaitingForRequest);
                self.gp_wq.wait_until(None, || {
                    self.stopping()
                        || self.gp_flags.load(Ordering::Acquire) & GP_FLAG_INIT != 0
                        || self.gp_in_progress()
                });
                if self.stopping() {
                    break 'outer;
                }
            }

            if !self.gp_fqs_loop() {
                if self.stopping() {
                    break;
                }
                continue;
            }

            // The loop saw the root clear without the driver lock. A manual
            // step may since have completed that grace period and started
            // the next one, so only clean up what is still fully reported.
            let mut driver = self.driver.lock();
            if driver.forcing && self.tree.root().qsmask() == 0 {
                self.gp_cleanup();
                driver.forcing = false;
            }
        }
        log::debug!("grace-period worker stopped");
    }
}
