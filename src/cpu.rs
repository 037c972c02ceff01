use crate::segcblist::SegCbList;
use crate::sync::{AtomicBool, AtomicU64, AtomicUsize, Condvar, Mutex, MutexGuard, Ordering, fence, thread};
use std::ops::{Deref, DerefMut};

/// Per-processor bookkeeping only touched with the processor lock held.
/// 只在持有处理器锁时访问的每处理器记录。
pub(crate) struct CpuLocal {
    pub(crate) cblist: SegCbList,
    /// This processor still owes a quiescent state for its last-noted grace period.
    /// 本处理器仍欠其最近记录的宽限期一个静止状态。
    pub(crate) cpu_no_qs: bool,
    /// The grace-period core expects a report from this processor.
    /// 宽限期核心期待本处理器的报告。
    pub(crate) core_needs_qs: bool,
    pub(crate) blimit: usize,
    pub(crate) qlen_last_fqs_check: usize,
    pub(crate) n_force_qs_snap: usize,
}

/// Per-processor record.
///
/// The atomics are either written only under `local` (and read anywhere as
/// hints) or are flags shared with the grace-period worker.
///
/// 每处理器记录。
/// 原子字段要么只在持有 `local` 时写入（在任何地方作为提示读取），要么是与宽限期工作线程共享的标志。
#[repr(align(64))]
pub(crate) struct CpuData {
    pub(crate) cpu: usize,
    /// Index of the leaf covering this processor.
    pub(crate) leaf: usize,
    /// This processor's bit in its leaf's masks.
    pub(crate) grpmask: usize,
    local: Mutex<CpuLocal>,
    /// Last grace-period sequence this processor noted.
    /// 本处理器最近记录的宽限期序列号。
    gp_seq: AtomicUsize,
    /// Furthest grace period this processor has requested.
    /// 本处理器请求过的最远宽限期。
    gp_seq_needed: AtomicUsize,
    /// `gp_seq` lags too far behind to be compared safely.
    /// `gp_seq` 落后太多，无法安全比较。
    gpwrap: AtomicBool,
    /// Even: idle (extended quiescent state); odd: watching.
    /// 偶数：空闲（扩展静止状态）；奇数：正在观察。
    watching: AtomicUsize,
    /// `watching` as sampled by the first scan of the current grace period.
    pub(crate) watching_snap: AtomicUsize,
    /// The grace period would like a report from this processor soon.
    pub(crate) urgent_qs: AtomicBool,
    /// Escalated once per grace period past `urgent_qs`; surfaced as
    /// `Processor::quiescent_state_overdue`.
    pub(crate) need_heavy_qs: AtomicBool,
    /// Clock reading of the last reschedule request.
    pub(crate) last_fqs_resched: AtomicU64,
    /// Grace period for which readers were last reported for boosting.
    pub(crate) boost_gp: AtomicUsize,
    pub(crate) attached: AtomicBool,
    pub(crate) offloaded: AtomicBool,
    invoking: AtomicBool,
    pub(crate) barrier_seq_snap: AtomicUsize,
    /// Mirror of `cblist.len()`, published when the lock is released.
    n_cbs: AtomicUsize,
    /// Callbacks may be ready: wakes the helper thread or offload owner.
    work: Mutex<bool>,
    work_cv: Condvar,
}

impl CpuData {
    pub(crate) fn new(cpu: usize, leaf: usize, grpmask: usize, gp_seq: usize, blimit: usize) -> Self {
        Self {
            cpu,
            leaf,
            grpmask,
            local: Mutex::new(CpuLocal {
                cblist: SegCbList::new(),
                cpu_no_qs: true,
                core_needs_qs: false,
                blimit,
                qlen_last_fqs_check: 0,
                n_force_qs_snap: 0,
            }),
            gp_seq: AtomicUsize::new(gp_seq),
            gp_seq_needed: AtomicUsize::new(gp_seq),
            gpwrap: AtomicBool::new(false),
            watching: AtomicUsize::new(0),
            watching_snap: AtomicUsize::new(0),
            urgent_qs: AtomicBool::new(false),
            need_heavy_qs: AtomicBool::new(false),
            last_fqs_resched: AtomicU64::new(0),
            boost_gp: AtomicUsize::new(gp_seq),
            attached: AtomicBool::new(false),
            offloaded: AtomicBool::new(false),
            invoking: AtomicBool::new(false),
            barrier_seq_snap: AtomicUsize::new(0),
            n_cbs: AtomicUsize::new(0),
            work: Mutex::new(false),
            work_cv: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> CpuGuard<'_> {
        CpuGuard {
            rdp: self,
            local: self.local.lock(),
        }
    }

    #[inline]
    pub(crate) fn gp_seq(&self) -> usize {
        self.gp_seq.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn gp_seq_needed(&self) -> usize {
        self.gp_seq_needed.load(Ordering::Acquire)
    }

    /// Raised by grace-period requests that funnel through this processor's leaf.
    #[inline]
    pub(crate) fn set_gp_seq_needed(&self, seq: usize) {
        self.gp_seq_needed.store(seq, Ordering::Release);
    }

    #[inline]
    pub(crate) fn gpwrap(&self) -> bool {
        self.gpwrap.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_gpwrap(&self) {
        self.gpwrap.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_offloaded(&self) -> bool {
        self.offloaded.load(Ordering::Acquire)
    }

    /// Callback count as of the last time the lock was released.
    #[inline]
    pub(crate) fn n_cbs(&self) -> usize {
        self.n_cbs.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn watching(&self) -> usize {
        self.watching.load(Ordering::Acquire)
    }

    /// Leave the extended quiescent state: readers may run from here on.
    ///
    /// The full fence orders everything the processor does afterwards after
    /// the counter change, pairing with the fence that publishes a grace
    /// period start.
    ///
    /// 离开扩展静止状态：此后可以运行读者。
    /// 完整屏障将处理器之后的所有操作排在计数器变化之后，与发布宽限期开始的屏障配对。
    #[inline]
    pub(crate) fn exit_idle(&self) {
        let prev = self.watching.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev & 1 == 0, "BUG: processor {} was already watching", self.cpu);
        fence(Ordering::SeqCst);
    }

    /// Enter the extended quiescent state.
    /// 进入扩展静止状态。
    #[inline]
    pub(crate) fn enter_idle(&self) {
        fence(Ordering::SeqCst);
        let prev = self.watching.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev & 1 == 1, "BUG: processor {} was already idle", self.cpu);
    }

    /// Try to become the only thread invoking this processor's callbacks.
    /// 尝试成为唯一调用本处理器回调的线程。
    #[inline]
    pub(crate) fn try_claim_invoke(&self) -> Option<InvokeClaim<'_>> {
        self.invoking
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| InvokeClaim { rdp: self })
    }

    pub(crate) fn claim_invoke(&self) -> InvokeClaim<'_> {
        loop {
            if let Some(claim) = self.try_claim_invoke() {
                return claim;
            }
            thread::yield_now();
        }
    }

    /// Note that callbacks may be ready and wake whoever invokes them.
    /// 标记回调可能已就绪，并唤醒负责调用它们的线程。
    pub(crate) fn kick(&self) {
        let mut work = self.work.lock();
        *work = true;
        self.work_cv.notify_all();
    }

    /// Block until kicked while `eligible` holds, consuming the kick.
    /// Returns `false` if `stop` returned true or the timeout ran out first.
    ///
    /// 在 `eligible` 成立时阻塞直到被唤醒，并消费该唤醒。
    /// 若 `stop` 返回 true 或先超时则返回 `false`。
    pub(crate) fn wait_for_work(
        &self,
        timeout: Option<std::time::Duration>,
        mut stop: impl FnMut() -> bool,
        mut eligible: impl FnMut() -> bool,
    ) -> bool {
        let mut work = self.work.lock();
        let mut timed_out = false;
        loop {
            if stop() {
                return false;
            }
            if *work && eligible() {
                *work = false;
                return true;
            }
            if timed_out {
                return false;
            }
            match timeout {
                None => work = self.work_cv.wait(work),
                Some(timeout) => {
                    work = self.work_cv.wait_timeout(work, timeout).0;
                    timed_out = true;
                }
            }
        }
    }
}

/// Lock guard of a [`CpuData`]; publishes the callback count on release.
/// [`CpuData`] 的锁守卫；释放时发布回调数量。
pub(crate) struct CpuGuard<'a> {
    pub(crate) rdp: &'a CpuData,
    local: MutexGuard<'a, CpuLocal>,
}

impl CpuGuard<'_> {
    /// Record the grace period this processor has caught up with.
    #[inline]
    pub(crate) fn set_gp_seq(&mut self, seq: usize) {
        self.rdp.gp_seq.store(seq, Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_gpwrap(&mut self) {
        self.rdp.gpwrap.store(false, Ordering::Release);
    }
}

impl Deref for CpuGuard<'_> {
    type Target = CpuLocal;

    fn deref(&self) -> &CpuLocal {
        &self.local
    }
}

impl DerefMut for CpuGuard<'_> {
    fn deref_mut(&mut self) -> &mut CpuLocal {
        &mut self.local
    }
}

impl Drop for CpuGuard<'_> {
    fn drop(&mut self) {
        self.rdp.n_cbs.store(self.local.cblist.len(), Ordering::Release);
    }
}

/// Exclusive right to invoke one processor's ready callbacks.
/// 调用某个处理器就绪回调的独占权。
pub(crate) struct InvokeClaim<'a> {
    rdp: &'a CpuData,
}

impl Drop for InvokeClaim<'_> {
    fn drop(&mut self) {
        self.rdp.invoking.store(false, Ordering::Release);
    }
}

/// Lock two distinct processors in id order.
/// 按编号顺序锁定两个不同的处理器。
pub(crate) fn lock_pair<'a>(a: &'a CpuData, b: &'a CpuData) -> (CpuGuard<'a>, CpuGuard<'a>) {
    debug_assert_ne!(a.cpu, b.cpu, "BUG: locking a processor against itself");
    if a.cpu < b.cpu {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}
