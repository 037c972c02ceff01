//! Waiting for every already-queued callback to finish.
//!
//! A marker callback is entrained behind the existing callbacks of each
//! processor. A shared count starts one above the processor count; each
//! processor settles its share once, either when its marker runs or right
//! away if it had nothing queued, and the caller drops the extra one after
//! all markers are in place, so the count cannot reach zero early.
//!
//! 等待所有已排队的回调完成。
//! 在每个处理器已有回调之后挂入一个标记回调。共享计数从处理器数量加一开始；
//! 每个处理器恰好结算一次，要么在其标记运行时，要么在其没有排队回调时立即结算，
//! 调用者在所有标记就位后再减去多出来的那一个，因此计数不会过早归零。

use crate::cpu::CpuGuard;
use crate::segcblist::Callback;
use crate::seq;
use crate::state::{RcuState, WaitQueue};
use crate::stats::Stats;
use crate::sync::{Arc, AtomicBool, AtomicUsize, Mutex, Ordering, fence};
use std::time::{Duration, Instant};

/// How often a barrier waiter helps invoke ready callbacks while it waits.
const HELP_INTERVAL: Duration = Duration::from_millis(1);

/// Completion shared with the marker callbacks.
pub(crate) struct BarrierCount {
    count: AtomicUsize,
    done: AtomicBool,
    wq: WaitQueue,
}

impl BarrierCount {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            wq: WaitQueue::new(),
        }
    }

    fn dec(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.store(true, Ordering::Release);
            self.wq.wake_all();
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

pub(crate) struct BarrierState {
    /// Serializes barrier callers.
    pub(crate) mutex: Mutex<()>,
    /// Serializes marker placement against callback migration.
    pub(crate) lock: Mutex<()>,
    sequence: AtomicUsize,
    count: Arc<BarrierCount>,
}

impl BarrierState {
    pub(crate) fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            lock: Mutex::new(()),
            sequence: AtomicUsize::new(0),
            count: Arc::new(BarrierCount::new()),
        }
    }
}

impl RcuState {
    /// Settle `local`'s share of the running barrier, if it has not been
    /// settled yet: entrain a marker behind its callbacks, or settle it right
    /// away when it has none. The caller holds the barrier lock.
    ///
    /// 如果尚未结算，则结算 `local` 在当前屏障中的份额：在其回调之后挂入标记，
    /// 若其没有回调则立即结算。调用者持有屏障锁。
    pub(crate) fn barrier_entrain(&self, local: &mut CpuGuard<'_>) {
        let barrier = &self.barrier;
        let gseq = barrier.sequence.load(Ordering::Acquire);
        if !seq::in_progress(gseq) {
            return;
        }
        let rdp = local.rdp;
        if rdp.barrier_seq_snap.swap(gseq, Ordering::AcqRel) == gseq {
            return;
        }

        let count = Arc::clone(&barrier.count);
        let marker = Callback::new(Box::new(move || count.dec()));
        match local.cblist.entrain(marker) {
            Ok(()) => {
                // The marker may have landed in the unassigned segment.
                self.accelerate_cbs_unlocked(local);
                log::trace!("barrier marker entrained on processor {}", rdp.cpu);
            }
            Err(_) => barrier.count.dec(),
        }
    }

    /// Wait until every callback queued before this call has been invoked.
    ///
    /// 等待本次调用之前排队的所有回调都被调用完毕。
    pub(crate) fn barrier(&self) {
        let barrier = &self.barrier;
        let s = seq::snap(barrier.sequence.load(Ordering::Acquire));
        let _serial = barrier.mutex.lock();

        // Someone else's barrier did the job.
        if seq::done(barrier.sequence.load(Ordering::Acquire), s) {
            fence(Ordering::SeqCst);
            return;
        }

        {
            let _lock = barrier.lock.lock();
            barrier.count.done.store(false, Ordering::Release);
            barrier
                .count
                .count
                .store(self.cpus.len() + 1, Ordering::Release);
            let gseq = seq::start(barrier.sequence.load(Ordering::Relaxed));
            barrier.sequence.store(gseq, Ordering::Release);
        }

        for rdp in self.cpus.iter() {
            let _lock = barrier.lock.lock();
            let mut local = rdp.lock();
            self.barrier_entrain(&mut local);
        }
        barrier.count.dec();

        while !barrier.count.is_done() {
            if !self.threaded {
                // Nobody else drives grace periods: do it from here.
                self.step();
                self.drain_all(false);
                crate::sync::thread::yield_now();
                continue;
            }
            let settled = barrier
                .count
                .wq
                .wait_until(Some(Instant::now() + HELP_INTERVAL), || barrier.count.is_done());
            if !settled {
                self.drain_all(false);
            }
        }

        {
            let _lock = barrier.lock.lock();
            let end = seq::end(barrier.sequence.load(Ordering::Relaxed));
            barrier.sequence.store(end, Ordering::Release);
            for rdp in self.cpus.iter() {
                rdp.barrier_seq_snap.store(end, Ordering::Release);
            }
        }
        Stats::bump(&self.stats.barriers);
        log::debug!("barrier {} complete", seq::ctr(barrier.sequence.load(Ordering::Relaxed)));
    }
}
