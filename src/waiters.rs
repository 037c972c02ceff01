//! Synchronous waiters multiplexed onto grace periods.
//!
//! Waiters push themselves onto a lock-free list, newest first. Each grace
//! period start pushes a separator ("wait head") and remembers it as
//! `wait_tail`: everything behind it was queued before the grace period
//! began. Cleanup wakes a few of those directly and leaves the rest to a
//! work item that starts from `done_tail`. Separators come from a small
//! fixed pool; when the pool is empty a new grace period is simply requested
//! and the waiters ride along with the next one.
//!
//! 多路复用到宽限期上的同步等待者。
//! 等待者将自己压入一个无锁链表（最新的在前）。每个宽限期开始时压入一个分隔节点（"等待头"）
//! 并将其记为 `wait_tail`：其后的一切都是在宽限期开始前排队的。清理阶段直接唤醒其中少数几个，
//! 其余的交给从 `done_tail` 开始处理的工作项。分隔节点来自一个小的固定池；
//! 池耗尽时只需请求一个新的宽限期，等待者会搭乘下一个宽限期。

use crate::seq;
use crate::state::RcuState;
use crate::stats::Stats;
use crate::sync::{AtomicBool, AtomicPtr, AtomicUsize, Condvar, Mutex, Ordering, Thread, thread};
use std::ptr;

/// Separators available to in-flight grace periods.
const WAIT_HEADS: usize = 5;

/// Waiters woken inline by grace-period cleanup; the rest go to the work item.
const WAKE_INLINE: usize = 5;

enum WaitKind {
    Separator { inuse: AtomicBool },
    Waiter { thread: Thread, done: AtomicBool, cookie: usize },
}

/// One entry of the waiter list.
/// 等待者链表中的一个条目。
pub(crate) struct WaitNode {
    next: AtomicPtr<WaitNode>,
    kind: WaitKind,
}

impl WaitNode {
    fn separator() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            kind: WaitKind::Separator {
                inuse: AtomicBool::new(false),
            },
        }
    }

    fn waiter(cookie: usize) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            kind: WaitKind::Waiter {
                thread: thread::current(),
                done: AtomicBool::new(false),
                cookie,
            },
        }
    }

    fn is_done(&self) -> bool {
        match &self.kind {
            WaitKind::Waiter { done, .. } => done.load(Ordering::Acquire),
            WaitKind::Separator { .. } => true,
        }
    }
}

/// State of the waiter list.
pub(crate) struct SrNormal {
    /// Newest entry.
    head: AtomicPtr<WaitNode>,
    /// Separator of the running grace period. Only the grace-period driver touches it.
    wait_tail: AtomicPtr<WaitNode>,
    /// Separator of the last completed grace period.
    done_tail: AtomicPtr<WaitNode>,
    cleanups_pending: AtomicUsize,
    heads: Box<[WaitNode]>,
    work: Mutex<bool>,
    work_cv: Condvar,
}

impl SrNormal {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            wait_tail: AtomicPtr::new(ptr::null_mut()),
            done_tail: AtomicPtr::new(ptr::null_mut()),
            cleanups_pending: AtomicUsize::new(0),
            heads: (0..WAIT_HEADS).map(|_| WaitNode::separator()).collect(),
            work: Mutex::new(false),
            work_cv: Condvar::new(),
        }
    }

    #[inline]
    fn is_wait_head(&self, node: *const WaitNode) -> bool {
        let base = self.heads.as_ptr() as usize;
        let end = base + self.heads.len() * size_of::<WaitNode>();
        (base..end).contains(&(node as usize))
    }

    fn get_wait_head(&self) -> Option<*mut WaitNode> {
        self.heads.iter().find_map(|node| match &node.kind {
            WaitKind::Separator { inuse } => inuse
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .ok()
                .map(|_| node as *const WaitNode as *mut WaitNode),
            WaitKind::Waiter { .. } => None,
        })
    }

    /// Mark every separator taken or free, as a run of overlapping grace
    /// periods would. Only valid while no separator is on the list.
    #[cfg(test)]
    pub(crate) fn set_wait_heads_taken(&self, taken: bool) {
        for node in self.heads.iter() {
            if let WaitKind::Separator { inuse } = &node.kind {
                inuse.store(taken, Ordering::Release);
            }
        }
    }

    /// # Safety
    /// `node` must be one of `heads`.
    unsafe fn put_wait_head(&self, node: *mut WaitNode) {
        // SAFETY: separators live as long as `self`.
        let node = unsafe { &*node };
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        if let WaitKind::Separator { inuse } = &node.kind {
            inuse.store(false, Ordering::Release);
        }
    }

    /// # Safety
    /// `node` must stay valid until this call returns.
    unsafe fn push(&self, node: *mut WaitNode) {
        let mut first = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: guaranteed by the caller.
            unsafe { (*node).next.store(first, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(first, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => first = current,
            }
        }
    }

    /// Queue the cleanup work item; returns `false` if it was already queued.
    fn queue_work(&self) -> bool {
        let mut queued = self.work.lock();
        if *queued {
            return false;
        }
        *queued = true;
        self.work_cv.notify_all();
        true
    }

    pub(crate) fn wake_worker(&self) {
        let _queued = self.work.lock();
        self.work_cv.notify_all();
    }
}

impl RcuState {
    /// Wake a waiter. Nothing may touch `node` once `done` is set: the waiter
    /// returns and its stack frame goes away.
    ///
    /// # Safety
    /// `node` must be a live waiter that has not been completed yet.
    unsafe fn complete_waiter(&self, node: *const WaitNode) {
        // SAFETY: guaranteed by the caller.
        let WaitKind::Waiter { thread, done, cookie } = (unsafe { &(*node).kind }) else {
            self.anomaly(format_args!("separator completed as a waiter"));
            return;
        };
        if !self.poll_state(*cookie) {
            self.anomaly(format_args!("waiter woken before its grace period ended"));
        }
        let thread = thread.clone();
        done.store(true, Ordering::Release);
        thread.unpark();
    }

    /// Grace-period start: fence off the waiters queued so far.
    /// Returns `true` if no separator was free and another grace period must
    /// be requested for them.
    ///
    /// 宽限期开始：隔离至今为止排队的等待者。若没有空闲的分隔节点，
    /// 必须为它们再请求一个宽限期，则返回 `true`。
    pub(crate) fn sr_normal_gp_init(&self) -> bool {
        let srs = &self.srs;
        let first = srs.head.load(Ordering::Acquire);
        if first.is_null() || srs.is_wait_head(first) {
            return false;
        }
        let Some(head) = srs.get_wait_head() else {
            Stats::bump(&self.stats.wait_heads_exhausted);
            log::warn!("no free wait head, waiters ride along with the next grace period");
            return true;
        };
        // SAFETY: separators live as long as `self`.
        unsafe { srs.push(head) };
        if !srs.wait_tail.swap(head, Ordering::AcqRel).is_null() {
            self.anomaly(format_args!("previous grace period left its waiters behind"));
        }
        false
    }

    /// Grace-period end: wake the waiters fenced off at its start.
    ///
    /// 宽限期结束：唤醒在其开始时被隔离的等待者。
    pub(crate) fn sr_normal_gp_cleanup(&self) {
        let srs = &self.srs;
        let wait_tail = srs.wait_tail.swap(ptr::null_mut(), Ordering::AcqRel);
        if wait_tail.is_null() {
            return;
        }

        // SAFETY: `wait_tail` is a separator owned by this grace period, and
        // every waiter behind it stays blocked until completed here or by the
        // work item, which only starts at `done_tail` once published below.
        unsafe {
            let tail = &*wait_tail;
            let mut woken = 0;
            let mut node = tail.next.load(Ordering::Acquire);
            while !node.is_null() && !srs.is_wait_head(node) {
                let next = (*node).next.load(Ordering::Acquire);
                self.complete_waiter(node);
                tail.next.store(next, Ordering::Release);
                woken += 1;
                if woken == WAKE_INLINE {
                    break;
                }
                node = next;
            }

            // Only the previous separator is left and no work item is
            // pending: recycle it here.
            let rest = tail.next.load(Ordering::Acquire);
            if !rest.is_null()
                && srs.is_wait_head(rest)
                && (*rest).next.load(Ordering::Acquire).is_null()
                && srs.cleanups_pending.load(Ordering::Acquire) == 0
            {
                srs.put_wait_head(rest);
                tail.next.store(ptr::null_mut(), Ordering::Release);
            }

            srs.done_tail.store(wait_tail, Ordering::Release);
            if !tail.next.load(Ordering::Acquire).is_null() {
                srs.cleanups_pending.fetch_add(1, Ordering::AcqRel);
                if self.threaded {
                    if !srs.queue_work() {
                        srs.cleanups_pending.fetch_sub(1, Ordering::AcqRel);
                    }
                } else {
                    self.sr_normal_cleanup_work();
                }
            }
        }
    }

    /// Wake everything behind `done_tail` and recycle old separators.
    ///
    /// 唤醒 `done_tail` 之后的所有等待者并回收旧的分隔节点。
    pub(crate) fn sr_normal_cleanup_work(&self) {
        let srs = &self.srs;
        let done = srs.done_tail.load(Ordering::Acquire);
        if done.is_null() {
            self.anomaly(format_args!("waiter cleanup without a completed grace period"));
            return;
        }
        // SAFETY: `done` is a separator; everything detached from it is
        // either a separator or a waiter still blocked in `synchronize`.
        unsafe {
            let mut node = (*done).next.swap(ptr::null_mut(), Ordering::AcqRel);
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Acquire);
                if srs.is_wait_head(node) {
                    srs.put_wait_head(node);
                } else {
                    self.complete_waiter(node);
                }
                node = next;
            }
        }
        srs.cleanups_pending.fetch_sub(1, Ordering::Release);
    }

    /// Body of the waiter cleanup thread.
    pub(crate) fn sr_normal_worker(self: crate::sync::Arc<Self>) {
        loop {
            {
                let mut queued = self.srs.work.lock();
                while !*queued && !self.stopping() {
                    queued = self.srs.work_cv.wait(queued);
                }
                if self.stopping() && !*queued {
                    return;
                }
                *queued = false;
            }
            self.sr_normal_cleanup_work();
        }
    }

    /// Block until a full grace period has elapsed.
    ///
    /// 阻塞直到一个完整的宽限期过去。
    pub(crate) fn synchronize_normal(&self) {
        let cookie = self.get_state();
        let node = WaitNode::waiter(cookie);
        Stats::bump(&self.stats.sync_waiters);
        // SAFETY: `node` outlives its time on the list: this frame does not
        // return before a completer sets `done`, which is its last access.
        unsafe { self.srs.push(&node as *const WaitNode as *mut WaitNode) };
        self.start_poll();
        while !node.is_done() {
            if self.threaded {
                thread::park();
            } else {
                // Nobody else drives grace periods: do it from here.
                self.step();
                thread::yield_now();
            }
        }
        log::trace!("synchronize for gp {} returned", seq::gp_num(cookie));
    }
}
