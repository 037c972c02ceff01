//! Segmented callback list.
//!
//! Callbacks sit in one of four segments, oldest first:
//! `DONE` (ready to invoke), `WAIT` (waiting for the current grace period),
//! `NEXT_READY` (waiting for the one after), `NEXT` (not yet assigned).
//! `gp_seq[seg]` is the grace-period sequence value the `WAIT` and
//! `NEXT_READY` segments are waiting for. Callbacks only ever move toward
//! `DONE`, and the relative order of all callbacks is preserved.
//!
//! 分段回调链表。
//! 回调按从旧到新位于四个段之一：`DONE`（可调用）、`WAIT`（等待当前宽限期）、
//! `NEXT_READY`（等待下一个宽限期）、`NEXT`（尚未分配）。
//! `gp_seq[seg]` 是 `WAIT` 与 `NEXT_READY` 段所等待的宽限期序列值。
//! 回调只会向 `DONE` 方向移动，并且所有回调的相对顺序保持不变。

use crate::seq;
use crate::sync::{Arc, AtomicBool, Ordering};
use std::collections::VecDeque;
use std::mem;

pub(crate) const DONE: usize = 0;
pub(crate) const WAIT: usize = 1;
pub(crate) const NEXT_READY: usize = 2;
pub(crate) const NEXT: usize = 3;
const NSEGS: usize = 4;

/// Debug tag for a deferred item, used to catch double registration.
///
/// A head stays "queued" from the moment a callback carrying it is accepted
/// until just before that callback runs. Registering another callback with a
/// queued head is rejected: the new callback is leaked rather than run.
///
/// 延迟项的调试标记，用于捕获重复注册。
/// 从携带该标记的回调被接受开始，到该回调即将运行之前，标记一直处于"已排队"状态。
/// 使用已排队的标记注册另一个回调会被拒绝：新回调会被泄漏而不是被执行。
pub struct RcuHead {
    queued: AtomicBool,
}

impl Default for RcuHead {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RcuHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RcuHead")
            .field("queued", &self.is_queued())
            .finish()
    }
}

impl RcuHead {
    /// Create a new, unqueued head.
    /// 创建一个新的未排队标记。
    #[inline]
    pub fn new() -> Self {
        Self {
            queued: AtomicBool::new(false),
        }
    }

    /// Whether a callback carrying this head is still pending.
    /// 携带此标记的回调是否仍在等待中。
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Mark as queued; returns `false` if it already was.
    #[inline]
    pub(crate) fn try_queue(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }
}

pub(crate) type CallbackFn = Box<dyn FnOnce() + Send + 'static>;

/// A deferred callback and its optional debug tag.
/// 一个延迟回调及其可选的调试标记。
pub(crate) struct Callback {
    func: CallbackFn,
    head: Option<Arc<RcuHead>>,
}

impl Callback {
    #[inline]
    pub(crate) fn new(func: CallbackFn) -> Self {
        Self { func, head: None }
    }

    #[inline]
    pub(crate) fn tracked(func: CallbackFn, head: Arc<RcuHead>) -> Self {
        Self {
            func,
            head: Some(head),
        }
    }

    #[inline]
    pub(crate) fn invoke(self) {
        if let Some(head) = &self.head {
            head.queued.store(false, Ordering::Release);
        }
        (self.func)();
    }
}

/// Per-processor list of callbacks partitioned by the grace period they await.
/// 按所等待的宽限期划分的每处理器回调链表。
pub(crate) struct SegCbList {
    segs: [VecDeque<Callback>; NSEGS],
    gp_seq: [usize; NSEGS],
    /// Callbacks owned by this list, including ones extracted for invocation
    /// and not yet accounted for with `sub_len`.
    /// 本链表拥有的回调数量，包括已取出等待调用但尚未通过 `sub_len` 扣除的回调。
    len: usize,
}

impl SegCbList {
    pub(crate) fn new() -> Self {
        Self {
            segs: Default::default(),
            gp_seq: [0; NSEGS],
            len: 0,
        }
    }

    /// Total callbacks, including any extracted batch still in flight.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.segs.iter().all(VecDeque::is_empty)
    }

    #[inline]
    pub(crate) fn seg_len(&self, seg: usize) -> usize {
        self.segs[seg].len()
    }

    #[cfg(test)]
    pub(crate) fn seg_gp_seq(&self, seg: usize) -> usize {
        self.gp_seq[seg]
    }

    /// Any callbacks ready to invoke?
    #[inline]
    pub(crate) fn ready_cbs(&self) -> bool {
        !self.segs[DONE].is_empty()
    }

    /// Any callbacks still waiting for a grace period?
    #[inline]
    pub(crate) fn pend_cbs(&self) -> bool {
        !self.restempty(DONE)
    }

    /// Number of callbacks still waiting for a grace period.
    #[inline]
    pub(crate) fn pend_len(&self) -> usize {
        self.segs[WAIT..].iter().map(VecDeque::len).sum()
    }

    /// Are all segments after `seg` empty?
    #[inline]
    pub(crate) fn restempty(&self, seg: usize) -> bool {
        self.segs[seg + 1..].iter().all(VecDeque::is_empty)
    }

    /// Append a new, unassigned callback.
    #[inline]
    pub(crate) fn enqueue(&mut self, cb: Callback) {
        self.segs[NEXT].push_back(cb);
        self.len += 1;
    }

    /// Append `cb` behind every callback already queued, in the newest
    /// non-empty segment, so it becomes ready no earlier than all of them.
    /// Hands the callback back if the list is empty.
    ///
    /// 将 `cb` 追加到已排队的所有回调之后（位于最新的非空段中），
    /// 使其不会早于它们中的任何一个就绪。如果链表为空则将回调交还。
    pub(crate) fn entrain(&mut self, cb: Callback) -> Result<(), Callback> {
        if self.len == 0 {
            return Err(cb);
        }
        let seg = (DONE..NSEGS)
            .rev()
            .find(|&seg| !self.segs[seg].is_empty())
            .unwrap_or(DONE);
        self.segs[seg].push_back(cb);
        self.len += 1;
        Ok(())
    }

    /// Move every callback whose grace period has completed as of `seq` to
    /// `DONE`, then compact the remaining waiting segments downward.
    ///
    /// 将所有宽限期已于 `seq` 完成的回调移入 `DONE`，然后将剩余的等待段向下压缩。
    pub(crate) fn advance(&mut self, seq: usize) {
        if !self.pend_cbs() {
            return;
        }

        let mut i = WAIT;
        while i < NEXT {
            if seq::cmp_lt(seq, self.gp_seq[i]) {
                break;
            }
            let mut seg = mem::take(&mut self.segs[i]);
            self.segs[DONE].append(&mut seg);
            i += 1;
        }
        if i == WAIT {
            return;
        }

        // Segments WAIT..i are empty now; slide the survivors into them.
        let mut j = WAIT;
        while i < NEXT {
            if self.segs[i..].iter().all(VecDeque::is_empty) {
                break;
            }
            self.segs.swap(j, i);
            self.gp_seq[j] = self.gp_seq[i];
            i += 1;
            j += 1;
        }
    }

    /// Assign `seq` to every callback that is unassigned or was assigned a
    /// later grace period than needed, merging them into one segment.
    /// Returns `true` if anything was assigned, meaning `seq` must be requested.
    ///
    /// 将 `seq` 分配给所有未分配的回调以及被分配了比所需更晚宽限期的回调，并把它们合并到同一段。
    /// 若有任何回调被分配则返回 `true`，表示必须请求 `seq` 对应的宽限期。
    pub(crate) fn accelerate(&mut self, seq: usize) -> bool {
        if self.restempty(DONE) {
            return false;
        }

        // Find the newest segment that already waits for an earlier grace period.
        let mut i = NEXT_READY;
        while i > DONE {
            if !self.segs[i].is_empty() && seq::cmp_lt(self.gp_seq[i], seq) {
                break;
            }
            i -= 1;
        }

        if self.restempty(i) {
            return false;
        }
        i += 1;
        if i >= NEXT {
            return false;
        }

        for j in i + 1..NSEGS {
            let mut seg = mem::take(&mut self.segs[j]);
            self.segs[i].append(&mut seg);
        }
        for j in i..NEXT {
            self.gp_seq[j] = seq;
        }
        true
    }

    /// Take the ready callbacks. The list length is left unchanged until the
    /// caller settles it with [`insert_done`](Self::insert_done) and
    /// [`sub_len`](Self::sub_len).
    ///
    /// 取出就绪的回调。链表长度保持不变，直到调用者通过 `insert_done` 和 `sub_len` 结算。
    #[inline]
    pub(crate) fn extract_done(&mut self) -> VecDeque<Callback> {
        mem::take(&mut self.segs[DONE])
    }

    /// Put back ready callbacks ahead of any that became ready meanwhile.
    #[inline]
    pub(crate) fn insert_done(&mut self, mut cbs: VecDeque<Callback>) {
        if cbs.is_empty() {
            return;
        }
        cbs.append(&mut self.segs[DONE]);
        self.segs[DONE] = cbs;
    }

    #[inline]
    pub(crate) fn sub_len(&mut self, n: usize) {
        debug_assert!(n <= self.len, "BUG: callback count underflow");
        self.len -= n;
    }

    /// Move every callback of `src` onto this list: its ready callbacks ahead
    /// of ours, its waiting ones unassigned at our tail.
    ///
    /// 将 `src` 的所有回调移入本链表：其就绪回调放在本链表就绪回调之前，
    /// 其等待中的回调以未分配状态放在本链表尾部。
    pub(crate) fn merge(&mut self, src: &mut SegCbList) {
        let done = mem::take(&mut src.segs[DONE]);
        let moved = src.len;
        src.len = 0;

        self.insert_done(done);
        for seg in WAIT..NSEGS {
            let mut pending = mem::take(&mut src.segs[seg]);
            self.segs[NEXT].append(&mut pending);
        }
        self.len += moved;
    }

    /// Drop every callback without running it.
    /// 丢弃所有回调而不执行。
    pub(crate) fn discard(&mut self) -> usize {
        let dropped = self.segs.iter().map(VecDeque::len).sum();
        for seg in &mut self.segs {
            seg.clear();
        }
        self.len = 0;
        dropped
    }
}
