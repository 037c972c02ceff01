use crate::batch::Budget;
use crate::domain::Rcu;
use crate::segcblist::{Callback, RcuHead};
use crate::state::RcuState;
use crate::stats::Stats;
use crate::sync::{Arc, Cell, Ordering};

/// A thread's claim on one processor of an [`Rcu`] domain.
///
/// Obtained from [`Rcu::attach`]. While attached and not idle, the processor
/// holds up every grace period until its thread reports a quiescent state
/// with [`quiescent_state`](Self::quiescent_state) or goes idle. It is
/// `!Sync` (due to `Cell`) and must be driven by one thread at a time.
///
/// Dropping the handle puts the processor back to idle and releases it.
///
/// **Thread Safety**: `Processor` is not `Sync` and must be used by only one thread.
///
/// 线程对 [`Rcu`] 域中一个处理器的占用。
/// 通过 [`Rcu::attach`] 获得。在已附加且非空闲期间，处理器会阻塞每个宽限期，
/// 直到其线程通过 `quiescent_state` 报告静止状态或进入空闲。
/// 它是 `!Sync` 的（因为 `Cell`），同一时刻只能由一个线程驱动。
/// drop 该句柄会使处理器回到空闲并释放它。
/// **线程安全性**：`Processor` 不是 `Sync` 的，必须仅由一个线程使用。
pub struct Processor {
    rcu: Rcu,
    cpu: usize,
    nesting: Cell<usize>,
    idle: Cell<bool>,
}

impl Processor {
    pub(crate) fn new(rcu: Rcu, cpu: usize) -> Self {
        rcu.state().cpus[cpu].exit_idle();
        log::debug!("attached to processor {cpu}");
        Processor {
            rcu,
            cpu,
            nesting: Cell::new(0),
            idle: Cell::new(false),
        }
    }

    #[inline]
    fn state(&self) -> &RcuState {
        self.rcu.state()
    }

    #[inline]
    fn shared(&self) -> &Arc<RcuState> {
        self.rcu.shared_state()
    }

    /// Id of this processor.
    #[inline]
    pub fn id(&self) -> usize {
        self.cpu
    }

    /// The domain this processor belongs to.
    #[inline]
    pub fn domain(&self) -> &Rcu {
        &self.rcu
    }

    /// Enter a read-side critical section.
    ///
    /// Returns a `ReadGuard`; the section lasts until every guard is dropped.
    /// Nothing read inside the section is reclaimed before it ends.
    ///
    /// **Reentrancy**: sections nest. You can also clone a guard:
    /// `let guard2 = guard1.clone();`
    ///
    /// Reading is free: no shared memory is written.
    ///
    /// Panics if the processor is idle or offline.
    ///
    /// 进入读侧临界区。
    /// 返回一个 `ReadGuard`；临界区持续到所有守卫都被 drop。在临界区内读取的数据不会在其结束前被回收。
    /// **可重入性**：临界区可以嵌套。也可以克隆守卫：`let guard2 = guard1.clone();`
    /// 读取没有开销：不会写入任何共享内存。
    /// 若处理器处于空闲或已下线则 panic。
    #[inline]
    pub fn read_lock(&self) -> ReadGuard<'_> {
        assert!(
            !self.idle.get(),
            "BUG: read-side critical section on idle processor {}",
            self.cpu
        );
        // No grace period waits on an offline processor.
        assert!(
            self.state().is_online(self.cpu),
            "BUG: read-side critical section on offline processor {}",
            self.cpu
        );
        self.nesting.set(self.nesting.get() + 1);
        ReadGuard { processor: self }
    }

    /// Whether a read-side critical section is open.
    #[inline]
    pub fn in_read_section(&self) -> bool {
        self.nesting.get() > 0
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.idle.get()
    }

    /// Checks a call site that must not sit inside a read-side section.
    /// Returns `false` (after logging) when it does, in release builds.
    #[inline]
    fn outside_reader(&self, what: &str) -> bool {
        if self.nesting.get() == 0 {
            return true;
        }
        debug_assert!(
            false,
            "BUG: {what} inside a read-side critical section on processor {}",
            self.cpu
        );
        log::error!(
            "{what} inside a read-side critical section on processor {}, ignored",
            self.cpu
        );
        false
    }

    /// Checks a call site that needs this processor online.
    /// Returns `false` (after logging) when it is not, in release builds.
    #[inline]
    fn online(&self, what: &str) -> bool {
        if self.state().is_online(self.cpu) {
            return true;
        }
        debug_assert!(false, "BUG: {what} on offline processor {}", self.cpu);
        log::error!("{what} on offline processor {}, ignored", self.cpu);
        false
    }

    /// Report that this processor holds no references obtained in earlier
    /// read-side sections, then invoke a batch of ready callbacks.
    ///
    /// Threads that keep a processor busy must call this regularly; grace
    /// periods cannot complete without it unless the processor goes idle.
    /// Calling it inside a read-side section or on an offline processor is a
    /// contract violation.
    ///
    /// 报告本处理器不再持有在先前读侧临界区中获得的任何引用，然后调用一批就绪回调。
    /// 让处理器保持忙碌的线程必须定期调用它；除非处理器进入空闲，否则没有它宽限期无法完成。
    /// 在读侧临界区内或在已下线的处理器上调用属于违约。
    pub fn quiescent_state(&self) {
        if !self.outside_reader("quiescent_state") || !self.online("quiescent_state") {
            return;
        }
        let state = self.state();
        let rdp = &state.cpus[self.cpu];
        {
            let mut local = rdp.lock();
            state.note_gp_changes(&mut local);
            local.cpu_no_qs = false;
            state.disable_urgency(rdp);
            if local.core_needs_qs {
                state.report_qs_rdp(&mut local);
            }
        }
        if state.rcu_core(rdp, Budget::Checkpoint) && state.helpers {
            rdp.kick();
        }
    }

    /// Whether the grace-period core is waiting on this processor for longer
    /// than it would like; a busy thread should call
    /// [`quiescent_state`](Self::quiescent_state) soon.
    ///
    /// 宽限期核心等待本处理器的时间是否超出预期；忙碌的线程应尽快调用 `quiescent_state`。
    #[inline]
    pub fn needs_quiescent_state(&self) -> bool {
        self.state().cpus[self.cpu].urgent_qs.load(Ordering::Acquire)
    }

    /// Whether the grace period has aged past twice the urgency delay, or
    /// the domain is flooded with callbacks, while still waiting on this
    /// processor. Stronger than
    /// [`needs_quiescent_state`](Self::needs_quiescent_state): the thread
    /// should leave any long read-side section and report right away.
    ///
    /// 宽限期在仍等待本处理器时已超过两倍的紧急延迟，或域中回调泛滥。
    /// 比 `needs_quiescent_state` 更强：线程应离开任何长读侧临界区并立即报告。
    #[inline]
    pub fn quiescent_state_overdue(&self) -> bool {
        self.state().cpus[self.cpu]
            .need_heavy_qs
            .load(Ordering::Acquire)
    }

    /// Run `f` after a grace period.
    ///
    /// Callbacks registered on one processor run in registration order. If
    /// this processor is offline the callback is queued on the lowest-numbered
    /// online processor instead.
    ///
    /// 在一个宽限期之后运行 `f`。在同一处理器上注册的回调按注册顺序运行。
    /// 如果本处理器已下线，回调会被排到编号最小的在线处理器上。
    pub fn call_rcu<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Callback::new(Box::new(f)));
    }

    /// Like [`call_rcu`](Self::call_rcu), tagged with `head` to catch the same
    /// item being deferred twice. A second registration while the first is
    /// still pending is logged and its callback is leaked, never run.
    ///
    /// 与 `call_rcu` 相同，但用 `head` 标记以捕获同一项被延迟两次。
    /// 在第一次仍未完成时的第二次注册会被记录，其回调被泄漏，永不运行。
    pub fn call_rcu_tracked<F>(&self, head: &Arc<RcuHead>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !head.try_queue() {
            let state = self.state();
            Stats::bump(&state.stats.cbs_leaked);
            let n = state.doublefrees.fetch_add(1, Ordering::Relaxed);
            if n < 3 {
                log::error!(
                    "callback deferred twice on processor {}, leaking the duplicate",
                    self.cpu
                );
            }
            std::mem::forget(f);
            return;
        }
        self.enqueue(Callback::tracked(Box::new(f), Arc::clone(head)));
    }

    fn enqueue(&self, cb: Callback) {
        let state = self.state();
        let cpu = if state.is_online(self.cpu) {
            self.cpu
        } else {
            match state.first_online() {
                Some(cpu) => {
                    log::debug!("processor {} is offline, queueing on {cpu}", self.cpu);
                    cpu
                }
                None => self.cpu,
            }
        };
        state.enqueue_callback(&state.cpus[cpu], cb);
    }

    /// Enter the extended quiescent state: the processor stops holding up
    /// grace periods until [`exit_idle`](Self::exit_idle).
    ///
    /// 进入扩展静止状态：处理器在 `exit_idle` 之前不再阻塞宽限期。
    pub fn enter_idle(&self) {
        if !self.outside_reader("enter_idle") || self.idle.get() {
            return;
        }
        self.state().cpus[self.cpu].enter_idle();
        self.idle.set(true);
    }

    pub fn exit_idle(&self) {
        if !self.idle.get() {
            return;
        }
        self.state().cpus[self.cpu].exit_idle();
        self.idle.set(false);
    }

    /// Run `f` with the processor idle, restoring the previous state after.
    fn idle_while<R>(&self, f: impl FnOnce(&Arc<RcuState>) -> R) -> R {
        let was_idle = self.idle.get();
        self.enter_idle();
        let ret = f(self.shared());
        if !was_idle {
            self.exit_idle();
        }
        ret
    }

    /// Block until a full grace period has elapsed. The processor is idle
    /// while it waits. See [`Rcu::synchronize`].
    ///
    /// 阻塞直到一个完整的宽限期过去。等待期间处理器处于空闲状态。
    pub fn synchronize(&self) {
        if !self.outside_reader("synchronize") {
            return;
        }
        self.idle_while(|state| {
            state.synchronize_normal();
            state.drain_all(true);
        });
    }

    /// Wait for a grace period unless one elapsed since `cookie` was taken.
    pub fn cond_synchronize(&self, cookie: crate::Cookie) {
        if self.state().poll_state(cookie.0) {
            return;
        }
        self.synchronize();
    }

    /// Wait for every callback already registered anywhere in the domain.
    /// The processor is idle while it waits. See [`Rcu::barrier`].
    ///
    /// 等待域中任何地方已注册的所有回调。等待期间处理器处于空闲状态。
    pub fn barrier(&self) {
        if !self.outside_reader("barrier") {
            return;
        }
        self.idle_while(|state| state.barrier());
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        let rdp = &self.rcu.state().cpus[self.cpu];
        if !self.idle.get() {
            rdp.enter_idle();
        }
        rdp.attached.store(false, Ordering::Release);
        log::debug!("detached from processor {}", self.cpu);
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.cpu)
            .field("nesting", &self.nesting.get())
            .field("idle", &self.idle.get())
            .finish()
    }
}

/// A read-side critical section on one processor.
///
/// `ReadGuard` is obtained by calling `Processor::read_lock()`.
/// It is `!Send` and `!Sync` because it references a `!Sync` `Processor`,
/// and its lifetime is bound to that processor.
///
/// Cloning nests the section; it ends when every clone is dropped.
///
/// 一个处理器上的读侧临界区。
/// `ReadGuard` 通过调用 `Processor::read_lock()` 获得。
/// 它是 `!Send` 和 `!Sync` 的，因为它引用了一个 `!Sync` 的 `Processor`，其生命周期绑定到该处理器。
/// 克隆会嵌套临界区；当所有克隆都被 drop 时临界区结束。
#[must_use]
pub struct ReadGuard<'a> {
    processor: &'a Processor,
}

impl ReadGuard<'_> {
    #[inline]
    pub fn processor(&self) -> &Processor {
        self.processor
    }
}

impl Clone for ReadGuard<'_> {
    #[inline]
    fn clone(&self) -> Self {
        let nesting = self.processor.nesting.get();

        assert!(
            nesting > 0,
            "BUG: Cloning a ReadGuard outside a read-side section (nesting = 0). \
             This indicates incorrect API usage or a library bug."
        );

        self.processor.nesting.set(nesting + 1);

        ReadGuard {
            processor: self.processor,
        }
    }
}

impl Drop for ReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        let nesting = self.processor.nesting.get();

        assert!(
            nesting > 0,
            "BUG: Dropping a ReadGuard outside a read-side section (nesting = 0). \
             This indicates incorrect API usage or a library bug."
        );

        self.processor.nesting.set(nesting - 1);
    }
}
