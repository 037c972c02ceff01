use crate::barrier::BarrierState;
use crate::config::Tunables;
use crate::cpu::CpuData;
use crate::hooks::GpHooks;
use crate::seq;
use crate::stats::Stats;
use crate::sync::{Arc, AtomicBool, AtomicU64, AtomicUsize, Condvar, Mutex, Ordering};
use crate::tree::Tree;
use crate::waiters::SrNormal;
use std::time::{Duration, Instant};

/// Start a new grace period.
/// 开始一个新的宽限期。
pub(crate) const GP_FLAG_INIT: usize = 0x1;
/// Scan for quiescent states now.
/// 立即扫描静止状态。
pub(crate) const GP_FLAG_FQS: usize = 0x2;
/// Callback overload: scan immediately and more often.
/// 回调过载：立即并更频繁地扫描。
pub(crate) const GP_FLAG_OVLD: usize = 0x4;

/// Where the grace-period state machine currently is.
/// 宽限期状态机当前所处的阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpPhase {
    /// No grace period running and none requested yet.
    Idle,
    /// Worker sleeping until a grace period is requested.
    WaitingForRequest,
    /// Folding online/offline changes into the tree.
    Onoff,
    /// Broadcasting the new grace period to every node.
    Init,
    /// Waiting for quiescent states or the next scan.
    WaitingFqs,
    /// Scanning for quiescent states.
    DoingFqs,
    /// Publishing completion.
    Cleanup,
}

impl GpPhase {
    const ALL: [GpPhase; 7] = [
        GpPhase::Idle,
        GpPhase::WaitingForRequest,
        GpPhase::Onoff,
        GpPhase::Init,
        GpPhase::WaitingFqs,
        GpPhase::DoingFqs,
        GpPhase::Cleanup,
    ];

    fn from_index(index: usize) -> Self {
        Self::ALL.get(index).copied().unwrap_or(GpPhase::Idle)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A sleep/wake point: a condition is re-checked under the lock, so a wake
/// issued after the condition became true is never lost.
///
/// 一个睡眠/唤醒点：条件在锁内重新检查，因此在条件成立后发出的唤醒不会丢失。
pub(crate) struct WaitQueue {
    lock: Mutex<()>,
    cv: Condvar,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }

    /// Block until `cond` holds or `deadline` passes; returns whether `cond` held.
    /// 阻塞直到 `cond` 成立或超过 `deadline`；返回 `cond` 是否成立。
    pub(crate) fn wait_until(&self, deadline: Option<Instant>, mut cond: impl FnMut() -> bool) -> bool {
        let mut guard = self.lock.lock();
        loop {
            if cond() {
                return true;
            }
            match deadline {
                None => guard = self.cv.wait(guard),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    guard = self.cv.wait_timeout(guard, deadline - now).0;
                }
            }
        }
    }
}

/// Progress of the state machine between steps, shared by the worker thread
/// and manual drivers.
/// 状态机在步骤之间的进度，由工作线程和手动驱动者共享。
#[derive(Debug, Default)]
pub(crate) struct GpDriver {
    /// A grace period has been initialized and not yet cleaned up.
    pub(crate) forcing: bool,
    /// The next scan is the first of this grace period.
    pub(crate) first_fqs: bool,
}

/// Global state of one grace-period domain.
///
/// 一个宽限期域的全局状态。
#[repr(align(64))]
pub(crate) struct RcuState {
    pub(crate) tun: Tunables,
    pub(crate) tree: Tree,
    pub(crate) cpus: Box<[CpuData]>,
    /// Authoritative grace-period sequence.
    /// 权威的宽限期序列号。
    pub(crate) gp_seq: AtomicUsize,
    pub(crate) gp_flags: AtomicUsize,
    gp_phase: AtomicUsize,
    /// Clock readings in nanoseconds since `epoch`.
    /// 自 `epoch` 起的纳秒时钟读数。
    pub(crate) gp_start: AtomicU64,
    pub(crate) gp_max: AtomicU64,
    pub(crate) jiffies_force_qs: AtomicU64,
    pub(crate) jiffies_resched: AtomicU64,
    pub(crate) jiffies_stall: AtomicU64,
    pub(crate) cbovld: AtomicBool,
    pub(crate) cbovldnext: AtomicBool,
    pub(crate) n_force_qs: AtomicUsize,
    pub(crate) n_online: AtomicUsize,
    /// Serializes online/offline transitions with the ONOFF phase.
    /// 将上线/下线转换与 ONOFF 阶段串行化。
    pub(crate) ofl_lock: Mutex<()>,
    /// Serializes whole hot-plug operations against each other.
    pub(crate) hotplug_lock: Mutex<()>,
    pub(crate) gp_wq: WaitQueue,
    pub(crate) driver: Mutex<GpDriver>,
    pub(crate) srs: SrNormal,
    pub(crate) barrier: BarrierState,
    pub(crate) hooks: Arc<dyn GpHooks>,
    pub(crate) stats: Stats,
    pub(crate) doublefrees: AtomicUsize,
    pub(crate) stop: AtomicBool,
    /// Background threads exist: worker-side work is queued rather than run inline.
    /// 后台线程存在：工作线程侧的工作被排队而不是内联执行。
    pub(crate) threaded: bool,
    pub(crate) helpers: bool,
    epoch: Instant,
}

impl RcuState {
    pub(crate) fn new(
        tun: Tunables,
        online: &[usize],
        hooks: Arc<dyn GpHooks>,
        threaded: bool,
        helpers: bool,
    ) -> Self {
        let gp_seq = seq::INITIAL_GP_SEQ;
        let tree = Tree::new(tun.processors, tun.leaf_fanout, tun.interior_fanout, gp_seq);
        let cpus: Box<[CpuData]> = (0..tun.processors)
            .map(|cpu| {
                let leaf = tree.leaf_of(cpu);
                CpuData::new(cpu, leaf, tree.cpu_grpmask(cpu), gp_seq, tun.blimit)
            })
            .collect();

        for &cpu in online {
            let leaf = tree.node(cpus[cpu].leaf);
            let mut guard = leaf.lock();
            let mask = guard.qsmaskinitnext() | cpus[cpu].grpmask;
            guard.set_qsmaskinitnext(mask);
        }
        let n_online = cpus
            .iter()
            .filter(|rdp| tree.node(rdp.leaf).qsmaskinitnext() & rdp.grpmask != 0)
            .count();

        Self {
            tree,
            cpus,
            gp_seq: AtomicUsize::new(gp_seq),
            gp_flags: AtomicUsize::new(0),
            gp_phase: AtomicUsize::new(GpPhase::Idle.index()),
            gp_start: AtomicU64::new(0),
            gp_max: AtomicU64::new(0),
            jiffies_force_qs: AtomicU64::new(0),
            jiffies_resched: AtomicU64::new(u64::MAX),
            jiffies_stall: AtomicU64::new(u64::MAX),
            cbovld: AtomicBool::new(false),
            cbovldnext: AtomicBool::new(false),
            n_force_qs: AtomicUsize::new(0),
            n_online: AtomicUsize::new(n_online),
            ofl_lock: Mutex::new(()),
            hotplug_lock: Mutex::new(()),
            gp_wq: WaitQueue::new(),
            driver: Mutex::new(GpDriver::default()),
            srs: SrNormal::new(),
            barrier: BarrierState::new(),
            hooks,
            stats: Stats::new(),
            doublefrees: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            threaded,
            helpers,
            epoch: Instant::now(),
            tun,
        }
    }

    /// Nanoseconds since the domain was built.
    /// 自域构建以来的纳秒数。
    #[inline]
    pub(crate) fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    #[inline]
    pub(crate) fn deadline(&self, at: u64) -> Instant {
        self.epoch + Duration::from_nanos(at)
    }

    #[inline]
    pub(crate) fn gp_in_progress(&self) -> bool {
        seq::in_progress(self.gp_seq.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn phase(&self) -> GpPhase {
        GpPhase::from_index(self.gp_phase.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_phase(&self, phase: GpPhase) {
        self.gp_phase.store(phase.index(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Wake the grace-period worker if it has anything to do.
    /// 如果宽限期工作线程有事可做则唤醒它。
    #[inline]
    pub(crate) fn wake_gp_worker(&self) {
        if self.gp_flags.load(Ordering::Acquire) == 0 && !self.stopping() {
            return;
        }
        self.gp_wq.wake_all();
    }

    #[inline]
    pub(crate) fn is_online(&self, cpu: usize) -> bool {
        let rdp = &self.cpus[cpu];
        self.tree.node(rdp.leaf).qsmaskinitnext() & rdp.grpmask != 0
    }

    /// Lowest-numbered online processor.
    pub(crate) fn first_online(&self) -> Option<usize> {
        (0..self.cpus.len()).find(|&cpu| self.is_online(cpu))
    }

    /// Report an engine-internal inconsistency: counted and logged, never fatal.
    /// 报告引擎内部的不一致：计数并记录日志，从不致命。
    pub(crate) fn anomaly(&self, what: std::fmt::Arguments<'_>) {
        self.stats.anomalies.fetch_add(1, Ordering::Relaxed);
        log::warn!("rcu anomaly: {what}");
    }
}
