use crate::state::GpPhase;
use std::time::Duration;

/// Escalation points where the engine asks its environment for help.
///
/// The engine cannot preempt or reschedule the threads driving processors,
/// so when a grace period drags on it reports upward instead. Every method
/// has a no-op default and is called from whichever thread drives the grace
/// period, never with a tree node or processor lock held.
///
/// 引擎向其运行环境请求帮助的升级点。
/// 引擎无法抢占或重新调度驱动处理器的线程，因此当宽限期拖延时它会向上报告。
/// 每个方法都有空操作的默认实现，并且由驱动宽限期的线程在不持有任何树节点锁或处理器锁时调用。
pub trait GpHooks: Send + Sync {
    /// Processor `id` has been holding up the grace period past the
    /// reschedule deadline; it should pass through a quiescent state soon.
    ///
    /// 处理器 `id` 拖延宽限期已超过重新调度期限；它应尽快经过一个静止状态。
    fn resched_processor(&self, _id: usize) {}

    /// Readers on processor `id` have blocked the grace period for `blocked_for`.
    /// 处理器 `id` 上的读者已阻塞宽限期达 `blocked_for`。
    fn boost_readers(&self, _id: usize, _blocked_for: Duration) {}

    /// The current grace period exceeded the stall timeout.
    /// 当前宽限期超过了停滞超时。
    fn stall_detected(&self, _report: &StallReport) {}
}

/// Hooks that do nothing.
/// 什么也不做的钩子。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl GpHooks for NoopHooks {}

/// Snapshot of a stalled grace period.
/// 一个停滞宽限期的快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    /// Number of the stalled grace period.
    pub gp_num: usize,
    pub elapsed: Duration,
    pub phase: GpPhase,
    /// Processors that still owe a quiescent state.
    pub blocking: Vec<usize>,
}
