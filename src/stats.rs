use crate::sync::{AtomicUsize, Ordering};

/// Event counters of a domain, readable at any time.
/// 域的事件计数器，可随时读取。
pub(crate) struct Stats {
    pub(crate) gps_started: AtomicUsize,
    pub(crate) gps_completed: AtomicUsize,
    pub(crate) fqs_scans: AtomicUsize,
    pub(crate) idle_credits: AtomicUsize,
    pub(crate) offline_credits: AtomicUsize,
    pub(crate) resched_requests: AtomicUsize,
    pub(crate) boosts: AtomicUsize,
    pub(crate) stalls: AtomicUsize,
    pub(crate) gpwraps: AtomicUsize,
    pub(crate) cbs_queued: AtomicUsize,
    pub(crate) cbs_invoked: AtomicUsize,
    pub(crate) cbs_leaked: AtomicUsize,
    pub(crate) cbs_migrated: AtomicUsize,
    pub(crate) overloads: AtomicUsize,
    pub(crate) barriers: AtomicUsize,
    pub(crate) sync_waiters: AtomicUsize,
    pub(crate) wait_heads_exhausted: AtomicUsize,
    pub(crate) anomalies: AtomicUsize,
}

impl Stats {
    pub(crate) fn new() -> Self {
        Self {
            gps_started: AtomicUsize::new(0),
            gps_completed: AtomicUsize::new(0),
            fqs_scans: AtomicUsize::new(0),
            idle_credits: AtomicUsize::new(0),
            offline_credits: AtomicUsize::new(0),
            resched_requests: AtomicUsize::new(0),
            boosts: AtomicUsize::new(0),
            stalls: AtomicUsize::new(0),
            gpwraps: AtomicUsize::new(0),
            cbs_queued: AtomicUsize::new(0),
            cbs_invoked: AtomicUsize::new(0),
            cbs_leaked: AtomicUsize::new(0),
            cbs_migrated: AtomicUsize::new(0),
            overloads: AtomicUsize::new(0),
            barriers: AtomicUsize::new(0),
            sync_waiters: AtomicUsize::new(0),
            wait_heads_exhausted: AtomicUsize::new(0),
            anomalies: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RcuStats {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        RcuStats {
            gps_started: get(&self.gps_started),
            gps_completed: get(&self.gps_completed),
            fqs_scans: get(&self.fqs_scans),
            idle_credits: get(&self.idle_credits),
            offline_credits: get(&self.offline_credits),
            resched_requests: get(&self.resched_requests),
            boosts: get(&self.boosts),
            stalls: get(&self.stalls),
            gpwraps: get(&self.gpwraps),
            cbs_queued: get(&self.cbs_queued),
            cbs_invoked: get(&self.cbs_invoked),
            cbs_leaked: get(&self.cbs_leaked),
            cbs_migrated: get(&self.cbs_migrated),
            overloads: get(&self.overloads),
            barriers: get(&self.barriers),
            sync_waiters: get(&self.sync_waiters),
            wait_heads_exhausted: get(&self.wait_heads_exhausted),
            anomalies: get(&self.anomalies),
        }
    }
}

/// Point-in-time copy of a domain's counters.
///
/// `anomalies` counts internal inconsistencies the engine detected and
/// recovered from; it stays zero in a correct run.
///
/// 域计数器的时间点副本。
/// `anomalies` 统计引擎检测到并已恢复的内部不一致；在正确运行中它保持为零。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RcuStats {
    pub gps_started: usize,
    pub gps_completed: usize,
    pub fqs_scans: usize,
    /// Quiescent states credited because a processor was or had been idle.
    pub idle_credits: usize,
    pub offline_credits: usize,
    pub resched_requests: usize,
    pub boosts: usize,
    pub stalls: usize,
    pub gpwraps: usize,
    pub cbs_queued: usize,
    pub cbs_invoked: usize,
    /// Callbacks rejected by double-registration detection.
    pub cbs_leaked: usize,
    pub cbs_migrated: usize,
    pub overloads: usize,
    pub barriers: usize,
    pub sync_waiters: usize,
    pub wait_heads_exhausted: usize,
    pub anomalies: usize,
}
