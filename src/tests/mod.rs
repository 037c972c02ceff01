mod concurrent_tests;
mod edge_case_tests;
mod lifecycle_tests;

use crate::{Rcu, RcuBuilder};

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A domain without worker threads: grace periods only advance when a test
/// steps them or blocks in `synchronize`/`barrier`.
pub(crate) fn manual(processors: usize) -> RcuBuilder {
    init_logger();
    Rcu::builder()
        .processors(processors)
        .leaf_fanout(2)
        .interior_fanout(2)
        .spawn_workers(false)
}

/// Step until the running grace period completes, failing after `limit` steps.
pub(crate) fn step_to_completion(rcu: &Rcu, limit: usize) {
    for _ in 0..limit {
        if rcu.step_grace_period() == crate::GpStep::Completed {
            return;
        }
    }
    panic!("grace period did not complete within {limit} steps");
}
