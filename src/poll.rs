//! Polled grace-period cookies.
//!
//! 基于轮询的宽限期 cookie。

use crate::seq::{self, COMPLETED_COOKIE};
use crate::state::RcuState;
use crate::sync::{Ordering, fence};

impl RcuState {
    /// Cookie for the first grace period that starts after this call.
    /// 本次调用之后开始的第一个宽限期的 cookie。
    pub(crate) fn get_state(&self) -> usize {
        // Order the caller's prior accesses before the counter read.
        fence(Ordering::SeqCst);
        seq::snap(self.gp_seq.load(Ordering::Acquire))
    }

    /// Like [`get_state`](Self::get_state), and make sure that grace period will run.
    /// 与 `get_state` 相同，并确保该宽限期会运行。
    pub(crate) fn start_poll(&self) -> usize {
        let cookie = self.get_state();
        let leaf = &self.tree.leaves()[0];
        let mut guard = leaf.lock();
        let needwake = self.start_this_gp(&mut guard, None, cookie);
        drop(guard);
        if needwake {
            self.wake_gp_worker();
        }
        cookie
    }

    /// Whether a full grace period has elapsed since `cookie` was taken.
    /// 自获取 `cookie` 以来是否已经过了一个完整的宽限期。
    pub(crate) fn poll_state(&self, cookie: usize) -> bool {
        if cookie == COMPLETED_COOKIE || seq::done_exact(self.gp_seq.load(Ordering::Acquire), cookie) {
            // Order the caller's later accesses after the grace period.
            fence(Ordering::SeqCst);
            return true;
        }
        false
    }
}
