//! Hierarchical read-copy-update.
//!
//! Readers run without writing shared memory. Updaters publish new data,
//! then wait for a *grace period*: an interval after which every processor
//! has passed through a quiescent state, so no reader can still hold a
//! reference to what was unpublished. Reclamation is either synchronous
//! ([`Rcu::synchronize`]) or deferred to a callback ([`Processor::call_rcu`]).
//!
//! Processors report quiescent states up a combining tree: a processor
//! clears its bit in its leaf, the last bit of a node clears the node's bit in
//! its parent, and the grace period ends when the root is clear. A worker
//! thread scans for processors that are idle and credits them, asks slow ones
//! for an urgent report, and reports stalls through [`GpHooks`].
//!
//! 分层的读-复制-更新（RCU）。
//! 读者运行时不写任何共享内存。更新者发布新数据后等待一个*宽限期*：
//! 在此区间之后每个处理器都经过了一次静止状态，因此没有读者还能持有对已撤销数据的引用。
//! 回收可以是同步的（`Rcu::synchronize`），也可以延迟到回调中（`Processor::call_rcu`）。
//! 处理器沿合并树向上报告静止状态：处理器清除其在叶节点中的位，节点的最后一位清除该节点在父节点中的位，
//! 根节点清空时宽限期结束。工作线程扫描空闲的处理器并为其记账，要求慢的处理器尽快报告，并通过 `GpHooks` 报告停顿。
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use tree_rcu::Rcu;
//!
//! let rcu = Rcu::new(2).unwrap();
//! let reader = rcu.attach(0).unwrap();
//!
//! {
//!     let _guard = reader.read_lock();
//!     // read shared data here
//! }
//!
//! let freed = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&freed);
//! reader.call_rcu(move || flag.store(true, Ordering::Release));
//!
//! // Quiescent, then wait out every callback queued so far.
//! reader.quiescent_state();
//! reader.barrier();
//! assert!(freed.load(Ordering::Acquire));
//! ```

mod barrier;
mod batch;
mod config;
mod cpu;
mod domain;
mod gp;
mod hooks;
mod hotplug;
mod poll;
mod processor;
mod report;
mod segcblist;
mod seq;
mod state;
mod stats;
mod sync;
mod tree;
mod waiters;

pub use config::{BuildError, ConfigError, RcuConfig};
pub use domain::{Cookie, OffloadHandle, Rcu, RcuBuilder};
pub use gp::GpStep;
pub use hooks::{GpHooks, NoopHooks, StallReport};
pub use processor::{Processor, ReadGuard};
pub use segcblist::RcuHead;
pub use state::GpPhase;
pub use stats::RcuStats;

#[cfg(test)]
mod tests;
