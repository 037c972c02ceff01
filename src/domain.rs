use crate::config::{BuildError, RcuConfig};
use crate::gp::GpStep;
use crate::hooks::{GpHooks, NoopHooks};
use crate::processor::Processor;
use crate::seq::{self, COMPLETED_COOKIE};
use crate::state::{GpPhase, RcuState};
use crate::stats::RcuStats;
use crate::sync::{self, Arc, JoinHandle, Mutex, Ordering};
use std::time::Duration;

/// Builder for configuring an `Rcu` domain.
///
/// Every setter mirrors a field of [`RcuConfig`]; delays left unset are
/// derived from the processor count at build time.
///
/// # Example
/// ```
/// use tree_rcu::Rcu;
///
/// let rcu = Rcu::builder()
///     .processors(4)
///     .leaf_fanout(2)
///     .build()
///     .unwrap();
/// assert_eq!(rcu.num_processors(), 4);
/// ```
///
/// 用于配置 `Rcu` 域的构建器。
/// 每个设置方法对应 [`RcuConfig`] 的一个字段；未设置的延迟会在构建时根据处理器数量推导。
pub struct RcuBuilder {
    config: RcuConfig,
    hooks: Arc<dyn GpHooks>,
}

impl RcuBuilder {
    /// Create a new builder with default settings.
    /// 创建一个带有默认设置的新构建器。
    #[inline]
    pub fn new() -> Self {
        Self {
            config: RcuConfig::default(),
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Start from a complete configuration.
    #[inline]
    pub fn config(mut self, config: RcuConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of processors in the domain.
    ///
    /// Default: the machine's available parallelism.
    ///
    /// 域中的处理器数量。默认：机器的可用并行度。
    #[inline]
    pub fn processors(mut self, processors: usize) -> Self {
        self.config.processors = processors;
        self
    }

    /// Processors per leaf of the combining tree. Default: `16`
    #[inline]
    pub fn leaf_fanout(mut self, fanout: usize) -> Self {
        self.config.leaf_fanout = fanout;
        self
    }

    /// Children per interior node. Default: `64`
    #[inline]
    pub fn interior_fanout(mut self, fanout: usize) -> Self {
        self.config.interior_fanout = fanout;
        self
    }

    /// Callbacks invoked per batch in normal operation. Default: `10`
    #[inline]
    pub fn blimit(mut self, blimit: usize) -> Self {
        self.config.blimit = blimit;
        self
    }

    /// Batch limit while a processor is flooded. Default: `10000`
    #[inline]
    pub fn max_blimit(mut self, max_blimit: usize) -> Self {
        self.config.max_blimit = max_blimit;
        self
    }

    /// Queue growth that triggers flood handling. Default: `10000`
    #[inline]
    pub fn qhimark(mut self, qhimark: usize) -> Self {
        self.config.qhimark = qhimark;
        self
    }

    /// Queue length at which flood handling ends. Default: `100`
    #[inline]
    pub fn qlowmark(mut self, qlowmark: usize) -> Self {
        self.config.qlowmark = qlowmark;
        self
    }

    /// Queue length that marks a processor overloaded and speeds up scans.
    ///
    /// Pass `None` for `2 * qhimark`, `Some(0)` to disable.
    ///
    /// 标记处理器过载并加快扫描的队列长度。传递 `None` 表示 `2 * qhimark`，`Some(0)` 表示禁用。
    #[inline]
    pub fn qovld(mut self, qovld: impl Into<Option<usize>>) -> Self {
        self.config.qovld = qovld.into();
        self
    }

    /// Ready callbacks are invoked at least `pending >> divisor` per batch. Default: `7`
    #[inline]
    pub fn batch_divisor(mut self, divisor: u32) -> Self {
        self.config.batch_divisor = divisor;
        self
    }

    /// Time limit of large batches, clamped to 1ms..=1s. Default: `3ms`
    #[inline]
    pub fn batch_time_limit(mut self, limit: Duration) -> Self {
        self.config.batch_time_limit = limit;
        self
    }

    /// Delay before the first scan of a grace period. `None` derives it.
    #[inline]
    pub fn first_fqs_delay(mut self, delay: impl Into<Option<Duration>>) -> Self {
        self.config.first_fqs_delay = delay.into();
        self
    }

    /// Delay between later scans. `None` derives it.
    #[inline]
    pub fn next_fqs_delay(mut self, delay: impl Into<Option<Duration>>) -> Self {
        self.config.next_fqs_delay = delay.into();
        self
    }

    /// Grace-period age at which processors are asked for an urgent report.
    /// `None` derives it.
    #[inline]
    pub fn sched_qs_delay(mut self, delay: impl Into<Option<Duration>>) -> Self {
        self.config.sched_qs_delay = delay.into();
        self
    }

    /// Grace-period age at which blocking readers are reported for boosting. Default: `500ms`
    #[inline]
    pub fn boost_delay(mut self, delay: Duration) -> Self {
        self.config.boost_delay = delay;
        self
    }

    /// Grace-period age reported as a stall. Default: `21s`
    #[inline]
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.stall_timeout = timeout;
        self
    }

    /// Grace periods a processor may fall behind before its view counts as wrapped.
    #[inline]
    pub fn gpwrap_lag(mut self, grace_periods: usize) -> Self {
        self.config.gpwrap_lag = grace_periods.saturating_mul(1 << seq::SEQ_CTR_SHIFT);
        self
    }

    /// Run the grace-period worker threads.
    ///
    /// With `false`, nothing happens in the background: grace periods advance
    /// through [`Rcu::step_grace_period`] or from inside blocking calls.
    ///
    /// Default: `true`
    ///
    /// 运行宽限期工作线程。为 `false` 时后台不做任何事：
    /// 宽限期通过 `Rcu::step_grace_period` 或在阻塞调用内部推进。
    #[inline]
    pub fn spawn_workers(mut self, spawn: bool) -> Self {
        self.config.spawn_workers = spawn;
        self
    }

    /// Run one callback helper thread per processor. Default: `true`
    #[inline]
    pub fn callback_helpers(mut self, helpers: bool) -> Self {
        self.config.callback_helpers = helpers;
        self
    }

    /// Processors online at start. Default: all.
    #[inline]
    pub fn initial_online(mut self, online: impl IntoIterator<Item = usize>) -> Self {
        self.config.initial_online = Some(online.into_iter().collect());
        self
    }

    /// Escalation hooks. Default: [`NoopHooks`].
    #[inline]
    pub fn hooks(mut self, hooks: impl GpHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Build the `Rcu` domain with the configured settings.
    ///
    /// 使用配置的设置构建 `Rcu` 域。
    pub fn build(self) -> Result<Rcu, BuildError> {
        let tun = self.config.resolve()?;
        let online: Vec<usize> = match &self.config.initial_online {
            Some(online) => online.clone(),
            None => (0..tun.processors).collect(),
        };
        let threaded = self.config.spawn_workers;
        let helpers = threaded && self.config.callback_helpers;
        log::debug!(
            "building rcu domain: {} processors, {} online, workers {threaded}, helpers {helpers}",
            tun.processors,
            online.len()
        );

        let processors = tun.processors;
        let state = Arc::new(RcuState::new(tun, &online, self.hooks, threaded, helpers));
        let rcu = Rcu {
            shared: Arc::new(Shared {
                state: Arc::clone(&state),
                threads: Mutex::new(Vec::new()),
            }),
        };

        if threaded {
            let mut threads = rcu.shared.threads.lock();
            let gp = Arc::clone(&state);
            threads.push(spawn("rcu-gp".to_string(), move || gp.gp_kthread())?);
            let srs = Arc::clone(&state);
            threads.push(spawn("rcu-sync".to_string(), move || srs.sr_normal_worker())?);
            if helpers {
                for cpu in 0..processors {
                    let helper = Arc::clone(&state);
                    threads.push(spawn(format!("rcuc/{cpu}"), move || helper.callback_helper(cpu))?);
                }
            }
        }
        Ok(rcu)
    }
}

fn spawn<F>(name: String, f: F) -> Result<JoinHandle<()>, BuildError>
where
    F: FnOnce() + Send + 'static,
{
    sync::spawn(name.clone(), f).map_err(|source| BuildError::Spawn { thread: name, source })
}

impl Default for RcuBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of grace-period progress, for polling.
///
/// 宽限期进度的快照，用于轮询。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(pub(crate) usize);

struct Shared {
    state: Arc<RcuState>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = &self.state;
        // Every handle is gone, so every processor is idle: let the queued
        // callbacks run before the workers go away.
        state.barrier();
        let threads = std::mem::take(&mut *self.threads.lock());

        state.stop.store(true, Ordering::Release);
        state.gp_wq.wake_all();
        state.srs.wake_worker();
        for rdp in state.cpus.iter() {
            rdp.kick();
        }
        for handle in threads {
            if handle.join().is_err() {
                log::error!("rcu worker thread panicked");
            }
        }

        let dropped: usize = state
            .cpus
            .iter()
            .map(|rdp| rdp.lock().cblist.discard())
            .sum();
        if dropped > 0 {
            log::debug!("discarded {dropped} callbacks that never became ready");
        }
    }
}

/// A grace-period domain.
///
/// `Rcu` is the entry point: it owns the combining tree and the per-processor
/// records, and hands out [`Processor`] handles to the threads that read.
/// Updaters publish new data, then either wait with
/// [`synchronize`](Self::synchronize) or defer reclamation with
/// [`Processor::call_rcu`].
///
/// `Rcu` is `Clone` and can be safely shared across threads. The domain and
/// its worker threads live until the last clone (including every attached
/// `Processor`) is dropped; callbacks still pending then are run first.
///
/// **Typical Usage**:
/// ```
/// use tree_rcu::Rcu;
///
/// let rcu = Rcu::new(2).unwrap();
///
/// let p0 = rcu.attach(0).unwrap();
/// {
///     let _guard = p0.read_lock();
///     // read shared data
/// }
/// p0.quiescent_state();
/// drop(p0);
///
/// rcu.synchronize();
/// ```
///
/// 一个宽限期域。
/// `Rcu` 是入口点：它拥有合并树和每处理器记录，并向读者线程分发 [`Processor`] 句柄。
/// 更新者发布新数据，然后要么用 `synchronize` 等待，要么用 `Processor::call_rcu` 延迟回收。
/// `Rcu` 是 `Clone` 的，可以安全地在线程间共享。域及其工作线程一直存活到最后一个克隆
/// （包括每个已附加的 `Processor`）被 drop；届时仍在等待的回调会先被执行。
#[derive(Clone)]
pub struct Rcu {
    shared: Arc<Shared>,
}

impl Rcu {
    /// Create a domain of `processors` processors with default settings.
    /// 使用默认设置创建一个包含 `processors` 个处理器的域。
    #[inline]
    pub fn new(processors: usize) -> Result<Self, BuildError> {
        Self::builder().processors(processors).build()
    }

    /// Create a builder for configuring the domain.
    /// 创建一个用于配置域的构建器。
    #[inline]
    pub fn builder() -> RcuBuilder {
        RcuBuilder::new()
    }

    #[inline]
    pub(crate) fn state(&self) -> &RcuState {
        &self.shared.state
    }

    #[inline]
    pub(crate) fn shared_state(&self) -> &Arc<RcuState> {
        &self.shared.state
    }

    /// Attach the calling thread to processor `id`.
    ///
    /// Returns `None` if `id` is out of range or another handle holds it.
    /// The processor starts out watching (not idle).
    ///
    /// 将调用线程附加到处理器 `id`。若 `id` 越界或已被其他句柄占用则返回 `None`。
    /// 处理器一开始处于观察状态（非空闲）。
    pub fn attach(&self, id: usize) -> Option<Processor> {
        let rdp = self.state().cpus.get(id)?;
        if rdp
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("processor {id} is already attached");
            return None;
        }
        Some(Processor::new(self.clone(), id))
    }

    /// Block until a full grace period has elapsed, then run every callback
    /// whose grace period has completed.
    ///
    /// Must not be called from a thread holding a non-idle [`Processor`];
    /// use [`Processor::synchronize`] there.
    ///
    /// 阻塞直到一个完整的宽限期过去，然后运行所有宽限期已完成的回调。
    /// 不得在持有非空闲 `Processor` 的线程中调用；请改用 `Processor::synchronize`。
    pub fn synchronize(&self) {
        let state = self.state();
        state.synchronize_normal();
        state.drain_all(true);
    }

    /// Cookie for the next full grace period.
    /// 下一个完整宽限期的 cookie。
    #[inline]
    pub fn get_state(&self) -> Cookie {
        Cookie(self.state().get_state())
    }

    /// A cookie that every poll treats as already completed.
    #[inline]
    pub fn get_completed_state(&self) -> Cookie {
        Cookie(COMPLETED_COOKIE)
    }

    /// Like [`get_state`](Self::get_state), and make sure that grace period
    /// will actually run.
    ///
    /// 与 `get_state` 相同，并确保该宽限期会实际运行。
    #[inline]
    pub fn start_poll(&self) -> Cookie {
        Cookie(self.state().start_poll())
    }

    /// Whether a full grace period has elapsed since `cookie` was taken.
    /// 自获取 `cookie` 以来是否已经过了一个完整的宽限期。
    #[inline]
    pub fn poll_state(&self, cookie: Cookie) -> bool {
        self.state().poll_state(cookie.0)
    }

    /// Wait for a grace period unless one elapsed since `cookie` was taken.
    pub fn cond_synchronize(&self, cookie: Cookie) {
        if !self.poll_state(cookie) {
            self.synchronize();
        }
    }

    /// Wait until every callback registered before this call has run.
    ///
    /// Callbacks of processors handed to an [`OffloadHandle`] only run when
    /// their owner invokes them, so the owner must keep doing so meanwhile.
    ///
    /// 等待本次调用之前注册的所有回调都运行完毕。
    /// 交给 `OffloadHandle` 的处理器的回调只有在其所有者调用时才会运行，因此所有者在此期间必须持续调用。
    pub fn barrier(&self) {
        self.state().barrier();
    }

    /// Ask the worker to scan for quiescent states now instead of waiting
    /// for the next scheduled scan.
    #[inline]
    pub fn force_quiescent_state(&self) {
        let state = self.state();
        state.force_quiescent_state(state.tree.leaves()[0].index);
    }

    /// Bring processor `id` online. Returns `false` if it is out of range or
    /// already online.
    pub fn note_processor_online(&self, id: usize) -> bool {
        if id >= self.num_processors() {
            log::warn!("processor {id} is out of range");
            return false;
        }
        self.state().cpu_online(id)
    }

    /// Take processor `id` offline, moving its callbacks elsewhere.
    /// Returns `false` if it is out of range, already offline, or the last
    /// one online.
    ///
    /// 使处理器 `id` 下线，并将其回调移到别处。若越界、已下线或是最后一个在线处理器则返回 `false`。
    pub fn note_processor_offline(&self, id: usize) -> bool {
        if id >= self.num_processors() {
            log::warn!("processor {id} is out of range");
            return false;
        }
        self.state().cpu_offline(id)
    }

    #[inline]
    pub fn is_online(&self, id: usize) -> bool {
        id < self.num_processors() && self.state().is_online(id)
    }

    /// Take over invocation of processor `id`'s callbacks.
    ///
    /// Until the handle is dropped, nothing else invokes them; the owner
    /// calls [`OffloadHandle::invoke_ready`]. Returns `None` if `id` is out of
    /// range or already offloaded.
    ///
    /// 接管处理器 `id` 回调的调用。在句柄被 drop 之前，其他任何人都不会调用它们；
    /// 由所有者调用 `OffloadHandle::invoke_ready`。若 `id` 越界或已被接管则返回 `None`。
    pub fn claim_offload(&self, id: usize) -> Option<OffloadHandle> {
        let rdp = self.state().cpus.get(id)?;
        if rdp
            .offloaded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        log::debug!("processor {id} callbacks offloaded");
        Some(OffloadHandle {
            rcu: self.clone(),
            cpu: id,
        })
    }

    /// Advance the grace-period state machine by one step.
    ///
    /// Meant for domains built with `spawn_workers(false)`. Scans run
    /// immediately instead of waiting out their delays. With workers
    /// running it is safe to interleave: the worker picks up a grace period
    /// a step started and never ends one that still owes reports.
    ///
    /// 将宽限期状态机推进一步。用于以 `spawn_workers(false)` 构建的域。扫描会立即运行而不等待其延迟。
    /// 在工作线程运行时也可以交错调用：工作线程会接管由步进启动的宽限期，且不会结束仍欠报告的宽限期。
    #[inline]
    pub fn step_grace_period(&self) -> GpStep {
        self.state().step()
    }

    /// Invoke every ready callback of every processor that is not offloaded
    /// and not being invoked by someone else. Returns how many ran.
    ///
    /// 调用每个未被接管且未被他人调用的处理器的所有就绪回调。返回运行的数量。
    #[inline]
    pub fn invoke_ready_callbacks(&self) -> usize {
        self.state().drain_all(false)
    }

    #[inline]
    pub fn stats(&self) -> RcuStats {
        self.state().stats.snapshot()
    }

    /// Number of grace periods completed so far.
    #[inline]
    pub fn completed_grace_periods(&self) -> usize {
        seq::gp_num(self.state().gp_seq.load(Ordering::Acquire))
    }

    #[inline]
    pub fn gp_in_progress(&self) -> bool {
        self.state().gp_in_progress()
    }

    #[inline]
    pub fn phase(&self) -> GpPhase {
        self.state().phase()
    }

    /// Longest grace period seen so far.
    #[inline]
    pub fn longest_grace_period(&self) -> Duration {
        Duration::from_nanos(self.state().gp_max.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn num_processors(&self) -> usize {
        self.state().cpus.len()
    }

    /// Pending callbacks on processor `id`, including any batch being invoked.
    #[inline]
    pub fn pending_callbacks(&self, id: usize) -> usize {
        self.state().cpus.get(id).map_or(0, |rdp| rdp.n_cbs())
    }
}

impl std::fmt::Debug for Rcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rcu")
            .field("processors", &self.num_processors())
            .field("completed", &self.completed_grace_periods())
            .field("phase", &self.phase())
            .finish()
    }
}

/// Exclusive ownership of one processor's callback invocation.
///
/// Obtained from [`Rcu::claim_offload`]. Dropping it hands invocation back
/// to the domain.
///
/// 对某个处理器回调调用的独占所有权。通过 `Rcu::claim_offload` 获得。drop 它会将调用交还给域。
pub struct OffloadHandle {
    rcu: Rcu,
    cpu: usize,
}

impl OffloadHandle {
    #[inline]
    pub fn id(&self) -> usize {
        self.cpu
    }

    /// Invoke every callback of this processor whose grace period has
    /// completed. Returns how many ran.
    ///
    /// 调用本处理器所有宽限期已完成的回调。返回运行的数量。
    pub fn invoke_ready(&self) -> usize {
        let state = self.rcu.state();
        state.drain_ready(&state.cpus[self.cpu], true)
    }

    /// Wait up to `timeout` for a grace period to end while this processor
    /// has callbacks. Returns `true` if woken before the timeout.
    ///
    /// 在本处理器有回调时，最多等待 `timeout` 直到某个宽限期结束。若在超时前被唤醒则返回 `true`。
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let state = self.rcu.state();
        state.cpus[self.cpu].wait_for_work(Some(timeout), || state.stopping(), || true)
    }
}

impl Drop for OffloadHandle {
    fn drop(&mut self) {
        let rdp = &self.rcu.state().cpus[self.cpu];
        rdp.offloaded.store(false, Ordering::Release);
        log::debug!("processor {} callbacks handed back", self.cpu);
        rdp.kick();
    }
}

impl std::fmt::Debug for OffloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadHandle").field("id", &self.cpu).finish()
    }
}
