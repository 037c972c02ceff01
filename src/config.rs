use std::time::Duration;
use thiserror::Error;

/// Default number of callbacks invoked per batch.
/// 每批调用的默认回调数量。
pub(crate) const DEFAULT_BLIMIT: usize = 10;

/// Batch limit used while a processor is flooded with callbacks.
/// 处理器被回调淹没时使用的批次上限。
pub(crate) const DEFAULT_MAX_BLIMIT: usize = 10_000;

/// Queue length above which a processor forces quiescent-state scans.
/// 队列长度超过该值时处理器会强制进行静止状态扫描。
pub(crate) const DEFAULT_QHIMARK: usize = 10_000;

/// Queue length at which the batch limit drops back to normal.
/// 批次上限恢复正常时的队列长度。
pub(crate) const DEFAULT_QLOWMARK: usize = 100;

pub(crate) const DEFAULT_BATCH_DIVISOR: u32 = 7;
pub(crate) const DEFAULT_BATCH_TIME_LIMIT: Duration = Duration::from_millis(3);
pub(crate) const MIN_BATCH_TIME_LIMIT: Duration = Duration::from_millis(1);
pub(crate) const MAX_BATCH_TIME_LIMIT: Duration = Duration::from_secs(1);

/// Batch sizes above this are bounded by `batch_time_limit` as well.
/// 超过此值的批次同时受 `batch_time_limit` 约束。
pub(crate) const TIME_CHECKED_BATCH: usize = 100;

pub(crate) const DEFAULT_LEAF_FANOUT: usize = 16;
pub(crate) const DEFAULT_INTERIOR_FANOUT: usize = 64;

/// Base force-quiescent-state delay, plus one tick per `FQS_DIV` processors.
/// 强制静止状态扫描的基础延迟，每 `FQS_DIV` 个处理器额外增加一个节拍。
const FQS_BASE: Duration = Duration::from_millis(3);
const FQS_DIV: usize = 256;
const TICK: Duration = Duration::from_millis(1);
const SCHED_QS_FLOOR: Duration = Duration::from_millis(100);

pub(crate) const DEFAULT_BOOST_DELAY: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(21);

/// Sequence counts a record may lag behind its leaf before it is flagged as wrapped.
/// 记录落后于其叶节点多少个序列计数后会被标记为回绕。
pub(crate) const DEFAULT_GPWRAP_LAG: usize = usize::MAX / 4;

/// Validation failures of an [`RcuConfig`].
/// [`RcuConfig`] 的校验错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("an RCU domain needs at least one processor")]
    NoProcessors,
    #[error("{which} fan-out {value} is outside 2..={max}")]
    FanoutOutOfRange {
        which: &'static str,
        value: usize,
        max: usize,
    },
    #[error("batch limit {blimit} exceeds the flood batch limit {max_blimit}")]
    BatchLimit { blimit: usize, max_blimit: usize },
    #[error("low-water mark {qlowmark} exceeds high-water mark {qhimark}")]
    WaterMarks { qlowmark: usize, qhimark: usize },
    #[error("force-quiescent-state delays must be non-zero")]
    ZeroFqsDelay,
    #[error("processor {id} is out of range for a domain of {processors}")]
    ProcessorOutOfRange { id: usize, processors: usize },
    #[error("at least one processor must start online")]
    NoneOnline,
}

/// Failures while building an [`Rcu`](crate::Rcu) domain.
/// 构建 [`Rcu`](crate::Rcu) 域时的错误。
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn {thread}")]
    Spawn {
        thread: String,
        #[source]
        source: std::io::Error,
    },
}

/// Tunables of a grace-period domain.
///
/// Fields left as `None` are derived from the processor count the same way
/// at build time, so a config can be shared between domains of different sizes.
///
/// 宽限期域的可调参数。
/// 值为 `None` 的字段在构建时根据处理器数量推导，因此同一配置可以在不同规模的域之间共享。
#[derive(Debug, Clone)]
pub struct RcuConfig {
    pub processors: usize,
    pub leaf_fanout: usize,
    pub interior_fanout: usize,
    pub blimit: usize,
    pub max_blimit: usize,
    pub qhimark: usize,
    pub qlowmark: usize,
    /// `None` means `2 * qhimark`; `Some(0)` disables overload tracking.
    pub qovld: Option<usize>,
    pub batch_divisor: u32,
    pub batch_time_limit: Duration,
    pub first_fqs_delay: Option<Duration>,
    pub next_fqs_delay: Option<Duration>,
    pub sched_qs_delay: Option<Duration>,
    pub boost_delay: Duration,
    pub stall_timeout: Duration,
    pub gpwrap_lag: usize,
    pub spawn_workers: bool,
    pub callback_helpers: bool,
    /// `None` means every processor starts online.
    pub initial_online: Option<Vec<usize>>,
}

impl Default for RcuConfig {
    fn default() -> Self {
        Self {
            processors: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            leaf_fanout: DEFAULT_LEAF_FANOUT,
            interior_fanout: DEFAULT_INTERIOR_FANOUT,
            blimit: DEFAULT_BLIMIT,
            max_blimit: DEFAULT_MAX_BLIMIT,
            qhimark: DEFAULT_QHIMARK,
            qlowmark: DEFAULT_QLOWMARK,
            qovld: None,
            batch_divisor: DEFAULT_BATCH_DIVISOR,
            batch_time_limit: DEFAULT_BATCH_TIME_LIMIT,
            first_fqs_delay: None,
            next_fqs_delay: None,
            sched_qs_delay: None,
            boost_delay: DEFAULT_BOOST_DELAY,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            gpwrap_lag: DEFAULT_GPWRAP_LAG,
            spawn_workers: true,
            callback_helpers: true,
            initial_online: None,
        }
    }
}

impl RcuConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processors == 0 {
            return Err(ConfigError::NoProcessors);
        }
        let max = usize::BITS as usize;
        for (which, value) in [
            ("leaf", self.leaf_fanout),
            ("interior", self.interior_fanout),
        ] {
            if !(2..=max).contains(&value) {
                return Err(ConfigError::FanoutOutOfRange { which, value, max });
            }
        }
        if self.blimit > self.max_blimit {
            return Err(ConfigError::BatchLimit {
                blimit: self.blimit,
                max_blimit: self.max_blimit,
            });
        }
        if self.qlowmark > self.qhimark {
            return Err(ConfigError::WaterMarks {
                qlowmark: self.qlowmark,
                qhimark: self.qhimark,
            });
        }
        if self.first_fqs_delay == Some(Duration::ZERO)
            || self.next_fqs_delay == Some(Duration::ZERO)
        {
            return Err(ConfigError::ZeroFqsDelay);
        }
        if let Some(online) = &self.initial_online {
            if let Some(&id) = online.iter().find(|&&id| id >= self.processors) {
                return Err(ConfigError::ProcessorOutOfRange {
                    id,
                    processors: self.processors,
                });
            }
            if online.is_empty() {
                return Err(ConfigError::NoneOnline);
            }
        }
        Ok(())
    }

    /// Resolve derived values into the form the engine runs with.
    /// 将推导值解析为引擎运行时使用的形式。
    pub(crate) fn resolve(&self) -> Result<Tunables, ConfigError> {
        self.validate()?;
        let scale = TICK * (self.processors / FQS_DIV) as u32;
        let first_fqs = self.first_fqs_delay.unwrap_or(FQS_BASE + scale);
        let next_fqs = self.next_fqs_delay.unwrap_or(FQS_BASE + scale);
        let sched_qs = self
            .sched_qs_delay
            .unwrap_or_else(|| (first_fqs + next_fqs * 2).max(SCHED_QS_FLOOR + scale));
        let divisor = self.batch_divisor.min(usize::BITS - 2);
        let batch_time_limit = self
            .batch_time_limit
            .clamp(MIN_BATCH_TIME_LIMIT, MAX_BATCH_TIME_LIMIT);
        if batch_time_limit != self.batch_time_limit {
            log::warn!(
                "batch time limit {:?} clamped to {:?}",
                self.batch_time_limit,
                batch_time_limit
            );
        }
        Ok(Tunables {
            processors: self.processors,
            leaf_fanout: self.leaf_fanout,
            interior_fanout: self.interior_fanout,
            blimit: self.blimit,
            max_blimit: self.max_blimit,
            qhimark: self.qhimark,
            qlowmark: self.qlowmark,
            qovld: self.qovld.unwrap_or(2 * self.qhimark),
            divisor,
            batch_time_limit,
            first_fqs,
            next_fqs,
            sched_qs,
            boost_delay: self.boost_delay,
            stall_timeout: self.stall_timeout,
            gpwrap_lag: self.gpwrap_lag,
        })
    }
}

/// Resolved, immutable tunables shared by the running engine.
/// 运行中的引擎共享的已解析且不可变的参数。
#[derive(Debug, Clone)]
pub(crate) struct Tunables {
    pub(crate) processors: usize,
    pub(crate) leaf_fanout: usize,
    pub(crate) interior_fanout: usize,
    pub(crate) blimit: usize,
    pub(crate) max_blimit: usize,
    pub(crate) qhimark: usize,
    pub(crate) qlowmark: usize,
    pub(crate) qovld: usize,
    pub(crate) divisor: u32,
    pub(crate) batch_time_limit: Duration,
    pub(crate) first_fqs: Duration,
    pub(crate) next_fqs: Duration,
    pub(crate) sched_qs: Duration,
    pub(crate) boost_delay: Duration,
    pub(crate) stall_timeout: Duration,
    pub(crate) gpwrap_lag: usize,
}
