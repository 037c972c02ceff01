/// 边界情况测试模块
/// 测试停顿检测、序列回绕、重复注册、过载处理、最后一个处理器、分隔节点耗尽、屏障合并以及错误用法
use crate::state::GP_FLAG_FQS;
use crate::{GpHooks, GpStep, Rcu, RcuHead, StallReport};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use super::{init_logger, manual, step_to_completion};

#[derive(Default)]
struct Recorded {
    stalls: Mutex<Vec<StallReport>>,
    boosts: Mutex<Vec<usize>>,
    resched: Mutex<Vec<usize>>,
}

struct Recorder(Arc<Recorded>);

impl GpHooks for Recorder {
    fn resched_processor(&self, id: usize) {
        self.0.resched.lock().unwrap().push(id);
    }

    fn boost_readers(&self, id: usize, _blocked_for: Duration) {
        self.0.boosts.lock().unwrap().push(id);
    }

    fn stall_detected(&self, report: &StallReport) {
        self.0.stalls.lock().unwrap().push(report.clone());
    }
}

/// 测试1: 停顿检测、提升与重新调度请求
#[test]
fn test_stall_boost_and_resched() {
    let recorded = Arc::new(Recorded::default());
    let rcu = manual(2)
        .stall_timeout(Duration::from_millis(20))
        .boost_delay(Duration::from_millis(1))
        .sched_qs_delay(Duration::from_millis(1))
        .hooks(Recorder(Arc::clone(&recorded)))
        .build()
        .unwrap();
    let p0 = rcu.attach(0).unwrap();

    rcu.start_poll();
    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    thread::sleep(Duration::from_millis(30));

    assert_eq!(rcu.step_grace_period(), GpStep::Forced);
    {
        let stalls = recorded.stalls.lock().unwrap();
        assert_eq!(stalls.len(), 1);
        assert_eq!(stalls[0].blocking, vec![0]);
        assert_eq!(stalls[0].gp_num, 0);
        assert!(stalls[0].elapsed >= Duration::from_millis(20));
    }

    assert_eq!(rcu.step_grace_period(), GpStep::Forced);
    assert_eq!(rcu.step_grace_period(), GpStep::Forced);
    // Once per grace period per processor.
    assert_eq!(*recorded.boosts.lock().unwrap(), vec![0]);
    assert!(recorded.resched.lock().unwrap().contains(&0));
    assert!(p0.needs_quiescent_state());
    // Aged past twice the urgency delay: escalated.
    assert!(p0.quiescent_state_overdue());

    p0.quiescent_state();
    assert!(!p0.needs_quiescent_state());
    assert!(!p0.quiescent_state_overdue());
    assert_eq!(rcu.step_grace_period(), GpStep::Completed);

    let stats = rcu.stats();
    assert_eq!(stats.stalls, 1);
    assert_eq!(stats.boosts, 1);
    assert!(stats.resched_requests >= 1);
    assert_eq!(recorded.stalls.lock().unwrap().len(), 1);
}

/// 测试2: 长期空闲的处理器视图回绕后重新同步
#[test]
fn test_gpwrap_resync() {
    let rcu = manual(2).gpwrap_lag(1).build().unwrap();
    for _ in 0..3 {
        rcu.start_poll();
        step_to_completion(&rcu, 4);
    }
    assert!(rcu.stats().gpwraps >= 1);
    assert!(rcu.state().cpus[1].gpwrap());

    let p1 = rcu.attach(1).unwrap();
    p1.quiescent_state();
    assert!(!rcu.state().cpus[1].gpwrap());

    // Back in step: the next grace period waits for it again.
    rcu.start_poll();
    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    assert_eq!(rcu.step_grace_period(), GpStep::Forced);
    p1.quiescent_state();
    assert_eq!(rcu.step_grace_period(), GpStep::Completed);
    assert_eq!(rcu.stats().anomalies, 0);
}

/// 测试3: 重复注册同一项会被检测并泄漏，不会运行两次
#[test]
fn test_double_registration_is_leaked() {
    let rcu = manual(2).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    let head = Arc::new(RcuHead::new());
    let ran = Arc::new(AtomicUsize::new(0));
    let duplicate_ran = Arc::new(AtomicBool::new(false));

    {
        let ran = Arc::clone(&ran);
        p0.call_rcu_tracked(&head, move || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    assert!(head.is_queued());
    {
        let duplicate_ran = Arc::clone(&duplicate_ran);
        p0.call_rcu_tracked(&head, move || duplicate_ran.store(true, Ordering::Relaxed));
    }
    assert_eq!(rcu.stats().cbs_leaked, 1);
    assert_eq!(rcu.pending_callbacks(0), 1);

    p0.barrier();
    assert_eq!(ran.load(Ordering::Relaxed), 1);
    assert!(!duplicate_ran.load(Ordering::Relaxed));
    assert!(!head.is_queued());

    // Invoked heads can be deferred again.
    {
        let ran = Arc::clone(&ran);
        p0.call_rcu_tracked(&head, move || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    p0.barrier();
    assert_eq!(ran.load(Ordering::Relaxed), 2);
    assert_eq!(rcu.stats().cbs_leaked, 1);
}

/// 测试4: 不允许最后一个在线处理器下线
#[test]
fn test_last_processor_stays_online() {
    let rcu = manual(2).build().unwrap();
    assert!(rcu.note_processor_offline(0));
    assert!(!rcu.note_processor_offline(0));
    assert!(!rcu.note_processor_offline(1));
    assert!(rcu.is_online(1));
    assert!(!rcu.note_processor_offline(9));
    assert!(!rcu.note_processor_online(9));

    assert!(rcu.note_processor_online(0));
    assert!(!rcu.note_processor_online(0));
    assert!(rcu.note_processor_offline(1));
}

/// 测试5: 回调洪泛提高批次上限，并在队列排空后恢复
#[test]
fn test_callback_flood() {
    let rcu = manual(1).qhimark(10).qlowmark(5).qovld(20).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    let state = rcu.state();
    let leaf = state.tree.node(state.cpus[0].leaf);
    let ran = Arc::new(AtomicUsize::new(0));
    let queue = |n: usize| {
        for _ in 0..n {
            let ran = Arc::clone(&ran);
            p0.call_rcu(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            });
        }
    };

    queue(1);
    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    queue(30);

    assert!(rcu.stats().overloads >= 1);
    assert_eq!(state.cpus[0].lock().blimit, state.tun.max_blimit);
    assert_ne!(leaf.cbovldmask() & state.cpus[0].grpmask, 0);

    p0.barrier();
    assert_eq!(ran.load(Ordering::Relaxed), 31);
    assert_eq!(state.cpus[0].lock().blimit, state.tun.blimit);
    assert_eq!(leaf.cbovldmask(), 0);
}

/// 测试6: 已完成 cookie 永远算作已过宽限期
#[test]
fn test_completed_cookie() {
    let rcu = manual(2).build().unwrap();
    let cookie = rcu.get_completed_state();
    assert!(rcu.poll_state(cookie));
    let p0 = rcu.attach(0).unwrap();
    // Returns at once: no grace period is started.
    p0.cond_synchronize(cookie);
    assert_eq!(rcu.stats().gps_started, 0);
}

/// 测试7: 空闲处理器上的读侧临界区是错误用法
#[test]
#[should_panic(expected = "idle processor")]
fn test_read_lock_on_idle_processor() {
    let rcu = manual(1).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    p0.enter_idle();
    let _guard = p0.read_lock();
}

/// 测试8: 在读侧临界区内报告静止状态是错误用法
#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "inside a read-side critical section")]
fn test_quiescent_state_inside_reader() {
    let rcu = manual(1).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    let _guard = p0.read_lock();
    p0.quiescent_state();
}

/// 测试9: 带工作线程的域在 drop 时运行剩余回调
#[test]
fn test_threaded_drop_flushes() {
    init_logger();
    let rcu = Rcu::new(2).unwrap();
    let p0 = rcu.attach(0).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let ran = Arc::clone(&ran);
        p0.call_rcu(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    drop(p0);
    drop(rcu);
    assert_eq!(ran.load(Ordering::Relaxed), 100);
}

/// 测试10: 单处理器的域
#[test]
fn test_single_processor_domain() {
    let rcu = manual(1).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    let freed = Arc::new(AtomicBool::new(false));
    {
        let freed = Arc::clone(&freed);
        p0.call_rcu(move || freed.store(true, Ordering::Release));
    }
    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    p0.quiescent_state();
    assert_eq!(rcu.step_grace_period(), GpStep::Completed);
    // The next checkpoint runs the ready callback inline.
    p0.quiescent_state();
    assert!(freed.load(Ordering::Acquire));
}

/// 测试11: 已下线处理器上的读侧临界区是错误用法
#[test]
#[should_panic(expected = "offline processor")]
fn test_read_lock_on_offline_processor() {
    let rcu = manual(2).build().unwrap();
    let p1 = rcu.attach(1).unwrap();
    assert!(rcu.note_processor_offline(1));
    let _guard = p1.read_lock();
}

/// 测试12: 在已下线处理器上报告静止状态是错误用法
#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "quiescent_state on offline processor")]
fn test_quiescent_state_on_offline_processor() {
    let rcu = manual(2).build().unwrap();
    let p1 = rcu.attach(1).unwrap();
    assert!(rcu.note_processor_offline(1));
    p1.quiescent_state();
}

/// 测试13: 分隔节点池耗尽时等待者搭乘后续的宽限期
#[test]
fn test_wait_heads_exhausted() {
    let rcu = manual(2).build().unwrap();
    let state = rcu.state();
    state.srs.set_wait_heads_taken(true);

    let returned = Arc::new(AtomicBool::new(false));
    let waiter = {
        let rcu = rcu.clone();
        let returned = Arc::clone(&returned);
        thread::spawn(move || {
            rcu.synchronize();
            returned.store(true, Ordering::Release);
        })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while rcu.stats().wait_heads_exhausted == 0 {
        assert!(Instant::now() < deadline, "pool exhaustion never seen");
        thread::yield_now();
    }
    // Without a separator no grace period can claim the waiter.
    assert!(!returned.load(Ordering::Acquire));

    state.srs.set_wait_heads_taken(false);
    waiter.join().unwrap();
    assert!(returned.load(Ordering::Acquire));

    let stats = rcu.stats();
    assert!(stats.gps_completed >= 2);
    assert_eq!(stats.sync_waiters, 1);
    assert_eq!(stats.anomalies, 0);
}

/// 测试14: 已被另一次屏障覆盖的屏障调用直接返回
#[test]
fn test_barrier_covered_by_another() {
    let rcu = manual(2).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = Arc::clone(&ran);
        p0.call_rcu(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    p0.enter_idle();

    // Every caller snapshots the barrier sequence while none can start.
    let serial = rcu.state().barrier.mutex.lock();
    let arrived = Arc::new(AtomicUsize::new(0));
    let callers: Vec<_> = (0..4)
        .map(|_| {
            let rcu = rcu.clone();
            let ran = Arc::clone(&ran);
            let arrived = Arc::clone(&arrived);
            thread::spawn(move || {
                arrived.fetch_add(1, Ordering::AcqRel);
                rcu.barrier();
                ran.load(Ordering::Relaxed)
            })
        })
        .collect();
    while arrived.load(Ordering::Acquire) < 4 {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(50));
    drop(serial);

    for caller in callers {
        assert_eq!(caller.join().unwrap(), 1);
    }
    // One caller ran the barrier; the rest found it done.
    assert_eq!(rcu.stats().barriers, 1);
}

/// 测试15: 手动模式下的强制扫描请求在下一步被处理
#[test]
fn test_force_quiescent_state_manual() {
    let rcu = manual(2).build().unwrap();
    let state = rcu.state();
    let fqs_requested = || state.gp_flags.load(Ordering::Acquire) & GP_FLAG_FQS != 0;

    // Nothing running: nothing to force.
    rcu.force_quiescent_state();
    assert!(!fqs_requested());

    let p0 = rcu.attach(0).unwrap();
    rcu.start_poll();
    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    rcu.force_quiescent_state();
    // A second request folds into the first.
    rcu.force_quiescent_state();
    assert!(fqs_requested());
    assert!(
        state
            .tree
            .breadth_first()
            .iter()
            .all(|node| !node.fqs_lock.load(Ordering::Acquire))
    );

    assert_eq!(rcu.step_grace_period(), GpStep::Forced);
    assert!(!fqs_requested());
    assert_eq!(rcu.stats().fqs_scans, 1);

    p0.quiescent_state();
    assert_eq!(rcu.step_grace_period(), GpStep::Completed);
}
