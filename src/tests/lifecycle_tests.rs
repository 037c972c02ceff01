/// 生命周期测试模块
/// 测试宽限期的完整流程、回调顺序、屏障、热插拔迁移以及域的关闭
use crate::{GpPhase, GpStep, Rcu};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use super::{init_logger, manual, step_to_completion};

/// 测试1: 手动驱动一个宽限期，两个处理器都报告静止状态
#[test]
fn test_manual_grace_period_with_reports() {
    let rcu = manual(2).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    let p1 = rcu.attach(1).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 1..=5 {
        let order = Arc::clone(&order);
        p0.call_rcu(move || order.lock().unwrap().push(n));
    }
    assert_eq!(rcu.pending_callbacks(0), 5);

    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    assert!(rcu.gp_in_progress());
    // Both processors are watching and have not reported yet.
    assert_eq!(rcu.step_grace_period(), GpStep::Forced);
    assert_eq!(rcu.invoke_ready_callbacks(), 0);

    p0.quiescent_state();
    assert_eq!(rcu.step_grace_period(), GpStep::Forced);
    p1.quiescent_state();
    assert_eq!(rcu.step_grace_period(), GpStep::Completed);
    assert!(!rcu.gp_in_progress());
    assert_eq!(rcu.phase(), GpPhase::Idle);
    assert_eq!(rcu.completed_grace_periods(), 1);

    assert_eq!(rcu.invoke_ready_callbacks(), 5);
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    assert_eq!(rcu.pending_callbacks(0), 0);

    let stats = rcu.stats();
    assert_eq!(stats.gps_started, 1);
    assert_eq!(stats.gps_completed, 1);
    assert_eq!(stats.cbs_queued, 5);
    assert_eq!(stats.cbs_invoked, 5);
    assert_eq!(stats.anomalies, 0);
}

/// 测试2: 空闲处理器由扫描记账，不需要报告
#[test]
fn test_idle_processor_is_credited() {
    let rcu = manual(2).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    let p1 = rcu.attach(1).unwrap();
    p1.enter_idle();
    assert!(p1.is_idle());

    rcu.start_poll();
    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    assert_eq!(rcu.step_grace_period(), GpStep::Forced);
    assert_eq!(rcu.stats().idle_credits, 1);

    p0.quiescent_state();
    assert_eq!(rcu.step_grace_period(), GpStep::Completed);
    p1.exit_idle();
    assert!(!p1.is_idle());
}

/// 测试3: 在第一次扫描后经过空闲的处理器也会被记账
#[test]
fn test_passing_through_idle_is_credited() {
    let rcu = manual(1).build().unwrap();
    let p0 = rcu.attach(0).unwrap();

    rcu.start_poll();
    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    assert_eq!(rcu.step_grace_period(), GpStep::Forced);

    // A short nap changes the counter snapshot taken by the first scan.
    p0.enter_idle();
    p0.exit_idle();
    assert_eq!(rcu.step_grace_period(), GpStep::Completed);
    assert_eq!(rcu.stats().idle_credits, 1);
}

/// 测试4: 没有附加处理器时一个宽限期在两步内完成
#[test]
fn test_all_idle_completes_quickly() {
    let rcu = manual(6).build().unwrap();
    let cookie = rcu.start_poll();
    assert!(!rcu.poll_state(cookie));
    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    assert_eq!(rcu.step_grace_period(), GpStep::Completed);
    assert!(rcu.poll_state(cookie));
    assert_eq!(rcu.step_grace_period(), GpStep::Idle);
}

/// 测试5: 同步等待在手动模式下由调用者驱动
#[test]
fn test_synchronize_manual() {
    let rcu = manual(3).build().unwrap();
    let p0 = rcu.attach(0).unwrap();

    let before = rcu.completed_grace_periods();
    p0.synchronize();
    assert!(rcu.completed_grace_periods() > before);
    assert!(!p0.is_idle());
    assert_eq!(rcu.stats().sync_waiters, 1);
}

/// 测试6: cookie 轮询
#[test]
fn test_poll_cookies() {
    let rcu = manual(2).build().unwrap();
    assert!(rcu.poll_state(rcu.get_completed_state()));

    let early = rcu.get_state();
    assert!(!rcu.poll_state(early));

    rcu.start_poll();
    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    // Taken while a grace period runs: the running one does not count.
    let late = rcu.get_state();
    assert_eq!(rcu.step_grace_period(), GpStep::Completed);
    assert!(rcu.poll_state(early));
    assert!(!rcu.poll_state(late));

    rcu.cond_synchronize(late);
    assert!(rcu.poll_state(late));
    // Already elapsed: returns without another grace period.
    let completed = rcu.completed_grace_periods();
    rcu.cond_synchronize(early);
    assert_eq!(rcu.completed_grace_periods(), completed);
}

/// 测试7: 屏障等待所有已排队的回调
#[test]
fn test_barrier_waits_for_callbacks() {
    let rcu = manual(4).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    let p2 = rcu.attach(2).unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    for p in [&p0, &p2] {
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            p.call_rcu(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            });
        }
    }
    p2.enter_idle();
    p0.barrier();
    assert_eq!(ran.load(Ordering::Relaxed), 6);
    assert_eq!(rcu.stats().barriers, 1);

    // Nothing queued: the second barrier has nothing to wait for.
    p0.barrier();
    assert_eq!(rcu.stats().barriers, 2);
}

/// 测试8: 下线处理器的回调迁移到编号最小的在线处理器
#[test]
fn test_offline_migrates_callbacks() {
    let rcu = manual(4).build().unwrap();
    let p1 = rcu.attach(1).unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let ran = Arc::clone(&ran);
        p1.call_rcu(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }

    assert!(rcu.note_processor_offline(1));
    assert!(!rcu.is_online(1));
    assert_eq!(rcu.pending_callbacks(1), 0);
    assert_eq!(rcu.pending_callbacks(0), 3);
    assert_eq!(rcu.stats().cbs_migrated, 3);

    // Offline processors queue elsewhere too.
    let ran2 = Arc::clone(&ran);
    p1.call_rcu(move || {
        ran2.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(rcu.pending_callbacks(0), 4);

    // An offline processor no longer holds up grace periods.
    rcu.barrier();
    assert_eq!(ran.load(Ordering::Relaxed), 4);

    assert!(rcu.note_processor_online(1));
    assert!(rcu.is_online(1));
    assert_eq!(rcu.stats().anomalies, 0);
}

/// 测试9: 重新上线的处理器从下一个宽限期起被等待
#[test]
fn test_online_processor_is_waited_on() {
    init_logger();
    let rcu = Rcu::builder()
        .processors(4)
        .leaf_fanout(2)
        .initial_online([0])
        .spawn_workers(false)
        .build()
        .unwrap();
    assert!(!rcu.is_online(3));
    let p3 = rcu.attach(3).unwrap();
    assert!(rcu.note_processor_online(3));

    rcu.start_poll();
    assert_eq!(rcu.step_grace_period(), GpStep::Started);
    assert_eq!(rcu.step_grace_period(), GpStep::Forced);
    p3.quiescent_state();
    assert_eq!(rcu.step_grace_period(), GpStep::Completed);
}

/// 测试10: 读侧临界区跨越宽限期开始时，回调要等到临界区之后
#[test]
fn test_callback_waits_for_reader() {
    let rcu = manual(2).build().unwrap();
    let reader = rcu.attach(0).unwrap();
    let updater = rcu.attach(1).unwrap();
    updater.enter_idle();

    let freed = Arc::new(AtomicBool::new(false));
    let guard = reader.read_lock();
    {
        let freed = Arc::clone(&freed);
        updater.call_rcu(move || freed.store(true, Ordering::Release));
    }

    for _ in 0..5 {
        rcu.step_grace_period();
        rcu.invoke_ready_callbacks();
    }
    assert!(!freed.load(Ordering::Acquire));
    drop(guard);

    reader.quiescent_state();
    step_to_completion(&rcu, 5);
    rcu.invoke_ready_callbacks();
    assert!(freed.load(Ordering::Acquire));
}

/// 测试11: drop 域会先运行仍在等待的回调
#[test]
fn test_drop_runs_pending_callbacks() {
    let rcu = manual(2).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    let freed = Arc::new(AtomicBool::new(false));
    {
        let freed = Arc::clone(&freed);
        p0.call_rcu(move || freed.store(true, Ordering::Release));
    }
    drop(p0);
    assert!(!freed.load(Ordering::Acquire));
    drop(rcu);
    assert!(freed.load(Ordering::Acquire));
}

/// 测试12: 带工作线程的域
#[test]
fn test_threaded_domain() {
    init_logger();
    let rcu = Rcu::builder()
        .processors(4)
        .leaf_fanout(2)
        .build()
        .unwrap();
    let p0 = rcu.attach(0).unwrap();

    let freed = Arc::new(AtomicBool::new(false));
    {
        let freed = Arc::clone(&freed);
        p0.call_rcu(move || freed.store(true, Ordering::Release));
    }
    p0.quiescent_state();
    p0.barrier();
    assert!(freed.load(Ordering::Acquire));

    p0.synchronize();
    // The updater thread may wait directly once it no longer holds a processor.
    drop(p0);
    rcu.synchronize();
    assert!(rcu.completed_grace_periods() >= 2);
    assert_eq!(rcu.stats().anomalies, 0);
}

/// 测试13: 接管回调调用的所有者自己运行回调
#[test]
fn test_offload_handle() {
    let rcu = manual(2).build().unwrap();
    let p1 = rcu.attach(1).unwrap();
    let offload = rcu.claim_offload(1).unwrap();
    assert!(rcu.claim_offload(1).is_none());
    assert_eq!(offload.id(), 1);

    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = Arc::clone(&ran);
        p1.call_rcu(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    p1.enter_idle();
    step_to_completion(&rcu, 5);

    // Ordinary invocation leaves offloaded processors alone.
    assert_eq!(rcu.invoke_ready_callbacks(), 0);
    assert!(offload.wait_for_work(std::time::Duration::from_millis(1)));
    assert_eq!(offload.invoke_ready(), 1);
    assert_eq!(ran.load(Ordering::Relaxed), 1);

    drop(offload);
    assert!(rcu.claim_offload(1).is_some());
}

/// 测试14: 单处理器上注册的回调在同步等待返回前按顺序运行
#[test]
fn test_synchronize_runs_earlier_callbacks_in_order() {
    let rcu = manual(1).build().unwrap();
    let p0 = rcu.attach(0).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 1..=3 {
        let order = Arc::clone(&order);
        p0.call_rcu(move || order.lock().unwrap().push(n));
    }

    p0.synchronize();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(rcu.pending_callbacks(0), 0);
}
