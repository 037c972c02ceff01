/// 并发测试模块
/// 测试多处理器读者、并发同步等待者的合并、并发回调、热插拔以及工作线程与手动步进的交错
use crate::Rcu;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use super::init_logger;

fn threaded(processors: usize) -> Rcu {
    init_logger();
    Rcu::builder()
        .processors(processors)
        .leaf_fanout(2)
        .interior_fanout(2)
        .first_fqs_delay(Duration::from_millis(1))
        .next_fqs_delay(Duration::from_millis(1))
        .build()
        .unwrap()
}

/// A published value that records when it was reclaimed.
struct Node {
    value: usize,
    freed: AtomicBool,
}

/// 测试1: 读者永远不会看到已回收的数据
#[test]
fn test_readers_never_see_reclaimed_data() {
    let rcu = threaded(4);
    let first = Box::into_raw(Box::new(Node {
        value: 0,
        freed: AtomicBool::new(false),
    }));
    let shared = Arc::new(AtomicPtr::new(first));
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for id in 1..4 {
        let rcu = rcu.clone();
        let shared = Arc::clone(&shared);
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            let p = rcu.attach(id).unwrap();
            let mut reads = 0usize;
            while !stop.load(Ordering::Acquire) {
                {
                    let _guard = p.read_lock();
                    let node = unsafe { &*shared.load(Ordering::Acquire) };
                    assert!(!node.freed.load(Ordering::Acquire), "read after free");
                    assert!(node.value <= 200);
                    reads += 1;
                }
                p.quiescent_state();
            }
            reads
        }));
    }

    let writer = rcu.attach(0).unwrap();
    for value in 1..=200 {
        let next = Box::into_raw(Box::new(Node {
            value,
            freed: AtomicBool::new(false),
        }));
        let old = shared.swap(next, Ordering::AcqRel) as usize;
        writer.call_rcu(move || {
            // Mark first so a reader that wrongly still holds it would notice.
            let old = old as *mut Node;
            unsafe { (*old).freed.store(true, Ordering::Release) };
            // Leaked on purpose: readers in a broken engine must not crash.
        });
        if value % 50 == 0 {
            writer.synchronize();
        }
        writer.quiescent_state();
    }
    writer.barrier();
    stop.store(true, Ordering::Release);

    let total: usize = readers.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(total > 0);
    drop(writer);
    drop(unsafe { Box::from_raw(shared.load(Ordering::Acquire)) });
    assert_eq!(rcu.stats().anomalies, 0);
}

/// 测试2: 1000 个并发同步等待者共享少量宽限期
#[test]
fn test_concurrent_synchronize_shares_grace_periods() {
    let rcu = threaded(4);
    let start = Arc::new(Barrier::new(1000));

    let mut handles = Vec::new();
    for _ in 0..1000 {
        let rcu = rcu.clone();
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            rcu.synchronize();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = rcu.stats();
    assert_eq!(stats.sync_waiters, 1000);
    assert!(
        stats.gps_completed <= 100,
        "{} grace periods for 1000 waiters",
        stats.gps_completed
    );
    assert_eq!(stats.anomalies, 0);
}

/// 测试3: 多个处理器并发注册回调，屏障之后全部运行
#[test]
fn test_concurrent_call_rcu() {
    let rcu = threaded(4);
    let ran = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for id in 0..4 {
        let rcu = rcu.clone();
        let ran = Arc::clone(&ran);
        handles.push(thread::spawn(move || {
            let p = rcu.attach(id).unwrap();
            for i in 0..1000 {
                let ran = Arc::clone(&ran);
                p.call_rcu(move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                });
                if i % 64 == 0 {
                    p.quiescent_state();
                }
            }
            p.barrier();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ran.load(Ordering::Relaxed), 4000);
    let stats = rcu.stats();
    assert_eq!(stats.cbs_queued, 4000);
    // Barrier markers are invoked too.
    assert!(stats.cbs_invoked >= 4000);
    assert_eq!(stats.anomalies, 0);
}

/// 测试4: 每个处理器上的回调按注册顺序运行
#[test]
fn test_per_processor_fifo_under_load() {
    let rcu = threaded(2);
    let p0 = rcu.attach(0).unwrap();
    let last = Arc::new(AtomicUsize::new(0));
    let out_of_order = Arc::new(AtomicBool::new(false));

    for n in 1..=2000 {
        let last = Arc::clone(&last);
        let out_of_order = Arc::clone(&out_of_order);
        p0.call_rcu(move || {
            if last.swap(n, Ordering::Relaxed) != n - 1 {
                out_of_order.store(true, Ordering::Relaxed);
            }
        });
        if n % 100 == 0 {
            p0.quiescent_state();
        }
    }
    p0.barrier();
    assert_eq!(last.load(Ordering::Relaxed), 2000);
    assert!(!out_of_order.load(Ordering::Relaxed));
}

/// 测试5: 处理器在宽限期运行时反复上下线
#[test]
fn test_hotplug_while_running() {
    let rcu = threaded(4);
    let done = Arc::new(AtomicBool::new(false));
    let ran = Arc::new(AtomicUsize::new(0));

    let worker = {
        let rcu = rcu.clone();
        let done = Arc::clone(&done);
        let ran = Arc::clone(&ran);
        thread::spawn(move || {
            let p = rcu.attach(2).unwrap();
            let mut queued = 0;
            for _ in 0..20 {
                for _ in 0..16 {
                    let ran = Arc::clone(&ran);
                    p.call_rcu(move || {
                        ran.fetch_add(1, Ordering::Relaxed);
                    });
                    queued += 1;
                    p.quiescent_state();
                }
                // Leave with callbacks still queued; they move elsewhere.
                assert!(rcu.note_processor_offline(2));
                let ran = Arc::clone(&ran);
                p.call_rcu(move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                });
                queued += 1;
                assert!(rcu.note_processor_online(2));
            }
            p.barrier();
            done.store(true, Ordering::Release);
            queued
        })
    };

    while !done.load(Ordering::Acquire) {
        rcu.synchronize();
    }
    let queued = worker.join().unwrap();

    assert_eq!(ran.load(Ordering::Relaxed), queued);
    assert!(rcu.stats().cbs_migrated > 0);
    assert_eq!(rcu.stats().anomalies, 0);
}

/// Poll `cond` until it holds, failing after a few seconds.
fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// A threaded domain whose scans only run when asked for.
fn slow_scans() -> Rcu {
    init_logger();
    Rcu::builder()
        .processors(2)
        .leaf_fanout(2)
        .initial_online([0])
        .first_fqs_delay(Duration::from_secs(10))
        .next_fqs_delay(Duration::from_secs(10))
        .callback_helpers(false)
        .build()
        .unwrap()
}

/// 测试6: 工作线程不会结束由手动步进启动的下一个宽限期
#[test]
fn test_worker_leaves_stepped_grace_period_running() {
    let rcu = slow_scans();
    let p0 = rcu.attach(0).unwrap();
    let state = rcu.state();

    rcu.start_poll();
    wait_for("the worker to start a grace period", || rcu.gp_in_progress());
    let before = rcu.completed_grace_periods();

    let mut driver = state.driver.lock();
    assert!(driver.forcing);
    // The root clears and the worker queues up behind the driver lock.
    p0.quiescent_state();
    thread::sleep(Duration::from_millis(50));

    // Meanwhile a manual step finishes that grace period and starts the next.
    state.gp_cleanup();
    state.start_poll();
    assert!(state.gp_init());
    driver.forcing = true;
    driver.first_fqs = true;
    drop(driver);

    thread::sleep(Duration::from_millis(50));
    // Processor 0 still owes the new one.
    assert_eq!(rcu.completed_grace_periods(), before + 1);
    assert!(rcu.gp_in_progress());

    p0.quiescent_state();
    wait_for("the worker to finish the stepped grace period", || {
        rcu.completed_grace_periods() == before + 2
    });
    assert_eq!(rcu.stats().anomalies, 0);
}

/// 测试7: 强制扫描让工作线程提前为空闲处理器记账
#[test]
fn test_force_quiescent_state_wakes_worker() {
    let rcu = slow_scans();
    let p0 = rcu.attach(0).unwrap();
    p0.enter_idle();

    rcu.start_poll();
    wait_for("the worker to start a grace period", || rcu.gp_in_progress());
    let started = Instant::now();
    rcu.force_quiescent_state();
    wait_for("the forced scan to end the grace period", || !rcu.gp_in_progress());

    // Long before the first scheduled scan.
    assert!(started.elapsed() < Duration::from_secs(5));
    let stats = rcu.stats();
    assert!(stats.fqs_scans >= 1);
    assert_eq!(stats.idle_credits, 1);
    assert_eq!(stats.anomalies, 0);
}
