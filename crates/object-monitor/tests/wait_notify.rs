use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use object_monitor::{
    mock::{new_object, MockThread, MockVM, Synchronizer},
    runtime::threads::{Thread, ThreadRef, ThreadState},
    sync::ObjectMonitorGuard,
    MonitorError, ObjectMonitor, WaitOutcome,
};

type Monitor = ObjectMonitor<MockVM>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn spin_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Spawn a thread that enters `monitor`, waits on it and records the outcome.
fn spawn_waiter(
    monitor: &Arc<Monitor>,
    thread: &ThreadRef<MockVM>,
    millis: u64,
    interruptible: bool,
) -> thread::JoinHandle<Result<WaitOutcome, MonitorError>> {
    let monitor = monitor.clone();
    let thread = thread.clone();
    thread::spawn(move || {
        assert!(monitor.enter(&thread));
        let result = monitor.wait(&thread, millis, interruptible);
        assert!(monitor.is_owner(&thread));
        assert_eq!(monitor.recursions(), 0);
        monitor.exit(&thread);
        result
    })
}

#[test]
fn notify_moves_the_longest_waiter() {
    init_logging();
    let obj = new_object();
    let monitor = Arc::new(Monitor::new(&obj));
    let main = MockThread::new();
    let waiters: Vec<_> = (0..3).map(|_| MockThread::new()).collect();

    let mut handles = Vec::new();
    for (i, waiter) in waiters.iter().enumerate() {
        handles.push(spawn_waiter(&monitor, waiter, 0, true));
        spin_until("waiter to park", || monitor.waiters() == i as i32 + 1);
    }

    let ids: Vec<_> = waiters.iter().map(|t| t.lock_id()).collect();
    assert_eq!(monitor.waiting_threads(), ids);

    assert!(monitor.enter(&main));
    monitor.notify(&main).unwrap();
    assert_eq!(monitor.waiting_threads(), ids[1..]);
    monitor.exit(&main);

    let first = handles.remove(0);
    assert_eq!(first.join().unwrap(), Ok(WaitOutcome::Notified));
    assert_eq!(monitor.waiting_threads(), ids[1..]);

    assert!(monitor.enter(&main));
    monitor.notify_all(&main).unwrap();
    assert!(monitor.waiting_threads().is_empty());
    monitor.exit(&main);

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Ok(WaitOutcome::Notified));
    }
    assert_eq!(monitor.waiters(), 0);
    assert!(!monitor.is_busy(), "{}", monitor.is_busy_to_string());
}

#[test]
fn notified_waiter_gets_its_depth_back() {
    init_logging();
    let obj = new_object();
    let monitor = Arc::new(Monitor::new(&obj));
    let main = MockThread::new();
    let waiter = MockThread::new();

    let handle = {
        let monitor = monitor.clone();
        let waiter = waiter.clone();
        thread::spawn(move || {
            for _ in 0..3 {
                assert!(monitor.enter(&waiter));
            }
            let result = monitor.wait(&waiter, 0, true);
            assert!(monitor.is_owner(&waiter));
            let depth = monitor.recursions();
            for _ in 0..3 {
                monitor.exit(&waiter);
            }
            (result, depth)
        })
    };
    spin_until("waiter to park", || monitor.waiters() == 1);

    // The wait gave up all three levels.
    assert!(monitor.enter(&main));
    assert_eq!(monitor.recursions(), 0);
    monitor.notify(&main).unwrap();
    monitor.exit(&main);

    assert_eq!(handle.join().unwrap(), (Ok(WaitOutcome::Notified), 2));
    assert!(!monitor.has_owner());
    assert!(!monitor.is_busy(), "{}", monitor.is_busy_to_string());
}

#[test]
fn notify_wakes_only_one() {
    init_logging();
    let obj = new_object();
    let monitor = Arc::new(Monitor::new(&obj));
    let main = MockThread::new();
    let done = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let monitor = monitor.clone();
            let done = done.clone();
            thread::spawn(move || {
                let thread = MockThread::new();
                assert!(monitor.enter(&thread));
                let result = monitor.wait(&thread, 0, false);
                done.fetch_add(1, Ordering::SeqCst);
                monitor.exit(&thread);
                result
            })
        })
        .collect();
    spin_until("all waiters", || monitor.waiters() == 3);

    {
        let guard = ObjectMonitorGuard::lock(&monitor, &main).unwrap();
        guard.notify().unwrap();
    }
    spin_until("notified waiter", || done.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.waiters(), 2);

    {
        let guard = ObjectMonitorGuard::lock(&monitor, &main).unwrap();
        guard.notify_all().unwrap();
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Ok(WaitOutcome::Notified));
    }
    assert_eq!(done.load(Ordering::SeqCst), 3);
}

#[test]
fn interrupt_ends_an_unbounded_wait() {
    init_logging();
    let obj = new_object();
    let monitor = Arc::new(Monitor::new(&obj));
    let waiter = MockThread::new();

    let handle = spawn_waiter(&monitor, &waiter, 0, true);
    spin_until("waiter to park", || {
        waiter.tls().state() == ThreadState::InObjectWait
    });
    assert_eq!(monitor.waiters(), 1);

    waiter.tls().interrupt();
    assert_eq!(handle.join().unwrap(), Err(MonitorError::Interrupted));
    assert!(!waiter.tls().is_interrupted());
    assert_eq!(waiter.tls().state(), ThreadState::Running);
    assert!(!monitor.has_owner());
}

#[test]
fn uninterruptible_wait_ignores_interrupt() {
    init_logging();
    let obj = new_object();
    let monitor = Arc::new(Monitor::new(&obj));
    let waiter = MockThread::new();

    let start = Instant::now();
    let handle = spawn_waiter(&monitor, &waiter, 100, false);
    spin_until("waiter to park", || {
        waiter.tls().state() == ThreadState::InTimedObjectWait
    });
    waiter.tls().interrupt();

    assert_eq!(handle.join().unwrap(), Ok(WaitOutcome::TimedOut));
    assert!(start.elapsed() >= Duration::from_millis(100));
    // The interrupt is still pending for whoever checks next.
    assert!(waiter.tls().is_interrupted());
}

#[test]
fn timed_wait_reports_timeout() {
    init_logging();
    let obj = new_object();
    let monitor = Arc::new(Monitor::new(&obj));
    let waiter = MockThread::new();

    let start = Instant::now();
    let handle = spawn_waiter(&monitor, &waiter, 30, true);
    assert_eq!(handle.join().unwrap(), Ok(WaitOutcome::TimedOut));
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(monitor.waiters(), 0);
}

#[test]
fn notify_before_exit_leaves_waiter_blocked() {
    init_logging();
    let obj = new_object();
    let monitor = Arc::new(Monitor::new(&obj));
    let main = MockThread::new();
    let waiter = MockThread::new();

    let handle = spawn_waiter(&monitor, &waiter, 0, true);
    spin_until("waiter to park", || monitor.waiters() == 1);

    assert!(monitor.enter(&main));
    // Notifying before exiting leaves the waiter blocked on the entry path.
    monitor.notify(&main).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(monitor.is_owner(&main));
    assert!(monitor.is_busy());
    monitor.exit(&main);

    assert_eq!(handle.join().unwrap(), Ok(WaitOutcome::Notified));
}

/// A enters; B blocks entering; A waits without a timeout. B must get the
/// monitor while A stays parked until B notifies; A then resumes owning the
/// monitor at its original depth.
#[test]
fn wait_hands_monitor_to_blocked_entrant() {
    init_logging();
    let obj = new_object();
    let monitor = Arc::new(Monitor::new(&obj));
    let a = MockThread::new();
    let b = MockThread::new();
    let b_owns = Arc::new(AtomicUsize::new(0));

    assert!(monitor.enter(&a));

    let b_handle = {
        let monitor = monitor.clone();
        let b = b.clone();
        let b_owns = b_owns.clone();
        thread::spawn(move || {
            assert!(monitor.enter(&b));
            b_owns.store(1, Ordering::SeqCst);
            // A is parked in wait while we own the monitor.
            thread::sleep(Duration::from_millis(30));
            assert_eq!(monitor.waiting_threads().len(), 1);
            monitor.notify(&b).unwrap();
            monitor.exit(&b);
        })
    };
    spin_until("B to block", || b.tls().state() == ThreadState::BlockedOnMonitorEnter);

    assert_eq!(monitor.wait(&a, 0, true), Ok(WaitOutcome::Notified));
    assert_eq!(b_owns.load(Ordering::SeqCst), 1);
    assert!(monitor.is_owner(&a));
    assert_eq!(monitor.recursions(), 0);
    monitor.exit(&a);

    b_handle.join().unwrap();
    assert!(!monitor.is_busy(), "{}", monitor.is_busy_to_string());
}

#[test]
fn wait_through_synchronizer_inflates_fast_lock() {
    init_logging();
    let sync = Synchronizer::new();
    let obj = new_object();
    let thread = MockThread::new();

    assert_eq!(sync.wait(&obj, &thread, 1, true), Err(MonitorError::NotOwner));

    sync.enter(&obj, &thread);
    sync.enter(&obj, &thread);
    assert!(obj.mark().is_fast_locked());
    sync.notify(&obj, &thread).unwrap();
    assert!(obj.mark().is_fast_locked());

    assert_eq!(sync.wait(&obj, &thread, 5, true), Ok(WaitOutcome::TimedOut));
    let monitor = sync.monitor_of(&obj).expect("wait inflates");
    assert!(monitor.is_owner(&thread));
    assert_eq!(monitor.recursions(), 1);
    assert!(thread.lock_stack().is_empty());

    sync.exit(&obj, &thread);
    sync.exit(&obj, &thread);
    assert!(!monitor.has_owner());
    assert_eq!(sync.deflate_idle_monitors().deflated, 1);
    assert!(obj.mark().is_neutral());
}
