use std::{
    hint::spin_loop,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use object_monitor::{
    mock::{new_object, MockThread, MockVM, Synchronizer},
    runtime::threads::Thread,
    ObjectMonitor,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const THREADS: u64 = 6;
const ITERATIONS: u64 = 2_000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// State only touched while holding the lock. The counter uses a split
/// load/store so that overlapping critical sections lose updates.
#[derive(Default)]
struct Shared {
    inside: AtomicBool,
    counter: AtomicU64,
}

impl Shared {
    fn critical_section(&self, rng: &mut StdRng) {
        assert!(!self.inside.swap(true, Ordering::SeqCst), "two owners at once");
        let value = self.counter.load(Ordering::Relaxed);
        match rng.gen_range(0..10) {
            0 => thread::yield_now(),
            1 => {
                for _ in 0..rng.gen_range(0..200) {
                    spin_loop();
                }
            }
            _ => {}
        }
        self.counter.store(value + 1, Ordering::Relaxed);
        self.inside.store(false, Ordering::SeqCst);
    }
}

#[test]
fn monitor_excludes_under_contention() {
    init_logging();
    let obj = new_object();
    let monitor = Arc::new(ObjectMonitor::<MockVM>::new(&obj));
    let shared = Arc::new(Shared::default());

    let handles: Vec<_> = (0..THREADS)
        .map(|seed| {
            let monitor = monitor.clone();
            let shared = shared.clone();
            thread::spawn(move || {
                let thread = MockThread::new();
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..ITERATIONS {
                    assert!(monitor.enter(&thread));
                    if rng.gen_bool(0.2) {
                        // Nested acquisition must not block on ourselves.
                        assert!(monitor.enter(&thread));
                        shared.critical_section(&mut rng);
                        monitor.exit(&thread);
                    } else {
                        shared.critical_section(&mut rng);
                    }
                    monitor.exit(&thread);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(shared.counter.load(Ordering::Relaxed), THREADS * ITERATIONS);
    assert!(!monitor.has_owner());
    assert_eq!(monitor.contentions(), 0);
    assert!(!monitor.is_busy(), "{}", monitor.is_busy_to_string());
}

#[test]
fn synchronizer_excludes_while_deflating() {
    init_logging();
    let sync = Arc::new(Synchronizer::new());
    let obj = new_object();
    let shared = Arc::new(Shared::default());
    let stop = Arc::new(AtomicBool::new(false));

    let deflater = {
        let sync = sync.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut deflated = 0;
            while !stop.load(Ordering::Relaxed) {
                deflated += sync.deflate_idle_monitors().deflated;
                thread::yield_now();
            }
            deflated
        })
    };

    let workers: Vec<_> = (0..THREADS)
        .map(|seed| {
            let sync = sync.clone();
            let obj = obj.clone();
            let shared = shared.clone();
            thread::spawn(move || {
                let thread = MockThread::new();
                let mut rng = StdRng::seed_from_u64(seed + 100);
                for _ in 0..ITERATIONS {
                    sync.enter(&obj, &thread);
                    if let Some(monitor) = sync.monitor_of(&obj) {
                        assert!(
                            !(monitor.is_owner(&thread) && monitor.is_being_async_deflated()),
                            "entered a deflated monitor"
                        );
                    }
                    let nested = rng.gen_bool(0.1);
                    if nested {
                        sync.enter(&obj, &thread);
                    }
                    shared.critical_section(&mut rng);
                    if nested {
                        sync.exit(&obj, &thread);
                    }
                    sync.exit(&obj, &thread);
                    assert!(thread.lock_stack().is_empty());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    let _ = deflater.join().unwrap();

    assert_eq!(shared.counter.load(Ordering::Relaxed), THREADS * ITERATIONS);

    // Everything is idle now: one sweep retires whatever is left.
    sync.deflate_idle_monitors();
    assert!(sync.in_use().is_empty());
    assert!(obj.mark().is_neutral(), "{:?}", obj.mark());
}

#[test]
fn fast_lock_inflates_on_contention_and_deflates_back() {
    init_logging();
    let sync = Arc::new(Synchronizer::new());
    let obj = new_object();
    let a = MockThread::new();

    sync.enter(&obj, &a);
    assert!(obj.mark().is_fast_locked());
    assert!(a.lock_stack_contains(&obj));

    let contender = {
        let sync = sync.clone();
        let obj = obj.clone();
        thread::spawn(move || {
            let b = MockThread::new();
            sync.enter(&obj, &b);
            let monitor = sync.monitor_of(&obj).expect("inflated");
            assert!(monitor.is_owner(&b));
            sync.exit(&obj, &b);
        })
    };

    // Wait until the contender inflated the lock.
    while sync.monitor_of(&obj).is_none() {
        thread::yield_now();
    }
    let monitor = sync.monitor_of(&obj).unwrap();
    assert!(monitor.is_entered(&a));

    sync.exit(&obj, &a);
    contender.join().unwrap();

    assert_eq!(sync.deflate_idle_monitors().deflated, 1);
    assert!(obj.mark().is_neutral());
    assert!(sync.in_use().is_empty());

    // Fast locking works again on the restored header.
    sync.enter(&obj, &a);
    assert!(obj.mark().is_fast_locked());
    sync.exit(&obj, &a);
}
