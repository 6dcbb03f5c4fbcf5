use std::time::{Duration, Instant};

use crate::*;

#[test]
fn timed_acquire_gives_up_when_exhausted() {
    let sem = Semaphore::new(1);
    let held = sem.acquire();
    assert_eq!(sem.available(), 0);

    let start = Instant::now();
    assert!(sem.try_acquire_for(Duration::from_millis(20)).is_none());
    assert!(start.elapsed() >= Duration::from_millis(20));
    drop(held);
    assert!(sem.try_acquire_for(Duration::ZERO).is_some());
}

#[test]
fn dropping_a_permit_releases_it() {
    let sem = Semaphore::new(2);
    {
        let _a = sem.acquire();
        let _b = sem.acquire();
        assert_eq!(sem.available(), 0);
    }
    assert_eq!(sem.available(), sem.capacity());
}

#[test]
fn blocked_acquire_wakes_on_release() {
    let sem = Semaphore::new(1);
    let held = sem.acquire();
    std::thread::scope(|s| {
        let waiter = s.spawn(|| {
            let _permit = sem.acquire();
        });
        std::thread::sleep(Duration::from_millis(10));
        drop(held);
        waiter.join().unwrap();
    });
    assert_eq!(sem.available(), 1);
}

#[test]
fn limiter_clones_share_permits() {
    let limiter = ConcurrencyLimiter::new(1, 3, Duration::from_millis(5));
    let other = limiter.clone();

    let _read = limiter.read_semaphore().acquire();
    assert_eq!(other.read_semaphore().available(), 0);
    assert_eq!(other.write_semaphore().available(), 3);
    assert_eq!(other.timeout(), Duration::from_millis(5));
}

#[test]
#[should_panic(expected = "semaphore capacity must be > 0")]
fn zero_capacity_panics() {
    let _ = Semaphore::new(0);
}
