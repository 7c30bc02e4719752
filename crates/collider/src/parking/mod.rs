//! Worker permits
//!
//! A counting semaphore that idle pool workers block on. Each submitted task
//! releases one permit, each worker wake-up consumes one. The count is capped
//! at the number of workers: permits beyond that would only cause empty scans.
//!
//! `close()` wakes every waiter for good; after it `acquire()` returns `false`.

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexPermits as PlatformPermits;
    } else {
        mod fallback;
        pub use fallback::FallbackPermits as PlatformPermits;
    }
}

/// Counting permit source for idle workers
pub trait WorkerPermits: Send + Sync {
    /// Block until a permit is available. `false` once closed.
    fn acquire(&self) -> bool;

    /// Add up to `n` permits, saturating at the cap
    fn release(&self, n: u32);

    /// Wake every waiter and refuse further acquisition
    fn close(&self);

    /// Permits currently available (hint)
    fn available(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_release_is_capped() {
        let permits = PlatformPermits::new(2);
        permits.release(5);
        assert_eq!(permits.available(), 2);
        assert!(permits.acquire());
        assert!(permits.acquire());
        assert_eq!(permits.available(), 0);
    }

    #[test]
    fn test_release_wakes_waiter() {
        let permits = Arc::new(PlatformPermits::new(4));
        let acquired = Arc::new(AtomicUsize::new(0));

        let handle = {
            let permits = Arc::clone(&permits);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                assert!(permits.acquire());
                acquired.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);
        permits.release(1);
        handle.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_releases_all_waiters() {
        let permits = Arc::new(PlatformPermits::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let permits = Arc::clone(&permits);
                thread::spawn(move || permits.acquire())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        permits.close();
        for h in handles {
            assert!(!h.join().unwrap());
        }
        assert!(!permits.acquire());
    }
}
