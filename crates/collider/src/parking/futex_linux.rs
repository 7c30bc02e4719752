//! Linux futex-based worker permits
//!
//! The futex word is the permit count itself:
//! - acquire CASes it down by one, or FUTEX_WAITs while it reads 0
//! - release CASes it up (capped) and FUTEX_WAKEs as many waiters
//!
//! A waiter that loses the race with a release sees EAGAIN from the wait
//! (the word is no longer 0) and retries, so no wake-up is lost.

use super::WorkerPermits;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

pub struct FutexPermits {
    /// Futex word: available permits
    count: AtomicU32,
    /// Threads inside FUTEX_WAIT (or about to enter it)
    waiters: AtomicUsize,
    closed: AtomicBool,
    max: u32,
}

impl FutexPermits {
    pub fn new(max: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            max: max.max(1),
        }
    }

    fn futex_wait(&self) {
        // Result ignored: woken, EAGAIN and EINTR all mean "re-check"
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.count.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn futex_wake(&self, n: i32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.count.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl WorkerPermits for FutexPermits {
    fn acquire(&self) -> bool {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            let cur = self.count.load(Ordering::Acquire);
            if cur > 0 {
                if self
                    .count
                    .compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }
            self.waiters.fetch_add(1, Ordering::SeqCst);
            if !self.closed.load(Ordering::SeqCst) {
                self.futex_wait();
            }
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn release(&self, n: u32) {
        let mut cur = self.count.load(Ordering::Relaxed);
        loop {
            if cur >= self.max {
                return;
            }
            let next = cur.saturating_add(n).min(self.max);
            match self
                .count
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    if self.waiters.load(Ordering::SeqCst) > 0 {
                        self.futex_wake((next - cur) as i32);
                    }
                    return;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Change the word so a waiter racing into FUTEX_WAIT gets EAGAIN
        self.count.fetch_add(1, Ordering::SeqCst);
        self.futex_wake(i32::MAX);
    }

    fn available(&self) -> u32 {
        if self.closed.load(Ordering::Relaxed) {
            return 0;
        }
        self.count.load(Ordering::Relaxed)
    }
}
