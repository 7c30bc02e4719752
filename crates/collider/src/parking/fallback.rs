//! Fallback permits using std::sync::Condvar
//!
//! Used on platforms without futex support.

use super::WorkerPermits;
use std::sync::{Condvar, Mutex};

struct State {
    count: u32,
    closed: bool,
}

pub struct FallbackPermits {
    state: Mutex<State>,
    condvar: Condvar,
    max: u32,
}

impl FallbackPermits {
    pub fn new(max: u32) -> Self {
        Self {
            state: Mutex::new(State { count: 0, closed: false }),
            condvar: Condvar::new(),
            max: max.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned permit count is still a valid count
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WorkerPermits for FallbackPermits {
    fn acquire(&self) -> bool {
        let mut guard = self.lock();
        loop {
            if guard.closed {
                return false;
            }
            if guard.count > 0 {
                guard.count -= 1;
                return true;
            }
            guard = self.condvar.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn release(&self, n: u32) {
        let mut guard = self.lock();
        let before = guard.count;
        guard.count = before.saturating_add(n).min(self.max);
        for _ in before..guard.count {
            self.condvar.notify_one();
        }
    }

    fn close(&self) {
        self.lock().closed = true;
        self.condvar.notify_all();
    }

    fn available(&self) -> u32 {
        let guard = self.lock();
        if guard.closed { 0 } else { guard.count }
    }
}
