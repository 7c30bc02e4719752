//! `ThreadPool`: sharded FIFO task dispatcher.
//!
//! Tasks are reusable `Arc<Task>` objects linked intrusively into one of `K`
//! shards picked by the task's identity hash. Submission is a wait-free tail
//! swap; extraction locks the shard head with a sentinel for the few
//! instructions it takes to unlink one task. Reusing the same task object for
//! every run of, say, a session writer means no allocation per submission.
//!
//! A task may be submitted again as soon as a worker has extracted it, which
//! happens right before its body runs. Bodies that resubmit themselves do it
//! as their last action, so one task is never running on two workers at once.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use collider_core::{kdebug, kerror, ColliderError, Result};
use crossbeam_utils::{Backoff, CachePadded};

use crate::parking::{PlatformPermits, WorkerPermits};

/// Shard head value while a worker is unlinking from it (never dereferenced)
const LOCK: usize = 1;

#[inline]
fn lock_ptr() -> *mut Task {
    LOCK as *mut Task
}

/// A unit of work for the pool.
pub struct Task {
    next: AtomicPtr<Task>,
    queued: AtomicBool,
    hash: usize,
    body: Box<dyn Fn() + Send + Sync>,
}

impl Task {
    pub fn new<F>(body: F) -> Arc<Task>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new_cyclic(|weak: &std::sync::Weak<Task>| Task {
            next: AtomicPtr::new(ptr::null_mut()),
            queued: AtomicBool::new(false),
            hash: identity_hash(weak.as_ptr() as usize),
            body: Box::new(body),
        })
    }

    /// Linked into a shard and not yet picked up by a worker
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    #[inline]
    fn run(&self) {
        (self.body)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("hash", &self.hash)
            .field("queued", &self.is_queued())
            .finish()
    }
}

fn identity_hash(addr: usize) -> usize {
    // Heap addresses share their low bits
    let x = (addr >> 4) as u64;
    (x.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize
}

struct Shard {
    head: AtomicPtr<Task>,
    tail: AtomicPtr<Task>,
}

impl Shard {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, task: *mut Task) {
        let prev = self.tail.swap(task, Ordering::AcqRel);
        if prev.is_null() {
            self.head.store(task, Ordering::Release);
        } else {
            // SAFETY: prev stays alive until a worker unlinks it, which
            // cannot happen before its next link is published here
            unsafe { (*prev).next.store(task, Ordering::Release) };
        }
    }

    /// Unlink the head task, transferring the shard's reference to the caller.
    fn pop(&self) -> Option<*mut Task> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            if head == lock_ptr() {
                backoff.snooze();
                continue;
            }
            if self
                .head
                .compare_exchange(head, lock_ptr(), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // SAFETY: head is owned by the shard and pinned by the lock
            let task = unsafe { &*head };
            let mut next = task.next.load(Ordering::Acquire);
            if next.is_null() {
                self.head.store(ptr::null_mut(), Ordering::Release);
                if self
                    .tail
                    .compare_exchange(head, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    task.queued_clear();
                    return Some(head);
                }
                // A producer swapped the tail, its next link is on the way
                let spin = Backoff::new();
                loop {
                    next = task.next.load(Ordering::Acquire);
                    if !next.is_null() {
                        break;
                    }
                    spin.snooze();
                }
            }
            self.head.store(next, Ordering::Release);
            task.next.store(ptr::null_mut(), Ordering::Release);
            task.queued_clear();
            return Some(head);
        }
    }
}

impl Task {
    #[inline]
    fn queued_clear(&self) {
        self.queued.store(false, Ordering::Release);
    }
}

struct PoolInner {
    name: String,
    shards: Box<[CachePadded<Shard>]>,
    permits: PlatformPermits,
    run: AtomicBool,
    /// Workers still inside their loop
    live: AtomicUsize,
}

impl PoolInner {
    fn worker_loop(&self) {
        let me = thread::current();
        kdebug!("{}: started", me.name().unwrap_or("worker"));

        let k = self.shards.len();
        let mut idx = 0;
        while self.run.load(Ordering::Acquire) {
            if !self.permits.acquire() {
                break;
            }
            let mut empty = k;
            loop {
                match self.shards[idx].pop() {
                    Some(raw) => {
                        // SAFETY: the reference was leaked in `execute`
                        let task = unsafe { Arc::from_raw(raw) };
                        task.run();
                        empty = k;
                    }
                    None => {
                        empty -= 1;
                        if empty == 0 {
                            break;
                        }
                    }
                }
                idx = (idx + 1) % k;
            }
        }

        self.live.fetch_sub(1, Ordering::AcqRel);
        kdebug!("{}: finished", me.name().unwrap_or("worker"));
    }

    /// No task linked into any shard
    fn is_idle(&self) -> bool {
        self.shards
            .iter()
            .all(|s| s.tail.load(Ordering::Acquire).is_null())
    }

    /// Drop every task still linked into a shard. Returns the count.
    fn drain(&self) -> usize {
        let mut dropped = 0;
        for shard in self.shards.iter() {
            while let Some(raw) = shard.pop() {
                // SAFETY: reference leaked in `execute`
                drop(unsafe { Arc::from_raw(raw) });
                dropped += 1;
            }
        }
        dropped
    }
}

pub struct ThreadPool {
    inner: Arc<PoolInner>,
    threads: usize,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawn `threads` workers over `contention` shards.
    ///
    /// Workers are named `<name>-<idx>`.
    pub fn new(name: &str, threads: usize, contention: usize) -> Result<Self> {
        let threads = threads.max(1);
        let contention = contention.max(1);
        let inner = Arc::new(PoolInner {
            name: name.to_string(),
            shards: (0..contention).map(|_| CachePadded::new(Shard::new())).collect(),
            permits: PlatformPermits::new(threads as u32),
            run: AtomicBool::new(true),
            live: AtomicUsize::new(0),
        });

        let mut handles = Vec::with_capacity(threads);
        for idx in 0..threads {
            let worker = Arc::clone(&inner);
            worker.live.fetch_add(1, Ordering::AcqRel);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, idx))
                .spawn(move || worker.worker_loop());
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    inner.live.fetch_sub(1, Ordering::AcqRel);
                    let pool = ThreadPool { inner, threads, handles: Mutex::new(handles) };
                    pool.stop_and_wait();
                    return Err(ColliderError::Io(e));
                }
            }
        }

        Ok(ThreadPool { inner, threads, handles: Mutex::new(handles) })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.threads
    }

    #[inline]
    pub fn contention(&self) -> usize {
        self.inner.shards.len()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.run.load(Ordering::Acquire)
    }

    /// Queue `task` for execution.
    ///
    /// Fails with `TaskAlreadyQueued` if it is still waiting in a shard and
    /// with `PoolShutdown` once the pool is stopping.
    pub fn execute(&self, task: &Arc<Task>) -> Result<()> {
        if !self.is_running() {
            return Err(ColliderError::PoolShutdown);
        }
        if task.queued.swap(true, Ordering::AcqRel) {
            return Err(ColliderError::TaskAlreadyQueued);
        }
        debug_assert!(task.next.load(Ordering::Relaxed).is_null());

        let shard = &self.inner.shards[task.hash % self.inner.shards.len()];
        shard.push(Arc::into_raw(Arc::clone(task)) as *mut Task);
        self.inner.permits.release(1);
        Ok(())
    }

    fn begin_stop(&self) -> Vec<thread::JoinHandle<()>> {
        self.inner.run.store(false, Ordering::Release);
        self.inner.permits.close();
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *handles)
    }

    /// Stop accepting tasks, wake every worker and join them all.
    pub fn stop_and_wait(&self) {
        for h in self.begin_stop() {
            if h.join().is_err() {
                kerror!("{}: worker panicked", self.inner.name);
            }
        }
        let dropped = self.inner.drain();
        if dropped > 0 {
            kdebug!("{}: dropped {} queued tasks", self.inner.name, dropped);
        }
    }

    /// Like `stop_and_wait` but gives up after `grace`.
    ///
    /// Workers still busy when the grace period ends are detached and every
    /// queued task is dropped. Returns `true` if all workers finished.
    pub fn shutdown_timeout(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let backoff = Backoff::new();
        // Let queued tasks run first
        while !self.inner.is_idle() && Instant::now() < deadline {
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }

        let handles = self.begin_stop();
        backoff.reset();
        while self.inner.live.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }

        let mut finished = true;
        for h in handles {
            if h.is_finished() {
                if h.join().is_err() {
                    kerror!("{}: worker panicked", self.inner.name);
                }
            } else {
                finished = false;
            }
        }
        if !finished {
            kerror!(
                "{}: {} workers did not finish within {:?}, detaching",
                self.inner.name,
                self.inner.live.load(Ordering::Acquire),
                grace
            );
        }

        let dropped = self.inner.drain();
        if dropped > 0 {
            kdebug!("{}: cancelled {} queued tasks", self.inner.name, dropped);
        }
        finished
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.is_running() {
            // Do not block here, call stop_and_wait() to join
            self.begin_stop();
        }
        self.inner.drain();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.inner.name)
            .field("threads", &self.threads)
            .field("contention", &self.inner.shards.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::mpsc;

    fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !f() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_runs_submitted_tasks() {
        let pool = ThreadPool::new("tp-run", 4, 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let counter = Arc::clone(&counter);
                Task::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for t in &tasks {
            pool.execute(t).unwrap();
        }

        wait_until(|| counter.load(Ordering::SeqCst) == 64);
        pool.stop_and_wait();
    }

    #[test]
    fn test_double_submit_rejected() {
        let pool = ThreadPool::new("tp-double", 1, 1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let runs = Arc::new(AtomicUsize::new(0));

        // Occupy the only worker so `counted` stays queued
        let blocker = Task::new(move || {
            let _ = gate_rx.lock().unwrap().recv();
        });
        pool.execute(&blocker).unwrap();

        let counted = {
            let runs = Arc::clone(&runs);
            Task::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        pool.execute(&counted).unwrap();
        assert!(counted.is_queued());
        assert!(matches!(pool.execute(&counted), Err(ColliderError::TaskAlreadyQueued)));

        gate_tx.send(()).unwrap();
        wait_until(|| runs.load(Ordering::SeqCst) == 1);
        assert!(!counted.is_queued());

        // Completed, so it may go again
        pool.execute(&counted).unwrap();
        wait_until(|| runs.load(Ordering::SeqCst) == 2);
        pool.stop_and_wait();
    }

    #[test]
    fn test_fifo_within_shard() {
        let pool = ThreadPool::new("tp-fifo", 1, 1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<_> = (0..100)
            .map(|i| {
                let order = Arc::clone(&order);
                Task::new(move || order.lock().unwrap().push(i))
            })
            .collect();
        for t in &tasks {
            pool.execute(t).unwrap();
        }

        wait_until(|| order.lock().unwrap().len() == 100);
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
        pool.stop_and_wait();
    }

    #[test]
    fn test_self_resubmitting_task_never_overlaps() {
        let pool = Arc::new(ThreadPool::new("tp-resubmit", 4, 2).unwrap());
        let running = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicU64::new(0));

        let task = Arc::new_cyclic(|weak: &std::sync::Weak<Task>| {
            let weak = weak.clone();
            let pool = Arc::downgrade(&pool);
            let running = Arc::clone(&running);
            let runs = Arc::clone(&runs);
            Task {
                next: AtomicPtr::new(ptr::null_mut()),
                queued: AtomicBool::new(false),
                hash: 7,
                body: Box::new(move || {
                    assert!(!running.swap(true, Ordering::SeqCst), "overlapping run");
                    let n = runs.fetch_add(1, Ordering::SeqCst);
                    running.store(false, Ordering::SeqCst);
                    if n < 999 {
                        if let (Some(pool), Some(me)) = (pool.upgrade(), weak.upgrade()) {
                            pool.execute(&me).unwrap();
                        }
                    }
                }),
            }
        });
        pool.execute(&task).unwrap();

        wait_until(|| runs.load(Ordering::SeqCst) == 1000);
        pool.stop_and_wait();
    }

    #[test]
    fn test_execute_after_stop() {
        let pool = ThreadPool::new("tp-stop", 2, 2).unwrap();
        pool.stop_and_wait();
        let task = Task::new(|| {});
        assert!(matches!(pool.execute(&task), Err(ColliderError::PoolShutdown)));
        assert!(!task.is_queued());
    }

    #[test]
    fn test_shutdown_timeout_detaches_stuck_worker() {
        let pool = ThreadPool::new("tp-grace", 1, 1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);

        let stuck = Task::new(move || {
            let _ = started_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv();
        });
        pool.execute(&stuck).unwrap();
        started_rx.recv().unwrap();

        // Queued behind the stuck one, must be cancelled
        let dropped = Arc::new(AtomicUsize::new(0));
        let counted = {
            let dropped = Arc::clone(&dropped);
            Task::new(move || {
                dropped.fetch_add(1, Ordering::SeqCst);
            })
        };
        pool.execute(&counted).unwrap();

        assert!(!pool.shutdown_timeout(Duration::from_millis(50)));
        assert_eq!(Arc::strong_count(&counted), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_shutdown_timeout_runs_queued_tasks() {
        let pool = ThreadPool::new("tp-drain", 2, 2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let ran = Arc::clone(&ran);
                Task::new(move || {
                    thread::sleep(Duration::from_millis(1));
                    ran.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for t in &tasks {
            pool.execute(t).unwrap();
        }
        assert!(pool.shutdown_timeout(Duration::from_secs(10)));
        assert_eq!(ran.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_concurrent_submitters() {
        let pool = Arc::new(ThreadPool::new("tp-mpmc", 4, 4).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let tasks: Vec<_> = (0..250)
                        .map(|_| {
                            let counter = Arc::clone(&counter);
                            Task::new(move || {
                                counter.fetch_add(1, Ordering::SeqCst);
                            })
                        })
                        .collect();
                    for t in &tasks {
                        pool.execute(t).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        wait_until(|| counter.load(Ordering::SeqCst) == 1000);
        pool.stop_and_wait();
    }
}
