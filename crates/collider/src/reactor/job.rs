//! Reactor jobs and their MPSC queue.
//!
//! Any thread appends with a CAS on the tail and then publishes the link from
//! the previous tail. Only the reactor thread pops. When the reactor exits it
//! seals the queue by parking a sentinel in the tail, after which appends
//! fail with `Stopped`.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use collider_core::{ColliderError, Result};
use crossbeam_utils::Backoff;

use super::Selector;

/// Tail value of a sealed queue (never dereferenced)
const SEALED: usize = 1;

#[inline]
fn sealed_ptr() -> *mut Job {
    SEALED as *mut Job
}

/// A unit of work that runs on the reactor thread with access to the
/// registration table.
pub struct Job {
    next: AtomicPtr<Job>,
    queued: AtomicBool,
    body: Box<dyn Fn(&mut Selector) + Send + Sync>,
}

impl Job {
    pub fn new<F>(body: F) -> Arc<Job>
    where
        F: Fn(&mut Selector) + Send + Sync + 'static,
    {
        Arc::new(Job {
            next: AtomicPtr::new(ptr::null_mut()),
            queued: AtomicBool::new(false),
            body: Box::new(body),
        })
    }

    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn run(&self, selector: &mut Selector) {
        (self.body)(selector)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("queued", &self.is_queued()).finish()
    }
}

pub(crate) struct JobQueue {
    head: AtomicPtr<Job>,
    tail: AtomicPtr<Job>,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Append `job`. Returns `true` when the queue was empty before.
    pub(crate) fn push(&self, job: &Arc<Job>) -> Result<bool> {
        if job.queued.swap(true, Ordering::AcqRel) {
            return Err(ColliderError::TaskAlreadyQueued);
        }
        debug_assert!(job.next.load(Ordering::Relaxed).is_null());

        let raw = Arc::into_raw(Arc::clone(job)) as *mut Job;
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            if tail == sealed_ptr() {
                // SAFETY: reclaim the reference leaked above
                drop(unsafe { Arc::from_raw(raw) });
                job.queued.store(false, Ordering::Release);
                return Err(ColliderError::Stopped);
            }
            match self
                .tail
                .compare_exchange_weak(tail, raw, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => tail = actual,
            }
        }

        if tail.is_null() {
            self.head.store(raw, Ordering::Release);
            Ok(true)
        } else {
            // SAFETY: the previous tail cannot be popped before this link exists
            unsafe { (*tail).next.store(raw, Ordering::Release) };
            Ok(false)
        }
    }

    /// Something was appended and not yet popped (may still be publishing).
    #[inline]
    pub(crate) fn has_pending(&self) -> bool {
        let tail = self.tail.load(Ordering::SeqCst);
        !tail.is_null() && tail != sealed_ptr()
    }

    /// Reactor thread only.
    pub(crate) fn pop(&self) -> Option<Arc<Job>> {
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }
        // SAFETY: owned by the queue until unlinked below
        let job = unsafe { &*head };
        let mut next = job.next.load(Ordering::Acquire);
        if next.is_null() {
            self.head.store(ptr::null_mut(), Ordering::Release);
            if self
                .tail
                .compare_exchange(head, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                job.queued.store(false, Ordering::Release);
                // SAFETY: reference leaked in `push`
                return Some(unsafe { Arc::from_raw(head) });
            }
            let backoff = Backoff::new();
            loop {
                next = job.next.load(Ordering::Acquire);
                if !next.is_null() {
                    break;
                }
                backoff.snooze();
            }
        }
        self.head.store(next, Ordering::Release);
        job.next.store(ptr::null_mut(), Ordering::Release);
        job.queued.store(false, Ordering::Release);
        // SAFETY: reference leaked in `push`
        Some(unsafe { Arc::from_raw(head) })
    }

    /// Pop until the queue is sealed, handing every job still queued to `f`.
    /// Reactor thread only.
    pub(crate) fn seal(&self, mut f: impl FnMut(Arc<Job>)) {
        let backoff = Backoff::new();
        loop {
            while let Some(job) = self.pop() {
                f(job);
            }
            if self
                .tail
                .compare_exchange(ptr::null_mut(), sealed_ptr(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            // An append is publishing its head
            backoff.snooze();
        }
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.tail.load(Ordering::Acquire) == sealed_ptr()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        if !self.is_sealed() {
            while let Some(job) = self.pop() {
                drop(job);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn noop() -> Arc<Job> {
        Job::new(|_| {})
    }

    #[test]
    fn test_push_reports_empty_transition() {
        let q = JobQueue::new();
        let (a, b) = (noop(), noop());
        assert!(q.push(&a).unwrap());
        assert!(!q.push(&b).unwrap());
        assert!(q.has_pending());

        assert!(Arc::ptr_eq(&q.pop().unwrap(), &a));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &b));
        assert!(q.pop().is_none());
        assert!(!q.has_pending());
        assert!(q.push(&a).unwrap());
        q.pop();
    }

    #[test]
    fn test_double_push_rejected() {
        let q = JobQueue::new();
        let a = noop();
        q.push(&a).unwrap();
        assert!(matches!(q.push(&a), Err(ColliderError::TaskAlreadyQueued)));
        q.pop().unwrap();
        assert!(!a.is_queued());
        q.push(&a).unwrap();
        q.pop();
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn test_sealed_queue_refuses() {
        let q = JobQueue::new();
        let a = noop();
        q.push(&a).unwrap();

        let mut seen = 0;
        q.seal(|_| seen += 1);
        assert_eq!(seen, 1);
        assert!(q.is_sealed());
        assert!(!q.has_pending());

        assert!(matches!(q.push(&a), Err(ColliderError::Stopped)));
        assert!(!a.is_queued());
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn test_concurrent_producers_fifo_per_producer() {
        let q = Arc::new(JobQueue::new());
        let popped = Arc::new(AtomicUsize::new(0));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let jobs: Vec<_> = (0..500).map(|_| noop()).collect();
                    for j in &jobs {
                        q.push(j).unwrap();
                    }
                    jobs
                })
            })
            .collect();

        let mut total = 0;
        while total < 2000 {
            if q.pop().is_some() {
                total += 1;
                popped.fetch_add(1, Ordering::Relaxed);
            } else {
                thread::yield_now();
            }
        }
        for p in producers {
            for j in p.join().unwrap() {
                assert!(!j.is_queued());
            }
        }
        assert!(q.pop().is_none());
    }
}
