//! The reactor: one thread waiting on epoll and owning every registration.
//!
//! Readiness is dispatched into the worker pool. Any thread that needs to
//! change a registration sends a [`Job`] back through the lock-free job queue;
//! jobs get `&mut Selector`, which only exists on the reactor thread.
//!
//! # Lifecycle
//!
//! ```text
//! RUNNING --stop()--> STOPPING --no registrations left--> terminated
//! ```
//!
//! `stop()` stops every acceptor and connector from the worker pool, then
//! closes every registered session on the reactor thread. The loop exits
//! once the registration table is empty, the job queue is sealed and the
//! worker pool is shut down with the configured grace period.

mod job;
mod poller;
mod waker;

pub use job::Job;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use collider_core::{kdebug, ktrace, kwarn, ColliderConfig, ColliderError, DataBlockCache, Result};

use crate::acceptor::{self, Acceptor};
use crate::connector::{self, Connector};
use crate::thread_pool::{Task, ThreadPool};
use job::JobQueue;
use poller::Poller;
use waker::Waker;

/// Read readiness
pub const OP_READ: u32 = 1;
/// Write readiness
pub const OP_WRITE: u32 = 2;

/// Reserved for the waker eventfd
const WAKE_TOKEN: u64 = u64::MAX;

/// Registration handle. Tokens are never reused, so a job holding the token
/// of a cancelled registration finds nothing and does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// Receiver of readiness events for one registration.
pub(crate) trait ChannelHandler: Send + Sync {
    /// Reactor thread. `ready` is already removed from the interest set.
    fn handle_ready_ops(&self, ready: u32, pool: &ThreadPool);

    /// Forced close on reactor stop.
    fn force_close(&self) {}
}

/// Something that produces sessions (an acceptor or a connector).
pub(crate) trait SessionEmitter: Send + Sync {
    /// Blocks until the emitter released its resources.
    fn stop(&self);
}

struct Key {
    fd: RawFd,
    interest: u32,
    handler: Arc<dyn ChannelHandler>,
}

/// Registration table, reachable only from reactor jobs.
pub struct Selector {
    poller: Poller,
    keys: HashMap<Token, Key>,
    stopping: bool,
}

impl Selector {
    fn new(poller: Poller) -> Self {
        Self { poller, keys: HashMap::new(), stopping: false }
    }

    /// Interest set of `token`, `None` once cancelled.
    pub fn interest(&self, token: Token) -> Option<u32> {
        self.keys.get(&token).map(|k| k.interest)
    }

    /// Arm `ops`. Returns `false` if the registration is gone.
    pub fn add_interest(&mut self, token: Token, ops: u32) -> bool {
        self.update_interest(token, |interest| interest | ops)
    }

    /// Disarm `ops`. Returns `false` if the registration is gone.
    pub fn remove_interest(&mut self, token: Token, ops: u32) -> bool {
        self.update_interest(token, |interest| interest & !ops)
    }

    fn update_interest(&mut self, token: Token, f: impl FnOnce(u32) -> u32) -> bool {
        let Some(key) = self.keys.get_mut(&token) else {
            return false;
        };
        let interest = f(key.interest);
        if interest != key.interest {
            key.interest = interest;
            if let Err(e) = self.poller.modify(key.fd, token.0, interest) {
                kwarn!("selector: failed to update interest of {:?}: {}", token, e);
            }
        }
        true
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        token: Token,
        interest: u32,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        if self.keys.contains_key(&token) {
            return Err(ColliderError::AlreadyRegistered);
        }
        self.poller.add(fd, token.0, interest)?;
        self.keys.insert(token, Key { fd, interest, handler });
        Ok(())
    }

    /// Cancel a registration. The descriptor itself stays open.
    pub(crate) fn deregister(&mut self, token: Token) -> bool {
        match self.keys.remove(&token) {
            Some(key) => {
                if let Err(e) = self.poller.delete(key.fd) {
                    kwarn!("selector: failed to deregister {:?}: {}", token, e);
                }
                true
            }
            None => false,
        }
    }

    fn dispatch(&mut self, token: Token, ops: u32, pool: &ThreadPool) {
        let Some(key) = self.keys.get_mut(&token) else {
            return;
        };
        let ready = ops & key.interest;
        if ready == 0 {
            return;
        }
        key.interest &= !ready;
        if key.interest != 0 {
            // One-shot registration fired, re-arm what is left
            if let Err(e) = self.poller.modify(key.fd, token.0, key.interest) {
                kwarn!("selector: failed to re-arm {:?}: {}", token, e);
            }
        }
        let handler = Arc::clone(&key.handler);
        handler.handle_ready_ops(ready, pool);
    }

    fn handlers(&self) -> Vec<Arc<dyn ChannelHandler>> {
        self.keys.values().map(|k| Arc::clone(&k.handler)).collect()
    }
}

struct Registry {
    stop: bool,
    emitters: HashMap<usize, Arc<dyn SessionEmitter>>,
}

struct ColliderInner {
    config: ColliderConfig,
    pool: ThreadPool,
    jobs: JobQueue,
    waker: Waker,
    /// Set while the reactor may be blocked in the epoll wait
    sleeping: AtomicBool,
    selector: Mutex<Option<Selector>>,
    registry: Mutex<Registry>,
    next_token: AtomicU64,
    input_cache: Arc<DataBlockCache>,
}

/// Handle to one reactor instance. Clones share the instance.
#[derive(Clone)]
pub struct Collider {
    inner: Arc<ColliderInner>,
}

impl Collider {
    pub fn new(config: ColliderConfig) -> Result<Self> {
        config.validate()?;

        let pool = ThreadPool::new(
            "collider",
            config.effective_threads(),
            config.thread_pool_contention,
        )?;
        let poller = Poller::new()?;
        let waker = Waker::create()?;
        poller.add_waker(waker.fd(), WAKE_TOKEN)?;
        let input_cache = Arc::new(DataBlockCache::new(
            config.input_queue_block_size,
            config.input_queue_cache_max,
            config.use_direct_buffers,
        ));

        Ok(Self {
            inner: Arc::new(ColliderInner {
                config,
                pool,
                jobs: JobQueue::new(),
                waker,
                sleeping: AtomicBool::new(false),
                selector: Mutex::new(Some(Selector::new(poller))),
                registry: Mutex::new(Registry { stop: false, emitters: HashMap::new() }),
                next_token: AtomicU64::new(1),
                input_cache,
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &ColliderConfig {
        &self.inner.config
    }

    #[inline]
    pub fn thread_pool(&self) -> &ThreadPool {
        &self.inner.pool
    }

    pub(crate) fn input_cache(&self) -> &Arc<DataBlockCache> {
        &self.inner.input_cache
    }

    pub(crate) fn alloc_token(&self) -> Token {
        Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Run the reactor loop on the calling thread until stopped.
    ///
    /// Only the first call runs, later calls return `Stopped`. A failed
    /// epoll wait is returned after the worker pool is shut down.
    pub fn run(&self) -> Result<()> {
        let mut selector = self
            .inner
            .selector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ColliderError::Stopped)?;
        let inner = &*self.inner;
        kdebug!("collider: started");

        let result = loop {
            let mut timeout = if inner.jobs.has_pending() { Some(Duration::ZERO) } else { None };
            if timeout.is_none() {
                inner.sleeping.store(true, Ordering::SeqCst);
                // A no-wakeup enqueue may have raced the flag
                if inner.jobs.has_pending() {
                    timeout = Some(Duration::ZERO);
                }
            }
            let waited = selector.poller.wait(timeout);
            inner.sleeping.store(false, Ordering::SeqCst);
            let n = match waited {
                Ok(n) => n,
                Err(e) => break Err(e),
            };

            for i in 0..n {
                let (token, ops) = selector.poller.event(i);
                if token == WAKE_TOKEN {
                    inner.waker.drain();
                    continue;
                }
                selector.dispatch(Token(token), ops, &inner.pool);
            }

            while let Some(job) = inner.jobs.pop() {
                job.run(&mut selector);
            }

            if selector.stopping && selector.keys.is_empty() {
                break Ok(());
            }
        };

        inner.jobs.seal(|job| job.run(&mut selector));
        let left = selector.len();
        drop(selector);
        if left > 0 {
            kwarn!("collider: {} registrations left at exit", left);
        }

        inner.pool.shutdown_timeout(inner.config.shutdown_timeout);
        kdebug!("collider: stopped");
        result
    }

    /// Queue `job` for the reactor thread, waking it if needed.
    pub fn execute_in_selector_thread(&self, job: &Arc<Job>) -> Result<()> {
        if self.inner.jobs.push(job)? {
            self.inner.waker.wake()?;
        }
        Ok(())
    }

    /// Like `execute_in_selector_thread` but skips the eventfd write while
    /// the reactor is awake; it re-checks the queue before every wait.
    pub fn execute_in_selector_thread_no_wakeup(&self, job: &Arc<Job>) -> Result<()> {
        if self.inner.jobs.push(job)? && self.inner.sleeping.load(Ordering::SeqCst) {
            self.inner.waker.wake()?;
        }
        Ok(())
    }

    pub fn execute_in_thread_pool(&self, task: &Arc<Task>) -> Result<()> {
        self.inner.pool.execute(task)
    }

    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        let emitters: Vec<_> = {
            let mut reg = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
            if reg.stop {
                return;
            }
            reg.stop = true;
            reg.emitters.drain().map(|(_, e)| e).collect()
        };
        kdebug!("collider: stop requested, {} emitters", emitters.len());

        let emitters = Mutex::new(emitters);
        let collider = self.clone();
        let work = Arc::new(move || {
            let emitters = std::mem::take(&mut *emitters.lock().unwrap_or_else(|e| e.into_inner()));
            for emitter in emitters {
                emitter.stop();
            }
            collider.schedule_stop();
        });
        let task = {
            let work = Arc::clone(&work);
            Task::new(move || work())
        };
        if let Err(e) = self.execute_in_thread_pool(&task) {
            ktrace!("collider: stop runs inline ({})", e);
            work();
        }
    }

    fn schedule_stop(&self) {
        let job = Job::new(|selector: &mut Selector| {
            for handler in selector.handlers() {
                handler.force_close();
            }
            selector.stopping = true;
        });
        if let Err(e) = self.execute_in_selector_thread(&job) {
            ktrace!("collider: stop job not queued ({})", e);
        }
    }

    /// Stop requested
    pub fn is_stopped(&self) -> bool {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner()).stop
    }

    pub(crate) fn register_emitter(&self, key: usize, emitter: Arc<dyn SessionEmitter>) -> Result<()> {
        let mut reg = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        if reg.stop {
            return Err(ColliderError::Stopped);
        }
        if reg.emitters.contains_key(&key) {
            return Err(ColliderError::AlreadyRegistered);
        }
        reg.emitters.insert(key, emitter);
        Ok(())
    }

    pub(crate) fn unregister_emitter(&self, key: usize) -> Option<Arc<dyn SessionEmitter>> {
        let mut reg = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.emitters.remove(&key)
    }

    /// Start accepting connections. Failures go to
    /// `Acceptor::on_acceptor_starting_failure`.
    pub fn add_acceptor(&self, acceptor: Arc<dyn Acceptor>) {
        acceptor::start(self, acceptor);
    }

    /// Stop accepting and wait until the listening socket is closed.
    /// Sessions already accepted stay open.
    pub fn remove_acceptor(&self, acceptor: &Arc<dyn Acceptor>) {
        if let Some(emitter) = self.unregister_emitter(emitter_key(acceptor)) {
            emitter.stop();
        }
    }

    /// Connect in the worker pool. Failures go to
    /// `Connector::on_connection_failed`.
    pub fn add_connector(&self, connector: Arc<dyn Connector>) {
        connector::start(self, connector);
    }

    /// Forget a pending connector, waiting for an attempt in flight.
    pub fn remove_connector(&self, connector: &Arc<dyn Connector>) {
        if let Some(emitter) = self.unregister_emitter(emitter_key(connector)) {
            emitter.stop();
        }
    }
}

impl std::fmt::Debug for Collider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collider")
            .field("pool", &self.inner.pool)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Registry key of an emitter: the address of the shared object.
pub(crate) fn emitter_key<T: ?Sized>(obj: &Arc<T>) -> usize {
    Arc::as_ptr(obj) as *const u8 as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn test_config() -> ColliderConfig {
        ColliderConfig::new()
            .thread_pool_threads(2)
            .shutdown_timeout(Duration::from_secs(5))
    }

    fn spawn_run(collider: &Collider) -> thread::JoinHandle<Result<()>> {
        let c = collider.clone();
        thread::spawn(move || c.run())
    }

    #[test]
    fn test_jobs_run_on_reactor_thread_in_order() {
        let collider = Collider::new(test_config()).unwrap();
        let handle = spawn_run(&collider);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let order = Arc::new(Mutex::new(Vec::new()));

        let jobs: Vec<_> = (0..10)
            .map(|i| {
                let order = Arc::clone(&order);
                Job::new(move |_| order.lock().unwrap().push(i))
            })
            .collect();
        for j in &jobs {
            collider.execute_in_selector_thread(j).unwrap();
        }
        let thread_check = Job::new(move |_| {
            tx.lock().unwrap().send(thread::current().id()).unwrap();
        });
        collider.execute_in_selector_thread(&thread_check).unwrap();

        let reactor_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reactor_thread, handle.thread().id());
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());

        collider.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_no_wakeup_enqueue_still_runs_when_sleeping() {
        let collider = Collider::new(test_config()).unwrap();
        let handle = spawn_run(&collider);
        let ran = Arc::new(AtomicUsize::new(0));

        thread::sleep(Duration::from_millis(50));
        let job = {
            let ran = Arc::clone(&ran);
            Job::new(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };
        collider.execute_in_selector_thread_no_wakeup(&job).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "job never ran");
            thread::sleep(Duration::from_millis(1));
        }
        collider.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent_and_run_only_once() {
        let collider = Collider::new(test_config()).unwrap();
        collider.stop();
        collider.stop();
        assert!(collider.is_stopped());

        collider.run().unwrap();
        assert!(matches!(collider.run(), Err(ColliderError::Stopped)));

        // Sealed after exit
        let job = Job::new(|_| {});
        assert!(matches!(
            collider.execute_in_selector_thread(&job),
            Err(ColliderError::Stopped)
        ));
        assert!(!collider.thread_pool().is_running());
    }

    #[test]
    fn test_interest_bookkeeping() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        struct Nop;
        impl ChannelHandler for Nop {
            fn handle_ready_ops(&self, _ready: u32, _pool: &ThreadPool) {}
        }

        let (a, _b) = UnixStream::pair().unwrap();
        let mut selector = Selector::new(Poller::new().unwrap());
        let token = Token(5);
        selector.register(a.as_raw_fd(), token, 0, Arc::new(Nop)).unwrap();
        assert!(matches!(
            selector.register(a.as_raw_fd(), token, 0, Arc::new(Nop)),
            Err(ColliderError::AlreadyRegistered)
        ));

        assert!(selector.add_interest(token, OP_READ));
        assert!(selector.add_interest(token, OP_WRITE));
        assert_eq!(selector.interest(token), Some(OP_READ | OP_WRITE));
        assert!(selector.remove_interest(token, OP_READ));
        assert_eq!(selector.interest(token), Some(OP_WRITE));

        assert!(selector.deregister(token));
        assert!(!selector.deregister(token));
        assert!(!selector.add_interest(token, OP_READ));
        assert_eq!(selector.interest(token), None);
        assert!(selector.is_empty());
    }

    #[test]
    fn test_tokens_are_unique() {
        let collider = Collider::new(test_config()).unwrap();
        let a = collider.alloc_token();
        let b = collider.alloc_token();
        assert_ne!(a, b);
        assert_ne!(a.0, WAKE_TOKEN);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = test_config().thread_pool_contention(0);
        assert!(matches!(Collider::new(config), Err(ColliderError::InvalidConfig(_))));
    }
}
