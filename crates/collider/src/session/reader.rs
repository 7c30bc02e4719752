//! Session read path.
//!
//! Input is staged in a linked list of pooled [`DataBlock`]s. One read task
//! (a worker pool task, re-armed after every read) appends at the tail; one
//! consumer at a time walks from the front delivering bytes to the listener.
//! The two meet on a single packed state word.
//!
//! ```text
//!  31  30      29     28      27                 0
//! +---+-------+------+-------+--------------------+
//! | 0 | CLOSE | STOP | TLOCK |   unread length    |
//! +---+-------+------+-------+--------------------+
//! ```
//!
//! - the read task that moves the length from 0 to `n` becomes the consumer
//!   and delivers until the length is back at 0;
//! - `TLOCK` guards the tail block: the producer to extend it, the consumer
//!   to return the drained last block to the cache;
//! - once the unread length exceeds the forward-read threshold read interest
//!   is not re-armed until delivery drops back to or below it;
//! - `CLOSE` is set exactly once and whoever sees the length at 0 at that
//!   moment (or the consumer that drains after it) fires `on_connection_closed`.

use std::cell::UnsafeCell;
use std::io::{self, IoSliceMut};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use collider_core::buffer::DataBlock;
use collider_core::constants::READ_LENGTH_MAX;
use collider_core::{kdebug, ktrace, kwarn, DataBlockCache};
use crossbeam_utils::Backoff;

use super::shmem::{NotifyParser, ShMemChannelIn};
use super::{DummyListener, ReadStats, Session, SessionListener};
use crate::reactor::{Job, Selector, OP_READ};
use crate::thread_pool::Task;

pub(crate) const LENGTH_MASK: u32 = READ_LENGTH_MAX as u32;
pub(crate) const TAIL_LOCK: u32 = 0x1000_0000;
pub(crate) const STOP: u32 = 0x2000_0000;
pub(crate) const CLOSE: u32 = 0x4000_0000;

#[inline]
fn length(state: u32) -> u32 {
    state & LENGTH_MASK
}

pub(crate) fn state_to_string(state: u32) -> String {
    let mut s = String::from("[");
    if state & TAIL_LOCK != 0 {
        s.push_str("TAIL_LOCK ");
    }
    if state & STOP != 0 {
        s.push_str("STOP ");
    }
    if state & CLOSE != 0 {
        s.push_str("CLOSE ");
    }
    s.push_str(&length(state).to_string());
    s.push(']');
    s
}

/// Who holds the tail when a read task starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailLock {
    /// Unread data pending, the read task owns the tail until its length CAS
    Claimed,
    /// Nothing pending but the consumer is still returning the last block
    HeldByConsumer,
    /// Nothing pending, no tail block
    Free,
}

/// Claim the tail for the read task. Returns the lock outcome and the state
/// observed (with `TAIL_LOCK` set when claimed).
fn claim_tail(word: &AtomicU32) -> (TailLock, u32) {
    let mut state = word.load(Ordering::Acquire);
    loop {
        if length(state) == 0 {
            let lock = if state & TAIL_LOCK == 0 { TailLock::Free } else { TailLock::HeldByConsumer };
            return (lock, state);
        }
        debug_assert!(state & TAIL_LOCK == 0);
        let new = state | TAIL_LOCK;
        match word.compare_exchange_weak(state, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return (TailLock::Claimed, new),
            Err(s) => state = s,
        }
    }
}

/// Add `n` received bytes, dropping the claim if held. Returns the new state.
fn publish_received(word: &AtomicU32, mut state: u32, n: u32, claimed: bool) -> u32 {
    loop {
        let len = length(state) + n;
        debug_assert!(len <= LENGTH_MASK);
        let mut new = (state & !LENGTH_MASK) | len;
        if claimed {
            debug_assert!(new & TAIL_LOCK != 0);
            new &= !TAIL_LOCK;
        }
        match word.compare_exchange_weak(state, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return new,
            Err(s) => state = s,
        }
    }
}

/// Subtract `delivered` bytes. When the length reaches 0 the consumer tries
/// to take the tail lock. Returns `(old, new, took_tail_lock)`.
fn consume(word: &AtomicU32, mut state: u32, delivered: u32) -> (u32, u32, bool) {
    loop {
        debug_assert!(length(state) >= delivered);
        let mut new = state - delivered;
        let mut take = false;
        if length(new) == 0 && new & TAIL_LOCK == 0 {
            new |= TAIL_LOCK;
            take = true;
        }
        match word.compare_exchange_weak(state, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return (state, new, take),
            Err(s) => state = s,
        }
    }
}

/// Clear `TAIL_LOCK`, returns the new state.
fn release_tail(word: &AtomicU32) -> u32 {
    let prev = word.fetch_and(!TAIL_LOCK, Ordering::AcqRel);
    debug_assert!(prev & TAIL_LOCK != 0);
    prev & !TAIL_LOCK
}

/// Set `CLOSE` (and drop the claim if held). Returns `(old, new)`.
fn mark_closed(word: &AtomicU32, claimed: bool) -> (u32, u32) {
    let mut state = word.load(Ordering::Acquire);
    loop {
        let mut new = state | CLOSE;
        if claimed {
            new &= !TAIL_LOCK;
        }
        match word.compare_exchange_weak(state, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return (state, new),
            Err(s) => state = s,
        }
    }
}

/// What `stop()` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopKind {
    /// Close already observed or stop already requested
    Ignored,
    /// Read interest is parked by backpressure, no read can be in flight
    Suspended,
    /// A read may be in flight, wait for it
    Pending,
}

fn request_stop(word: &AtomicU32, forward_max: u32) -> (StopKind, u32, u32) {
    let mut state = word.load(Ordering::Acquire);
    loop {
        if state & (CLOSE | STOP) != 0 {
            return (StopKind::Ignored, state, state);
        }
        let (kind, new) = if length(state) > forward_max {
            (StopKind::Suspended, state | CLOSE | STOP)
        } else {
            (StopKind::Pending, state | STOP)
        };
        match word.compare_exchange_weak(state, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return (kind, state, new),
            Err(s) => state = s,
        }
    }
}

/// What the starter job does on the reactor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StarterAction {
    Skip,
    Arm,
    FinishStop,
}

/// A stop requested before the read path saw the peer close must not arm
/// read interest again: no read would follow to complete the handshake.
fn starter_action(state: u32, finished: bool, stop_waiting: bool) -> StarterAction {
    if finished {
        StarterAction::Skip
    } else if stop_waiting || state & (STOP | CLOSE) == STOP | CLOSE {
        StarterAction::FinishStop
    } else {
        StarterAction::Arm
    }
}

/// Inbound side of an accelerated session: socket bytes are batch sizes.
pub(crate) struct ShMemListener {
    session: Weak<Session>,
    channel: Mutex<(NotifyParser, Box<dyn ShMemChannelIn>)>,
    inner: RwLock<Arc<dyn SessionListener>>,
}

impl ShMemListener {
    fn replace(&self, listener: Arc<dyn SessionListener>) -> Arc<dyn SessionListener> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *inner, listener)
    }

    fn current(&self) -> Arc<dyn SessionListener> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }
}

impl SessionListener for ShMemListener {
    fn on_data_received(&self, data: &[u8]) {
        let mut guard = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        let (parser, channel) = &mut *guard;
        let res = parser.feed(data, |size| channel.handle_data(size, &*self.current()));
        drop(guard);
        if let Err(e) = res {
            kwarn!("shmem: inbound transport failed: {}", e);
            if let Some(session) = self.session.upgrade() {
                let _ = session.close_connection();
            }
        }
    }

    fn on_connection_closed(&self) {
        {
            let mut guard = self.channel.lock().unwrap_or_else(|e| e.into_inner());
            guard.1.close();
        }
        self.replace(Arc::new(DummyListener)).on_connection_closed();
    }
}

pub(crate) struct Reader {
    session: Weak<Session>,
    state: AtomicU32,
    forward_max: u32,
    block_size: usize,
    cache: Arc<DataBlockCache>,
    /// Guarded by `TAIL_LOCK` (or by an empty, unlocked state word)
    tail: UnsafeCell<*mut DataBlock>,
    listener: RwLock<Arc<dyn SessionListener>>,
    shmem: OnceLock<Arc<ShMemListener>>,

    task: Arc<Task>,
    starter: Arc<Job>,
    stopper: Arc<Job>,
    close_notifier: Arc<Task>,

    // Reactor thread only
    stop_waiting: AtomicBool,
    suspended_stop: AtomicBool,
    finished: AtomicBool,

    stat_reads: AtomicU64,
    stat_inline: AtomicU64,
    stat_suspends: AtomicU64,
}

// SAFETY: `tail` is only touched under the state word protocol above
unsafe impl Send for Reader {}
unsafe impl Sync for Reader {}

impl Reader {
    pub(crate) fn new(
        session: Weak<Session>,
        cache: Arc<DataBlockCache>,
        forward_max: usize,
    ) -> Self {
        let task = {
            let weak = session.clone();
            Task::new(move || {
                if let Some(s) = weak.upgrade() {
                    s.reader.run(&s);
                }
            })
        };
        let starter = {
            let weak = session.clone();
            Job::new(move |sel: &mut Selector| {
                if let Some(s) = weak.upgrade() {
                    s.reader.on_starter(&s, sel);
                }
            })
        };
        let stopper = {
            let weak = session.clone();
            Job::new(move |sel: &mut Selector| {
                if let Some(s) = weak.upgrade() {
                    s.reader.on_stopper(&s, sel);
                }
            })
        };
        let close_notifier = {
            let weak = session.clone();
            Task::new(move || {
                if let Some(s) = weak.upgrade() {
                    s.reader.notify_closed(&s);
                }
            })
        };

        Self {
            session,
            state: AtomicU32::new(0),
            forward_max: forward_max.min(READ_LENGTH_MAX) as u32,
            block_size: cache.block_size(),
            cache,
            tail: UnsafeCell::new(ptr::null_mut()),
            listener: RwLock::new(Arc::new(DummyListener)),
            shmem: OnceLock::new(),
            task,
            starter,
            stopper,
            close_notifier,
            stop_waiting: AtomicBool::new(false),
            suspended_stop: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            stat_reads: AtomicU64::new(0),
            stat_inline: AtomicU64::new(0),
            stat_suspends: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub(crate) fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Received bytes not yet handed to the listener.
    pub(crate) fn pending(&self) -> usize {
        length(self.state()) as usize
    }

    pub(crate) fn stats(&self) -> ReadStats {
        ReadStats {
            reads: self.stat_reads.load(Ordering::Relaxed),
            inline: self.stat_inline.load(Ordering::Relaxed),
            suspends: self.stat_suspends.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn SessionListener>) {
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    pub(crate) fn replace_listener(&self, listener: Arc<dyn SessionListener>) -> Arc<dyn SessionListener> {
        if let Some(shmem) = self.shmem.get() {
            return shmem.replace(listener);
        }
        let mut current = self.listener.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, listener)
    }

    fn listener(&self) -> Arc<dyn SessionListener> {
        Arc::clone(&self.listener.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Route inbound bytes through the shared-memory channel from now on.
    pub(crate) fn accelerate(&self, inbound: Box<dyn ShMemChannelIn>) {
        let mut current = self.listener.write().unwrap_or_else(|e| e.into_inner());
        let shmem = Arc::new(ShMemListener {
            session: self.session.clone(),
            channel: Mutex::new((NotifyParser::default(), inbound)),
            inner: RwLock::new(Arc::clone(&current)),
        });
        if self.shmem.set(Arc::clone(&shmem)).is_ok() {
            *current = shmem;
        }
    }

    /// Arm read interest for the first time.
    pub(crate) fn start(&self, session: &Session) {
        session.execute_job(&self.starter, "reader start");
    }

    /// Fire `on_connection_closed` and drop the listener.
    pub(crate) fn notify_closed(&self, session: &Session) {
        let listener = {
            let mut current = self.listener.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, Arc::new(DummyListener))
        };
        listener.on_connection_closed();
        kdebug!(
            "{} -> {}: reads={} inline={} suspends={}",
            session.local_addr(),
            session.remote_addr(),
            self.stat_reads.load(Ordering::Relaxed),
            self.stat_inline.load(Ordering::Relaxed),
            self.stat_suspends.load(Ordering::Relaxed)
        );
    }

    /// Stop reading. The socket share is released once no read is in flight.
    pub(crate) fn stop(&self, session: &Session) {
        let (kind, old, new) = request_stop(&self.state, self.forward_max);
        if kind == StopKind::Ignored {
            return;
        }
        ktrace!(
            "{}: reader {} -> {}",
            session.remote_addr(),
            state_to_string(old),
            state_to_string(new)
        );
        if kind == StopKind::Suspended {
            self.suspended_stop.store(true, Ordering::Release);
        }
        session.execute_job(&self.stopper, "reader stop");
    }

    /// # Safety
    /// Caller holds the tail (claimed lock, consumer lock, or empty state).
    #[inline]
    unsafe fn tail(&self) -> *mut DataBlock {
        *self.tail.get()
    }

    #[inline]
    unsafe fn set_tail(&self, block: *mut DataBlock) {
        *self.tail.get() = block;
    }

    /// The read task body.
    fn run(&self, session: &Session) {
        let (lock, mut state) = claim_tail(&self.state);

        // Fresh blocks come as a chain of two, split them
        let fresh_pair = || {
            let b0 = self.cache.get(2);
            // SAFETY: just handed out by the cache
            let b1 = unsafe { (*b0).next() };
            unsafe { (*b0).set_next(ptr::null_mut()) };
            (b0, b1)
        };

        // SAFETY: the claim gives the tail to this task
        let (block0, mut block1, prev) = unsafe {
            if lock == TailLock::Claimed && (*self.tail()).remaining() > 0 {
                (self.tail(), self.cache.get(1), ptr::null_mut())
            } else if lock == TailLock::Claimed {
                let (b0, b1) = fresh_pair();
                (b0, b1, self.tail())
            } else {
                let (b0, b1) = fresh_pair();
                (b0, b1, ptr::null_mut())
            }
        };
        // SAFETY: block0 is either the claimed tail or a fresh block
        let pos0 = unsafe { (*block0).write_pos() };
        let space0 = self.block_size - pos0;

        let received = loop {
            // SAFETY: only this task writes past the write cursors
            let (s0, s1) = unsafe { ((*block0).spare_mut(), (*block1).spare_mut()) };
            let mut iov = [IoSliceMut::new(s0), IoSliceMut::new(s1)];
            match session.read_vectored(&mut iov) {
                Ok(n) => break Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.stat_reads.fetch_add(1, Ordering::Relaxed);

        match received {
            Ok(n) if n > 0 => unsafe {
                // SAFETY: block list mutation below follows the tail protocol
                if !prev.is_null() {
                    (*prev).set_next(block0);
                }
                if lock == TailLock::HeldByConsumer {
                    // The consumer nulls the tail before releasing it
                    let backoff = Backoff::new();
                    loop {
                        state = self.state.load(Ordering::Acquire);
                        if state & TAIL_LOCK == 0 {
                            break;
                        }
                        backoff.snooze();
                    }
                }

                if n > space0 {
                    (*block0).set_write_pos(self.block_size);
                    (*block1).set_write_pos(n - space0);
                    (*block0).set_next(block1);
                    self.set_tail(block1);
                    block1 = ptr::null_mut();
                } else {
                    (*block0).set_write_pos(pos0 + n);
                    self.set_tail(block0);
                }

                let state =
                    publish_received(&self.state, state, n as u32, lock == TailLock::Claimed);
                let len = length(state);
                if len > self.forward_max && state & STOP == 0 {
                    // Backpressure: leave read interest disarmed
                    self.stat_suspends.fetch_add(1, Ordering::Relaxed);
                } else {
                    session.execute_job_no_wakeup(&self.starter, "reader rearm");
                }

                if len as usize == n {
                    self.stat_inline.fetch_add(1, Ordering::Relaxed);
                    self.handle_data(session, block0, state);
                    if !prev.is_null() {
                        (*prev).set_next(ptr::null_mut());
                        self.cache.put(prev);
                    }
                }
                self.cache.put(block1);
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => unsafe {
                // Spurious readiness, nothing was read
                self.cache.put(block1);
                if lock == TailLock::Claimed {
                    if !prev.is_null() {
                        self.cache.put(block0);
                    }
                    let state = release_tail(&self.state);
                    if length(state) == 0 {
                        // The consumer finished meanwhile and left the tail to us
                        self.cache.put(self.tail());
                        self.set_tail(ptr::null_mut());
                    }
                } else {
                    self.cache.put(block0);
                }
                session.execute_job_no_wakeup(&self.starter, "reader rearm");
            },
            other => unsafe {
                if let Err(e) = other {
                    kwarn!("{} -> {}: {}", session.local_addr(), session.remote_addr(), e);
                }
                let claimed = lock == TailLock::Claimed;
                let (old, state) = mark_closed(&self.state, claimed);
                ktrace!(
                    "{} -> {}: reader {} -> {}",
                    session.local_addr(),
                    session.remote_addr(),
                    state_to_string(old),
                    state_to_string(state)
                );

                if old & CLOSE == 0 {
                    if state & STOP == 0 {
                        session.handle_reader_stopped();
                    } else {
                        // The pending stop completes through the starter
                        session.execute_job(&self.starter, "reader stop handshake");
                    }
                }

                self.cache.put(block1);
                if claimed && prev.is_null() {
                    // block0 is the tail
                } else {
                    self.cache.put(block0);
                }
                if claimed && length(state) == 0 {
                    self.cache.put(self.tail());
                    self.set_tail(ptr::null_mut());
                }

                if old & CLOSE == 0 && length(state) == 0 {
                    self.notify_closed(session);
                }
            },
        }
    }

    /// Deliver everything published so far, starting at `block`.
    ///
    /// # Safety
    /// Only the read task that moved the length from 0 may call this.
    unsafe fn handle_data(&self, session: &Session, mut block: *mut DataBlock, mut state: u32) {
        let took_tail;
        let closed;
        loop {
            let ready = length(state);
            let mut remaining = ready as usize;
            let mut pos = (*block).read_pos();
            loop {
                let room = self.block_size - pos;
                if remaining <= room {
                    let end = pos + remaining;
                    self.listener().on_data_received((*block).slice(pos, end));
                    (*block).set_read_pos(end);
                    break;
                }
                self.listener().on_data_received((*block).slice(pos, self.block_size));
                remaining -= room;
                let next = (*block).next();
                debug_assert!(!next.is_null());
                self.cache.put(block);
                block = next;
                pos = (*block).read_pos();
            }

            let (old, new, take) = consume(&self.state, state, ready);
            if length(old) > self.forward_max
                && length(new) <= self.forward_max
                && new & STOP == 0
            {
                session.execute_job(&self.starter, "reader resume");
            }
            state = new;

            if length(new) == 0 {
                took_tail = take;
                closed = new & CLOSE != 0;
                break;
            }

            if (*block).read_pos() == self.block_size {
                let next = (*block).next();
                debug_assert!(!next.is_null());
                self.cache.put(block);
                block = next;
            }
        }

        if took_tail {
            debug_assert!(self.tail() == block);
            self.set_tail(ptr::null_mut());
            self.cache.put(block);
            release_tail(&self.state);
        }

        if closed {
            self.notify_closed(session);
        }
    }

    fn on_starter(&self, session: &Session, sel: &mut Selector) {
        let action = starter_action(
            self.state.load(Ordering::Acquire),
            self.finished.load(Ordering::Acquire),
            self.stop_waiting.load(Ordering::Acquire),
        );
        match action {
            StarterAction::Skip => {}
            StarterAction::FinishStop => self.finish_stop(session, sel),
            StarterAction::Arm => {
                sel.add_interest(session.token(), OP_READ);
            }
        }
    }

    fn on_stopper(&self, session: &Session, sel: &mut Selector) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let Some(interest) = sel.interest(session.token()) else {
            return;
        };
        if self.suspended_stop.load(Ordering::Acquire) || interest & OP_READ != 0 {
            self.finish_stop(session, sel);
        } else {
            // A read is in flight, its re-arm request completes the stop
            self.stop_waiting.store(true, Ordering::Release);
        }
    }

    /// Reactor thread, no read in flight.
    fn finish_stop(&self, session: &Session, sel: &mut Selector) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.load(Ordering::Acquire);
        while state & CLOSE == 0 {
            match self.state.compare_exchange_weak(
                state,
                state | CLOSE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    ktrace!(
                        "{}: reader {} -> {}",
                        session.remote_addr(),
                        state_to_string(state),
                        state_to_string(state | CLOSE)
                    );
                    if length(state) == 0 {
                        if let Err(e) = session.collider().execute_in_thread_pool(&self.close_notifier) {
                            kdebug!("{}: close notifier inline ({})", session.remote_addr(), e);
                            self.notify_closed(session);
                        }
                    }
                    break;
                }
                Err(s) => state = s,
            }
        }
        sel.remove_interest(session.token(), OP_READ);
        session.release_socket("reader stopped");
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let tail = *self.tail.get_mut();
        if !tail.is_null() {
            // SAFETY: nobody else can reach the reader any more
            unsafe { self.cache.put(tail) };
        }
    }
}
