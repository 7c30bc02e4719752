//! `Session`: one connected socket.
//!
//! # Output queue
//!
//! Outgoing buffers are nodes of an intrusive list. Senders CAS the tail; the
//! sender that finds the queue empty becomes its head and schedules the
//! writer task, later senders only link behind the tail. The writer owns
//! `head` and walks forward, so exactly one thread writes to the socket at a
//! time. Closing parks a marker in the tail after which sends are refused.
//!
//! # Lifecycle word
//!
//! ```text
//!   8        5..4       1..0
//! +-------+----------+-------+
//! | CLOSE | SOCK_RC  | PHASE |   PHASE: STARTING=0, RUNNING=1
//! +-------+----------+-------+
//! ```
//!
//! `SOCK_RC` counts two shares, one held by the read path and one by the
//! write path. Whoever drops the last share sends the deregistration job that
//! cancels the registration and closes the socket on the reactor thread.

pub(crate) mod reader;
pub mod shmem;

use std::cell::UnsafeCell;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use collider_core::constants::WRITE_IOV_MAX;
use collider_core::{kdebug, ktrace, kwarn, ColliderError, Result};
use crossbeam_utils::Backoff;

use crate::reactor::{ChannelHandler, Collider, Job, Selector, Token, OP_READ, OP_WRITE};
use crate::thread_pool::{Task, ThreadPool};
use reader::Reader;
use shmem::{ShMem, ShMemChannelOut, BATCH_MAX_BYTES, NOTIFY_SIZE};

pub(crate) const STATE_MASK: u32 = 0x0003;
pub(crate) const ST_STARTING: u32 = 0x0000;
pub(crate) const ST_RUNNING: u32 = 0x0001;
pub(crate) const SOCK_RC: u32 = 0x0010;
pub(crate) const SOCK_RC_MASK: u32 = 0x0030;
pub(crate) const CLOSE: u32 = 0x0100;

/// Receives a session's input. Calls for one session never overlap and
/// arrive in stream order, always on worker threads.
pub trait SessionListener: Send + Sync {
    /// One contiguous span of received bytes, valid only for the call.
    fn on_data_received(&self, data: &[u8]);

    /// Last call for the session.
    fn on_connection_closed(&self);
}

/// Listener that discards everything.
#[derive(Debug, Default)]
pub struct DummyListener;

impl SessionListener for DummyListener {
    fn on_data_received(&self, _data: &[u8]) {}
    fn on_connection_closed(&self) {}
}

/// Read path counters of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Socket reads issued
    pub reads: u64,
    /// Reads delivered by the reading task itself
    pub inline: u64,
    /// Times read interest was left disarmed by backpressure
    pub suspends: u64,
}

/// Outcome of [`Session::send_sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Written to the socket completely
    Sent,
    /// Queued behind other data or partially written
    Queued,
}

enum Payload {
    Owned(Box<[u8]>),
    Shared(Arc<dyn AsRef<[u8]> + Send + Sync>),
}

impl Payload {
    #[inline]
    fn bytes(&self) -> &[u8] {
        match self {
            Payload::Owned(b) => b,
            Payload::Shared(b) => (**b).as_ref(),
        }
    }
}

struct Node {
    next: AtomicPtr<Node>,
    payload: Payload,
    /// Bytes already written, owned by the writer
    sent: AtomicUsize,
}

impl Node {
    fn new(payload: Payload) -> *mut Node {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            payload,
            sent: AtomicUsize::new(0),
        }))
    }

    #[inline]
    fn unsent(&self) -> &[u8] {
        &self.payload.bytes()[self.sent.load(Ordering::Relaxed)..]
    }

    #[inline]
    fn is_consumed(&self) -> bool {
        self.sent.load(Ordering::Relaxed) == self.payload.bytes().len()
    }

    #[inline]
    fn mark_consumed(&self) {
        self.sent.store(self.payload.bytes().len(), Ordering::Relaxed);
    }
}

/// Tail value once the queue is closed (never dereferenced)
const MARKER: usize = 1;

#[inline]
fn close_marker() -> *mut Node {
    MARKER as *mut Node
}

/// # Safety
/// `node` came from `Node::new` and is unreachable from the queue.
#[inline]
unsafe fn free_node(node: *mut Node) {
    // Dropping a shared payload is the release
    drop(Box::from_raw(node));
}

/// Spin until a sender publishes the link behind `node`.
fn wait_next(node: &Node) -> *mut Node {
    let backoff = Backoff::new();
    loop {
        let next = node.next.load(Ordering::Acquire);
        if !next.is_null() {
            return next;
        }
        backoff.snooze();
    }
}

pub(crate) fn state_to_string(state: u32) -> String {
    let mut s = String::from("[");
    if state & CLOSE != 0 {
        s.push_str("CLOSE ");
    }
    match state & STATE_MASK {
        ST_STARTING => s.push_str("STARTING "),
        ST_RUNNING => s.push_str("RUNNING "),
        _ => s.push_str("??? "),
    }
    s.push_str(&format!("RC={}]", (state & SOCK_RC_MASK) / SOCK_RC));
    s
}

/// Phase change on `initialize()`: RUNNING, or drop the read share if a
/// close arrived while starting. Returns `(old, new, started)`.
fn lifecycle_initialize(word: &AtomicU32) -> (u32, u32, bool) {
    let mut state = word.load(Ordering::Acquire);
    loop {
        debug_assert_eq!(state & STATE_MASK, ST_STARTING);
        let (new, started) = if state & CLOSE == 0 {
            ((state & !STATE_MASK) | ST_RUNNING, true)
        } else {
            (state - SOCK_RC, false)
        };
        match word.compare_exchange_weak(state, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return (state, new, started),
            Err(s) => state = s,
        }
    }
}

/// Flag a close requested before `initialize()`. `false` once running.
fn lifecycle_close_starting(word: &AtomicU32) -> bool {
    let mut state = word.load(Ordering::Acquire);
    loop {
        if state & STATE_MASK != ST_STARTING {
            return false;
        }
        match word.compare_exchange_weak(state, state | CLOSE, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(s) => state = s,
        }
    }
}

/// Drop `shares` socket shares, optionally flagging CLOSE. Returns `(old, new)`.
fn lifecycle_release(word: &AtomicU32, shares: u32, close: bool) -> (u32, u32) {
    let mut state = word.load(Ordering::Acquire);
    loop {
        debug_assert!((state & SOCK_RC_MASK) >= shares * SOCK_RC);
        let mut new = state - shares * SOCK_RC;
        if close {
            new |= CLOSE;
        }
        match word.compare_exchange_weak(state, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return (state, new),
            Err(s) => state = s,
        }
    }
}

/// Notification bytes not yet written after a socket overflow.
struct PendingNotify {
    buf: [u8; NOTIFY_SIZE],
    start: usize,
}

impl PendingNotify {
    fn is_empty(&self) -> bool {
        self.start == NOTIFY_SIZE
    }
}

/// Writer of an accelerated session. Owned by the writer task like `head`.
struct ShMemWriter {
    channel: UnsafeCell<Box<dyn ShMemChannelOut>>,
    pending: UnsafeCell<PendingNotify>,
}

// SAFETY: only the thread owning the output queue head touches the cells
unsafe impl Send for ShMemWriter {}
unsafe impl Sync for ShMemWriter {}

pub struct Session {
    collider: Collider,
    weak: Weak<Session>,
    token: Token,
    fd: RawFd,
    /// Taken by the deregistration job once both socket shares are gone
    stream: UnsafeCell<Option<TcpStream>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: AtomicU32,
    /// Owned by whichever thread currently runs the writer
    head: UnsafeCell<*mut Node>,
    tail: AtomicPtr<Node>,
    writer: Arc<Task>,
    write_starter: Arc<Job>,
    shmem_writer: OnceLock<ShMemWriter>,
    batch_max_bytes: usize,
    reader: Reader,
}

// SAFETY: `head` follows queue ownership, `stream` is taken only after the
// read and write paths released it
unsafe impl Send for Session {}
unsafe impl Sync for Session {}

impl Session {
    /// Wrap a connected, non-blocking stream. The session is not registered.
    pub(crate) fn new(collider: &Collider, stream: TcpStream, forward_max: usize) -> Result<Arc<Session>> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let token = collider.alloc_token();
        let fd = stream.as_raw_fd();
        let batch_max_bytes = collider
            .config()
            .output_queue_block_size
            .saturating_mul(WRITE_IOV_MAX);
        let cache = Arc::clone(collider.input_cache());

        Ok(Arc::new_cyclic(|weak: &Weak<Session>| {
            let writer = {
                let weak = weak.clone();
                Task::new(move || {
                    if let Some(s) = weak.upgrade() {
                        s.run_writer();
                    }
                })
            };
            let write_starter = Job::new(move |sel: &mut Selector| {
                sel.add_interest(token, OP_WRITE);
            });
            Session {
                collider: collider.clone(),
                weak: weak.clone(),
                token,
                fd,
                stream: UnsafeCell::new(Some(stream)),
                local_addr,
                remote_addr,
                state: AtomicU32::new(ST_STARTING + 2 * SOCK_RC),
                head: UnsafeCell::new(ptr::null_mut()),
                tail: AtomicPtr::new(ptr::null_mut()),
                writer,
                write_starter,
                shmem_writer: OnceLock::new(),
                batch_max_bytes,
                reader: Reader::new(weak.clone(), cache, forward_max),
            }
        }))
    }

    #[inline]
    pub fn collider(&self) -> &Collider {
        &self.collider
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Buffered input not yet delivered to the listener
    pub fn pending_input(&self) -> usize {
        self.reader.pending()
    }

    pub fn read_stats(&self) -> ReadStats {
        self.reader.stats()
    }

    /// Socket still open (both paths have not released it yet)
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) & SOCK_RC_MASK != 0
    }

    /// Install the listener and start reading.
    ///
    /// If `close_connection()` was called in between, the listener gets
    /// `on_connection_closed` right away instead.
    pub(crate) fn initialize(&self, listener: Arc<dyn SessionListener>) {
        self.reader.set_listener(listener);
        let (old, new, started) = lifecycle_initialize(&self.state);
        ktrace!(
            "{}: {} -> {}",
            self.remote_addr,
            state_to_string(old),
            state_to_string(new)
        );
        if started {
            self.reader.start(self);
        } else {
            self.reader.notify_closed(self);
            if new & SOCK_RC_MASK == 0 {
                self.deregister();
            }
        }
    }

    /// Swap the listener, returns the previous one. May be called from a
    /// callback; the next callback goes to `listener`.
    pub fn replace_listener(&self, listener: Arc<dyn SessionListener>) -> Arc<dyn SessionListener> {
        self.reader.replace_listener(listener)
    }

    // ------------------------------------------------------------------
    // Output queue
    // ------------------------------------------------------------------

    #[inline]
    unsafe fn head(&self) -> *mut Node {
        *self.head.get()
    }

    #[inline]
    unsafe fn set_head(&self, node: *mut Node) {
        *self.head.get() = node;
    }

    /// Append a node. `Ok(true)` if it became the head.
    fn enqueue(&self, node: *mut Node) -> Result<bool> {
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            if tail == close_marker() {
                // SAFETY: never published
                unsafe { free_node(node) };
                return Err(ColliderError::SessionClosed);
            }
            match self
                .tail
                .compare_exchange_weak(tail, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(t) => tail = t,
            }
        }
        if tail.is_null() {
            // SAFETY: an empty queue has no writer, the head is ours
            unsafe { self.set_head(node) };
            Ok(true)
        } else {
            // SAFETY: `tail` stays queued until its link is published
            unsafe { (*tail).next.store(node, Ordering::Release) };
            Ok(false)
        }
    }

    /// Park the close marker. Returns the previous tail, `None` if the
    /// queue was closed already.
    fn seal_queue(&self) -> Option<*mut Node> {
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            if tail == close_marker() {
                return None;
            }
            match self.tail.compare_exchange_weak(
                tail,
                close_marker(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(t) => tail = t,
            }
        }
        if !tail.is_null() {
            // SAFETY: as in `enqueue`
            unsafe { (*tail).next.store(close_marker(), Ordering::Release) };
        }
        Some(tail)
    }

    fn send_payload(&self, payload: Payload) -> Result<()> {
        if payload.bytes().is_empty() {
            if self.tail.load(Ordering::Acquire) == close_marker() {
                return Err(ColliderError::SessionClosed);
            }
            return Ok(());
        }
        if self.enqueue(Node::new(payload))? {
            self.schedule_writer();
        }
        Ok(())
    }

    /// Queue owned bytes for sending.
    pub fn send<B: Into<Box<[u8]>>>(&self, data: B) -> Result<()> {
        self.send_payload(Payload::Owned(data.into()))
    }

    /// Queue a shared buffer. The session keeps a clone until the bytes
    /// are written or discarded.
    pub fn send_shared<T>(&self, data: &Arc<T>) -> Result<()>
    where
        T: AsRef<[u8]> + Send + Sync + 'static,
    {
        let shared: Arc<dyn AsRef<[u8]> + Send + Sync> = data.clone();
        self.send_payload(Payload::Shared(shared))
    }

    /// Write on the calling thread if nothing else is queued, queue otherwise.
    pub fn send_sync<B: Into<Box<[u8]>>>(&self, data: B) -> Result<SendStatus> {
        let payload = Payload::Owned(data.into());
        if payload.bytes().is_empty() {
            self.send_payload(payload)?;
            return Ok(SendStatus::Sent);
        }
        let node = Node::new(payload);
        if !self.enqueue(node)? {
            return Ok(SendStatus::Queued);
        }

        // SAFETY: this thread owns the head until it hands it on
        let n = unsafe { &*node };
        match write_retrying(|| self.with_stream(|mut s| s.write(n.unsent()))) {
            Ok(written) => {
                if written < n.payload.bytes().len() {
                    n.sent.store(written, Ordering::Relaxed);
                    self.arm_write();
                    Ok(SendStatus::Queued)
                } else {
                    unsafe { self.remove_node(node) };
                    Ok(SendStatus::Sent)
                }
            }
            Err(e) => {
                kwarn!("{}: send_sync: {}", self.remote_addr, e);
                unsafe { self.close_and_cleanup_queue() };
                self.release_socket("send_sync");
                Err(ColliderError::Io(e))
            }
        }
    }

    /// Close the session. Queued output is flushed before the socket is
    /// released; buffered input is still delivered.
    pub fn close_connection(&self) -> Result<()> {
        let tail = self.seal_queue().ok_or(ColliderError::SessionClosed)?;
        if !lifecycle_close_starting(&self.state) {
            self.reader.stop(self);
        }
        if tail.is_null() {
            self.release_socket("close_connection");
        }
        Ok(())
    }

    /// Hand outbound data over to shared memory.
    ///
    /// `reply` is written synchronously to the socket first. Must not race
    /// other sends: fails with `SessionBusy` if data is queued.
    pub fn accelerate(&self, mut shmem: ShMem, reply: Option<&[u8]>) -> Result<()> {
        if self.shmem_writer.get().is_some() {
            shmem.close();
            return Err(ColliderError::AlreadyRegistered);
        }
        let node = Node::new(Payload::Owned(Box::default()));
        let tail = self.tail.load(Ordering::Acquire);
        if tail == close_marker() {
            unsafe { free_node(node) };
            shmem.close();
            return Err(ColliderError::SessionClosed);
        }
        if !tail.is_null()
            || self
                .tail
                .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            unsafe { free_node(node) };
            shmem.close();
            return Err(ColliderError::SessionBusy);
        }
        unsafe { self.set_head(node) };

        if let Some(mut reply) = reply {
            let backoff = Backoff::new();
            while !reply.is_empty() {
                match self.with_stream(|mut s| s.write(reply)) {
                    Ok(n) => reply = &reply[n..],
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if backoff.is_completed() {
                            std::thread::sleep(Duration::from_millis(1));
                        } else {
                            backoff.snooze();
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        kwarn!("{}: accelerate: {}", self.remote_addr, e);
                        shmem.close();
                        unsafe { self.close_and_cleanup_queue() };
                        self.release_socket("accelerate");
                        return Err(ColliderError::Io(e));
                    }
                }
            }
        }

        let ShMem { outbound, inbound } = shmem;
        self.reader.accelerate(inbound);
        let _ = self.shmem_writer.set(ShMemWriter {
            channel: UnsafeCell::new(outbound),
            pending: UnsafeCell::new(PendingNotify { buf: [0; NOTIFY_SIZE], start: NOTIFY_SIZE }),
        });
        unsafe { self.remove_node(node) };
        Ok(())
    }

    fn run_writer(&self) {
        match self.shmem_writer.get() {
            Some(w) => unsafe { self.write_shmem(w) },
            None => unsafe { self.write_socket() },
        }
    }

    /// Gather up to `WRITE_IOV_MAX` buffers into one vectored write.
    ///
    /// # Safety
    /// Writer task only.
    unsafe fn write_socket(&self) {
        let head = self.head();
        debug_assert!(!head.is_null() && head != close_marker());

        let mut nodes: [*mut Node; WRITE_IOV_MAX] = [ptr::null_mut(); WRITE_IOV_MAX];
        let mut count = 0;
        let mut bytes = 0;
        let mut node = head;
        loop {
            nodes[count] = node;
            count += 1;
            bytes += (*node).unsent().len();
            if count == WRITE_IOV_MAX || bytes >= self.batch_max_bytes {
                break;
            }
            let next = (*node).next.load(Ordering::Acquire);
            if next.is_null() || next == close_marker() {
                break;
            }
            node = next;
        }

        let written = {
            let iov: Vec<IoSlice<'_>> = nodes[..count]
                .iter()
                .map(|&n| IoSlice::new((*n).unsent()))
                .collect();
            write_retrying(|| self.with_stream(|mut s| s.write_vectored(&iov)))
        };
        let mut left = match written {
            Ok(0) => {
                self.arm_write();
                return;
            }
            Ok(n) => n,
            Err(e) => {
                kwarn!("{}: {}", self.remote_addr, e);
                self.close_and_cleanup_queue();
                self.release_socket("writer");
                return;
            }
        };

        for (i, &n) in nodes[..count].iter().enumerate() {
            let unsent = (*n).unsent().len();
            if left < unsent {
                // Partial write, resume from this node
                (*n).sent.fetch_add(left, Ordering::Relaxed);
                self.set_head(n);
                self.schedule_writer();
                return;
            }
            left -= unsent;
            if i + 1 < count {
                free_node(n);
            } else {
                self.remove_node(n);
            }
        }
    }

    /// Copy queued data into shared memory and announce it on the socket.
    ///
    /// # Safety
    /// Writer task only.
    unsafe fn write_shmem(&self, writer: &ShMemWriter) {
        let pending = &mut *writer.pending.get();
        let channel = &mut *writer.channel.get();

        if !pending.is_empty() {
            match self.flush_notify(pending) {
                Ok(true) => {}
                Ok(false) => {
                    self.arm_write();
                    return;
                }
                Err(e) => {
                    kwarn!("{}: {}", self.remote_addr, e);
                    self.close_and_cleanup_queue();
                    self.release_socket("shmem writer");
                    return;
                }
            }
        }

        let mut node = self.head();
        debug_assert!(!node.is_null() && node != close_marker());
        if (*node).is_consumed() {
            // Placeholder left behind by an overflow
            self.remove_node(node);
            return;
        }

        let mut msgs = 1usize;
        let mut total = 0usize;
        loop {
            let mut batch = 0usize;
            let mut count = 0usize;
            let mut last = false;
            loop {
                let n = &*node;
                match channel.add_data(n.unsent()) {
                    Ok(len) => {
                        batch += len;
                        total += len;
                    }
                    Err(e) => {
                        kwarn!("{}: shared memory: {}", self.remote_addr, e);
                        self.set_head(node);
                        self.close_and_cleanup_queue();
                        self.reader.stop(self);
                        self.release_socket("shmem writer");
                        return;
                    }
                }
                n.mark_consumed();
                count += 1;
                if count == msgs || total >= BATCH_MAX_BYTES {
                    break;
                }
                let next = n.next.load(Ordering::Acquire);
                if next.is_null() || next == close_marker() {
                    last = true;
                    break;
                }
                free_node(node);
                node = next;
            }

            pending.buf = (batch as u32).to_be_bytes();
            pending.start = 0;
            match self.flush_notify(pending) {
                Ok(true) => {}
                Ok(false) => {
                    // Keep the consumed node as head so senders do not
                    // restart the writer before the socket drains
                    self.set_head(node);
                    self.arm_write();
                    return;
                }
                Err(e) => {
                    kwarn!("{}: {}", self.remote_addr, e);
                    self.set_head(node);
                    self.close_and_cleanup_queue();
                    self.release_socket("shmem writer");
                    return;
                }
            }

            if last || total >= BATCH_MAX_BYTES {
                break;
            }
            let next = (*node).next.load(Ordering::Acquire);
            if next.is_null() || next == close_marker() {
                break;
            }
            free_node(node);
            node = next;
            msgs = msgs.saturating_mul(2);
        }
        self.remove_node(node);
    }

    /// `Ok(true)` once the notification is fully written.
    fn flush_notify(&self, pending: &mut PendingNotify) -> io::Result<bool> {
        while !pending.is_empty() {
            match write_retrying(|| self.with_stream(|mut s| s.write(&pending.buf[pending.start..]))) {
                Ok(0) => return Ok(false),
                Ok(n) => pending.start += n,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Unlink a fully written node and hand the queue on.
    ///
    /// # Safety
    /// `node` is the head owned by the caller.
    unsafe fn remove_node(&self, node: *mut Node) {
        let mut next = (*node).next.load(Ordering::Acquire);
        if next.is_null() {
            self.set_head(ptr::null_mut());
            if self
                .tail
                .compare_exchange(node, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                free_node(node);
                return;
            }
            next = wait_next(&*node);
        }
        self.set_head(next);
        free_node(node);
        if next == close_marker() {
            self.release_socket("remove_node");
        } else {
            self.schedule_writer();
        }
    }

    /// Seal the queue and free every node from the head on.
    ///
    /// # Safety
    /// Writer only, with a non-empty queue.
    unsafe fn close_and_cleanup_queue(&self) {
        self.seal_queue();
        let mut node = self.head();
        while !node.is_null() && node != close_marker() {
            let next = wait_next(&*node);
            free_node(node);
            node = next;
        }
        self.set_head(close_marker());
    }

    fn schedule_writer(&self) {
        if let Err(e) = self.collider.execute_in_thread_pool(&self.writer) {
            kdebug!("{}: writer not scheduled ({})", self.remote_addr, e);
        }
    }

    fn arm_write(&self) {
        self.execute_job(&self.write_starter, "arm write");
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// The peer closed or the read failed: refuse further output and drop
    /// the read share (and the write share if nothing was queued).
    pub(crate) fn handle_reader_stopped(&self) {
        let sealed_empty = matches!(self.seal_queue(), Some(t) if t.is_null());
        let shares = if sealed_empty { 2 } else { 1 };
        let (old, new) = lifecycle_release(&self.state, shares, true);
        ktrace!(
            "{}: reader stopped {} -> {}",
            self.remote_addr,
            state_to_string(old),
            state_to_string(new)
        );
        if new & SOCK_RC_MASK == 0 {
            self.deregister();
        }
    }

    pub(crate) fn release_socket(&self, hint: &str) {
        let (old, new) = lifecycle_release(&self.state, 1, false);
        ktrace!(
            "{}: {} {} -> {}",
            self.remote_addr,
            hint,
            state_to_string(old),
            state_to_string(new)
        );
        if new & SOCK_RC_MASK == 0 {
            self.deregister();
        }
    }

    fn deregister(&self) {
        let Some(me) = self.weak.upgrade() else {
            return;
        };
        let job = Job::new(move |sel: &mut Selector| {
            sel.deregister(me.token);
            me.close_stream();
        });
        if let Err(e) = self.collider.execute_in_selector_thread(&job) {
            // Reactor is gone together with its registrations
            kdebug!("{}: closing without reactor ({})", self.remote_addr, e);
            self.close_stream();
        }
    }

    fn close_stream(&self) {
        // SAFETY: both socket shares are released, no task touches the stream
        let stream = unsafe { (*self.stream.get()).take() };
        if stream.is_some() {
            ktrace!("{}: socket closed", self.remote_addr);
        }
    }

    fn with_stream<T>(&self, f: impl FnOnce(&TcpStream) -> io::Result<T>) -> io::Result<T> {
        // SAFETY: the caller holds a socket share
        match unsafe { (*self.stream.get()).as_ref() } {
            Some(stream) => f(stream),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    pub(crate) fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.with_stream(|mut s| s.read_vectored(bufs))
    }

    pub(crate) fn execute_job(&self, job: &Arc<Job>, what: &str) {
        match self.collider.execute_in_selector_thread(job) {
            Ok(()) => {}
            Err(ColliderError::TaskAlreadyQueued) => {
                kdebug!("{}: {} already queued", self.remote_addr, what);
            }
            Err(e) => kdebug!("{}: {} not queued ({})", self.remote_addr, what, e),
        }
    }

    pub(crate) fn execute_job_no_wakeup(&self, job: &Arc<Job>, what: &str) {
        match self.collider.execute_in_selector_thread_no_wakeup(job) {
            Ok(()) => {}
            Err(ColliderError::TaskAlreadyQueued) => {
                kdebug!("{}: {} already queued", self.remote_addr, what);
            }
            Err(e) => kdebug!("{}: {} not queued ({})", self.remote_addr, what, e),
        }
    }
}

impl ChannelHandler for Session {
    fn handle_ready_ops(&self, ready: u32, pool: &ThreadPool) {
        if ready & OP_READ != 0 {
            if let Err(e) = pool.execute(self.reader.task()) {
                kdebug!("{}: read task not run ({})", self.remote_addr, e);
            }
        }
        if ready & OP_WRITE != 0 {
            if let Err(e) = pool.execute(&self.writer) {
                kdebug!("{}: write task not run ({})", self.remote_addr, e);
            }
        }
    }

    fn force_close(&self) {
        let _ = self.close_connection();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        // Anything still linked was never written
        while !node.is_null() && node != close_marker() {
            // SAFETY: no other reference to the session exists
            unsafe {
                let next = (*node).next.load(Ordering::Acquire);
                free_node(node);
                node = next;
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("local", &self.local_addr)
            .field("remote", &self.remote_addr)
            .field("state", &state_to_string(self.state.load(Ordering::Relaxed)))
            .field("reader", &reader::state_to_string(self.reader.state()))
            .finish()
    }
}

/// Run a write, retrying on EINTR and mapping `WouldBlock` to 0 bytes.
fn write_retrying(mut f: impl FnMut() -> io::Result<usize>) -> io::Result<usize> {
    loop {
        match f() {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e),
        }
    }
}
