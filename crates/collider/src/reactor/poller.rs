//! Linux `epoll` readiness poller.
//!
//! Channel registrations are one-shot: once an event is reported the
//! descriptor stays silent until its interest is modified again. The reactor
//! clears the reported bits from a key's interest before dispatching, so this
//! matches the interest bookkeeping exactly and a hung-up socket with no
//! interest cannot make the wait spin.
//!
//! The waker eventfd is the only level-triggered registration.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use collider_core::{ColliderError, Result};
use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT,
    EPOLLOUT, EPOLLRDHUP, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

use super::{OP_READ, OP_WRITE};

/// Maximum events fetched per wait
const EVENTS_CAPACITY: usize = 256;

pub(crate) struct Poller {
    epoll: RawFd,
    events: Vec<epoll_event>,
    ready: usize,
}

// The epoll fd is only driven by the reactor thread
unsafe impl Send for Poller {}

fn interest_flags(ops: u32) -> u32 {
    let mut flags = EPOLLONESHOT as u32;
    if ops & OP_READ != 0 {
        flags |= (EPOLLIN | EPOLLRDHUP) as u32;
    }
    if ops & OP_WRITE != 0 {
        flags |= EPOLLOUT as u32;
    }
    flags
}

/// Translate epoll event bits into channel ops. Errors and hang-ups make
/// both directions ready so whichever side is armed observes them.
fn ready_ops(events: u32) -> u32 {
    let mut ops = 0;
    if events & (EPOLLIN | EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
        ops |= OP_READ;
    }
    if events & (EPOLLOUT | EPOLLHUP | EPOLLERR) as u32 != 0 {
        ops |= OP_WRITE;
    }
    ops
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(ColliderError::last_os_error());
        }
        let events = vec![epoll_event { events: 0, u64: 0 }; EVENTS_CAPACITY];
        Ok(Self { epoll, events, ready: 0 })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, flags: u32, token: u64) -> Result<()> {
        let mut event = epoll_event { events: flags, u64: token };
        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            return Err(ColliderError::last_os_error());
        }
        Ok(())
    }

    /// Register a persistent level-triggered read source (the waker).
    pub(crate) fn add_waker(&self, fd: RawFd, token: u64) -> Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, EPOLLIN as u32, token)
    }

    pub(crate) fn add(&self, fd: RawFd, token: u64, ops: u32) -> Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, interest_flags(ops), token)
    }

    pub(crate) fn modify(&self, fd: RawFd, token: u64, ops: u32) -> Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest_flags(ops), token)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(ColliderError::last_os_error());
        }
        Ok(())
    }

    /// Block until readiness or timeout (`None` waits forever).
    ///
    /// Returns the number of events, an interrupted wait reports 0.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                self.ready = 0;
                return Ok(0);
            }
            return Err(ColliderError::Io(err));
        }
        self.ready = n as usize;
        Ok(self.ready)
    }

    /// Token and ready ops of the i-th event from the last wait.
    pub(crate) fn event(&self, i: usize) -> (u64, u32) {
        debug_assert!(i < self.ready);
        let ev = self.events[i];
        (ev.u64, ready_ops(ev.events))
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll); }
    }
}
