//! `Waker`: eventfd that interrupts the reactor's epoll wait.
//!
//! Coalescing: any number of `wake()` calls before the reactor drains the
//! counter produce one readiness event (eventfd counter semantics).

use collider_core::{ColliderError, Result};

use std::os::unix::io::RawFd;

pub(crate) struct Waker {
    fd: RawFd,
}

impl Waker {
    /// Create a new non-blocking eventfd. The waker closes it on drop.
    pub(crate) fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(ColliderError::last_os_error());
        }
        Ok(Self { fd })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn wake(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // EAGAIN: counter saturated, a wake-up is already pending
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(());
            }
            return Err(ColliderError::Io(err));
        }
        Ok(())
    }

    /// Reset the counter after the reactor observed the event.
    pub(crate) fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd); }
            self.fd = -1;
        }
    }
}
