//! Socket setup shared by acceptors and connectors.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use collider_core::{ColliderConfig, ColliderError, Result};
use nix::sys::socket::{setsockopt, sockopt, SockaddrLike, SockaddrStorage};

const LISTEN_BACKLOG: i32 = 4096;

/// Per emitter socket options. Zero sizes fall back to the engine config.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub reuse_addr: bool,
    pub tcp_no_delay: bool,
    /// SO_SNDBUF, 0 = config / system default
    pub send_buf_size: usize,
    /// SO_RCVBUF, 0 = config / system default
    pub recv_buf_size: usize,
    /// Read backpressure threshold, 0 = config
    pub forward_read_max_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            tcp_no_delay: true,
            send_buf_size: 0,
            recv_buf_size: 0,
            forward_read_max_size: 0,
        }
    }
}

impl SocketOptions {
    pub fn tcp_no_delay(mut self, enable: bool) -> Self {
        self.tcp_no_delay = enable;
        self
    }

    pub fn reuse_addr(mut self, enable: bool) -> Self {
        self.reuse_addr = enable;
        self
    }

    pub fn send_buf_size(mut self, size: usize) -> Self {
        self.send_buf_size = size;
        self
    }

    pub fn recv_buf_size(mut self, size: usize) -> Self {
        self.recv_buf_size = size;
        self
    }

    pub fn forward_read_max_size(mut self, size: usize) -> Self {
        self.forward_read_max_size = size;
        self
    }

    /// Options with zero fields filled from `config`.
    pub fn resolve(&self, config: &ColliderConfig) -> SocketOptions {
        let pick = |own: usize, cfg: usize| if own > 0 { own } else { cfg };
        SocketOptions {
            reuse_addr: self.reuse_addr,
            tcp_no_delay: self.tcp_no_delay,
            send_buf_size: pick(self.send_buf_size, config.socket_send_buf_size),
            recv_buf_size: pick(self.recv_buf_size, config.socket_recv_buf_size),
            forward_read_max_size: pick(self.forward_read_max_size, config.forward_read_max_size),
        }
    }
}

/// Create, bind and listen. The listener is non-blocking.
pub(crate) fn bind_listener(addr: SocketAddr, opts: &SocketOptions) -> Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(ColliderError::last_os_error());
    }
    // SAFETY: freshly created, owned from here on
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let raw = fd.as_raw_fd();

    if opts.reuse_addr {
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    }
    if opts.recv_buf_size > 0 {
        // Accepted sockets inherit it, must be set before listen()
        setsockopt(&fd, sockopt::RcvBuf, &opts.recv_buf_size)?;
    }

    let sa = SockaddrStorage::from(addr);
    if unsafe { libc::bind(raw, sa.as_ptr(), sa.len()) } != 0 {
        return Err(ColliderError::last_os_error());
    }
    if unsafe { libc::listen(raw, LISTEN_BACKLOG) } != 0 {
        return Err(ColliderError::last_os_error());
    }

    let listener = TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Apply `opts` to a connected stream and make it non-blocking.
pub(crate) fn configure_stream(stream: &TcpStream, opts: &SocketOptions) -> Result<()> {
    if opts.tcp_no_delay {
        setsockopt(stream, sockopt::TcpNoDelay, &true)?;
    }
    if opts.send_buf_size > 0 {
        setsockopt(stream, sockopt::SndBuf, &opts.send_buf_size)?;
    }
    if opts.recv_buf_size > 0 {
        setsockopt(stream, sockopt::RcvBuf, &opts.recv_buf_size)?;
    }
    stream.set_nonblocking(true)?;
    Ok(())
}
