//! Listening sockets.
//!
//! The listener is registered on the reactor thread with read interest.
//! Readiness runs the accept task in the worker pool, which accepts until
//! `WouldBlock`, hands every connection to [`register_session`] and re-arms
//! read interest.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Condvar, Mutex, Weak};

use collider_core::{kdebug, kinfo, kwarn, ColliderError};

use crate::reactor::{emitter_key, ChannelHandler, Collider, Job, Selector, SessionEmitter, Token, OP_READ};
use crate::session::{Session, SessionListener};
use crate::socket::{self, SocketOptions};
use crate::thread_pool::{Task, ThreadPool};

/// Server side session factory.
pub trait Acceptor: Send + Sync {
    fn addr(&self) -> SocketAddr;

    fn socket_options(&self) -> SocketOptions {
        SocketOptions::default()
    }

    /// The listener is registered. `port` is the bound port.
    fn on_acceptor_started(&self, _collider: &Collider, _port: u16) {}

    /// Binding or registration failed, the acceptor is not registered.
    fn on_acceptor_starting_failure(&self, msg: &str);

    /// Listener for a freshly accepted connection. Runs in the worker pool.
    fn create_session_listener(&self, session: &Arc<Session>) -> Arc<dyn SessionListener>;
}

struct AcceptorImpl {
    weak: Weak<AcceptorImpl>,
    collider: Collider,
    acceptor: Arc<dyn Acceptor>,
    opts: SocketOptions,
    token: Token,
    port: u16,
    /// `None` once stopped
    listener: Mutex<Option<TcpListener>>,
    accept_task: Arc<Task>,
    rearm: Arc<Job>,
    closed: Mutex<bool>,
    closed_cv: Condvar,
}

pub(crate) fn start(collider: &Collider, acceptor: Arc<dyn Acceptor>) {
    let opts = acceptor.socket_options().resolve(collider.config());
    let listener = match socket::bind_listener(acceptor.addr(), &opts) {
        Ok(l) => l,
        Err(e) => {
            acceptor.on_acceptor_starting_failure(&e.to_string());
            return;
        }
    };
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            acceptor.on_acceptor_starting_failure(&e.to_string());
            return;
        }
    };

    let token = collider.alloc_token();
    let fd = listener.as_raw_fd();
    let imp = Arc::new_cyclic(|weak: &Weak<AcceptorImpl>| {
        let accept_task = {
            let weak = weak.clone();
            Task::new(move || {
                if let Some(imp) = weak.upgrade() {
                    imp.accept_all();
                }
            })
        };
        AcceptorImpl {
            weak: weak.clone(),
            collider: collider.clone(),
            acceptor: Arc::clone(&acceptor),
            opts,
            token,
            port,
            listener: Mutex::new(Some(listener)),
            accept_task,
            rearm: Job::new(move |sel: &mut Selector| {
                sel.add_interest(token, OP_READ);
            }),
            closed: Mutex::new(false),
            closed_cv: Condvar::new(),
        }
    });

    let key = emitter_key(&acceptor);
    if let Err(e) = collider.register_emitter(key, Arc::clone(&imp) as Arc<dyn SessionEmitter>) {
        let msg = match e {
            ColliderError::AlreadyRegistered => "acceptor already registered".to_string(),
            e => e.to_string(),
        };
        acceptor.on_acceptor_starting_failure(&msg);
        return;
    }

    let job = {
        let imp = Arc::clone(&imp);
        Job::new(move |sel: &mut Selector| {
            let handler = Arc::clone(&imp) as Arc<dyn ChannelHandler>;
            match sel.register(fd, imp.token, OP_READ, handler) {
                Ok(()) => {
                    kinfo!("acceptor: listening on {}", imp.port);
                    imp.acceptor.on_acceptor_started(&imp.collider, imp.port);
                }
                Err(e) => {
                    imp.collider.unregister_emitter(emitter_key(&imp.acceptor));
                    imp.close_listener();
                    imp.acceptor.on_acceptor_starting_failure(&e.to_string());
                }
            }
        })
    };
    if let Err(e) = collider.execute_in_selector_thread(&job) {
        collider.unregister_emitter(key);
        imp.close_listener();
        acceptor.on_acceptor_starting_failure(&e.to_string());
    }
}

impl AcceptorImpl {
    fn accept_all(&self) {
        {
            let guard = self.listener.lock().unwrap_or_else(|e| e.into_inner());
            let Some(listener) = guard.as_ref() else {
                return;
            };
            loop {
                match listener.accept() {
                    Ok((stream, _)) => self.on_accepted(stream),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EMFILE and friends, try again on the next readiness
                        kwarn!("acceptor {}: accept: {}", self.port, e);
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.collider.execute_in_selector_thread(&self.rearm) {
            kdebug!("acceptor {}: not re-armed ({})", self.port, e);
        }
    }

    fn on_accepted(&self, stream: TcpStream) {
        if let Err(e) = socket::configure_stream(&stream, &self.opts) {
            kwarn!("acceptor {}: {}", self.port, e);
            return;
        }
        let acceptor = Arc::clone(&self.acceptor);
        register_session(&self.collider, stream, self.opts.forward_read_max_size, move |s| {
            acceptor.create_session_listener(s)
        });
    }

    fn close_listener(&self) {
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(listener);
        *self.closed.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.closed_cv.notify_all();
    }
}

impl ChannelHandler for AcceptorImpl {
    fn handle_ready_ops(&self, _ready: u32, pool: &ThreadPool) {
        if let Err(e) = pool.execute(&self.accept_task) {
            kdebug!("acceptor {}: accept task not run ({})", self.port, e);
        }
    }
}

impl SessionEmitter for AcceptorImpl {
    /// Must not run on the reactor thread.
    fn stop(&self) {
        let Some(me) = self.weak.upgrade() else {
            self.close_listener();
            return;
        };
        let job = Job::new(move |sel: &mut Selector| {
            sel.deregister(me.token);
            me.close_listener();
        });
        if self.collider.execute_in_selector_thread(&job).is_err() {
            self.close_listener();
            return;
        }
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        while !*closed {
            closed = self.closed_cv.wait(closed).unwrap_or_else(|e| e.into_inner());
        }
        kdebug!("acceptor {}: stopped", self.port);
    }
}

/// Wrap `stream` in a session, register it on the reactor thread and
/// initialize it with the listener from `make_listener` in the worker pool.
pub(crate) fn register_session<F>(collider: &Collider, stream: TcpStream, forward_max: usize, make_listener: F)
where
    F: FnOnce(&Arc<Session>) -> Arc<dyn SessionListener> + Send + 'static,
{
    let session = match Session::new(collider, stream, forward_max) {
        Ok(s) => s,
        Err(e) => {
            kwarn!("session setup failed: {}", e);
            return;
        }
    };

    let make_listener = Mutex::new(Some(make_listener));
    let job = Job::new(move |sel: &mut Selector| {
        if sel.is_stopping() {
            kdebug!("{}: dropped, collider stopping", session.remote_addr());
            return;
        }
        let handler = Arc::clone(&session) as Arc<dyn ChannelHandler>;
        if let Err(e) = sel.register(session.fd(), session.token(), 0, handler) {
            kwarn!("{}: register failed: {}", session.remote_addr(), e);
            return;
        }
        let Some(make_listener) = make_listener.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let init = {
            let session = Arc::clone(&session);
            let make_listener = Mutex::new(Some(make_listener));
            Task::new(move || {
                if let Some(f) = make_listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let listener = f(&session);
                    session.initialize(listener);
                }
            })
        };
        if let Err(e) = session.collider().execute_in_thread_pool(&init) {
            kdebug!("{}: not initialized ({})", session.remote_addr(), e);
            sel.deregister(session.token());
        }
    });
    if let Err(e) = collider.execute_in_selector_thread(&job) {
        kdebug!("session not registered ({})", e);
    }
}
