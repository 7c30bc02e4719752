//! Outgoing connections.
//!
//! A connector is one attempt: it connects in the worker pool, registers the
//! session the same way the acceptor does, then leaves the emitter registry.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex, Weak};

use collider_core::{kdebug, ColliderError};

use crate::acceptor::register_session;
use crate::reactor::{emitter_key, Collider, SessionEmitter};
use crate::session::{Session, SessionListener};
use crate::socket::{self, SocketOptions};
use crate::thread_pool::Task;

/// Client side session factory.
pub trait Connector: Send + Sync {
    fn addr(&self) -> SocketAddr;

    fn socket_options(&self) -> SocketOptions {
        SocketOptions::default()
    }

    /// Listener for the connected session. Runs in the worker pool.
    fn create_session_listener(&self, session: &Arc<Session>) -> Arc<dyn SessionListener>;

    /// The attempt failed or the connector could not be registered.
    fn on_connection_failed(&self, msg: &str);
}

struct ConnectorImpl {
    weak: Weak<ConnectorImpl>,
    collider: Collider,
    connector: Arc<dyn Connector>,
    opts: SocketOptions,
    done: Mutex<bool>,
    done_cv: Condvar,
}

pub(crate) fn start(collider: &Collider, connector: Arc<dyn Connector>) {
    let opts = connector.socket_options().resolve(collider.config());
    let imp = Arc::new_cyclic(|weak: &Weak<ConnectorImpl>| ConnectorImpl {
        weak: weak.clone(),
        collider: collider.clone(),
        connector: Arc::clone(&connector),
        opts,
        done: Mutex::new(false),
        done_cv: Condvar::new(),
    });

    let key = emitter_key(&connector);
    if let Err(e) = collider.register_emitter(key, Arc::clone(&imp) as Arc<dyn SessionEmitter>) {
        let msg = match e {
            ColliderError::AlreadyRegistered => "connector already registered".to_string(),
            e => e.to_string(),
        };
        connector.on_connection_failed(&msg);
        return;
    }

    let task = {
        let weak = imp.weak.clone();
        Task::new(move || {
            if let Some(imp) = weak.upgrade() {
                imp.connect();
            }
        })
    };
    if let Err(e) = collider.execute_in_thread_pool(&task) {
        collider.unregister_emitter(key);
        imp.finish();
        connector.on_connection_failed(&e.to_string());
    }
}

impl ConnectorImpl {
    fn connect(&self) {
        let addr = self.connector.addr();
        let result = TcpStream::connect(addr)
            .map_err(ColliderError::from)
            .and_then(|stream| socket::configure_stream(&stream, &self.opts).map(|()| stream));

        let key = emitter_key(&self.connector);
        // `None` means the connector was removed while connecting
        let registered = self.collider.unregister_emitter(key).is_some();
        match result {
            Ok(stream) if registered => {
                kdebug!("connector: connected to {}", addr);
                let connector = Arc::clone(&self.connector);
                register_session(&self.collider, stream, self.opts.forward_read_max_size, move |s| {
                    connector.create_session_listener(s)
                });
            }
            Ok(_) => kdebug!("connector: {} removed while connecting", addr),
            Err(e) => {
                kdebug!("connector: {}: {}", addr, e);
                self.connector.on_connection_failed(&e.to_string());
            }
        }
        self.finish();
    }

    fn finish(&self) {
        *self.done.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.done_cv.notify_all();
    }
}

impl SessionEmitter for ConnectorImpl {
    /// Waits for an attempt in flight.
    fn stop(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.done_cv.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }
}
