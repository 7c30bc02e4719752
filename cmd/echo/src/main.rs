//! Collider Echo Server
//!
//! Echoes every byte back on the session it arrived on. Sessions are
//! counted and the running totals printed on exit.
//!
//! Usage:
//!     cargo build --release -p collider-echo
//!     ./target/release/collider-echo [port]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!
//! # Environment Variables
//!
//! - `COLLIDER_LOG_LEVEL=debug` - log level (off, error, warn, info, debug, trace)
//! - `COLLIDER_THREAD_POOL_THREADS=8` - worker count, see `ColliderConfig::from_env`

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use collider::{Acceptor, Collider, ColliderConfig, Session, SessionListener};
use collider_core::{kerror, kinfo};

#[derive(Default)]
struct Stats {
    sessions: AtomicU64,
    bytes: AtomicU64,
}

struct EchoListener {
    session: Arc<Session>,
    stats: Arc<Stats>,
}

impl SessionListener for EchoListener {
    fn on_data_received(&self, data: &[u8]) {
        self.stats.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        if self.session.send(data).is_err() {
            let _ = self.session.close_connection();
        }
    }

    fn on_connection_closed(&self) {
        kinfo!("{}: closed", self.session.remote_addr());
    }
}

struct EchoAcceptor {
    addr: SocketAddr,
    stats: Arc<Stats>,
}

impl Acceptor for EchoAcceptor {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn on_acceptor_started(&self, _collider: &Collider, port: u16) {
        println!("Listening on port {}", port);
    }

    fn on_acceptor_starting_failure(&self, msg: &str) {
        kerror!("cannot listen on {}: {}", self.addr, msg);
        std::process::exit(1);
    }

    fn create_session_listener(&self, session: &Arc<Session>) -> Arc<dyn SessionListener> {
        self.stats.sessions.fetch_add(1, Ordering::Relaxed);
        kinfo!("{}: connected", session.remote_addr());
        Arc::new(EchoListener { session: Arc::clone(session), stats: Arc::clone(&self.stats) })
    }
}

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(9999);

    let config = ColliderConfig::from_env();
    config.print();
    let collider = match Collider::new(config) {
        Ok(c) => c,
        Err(e) => {
            kerror!("collider: {}", e);
            std::process::exit(1);
        }
    };

    let stats = Arc::new(Stats::default());
    collider.add_acceptor(Arc::new(EchoAcceptor {
        addr: SocketAddr::from(([0, 0, 0, 0], port)),
        stats: Arc::clone(&stats),
    }));

    if let Err(e) = collider.run() {
        kerror!("collider: {}", e);
        std::process::exit(1);
    }
    println!(
        "sessions: {}, bytes echoed: {}",
        stats.sessions.load(Ordering::Relaxed),
        stats.bytes.load(Ordering::Relaxed)
    );
}
