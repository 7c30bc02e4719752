//! Receive throughput benchmark
//!
//! Starts a collider with one acceptor, connects N client threads over
//! loopback and has every client send M length-prefixed messages. The
//! server reassembles them with a `StreamDefragger` and the run stops when
//! every message has arrived.
//!
//! Usage:
//!     cargo run --release -p collider-recv-throughput -- [clients] [messages] [msg_size]
//!
//! Defaults: 4 clients, 100000 messages, 500 byte messages.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use collider::{Acceptor, Collider, ColliderConfig, Frame, Session, SessionListener, StreamDefragger};
use collider_core::{kerror, kinfo};

type Decoder = fn(&[u8]) -> i64;

fn decode_len(h: &[u8]) -> i64 {
    u32::from_be_bytes([h[0], h[1], h[2], h[3]]) as i64
}

struct Totals {
    messages: AtomicU64,
    bytes: AtomicU64,
    expected: u64,
    collider: Collider,
}

struct RecvListener {
    session: Arc<Session>,
    defrag: Mutex<StreamDefragger<Decoder>>,
    totals: Arc<Totals>,
}

impl SessionListener for RecvListener {
    fn on_data_received(&self, data: &[u8]) {
        let mut defrag = self.defrag.lock().unwrap_or_else(|e| e.into_inner());
        let mut feed = defrag.feed(data);
        while let Some(frame) = feed.next() {
            match frame {
                Frame::Message(msg) => {
                    self.totals.bytes.fetch_add(msg.len() as u64, Ordering::Relaxed);
                    let n = self.totals.messages.fetch_add(1, Ordering::Relaxed) + 1;
                    if n == self.totals.expected {
                        self.totals.collider.stop();
                    }
                }
                Frame::InvalidHeader => {
                    kerror!("{}: invalid header", self.session.remote_addr());
                    let _ = self.session.close_connection();
                }
            }
        }
    }

    fn on_connection_closed(&self) {}
}

struct RecvAcceptor {
    totals: Arc<Totals>,
    started: Mutex<Sender<u16>>,
}

impl Acceptor for RecvAcceptor {
    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn on_acceptor_started(&self, _collider: &Collider, port: u16) {
        let _ = self.started.lock().unwrap_or_else(|e| e.into_inner()).send(port);
    }

    fn on_acceptor_starting_failure(&self, msg: &str) {
        kerror!("acceptor: {}", msg);
        std::process::exit(1);
    }

    fn create_session_listener(&self, session: &Arc<Session>) -> Arc<dyn SessionListener> {
        Arc::new(RecvListener {
            session: Arc::clone(session),
            defrag: Mutex::new(StreamDefragger::new(4, decode_len as Decoder)),
            totals: Arc::clone(&self.totals),
        })
    }
}

fn arg(idx: usize, default: usize) -> usize {
    std::env::args().nth(idx).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn main() {
    let clients = arg(1, 4);
    let messages = arg(2, 100_000);
    let msg_size = arg(3, 500).max(4);

    let collider = match Collider::new(ColliderConfig::from_env()) {
        Ok(c) => c,
        Err(e) => {
            kerror!("collider: {}", e);
            std::process::exit(1);
        }
    };
    let totals = Arc::new(Totals {
        messages: AtomicU64::new(0),
        bytes: AtomicU64::new(0),
        expected: (clients * messages) as u64,
        collider: collider.clone(),
    });

    let (tx, rx) = mpsc::channel();
    collider.add_acceptor(Arc::new(RecvAcceptor { totals: Arc::clone(&totals), started: Mutex::new(tx) }));
    let reactor = {
        let c = collider.clone();
        thread::spawn(move || c.run())
    };
    let port = match rx.recv() {
        Ok(p) => p,
        Err(_) => {
            kerror!("acceptor never started");
            std::process::exit(1);
        }
    };

    let mut msg = vec![0xA5u8; msg_size];
    msg[..4].copy_from_slice(&(msg_size as u32).to_be_bytes());
    let batch: Vec<u8> = msg.iter().copied().cycle().take(msg_size * 64).collect();

    println!("{} clients x {} messages of {} bytes", clients, messages, msg_size);
    let start = Instant::now();
    let senders: Vec<_> = (0..clients)
        .map(|_| {
            let batch = batch.clone();
            let msg = msg.clone();
            thread::spawn(move || -> std::io::Result<()> {
                let mut s = TcpStream::connect(("127.0.0.1", port))?;
                s.set_nodelay(true)?;
                let mut left = messages;
                while left >= 64 {
                    s.write_all(&batch)?;
                    left -= 64;
                }
                for _ in 0..left {
                    s.write_all(&msg)?;
                }
                // Keep the socket open until the server has everything
                let mut buf = [0u8; 1];
                let _ = std::io::Read::read(&mut s, &mut buf);
                Ok(())
            })
        })
        .collect();

    match reactor.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => kerror!("collider: {}", e),
        Err(_) => kerror!("reactor thread panicked"),
    }
    let elapsed = start.elapsed();
    for s in senders {
        if let Ok(Err(e)) = s.join() {
            kinfo!("client: {}", e);
        }
    }

    let bytes = totals.bytes.load(Ordering::Relaxed);
    let secs = elapsed.as_secs_f64();
    println!(
        "received {} messages, {} bytes in {:.3}s: {:.0} msg/s, {:.1} MiB/s",
        totals.messages.load(Ordering::Relaxed),
        bytes,
        secs,
        totals.messages.load(Ordering::Relaxed) as f64 / secs,
        bytes as f64 / secs / (1024.0 * 1024.0)
    );
}
