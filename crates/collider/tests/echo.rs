//! Loopback end-to-end tests: a collider serving real TCP clients.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use collider::{
    Acceptor, Collider, ColliderConfig, ColliderError, Connector, Frame, Result, Session,
    SendStatus, SessionListener, ShMem, ShMemChannelIn, ShMemChannelOut, SocketOptions,
    StreamDefragger,
};

const TIMEOUT: Duration = Duration::from_secs(10);

type Factory = Box<dyn Fn(&Arc<Session>) -> Arc<dyn SessionListener> + Send + Sync>;

struct TestAcceptor {
    addr: SocketAddr,
    opts: SocketOptions,
    started: Mutex<Sender<std::result::Result<u16, String>>>,
    factory: Factory,
}

impl Acceptor for TestAcceptor {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn socket_options(&self) -> SocketOptions {
        self.opts.clone()
    }

    fn on_acceptor_started(&self, _collider: &Collider, port: u16) {
        let _ = self.started.lock().unwrap().send(Ok(port));
    }

    fn on_acceptor_starting_failure(&self, msg: &str) {
        let _ = self.started.lock().unwrap().send(Err(msg.to_string()));
    }

    fn create_session_listener(&self, session: &Arc<Session>) -> Arc<dyn SessionListener> {
        (self.factory)(session)
    }
}

struct Server {
    collider: Collider,
    reactor: Option<JoinHandle<Result<()>>>,
    port: u16,
}

impl Server {
    fn start<F>(config: ColliderConfig, opts: SocketOptions, factory: F) -> Server
    where
        F: Fn(&Arc<Session>) -> Arc<dyn SessionListener> + Send + Sync + 'static,
    {
        let collider = Collider::new(config).unwrap();
        let reactor = {
            let c = collider.clone();
            thread::spawn(move || c.run())
        };
        let (tx, rx) = mpsc::channel();
        collider.add_acceptor(Arc::new(TestAcceptor {
            addr: "127.0.0.1:0".parse().unwrap(),
            opts,
            started: Mutex::new(tx),
            factory: Box::new(factory),
        }));
        let port = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
        Server { collider, reactor: Some(reactor), port }
    }

    fn connect(&self) -> TcpStream {
        let s = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        s.set_read_timeout(Some(TIMEOUT)).unwrap();
        s
    }

    fn stop(mut self) {
        self.collider.stop();
        if let Some(h) = self.reactor.take() {
            h.join().unwrap().unwrap();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(h) = self.reactor.take() {
            self.collider.stop();
            let _ = h.join();
        }
    }
}

fn config() -> ColliderConfig {
    ColliderConfig::new()
        .thread_pool_threads(4)
        .shutdown_timeout(Duration::from_secs(5))
}

/// Counts closes, echoes everything back.
struct Echo {
    session: Arc<Session>,
    closed: Arc<AtomicUsize>,
    done: Mutex<Sender<()>>,
}

impl SessionListener for Echo {
    fn on_data_received(&self, data: &[u8]) {
        let _ = self.session.send(data);
    }

    fn on_connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        let _ = self.done.lock().unwrap().send(());
    }
}

fn echo_server(config: ColliderConfig) -> (Server, Arc<AtomicUsize>, Receiver<()>) {
    let closed = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let c = Arc::clone(&closed);
    let server = Server::start(config, SocketOptions::default(), move |s| {
        Arc::new(Echo {
            session: Arc::clone(s),
            closed: Arc::clone(&c),
            done: Mutex::new(tx.lock().unwrap().clone()),
        })
    });
    (server, closed, rx)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_echo_preserves_order() {
    let (server, closed, done) = echo_server(config());
    let mut client = server.connect();

    let data = pattern(200_000);
    let writer = {
        let mut w = client.try_clone().unwrap();
        let data = data.clone();
        thread::spawn(move || {
            for chunk in data.chunks(1500) {
                w.write_all(chunk).unwrap();
            }
        })
    };
    let mut back = vec![0u8; data.len()];
    client.read_exact(&mut back).unwrap();
    writer.join().unwrap();
    assert!(back == data, "echoed bytes differ");

    drop(client);
    done.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    server.stop();
}

#[test]
fn test_concurrent_sends_are_not_lost() {
    const SENDERS: usize = 8;
    const PER_SENDER: usize = 500;

    // Each sender thread writes fixed size records tagged with its id
    struct Fanout {
        session: Arc<Session>,
        started: AtomicBool,
    }
    impl SessionListener for Fanout {
        fn on_data_received(&self, _data: &[u8]) {
            if self.started.swap(true, Ordering::SeqCst) {
                return;
            }
            let handles: Vec<_> = (0..SENDERS)
                .map(|id| {
                    let s = Arc::clone(&self.session);
                    thread::spawn(move || {
                        for seq in 0..PER_SENDER {
                            let mut rec = [0u8; 8];
                            rec[..4].copy_from_slice(&(id as u32).to_be_bytes());
                            rec[4..].copy_from_slice(&(seq as u32).to_be_bytes());
                            s.send(rec.to_vec()).unwrap();
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        }
        fn on_connection_closed(&self) {}
    }

    let server = Server::start(config(), SocketOptions::default(), |s| {
        Arc::new(Fanout { session: Arc::clone(s), started: AtomicBool::new(false) })
    });
    let mut client = server.connect();
    client.write_all(b"go").unwrap();

    let mut buf = vec![0u8; SENDERS * PER_SENDER * 8];
    client.read_exact(&mut buf).unwrap();
    let mut next = [0u32; SENDERS];
    for rec in buf.chunks(8) {
        let id = u32::from_be_bytes(rec[..4].try_into().unwrap()) as usize;
        let seq = u32::from_be_bytes(rec[4..].try_into().unwrap());
        // Per sender order holds, records never interleave
        assert_eq!(seq, next[id]);
        next[id] += 1;
    }
    assert!(next.iter().all(|&n| n as usize == PER_SENDER));
    server.stop();
}

#[test]
fn test_close_flushes_queued_output() {
    struct Replier {
        session: Arc<Session>,
        after_close: Mutex<Sender<bool>>,
    }
    impl SessionListener for Replier {
        fn on_data_received(&self, _data: &[u8]) {
            self.session.send(pattern(512 * 1024)).unwrap();
            self.session.close_connection().unwrap();
            let refused = matches!(self.session.send(&b"late"[..]), Err(ColliderError::SessionClosed));
            let twice = matches!(self.session.close_connection(), Err(ColliderError::SessionClosed));
            let _ = self.after_close.lock().unwrap().send(refused && twice);
        }
        fn on_connection_closed(&self) {}
    }

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let server = Server::start(config(), SocketOptions::default(), move |s| {
        Arc::new(Replier {
            session: Arc::clone(s),
            after_close: Mutex::new(tx.lock().unwrap().clone()),
        })
    });
    let mut client = server.connect();
    client.write_all(b"x").unwrap();

    let mut got = Vec::new();
    client.read_to_end(&mut got).unwrap();
    assert!(got == pattern(512 * 1024), "got {} bytes", got.len());
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
    server.stop();
}

#[test]
fn test_backpressure_keeps_stream_intact() {
    const TOTAL: usize = 2 * 1024 * 1024;

    struct Slow {
        pos: AtomicUsize,
        ok: AtomicBool,
        done: Mutex<Sender<(usize, bool)>>,
    }
    impl SessionListener for Slow {
        fn on_data_received(&self, data: &[u8]) {
            let pos = self.pos.load(Ordering::Relaxed);
            for (i, b) in data.iter().enumerate() {
                if *b != ((pos + i) % 251) as u8 {
                    self.ok.store(false, Ordering::Relaxed);
                }
            }
            self.pos.store(pos + data.len(), Ordering::Relaxed);
            thread::sleep(Duration::from_micros(200));
        }
        fn on_connection_closed(&self) {
            let _ = self
                .done
                .lock()
                .unwrap()
                .send((self.pos.load(Ordering::Relaxed), self.ok.load(Ordering::Relaxed)));
        }
    }

    let cfg = config().input_queue_block_size(4096).forward_read_max_size(16 * 1024);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let server = Server::start(cfg, SocketOptions::default(), move |_| {
        Arc::new(Slow {
            pos: AtomicUsize::new(0),
            ok: AtomicBool::new(true),
            done: Mutex::new(tx.lock().unwrap().clone()),
        })
    });

    let mut client = server.connect();
    client.write_all(&pattern(TOTAL)).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let (len, ok) = rx.recv_timeout(Duration::from_secs(60)).unwrap();
    assert_eq!(len, TOTAL);
    assert!(ok, "delivered bytes out of order");
    server.stop();
}

#[test]
fn test_defragger_over_session() {
    struct Framed {
        session: Arc<Session>,
        defrag: Mutex<StreamDefragger<fn(&[u8]) -> i64>>,
    }
    fn be32(h: &[u8]) -> i64 {
        u32::from_be_bytes([h[0], h[1], h[2], h[3]]) as i64
    }
    impl SessionListener for Framed {
        fn on_data_received(&self, data: &[u8]) {
            let mut defrag = self.defrag.lock().unwrap();
            let mut feed = defrag.feed(data);
            while let Some(frame) = feed.next() {
                match frame {
                    // Reply with the payload length
                    Frame::Message(m) => {
                        let _ = self.session.send(((m.len() - 4) as u32).to_be_bytes().to_vec());
                    }
                    Frame::InvalidHeader => {
                        let _ = self.session.close_connection();
                    }
                }
            }
        }
        fn on_connection_closed(&self) {}
    }

    let server = Server::start(config(), SocketOptions::default(), |s| {
        Arc::new(Framed {
            session: Arc::clone(s),
            defrag: Mutex::new(StreamDefragger::new(4, be32 as fn(&[u8]) -> i64)),
        })
    });
    let mut client = server.connect();
    let sizes = [0usize, 1, 100, 5000, 70_000];
    let mut wire = Vec::new();
    for &n in &sizes {
        wire.extend_from_slice(&((n + 4) as u32).to_be_bytes());
        wire.extend(std::iter::repeat(0xAB).take(n));
    }
    // Deliberately awkward fragmentation
    for chunk in wire.chunks(3) {
        client.write_all(chunk).unwrap();
    }
    for &n in &sizes {
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(u32::from_be_bytes(reply) as usize, n);
    }

    // A bad header closes the session
    client.write_all(&[0, 0, 0, 1]).unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    server.stop();
}

#[test]
fn test_duplicate_and_failed_acceptor() {
    let server = Server::start(config(), SocketOptions::default(), |_| Arc::new(NullListener));

    // Port already taken by the running acceptor
    let (tx, rx) = mpsc::channel();
    server.collider.add_acceptor(Arc::new(TestAcceptor {
        addr: SocketAddr::from(([127, 0, 0, 1], server.port)),
        opts: SocketOptions::default().reuse_addr(false),
        started: Mutex::new(tx),
        factory: Box::new(|_| Arc::new(NullListener)),
    }));
    assert!(rx.recv_timeout(TIMEOUT).unwrap().is_err());

    // Same acceptor object twice
    let (tx, rx) = mpsc::channel();
    let acceptor: Arc<dyn Acceptor> = Arc::new(TestAcceptor {
        addr: "127.0.0.1:0".parse().unwrap(),
        opts: SocketOptions::default(),
        started: Mutex::new(tx),
        factory: Box::new(|_| Arc::new(NullListener)),
    });
    server.collider.add_acceptor(Arc::clone(&acceptor));
    let port = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    server.collider.add_acceptor(Arc::clone(&acceptor));
    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert!(err.contains("already registered"), "{}", err);

    server.collider.remove_acceptor(&acceptor);
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
    server.stop();
}

struct NullListener;

impl SessionListener for NullListener {
    fn on_data_received(&self, _data: &[u8]) {}
    fn on_connection_closed(&self) {}
}

#[test]
fn test_stop_closes_open_sessions() {
    let (server, closed, done) = echo_server(config());
    let mut clients: Vec<_> = (0..4).map(|_| server.connect()).collect();
    for c in &mut clients {
        c.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        c.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    let collider = server.collider.clone();
    server.stop();
    assert!(collider.is_stopped());
    for _ in 0..4 {
        done.recv_timeout(TIMEOUT).unwrap();
    }
    assert_eq!(closed.load(Ordering::SeqCst), 4);
    for c in &mut clients {
        let mut buf = Vec::new();
        c.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
    }
}

struct TestConnector {
    addr: SocketAddr,
    events: Mutex<Sender<String>>,
}

struct Recorder {
    events: Mutex<Sender<String>>,
}

impl SessionListener for Recorder {
    fn on_data_received(&self, data: &[u8]) {
        let _ = self.events.lock().unwrap().send(String::from_utf8_lossy(data).into_owned());
    }

    fn on_connection_closed(&self) {
        let _ = self.events.lock().unwrap().send("<closed>".into());
    }
}

impl Connector for TestConnector {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn create_session_listener(&self, session: &Arc<Session>) -> Arc<dyn SessionListener> {
        session.send(&b"hello"[..]).unwrap();
        let events = self.events.lock().unwrap().clone();
        let _ = events.send("<connected>".into());
        Arc::new(Recorder { events: Mutex::new(events) })
    }

    fn on_connection_failed(&self, msg: &str) {
        let _ = self.events.lock().unwrap().send(format!("<failed> {}", msg));
    }
}

#[test]
fn test_connector_session() {
    let collider = Collider::new(config()).unwrap();
    let reactor = {
        let c = collider.clone();
        thread::spawn(move || c.run())
    };

    let peer = TcpListener::bind("127.0.0.1:0").unwrap();
    let (tx, rx) = mpsc::channel();
    collider.add_connector(Arc::new(TestConnector {
        addr: peer.local_addr().unwrap(),
        events: Mutex::new(tx),
    }));
    let (mut remote, _) = peer.accept().unwrap();
    remote.set_read_timeout(Some(TIMEOUT)).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "<connected>");

    let mut hello = [0u8; 5];
    remote.read_exact(&mut hello).unwrap();
    assert_eq!(&hello, b"hello");
    remote.write_all(b"world").unwrap();
    let mut got = String::new();
    while got.len() < 5 {
        got.push_str(&rx.recv_timeout(TIMEOUT).unwrap());
    }
    assert_eq!(got, "world");
    drop(remote);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "<closed>");

    // Nobody listens on a port that was just released
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let (tx, rx) = mpsc::channel();
    collider.add_connector(Arc::new(TestConnector { addr: dead, events: Mutex::new(tx) }));
    assert!(rx.recv_timeout(TIMEOUT).unwrap().starts_with("<failed>"));

    collider.stop();
    reactor.join().unwrap().unwrap();
}

/// In-process stand-in for a shared memory segment.
#[derive(Clone, Default)]
struct Segment(Arc<Mutex<VecDeque<u8>>>);

struct SegOut(Segment);

impl ShMemChannelOut for SegOut {
    fn add_data(&mut self, data: &[u8]) -> Result<usize> {
        self.0 .0.lock().unwrap().extend(data.iter().copied());
        Ok(data.len())
    }

    fn close(&mut self) {}
}

struct SegIn(Segment);

impl ShMemChannelIn for SegIn {
    fn handle_data(&mut self, size: u32, listener: &dyn SessionListener) -> Result<()> {
        let bytes: Vec<u8> = {
            let mut q = self.0 .0.lock().unwrap();
            if q.len() < size as usize {
                return Err(ColliderError::TransportFailure);
            }
            q.drain(..size as usize).collect()
        };
        listener.on_data_received(&bytes);
        Ok(())
    }

    fn close(&mut self) {}
}

#[test]
fn test_accelerated_session() {
    let to_server = Segment::default();
    let to_client = Segment::default();

    struct Accel {
        session: Arc<Session>,
        seen: AtomicUsize,
        segments: Mutex<Option<(Segment, Segment)>>,
    }
    impl SessionListener for Accel {
        fn on_data_received(&self, data: &[u8]) {
            if self.seen.fetch_add(data.len(), Ordering::SeqCst) + data.len() < 5 {
                return;
            }
            match self.segments.lock().unwrap().take() {
                Some((inbound, outbound)) => {
                    let shmem = ShMem::new(Box::new(SegOut(outbound)), Box::new(SegIn(inbound)));
                    self.session.accelerate(shmem, Some(b"OK")).unwrap();
                }
                // Accelerated: echo what the segment delivered
                None => self.session.send(data).unwrap(),
            }
        }
        fn on_connection_closed(&self) {}
    }

    let segs = Mutex::new(Some((to_server.clone(), to_client.clone())));
    let server = Server::start(config(), SocketOptions::default(), move |s| {
        Arc::new(Accel {
            session: Arc::clone(s),
            seen: AtomicUsize::new(0),
            segments: Mutex::new(segs.lock().unwrap().take()),
        })
    });

    let mut client = server.connect();
    client.write_all(b"ACCEL").unwrap();
    let mut ok = [0u8; 2];
    client.read_exact(&mut ok).unwrap();
    assert_eq!(&ok, b"OK");

    for msg in [&b"first"[..], &b"second message"[..]] {
        to_server.0.lock().unwrap().extend(msg.iter().copied());
        client.write_all(&(msg.len() as u32).to_be_bytes()).unwrap();

        let mut announced = 0;
        while announced < msg.len() {
            let mut size = [0u8; 4];
            client.read_exact(&mut size).unwrap();
            announced += u32::from_be_bytes(size) as usize;
        }
        assert_eq!(announced, msg.len());
        let echoed: Vec<u8> = to_client.0.lock().unwrap().drain(..).collect();
        assert_eq!(echoed, msg);
    }

    // Announcing bytes the segment does not hold closes the session
    client.write_all(&100u32.to_be_bytes()).unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    server.stop();
}

/// Polls `cond` until it holds or the timeout passes.
fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + TIMEOUT;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_send_shared_releases_after_drain() {
    struct Sharer {
        session: Arc<Session>,
        payload: Arc<Vec<u8>>,
        refused: Mutex<Sender<bool>>,
    }
    impl SessionListener for Sharer {
        fn on_data_received(&self, data: &[u8]) {
            if data.starts_with(b"bye") {
                self.session.close_connection().unwrap();
                let refused = matches!(
                    self.session.send_shared(&self.payload),
                    Err(ColliderError::SessionClosed)
                );
                let _ = self.refused.lock().unwrap().send(refused);
                return;
            }
            for _ in 0..3 {
                self.session.send_shared(&self.payload).unwrap();
            }
        }
        fn on_connection_closed(&self) {}
    }

    let payload = Arc::new(pattern(100_000));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let server = {
        let payload = Arc::clone(&payload);
        Server::start(config(), SocketOptions::default(), move |s| {
            Arc::new(Sharer {
                session: Arc::clone(s),
                payload: Arc::clone(&payload),
                refused: Mutex::new(tx.lock().unwrap().clone()),
            })
        })
    };

    let mut client = server.connect();
    client.write_all(b"go").unwrap();
    let mut back = vec![0u8; 3 * payload.len()];
    client.read_exact(&mut back).unwrap();
    for chunk in back.chunks(payload.len()) {
        assert!(chunk == &payload[..], "shared bytes differ");
    }
    // Held by the test, the listener factory and the listener
    assert!(wait_until(|| Arc::strong_count(&payload) == 3));

    client.write_all(b"bye").unwrap();
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    // The closed session dropped its listener
    assert!(wait_until(|| Arc::strong_count(&payload) == 2));
    server.stop();
}

#[test]
fn test_send_shared_released_on_discard() {
    struct Flood {
        session: Arc<Session>,
        payload: Arc<Vec<u8>>,
    }
    impl SessionListener for Flood {
        fn on_data_received(&self, _data: &[u8]) {
            for _ in 0..64 {
                if self.session.send_shared(&self.payload).is_err() {
                    break;
                }
            }
        }
        fn on_connection_closed(&self) {}
    }

    let payload = Arc::new(pattern(1024 * 1024));
    let server = {
        let payload = Arc::clone(&payload);
        Server::start(config(), SocketOptions::default(), move |s| {
            Arc::new(Flood { session: Arc::clone(s), payload: Arc::clone(&payload) })
        })
    };

    let mut client = server.connect();
    client.write_all(b"go").unwrap();
    // Let the output queue back up, then reset with data left unread
    let mut first = [0u8; 1];
    client.read_exact(&mut first).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(Arc::strong_count(&payload) > 3);
    drop(client);

    // Only the test and the listener factory are left
    assert!(
        wait_until(|| Arc::strong_count(&payload) == 2),
        "queued buffers not released: {}",
        Arc::strong_count(&payload)
    );
    server.stop();
}

#[test]
fn test_send_sync_statuses() {
    const BIG: usize = 32 * 1024 * 1024;

    struct Syncer {
        session: Arc<Session>,
        statuses: Mutex<Sender<Vec<SendStatus>>>,
    }
    impl SessionListener for Syncer {
        fn on_data_received(&self, _data: &[u8]) {
            let mut out = Vec::new();
            out.push(self.session.send_sync(&b"small"[..]).unwrap());
            // Far more than the socket buffers take at once
            out.push(self.session.send_sync(pattern(BIG)).unwrap());
            // The remainder is still queued
            out.push(self.session.send_sync(&b"tail"[..]).unwrap());
            let _ = self.statuses.lock().unwrap().send(out);
        }
        fn on_connection_closed(&self) {}
    }

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let server = Server::start(config(), SocketOptions::default(), move |s| {
        Arc::new(Syncer {
            session: Arc::clone(s),
            statuses: Mutex::new(tx.lock().unwrap().clone()),
        })
    });

    let mut client = server.connect();
    client.write_all(b"go").unwrap();
    let statuses = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(statuses, vec![SendStatus::Sent, SendStatus::Queued, SendStatus::Queued]);

    let mut small = [0u8; 5];
    client.read_exact(&mut small).unwrap();
    assert_eq!(&small, b"small");
    let mut big = vec![0u8; BIG];
    client.read_exact(&mut big).unwrap();
    assert!(big == pattern(BIG), "partial remainder lost or reordered");
    let mut tail = [0u8; 4];
    client.read_exact(&mut tail).unwrap();
    assert_eq!(&tail, b"tail");
    server.stop();
}

#[test]
fn test_backpressure_bounds_unread_input() {
    const TOTAL: usize = 1024 * 1024;
    const BLOCK: usize = 4096;
    const FORWARD_MAX: usize = 16 * 1024;

    struct Throttled {
        session: Arc<Session>,
        received: AtomicUsize,
        max_pending: AtomicUsize,
        done: Mutex<Sender<(usize, usize, u64)>>,
    }
    impl SessionListener for Throttled {
        fn on_data_received(&self, data: &[u8]) {
            self.max_pending.fetch_max(self.session.pending_input(), Ordering::Relaxed);
            self.received.fetch_add(data.len(), Ordering::Relaxed);
            thread::sleep(Duration::from_micros(300));
        }
        fn on_connection_closed(&self) {
            let _ = self.done.lock().unwrap().send((
                self.received.load(Ordering::Relaxed),
                self.max_pending.load(Ordering::Relaxed),
                self.session.read_stats().suspends,
            ));
        }
    }

    let cfg = config().input_queue_block_size(BLOCK).forward_read_max_size(FORWARD_MAX);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let server = Server::start(cfg, SocketOptions::default(), move |s| {
        Arc::new(Throttled {
            session: Arc::clone(s),
            received: AtomicUsize::new(0),
            max_pending: AtomicUsize::new(0),
            done: Mutex::new(tx.lock().unwrap().clone()),
        })
    });

    let mut client = server.connect();
    client.write_all(&pattern(TOTAL)).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let (received, max_pending, suspends) = rx.recv_timeout(Duration::from_secs(60)).unwrap();
    assert_eq!(received, TOTAL);
    assert!(suspends > 0, "read interest never suspended");
    // One read lands at most two blocks past the threshold
    assert!(
        max_pending <= FORWARD_MAX + 2 * BLOCK,
        "unread input reached {}",
        max_pending
    );
    server.stop();
}

#[test]
fn test_close_with_unread_input_defers_notification() {
    #[derive(Debug, PartialEq)]
    enum Event {
        Data,
        Closed { in_callback: bool },
    }

    struct Closer {
        session: Arc<Session>,
        in_callback: AtomicBool,
        events: Mutex<Vec<Event>>,
        done: Mutex<Sender<Vec<Event>>>,
    }
    impl SessionListener for Closer {
        fn on_data_received(&self, _data: &[u8]) {
            self.in_callback.store(true, Ordering::SeqCst);
            self.events.lock().unwrap().push(Event::Data);
            let _ = self.session.close_connection();
            // Delivery is still running, the close must wait for it
            thread::sleep(Duration::from_millis(100));
            self.in_callback.store(false, Ordering::SeqCst);
        }
        fn on_connection_closed(&self) {
            let mut events = self.events.lock().unwrap();
            events.push(Event::Closed { in_callback: self.in_callback.load(Ordering::SeqCst) });
            let _ = self.done.lock().unwrap().send(std::mem::take(&mut *events));
        }
    }

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let server = Server::start(config(), SocketOptions::default(), move |s| {
        Arc::new(Closer {
            session: Arc::clone(s),
            in_callback: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
            done: Mutex::new(tx.lock().unwrap().clone()),
        })
    });

    let mut client = server.connect();
    client.write_all(&pattern(64 * 1024)).unwrap();

    let events = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(events.last(), Some(Event::Closed { in_callback: false })), "{:?}", events);
    assert_eq!(events.iter().filter(|e| matches!(e, Event::Closed { .. })).count(), 1);
    assert!(events.len() >= 2);

    // Input left unread in the kernel turns the close into a reset
    let mut rest = Vec::new();
    match client.read_to_end(&mut rest) {
        Ok(_) => assert!(rest.is_empty()),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }
    server.stop();
}

#[test]
fn test_close_racing_peer_eof_releases_socket() {
    struct RacingCloser {
        session: Arc<Session>,
        closed: Mutex<Sender<()>>,
    }
    impl SessionListener for RacingCloser {
        fn on_data_received(&self, _data: &[u8]) {
            let s = Arc::clone(&self.session);
            thread::spawn(move || {
                let _ = s.close_connection();
            });
        }
        fn on_connection_closed(&self) {
            let _ = self.closed.lock().unwrap().send(());
        }
    }

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let server = Server::start(config(), SocketOptions::default(), move |s| {
        Arc::new(RacingCloser {
            session: Arc::clone(s),
            closed: Mutex::new(tx.lock().unwrap().clone()),
        })
    });

    for round in 0..50 {
        let mut client = server.connect();
        client.write_all(b"x").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        rx.recv_timeout(TIMEOUT).unwrap();
        // EOF here means both socket shares were released
        let mut rest = Vec::new();
        client
            .read_to_end(&mut rest)
            .unwrap_or_else(|e| panic!("round {}: socket left open ({})", round, e));
        assert!(rest.is_empty());
    }
    server.stop();
}
