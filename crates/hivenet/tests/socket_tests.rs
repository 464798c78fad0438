//! Loopback tests for the socket reactor: accept/start/data round trips,
//! close semantics, write-queue ordering, and half-close behavior.
//!
//! The reactor runs on its own thread and forwards polled messages into an
//! mpsc channel; tests drive real TCP clients against it.

use hivenet::{CloseMode, ServerHandle, SocketMessage, SocketServer, SocketTag};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

struct Reactor {
    handle: ServerHandle,
    rx: mpsc::Receiver<SocketMessage>,
    join: thread::JoinHandle<()>,
}

fn start_reactor() -> Reactor {
    // Reactor warnings are useful when a loopback test goes sideways.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let server = SocketServer::new(0).expect("socket server");
    let handle = server.handle();
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let mut server = server;
        while let Some(msg) = server.poll() {
            if tx.send(msg).is_err() {
                break;
            }
        }
    });
    Reactor { handle, rx, join }
}

impl Reactor {
    fn next(&self) -> SocketMessage {
        self.rx.recv_timeout(WAIT).expect("expected reactor message")
    }

    fn assert_quiet(&self) {
        assert!(
            self.rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "reactor produced an unexpected message"
        );
    }

    fn stop(self) {
        let _ = self.handle.exit();
        let _ = self.join.join();
    }
}

fn addr_of(msg: &SocketMessage) -> String {
    String::from_utf8(msg.buffer.as_deref().unwrap().to_vec()).unwrap()
}

/// Listens, accepts one client, starts the accepted socket, and opens the
/// data flow.
fn establish(r: &Reactor, client_opaque: usize) -> (i32, TcpStream) {
    r.handle.listen("127.0.0.1", 0, 64, 1).unwrap();
    let open = r.next();
    assert_eq!(open.tag, SocketTag::Open);
    let addr = addr_of(&open);

    let stream = TcpStream::connect(addr).unwrap();
    let accept = r.next();
    assert_eq!(accept.tag, SocketTag::Accept);
    assert_eq!(accept.id, open.id);
    let new_id = accept.ud as i32;
    assert!(accept.buffer.is_some(), "accept carries the peer address");

    r.handle.start(new_id, client_opaque).unwrap();
    let started = r.next();
    assert_eq!(started.tag, SocketTag::Open);
    assert_eq!(started.id, new_id);
    assert_eq!(started.opaque, client_opaque);
    (new_id, stream)
}

/// A payload of length L arrives as ordered `Data` messages whose
/// concatenation equals the payload.
#[test]
fn test_payload_round_trip() {
    let r = start_reactor();
    let (id, stream) = establish(&r, 11);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let client = thread::spawn(move || {
        let mut stream = stream;
        stream.write_all(&payload).unwrap();
        // FIN after the data; the reactor must still deliver every byte.
    });

    let mut got = Vec::with_capacity(expected.len());
    while got.len() < expected.len() {
        let msg = r.next();
        assert_eq!(msg.tag, SocketTag::Data);
        assert_eq!(msg.id, id);
        let buf = msg.buffer.unwrap();
        assert_eq!(msg.ud, buf.len());
        got.extend_from_slice(&buf);
    }
    assert_eq!(got, expected);
    client.join().unwrap();
    r.stop();
}

/// `close(id, Both)` tears the socket down; subsequent sends produce
/// `Error` and never `Data`.
#[test]
fn test_close_both_then_send_errors() {
    let r = start_reactor();
    let (id, stream) = establish(&r, 22);

    r.handle.close(id, CloseMode::Both, 33).unwrap();
    let closed = r.next();
    assert_eq!(closed.tag, SocketTag::Close);
    assert_eq!(closed.id, id);
    assert_eq!(closed.opaque, 33);

    r.handle.send_high(id, b"too late".to_vec()).unwrap();
    let err = r.next();
    assert_eq!(err.tag, SocketTag::Error);
    assert_eq!(err.id, id);
    r.assert_quiet();

    // The client observes the close as EOF with nothing delivered.
    let mut stream = stream;
    let mut sink = Vec::new();
    stream.read_to_end(&mut sink).unwrap();
    assert!(sink.is_empty());
    r.stop();
}

/// A blocked low-priority bulk send finishes before later high-priority
/// data: the partially sent low chunk is promoted and completed first.
#[test]
fn test_write_priority_promotion_ordering() {
    const BULK: usize = 8 * 1024 * 1024;
    const URGENT: usize = 1024;

    let r = start_reactor();
    let (id, stream) = establish(&r, 44);

    let (go_tx, go_rx) = mpsc::channel::<()>();
    let client = thread::spawn(move || {
        let mut stream = stream;
        go_rx.recv_timeout(WAIT).unwrap();
        let mut got = vec![0u8; BULK + URGENT];
        stream.read_exact(&mut got).unwrap();
        got
    });

    // The bulk send overruns the kernel buffer (the client is not reading
    // yet), leaving a partially sent low chunk behind.
    r.handle.send_low(id, vec![b'L'; BULK]).unwrap();
    thread::sleep(Duration::from_millis(200));
    // Later urgent data must still queue behind the in-flight bulk chunk.
    r.handle.send_high(id, vec![b'H'; URGENT]).unwrap();
    go_tx.send(()).unwrap();

    let got = client.join().unwrap();
    assert!(got[..BULK].iter().all(|&b| b == b'L'), "bulk bytes first");
    assert!(got[BULK..].iter().all(|&b| b == b'H'), "urgent bytes after");
    r.stop();
}

/// After a peer FIN the reactor stops reading but writes keep working
/// until the socket is closed.
#[test]
fn test_half_close_read_still_writes() {
    const REPLY: &[u8] = b"after-fin";

    let r = start_reactor();
    let (id, stream) = establish(&r, 55);

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let client = thread::spawn(move || {
        let mut stream = stream;
        stream.shutdown(Shutdown::Write).unwrap();
        let mut got = vec![0u8; REPLY.len()];
        stream.read_exact(&mut got).unwrap();
        done_tx.send(()).unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        got
    });

    // The FIN reaches the reactor silently (no message), then the write
    // side still delivers.
    thread::sleep(Duration::from_millis(100));
    r.handle.send_high(id, REPLY.to_vec()).unwrap();
    done_rx.recv_timeout(WAIT).unwrap();
    r.handle.close(id, CloseMode::Both, 66).unwrap();
    let closed = r.next();
    assert_eq!(closed.tag, SocketTag::Close);

    let got = client.join().unwrap();
    assert_eq!(got, REPLY);
    r.stop();
}

/// Connect completes against a live listener and reports `Open` with the
/// peer address.
#[test]
fn test_connect_round_trip() {
    let r = start_reactor();
    r.handle.listen("127.0.0.1", 0, 16, 1).unwrap();
    let open = r.next();
    assert_eq!(open.tag, SocketTag::Open);
    let addr: std::net::SocketAddr = addr_of(&open).parse().unwrap();

    r.handle
        .connect("127.0.0.1", addr.port(), 77)
        .unwrap();
    // Two messages arrive in some order: Open for the outbound socket and
    // Accept on the listener.
    let mut opened = None;
    let mut accepted = None;
    for _ in 0..2 {
        let msg = r.next();
        match msg.tag {
            SocketTag::Open => opened = Some(msg),
            SocketTag::Accept => accepted = Some(msg),
            other => panic!("unexpected tag {other:?}"),
        }
    }
    let opened = opened.expect("connect reported Open");
    assert_eq!(opened.opaque, 77);
    assert!(opened.buffer.is_some());
    assert!(accepted.is_some());
    r.stop();
}
