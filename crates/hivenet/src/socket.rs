use crate::error::SocketError;
use crate::poller::{Event, Poller, EVENT_MAX};
use crate::write_list::{WriteBuffer, WriteList};
use std::io;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// REACTOR TOPOLOGY
// =============================================================================
//
// One thread owns the reactor: it calls `poll()` in a loop and is the only
// mutator of the slot table. Every other thread talks to it through the
// self-pipe, writing framed requests of at most 2 + 256 bytes, under
// PIPE_BUF, so each request arrives whole. The pipe's read end is also
// registered with the poller (CTRL_TOKEN), which is what lets `poll()`
// block in the kernel instead of spinning: a request wakes it like any
// socket would.
//
// Request ownership crosses the pipe by value: send payloads and host
// strings travel as raw (ptr, len) pairs produced by `Box::into_raw`; the
// reactor reconstitutes the box and owns it from then on.
//
// =============================================================================

/// Socket id space (slot table size).
pub const SOCKET_ID_MAX: usize = 1 << 16;

/// Initial and minimum adaptive read size.
const MIN_READ: usize = 64;

/// Largest request body the pipe framing can carry.
const REQUEST_BODY_MAX: usize = 256;

/// Poller token reserved for the control pipe's read end.
const CTRL_TOKEN: u64 = u64::MAX;

/// Result tag of a polled socket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SocketTag {
    /// Payload received; `ud` is the byte count.
    Data = 0,
    /// A listen/connect/start completed; `buffer` holds the address.
    Open = 1,
    /// A listener accepted a connection; `ud` is the new socket id.
    Accept = 2,
    /// A close or half-close completed.
    Close = 3,
    /// Terminal socket error; the slot is gone.
    Error = 4,
}

impl SocketTag {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Data),
            1 => Some(Self::Open),
            2 => Some(Self::Accept),
            3 => Some(Self::Close),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

/// One message out of [`SocketServer::poll`].
#[derive(Debug)]
pub struct SocketMessage {
    pub tag: SocketTag,
    /// Socket id the event concerns (-1 when no slot was involved).
    pub id: i32,
    /// The owner cookie supplied with the originating request (a service
    /// handle in the runtime glue).
    pub opaque: usize,
    /// Tag-dependent scalar: byte count for `Data`, new id for `Accept`.
    pub ud: usize,
    /// Payload for `Data`; peer address string for `Open`/`Accept`.
    pub buffer: Option<Box<[u8]>>,
}

/// Bus payload codec for socket messages.
///
/// The worker/reactor glue encodes polled messages into mailbox payloads;
/// services decode them back. Layout: `[tag:u8][id:i32 le][ud:u64 le][data]`.
#[derive(Debug)]
pub struct SocketEvent {
    pub tag: SocketTag,
    pub id: i32,
    pub ud: u64,
    pub data: Option<Box<[u8]>>,
}

impl SocketEvent {
    /// Strips the routing cookie off a polled message.
    pub fn from_message(msg: SocketMessage) -> Self {
        Self {
            tag: msg.tag,
            id: msg.id,
            ud: msg.ud as u64,
            data: msg.buffer,
        }
    }

    /// Serializes into a mailbox payload.
    pub fn encode(&self) -> Box<[u8]> {
        let data = self.data.as_deref().unwrap_or(&[]);
        let mut out = Vec::with_capacity(13 + data.len());
        out.push(self.tag as u8);
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.ud.to_le_bytes());
        out.extend_from_slice(data);
        out.into_boxed_slice()
    }

    /// Parses a payload produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 13 {
            return None;
        }
        let tag = SocketTag::from_u8(bytes[0])?;
        let id = i32::from_le_bytes(bytes[1..5].try_into().ok()?);
        let ud = u64::from_le_bytes(bytes[5..13].try_into().ok()?);
        let data = if bytes.len() > 13 {
            Some(bytes[13..].to_vec().into_boxed_slice())
        } else {
            None
        };
        Some(Self { tag, id, ud, data })
    }
}

/// Half-close selector for [`ServerHandle::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Shut the read side; the socket enters half-close-read.
    Read,
    /// Shut the write side once pending data drains.
    Write,
    /// Tear the socket down entirely.
    Both,
}

impl CloseMode {
    fn to_raw(self) -> i32 {
        match self {
            Self::Read => libc::SHUT_RD,
            Self::Write => libc::SHUT_WR,
            Self::Both => libc::SHUT_RDWR,
        }
    }

    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            libc::SHUT_RD => Some(Self::Read),
            libc::SHUT_WR => Some(Self::Write),
            libc::SHUT_RDWR => Some(Self::Both),
            _ => None,
        }
    }
}

/// Per-socket transfer statistics against the server's coarse clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketStat {
    pub recv_bytes: u64,
    pub sent_bytes: u64,
    pub last_recv_ms: u64,
    pub last_sent_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Invalid,
    Reserve,
    Listen,
    Accept,
    Connecting,
    Connected,
    HalfCloseW,
    HalfCloseR,
}

struct Socket {
    id: i32,
    fd: RawFd,
    opaque: usize,
    status: Status,
    read_enabled: bool,
    write_enabled: bool,
    /// Graceful write shutdown requested; performed once the queues drain.
    closing: bool,
    stat: SocketStat,
    high: WriteList,
    low: WriteList,
    /// Total unsent bytes across both queues.
    wb_size: usize,
    /// Adaptive receive size: doubles on a full read, halves (floor
    /// [`MIN_READ`]) when reads run small.
    min_read: usize,
    peer: Option<Box<str>>,
}

impl Socket {
    fn invalid(id: i32) -> Self {
        Self {
            id,
            fd: -1,
            opaque: 0,
            status: Status::Invalid,
            read_enabled: false,
            write_enabled: false,
            closing: false,
            stat: SocketStat::default(),
            high: WriteList::new(),
            low: WriteList::new(),
            wb_size: 0,
            min_read: MIN_READ,
            peer: None,
        }
    }
}

// -----------------------------------------------------------------------------
// Self-pipe requests
// -----------------------------------------------------------------------------
//
// All request structs are plain repr(C) data constructed over zeroed
// memory, so every byte (padding included) is initialized before the
// struct is viewed as bytes for the pipe write.

#[derive(Clone, Copy)]
#[repr(C)]
struct RequestClose {
    id: i32,
    what: i32,
    opaque: usize,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct RequestListen {
    opaque: usize,
    host_ptr: usize,
    host_len: usize,
    backlog: i32,
    port: u16,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct RequestConnect {
    opaque: usize,
    host_ptr: usize,
    host_len: usize,
    port: u16,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct RequestSend {
    id: i32,
    ptr: usize,
    len: usize,
    high: u8,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct RequestStart {
    id: i32,
    opaque: usize,
}

/// Rebuilds a boxed byte slice whose ownership crossed the pipe.
///
/// # Safety
///
/// `(ptr, len)` must come from `Box::into_raw` on the sending side, exactly
/// once per request.
unsafe fn rebuild_bytes(ptr: usize, len: usize) -> Box<[u8]> {
    Box::from_raw(ptr::slice_from_raw_parts_mut(ptr as *mut u8, len))
}

fn raw_parts(data: Box<[u8]>) -> (usize, usize) {
    let len = data.len();
    (Box::into_raw(data) as *mut u8 as usize, len)
}

struct PipeSender {
    fd: RawFd,
}

impl PipeSender {
    fn send_request<T: Copy>(&self, ty: u8, req: &T) -> Result<(), SocketError> {
        let len = mem::size_of::<T>();
        debug_assert!(len <= REQUEST_BODY_MAX);
        let mut buf = [0u8; 2 + REQUEST_BODY_MAX];
        buf[0] = ty;
        buf[1] = len as u8;
        // SAFETY: T is a fully initialized repr(C) request built over
        // zeroed memory; copying its object representation is defined.
        unsafe {
            ptr::copy_nonoverlapping((req as *const T).cast::<u8>(), buf[2..].as_mut_ptr(), len);
        }
        let total = 2 + len;
        // SAFETY: buf lives across the call; total < PIPE_BUF keeps the
        // write atomic.
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), total) };
        if n < 0 {
            return Err(SocketError::PipeWrite(io::Error::last_os_error()));
        }
        debug_assert_eq!(n as usize, total);
        Ok(())
    }
}

impl Drop for PipeSender {
    fn drop(&mut self) {
        // SAFETY: the write end is owned here and closed exactly once.
        unsafe { libc::close(self.fd) };
    }
}

/// Cloneable request-side handle to a [`SocketServer`].
///
/// Any thread may hold one; every method just frames a request onto the
/// reactor's pipe. Results come back asynchronously out of `poll` on the
/// reactor thread.
#[derive(Clone)]
pub struct ServerHandle {
    pipe: Arc<PipeSender>,
}

impl ServerHandle {
    /// Asynchronously opens a listener. Produces `Open` (or `Error`).
    pub fn listen(
        &self,
        host: &str,
        port: u16,
        backlog: i32,
        opaque: usize,
    ) -> Result<(), SocketError> {
        let (host_ptr, host_len) = raw_parts(host.as_bytes().to_vec().into_boxed_slice());
        // SAFETY: zeroed repr(C) POD; fields assigned below.
        let mut req: RequestListen = unsafe { mem::zeroed() };
        req.opaque = opaque;
        req.host_ptr = host_ptr;
        req.host_len = host_len;
        req.backlog = backlog;
        req.port = port;
        self.pipe.send_request(b'L', &req).inspect_err(|_| {
            // SAFETY: the request never reached the reactor; reclaim the
            // host buffer to avoid a leak.
            drop(unsafe { rebuild_bytes(host_ptr, host_len) });
        })
    }

    /// Asynchronously opens an outbound connection. Produces `Open`/`Error`.
    pub fn connect(&self, host: &str, port: u16, opaque: usize) -> Result<(), SocketError> {
        let (host_ptr, host_len) = raw_parts(host.as_bytes().to_vec().into_boxed_slice());
        // SAFETY: zeroed repr(C) POD; fields assigned below.
        let mut req: RequestConnect = unsafe { mem::zeroed() };
        req.opaque = opaque;
        req.host_ptr = host_ptr;
        req.host_len = host_len;
        req.port = port;
        self.pipe.send_request(b'C', &req).inspect_err(|_| {
            // SAFETY: ownership did not transfer; reclaim.
            drop(unsafe { rebuild_bytes(host_ptr, host_len) });
        })
    }

    /// Starts an accepted (or paused) socket: arms read, reports `Open`,
    /// and re-homes the socket to `opaque`.
    pub fn start(&self, id: i32, opaque: usize) -> Result<(), SocketError> {
        // SAFETY: zeroed repr(C) POD; fields assigned below.
        let mut req: RequestStart = unsafe { mem::zeroed() };
        req.id = id;
        req.opaque = opaque;
        self.pipe.send_request(b'S', &req)
    }

    /// Asynchronously closes one or both directions.
    pub fn close(&self, id: i32, mode: CloseMode, opaque: usize) -> Result<(), SocketError> {
        // SAFETY: zeroed repr(C) POD; fields assigned below.
        let mut req: RequestClose = unsafe { mem::zeroed() };
        req.id = id;
        req.what = mode.to_raw();
        req.opaque = opaque;
        self.pipe.send_request(b'X', &req)
    }

    /// Queues `data` on the high-priority write queue. Ownership transfers
    /// to the server.
    pub fn send_high(&self, id: i32, data: impl Into<Box<[u8]>>) -> Result<(), SocketError> {
        self.send_impl(id, data.into(), true)
    }

    /// Queues `data` on the low-priority (bulk) write queue.
    pub fn send_low(&self, id: i32, data: impl Into<Box<[u8]>>) -> Result<(), SocketError> {
        self.send_impl(id, data.into(), false)
    }

    fn send_impl(&self, id: i32, data: Box<[u8]>, high: bool) -> Result<(), SocketError> {
        let (ptr, len) = raw_parts(data);
        // SAFETY: zeroed repr(C) POD; fields assigned below.
        let mut req: RequestSend = unsafe { mem::zeroed() };
        req.id = id;
        req.ptr = ptr;
        req.len = len;
        req.high = u8::from(high);
        self.pipe.send_request(b'W', &req).inspect_err(|_| {
            // SAFETY: ownership did not transfer; reclaim.
            drop(unsafe { rebuild_bytes(ptr, len) });
        })
    }

    /// Asks the reactor loop to return `None` from its next poll.
    pub fn exit(&self) -> Result<(), SocketError> {
        self.pipe.send_request(b'Q', &0u8)
    }
}

enum Processed {
    Nothing,
    Message(SocketMessage),
    Exit,
}

enum DrainOutcome {
    /// The list emptied.
    Drained,
    /// The kernel buffer filled; come back on the next write event.
    Blocked,
    Failed(io::Error),
}

/// The single-threaded socket reactor.
///
/// Owned by the reactor thread, which loops on [`poll`](Self::poll); all
/// other threads interact through [`ServerHandle`]s.
pub struct SocketServer {
    poller: Poller,
    recv_ctrl: RawFd,
    handle: ServerHandle,
    /// Held to recover from `EMFILE` on accept (close, drain, re-reserve).
    reserved_fd: RawFd,
    alloc_cursor: u32,
    time_ms: u64,
    check_ctrl: bool,
    events: Box<[Event]>,
    ev_index: usize,
    ev_count: usize,
    slots: Box<[Socket]>,
}

impl SocketServer {
    /// Creates the reactor; `now_ms` seeds the statistics clock.
    pub fn new(now_ms: u64) -> Result<Self, SocketError> {
        let poller = Poller::new()?;
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds is a valid out-array of two fds.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(SocketError::last_os("pipe"));
        }
        let (recv_ctrl, send_ctrl) = (fds[0], fds[1]);
        if let Err(err) = poller.register(recv_ctrl, CTRL_TOKEN, true) {
            // SAFETY: both ends were just created and are unshared.
            unsafe {
                libc::close(recv_ctrl);
                libc::close(send_ctrl);
            }
            return Err(err);
        }
        // SAFETY: duplicating stdout cannot alias a managed socket.
        let reserved_fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
        let mut slots = Vec::with_capacity(SOCKET_ID_MAX);
        for id in 0..SOCKET_ID_MAX {
            slots.push(Socket::invalid(id as i32));
        }
        Ok(Self {
            poller,
            recv_ctrl,
            handle: ServerHandle {
                pipe: Arc::new(PipeSender { fd: send_ctrl }),
            },
            reserved_fd,
            alloc_cursor: 0,
            time_ms: now_ms,
            check_ctrl: true,
            events: vec![Event::default(); EVENT_MAX].into_boxed_slice(),
            ev_index: 0,
            ev_count: 0,
            slots: slots.into_boxed_slice(),
        })
    }

    /// A cloneable request handle for other threads.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Advances the coarse statistics clock.
    pub fn set_time(&mut self, now_ms: u64) {
        self.time_ms = now_ms;
    }

    /// Snapshot of a live socket's transfer statistics.
    pub fn stat(&self, id: i32) -> Option<SocketStat> {
        let slot = self.slots.get(id as usize)?;
        if slot.status == Status::Invalid || slot.status == Status::Reserve {
            return None;
        }
        Some(slot.stat)
    }

    // -- request conveniences (same framing as ServerHandle) --------------

    pub fn listen(&self, host: &str, port: u16, backlog: i32, opaque: usize) -> Result<(), SocketError> {
        self.handle.listen(host, port, backlog, opaque)
    }

    pub fn connect(&self, host: &str, port: u16, opaque: usize) -> Result<(), SocketError> {
        self.handle.connect(host, port, opaque)
    }

    pub fn start(&self, id: i32, opaque: usize) -> Result<(), SocketError> {
        self.handle.start(id, opaque)
    }

    pub fn close(&self, id: i32, mode: CloseMode, opaque: usize) -> Result<(), SocketError> {
        self.handle.close(id, mode, opaque)
    }

    pub fn send_high(&self, id: i32, data: impl Into<Box<[u8]>>) -> Result<(), SocketError> {
        self.handle.send_high(id, data)
    }

    pub fn send_low(&self, id: i32, data: impl Into<Box<[u8]>>) -> Result<(), SocketError> {
        self.handle.send_low(id, data)
    }

    // -- reactor loop ------------------------------------------------------

    /// Runs the reactor until it has one message to report.
    ///
    /// Blocks in the poller when idle (the control pipe is registered, so
    /// requests wake it). Returns `None` after an exit request; the server
    /// should then be dropped.
    pub fn poll(&mut self) -> Option<SocketMessage> {
        loop {
            if self.check_ctrl {
                if self.has_cmd() {
                    match self.process_cmd() {
                        Processed::Message(msg) => return Some(msg),
                        Processed::Exit => return None,
                        Processed::Nothing => {}
                    }
                    continue;
                }
                self.check_ctrl = false;
            }
            if self.ev_index == self.ev_count {
                match self.poller.wait(&mut self.events, -1) {
                    Ok(n) => {
                        self.ev_count = n;
                        self.ev_index = 0;
                        self.check_ctrl = true;
                    }
                    Err(err) => {
                        // EINTR and transient failures: retry the wait.
                        debug!(%err, "poller wait interrupted");
                    }
                }
                continue;
            }
            let ev = self.events[self.ev_index];
            if ev.token == CTRL_TOKEN {
                self.ev_index += 1;
                self.check_ctrl = true;
                continue;
            }
            let id = ev.token as usize & (SOCKET_ID_MAX - 1);
            if matches!(self.slots[id].status, Status::Invalid | Status::Reserve) {
                // Stale readiness for a slot already torn down.
                self.ev_index += 1;
                continue;
            }
            // Flags are consumed one at a time so that at most one message
            // leaves per handler; leftover flags resume on the next call.
            if ev.read {
                self.events[self.ev_index].read = false;
                let processed = if self.slots[id].status == Status::Listen {
                    self.handle_accept(id)
                } else {
                    self.handle_read(id)
                };
                if let Processed::Message(msg) = processed {
                    return Some(msg);
                }
                continue;
            }
            if ev.write {
                self.events[self.ev_index].write = false;
                if let Processed::Message(msg) = self.handle_write(id) {
                    return Some(msg);
                }
                continue;
            }
            if ev.eof {
                self.events[self.ev_index].eof = false;
                if let Processed::Message(msg) = self.handle_eof(id) {
                    return Some(msg);
                }
                continue;
            }
            if ev.error {
                self.events[self.ev_index].error = false;
                if let Processed::Message(msg) = self.handle_error(id) {
                    return Some(msg);
                }
                continue;
            }
            self.ev_index += 1;
        }
    }

    // -- control pipe ------------------------------------------------------

    /// Zero-timeout readability probe on the pipe's read end.
    fn has_cmd(&mut self) -> bool {
        // SAFETY: fd_set/timeval are plain out-parameters for select.
        unsafe {
            let mut rfds: libc::fd_set = mem::zeroed();
            libc::FD_ZERO(&mut rfds);
            libc::FD_SET(self.recv_ctrl, &mut rfds);
            let mut tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            libc::select(
                self.recv_ctrl + 1,
                &mut rfds,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut tv,
            ) > 0
        }
    }

    fn process_cmd(&mut self) -> Processed {
        let mut header = [0u8; 2];
        if let Err(err) = read_pipe(self.recv_ctrl, &mut header) {
            warn!(%err, "control pipe header read failed");
            return Processed::Nothing;
        }
        let (ty, len) = (header[0], header[1] as usize);
        let mut body = [0u8; REQUEST_BODY_MAX];
        if let Err(err) = read_pipe(self.recv_ctrl, &mut body[..len]) {
            warn!(%err, "control pipe body read failed");
            return Processed::Nothing;
        }
        match ty {
            b'X' => self.cmd_close(read_request::<RequestClose>(&body, len)),
            b'L' => self.cmd_listen(read_request::<RequestListen>(&body, len)),
            b'C' => self.cmd_connect(read_request::<RequestConnect>(&body, len)),
            b'W' => self.cmd_send(read_request::<RequestSend>(&body, len)),
            b'S' => self.cmd_start(read_request::<RequestStart>(&body, len)),
            b'Q' => Processed::Exit,
            other => {
                warn!(other, "unknown control request type");
                Processed::Nothing
            }
        }
    }

    fn cmd_listen(&mut self, req: RequestListen) -> Processed {
        // SAFETY: the sender transferred ownership of the host bytes.
        let host = unsafe { rebuild_bytes(req.host_ptr, req.host_len) };
        let host = String::from_utf8_lossy(&host).into_owned();
        match self.do_listen(&host, req.port, req.backlog, req.opaque) {
            Ok(id) => {
                let peer = self.slots[id as usize].peer.clone();
                Processed::Message(SocketMessage {
                    tag: SocketTag::Open,
                    id,
                    opaque: req.opaque,
                    ud: 0,
                    buffer: peer.map(|p| p.into_boxed_bytes()),
                })
            }
            Err(err) => {
                warn!(%err, %host, port = req.port, "listen failed");
                Processed::Message(SocketMessage {
                    tag: SocketTag::Error,
                    id: -1,
                    opaque: req.opaque,
                    ud: 0,
                    buffer: None,
                })
            }
        }
    }

    fn do_listen(
        &mut self,
        host: &str,
        port: u16,
        backlog: i32,
        opaque: usize,
    ) -> Result<i32, SocketError> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| SocketError::Syscall {
                op: "getaddrinfo",
                source: e,
            })?
            .collect();
        let (fd, bound) = open_listener(&addrs, backlog)?;
        let id = match self.reserve_id() {
            Some(id) => id,
            None => {
                // SAFETY: fd was created above and not yet installed.
                unsafe { libc::close(fd) };
                return Err(SocketError::IdExhausted);
            }
        };
        self.new_socket(id, fd, opaque, Status::Listen, true)?;
        self.slots[id as usize].peer = Some(bound.into_boxed_str());
        Ok(id)
    }

    fn cmd_connect(&mut self, req: RequestConnect) -> Processed {
        // SAFETY: the sender transferred ownership of the host bytes.
        let host = unsafe { rebuild_bytes(req.host_ptr, req.host_len) };
        let host = String::from_utf8_lossy(&host).into_owned();
        let error = |opaque| {
            Processed::Message(SocketMessage {
                tag: SocketTag::Error,
                id: -1,
                opaque,
                ud: 0,
                buffer: None,
            })
        };
        let addrs: Vec<SocketAddr> = match (host.as_str(), req.port).to_socket_addrs() {
            Ok(iter) => iter.collect(),
            Err(err) => {
                warn!(%err, %host, "connect resolution failed");
                return error(req.opaque);
            }
        };
        for addr in &addrs {
            match open_connection(addr) {
                Ok((fd, pending)) => {
                    let Some(id) = self.reserve_id() else {
                        // SAFETY: fd was created above and not yet installed.
                        unsafe { libc::close(fd) };
                        warn!("socket id space exhausted");
                        return error(req.opaque);
                    };
                    let status = if pending {
                        Status::Connecting
                    } else {
                        Status::Connected
                    };
                    if let Err(err) = self.new_socket(id, fd, req.opaque, status, !pending) {
                        warn!(%err, "connect install failed");
                        return error(req.opaque);
                    }
                    self.slots[id as usize].peer = Some(addr.to_string().into_boxed_str());
                    if pending {
                        // Completion (or failure) arrives as write readiness.
                        if let Err(err) = self.enable_write(id as usize, true) {
                            warn!(%err, "arming connect completion failed");
                            let _ = self.force_close(id as usize);
                            return error(req.opaque);
                        }
                        return Processed::Nothing;
                    }
                    let peer = self.slots[id as usize].peer.clone();
                    return Processed::Message(SocketMessage {
                        tag: SocketTag::Open,
                        id,
                        opaque: req.opaque,
                        ud: 0,
                        buffer: peer.map(|p| p.into_boxed_bytes()),
                    });
                }
                Err(err) => debug!(%err, %addr, "connect candidate failed"),
            }
        }
        warn!(%host, port = req.port, "all connect candidates failed");
        error(req.opaque)
    }

    fn cmd_send(&mut self, req: RequestSend) -> Processed {
        // SAFETY: the sender transferred ownership of the payload.
        let data = unsafe { rebuild_bytes(req.ptr, req.len) };
        let id = req.id as usize & (SOCKET_ID_MAX - 1);
        let slot = &mut self.slots[id];
        let writable = matches!(
            slot.status,
            Status::Connected | Status::Connecting | Status::Accept | Status::HalfCloseR
        ) && !slot.closing;
        if !writable {
            // Data on a dead or write-shut socket is an error to the owner;
            // the payload is discarded.
            return Processed::Message(SocketMessage {
                tag: SocketTag::Error,
                id: req.id,
                opaque: slot.opaque,
                ud: 0,
                buffer: None,
            });
        }
        slot.wb_size += data.len();
        let buf = WriteBuffer::new(data);
        if req.high != 0 {
            slot.high.push_tail(buf);
        } else {
            slot.low.push_tail(buf);
        }
        if let Err(err) = self.enable_write(id, true) {
            warn!(%err, id, "arming write readiness failed");
        }
        Processed::Nothing
    }

    fn cmd_start(&mut self, req: RequestStart) -> Processed {
        let id = req.id as usize & (SOCKET_ID_MAX - 1);
        let slot = &mut self.slots[id];
        if !matches!(slot.status, Status::Accept | Status::Connected) {
            return Processed::Message(SocketMessage {
                tag: SocketTag::Error,
                id: req.id,
                opaque: req.opaque,
                ud: 0,
                buffer: None,
            });
        }
        slot.status = Status::Connected;
        // Start re-homes the socket to the requesting service.
        slot.opaque = req.opaque;
        let peer = slot.peer.clone();
        if let Err(err) = self.enable_read(id, true) {
            warn!(%err, id, "arming read on start failed");
            let _ = self.force_close(id);
            return Processed::Message(SocketMessage {
                tag: SocketTag::Error,
                id: req.id,
                opaque: req.opaque,
                ud: 0,
                buffer: None,
            });
        }
        Processed::Message(SocketMessage {
            tag: SocketTag::Open,
            id: req.id,
            opaque: req.opaque,
            ud: 0,
            buffer: peer.map(|p| p.into_boxed_bytes()),
        })
    }

    fn cmd_close(&mut self, req: RequestClose) -> Processed {
        let id = req.id as usize & (SOCKET_ID_MAX - 1);
        let message = |tag| {
            Processed::Message(SocketMessage {
                tag,
                id: req.id,
                opaque: req.opaque,
                ud: 0,
                buffer: None,
            })
        };
        if self.slots[id].status == Status::Invalid {
            return message(SocketTag::Close);
        }
        match CloseMode::from_raw(req.what) {
            Some(CloseMode::Read) => {
                let slot = &mut self.slots[id];
                slot.status = Status::HalfCloseR;
                // SAFETY: fd is live (status was not Invalid/Reserve).
                unsafe { libc::shutdown(slot.fd, libc::SHUT_RD) };
                if let Err(err) = self.enable_read(id, false) {
                    warn!(%err, id, "disarming read on half-close failed");
                }
                message(SocketTag::Close)
            }
            Some(CloseMode::Write) => {
                let slot = &mut self.slots[id];
                if slot.high.is_empty() && slot.low.is_empty() {
                    slot.status = Status::HalfCloseW;
                    // SAFETY: fd is live.
                    unsafe { libc::shutdown(slot.fd, libc::SHUT_WR) };
                } else {
                    // Defer the FIN until the write queues drain.
                    slot.closing = true;
                }
                message(SocketTag::Close)
            }
            Some(CloseMode::Both) => {
                let tag = self.force_close(id);
                message(tag)
            }
            None => {
                warn!(what = req.what, "close request with bad mode");
                message(SocketTag::Error)
            }
        }
    }

    // -- event handlers ----------------------------------------------------

    fn handle_accept(&mut self, listen_id: usize) -> Processed {
        let (listen_fd, listen_opaque) = {
            let slot = &self.slots[listen_id];
            (slot.fd, slot.opaque)
        };
        let error = || {
            Processed::Message(SocketMessage {
                tag: SocketTag::Error,
                id: listen_id as i32,
                opaque: listen_opaque,
                ud: 0,
                buffer: None,
            })
        };
        // SAFETY: out-parameters are valid for the accept call.
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut ss_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                listen_fd,
                (&mut ss as *mut libc::sockaddr_storage).cast(),
                &mut ss_len,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => Processed::Nothing,
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    warn!(%err, "accept hit the fd limit; draining via reserved fd");
                    self.emfile_recover(listen_fd);
                    Processed::Nothing
                }
                _ => {
                    warn!(%err, "accept failed");
                    error()
                }
            };
        }
        let Some(id) = self.reserve_id() else {
            // SAFETY: the accepted fd is unshared.
            unsafe { libc::close(fd) };
            warn!("socket id space exhausted; dropping accepted connection");
            return error();
        };
        // Accepted sockets park read-disarmed until the owner starts them.
        if let Err(err) = self.new_socket(id, fd, listen_opaque, Status::Accept, false) {
            warn!(%err, "installing accepted socket failed");
            return error();
        }
        let peer = sockaddr_to_string(&ss).unwrap_or_default();
        self.slots[id as usize].peer = Some(peer.clone().into_boxed_str());
        Processed::Message(SocketMessage {
            tag: SocketTag::Accept,
            id: listen_id as i32,
            opaque: listen_opaque,
            ud: id as usize,
            buffer: Some(peer.into_bytes().into_boxed_slice()),
        })
    }

    fn handle_read(&mut self, id: usize) -> Processed {
        let (fd, opaque, size) = {
            let slot = &self.slots[id];
            if !matches!(slot.status, Status::Connected | Status::HalfCloseW) {
                return Processed::Nothing;
            }
            (slot.fd, slot.opaque, slot.min_read)
        };
        let mut buf = vec![0u8; size];
        // SAFETY: buf spans `size` writable bytes.
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), size, 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => Processed::Nothing,
                _ => {
                    warn!(%err, id, "recv failed");
                    let _ = self.force_close(id);
                    Processed::Message(SocketMessage {
                        tag: SocketTag::Error,
                        id: id as i32,
                        opaque,
                        ud: 0,
                        buffer: None,
                    })
                }
            };
        }
        if n == 0 {
            return self.handle_eof(id);
        }
        let n = n as usize;
        let time = self.time_ms;
        let slot = &mut self.slots[id];
        slot.stat.recv_bytes += n as u64;
        slot.stat.last_recv_ms = time;
        // Adaptive sizing: a full read doubles the next request; a read
        // under half shrinks it, never below the floor.
        if n == size {
            slot.min_read = size.saturating_mul(2);
        } else if size > MIN_READ && n * 2 < size {
            slot.min_read = (size / 2).max(MIN_READ);
        }
        buf.truncate(n);
        Processed::Message(SocketMessage {
            tag: SocketTag::Data,
            id: id as i32,
            opaque,
            ud: n,
            buffer: Some(buf.into_boxed_slice()),
        })
    }

    fn handle_write(&mut self, id: usize) -> Processed {
        if self.slots[id].status == Status::Connecting {
            return self.finish_connect(id);
        }
        let time = self.time_ms;
        let outcome = {
            let slot = &mut self.slots[id];
            if !slot.high.is_empty() {
                drain_list(slot.fd, &mut slot.high, &mut slot.wb_size, &mut slot.stat, time)
            } else if !slot.low.is_empty() {
                let outcome =
                    drain_list(slot.fd, &mut slot.low, &mut slot.wb_size, &mut slot.stat, time);
                // An interrupted low chunk must finish before anything
                // else: promote it to the head of the high queue.
                if slot.low.head_is_partial() {
                    let buf = slot.low.pop_head().expect("partial head exists");
                    slot.high.push_head(buf);
                }
                outcome
            } else {
                DrainOutcome::Drained
            }
        };
        match outcome {
            DrainOutcome::Failed(err) => {
                warn!(%err, id, "send failed");
                let opaque = self.slots[id].opaque;
                let _ = self.force_close(id);
                Processed::Message(SocketMessage {
                    tag: SocketTag::Error,
                    id: id as i32,
                    opaque,
                    ud: 0,
                    buffer: None,
                })
            }
            DrainOutcome::Drained | DrainOutcome::Blocked => {
                let (empty, closing, fd) = {
                    let slot = &self.slots[id];
                    (
                        slot.high.is_empty() && slot.low.is_empty(),
                        slot.closing,
                        slot.fd,
                    )
                };
                if empty {
                    if closing {
                        // Deferred half-close: queues drained, send the FIN.
                        let slot = &mut self.slots[id];
                        slot.closing = false;
                        slot.status = Status::HalfCloseW;
                        // SAFETY: fd is live.
                        unsafe { libc::shutdown(fd, libc::SHUT_WR) };
                    }
                    if let Err(err) = self.enable_write(id, false) {
                        warn!(%err, id, "disarming write readiness failed");
                    }
                }
                Processed::Nothing
            }
        }
    }

    fn finish_connect(&mut self, id: usize) -> Processed {
        let (fd, opaque) = {
            let slot = &self.slots[id];
            (slot.fd, slot.opaque)
        };
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: out-parameters are valid for getsockopt.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut err as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        if rc < 0 {
            err = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        }
        if err != 0 {
            warn!(
                err = %io::Error::from_raw_os_error(err),
                id,
                "connect completion failed"
            );
            let _ = self.force_close(id);
            return Processed::Message(SocketMessage {
                tag: SocketTag::Error,
                id: id as i32,
                opaque,
                ud: 0,
                buffer: None,
            });
        }
        self.slots[id].status = Status::Connected;
        if let Err(e) = self.enable_read(id, true) {
            warn!(%e, id, "arming read after connect failed");
        }
        let still_pending = !self.slots[id].high.is_empty() || !self.slots[id].low.is_empty();
        if !still_pending {
            let _ = self.enable_write(id, false);
        }
        let peer = self.slots[id].peer.clone();
        Processed::Message(SocketMessage {
            tag: SocketTag::Open,
            id: id as i32,
            opaque,
            ud: 0,
            buffer: peer.map(|p| p.into_boxed_bytes()),
        })
    }

    fn handle_eof(&mut self, id: usize) -> Processed {
        match self.slots[id].status {
            // A FIN on a socket already half-closed for read is consumed
            // silently.
            Status::HalfCloseR => Processed::Nothing,
            // Both directions are now shut; the socket is finished.
            Status::HalfCloseW => {
                let opaque = self.slots[id].opaque;
                let tag = self.force_close(id);
                Processed::Message(SocketMessage {
                    tag,
                    id: id as i32,
                    opaque,
                    ud: 0,
                    buffer: None,
                })
            }
            _ => {
                self.slots[id].status = Status::HalfCloseR;
                if let Err(err) = self.enable_read(id, false) {
                    warn!(%err, id, "disarming read on peer FIN failed");
                    let opaque = self.slots[id].opaque;
                    return Processed::Message(SocketMessage {
                        tag: SocketTag::Error,
                        id: id as i32,
                        opaque,
                        ud: 0,
                        buffer: None,
                    });
                }
                Processed::Nothing
            }
        }
    }

    fn handle_error(&mut self, id: usize) -> Processed {
        let (fd, opaque) = {
            let slot = &self.slots[id];
            (slot.fd, slot.opaque)
        };
        let mut soerr: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: out-parameters are valid for getsockopt.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut soerr as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        if rc < 0 || soerr == 0 {
            soerr = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        }
        warn!(err = %io::Error::from_raw_os_error(soerr), id, "socket error");
        let _ = self.force_close(id);
        Processed::Message(SocketMessage {
            tag: SocketTag::Error,
            id: id as i32,
            opaque,
            ud: 0,
            buffer: None,
        })
    }

    // -- slot management ---------------------------------------------------

    /// Claims the first `Invalid` slot after a monotonic cursor.
    fn reserve_id(&mut self) -> Option<i32> {
        for _ in 0..SOCKET_ID_MAX {
            self.alloc_cursor = self.alloc_cursor.wrapping_add(1);
            let id = self.alloc_cursor as usize & (SOCKET_ID_MAX - 1);
            let slot = &mut self.slots[id];
            if slot.status == Status::Invalid {
                slot.status = Status::Reserve;
                slot.id = id as i32;
                return Some(slot.id);
            }
        }
        None
    }

    /// Installs a live fd into a reserved slot and registers it with the
    /// poller.
    fn new_socket(
        &mut self,
        id: i32,
        fd: RawFd,
        opaque: usize,
        status: Status,
        arm_read: bool,
    ) -> Result<(), SocketError> {
        let index = id as usize;
        debug_assert_eq!(self.slots[index].status, Status::Reserve);
        set_nonblocking(fd)?;
        {
            let slot = &mut self.slots[index];
            slot.fd = fd;
            slot.opaque = opaque;
            slot.status = status;
            slot.read_enabled = arm_read;
            slot.write_enabled = false;
            slot.closing = false;
            slot.stat = SocketStat::default();
            slot.high = WriteList::new();
            slot.low = WriteList::new();
            slot.wb_size = 0;
            slot.min_read = MIN_READ;
            slot.peer = None;
        }
        if let Err(err) = self.poller.register(fd, id as u64, arm_read) {
            // SAFETY: fd is unshared; the slot never went live.
            unsafe { libc::close(fd) };
            self.slots[index].status = Status::Invalid;
            self.slots[index].fd = -1;
            return Err(err);
        }
        Ok(())
    }

    fn enable_read(&mut self, id: usize, on: bool) -> Result<(), SocketError> {
        let slot = &mut self.slots[id];
        if slot.read_enabled == on {
            return Ok(());
        }
        slot.read_enabled = on;
        self.poller
            .rearm(slot.fd, id as u64, on, slot.write_enabled)
    }

    fn enable_write(&mut self, id: usize, on: bool) -> Result<(), SocketError> {
        let slot = &mut self.slots[id];
        if slot.write_enabled == on {
            return Ok(());
        }
        slot.write_enabled = on;
        self.poller.rearm(slot.fd, id as u64, slot.read_enabled, on)
    }

    /// Tears a socket down completely.
    ///
    /// Returns [`SocketTag::Error`] iff unsent data was discarded, so the
    /// owner learns about the loss; [`SocketTag::Close`] otherwise.
    fn force_close(&mut self, id: usize) -> SocketTag {
        let fd = {
            let slot = &mut self.slots[id];
            if slot.status == Status::Invalid {
                return SocketTag::Close;
            }
            slot.closing = true;
            slot.fd
        };
        let discarded = {
            let slot = &mut self.slots[id];
            slot.high.clear() + slot.low.clear()
        };
        if let Err(err) = self.poller.deregister(fd) {
            debug!(%err, id, "poller deregister on close failed");
        }
        // SAFETY: fd belongs to this slot and is closed exactly once.
        unsafe { libc::close(fd) };
        let slot = &mut self.slots[id];
        slot.wb_size = 0;
        slot.min_read = MIN_READ;
        slot.read_enabled = false;
        slot.write_enabled = false;
        slot.status = Status::Invalid;
        slot.closing = false;
        slot.fd = -1;
        slot.peer = None;
        if discarded > 0 {
            SocketTag::Error
        } else {
            SocketTag::Close
        }
    }

    /// `EMFILE` recovery: free the reserved fd, accept-and-drop the head of
    /// the backlog, then re-reserve.
    fn emfile_recover(&mut self, listen_fd: RawFd) {
        // SAFETY: reserved_fd is owned here; the transient accept fd is
        // closed immediately.
        unsafe {
            if self.reserved_fd >= 0 {
                libc::close(self.reserved_fd);
                self.reserved_fd = -1;
            }
            let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());
            if fd >= 0 {
                libc::close(fd);
            }
            self.reserved_fd = libc::dup(libc::STDOUT_FILENO);
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        for id in 0..SOCKET_ID_MAX {
            if !matches!(self.slots[id].status, Status::Invalid | Status::Reserve) {
                let _ = self.force_close(id);
            }
        }
        // SAFETY: both fds are owned by the server and closed exactly once;
        // the pipe's write end closes with the last ServerHandle.
        unsafe {
            libc::close(self.recv_ctrl);
            if self.reserved_fd >= 0 {
                libc::close(self.reserved_fd);
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Syscall helpers
// -----------------------------------------------------------------------------

fn read_pipe(fd: RawFd, buf: &mut [u8]) -> Result<(), io::Error> {
    let mut got = 0;
    while got < buf.len() {
        // SAFETY: writing into the unfilled suffix of buf.
        let n = unsafe {
            libc::read(
                fd,
                buf[got..].as_mut_ptr().cast(),
                buf.len() - got,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control pipe closed",
            ));
        }
        got += n as usize;
    }
    Ok(())
}

fn read_request<T: Copy>(body: &[u8; REQUEST_BODY_MAX], len: usize) -> T {
    debug_assert_eq!(len, mem::size_of::<T>());
    // SAFETY: the sender wrote exactly size_of::<T>() initialized bytes of
    // a repr(C) request; unaligned read copies them out.
    unsafe { ptr::read_unaligned(body.as_ptr().cast::<T>()) }
}

fn set_nonblocking(fd: RawFd) -> Result<(), SocketError> {
    // SAFETY: plain fcntl on a live fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(SocketError::last_os("fcntl(F_GETFL)"));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(SocketError::last_os("fcntl(F_SETFL)"));
        }
    }
    Ok(())
}

fn open_listener(addrs: &[SocketAddr], backlog: i32) -> Result<(RawFd, String), SocketError> {
    let mut last = SocketError::Syscall {
        op: "getaddrinfo",
        source: io::Error::new(io::ErrorKind::NotFound, "no usable address"),
    };
    for addr in addrs {
        let family = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        // SAFETY: plain socket creation.
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            last = SocketError::last_os("socket");
            continue;
        }
        let one: libc::c_int = 1;
        // SAFETY: option value points at a live c_int.
        let opt_rc = unsafe {
            let a = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&one as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            let b = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                (&one as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            a.min(b)
        };
        if opt_rc < 0 {
            last = SocketError::last_os("setsockopt");
            // SAFETY: fd is unshared.
            unsafe { libc::close(fd) };
            continue;
        }
        let (ss, ss_len) = sockaddr_from(addr);
        // SAFETY: ss holds a valid sockaddr of ss_len bytes.
        if unsafe { libc::bind(fd, (&ss as *const libc::sockaddr_storage).cast(), ss_len) } < 0 {
            last = SocketError::last_os("bind");
            // SAFETY: fd is unshared.
            unsafe { libc::close(fd) };
            continue;
        }
        // SAFETY: fd is a bound stream socket.
        if unsafe { libc::listen(fd, backlog) } < 0 {
            last = SocketError::last_os("listen");
            // SAFETY: fd is unshared.
            unsafe { libc::close(fd) };
            continue;
        }
        // Report the actual bound address (the request may have used port 0).
        // SAFETY: out-parameters are valid for getsockname.
        let bound = unsafe {
            let mut ss: libc::sockaddr_storage = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            if libc::getsockname(fd, (&mut ss as *mut libc::sockaddr_storage).cast(), &mut len) == 0
            {
                sockaddr_to_string(&ss)
            } else {
                None
            }
        };
        return Ok((fd, bound.unwrap_or_else(|| addr.to_string())));
    }
    Err(last)
}

/// Opens a non-blocking connection; `true` in the result means completion
/// is pending on write readiness.
fn open_connection(addr: &SocketAddr) -> Result<(RawFd, bool), SocketError> {
    let family = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    // SAFETY: plain socket creation.
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(SocketError::last_os("socket"));
    }
    if let Err(err) = set_nonblocking(fd) {
        // SAFETY: fd is unshared.
        unsafe { libc::close(fd) };
        return Err(err);
    }
    let (ss, ss_len) = sockaddr_from(addr);
    // SAFETY: ss holds a valid sockaddr of ss_len bytes.
    let rc = unsafe { libc::connect(fd, (&ss as *const libc::sockaddr_storage).cast(), ss_len) };
    if rc == 0 {
        return Ok((fd, false));
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return Ok((fd, true));
    }
    // SAFETY: fd is unshared.
    unsafe { libc::close(fd) };
    Err(SocketError::Syscall {
        op: "connect",
        source: err,
    })
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: zeroed storage is a valid blank sockaddr container; the
    // family-specific struct is written over its prefix.
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_in fits inside sockaddr_storage.
            unsafe { ptr::write((&mut ss as *mut libc::sockaddr_storage).cast(), sin) };
            (ss, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sockaddr_in6 fits inside sockaddr_storage.
            unsafe { ptr::write((&mut ss as *mut libc::sockaddr_storage).cast(), sin6) };
            (ss, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to_string(ss: &libc::sockaddr_storage) -> Option<String> {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the family says the prefix is a sockaddr_in.
            let sin = unsafe { &*(ss as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(format!("{ip}:{}", u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            // SAFETY: the family says the prefix is a sockaddr_in6.
            let sin6 =
                unsafe { &*(ss as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(format!("[{ip}]:{}", u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// Sends as much of `list` as the kernel accepts, freeing drained chunks.
fn drain_list(
    fd: RawFd,
    list: &mut WriteList,
    wb_size: &mut usize,
    stat: &mut SocketStat,
    time_ms: u64,
) -> DrainOutcome {
    while let Some(head) = list.head_mut() {
        let chunk = head.remaining();
        // SAFETY: chunk borrows live buffer memory for the call.
        let n = unsafe { libc::send(fd, chunk.as_ptr().cast(), chunk.len(), libc::MSG_NOSIGNAL) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => DrainOutcome::Blocked,
                _ => DrainOutcome::Failed(err),
            };
        }
        let n = n as usize;
        stat.sent_bytes += n as u64;
        stat.last_sent_ms = time_ms;
        *wb_size -= n;
        head.advance(n);
        if head.is_done() {
            list.pop_head();
        } else {
            // Partial send: the kernel buffer is full.
            return DrainOutcome::Blocked;
        }
    }
    DrainOutcome::Drained
}
