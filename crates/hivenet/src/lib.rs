//! hivenet - A Lightweight Actor Runtime
//!
//! Many independent services each own a ring-buffer mailbox; a fixed pool
//! of worker threads cooperatively drains mailboxes through a global FIFO
//! run queue; one dedicated thread multiplexes non-blocking TCP sockets
//! and injects readiness back into services as ordinary messages.
//!
//! # Architecture
//!
//! - **Message bus**: per-service bounded ring mailboxes (auto-doubling)
//!   chained into one intrusive FIFO of "mailboxes with work". A worker
//!   claims a mailbox, dispatches exactly one message, and relinks it if
//!   work remains, giving round-robin fairness across busy services.
//! - **Memory ledger**: a cookie header in front of every tracked
//!   allocation attributes it to the dispatching service; lock-free
//!   sharded counters expose per-service and global usage.
//! - **Socket reactor**: a single-threaded poll loop over epoll plus a
//!   self-pipe request protocol, so any thread can drive network I/O
//!   without touching reactor state.
//!
//! # Example
//!
//! ```
//! use hivenet::{kind, Config, Context, Message, Runtime, Service};
//!
//! struct Echo;
//!
//! impl Service for Echo {
//!     fn dispatch(&mut self, ctx: &Context<'_>, msg: Message) {
//!         if msg.session != 0 {
//!             // Reply to the requester named by the session convention
//!             // of the caller; here we just observe the payload.
//!             let _ = (ctx.handle(), msg.size());
//!         }
//!     }
//! }
//!
//! let runtime = Runtime::new(Config {
//!     workers: 2,
//!     ..Config::default()
//! });
//! let echo = runtime.spawn(Box::new(Echo)).unwrap();
//! runtime
//!     .send(echo, Message::new(kind::TEXT, 1, b"hello".to_vec()))
//!     .unwrap();
//! runtime.shutdown();
//! ```

mod backoff;
mod error;
mod mailbox;
mod memory;
mod module;
mod poller;
mod queue;
mod runtime;
mod rwlock;
mod service;
mod socket;
mod spin;
mod worker;
mod write_list;

pub use backoff::Backoff;
pub use error::{BusError, ModuleError, SocketError};
pub use mailbox::{kind, Mailbox, Message, Pushed, DEFAULT_MAILBOX_CAPACITY};
pub use memory::{current_service, DispatchScope, MemoryLedger};
pub use module::{CreateFn, FreeFn, InitFn, Module, ModuleRegistry, SignalFn, MAX_MODULES};
pub use runtime::{Config, Context, Runtime};
pub use rwlock::{ReadGuard, RwLock, WriteGuard};
pub use service::{Handle, Service, MAX_SERVICES};
pub use socket::{
    CloseMode, ServerHandle, SocketEvent, SocketMessage, SocketServer, SocketStat, SocketTag,
    SOCKET_ID_MAX,
};
pub use spin::{SpinGuard, SpinLock};
