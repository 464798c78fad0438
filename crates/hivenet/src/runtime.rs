use crate::error::BusError;
use crate::mailbox::{kind, Message, Pushed, DEFAULT_MAILBOX_CAPACITY};
use crate::memory::{DispatchScope, MemoryLedger};
use crate::module::ModuleRegistry;
use crate::queue::RunQueue;
use crate::service::{Handle, Service, ServiceTable};
use crate::socket::{ServerHandle, SocketEvent, SocketServer};
use crate::worker::WorkerPool;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};

/// Runtime construction parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker thread count; zero picks the CPU count.
    pub workers: usize,
    /// Initial ring capacity for new mailboxes.
    pub mailbox_capacity: usize,
    /// Module search path template (`?` is the module name).
    pub module_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 0,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            module_path: "./?.so;./?/init.so".to_owned(),
        }
    }
}

/// Everything the workers, callers, and the reactor glue share.
pub(crate) struct Shared {
    pub(crate) table: ServiceTable,
    pub(crate) queue: RunQueue,
    pub(crate) ledger: Arc<MemoryLedger>,
    pub(crate) modules: ModuleRegistry,
    pub(crate) stop: AtomicBool,
    mailbox_capacity: usize,
}

impl Shared {
    pub(crate) fn spawn_service(&self, service: Box<dyn Service>) -> Result<Handle, BusError> {
        self.table.register(service, self.mailbox_capacity)
    }

    /// Delivers `msg` to `target`, linking its mailbox into the run queue
    /// on the empty→non-empty transition.
    pub(crate) fn send(&self, target: Handle, msg: Message) -> Result<(), BusError> {
        let slot = self.table.resolve(target)?;
        match slot.mailbox.push(msg) {
            Ok(Pushed::NeedsLink) => {
                self.queue.push(&self.table, target.index());
                Ok(())
            }
            Ok(Pushed::AlreadyQueued) => Ok(()),
            Err(_undelivered) => Err(BusError::ServiceDying(target.raw())),
        }
    }

    /// Marks a service dying. If its mailbox is unlinked and idle the slot
    /// is reclaimed on the spot; otherwise the worker holding (or about to
    /// take) the claim finishes the job.
    pub(crate) fn retire(&self, handle: Handle) -> Result<(), BusError> {
        let slot = self.table.resolve(handle)?;
        let queued = slot.mailbox.mark_dying();
        if !queued {
            self.table.try_reclaim(&slot, None);
        }
        Ok(())
    }

    /// One scheduler step: claim a mailbox, dispatch exactly one message,
    /// requeue if work remains. Returns `false` when the queue was empty.
    pub(crate) fn step(self: &Arc<Self>) -> bool {
        let Some(index) = self.queue.pop(&self.table) else {
            return false;
        };
        let slot = self.table.slot(index);
        if slot.mailbox.is_dying() {
            self.table.try_reclaim(&slot, None);
            return true;
        }
        let Some(msg) = slot.mailbox.pop() else {
            // Drained between link and claim; the claim dissolved with the
            // in_global flag. A retire racing that window is ours to
            // finish, unless a push already relinked the mailbox; then
            // the next claim's worker owns the teardown.
            if slot.mailbox.dying_and_unlinked() {
                self.table.try_reclaim(&slot, None);
            }
            return true;
        };
        let handle = slot.mailbox.owner();
        let Some(mut service) = self.table.begin_dispatch(&slot) else {
            // The slot was reclaimed under us; the message goes down with it.
            return true;
        };
        let outcome = {
            let _scope = DispatchScope::enter(handle);
            let ctx = Context {
                shared: self,
                handle,
            };
            panic::catch_unwind(AssertUnwindSafe(|| {
                // Signals bypass the normal dispatcher (the module
                // contract's out-of-band entry); the session carries the
                // signal number.
                if msg.kind == kind::SIGNAL {
                    service.signal(msg.session as i32);
                } else {
                    service.dispatch(&ctx, msg);
                }
            }))
        };
        self.table.end_dispatch(&slot, service);
        if let Err(payload) = outcome {
            error!(
                handle = handle.raw(),
                "service dispatch panicked; terminating service"
            );
            drop(payload);
            slot.mailbox.mark_dying();
            self.table.try_reclaim(&slot, None);
            return true;
        }
        if slot.mailbox.is_dying() {
            self.table.try_reclaim(&slot, None);
        } else if slot.mailbox.finish_visit() {
            self.queue.push(&self.table, index);
        }
        true
    }
}

/// Per-dispatch view handed to a service.
pub struct Context<'a> {
    shared: &'a Arc<Shared>,
    handle: Handle,
}

impl Context<'_> {
    /// The dispatched service's own handle.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Sends a message to another service (or to self).
    pub fn send(&self, target: Handle, msg: Message) -> Result<(), BusError> {
        self.shared.send(target, msg)
    }

    /// Spawns a sibling service.
    pub fn spawn(&self, service: Box<dyn Service>) -> Result<Handle, BusError> {
        self.shared.spawn_service(service)
    }

    /// Retires a service; retiring self defers teardown to the end of this
    /// dispatch.
    pub fn retire(&self, handle: Handle) -> Result<(), BusError> {
        self.shared.retire(handle)
    }

    /// The runtime's memory ledger.
    pub fn ledger(&self) -> &MemoryLedger {
        &self.shared.ledger
    }

    /// The dynamic module registry.
    pub fn modules(&self) -> &ModuleRegistry {
        &self.shared.modules
    }
}

/// The assembled runtime: service table, run queue, worker pool, ledger,
/// module registry, and (optionally) a socket reactor thread.
pub struct Runtime {
    shared: Arc<Shared>,
    workers: WorkerPool,
    reactor: Option<(ServerHandle, thread::JoinHandle<()>)>,
}

impl Runtime {
    /// Boots the runtime and its worker pool.
    pub fn new(config: Config) -> Self {
        let worker_count = if config.workers == 0 {
            num_cpus::get()
        } else {
            config.workers
        };
        let shared = Arc::new(Shared {
            table: ServiceTable::new(),
            queue: RunQueue::new(),
            ledger: Arc::new(MemoryLedger::new()),
            modules: ModuleRegistry::new(config.module_path),
            stop: AtomicBool::new(false),
            mailbox_capacity: config.mailbox_capacity,
        });
        let workers = WorkerPool::start(Arc::clone(&shared), worker_count);
        Self {
            shared,
            workers,
            reactor: None,
        }
    }

    /// Spawns a service, returning its handle.
    pub fn spawn(&self, service: Box<dyn Service>) -> Result<Handle, BusError> {
        self.shared.spawn_service(service)
    }

    /// Sends a message from outside any service.
    pub fn send(&self, target: Handle, msg: Message) -> Result<(), BusError> {
        self.shared.send(target, msg)
    }

    /// Retires a service.
    pub fn retire(&self, handle: Handle) -> Result<(), BusError> {
        self.shared.retire(handle)
    }

    /// The runtime's memory ledger.
    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.shared.ledger
    }

    /// The dynamic module registry.
    pub fn modules(&self) -> &ModuleRegistry {
        &self.shared.modules
    }

    /// Takes ownership of a socket server and drives it on a dedicated
    /// reactor thread. Polled messages are re-dispatched to the owning
    /// service (the request's `opaque` is the owner's raw handle) as
    /// [`kind::SOCKET`] bus messages carrying an encoded [`SocketEvent`].
    pub fn attach_reactor(&mut self, server: SocketServer) -> io::Result<ServerHandle> {
        let handle = server.handle();
        let shared = Arc::clone(&self.shared);
        let join = thread::Builder::new()
            .name("hivenet-reactor".to_owned())
            .spawn(move || reactor_loop(server, &shared))?;
        self.reactor = Some((handle.clone(), join));
        Ok(handle)
    }

    /// Stops the reactor and the worker pool, then joins them.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some((handle, join)) = self.reactor.take() {
            let _ = handle.exit();
            let _ = join.join();
        }
        self.shared.stop.store(true, Ordering::Release);
        self.shared.queue.wake_all();
        self.workers.join();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn reactor_loop(mut server: SocketServer, shared: &Arc<Shared>) {
    while let Some(msg) = server.poll() {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let owner = Handle::from_raw(msg.opaque as u32);
        let payload = SocketEvent::from_message(msg).encode();
        if let Err(err) = shared.send(owner, Message::new(kind::SOCKET, 0, payload)) {
            debug!(%err, owner = owner.raw(), "dropping socket event for dead service");
        }
    }
}
