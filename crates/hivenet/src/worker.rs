use crate::runtime::Shared;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long an idle worker parks before re-checking the run queue. Pushes
/// cut the wait short through the queue's condvar.
const IDLE_PARK: Duration = Duration::from_millis(1);

/// The fixed pool of bus worker threads.
pub(crate) struct WorkerPool {
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn start(shared: Arc<Shared>, count: usize) -> Self {
        let mut threads = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let thread = thread::Builder::new()
                .name(format!("hivenet-worker-{i}"))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn worker thread");
            threads.push(thread);
        }
        Self { threads }
    }

    pub(crate) fn join(&mut self) {
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

/// Pop a mailbox, run one message, requeue, and park briefly when the
/// queue runs dry.
fn worker_loop(shared: &Arc<Shared>) {
    while !shared.stop.load(Ordering::Acquire) {
        if !shared.step() {
            shared.queue.wait_brief(IDLE_PARK);
        }
    }
}
