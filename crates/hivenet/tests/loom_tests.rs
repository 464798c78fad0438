//! Loom model of the mailbox/run-queue link protocol.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! The real mailbox serializes its ring and `in_global` flag behind one
//! spinlock and links itself into the run queue on the empty→non-empty
//! transition; a worker clears the flag only when it observes the ring
//! empty. This model reproduces that protocol with loom mutexes so loom
//! can exhaustively check the schedule space for lost wakeups (a message
//! left in a mailbox that is neither queued nor claimed).

#![cfg(feature = "loom")]

use loom::sync::{Arc, Mutex};
use loom::thread;
use std::collections::VecDeque;

struct MailboxModel {
    ring: VecDeque<u32>,
    in_global: bool,
}

type Queue = Mutex<Vec<usize>>;

fn push(mb: &Mutex<MailboxModel>, q: &Queue, session: u32) {
    let needs_link = {
        let mut m = mb.lock().unwrap();
        m.ring.push_back(session);
        if m.in_global {
            false
        } else {
            m.in_global = true;
            true
        }
    };
    if needs_link {
        q.lock().unwrap().push(0);
    }
}

/// One worker visit: claim, pop one message, relink or clear the flag.
fn try_step(mb: &Mutex<MailboxModel>, q: &Queue, delivered: &mut Vec<u32>) -> bool {
    let claimed = {
        let mut q = q.lock().unwrap();
        if q.is_empty() {
            None
        } else {
            Some(q.remove(0))
        }
    };
    if claimed.is_none() {
        return false;
    }
    let msg = {
        let mut m = mb.lock().unwrap();
        match m.ring.pop_front() {
            Some(v) => Some(v),
            None => {
                m.in_global = false;
                None
            }
        }
    };
    if let Some(v) = msg {
        delivered.push(v);
        let relink = {
            let mut m = mb.lock().unwrap();
            if m.ring.is_empty() {
                m.in_global = false;
                false
            } else {
                true
            }
        };
        if relink {
            q.lock().unwrap().push(0);
        }
    }
    true
}

#[test]
fn loom_push_pop_no_lost_wakeup() {
    loom::model(|| {
        let mb = Arc::new(Mutex::new(MailboxModel {
            ring: VecDeque::new(),
            in_global: false,
        }));
        let q: Arc<Queue> = Arc::new(Mutex::new(Vec::new()));

        let pusher = {
            let mb = Arc::clone(&mb);
            let q = Arc::clone(&q);
            thread::spawn(move || {
                push(&mb, &q, 0);
                push(&mb, &q, 1);
            })
        };
        let worker = {
            let mb = Arc::clone(&mb);
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut delivered = Vec::new();
                for _ in 0..3 {
                    try_step(&mb, &q, &mut delivered);
                }
                delivered
            })
        };

        pusher.join().unwrap();
        let mut delivered = worker.join().unwrap();

        // Core invariant at quiescence: pending work is always reachable:
        // a non-empty ring implies the mailbox is linked in the queue.
        {
            let m = mb.lock().unwrap();
            if !m.ring.is_empty() {
                assert!(m.in_global, "lost wakeup: work pending but unlinked");
                assert!(!q.lock().unwrap().is_empty());
            }
        }

        // Drain whatever the concurrent worker left behind.
        while try_step(&mb, &q, &mut delivered) {}
        assert_eq!(delivered, vec![0, 1]);
        let m = mb.lock().unwrap();
        assert!(m.ring.is_empty());
        assert!(!m.in_global);
        assert!(q.lock().unwrap().is_empty());
    });
}
