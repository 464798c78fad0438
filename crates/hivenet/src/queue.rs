use crate::mailbox::NIL_LINK;
use crate::service::ServiceTable;
use crate::SpinLock;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// The global FIFO of mailboxes with pending work.
///
/// Intrusive: the chain's `next` links live in the mailboxes themselves
/// (see [`crate::mailbox::Mailbox`]); the queue holds only head/tail slot
/// indices under one spinlock, held just for the list splice. A separate
/// mutex/condvar pair is the workers' sleep gate; it never guards queue
/// state.
pub(crate) struct RunQueue {
    links: SpinLock<Links>,
    gate: Mutex<()>,
    wake: Condvar,
}

struct Links {
    head: u32,
    tail: u32,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            links: SpinLock::new(Links {
                head: NIL_LINK,
                tail: NIL_LINK,
            }),
            gate: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// Links `index` at the tail and wakes one idle worker.
    ///
    /// Callers only push after winning the mailbox's empty→non-empty
    /// transition (or while holding the worker claim), so an index is in
    /// the queue at most once.
    pub(crate) fn push(&self, table: &ServiceTable, index: u32) {
        let slots = table.slots_read();
        {
            let mut q = self.links.lock();
            slots[index as usize].mailbox.set_link_next(NIL_LINK);
            if q.tail == NIL_LINK {
                debug_assert_eq!(q.head, NIL_LINK);
                q.head = index;
            } else {
                slots[q.tail as usize].mailbox.set_link_next(index);
            }
            q.tail = index;
        }
        drop(slots);
        self.wake.notify_one();
    }

    /// Unlinks and returns the head mailbox's slot index.
    pub(crate) fn pop(&self, table: &ServiceTable) -> Option<u32> {
        let slots = table.slots_read();
        let mut q = self.links.lock();
        if q.head == NIL_LINK {
            debug_assert_eq!(q.tail, NIL_LINK);
            return None;
        }
        let index = q.head;
        let mailbox = &slots[index as usize].mailbox;
        q.head = mailbox.link_next();
        if q.head == NIL_LINK {
            q.tail = NIL_LINK;
        }
        mailbox.set_link_next(NIL_LINK);
        Some(index)
    }

    /// Parks the calling worker until a push arrives or `timeout` passes.
    pub(crate) fn wait_brief(&self, timeout: Duration) {
        let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self
            .wake
            .wait_timeout(gate, timeout)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Wakes every parked worker (shutdown).
    pub(crate) fn wake_all(&self) {
        self.wake.notify_all();
    }

    /// True if `index` is currently linked (test support; racy otherwise).
    #[cfg(test)]
    fn contains(&self, table: &ServiceTable, index: u32) -> (bool, usize) {
        let slots = table.slots_read();
        let q = self.links.lock();
        let mut seen = 0;
        let mut cursor = q.head;
        while cursor != NIL_LINK {
            if cursor == index {
                seen += 1;
            }
            cursor = slots[cursor as usize].mailbox.link_next();
        }
        (seen > 0, seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{kind, Message, Pushed};
    use crate::runtime::Context;
    use crate::service::Service;

    struct Sink;

    impl Service for Sink {
        fn dispatch(&mut self, _ctx: &Context<'_>, _msg: Message) {}
    }

    fn setup(n: usize) -> (ServiceTable, Vec<u32>) {
        let table = ServiceTable::new();
        let mut indices = Vec::new();
        for _ in 0..n {
            let h = table.register(Box::new(Sink), 8).unwrap();
            indices.push(h.index());
        }
        (table, indices)
    }

    #[test]
    fn test_fifo_order() {
        let (table, idx) = setup(3);
        let q = RunQueue::new();
        for &i in &idx {
            q.push(&table, i);
        }
        assert_eq!(q.pop(&table), Some(idx[0]));
        assert_eq!(q.pop(&table), Some(idx[1]));
        assert_eq!(q.pop(&table), Some(idx[2]));
        assert_eq!(q.pop(&table), None);
    }

    #[test]
    fn test_membership_matches_in_global() {
        let (table, idx) = setup(2);
        let q = RunQueue::new();
        let slot = table.slot(idx[0]);

        // Push raises the flag exactly once and the pusher links once.
        let msg = Message::new(kind::TEXT, 1, vec![0]);
        assert_eq!(slot.mailbox.push(msg).unwrap(), Pushed::NeedsLink);
        q.push(&table, idx[0]);
        let (linked, count) = q.contains(&table, idx[0]);
        assert!(linked && count == 1);
        assert!(slot.mailbox.in_global());

        // Second push must not duplicate the link.
        let msg = Message::new(kind::TEXT, 2, vec![0]);
        assert_eq!(slot.mailbox.push(msg).unwrap(), Pushed::AlreadyQueued);
        let (_, count) = q.contains(&table, idx[0]);
        assert_eq!(count, 1);

        // Claim, drain, observe the flag fall with the unlink.
        let claimed = q.pop(&table).unwrap();
        assert_eq!(claimed, idx[0]);
        while slot.mailbox.pop().is_some() {}
        assert!(!slot.mailbox.in_global());
        let (linked, _) = q.contains(&table, idx[0]);
        assert!(!linked);
    }

    #[test]
    fn test_interleaved_push_pop() {
        let (table, idx) = setup(4);
        let q = RunQueue::new();
        q.push(&table, idx[0]);
        q.push(&table, idx[1]);
        assert_eq!(q.pop(&table), Some(idx[0]));
        q.push(&table, idx[2]);
        q.push(&table, idx[3]);
        assert_eq!(q.pop(&table), Some(idx[1]));
        assert_eq!(q.pop(&table), Some(idx[2]));
        q.push(&table, idx[0]);
        assert_eq!(q.pop(&table), Some(idx[3]));
        assert_eq!(q.pop(&table), Some(idx[0]));
        assert_eq!(q.pop(&table), None);
    }
}
