use crate::service::Handle;
use crate::SpinLock;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

/// Message kind tags, partitioning [`Message::kind`].
pub mod kind {
    /// Plain user payload.
    pub const TEXT: u32 = 0;
    /// Reply to a `session != 0` request.
    pub const RESPONSE: u32 = 1;
    /// Error notification addressed to the session originator.
    pub const ERROR: u32 = 2;
    /// Socket event injected by the reactor glue.
    pub const SOCKET: u32 = 3;
    /// Out-of-band signal (see the module contract's `signal` entry).
    pub const SIGNAL: u32 = 4;
}

/// A single bus message.
///
/// `session` pairs a request with its reply; zero means no reply is
/// expected. Payload ownership transfers to the callee on delivery; a
/// mailbox only drops payloads itself when drained through the release
/// hook.
#[derive(Debug)]
pub struct Message {
    /// Kind tag (see [`kind`]).
    pub kind: u32,
    /// Request/reply pairing id; zero = fire-and-forget.
    pub session: u32,
    /// Owned payload bytes, if any.
    pub payload: Option<Box<[u8]>>,
}

impl Message {
    /// Creates a message with an owned payload.
    pub fn new(kind: u32, session: u32, payload: impl Into<Box<[u8]>>) -> Self {
        Self {
            kind,
            session,
            payload: Some(payload.into()),
        }
    }

    /// Creates a payload-less control message.
    pub fn control(kind: u32, session: u32) -> Self {
        Self {
            kind,
            session,
            payload: None,
        }
    }

    /// Payload length in bytes (zero when absent).
    #[inline]
    pub fn size(&self) -> usize {
        self.payload.as_ref().map_or(0, |p| p.len())
    }
}

/// Initial ring capacity of a freshly created mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Sentinel for "not linked" in the intrusive run-queue chain.
pub(crate) const NIL_LINK: u32 = u32::MAX;

/// Outcome of a push, telling the caller whether it must link the mailbox
/// into the global run queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    /// The mailbox just became schedulable; the pusher must enqueue it.
    NeedsLink,
    /// Already linked (or claimed by a worker); nothing further to do.
    AlreadyQueued,
}

/// Per-service bounded ring of messages.
///
/// The ring indices, the `in_global` flag, and the dying mark all live
/// behind one per-mailbox spinlock, so the "became non-empty" and
/// "observed empty" transitions are atomic with respect to every producer
/// and the draining worker. The intrusive `next` link is the exception: it
/// is only touched while the run queue's own lock is held.
pub struct Mailbox {
    inner: SpinLock<Ring>,
    /// Run-queue chain link; guarded by the run-queue lock, not ours.
    next: AtomicU32,
}

struct Ring {
    /// Power-of-two slot buffer. Empty (capacity 0) when the mailbox is
    /// not attached to a live service.
    buf: Box<[MaybeUninit<Message>]>,
    /// Read index, always `< capacity`.
    head: u32,
    /// Write index, always `< capacity`. `head == tail` means empty.
    tail: u32,
    owner: Handle,
    in_global: bool,
    dying: bool,
}

impl Ring {
    #[inline]
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.buf.len() as u32 - 1
    }

    #[inline]
    fn len(&self) -> usize {
        if self.buf.is_empty() {
            return 0;
        }
        (self.tail.wrapping_sub(self.head) & self.mask()) as usize
    }

    /// Doubles the buffer, re-laying the ring out contiguously from slot 0.
    ///
    /// Only called at the wrap-full point (`tail == head` right after a
    /// write), so every one of the old `capacity` slots is initialized.
    fn grow(&mut self) {
        let cap = self.capacity();
        let mut grown = boxed_slots(cap * 2);
        for (i, slot) in grown.iter_mut().take(cap).enumerate() {
            let idx = (self.head as usize + i) & (cap - 1);
            // SAFETY: the ring is exactly full; all old slots hold messages.
            // Each is read out exactly once and its old slot never touched
            // again (head/tail are rewritten below).
            unsafe {
                slot.write(self.buf[idx].assume_init_read());
            }
        }
        self.buf = grown;
        self.head = 0;
        self.tail = cap as u32;
    }

    fn pop_one(&mut self) -> Option<Message> {
        if self.head == self.tail {
            return None;
        }
        let idx = self.head as usize;
        // SAFETY: head != tail, so buf[head] holds an initialized message;
        // advancing head transfers its ownership out of the ring.
        let msg = unsafe { self.buf[idx].assume_init_read() };
        self.head = (self.head + 1) & self.mask();
        Some(msg)
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        while let Some(msg) = self.pop_one() {
            drop(msg);
        }
    }
}

fn boxed_slots(capacity: usize) -> Box<[MaybeUninit<Message>]> {
    let mut buf = Vec::with_capacity(capacity);
    buf.resize_with(capacity, MaybeUninit::uninit);
    buf.into_boxed_slice()
}

impl Mailbox {
    /// Creates a detached mailbox (capacity 0, not attached to a service).
    pub(crate) fn detached() -> Self {
        Self {
            inner: SpinLock::new(Ring {
                buf: Box::new([]),
                head: 0,
                tail: 0,
                owner: Handle::NONE,
                in_global: false,
                dying: false,
            }),
            next: AtomicU32::new(NIL_LINK),
        }
    }

    /// Creates a mailbox for `owner` with the given initial ring capacity.
    ///
    /// `capacity` is rounded up to a power of two, minimum 2.
    pub fn create(owner: Handle, capacity: usize) -> Self {
        let mb = Self::detached();
        mb.attach(owner, capacity);
        mb
    }

    /// (Re)initializes a detached mailbox for a new occupant.
    pub(crate) fn attach(&self, owner: Handle, capacity: usize) {
        let capacity = capacity.max(2).next_power_of_two();
        let mut ring = self.inner.lock();
        debug_assert!(ring.buf.is_empty(), "attach over a live mailbox");
        ring.buf = boxed_slots(capacity);
        ring.head = 0;
        ring.tail = 0;
        ring.owner = owner;
        ring.in_global = false;
        ring.dying = false;
    }

    /// Enqueues `msg`, doubling the ring if the write filled it.
    ///
    /// Returns [`Pushed::NeedsLink`] iff this push flipped `in_global` from
    /// false to true; the caller then owns linking the mailbox into the run
    /// queue. A dying or detached mailbox refuses the message and hands it
    /// back.
    pub fn push(&self, msg: Message) -> Result<Pushed, Message> {
        let mut ring = self.inner.lock();
        if ring.dying || ring.buf.is_empty() {
            return Err(msg);
        }
        let idx = ring.tail as usize;
        ring.buf[idx].write(msg);
        ring.tail = (ring.tail + 1) & ring.mask();
        if ring.tail == ring.head {
            ring.grow();
        }
        if ring.in_global {
            Ok(Pushed::AlreadyQueued)
        } else {
            ring.in_global = true;
            Ok(Pushed::NeedsLink)
        }
    }

    /// Dequeues one message.
    ///
    /// Observing the ring empty clears `in_global` in the same critical
    /// section, so a concurrent pusher either sees the message consumed and
    /// the flag down (and relinks), or the flag still up (and skips).
    pub fn pop(&self) -> Option<Message> {
        let mut ring = self.inner.lock();
        match ring.pop_one() {
            Some(msg) => Some(msg),
            None => {
                ring.in_global = false;
                None
            }
        }
    }

    /// Called by a worker after dispatching one message: decides whether
    /// the mailbox goes back on the run queue.
    ///
    /// Returns `true` if still non-empty (caller relinks; `in_global` is
    /// already up from the claim); otherwise clears `in_global`.
    pub(crate) fn finish_visit(&self) -> bool {
        let mut ring = self.inner.lock();
        if ring.head == ring.tail {
            ring.in_global = false;
            false
        } else {
            true
        }
    }

    /// Marks the mailbox dying so further pushes bounce.
    ///
    /// Returns `true` if the mailbox is currently linked in the run queue
    /// (or claimed by a worker); reclamation must then be left to that
    /// worker.
    pub(crate) fn mark_dying(&self) -> bool {
        let mut ring = self.inner.lock();
        ring.dying = true;
        ring.in_global
    }

    pub(crate) fn is_dying(&self) -> bool {
        self.inner.lock().dying
    }

    /// Atomic snapshot for a worker whose claim just dissolved on an empty
    /// pop: reclaiming is only safe if the mailbox is dying *and* nobody
    /// relinked it in the meantime (a push that slipped in before the
    /// dying mark re-queued the mailbox, and that link's worker owns the
    /// teardown).
    pub(crate) fn dying_and_unlinked(&self) -> bool {
        let ring = self.inner.lock();
        ring.dying && !ring.in_global
    }

    /// Lowers `in_global` ahead of [`release`](Self::release).
    ///
    /// Only the thread holding the exclusive claim (the worker that popped
    /// this mailbox from the run queue, or the retirer of an unlinked
    /// mailbox) may call this, and only once the mailbox is dying so that
    /// no pusher can relink it afterwards.
    pub(crate) fn unlink_for_release(&self) {
        let mut ring = self.inner.lock();
        debug_assert!(ring.dying, "unlinking a live mailbox");
        ring.in_global = false;
    }

    /// Drains all pending messages through `hook` and frees the ring.
    ///
    /// Must only be called with `in_global == false`: the mailbox is
    /// neither linked nor claimed, so no worker can race the drain.
    pub fn release(&self, mut hook: Option<&mut dyn FnMut(Message)>) {
        let mut ring = self.inner.lock();
        assert!(!ring.in_global, "releasing a mailbox still on the run queue");
        while let Some(msg) = ring.pop_one() {
            if let Some(hook) = hook.as_deref_mut() {
                hook(msg);
            }
        }
        ring.buf = Box::new([]);
        ring.head = 0;
        ring.tail = 0;
        ring.owner = Handle::NONE;
        ring.dying = false;
    }

    /// Advisory queue length snapshot.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Advisory emptiness snapshot.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current ring capacity (0 when detached).
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// The owning service's handle ([`Handle::NONE`] when detached).
    pub fn owner(&self) -> Handle {
        self.inner.lock().owner
    }

    #[cfg(test)]
    pub(crate) fn in_global(&self) -> bool {
        self.inner.lock().in_global
    }

    // -- intrusive run-queue link -----------------------------------------
    // Relaxed suffices: every access happens inside the run queue's
    // spinlock critical section.

    pub(crate) fn link_next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_link_next(&self, next: u32) {
        self.next.store(next, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(n: u32) -> Message {
        Message::new(kind::TEXT, n, vec![n as u8])
    }

    #[test]
    fn test_push_pop_fifo() {
        let mb = Mailbox::create(Handle::from_parts(1, 0), 8);
        for i in 0..5 {
            mb.push(text(i)).unwrap();
        }
        for i in 0..5 {
            let msg = mb.pop().unwrap();
            assert_eq!(msg.session, i);
        }
        assert!(mb.pop().is_none());
    }

    #[test]
    fn test_first_push_needs_link() {
        let mb = Mailbox::create(Handle::from_parts(1, 0), 8);
        assert_eq!(mb.push(text(0)).unwrap(), Pushed::NeedsLink);
        assert_eq!(mb.push(text(1)).unwrap(), Pushed::AlreadyQueued);
        // Draining to empty lowers the flag; the next push must relink.
        mb.pop().unwrap();
        mb.pop().unwrap();
        assert!(mb.pop().is_none());
        assert_eq!(mb.push(text(2)).unwrap(), Pushed::NeedsLink);
    }

    #[test]
    fn test_ring_doubles_when_full() {
        let mb = Mailbox::create(Handle::from_parts(1, 0), 4);
        assert_eq!(mb.capacity(), 4);
        for i in 0..4 {
            mb.push(text(i)).unwrap();
        }
        // Writing the fourth message filled the ring and doubled it.
        assert_eq!(mb.capacity(), 8);
        assert_eq!(mb.len(), 4);
        for i in 0..4 {
            assert_eq!(mb.pop().unwrap().session, i);
        }
    }

    #[test]
    fn test_length_formula_across_wrap() {
        let mb = Mailbox::create(Handle::from_parts(1, 0), 8);
        for round in 0..10 {
            for i in 0..3 {
                mb.push(text(round * 3 + i)).unwrap();
            }
            assert_eq!(mb.len(), 3);
            for _ in 0..3 {
                mb.pop().unwrap();
            }
            assert_eq!(mb.len(), 0);
            assert!(mb.pop().is_none());
        }
    }

    #[test]
    fn test_release_drains_through_hook() {
        let mb = Mailbox::create(Handle::from_parts(1, 0), 8);
        for i in 0..3 {
            mb.push(text(i)).unwrap();
        }
        // The first push raised in_global; retiring a queued mailbox goes
        // through the worker claim, which resolves the link before release.
        assert!(mb.mark_dying());
        mb.unlink_for_release();
        let mut seen = Vec::new();
        let mut hook = |msg: Message| seen.push(msg.session);
        mb.release(Some(&mut hook));
        assert_eq!(seen, [0, 1, 2]);
        assert_eq!(mb.capacity(), 0);
    }

    #[test]
    fn test_dying_mailbox_bounces_pushes() {
        let mb = Mailbox::create(Handle::from_parts(1, 0), 8);
        assert!(!mb.mark_dying());
        let bounced = mb.push(text(1)).unwrap_err();
        assert_eq!(bounced.session, 1);
        mb.release(None);
    }

    #[test]
    fn test_release_after_drain() {
        let mb = Mailbox::create(Handle::from_parts(1, 0), 8);
        mb.push(text(1)).unwrap();
        mb.push(text(2)).unwrap();
        // Worker claims and drains to empty: flag drops.
        while mb.pop().is_some() {}
        assert!(!mb.in_global());
        let mut count = 0usize;
        let mut hook = |_msg: Message| count += 1;
        mb.release(Some(&mut hook));
        assert_eq!(count, 0);
        assert_eq!(mb.capacity(), 0);
        // Detached mailbox refuses messages.
        assert!(mb.push(text(3)).is_err());
    }
}
