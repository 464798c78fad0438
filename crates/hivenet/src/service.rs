use crate::error::BusError;
use crate::mailbox::{Mailbox, Message};
use crate::runtime::Context;
use crate::rwlock::{ReadGuard, RwLock};
use crate::SpinLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Bits of a handle that index the service slot table.
const INDEX_BITS: u32 = 16;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Maximum number of concurrently live services.
pub const MAX_SERVICES: usize = 1 << INDEX_BITS;

/// A 32-bit opaque service identifier.
///
/// Encodes `generation << 16 | slot_index`. Slots bump their generation on
/// release, so a handle held past its service's death resolves to nothing
/// instead of aliasing the slot's next occupant. Zero is never a valid
/// handle (generations skip zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// The null handle; names no service.
    pub const NONE: Handle = Handle(0);

    /// The raw 32-bit value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Reconstructs a handle from its raw value.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) fn from_parts(index: u32, generation: u32) -> Self {
        Self(generation << INDEX_BITS | (index & INDEX_MASK))
    }

    #[inline]
    pub(crate) fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    #[inline]
    pub(crate) fn generation(self) -> u32 {
        self.0 >> INDEX_BITS
    }
}

/// A unit of dispatch.
///
/// Exactly one worker runs a given service at any time: the run queue's pop
/// is the exclusive claim on its mailbox, and the slot hands the instance
/// out for the duration of a single dispatch.
pub trait Service: Send {
    /// Handles one message. May send further messages, including to itself.
    fn dispatch(&mut self, ctx: &Context<'_>, msg: Message);

    /// Receives an out-of-band signal (the module contract's `signal`).
    fn signal(&mut self, _signal: i32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Ready,
    Dispatching,
}

struct Cell {
    state: SlotState,
    service: Option<Box<dyn Service>>,
}

/// One slab entry: the mailbox plus the occupant service instance.
pub(crate) struct ServiceSlot {
    index: u32,
    /// Generation of the current occupant (pre-bumped while free).
    generation: AtomicU32,
    /// Fast liveness check for `resolve`; authoritative state is `cell`.
    live: AtomicBool,
    pub(crate) mailbox: Mailbox,
    cell: SpinLock<Cell>,
}

impl ServiceSlot {
    fn new(index: u32) -> Self {
        Self {
            index,
            generation: AtomicU32::new(1),
            live: AtomicBool::new(false),
            mailbox: Mailbox::detached(),
            cell: SpinLock::new(Cell {
                state: SlotState::Free,
                service: None,
            }),
        }
    }
}

/// The slab of service slots.
///
/// Grows on demand up to [`MAX_SERVICES`] and never shrinks, so a slot
/// index is a stable identity for the intrusive run-queue links.
pub(crate) struct ServiceTable {
    slots: RwLock<Vec<Arc<ServiceSlot>>>,
    free: SpinLock<Vec<u32>>,
}

impl ServiceTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: SpinLock::new(Vec::new()),
        }
    }

    /// Installs a service, returning its freshly minted handle.
    pub(crate) fn register(
        &self,
        service: Box<dyn Service>,
        mailbox_capacity: usize,
    ) -> Result<Handle, BusError> {
        let index = {
            let mut free = self.free.lock();
            match free.pop() {
                Some(index) => index,
                None => {
                    let mut slots = self.slots.write();
                    if slots.len() >= MAX_SERVICES {
                        return Err(BusError::TableFull { max: MAX_SERVICES });
                    }
                    let index = slots.len() as u32;
                    slots.push(Arc::new(ServiceSlot::new(index)));
                    index
                }
            }
        };
        let slot = self.slot(index);
        let generation = slot.generation.load(Ordering::Relaxed);
        let handle = Handle::from_parts(index, generation);
        slot.mailbox.attach(handle, mailbox_capacity);
        {
            let mut cell = slot.cell.lock();
            debug_assert_eq!(cell.state, SlotState::Free);
            cell.state = SlotState::Ready;
            cell.service = Some(service);
        }
        slot.live.store(true, Ordering::Release);
        Ok(handle)
    }

    /// Resolves a handle to its slot, rejecting stale generations.
    pub(crate) fn resolve(&self, handle: Handle) -> Result<Arc<ServiceSlot>, BusError> {
        let slots = self.slots.read();
        let slot = slots
            .get(handle.index() as usize)
            .ok_or(BusError::StaleHandle(handle.raw()))?;
        if !slot.live.load(Ordering::Acquire)
            || slot.generation.load(Ordering::Relaxed) != handle.generation()
        {
            return Err(BusError::StaleHandle(handle.raw()));
        }
        Ok(Arc::clone(slot))
    }

    /// Fetches a slot by index (for workers holding a run-queue claim).
    pub(crate) fn slot(&self, index: u32) -> Arc<ServiceSlot> {
        Arc::clone(&self.slots.read()[index as usize])
    }

    /// Shared view of the slab for run-queue link traversal.
    pub(crate) fn slots_read(&self) -> ReadGuard<'_, Vec<Arc<ServiceSlot>>> {
        self.slots.read()
    }

    /// Takes the service instance out for one dispatch.
    pub(crate) fn begin_dispatch(&self, slot: &ServiceSlot) -> Option<Box<dyn Service>> {
        let mut cell = slot.cell.lock();
        if cell.state != SlotState::Ready {
            return None;
        }
        cell.state = SlotState::Dispatching;
        cell.service.take()
    }

    /// Returns the instance after a dispatch.
    pub(crate) fn end_dispatch(&self, slot: &ServiceSlot, service: Box<dyn Service>) {
        let mut cell = slot.cell.lock();
        debug_assert_eq!(cell.state, SlotState::Dispatching);
        cell.state = SlotState::Ready;
        cell.service = Some(service);
    }

    /// Tears a dying service down: drops the instance, drains the mailbox
    /// through `hook`, bumps the generation, and returns the slot to the
    /// free list.
    ///
    /// The cell state arbitrates between a retiring caller and the worker
    /// holding the claim; exactly one of them reclaims. Returns `false`
    /// when this call lost that race (or the slot is mid-dispatch and the
    /// worker will finish the job).
    pub(crate) fn try_reclaim(
        &self,
        slot: &ServiceSlot,
        hook: Option<&mut dyn FnMut(Message)>,
    ) -> bool {
        debug_assert!(slot.mailbox.is_dying());
        let service = {
            let mut cell = slot.cell.lock();
            if cell.state != SlotState::Ready {
                return false;
            }
            cell.state = SlotState::Free;
            cell.service.take()
        };
        slot.live.store(false, Ordering::Release);
        drop(service);
        slot.mailbox.unlink_for_release();
        slot.mailbox.release(hook);
        let mut generation = (slot.generation.load(Ordering::Relaxed) + 1) & INDEX_MASK;
        if generation == 0 {
            generation = 1;
        }
        slot.generation.store(generation, Ordering::Relaxed);
        self.free.lock().push(slot.index);
        true
    }

    /// Number of slots ever created (live + free).
    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::kind;

    struct Sink;

    impl Service for Sink {
        fn dispatch(&mut self, _ctx: &Context<'_>, _msg: Message) {}
    }

    #[test]
    fn test_handle_parts_round_trip() {
        let h = Handle::from_parts(42, 7);
        assert_eq!(h.index(), 42);
        assert_eq!(h.generation(), 7);
        assert_ne!(h, Handle::NONE);
    }

    #[test]
    fn test_register_resolve() {
        let table = ServiceTable::new();
        let h = table.register(Box::new(Sink), 8).unwrap();
        assert!(table.resolve(h).is_ok());
        assert_eq!(table.resolve(h).unwrap().mailbox.owner(), h);
    }

    #[test]
    fn test_stale_handle_rejected_after_reclaim() {
        let table = ServiceTable::new();
        let h = table.register(Box::new(Sink), 8).unwrap();
        let slot = table.resolve(h).unwrap();
        assert!(!slot.mailbox.mark_dying());
        assert!(table.try_reclaim(&slot, None));
        assert!(matches!(table.resolve(h), Err(BusError::StaleHandle(_))));

        // The slot is reused with a new generation; the old handle still
        // resolves to nothing.
        let h2 = table.register(Box::new(Sink), 8).unwrap();
        assert_eq!(h2.index(), h.index());
        assert_ne!(h2, h);
        assert!(table.resolve(h).is_err());
        assert!(table.resolve(h2).is_ok());
        assert_eq!(table.slot_count(), 1);
    }

    #[test]
    fn test_reclaim_drains_pending() {
        let table = ServiceTable::new();
        let h = table.register(Box::new(Sink), 8).unwrap();
        let slot = table.resolve(h).unwrap();
        slot.mailbox
            .push(Message::new(kind::TEXT, 1, vec![1]))
            .unwrap();
        slot.mailbox.mark_dying();
        let mut dropped = 0usize;
        let mut hook = |_msg: Message| dropped += 1;
        assert!(table.try_reclaim(&slot, Some(&mut hook)));
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_dispatch_takes_instance_once() {
        let table = ServiceTable::new();
        let h = table.register(Box::new(Sink), 8).unwrap();
        let slot = table.resolve(h).unwrap();
        let svc = table.begin_dispatch(&slot).unwrap();
        assert!(table.begin_dispatch(&slot).is_none());
        table.end_dispatch(&slot, svc);
        assert!(table.begin_dispatch(&slot).is_some());
    }
}
