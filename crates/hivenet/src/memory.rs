use crate::service::Handle;
use crossbeam_utils::CachePadded;
use std::alloc::{self, Layout};
use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

// =============================================================================
// COOKIE LAYOUT
// =============================================================================
//
// Every tracked allocation is preceded by a fixed 32-byte prefix:
//
//   base                                    user ptr
//   | size: usize | handle | tag | csize | pad | csize (unaligned) |
//   0             8        12    16      20    28                  32
//
// The trailing unaligned copy of the cookie size sits at `ptr - 4`, so the
// free path can locate the prefix without knowing the allocation's origin.
// The prefix is padded from 24 to 32 bytes so user pointers keep 16-byte
// alignment (this is what the explicit cookie-size field buys: the header
// may be over-aligned without changing the free path).
//
// =============================================================================

const TAG_ALLOCATED: u32 = 0xA110_CA7E;
const TAG_RELEASED: u32 = 0xF4EE_D0D0;

/// Prefix bytes in front of every user pointer.
const COOKIE_PREFIX: usize = 32;
const COOKIE_ALIGN: usize = 16;

/// Entries in the per-handle accounting table.
const SHARD_SLOTS: usize = 1 << 16;

#[repr(C)]
struct Cookie {
    size: usize,
    handle: u32,
    tag: u32,
    cookie_size: u32,
}

#[inline]
fn cookie_layout(size: usize) -> Layout {
    // Infallible for any size the bus hands out: prefix + size stays far
    // below isize::MAX before anything else blows up.
    Layout::from_size_align(COOKIE_PREFIX + size, COOKIE_ALIGN).expect("allocation too large")
}

/// Writes the cookie at `base` and returns the user pointer.
///
/// # Safety
///
/// `base` must point to at least `COOKIE_PREFIX + size` writable bytes with
/// `COOKIE_ALIGN` alignment.
unsafe fn fill_prefix(base: *mut u8, handle: u32, size: usize) -> *mut u8 {
    base.cast::<Cookie>().write(Cookie {
        size,
        handle,
        tag: TAG_ALLOCATED,
        cookie_size: COOKIE_PREFIX as u32,
    });
    let user = base.add(COOKIE_PREFIX);
    ptr::write_unaligned(user.sub(4).cast::<u32>(), COOKIE_PREFIX as u32);
    user
}

/// Validates and retires the cookie behind `user`, returning
/// `(base, size, handle)` for the deallocation and the ledger update.
///
/// Panics on a cookie whose tag is not `ALLOCATED`: that is a double free
/// or a stray pointer, and continuing would corrupt the heap.
///
/// # Safety
///
/// `user` must have been produced by [`fill_prefix`] and the allocation
/// must still be live.
unsafe fn clear_prefix(user: *mut u8) -> (*mut u8, usize, u32) {
    let cookie_size = ptr::read_unaligned(user.sub(4).cast::<u32>()) as usize;
    let base = user.sub(cookie_size);
    let cookie = &mut *base.cast::<Cookie>();
    assert!(
        cookie.tag == TAG_ALLOCATED,
        "bad memory cookie (tag {:#010x}): double free or corruption",
        cookie.tag
    );
    cookie.tag = TAG_RELEASED;
    (base, cookie.size, cookie.handle)
}

// -----------------------------------------------------------------------------
// Current service (thread-local)
// -----------------------------------------------------------------------------

thread_local! {
    static CURRENT_HANDLE: Cell<u32> = const { Cell::new(0) };
}

/// The handle of the service currently dispatching on this thread
/// ([`Handle::NONE`] outside a dispatch).
pub fn current_service() -> Handle {
    CURRENT_HANDLE.with(|c| Handle::from_raw(c.get()))
}

/// RAII scope tying this thread's allocations to a service.
///
/// Workers enter it immediately before invoking a service's dispatcher and
/// leave when the dispatch returns (drop order restores the outer value, so
/// nesting is harmless).
pub struct DispatchScope {
    prev: u32,
}

impl DispatchScope {
    /// Makes `handle` the thread's current service.
    pub fn enter(handle: Handle) -> Self {
        let prev = CURRENT_HANDLE.with(|c| c.replace(handle.raw()));
        Self { prev }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        CURRENT_HANDLE.with(|c| c.set(self.prev));
    }
}

// -----------------------------------------------------------------------------
// Ledger
// -----------------------------------------------------------------------------

struct Shard {
    handle: AtomicU32,
    allocated: AtomicUsize,
}

/// Process-wide memory accounting: global usage/block counters plus a
/// sharded per-handle table.
///
/// Constructed once at runtime bootstrap and shared by reference; there is
/// no hidden global. Per-handle attribution is best-effort by design: a
/// lost claim race or a hash collision with a live handle skips the shard
/// update for that call, never blocks it.
pub struct MemoryLedger {
    shards: Box<[Shard]>,
    usage: CachePadded<AtomicU64>,
    blocks: CachePadded<AtomicU64>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        let shards = (0..SHARD_SLOTS)
            .map(|_| Shard {
                handle: AtomicU32::new(0),
                allocated: AtomicUsize::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            usage: CachePadded::new(AtomicU64::new(0)),
            blocks: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Allocates `size` bytes attributed to the thread's current service.
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        self.alloc_for(current_service(), size)
    }

    /// Allocates `size` bytes attributed to an explicit handle.
    pub fn alloc_for(&self, handle: Handle, size: usize) -> NonNull<u8> {
        let layout = cookie_layout(size);
        // SAFETY: layout is non-zero-sized (the prefix alone is 32 bytes).
        let base = unsafe { alloc::alloc(layout) };
        if base.is_null() {
            alloc::handle_alloc_error(layout);
        }
        // SAFETY: base spans COOKIE_PREFIX + size bytes, 16-aligned.
        let user = unsafe { fill_prefix(base, handle.raw(), size) };
        self.note_alloc(handle.raw(), size);
        // SAFETY: user = base + COOKIE_PREFIX over a non-null block.
        unsafe { NonNull::new_unchecked(user) }
    }

    /// Frees an allocation made by this ledger.
    ///
    /// Attribution uses the cookie's handle, never the calling thread's
    /// current service; cross-thread frees stay balanced. Panics on a
    /// double free or corrupt cookie.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc`](Self::alloc)/[`alloc_for`](Self::alloc_for)
    /// on this ledger and must not have been freed before.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let (base, size, handle) = clear_prefix(ptr.as_ptr());
        self.note_free(handle, size);
        alloc::dealloc(base, cookie_layout(size));
    }

    /// Total live bytes across all services.
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    /// Total live allocations across all services.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Live bytes attributed to `handle` (zero if it never owned its shard).
    pub fn usage_of(&self, handle: Handle) -> usize {
        match self.shard_if_owned(handle.raw()) {
            Some(shard) => shard.allocated.load(Ordering::Relaxed),
            None => 0,
        }
    }

    /// Reads a live allocation's owner and that owner's ledger balance.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this ledger.
    pub unsafe fn allocation_info(&self, ptr: NonNull<u8>) -> (Handle, usize) {
        let cookie_size = ptr::read_unaligned(ptr.as_ptr().sub(4).cast::<u32>()) as usize;
        let cookie = &*ptr.as_ptr().sub(cookie_size).cast::<Cookie>();
        let handle = Handle::from_raw(cookie.handle);
        (handle, self.usage_of(handle))
    }

    fn note_alloc(&self, handle: u32, size: usize) {
        self.usage.fetch_add(size as u64, Ordering::Relaxed);
        self.blocks.fetch_add(1, Ordering::Relaxed);
        if let Some(shard) = self.shard_claiming(handle) {
            shard.allocated.fetch_add(size, Ordering::Relaxed);
        }
    }

    fn note_free(&self, handle: u32, size: usize) {
        self.usage.fetch_sub(size as u64, Ordering::Relaxed);
        self.blocks.fetch_sub(1, Ordering::Relaxed);
        if let Some(shard) = self.shard_if_owned(handle) {
            // Saturating: an alloc that lost the claim race was never added
            // here, so its free must not drive the balance negative.
            let _ = shard
                .allocated
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(size))
                });
        }
    }

    /// Resolves (or lazily claims) the shard for `handle`.
    ///
    /// A shard is claimable when unowned, or when its previous owner's
    /// balance has drained to zero (handle death reclaims the slot). The
    /// claim is a single CAS; losing it skips attribution for this call.
    fn shard_claiming(&self, handle: u32) -> Option<&Shard> {
        if handle == 0 {
            return None;
        }
        let shard = &self.shards[handle as usize & (SHARD_SLOTS - 1)];
        let owner = shard.handle.load(Ordering::Acquire);
        if owner != handle {
            if owner != 0 && shard.allocated.load(Ordering::Relaxed) != 0 {
                return None;
            }
            if shard
                .handle
                .compare_exchange(owner, handle, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }
        }
        Some(shard)
    }

    /// The shard for `handle`, only if `handle` currently owns it. The
    /// free path never claims.
    fn shard_if_owned(&self, handle: u32) -> Option<&Shard> {
        if handle == 0 {
            return None;
        }
        let shard = &self.shards[handle as usize & (SHARD_SLOTS - 1)];
        if shard.handle.load(Ordering::Acquire) == handle {
            Some(shard)
        } else {
            None
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(raw: u32) -> Handle {
        Handle::from_raw(raw)
    }

    #[test]
    fn test_basic_accounting() {
        let ledger = MemoryLedger::new();
        let p1 = ledger.alloc_for(h(1), 1024);
        let p2 = ledger.alloc_for(h(2), 512);
        let p3 = ledger.alloc_for(h(3), 1024);
        let p4 = ledger.alloc_for(h(4), 512);

        assert_eq!(ledger.blocks(), 4);
        assert_eq!(ledger.usage(), 1024 * 2 + 512 * 2);
        assert_eq!(ledger.usage_of(h(1)), 1024);
        assert_eq!(ledger.usage_of(h(2)), 512);

        unsafe {
            assert_eq!(ledger.allocation_info(p1), (h(1), 1024));
            assert_eq!(ledger.allocation_info(p4), (h(4), 512));
            ledger.free(p1);
            ledger.free(p2);
            ledger.free(p3);
            ledger.free(p4);
        }
        assert_eq!(ledger.blocks(), 0);
        assert_eq!(ledger.usage(), 0);
        assert_eq!(ledger.usage_of(h(3)), 0);
    }

    #[test]
    fn test_alloc_free_loop_returns_to_zero() {
        let ledger = MemoryLedger::new();
        for _ in 0..10_000 {
            let p1 = ledger.alloc_for(h(1), 1024);
            let p2 = ledger.alloc_for(h(2), 512);
            let p3 = ledger.alloc_for(h(3), 1024);
            let p4 = ledger.alloc_for(h(4), 512);
            assert_eq!(ledger.blocks(), 4);
            assert_eq!(ledger.usage(), 3072);
            unsafe {
                ledger.free(p1);
                ledger.free(p2);
                ledger.free(p3);
                ledger.free(p4);
            }
            assert_eq!(ledger.usage(), 0);
            assert_eq!(ledger.blocks(), 0);
        }
    }

    #[test]
    fn test_current_service_scope() {
        let ledger = MemoryLedger::new();
        assert_eq!(current_service(), Handle::NONE);
        let ptr;
        {
            let _scope = DispatchScope::enter(h(9));
            assert_eq!(current_service(), h(9));
            ptr = ledger.alloc(256);
        }
        assert_eq!(current_service(), Handle::NONE);
        assert_eq!(ledger.usage_of(h(9)), 256);
        unsafe { ledger.free(ptr) };
        assert_eq!(ledger.usage_of(h(9)), 0);
    }

    #[test]
    fn test_free_uses_cookie_handle_not_current() {
        let ledger = MemoryLedger::new();
        let ptr = ledger.alloc_for(h(5), 128);
        // Free under a different current service: the shard of handle 5
        // must still drain.
        let _scope = DispatchScope::enter(h(6));
        unsafe { ledger.free(ptr) };
        assert_eq!(ledger.usage_of(h(5)), 0);
        assert_eq!(ledger.usage(), 0);
    }

    #[test]
    fn test_clear_prefix_marks_released() {
        let ledger = MemoryLedger::new();
        let ptr = ledger.alloc_for(h(1), 64);
        unsafe {
            let (base, size, handle) = clear_prefix(ptr.as_ptr());
            assert_eq!((size, handle), (64, 1));
            let cookie = &*base.cast::<Cookie>();
            assert_eq!(cookie.tag, TAG_RELEASED);
            alloc::dealloc(base, cookie_layout(size));
        }
    }

    #[test]
    #[should_panic(expected = "bad memory cookie")]
    fn test_released_cookie_traps() {
        let ledger = MemoryLedger::new();
        let ptr = ledger.alloc_for(h(1), 64);
        // First retire is legitimate; the second must trap. The block is
        // intentionally not returned to the allocator so the probe stays
        // in-bounds.
        unsafe {
            let _ = clear_prefix(ptr.as_ptr());
            let _ = clear_prefix(ptr.as_ptr());
        }
    }

    #[test]
    fn test_shard_reclaim_after_drain() {
        let ledger = MemoryLedger::new();
        // Handles 7 and 7 + 2^16 collide in the shard table.
        let a = h(7);
        let b = h(7 + (SHARD_SLOTS as u32));
        let pa = ledger.alloc_for(a, 100);
        // While `a` holds a balance, `b` gets no attribution.
        let pb = ledger.alloc_for(b, 200);
        assert_eq!(ledger.usage_of(a), 100);
        assert_eq!(ledger.usage_of(b), 0);
        unsafe { ledger.free(pa) };
        // The shard drained; `b` may now claim it.
        let pb2 = ledger.alloc_for(b, 300);
        assert_eq!(ledger.usage_of(b), 300);
        unsafe {
            ledger.free(pb);
            ledger.free(pb2);
        }
        assert_eq!(ledger.usage_of(b), 0);
        assert_eq!(ledger.usage(), 0);
    }

    #[test]
    fn test_multithreaded_alloc_free() {
        use std::sync::Arc;
        use std::thread;

        let ledger = Arc::new(MemoryLedger::new());
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let ledger = Arc::clone(&ledger);
            handles.push(thread::spawn(move || {
                for i in 1..2_000u32 {
                    let ptr = ledger.alloc_for(h(t * 100_000 + i), (i as usize) * 4);
                    unsafe { ledger.free(ptr) };
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.usage(), 0);
        assert_eq!(ledger.blocks(), 0);
    }
}
