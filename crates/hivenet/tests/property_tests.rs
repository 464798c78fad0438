//! Property tests for the mailbox ring and the memory ledger.
//!
//! The mailbox is driven against a queue model; the ledger against running
//! per-handle sums.

use hivenet::{kind, Handle, Mailbox, MemoryLedger, Message};
use proptest::prelude::*;
use std::collections::{HashMap, VecDeque};

proptest! {
    /// Pops return exactly the pushed messages, in order, and the length
    /// snapshot tracks the model after every operation.
    #[test]
    fn prop_mailbox_fifo_conservation(ops in prop::collection::vec(any::<bool>(), 1..200)) {
        let mb = Mailbox::create(Handle::from_raw(1), 4);
        let mut model: VecDeque<u32> = VecDeque::new();
        let mut next = 0u32;
        for push in ops {
            if push {
                mb.push(Message::new(kind::TEXT, next, Vec::<u8>::new())).unwrap();
                model.push_back(next);
                next += 1;
            } else {
                match (mb.pop(), model.pop_front()) {
                    (Some(msg), Some(expect)) => prop_assert_eq!(msg.session, expect),
                    (None, None) => {}
                    (got, want) => prop_assert!(
                        false,
                        "model divergence: got {:?} want {:?}",
                        got.map(|m| m.session),
                        want
                    ),
                }
            }
            prop_assert_eq!(mb.len(), model.len());
            // The ring doubles at the wrap-full point, so the live count
            // always stays strictly under the capacity.
            prop_assert!(mb.len() < mb.capacity());
        }
        while let Some(expect) = model.pop_front() {
            prop_assert_eq!(mb.pop().unwrap().session, expect);
        }
        prop_assert!(mb.pop().is_none());
    }

    /// Growth preserves contents: fill to force repeated doubling, then
    /// drain and compare.
    #[test]
    fn prop_mailbox_growth_preserves_order(count in 1usize..600) {
        let mb = Mailbox::create(Handle::from_raw(1), 4);
        for i in 0..count {
            mb.push(Message::control(kind::TEXT, i as u32)).unwrap();
        }
        prop_assert_eq!(mb.len(), count);
        for i in 0..count {
            prop_assert_eq!(mb.pop().unwrap().session, i as u32);
        }
        prop_assert!(mb.pop().is_none());
    }

    /// Global usage equals the sum of live sizes, block count equals the
    /// number of live allocations, and every handle's shard balance equals
    /// the sum of its live sizes.
    #[test]
    fn prop_ledger_balances(allocs in prop::collection::vec((1u32..9, 1usize..2048), 1..64)) {
        let ledger = MemoryLedger::new();
        let mut live = Vec::new();
        let mut per_handle: HashMap<u32, usize> = HashMap::new();
        for (h, size) in allocs {
            let ptr = ledger.alloc_for(Handle::from_raw(h), size);
            live.push((ptr, size));
            *per_handle.entry(h).or_default() += size;
        }
        prop_assert_eq!(ledger.blocks() as usize, live.len());
        let total: usize = live.iter().map(|(_, size)| *size).sum();
        prop_assert_eq!(ledger.usage() as usize, total);
        for (&h, &sum) in &per_handle {
            prop_assert_eq!(ledger.usage_of(Handle::from_raw(h)), sum);
        }
        for (ptr, _) in live {
            // SAFETY: each pointer came from this ledger and is freed once.
            unsafe { ledger.free(ptr) };
        }
        prop_assert_eq!(ledger.usage(), 0);
        prop_assert_eq!(ledger.blocks(), 0);
        for &h in per_handle.keys() {
            prop_assert_eq!(ledger.usage_of(Handle::from_raw(h)), 0);
        }
    }
}
