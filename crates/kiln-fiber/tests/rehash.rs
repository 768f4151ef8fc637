use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_fiber::{BlockCache, FiberConfig};
use kiln_gen::translate_block;
use kiln_mem::{AddressSpace, PageFlags, Tlb};
use proptest::prelude::*;

/// Four pages of `ret`, so every address starts a one-byte block.
fn ret_sled() -> Arc<AddressSpace> {
    let space = Arc::new(AddressSpace::new());
    space.map(0x1, 4, PageFlags::RX).unwrap();
    space.write_bytes(0x1000, &[0xc3; 0x4000]).unwrap();
    space
}

fn expected_hash_size(initial: usize, blocks: usize) -> usize {
    let mut size = initial;
    for live in 1..=blocks {
        if live >= size * 2 {
            size *= 2;
        }
    }
    size
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn resizing_keeps_every_block(
        addrs in prop::collection::btree_set(0x1000u32..0x5000, 1..300),
        shift in 0u32..5,
    ) {
        let initial = 1usize << shift;
        let cache = BlockCache::new(ret_sled(), FiberConfig {
            initial_hash_size: initial,
            ..FiberConfig::default()
        }).unwrap();
        let mut tlb = Tlb::new(cache.space().clone());

        let inserted: Vec<_> = addrs
            .iter()
            .map(|&addr| cache.insert(translate_block(addr, &mut tlb)))
            .collect();

        let stats = cache.stats();
        prop_assert_eq!(stats.blocks, addrs.len());
        prop_assert_eq!(stats.hash_size, expected_hash_size(initial, addrs.len()));
        prop_assert_eq!(stats.bytes, inserted.iter().map(|b| b.block().used()).sum::<usize>());

        let mut seen = BTreeSet::new();
        for block in &inserted {
            let found = cache.lookup(block.start()).unwrap();
            prop_assert!(Arc::ptr_eq(&found, block));
            prop_assert_eq!(found.end(), found.start());
            prop_assert!(seen.insert(found.start()));
        }
        prop_assert!(cache.lookup(0x5000).is_none());
    }
}

#[test]
fn default_table_doubles_once_past_twice_its_size() {
    let cache = BlockCache::new(ret_sled(), FiberConfig::default()).unwrap();
    let n = FiberConfig::default().initial_hash_size;
    let mut tlb = Tlb::new(cache.space().clone());
    for addr in 0x1000..0x1000 + 2 * n as u32 + 1 {
        cache.insert(translate_block(addr, &mut tlb));
    }
    assert_eq!(cache.stats().hash_size, 2 * n);
    for addr in 0x1000..0x1000 + 2 * n as u32 + 1 {
        assert_eq!(cache.lookup(addr).unwrap().start(), addr);
    }
}
