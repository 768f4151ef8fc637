use std::sync::Arc;

use kiln_gen::{translate_block, Gadget, BLOCK_BYTE_LIMIT};
use kiln_mem::{page, AddressSpace, PageFlags, Tlb};
use proptest::prelude::*;

const CODE_PAGE: u32 = 0x40;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    // Arbitrary byte soup, started anywhere in a page, never yields a block covering more than two
    // pages and always ends in exactly one terminator.
    #[test]
    fn blocks_span_at_most_two_pages(
        code in prop::collection::vec(any::<u8>(), 1..8192),
        offset in 0u32..4096,
        mapped_pages in 1u32..=3,
    ) {
        let space = Arc::new(AddressSpace::new());
        space.map(CODE_PAGE, mapped_pages, PageFlags::RX).unwrap();
        let start = (CODE_PAGE << 12) + offset;
        let room = (mapped_pages * 4096 - offset) as usize;
        space.write_bytes(start, &code[..code.len().min(room)]).unwrap();

        let mut tlb = Tlb::new(space);
        let block = translate_block(start, &mut tlb);

        prop_assert_eq!(block.start(), start);
        prop_assert!(page(block.end()) - page(block.start()) <= 1);
        prop_assert!(block.end() - block.start() < BLOCK_BYTE_LIMIT + 15);

        let terminators = block.gadgets().iter().filter(|g| g.is_terminator()).count();
        prop_assert_eq!(terminators, 1);
        prop_assert!(block.gadgets().last().is_some_and(Gadget::is_terminator));
    }

    #[test]
    fn nop_sleds_never_cross_a_second_boundary(offset in 0u32..4096) {
        let space = Arc::new(AddressSpace::new());
        space.map(CODE_PAGE, 3, PageFlags::RX).unwrap();
        space.write_bytes(CODE_PAGE << 12, &vec![0x90; 3 * 4096]).unwrap();
        let mut tlb = Tlb::new(space);
        let start = (CODE_PAGE << 12) + offset;
        let block = translate_block(start, &mut tlb);
        prop_assert_eq!(block.end() - block.start() + 1, BLOCK_BYTE_LIMIT);
    }
}
