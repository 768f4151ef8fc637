use std::sync::Arc;

use kiln_mem::{AccessType, AddressSpace, PageFlags, Tlb};

#[test]
fn cow_copies_are_private_per_thread_space() {
    let parent = Arc::new(AddressSpace::new());
    parent.map(0x200, 8, PageFlags::RW).unwrap();
    for page in 0..8u32 {
        parent.write_bytes((0x200 + page) << 12, &[page as u8]).unwrap();
    }
    let child = Arc::new(parent.fork_cow());

    std::thread::scope(|s| {
        for (space, tag) in [(parent.clone(), 0xaau8), (child.clone(), 0xbb)] {
            s.spawn(move || {
                let mut tlb = Tlb::new(space);
                for page in 0..8u32 {
                    let addr = ((0x200 + page) << 12) + 1;
                    tlb.refresh();
                    tlb.write_u8(addr, tag).unwrap();
                }
            });
        }
    });

    for page in 0..8u32 {
        let addr = (0x200 + page) << 12;
        let mut p = [0u8; 2];
        let mut c = [0u8; 2];
        parent.read_bytes(addr, &mut p).unwrap();
        child.read_bytes(addr, &mut c).unwrap();
        assert_eq!(p, [page as u8, 0xaa]);
        assert_eq!(c, [page as u8, 0xbb]);
    }
}

#[test]
fn remap_under_reader_is_observed_after_refresh() {
    let space = Arc::new(AddressSpace::new());
    space.map(0x300, 1, PageFlags::RW).unwrap();
    space.write_bytes(0x300_000, &[1]).unwrap();

    let mut tlb = Tlb::new(space.clone());
    assert_eq!(tlb.read_u8(0x300_000).unwrap(), 1);

    std::thread::scope(|s| {
        s.spawn(|| {
            space.map(0x300, 1, PageFlags::READ).unwrap();
            space.write_bytes(0x300_000, &[2]).unwrap();
        });
    });

    tlb.refresh();
    assert_eq!(tlb.read_u8(0x300_000).unwrap(), 2);
    assert!(tlb.write_u8(0x300_000, 3).is_err());
    assert!(space.translate(0x300_000, AccessType::Write).is_err());
}
