use super::*;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingObserver {
    calls: Mutex<Vec<(Page, u32)>>,
    count: AtomicU32,
}

impl MappingObserver for RecordingObserver {
    fn on_mapping_changed(&self, start: Page, pages: u32) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().unwrap().push((start, pages));
    }
}

fn space_with_observer() -> (Arc<AddressSpace>, Arc<RecordingObserver>) {
    let space = Arc::new(AddressSpace::new());
    let observer = Arc::new(RecordingObserver::default());
    let weak: std::sync::Weak<dyn MappingObserver> =
        Arc::downgrade(&(observer.clone() as Arc<dyn MappingObserver>));
    space.set_observer(weak);
    (space, observer)
}

#[test]
fn page_helpers() {
    assert_eq!(page(0x1234_5678), 0x12345);
    assert_eq!(page_offset(0x1234_5678), 0x678);
    assert_eq!(page_base(0x1234_5678), 0x1234_5000);
    assert_eq!(page_addr(0x12345), 0x1234_5000);
}

#[test]
fn map_bumps_generation_and_notifies() {
    let (space, observer) = space_with_observer();
    let before = space.generation();
    space.map(0x10, 2, PageFlags::RW).unwrap();
    assert!(space.generation() > before);
    assert_eq!(*observer.calls.lock().unwrap(), vec![(0x10, 2)]);
    assert_eq!(
        space.flags(0x10),
        Some(PageFlags::RW | PageFlags::ANONYMOUS)
    );
}

#[test]
fn map_rejects_bad_ranges() {
    let space = AddressSpace::new();
    assert_eq!(space.map(0, 0, PageFlags::RW), Err(MapError::ZeroLength));
    assert_eq!(
        space.map(MEM_PAGES - 1, 2, PageFlags::RW),
        Err(MapError::OutOfRange {
            start: MEM_PAGES - 1,
            pages: 2
        })
    );
}

#[test]
fn strict_unmap_leaves_mappings_on_hole() {
    let space = AddressSpace::new();
    space.map(0x10, 1, PageFlags::RW).unwrap();
    space.map(0x12, 1, PageFlags::RW).unwrap();
    assert_eq!(
        space.unmap(0x10, 3),
        Err(MapError::NotMapped { page: 0x11 })
    );
    assert!(space.is_mapped(0x10));
    space.unmap_force(0x10, 3).unwrap();
    assert!(space.is_hole(0x10, 3));
}

#[test]
fn translate_checks_protection() {
    let space = AddressSpace::new();
    space.map(0x10, 1, PageFlags::READ).unwrap();
    assert!(space.translate(0x10_000, AccessType::Read).is_ok());
    let fault = space.translate(0x10_004, AccessType::Write).unwrap_err();
    assert_eq!(fault.reason, SegvReason::AccErr);
    assert_eq!(fault.addr, 0x10_004);
    let fault = space.translate(0x20_000, AccessType::Read).unwrap_err();
    assert_eq!(fault.reason, SegvReason::MapErr);
}

#[test]
fn fault_reason_classifies() {
    let space = AddressSpace::new();
    space.map(0x10, 1, PageFlags::READ).unwrap();
    assert_eq!(space.fault_reason(0x5000, AccessType::Read), Some(SegvReason::MapErr));
    assert_eq!(
        space.fault_reason(0x10_000, AccessType::Write),
        Some(SegvReason::AccErr)
    );
    assert_eq!(space.fault_reason(0x10_000, AccessType::Read), None);
}

#[test]
fn stack_grows_down_one_page() {
    let space = AddressSpace::new();
    space
        .map(0xbffff, 1, PageFlags::RW | PageFlags::GROWSDOWN)
        .unwrap();
    let before = space.generation();

    space.translate(0xbfffe_ffc, AccessType::Write).unwrap();
    assert!(space.is_mapped(0xbfffe));
    assert!(space.flags(0xbfffe).unwrap().contains(PageFlags::GROWSDOWN));
    assert!(space.generation() > before);

    // Only the page directly below the growable region is mapped.
    assert!(!space.is_mapped(0xbfffd));
}

#[test]
fn no_growth_below_ordinary_mapping() {
    let space = AddressSpace::new();
    space.map(0x100, 1, PageFlags::RW).unwrap();
    let fault = space.translate(0xff_000, AccessType::Read).unwrap_err();
    assert_eq!(fault.reason, SegvReason::MapErr);
    assert!(!space.is_mapped(0xff));
}

#[test]
fn cow_fork_copies_on_first_write() {
    let parent = AddressSpace::new();
    parent.map(0x10, 1, PageFlags::RW).unwrap();
    parent.write_bytes(0x10_000, b"orig").unwrap();

    let child = parent.fork_cow();
    assert!(parent.flags(0x10).unwrap().contains(PageFlags::COW));
    assert!(child.flags(0x10).unwrap().contains(PageFlags::COW));

    let frame = child.translate(0x10_000, AccessType::Write).unwrap();
    frame.write(0, b"kid!");
    assert!(!child.flags(0x10).unwrap().contains(PageFlags::COW));

    let mut buf = [0u8; 4];
    parent.read_bytes(0x10_000, &mut buf).unwrap();
    assert_eq!(&buf, b"orig");
    child.read_bytes(0x10_000, &mut buf).unwrap();
    assert_eq!(&buf, b"kid!");
}

#[test]
fn shared_mapping_survives_fork() {
    let parent = AddressSpace::new();
    let frame = Arc::new(PageFrame::zeroed());
    parent
        .map_frames(0x10, &[frame.clone()], PageFlags::RW | PageFlags::SHARED)
        .unwrap();
    let child = parent.fork_cow();
    assert!(!child.flags(0x10).unwrap().contains(PageFlags::COW));

    child.write_bytes(0x10_010, &[0xab]).unwrap();
    assert_eq!(frame.load(0x10), 0xab);
}

#[test]
fn fork_invalidates_parent_code() {
    let (space, observer) = space_with_observer();
    space.map(0x10, 2, PageFlags::RX).unwrap();
    space.map(0x20, 1, PageFlags::RW).unwrap();
    observer.calls.lock().unwrap().clear();

    let _child = space.fork_cow();
    assert_eq!(
        *observer.calls.lock().unwrap(),
        vec![(0x10, 2), (0x20, 1)]
    );
}

#[test]
fn write_to_compiled_page_notifies_once() {
    let (space, observer) = space_with_observer();
    space.map(0x10, 1, PageFlags::RWX).unwrap();
    let before = space.generation();
    let installed = space.mark_code((0x10, 0x10), || 7);
    assert_eq!(installed, 7);
    assert!(space.generation() > before);
    observer.calls.lock().unwrap().clear();

    space.translate(0x10_000, AccessType::Write).unwrap();
    assert_eq!(*observer.calls.lock().unwrap(), vec![(0x10, 1)]);
    assert!(!space.flags(0x10).unwrap().contains(PageFlags::COMPILED));

    // Second write goes through the fast path without another notification.
    let seen = observer.count.load(Ordering::Relaxed);
    space.translate(0x10_000, AccessType::Write).unwrap();
    assert_eq!(observer.count.load(Ordering::Relaxed), seen);
}

#[test]
fn recompiling_a_compiled_page_keeps_generation() {
    let space = AddressSpace::new();
    space.map(0x10, 1, PageFlags::RX).unwrap();
    space.mark_code((0x10, 0x10), || ());
    let generation = space.generation();
    space.mark_code((0x10, 0x10), || ());
    assert_eq!(space.generation(), generation);
}

#[test]
fn publish_refuses_code_read_before_an_invalidation() {
    let space = AddressSpace::new();
    space.map(0x10, 2, PageFlags::RWX).unwrap();
    let seen = space.invalidations();
    assert_eq!(space.publish_code((0x10, 0x11), seen, || 1), Some(1));
    assert!(space.flags(0x11).unwrap().contains(PageFlags::COMPILED));

    let seen = space.invalidations();
    space.write_bytes(0x10_000, &[0xc3]).unwrap();
    assert_eq!(space.publish_code((0x10, 0x10), seen, || 2), None);
    assert!(!space.flags(0x10).unwrap().contains(PageFlags::COMPILED));
}

#[test]
fn protect_replaces_only_protection_bits() {
    let space = AddressSpace::new();
    space
        .map(0x10, 2, PageFlags::RW | PageFlags::GROWSDOWN)
        .unwrap();
    space.protect(0x10, 2, PageFlags::READ).unwrap();
    assert_eq!(
        space.flags(0x11),
        Some(PageFlags::READ | PageFlags::GROWSDOWN | PageFlags::ANONYMOUS)
    );
    assert_eq!(
        space.protect(0x10, 3, PageFlags::RW),
        Err(MapError::NotMapped { page: 0x12 })
    );
}

#[test]
fn find_hole_searches_top_down() {
    let space = AddressSpace::new();
    assert_eq!(space.find_hole(4), Some(MMAP_CEILING + 1 - 4));

    space.map(MMAP_CEILING - 1, 2, PageFlags::RW).unwrap();
    assert_eq!(space.find_hole(1), Some(MMAP_CEILING - 2));
    assert_eq!(space.find_hole(0), None);
    assert_eq!(space.find_hole(MMAP_CEILING), None);
}

#[test]
fn host_accessors_span_pages() {
    let space = AddressSpace::new();
    space.map(0x10, 2, PageFlags::READ).unwrap();
    space.write_bytes(0x10_ffe, &[1, 2, 3, 4]).unwrap();
    let mut buf = [0u8; 4];
    space.read_bytes(0x10_ffe, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);
    assert_eq!(
        space.write_bytes(0x11_fff, &[9, 9]),
        Err(MapError::NotMapped { page: 0x12 })
    );
}

#[test]
fn tlb_refresh_follows_generation() {
    let space = Arc::new(AddressSpace::new());
    space.map(0x10, 1, PageFlags::RW).unwrap();
    let mut tlb = Tlb::new(space.clone());
    tlb.write_u32(0x10_000, 0xdead_beef).unwrap();
    assert_eq!(tlb.dirty_page(), Some(0x10));

    // Replace the mapping; the stale TLB still sees the old frame until refreshed.
    space.map(0x10, 1, PageFlags::RW).unwrap();
    assert_ne!(tlb.generation(), space.generation());
    tlb.refresh();
    assert_eq!(tlb.generation(), space.generation());
    assert_eq!(tlb.read_u32(0x10_000).unwrap(), 0);
}

#[test]
fn tlb_cross_page_access() {
    let space = Arc::new(AddressSpace::new());
    space.map(0x10, 2, PageFlags::RW).unwrap();
    let mut tlb = Tlb::new(space.clone());
    tlb.write_u32(0x10_ffe, 0x1122_3344).unwrap();
    assert_eq!(tlb.read_u32(0x10_ffe).unwrap(), 0x1122_3344);
    assert_eq!(tlb.read_u16(0x11_000).unwrap(), 0x1122);
}

#[test]
fn tlb_split_write_is_all_or_nothing() {
    let space = Arc::new(AddressSpace::new());
    space.map(0x10, 1, PageFlags::RW).unwrap();
    space.map(0x11, 1, PageFlags::READ).unwrap();
    let mut tlb = Tlb::new(space.clone());

    let fault = tlb.write_u32(0x10_ffe, 0xffff_ffff).unwrap_err();
    assert_eq!(fault.reason, SegvReason::AccErr);
    assert_eq!(tlb.fault_addr(), 0x11_000);
    assert_eq!(tlb.read_u16(0x10_ffe).unwrap(), 0);
}

#[test]
fn tlb_read_entry_is_not_writable() {
    let space = Arc::new(AddressSpace::new());
    space.map(0x10, 1, PageFlags::RW).unwrap();
    let mut tlb = Tlb::new(space.clone());
    tlb.read_u8(0x10_000).unwrap();
    assert_eq!(tlb.dirty_page(), None);
    tlb.write_u8(0x10_000, 5).unwrap();
    assert_eq!(tlb.dirty_page(), Some(0x10));
}
