use std::cell::Cell;
use std::rc::Rc;

use super::{fill, holds, tracing_init};
use crate::resizer::REGION_ALIGN;
use crate::{heap_resizer, Offset, OwnedRegion, Region, RegionOptions, Resizer};
use core::ptr::NonNull;
use std::alloc::Layout;

/// A counting wrapper around the plain heap resizer.
fn counting_resizer(count: Rc<Cell<u32>>) -> Resizer {
    Box::new(move |base, old_size, new_size| {
        count.set(count.get() + 1);
        let layout = Layout::from_size_align(old_size, REGION_ALIGN).unwrap();
        let p = unsafe { std::alloc::realloc(base.as_ptr(), layout, new_size) };
        NonNull::new(p).unwrap()
    })
}

#[test]
fn second_alloc_triggers_resize() {
    tracing_init();
    let count = Rc::new(Cell::new(0));
    let mut pb = unsafe {
        OwnedRegion::with_resizer(256, RegionOptions::default(), counting_resizer(count.clone()))
    }
    .unwrap();

    let a = pb.alloc(130).unwrap();
    assert_eq!(count.get(), 0);
    fill(&mut pb, a, 130, 0xda);

    // The arena is exhausted now, so this one grows the region.
    let b = pb.alloc(130).unwrap();
    assert_eq!(count.get(), 1);
    assert_eq!(pb.full_size(), 512);
    fill(&mut pb, b, 130, 0xdd);

    assert!(holds(&pb, a, 130, 0xda));
    assert!(holds(&pb, b, 130, 0xdd));
    pb.verify_free_list().unwrap();
}

#[test]
fn fixed_region_cannot_grow() {
    let mut pb = super::fixed_plain(256);
    let a = pb.alloc_with(130, 8, true, false).unwrap();
    assert!(pb.alloc_with(130, 8, true, false).is_err());
    pb.free(a);
}

#[test]
fn growth_extends_the_tail_block() {
    let mut pb = OwnedRegion::new_moveable(256).unwrap();
    // One small allocation leaves a free tail ending at old_size, the
    // common case: growth extends it instead of appending.
    let a = pb.alloc_with(16, 8, true, false).unwrap();
    pb.alloc_with(200, 8, true, false).unwrap();
    assert_eq!(pb.full_size(), 512);
    assert_eq!(pb.free_blocks().count(), 1);
    fill(&mut pb, a, 16, 0xaa);
    assert!(holds(&pb, a, 16, 0xaa));
    pb.verify_free_list().unwrap();
}

#[test]
fn growth_appends_when_tail_is_allocated() {
    let mut pb = OwnedRegion::new_moveable(256).unwrap();
    let arena = pb.arena_size();

    // Swallow the arena whole so the free list is empty at growth time.
    let a = pb.alloc_with(arena - 4, 1, false, false).unwrap();
    fill(&mut pb, a, arena - 4, 0xab);
    assert_eq!(pb.free_blocks().count(), 0);

    let b = pb.alloc_with(16, 8, true, false).unwrap();
    assert_eq!(pb.full_size(), 512);
    assert_eq!(b, 256 + 4, "fresh tail block starts at the old size");
    assert!(holds(&pb, a, arena - 4, 0xab));
    pb.verify_free_list().unwrap();
}

#[test]
fn oversized_request_outgrows_doubling() {
    let mut pb = OwnedRegion::new_moveable(256).unwrap();
    let a = pb.alloc_with(2000, 8, true, false).unwrap();
    assert!(pb.full_size() >= 2000);
    fill(&mut pb, a, 2000, 0x42);
    assert!(holds(&pb, a, 2000, 0x42));
}

#[test]
fn offsets_survive_relocation() {
    let mut pb = OwnedRegion::new_moveable(256).unwrap();
    fastrand::seed(0x5eed1);

    let mut live: Vec<(Offset, u32, u8)> = Vec::new();
    let mut grows = 0;
    for i in 0..200u32 {
        let n = fastrand::u32(1..=160);
        let before = pb.full_size();
        let off = pb.alloc(n).unwrap();
        if pb.full_size() != before {
            grows += 1;
        }
        let tag = i as u8 | 1;
        fill(&mut pb, off, n, tag);
        live.push((off, n, tag));
    }
    assert!(grows >= 2, "workload must actually relocate the region");

    // Every offset written before any relocation still reads back the
    // same bytes.
    for &(off, n, tag) in &live {
        assert!(holds(&pb, off, n, tag));
    }
    assert!(pb.hwm() <= pb.full_size());
    pb.verify_free_list().unwrap();
}

#[test]
fn raw_moveable_region_releases_its_resizer() {
    let layout = Layout::from_size_align(256, REGION_ALIGN).unwrap();
    let base = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
    let mut pb =
        unsafe { Region::init_moveable(base, 256, heap_resizer(), RegionOptions::default()) }
            .unwrap();

    let a = pb.alloc_with(300, 8, true, false).unwrap();
    assert!(pb.full_size() > 256);
    fill(&mut pb, a, 300, 0x5a);
    assert!(holds(&pb, a, 300, 0x5a));

    // Caller-owned memory: release the handle, then free the buffer at
    // its grown size.
    let size = pb.full_size() as usize;
    unsafe {
        pb.release_resizer();
        std::alloc::dealloc(
            pb.base_ptr().as_ptr(),
            Layout::from_size_align(size, REGION_ALIGN).unwrap(),
        );
    }
}

#[test]
fn moveable_regions_default_to_heap_resizer() {
    let mut pb = OwnedRegion::new_moveable(64).unwrap();
    let a = pb.alloc_with(256, 8, true, true).unwrap();
    fill(&mut pb, a, 256, 0x99);
    assert!(holds(&pb, a, 256, 0x99));
}
