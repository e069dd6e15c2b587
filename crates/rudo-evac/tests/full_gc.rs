//! End-to-end mark-compact collections.

use std::sync::Arc;

use rudo_evac::{
    Address, CollectionKind, Collector, CompactionPlan, EvacConfig, GcPhase, Heap, HeapConfig,
    Klass, KlassId,
};

struct Fixture {
    gc: Collector,
    heap: Arc<Heap>,
    node: KlassId,
    leaf: KlassId,
    array: KlassId,
}

fn fixture(heap_config: HeapConfig, config: EvacConfig) -> Fixture {
    let mut heap = Heap::new(heap_config).unwrap();
    let node = heap.register_klass(Klass::instance("node", 1, 1)).unwrap();
    let leaf = heap.register_klass(Klass::instance("leaf", 0, 1)).unwrap();
    let array = heap.register_klass(Klass::obj_array("leaf[]")).unwrap();
    let gc = Collector::new(heap, config).unwrap();
    Fixture {
        heap: Arc::clone(gc.heap()),
        gc,
        node,
        leaf,
        array,
    }
}

/// A chain of `len` nodes numbered from `first`. With `garbage`, a dead node
/// sits between consecutive links. `old` allocates in the old generation.
fn chain(heap: &Heap, node: KlassId, first: usize, len: usize, garbage: bool, old: bool) -> Address {
    let alloc = || {
        if old {
            heap.alloc_old_instance(node).unwrap()
        } else {
            heap.alloc_instance(node).unwrap()
        }
    };
    let head = alloc();
    heap.store_data(head, 0, first);
    let mut prev = head;
    for i in 1..len {
        if garbage {
            let _dead = alloc();
        }
        let next = alloc();
        heap.store_data(next, 0, first + i);
        heap.store_ref(prev, 0, next);
        prev = next;
    }
    head
}

/// Walk a chain, checking numbering and headers. Returns the last node.
fn check_chain(heap: &Heap, head: Address, first: usize, len: usize) -> Address {
    let mut cur = head;
    let mut last = head;
    for i in 0..len {
        assert!(!cur.is_null(), "chain cut at {i}");
        let header = heap.header(cur);
        assert!(header.is_normal());
        assert_eq!(header.age(), 0);
        assert_eq!(heap.load_data(cur, 0), first + i);
        last = cur;
        cur = heap.load_ref(cur, 0);
    }
    last
}

#[test]
fn test_everything_fits_into_old() {
    let mut f = fixture(
        HeapConfig::default().with_spaces(1 << 14, 1 << 13, 1 << 12),
        EvacConfig::new(4).with_lab_words(128, 128),
    );
    let heap = &f.heap;
    let survivor = chain(heap, f.node, 0, 100, true, false);
    let survivor_root = heap.roots().add(survivor).unwrap();
    assert!(!f.gc.scavenge().promotion_failed);
    assert!(!heap.from_space().is_empty());

    let young = chain(heap, f.node, 1000, 100, true, false);
    let young_root = heap.roots().add(young).unwrap();
    let old = chain(heap, f.node, 5000, 50, true, true);
    let old_root = heap.roots().add(old).unwrap();

    let report = f.gc.full_collect();
    assert_eq!(report.kind, CollectionKind::Full);
    assert_eq!(f.gc.mark_compact().last_plan(), Some(CompactionPlan::IntoOld));
    for phase in [
        GcPhase::Mark,
        GcPhase::Summary,
        GcPhase::Forward,
        GcPhase::Adjust,
        GcPhase::Compact,
        GcPhase::Post,
    ] {
        assert!(report.phase_duration(phase).is_some(), "{phase:?} not timed");
    }
    assert_eq!(report.stats.total.objects_marked, 250);
    assert_eq!(report.stats.total.words_marked, 750);

    assert!(heap.eden().is_empty());
    assert!(heap.from_space().is_empty());
    assert!(heap.to_space().is_empty());
    assert_eq!(heap.old().used_words(), 750);
    for (root, first, len) in [(survivor_root, 0, 100), (young_root, 1000, 100), (old_root, 5000, 50)] {
        let head = heap.roots().get(root);
        assert!(heap.is_in_old(head));
        check_chain(heap, head, first, len);
    }
    // No old-to-young edges remain.
    assert!(heap.remembered_set().is_empty());

    // The compacted heap is fully usable by the next scavenge.
    let report = f.gc.scavenge();
    assert!(!report.skipped);
    assert_eq!(report.stats.total.objects_copied, 0);
}

#[test]
fn test_young_slides_into_eden_when_old_is_tight() {
    let mut f = fixture(
        HeapConfig::default()
            .with_spaces(512, 1 << 12, 1 << 10)
            .with_region_words(64),
        EvacConfig::new(4).with_lab_words(64, 64),
    );
    let heap = &f.heap;
    let old = chain(heap, f.node, 0, 80, true, true);
    let old_root = heap.roots().add(old).unwrap();
    let young = chain(heap, f.node, 100, 100, true, false);
    // The tail of the old chain points at the young chain.
    let mut tail = old;
    while !heap.load_ref(tail, 0).is_null() {
        tail = heap.load_ref(tail, 0);
    }
    heap.store_ref(tail, 0, young);
    // Forget the edge; the full collection must rediscover it.
    heap.remembered_set().clear();

    let report = f.gc.full_collect();
    assert_eq!(
        f.gc.mark_compact().last_plan(),
        Some(CompactionPlan::YoungIntoEden)
    );
    assert_eq!(report.stats.total.objects_marked, 180);
    assert_eq!(heap.old().used_words(), 240);
    assert_eq!(heap.eden().used_words(), 300);
    assert!(heap.from_space().is_empty());

    let old = heap.roots().get(old_root);
    let tail = check_chain(heap, old, 0, 80);
    let young = heap.load_ref(tail, 0);
    assert_eq!(young, heap.eden().bottom());
    check_chain(heap, young, 100, 100);

    // The old-to-young edge is remembered at the tail's new address.
    assert_eq!(heap.remembered_set().len(), 1);
    let report = f.gc.scavenge();
    assert!(!report.promotion_failed);
    assert_eq!(report.stats.total.objects_copied, 100);
    let young = heap.load_ref(tail, 0);
    assert!(heap.from_space().contains(young));
    check_chain_data(heap, young, 100, 100);
}

/// Like `check_chain` without the age check, for chains that were scavenged.
fn check_chain_data(heap: &Heap, head: Address, first: usize, len: usize) {
    let mut cur = head;
    for i in 0..len {
        assert_eq!(heap.load_data(cur, 0), first + i);
        cur = heap.load_ref(cur, 0);
    }
    assert!(cur.is_null());
}

#[test]
fn test_in_place_plan_merges_survivors() {
    let mut f = fixture(
        HeapConfig::default()
            .with_spaces(256, 256, 256)
            .with_region_words(64),
        EvacConfig::new(2),
    );
    let heap = &f.heap;
    let survivors = chain(heap, f.node, 0, 60, false, false);
    let survivors_root = heap.roots().add(survivors).unwrap();
    assert!(!f.gc.scavenge().promotion_failed);
    assert_eq!(heap.from_space().used_words(), 180);

    let old = chain(heap, f.node, 1000, 80, false, true);
    let old_root = heap.roots().add(old).unwrap();
    let young = chain(heap, f.node, 2000, 60, false, false);
    let young_root = heap.roots().add(young).unwrap();

    f.gc.full_collect();
    assert_eq!(
        f.gc.mark_compact().last_plan(),
        Some(CompactionPlan::InPlace {
            survivors_merged: true
        })
    );
    assert!(heap.to_space().is_empty());
    assert_eq!(heap.from_space().used_words(), 180);
    assert_eq!(heap.eden().used_words(), 180);
    assert_eq!(heap.old().used_words(), 240);

    let survivors = heap.roots().get(survivors_root);
    assert!(heap.from_space().contains(survivors));
    check_chain(heap, survivors, 0, 60);
    check_chain(heap, heap.roots().get(old_root), 1000, 80);
    check_chain(heap, heap.roots().get(young_root), 2000, 60);
}

#[test]
fn test_dead_objects_are_reclaimed() {
    let mut f = fixture(
        HeapConfig::default().with_spaces(1 << 13, 1 << 13, 1 << 11),
        EvacConfig::new(3),
    );
    let heap = &f.heap;
    let _dead_young = chain(heap, f.node, 0, 500, false, false);
    let _dead_old = chain(heap, f.node, 0, 500, false, true);
    let live = heap.alloc_instance(f.leaf).unwrap();
    heap.store_data(live, 0, 77);
    let root = heap.roots().add(live).unwrap();
    assert_eq!(heap.used_words(), 3002);

    let report = f.gc.full_collect();
    assert_eq!(report.stats.total.objects_marked, 1);
    assert_eq!(heap.used_words(), 2);
    let live = heap.roots().get(root);
    assert_eq!(live, heap.old().bottom());
    assert_eq!(heap.load_data(live, 0), 77);

    // Dropping the last root leaves an empty heap.
    heap.roots().remove(root);
    f.gc.full_collect();
    assert_eq!(heap.used_words(), 0);
}

#[test]
fn test_arrays_spanning_regions_move_intact() {
    const LENGTH: usize = 300;
    let mut f = fixture(
        HeapConfig::default()
            .with_spaces(1 << 12, 1 << 12, 1 << 10)
            .with_region_words(64),
        EvacConfig::new(4)
            .with_array_chunk_size(32)
            .with_min_array_size_for_chunking(64),
    );
    let heap = &f.heap;
    // Garbage first so the array has somewhere to slide to.
    let _dead = chain(heap, f.node, 0, 40, false, true);
    let array = heap.alloc_array(f.array, LENGTH).unwrap();
    for i in 0..LENGTH {
        let leaf = heap.alloc_instance(f.leaf).unwrap();
        heap.store_data(leaf, 0, i);
        heap.store_elem(array, i, leaf);
    }
    let root = heap.roots().add(array).unwrap();

    let report = f.gc.full_collect();
    assert_eq!(report.stats.total.objects_marked, 1 + LENGTH);
    assert_eq!(report.stats.total.partial_array.split, 1);
    assert!(report.stats.total.regions_filled > 0);

    let array = heap.roots().get(root);
    assert_eq!(array, heap.old().bottom());
    assert_eq!(heap.array_length(array), LENGTH);
    let mut expected = array.add_words(LENGTH + 2);
    for i in 0..LENGTH {
        let leaf = heap.load_elem(array, i);
        // Elements slide in allocation order right behind the array.
        assert_eq!(leaf, expected);
        assert_eq!(heap.load_data(leaf, 0), i);
        expected = expected.add_words(2);
    }
}

#[test]
fn test_shared_array_marks_each_object_once() {
    const LENGTH: usize = 4096;
    let mut f = fixture(
        HeapConfig::default().with_spaces(1 << 14, 1 << 14, 1 << 12),
        EvacConfig::new(4)
            .with_array_chunk_size(64)
            .with_min_array_size_for_chunking(128),
    );
    let heap = &f.heap;
    let a = heap.alloc_instance(f.leaf).unwrap();
    let b = heap.alloc_instance(f.leaf).unwrap();
    heap.store_data(a, 0, 0xa);
    heap.store_data(b, 0, 0xb);
    let array = heap.alloc_array(f.array, LENGTH).unwrap();
    for i in 0..LENGTH {
        heap.store_elem(array, i, if i % 2 == 0 { a } else { b });
    }
    let root = heap.roots().add(array).unwrap();

    for _ in 0..10 {
        let report = f.gc.full_collect();
        let stats = report.stats.total;
        assert_eq!(stats.objects_marked, 3);
        assert_eq!(stats.partial_array.split, 1);
        assert_eq!(stats.partial_array.processed, LENGTH / 64);

        let array = heap.roots().get(root);
        let (a, b) = (heap.load_elem(array, 0), heap.load_elem(array, 1));
        assert_ne!(a, b);
        assert_eq!(heap.load_data(a, 0), 0xa);
        assert_eq!(heap.load_data(b, 0), 0xb);
        for i in 0..LENGTH {
            assert_eq!(heap.load_elem(array, i), if i % 2 == 0 { a } else { b });
        }
    }
}

#[test]
fn test_dense_prefix_is_not_moved() {
    let mut f = fixture(
        HeapConfig::default()
            .with_spaces(1024, 1024, 256)
            .with_region_words(64),
        EvacConfig::new(2).with_dense_prefix_dead_ratio(1),
    );
    let heap = &f.heap;
    // 42 live nodes and one dead leaf fill regions 0 and 1 with 2 dead words,
    // within the 10 words old may waste. Region 2 is entirely garbage.
    let dense = chain(heap, f.node, 0, 42, false, true);
    let dense_root = heap.roots().add(dense).unwrap();
    let _gap = heap.alloc_old_instance(f.leaf).unwrap();
    let _dead = chain(heap, f.node, 0, 30, false, true);
    let tail = chain(heap, f.node, 100, 10, false, true);
    let tail_root = heap.roots().add(tail).unwrap();
    let last_dense = {
        let mut cur = dense;
        while !heap.load_ref(cur, 0).is_null() {
            cur = heap.load_ref(cur, 0);
        }
        cur
    };

    f.gc.full_collect();
    let bottom = heap.old().bottom();
    assert_eq!(heap.roots().get(dense_root), bottom);
    assert_eq!(check_chain(heap, bottom, 0, 42), last_dense);
    let gap = bottom.add_words(126);
    let header = heap.header(gap);
    assert!(Heap::is_filler(header));
    assert_eq!(heap.size_of(gap, header), 2);

    let tail = heap.roots().get(tail_root);
    assert_eq!(tail, bottom.add_words(128));
    check_chain(heap, tail, 100, 10);
    assert_eq!(heap.old().used_words(), 158);
}

#[test]
fn test_zero_dead_ratio_compacts_gaps() {
    let mut f = fixture(
        HeapConfig::default()
            .with_spaces(1024, 1024, 256)
            .with_region_words(64),
        EvacConfig::new(2).with_dense_prefix_dead_ratio(0),
    );
    let heap = &f.heap;
    let dense = chain(heap, f.node, 0, 42, false, true);
    let dense_root = heap.roots().add(dense).unwrap();
    let _gap = heap.alloc_old_instance(f.leaf).unwrap();
    let tail = chain(heap, f.node, 100, 10, false, true);
    let tail_root = heap.roots().add(tail).unwrap();

    f.gc.full_collect();
    let bottom = heap.old().bottom();
    assert_eq!(heap.roots().get(dense_root), bottom);
    check_chain(heap, bottom, 0, 42);
    // Region 0 is fully live and stays; the leaf's two words are reclaimed.
    assert_eq!(heap.roots().get(tail_root), bottom.add_words(126));
    check_chain(heap, bottom.add_words(126), 100, 10);
    assert_eq!(heap.old().used_words(), 156);
}
