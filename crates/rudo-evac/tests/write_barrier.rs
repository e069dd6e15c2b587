//! Old-to-young edges through the write barrier, across collections.

use rudo_evac::{Address, Collector, EvacConfig, Heap, HeapConfig, Klass, KlassId};

fn setup(config: EvacConfig) -> (Collector, KlassId) {
    let mut heap = Heap::new(HeapConfig::default().with_spaces(1 << 12, 1 << 12, 1 << 10)).unwrap();
    let node = heap.register_klass(Klass::instance("node", 2, 1)).unwrap();
    (Collector::new(heap, config).unwrap(), node)
}

#[test]
fn test_only_old_to_young_stores_are_recorded() {
    let (gc, node) = setup(EvacConfig::new(1));
    let heap = gc.heap();
    let old_a = heap.alloc_old_instance(node).unwrap();
    let old_b = heap.alloc_old_instance(node).unwrap();
    let young_a = heap.alloc_instance(node).unwrap();
    let young_b = heap.alloc_instance(node).unwrap();

    heap.store_ref(old_a, 0, old_b);
    heap.store_ref(young_a, 0, young_b);
    heap.store_ref(young_a, 1, old_a);
    heap.store_ref(old_a, 1, Address::NULL);
    assert!(heap.remembered_set().is_empty());

    heap.store_ref(old_a, 0, young_a);
    heap.store_ref(old_a, 0, young_b);
    heap.store_ref(old_b, 1, young_a);
    assert_eq!(heap.remembered_set().len(), 3);
    assert_eq!(heap.remembered_set().total_recorded(), 3);

    let slots = heap.remembered_set().take_slots();
    assert_eq!(slots.len(), 2, "duplicates are dropped on drain");
    assert!(slots.windows(2).all(|w| w[0] < w[1]));
    assert!(heap.remembered_set().is_empty());
}

#[test]
fn test_scavenge_keeps_surviving_edges_remembered() {
    let (mut gc, node) = setup(EvacConfig::new(2));
    let heap = std::sync::Arc::clone(gc.heap());
    let holder = heap.alloc_old_instance(node).unwrap();
    let young = heap.alloc_instance(node).unwrap();
    heap.store_data(young, 0, 5);
    heap.store_ref(holder, 0, young);
    heap.store_ref(holder, 0, young);

    for _ in 0..3 {
        let report = gc.scavenge();
        assert_eq!(report.stats.total.objects_copied, 1);
        assert_eq!(heap.remembered_set().len(), 1);
        let young = heap.load_ref(holder, 0);
        assert!(heap.from_space().contains(young));
        assert_eq!(heap.load_data(young, 0), 5);
    }
}

#[test]
fn test_promoted_referent_is_forgotten() {
    let (mut gc, node) = setup(EvacConfig::new(2).with_tenuring_threshold(0));
    let heap = std::sync::Arc::clone(gc.heap());
    let holder = heap.alloc_old_instance(node).unwrap();
    let young = heap.alloc_instance(node).unwrap();
    heap.store_ref(holder, 0, young);

    let report = gc.scavenge();
    assert_eq!(report.stats.total.objects_promoted, 1);
    assert!(heap.is_in_old(heap.load_ref(holder, 0)));
    assert!(heap.remembered_set().is_empty());
}

#[test]
fn test_promoted_subgraph_leaves_no_edges() {
    let (mut gc, node) = setup(EvacConfig::new(1).with_tenuring_threshold(0));
    let heap = std::sync::Arc::clone(gc.heap());
    // With threshold 0 parent and child are both promoted.
    let parent = heap.alloc_instance(node).unwrap();
    let child = heap.alloc_instance(node).unwrap();
    heap.store_ref(parent, 0, child);
    let root = heap.roots().add(parent).unwrap();

    gc.scavenge();
    let parent = heap.roots().get(root);
    let child = heap.load_ref(parent, 0);
    assert!(heap.is_in_old(parent));
    assert!(heap.is_in_old(child));
    assert!(heap.remembered_set().is_empty());
}

#[test]
fn test_promoted_parent_of_young_child_is_remembered() {
    let (mut gc, node) = setup(EvacConfig::new(1).with_tenuring_threshold(1));
    let heap = std::sync::Arc::clone(gc.heap());
    let parent = heap.alloc_instance(node).unwrap();
    let root = heap.roots().add(parent).unwrap();
    // First scavenge ages the parent to 1.
    gc.scavenge();
    let parent = heap.roots().get(root);
    let child = heap.alloc_instance(node).unwrap();
    heap.store_ref(parent, 0, child);

    // Second: the parent is promoted, the child only copied.
    let report = gc.scavenge();
    assert_eq!(report.stats.total.objects_promoted, 1);
    assert_eq!(report.stats.total.objects_copied, 1);
    let parent = heap.roots().get(root);
    let child = heap.load_ref(parent, 0);
    assert!(heap.is_in_old(parent));
    assert!(heap.from_space().contains(child));
    assert_eq!(heap.remembered_set().len(), 1);
}
