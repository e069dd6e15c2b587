//! Tests for the copying manager: racing copiers, LAB refills and
//! promotion failure.

use std::sync::{Arc, Barrier};
use std::thread;

use rudo_evac::task::{OverflowTaskQueue, TaskQueueSet};
use rudo_evac::{
    Address, EvacConfig, EvacStats, Heap, HeapConfig, Klass, PromotionManager, TraversalManager,
};

fn managers(heap: &Arc<Heap>, config: EvacConfig) -> Vec<PromotionManager> {
    let n = config.effective_workers();
    let set = Arc::new(TaskQueueSet::new(n, config.queue_capacity));
    (0..n)
        .map(|id| {
            let queue = OverflowTaskQueue::new(id, Arc::clone(&set));
            PromotionManager::new(id, Arc::clone(heap), config, queue)
        })
        .collect()
}

/// Run `f` on every manager in its own thread, all starting together.
fn race<F>(managers: Vec<PromotionManager>, f: F) -> Vec<(Address, PromotionManager)>
where
    F: Fn(&mut PromotionManager) -> Address + Sync,
{
    let barrier = Barrier::new(managers.len());
    thread::scope(|s| {
        let handles: Vec<_> = managers
            .into_iter()
            .map(|mut manager| {
                let (barrier, f) = (&barrier, &f);
                s.spawn(move || {
                    barrier.wait();
                    let result = f(&mut manager);
                    manager.drain_stacks_depth(true);
                    manager.flush_labs();
                    (result, manager)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn total_stats(results: &[(Address, PromotionManager)]) -> EvacStats {
    EvacStats::from_workers(results.iter().map(|(_, m)| m.stats()).collect())
}

#[test]
fn test_racing_copiers_agree_on_one_copy() {
    let mut heap = Heap::new(
        HeapConfig::default()
            .with_spaces(1 << 14, 1 << 13, 1 << 13)
            .with_region_words(256),
    )
    .unwrap();
    let leaf = heap.register_klass(Klass::instance("leaf", 0, 4)).unwrap();
    let heap = Arc::new(heap);

    // Small LABs so every round's eight buffers fit in to-space.
    let config = EvacConfig::new(8).with_lab_words(16, 16);
    for round in 0..20 {
        let obj = heap.alloc_instance(leaf).unwrap();
        heap.store_data(obj, 0, 0xdead_0000 + round);

        let results = race(managers(&heap, config), |m| {
            m.copy_to_survivor_space(obj)
        });

        let winner = results[0].0;
        assert!(results.iter().all(|(fwd, _)| *fwd == winner));
        assert!(heap.to_space().contains(winner));
        assert_eq!(heap.header(obj).forwardee(), winner);
        assert_eq!(heap.load_data(winner, 0), 0xdead_0000 + round);
        assert_eq!(heap.header(winner).age(), 1);

        let stats = total_stats(&results).total;
        assert_eq!(stats.objects_copied, 1);
        assert_eq!(stats.copies_lost, 7);
        assert_eq!(stats.promotion_failures, 0);
    }
}

#[test]
fn test_young_lab_refills_instead_of_failing() {
    let mut heap = Heap::new(HeapConfig::default().with_spaces(1 << 12, 1 << 12, 1 << 10))
        .unwrap();
    let pair = heap.register_klass(Klass::instance("pair", 0, 2)).unwrap();
    let heap = Arc::new(heap);
    let objs: Vec<_> = (0..3).map(|_| heap.alloc_instance(pair).unwrap()).collect();

    // Room for exactly two three-word objects per LAB.
    let config = EvacConfig::new(1).with_lab_words(6, 64);
    let mut manager = managers(&heap, config).pop().unwrap();

    let a = manager.copy_to_survivor_space(objs[0]);
    let b = manager.copy_to_survivor_space(objs[1]);
    assert_eq!(b, a.add_words(3));
    assert_eq!(manager.young_lab().refills(), 1);
    assert_eq!(manager.young_lab().free_words(), 0);

    let c = manager.copy_to_survivor_space(objs[2]);
    assert_eq!(manager.young_lab().refills(), 2);
    assert_eq!(c, manager.young_lab().bottom());
    assert!(heap.to_space().contains(c));

    manager.drain_stacks_depth(true);
    manager.flush_labs();
    let stats = manager.stats();
    assert_eq!(stats.young_lab_refills, 2);
    assert_eq!(stats.promotion_failures, 0);
    assert_eq!(stats.objects_copied, 3);
    assert!(!manager.promotion_failed());
}

#[test]
fn test_promotion_failure_is_recorded_once_per_object() {
    let mut heap = Heap::new(
        HeapConfig::default()
            .with_spaces(256, 1024, 256)
            .with_region_words(64),
    )
    .unwrap();
    let unit = heap.register_klass(Klass::instance("unit", 0, 0)).unwrap();
    let link = heap.register_klass(Klass::instance("link", 1, 1)).unwrap();
    let heap = Arc::new(heap);

    let parent = heap.alloc_instance(link).unwrap();
    let child = heap.alloc_instance(link).unwrap();
    heap.store_ref(parent, 0, child);
    heap.store_data(parent, 0, 11);
    heap.store_data(child, 0, 22);

    // Fill the old generation to the last word.
    while heap.alloc_old_instance(unit).is_some() {}
    assert_eq!(heap.old().free_words(), 0);

    // Threshold 0 sends everything straight to the full old generation.
    let config = EvacConfig::new(8).with_tenuring_threshold(0);
    let results = race(managers(&heap, config), |m| m.copy_to_survivor_space(parent));

    assert!(results.iter().all(|(fwd, _)| *fwd == parent));
    let stats = total_stats(&results).total;
    // The parent and, through the winner's scan, the child.
    assert_eq!(stats.promotion_failures, 2);
    assert_eq!(stats.objects_promoted, 0);
    let failed: Vec<_> = results.iter().filter(|(_, m)| m.promotion_failed()).collect();
    assert_eq!(failed.len(), 1, "exactly one thread wins the self-forward");
    assert!(heap.header(parent).is_self_forwarded(parent));
    assert!(heap.header(child).is_self_forwarded(child));

    let preserved: usize = results.iter().map(|(_, m)| m.preserved_marks().len()).sum();
    assert_eq!(preserved, 2);
    for (_, mut manager) in results {
        manager.restore_preserved_marks();
    }
    assert!(heap.header(parent).is_normal());
    assert!(heap.header(child).is_normal());
    assert_eq!(heap.load_ref(parent, 0), child);
    assert_eq!(heap.load_data(parent, 0), 11);
    assert_eq!(heap.load_data(child, 0), 22);
}
