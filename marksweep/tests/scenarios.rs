//! End to end collection scenarios against the public collector API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use blockalloc::SystemPages;
use fnv::FnvHashSet;

use marksweep::{
    AllDirty, Collector, CollectorCreateInfo, Descriptor, Disposition, GcConfig, KindId,
    KindProperties, MarkState, RawPtr, RootSlots, Tracer, BLOCK_SIZE, WORD,
};

fn setup(info: CollectorCreateInfo) -> (Collector, Arc<RootSlots>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let collector = Collector::new(GcConfig::from_info(&info));
    let roots = Arc::new(RootSlots::new(0));
    collector.add_roots(roots.clone());
    (collector, roots)
}

/// `count` two word objects, each pointing at the next
fn chain(collector: &Collector, kind: KindId, count: usize) -> Vec<RawPtr> {
    let objects: Vec<RawPtr> = (0..count)
        .map(|_| collector.allocate(kind, 2 * WORD).unwrap())
        .collect();
    for pair in objects.windows(2) {
        collector.store(pair[0], 0, pair[1].as_word()).unwrap();
    }
    objects
}

fn marked_count(collector: &Collector, objects: &[RawPtr]) -> usize {
    objects.iter().filter(|obj| collector.is_marked(**obj)).count()
}

#[test]
fn test_unreachable_chain_is_reclaimed() {
    let (collector, _roots) = setup(CollectorCreateInfo {
        release_empty_blocks: Some(false),
        ..CollectorCreateInfo::default()
    });
    let objects = chain(&collector, KindId::NORMAL, 1000);

    let report = collector.collect();
    println!("test_unreachable_chain_is_reclaimed got {} expected {}", report.objects_reclaimed, 1000);
    assert!(report.objects_reclaimed == 1000);
    assert!(collector.stats().marked == 0);

    collector.reclaim_all();
    let free: FnvHashSet<RawPtr> = collector.free_objects(KindId::NORMAL).into_iter().collect();
    assert!(objects.iter().all(|obj| free.contains(obj)));
}

#[test]
fn test_rooted_chain_keeps_its_tail() {
    let (collector, roots) = setup(CollectorCreateInfo::default());
    let objects = chain(&collector, KindId::NORMAL, 1000);
    roots.push(objects[500]);

    collector.collect();

    let got = marked_count(&collector, &objects);
    println!("test_rooted_chain_keeps_its_tail got {} expected {}", got, 500);
    assert!(got == 500);
    assert!(collector.is_marked(objects[999]));
    assert!(!collector.is_marked(objects[499]));
}

#[test]
fn test_pointer_free_objects_are_not_scanned() {
    let (collector, roots) = setup(CollectorCreateInfo::default());
    let objects = chain(&collector, KindId::PTRFREE, 1000);
    roots.push(objects[500]);

    collector.collect();

    let got = marked_count(&collector, &objects);
    println!("test_pointer_free_objects_are_not_scanned got {} expected {}", got, 1);
    assert!(got == 1);
}

#[test]
fn test_disclaim_sees_every_dead_object() {
    let (collector, _roots) = setup(CollectorCreateInfo::default());
    let counted = collector
        .register_kind(KindProperties::normal("counted"))
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let disclaim = move |_obj: RawPtr| {
        counter.fetch_add(1, Ordering::SeqCst);
        Disposition::Release
    };
    collector
        .register_disclaim_callback(counted, Arc::new(disclaim), false)
        .unwrap();

    for _ in 0..100 {
        collector.allocate(counted, 4 * WORD).unwrap();
    }

    let report = collector.collect();
    assert!(seen.load(Ordering::SeqCst) == 100);
    assert!(report.disclaimed == 100);
    assert!(report.blocks_released == 1);

    collector.collect();
    assert!(seen.load(Ordering::SeqCst) == 100);
}

#[test]
fn test_disclaim_keep_is_offered_again() {
    let (collector, _roots) = setup(CollectorCreateInfo::default());
    let sticky = collector
        .register_kind(KindProperties::normal("sticky"))
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let disclaim = move |_obj: RawPtr| {
        counter.fetch_add(1, Ordering::SeqCst);
        Disposition::Keep
    };
    collector
        .register_disclaim_callback(sticky, Arc::new(disclaim), false)
        .unwrap();

    let objects: Vec<RawPtr> = (0..10)
        .map(|_| collector.allocate(sticky, 2 * WORD).unwrap())
        .collect();

    let report = collector.collect();
    assert!(report.resurrected == 10);
    assert!(report.objects_reclaimed == 0);
    assert!(marked_count(&collector, &objects) == 10);

    collector.collect();
    let got = seen.load(Ordering::SeqCst);
    println!("test_disclaim_keep_is_offered_again got {} expected {}", got, 20);
    assert!(got == 20);
}

#[test]
fn test_disclaim_release_in_nearly_full_block() {
    let (collector, roots) = setup(CollectorCreateInfo::default());
    let dense = collector.register_kind(KindProperties::normal("dense")).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let disclaim = move |_obj: RawPtr| {
        counter.fetch_add(1, Ordering::SeqCst);
        Disposition::Release
    };
    collector
        .register_disclaim_callback(dense, Arc::new(disclaim), false)
        .unwrap();

    // fill exactly one block and keep all but its last object
    let objects: Vec<RawPtr> = (0..BLOCK_SIZE / (2 * WORD))
        .map(|_| collector.allocate(dense, 2 * WORD).unwrap())
        .collect();
    assert!(collector.stats().blocks == 1);
    let (dead, live) = objects.split_last().unwrap();
    for object in live {
        roots.push(*object);
    }

    let report = collector.collect();
    collector.reclaim_all();
    assert!(report.disclaimed == 1);
    assert!(report.objects_reclaimed == 1);
    assert!(collector.free_objects(dense) == vec![*dead]);

    for _ in 0..2 {
        let report = collector.collect();
        collector.reclaim_all();
        assert!(report.objects_reclaimed == 0);
    }
    let got = seen.load(Ordering::SeqCst);
    println!("test_disclaim_release_in_nearly_full_block got {} expected {}", got, 1);
    assert!(got == 1);
}

#[test]
fn test_disclaim_after_blocks_exist() {
    let (collector, _roots) = setup(CollectorCreateInfo::default());
    let late = collector.register_kind(KindProperties::normal("late")).unwrap();
    collector.allocate(late, WORD).unwrap();

    let disclaim = |_obj: RawPtr| Disposition::Release;
    assert!(collector
        .register_disclaim_callback(late, Arc::new(disclaim), false)
        .is_err());
}

#[test]
fn test_finalizer_runs_once_and_referents_survive() {
    let (collector, _roots) = setup(CollectorCreateInfo::default());

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let body = collector
        .allocate_finalized(2 * WORD, move |_body| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let referent = collector.allocate(KindId::NORMAL, 2 * WORD).unwrap();
    collector.store(body, 0, referent.as_word()).unwrap();

    collector.collect();
    assert!(runs.load(Ordering::SeqCst) == 1);
    assert!(collector.is_marked(referent));

    collector.collect();
    assert!(runs.load(Ordering::SeqCst) == 1);
    assert!(!collector.is_marked(referent));
}

#[test]
fn test_advance_after_completion() {
    let (collector, roots) = setup(CollectorCreateInfo::default());
    let objects = chain(&collector, KindId::NORMAL, 10);
    roots.push(objects[0]);

    assert!(collector.advance_one_slice());
    assert!(collector.begin_cycle());
    while !collector.advance_one_slice() {}

    assert!(collector.mark_state() == MarkState::Idle);
    assert!(collector.advance_one_slice());
    assert!(collector.advance_one_slice());
    assert!(marked_count(&collector, &objects) == 10);
}

#[test]
fn test_tiny_mark_stack_is_still_complete() {
    let (collector, roots) = setup(CollectorCreateInfo {
        initial_mark_stack_size: Some(4),
        max_mark_stack_size: Some(4),
        ..CollectorCreateInfo::default()
    });

    // binary tree, node i points at 2i+1 and 2i+2
    let count = 1000;
    let nodes: Vec<RawPtr> = (0..count)
        .map(|_| collector.allocate(KindId::NORMAL, 2 * WORD).unwrap())
        .collect();
    for i in 0..count {
        for (field, child) in [2 * i + 1, 2 * i + 2].iter().enumerate() {
            if *child < count {
                collector.store(nodes[i], field, nodes[*child].as_word()).unwrap();
            }
        }
    }
    roots.push(nodes[0]);

    collector.collect();

    let got = marked_count(&collector, &nodes);
    println!("test_tiny_mark_stack_is_still_complete got {} expected {}", got, count);
    assert!(got == count);
    assert!(collector.stats().mark_stack_size == 4);
}

#[test]
fn test_overflow_grows_the_stack() {
    let (collector, roots) = setup(CollectorCreateInfo {
        initial_mark_stack_size: Some(4),
        max_mark_stack_size: Some(1024),
        ..CollectorCreateInfo::default()
    });
    let objects: Vec<RawPtr> = (0..64)
        .map(|_| collector.allocate(KindId::NORMAL, 2 * WORD).unwrap())
        .collect();
    let fan = collector.allocate(KindId::NORMAL, 64 * WORD).unwrap();
    for (index, obj) in objects.iter().enumerate() {
        collector.store(fan, index, obj.as_word()).unwrap();
    }
    roots.push(fan);

    collector.collect();

    assert!(marked_count(&collector, &objects) == 64);
    let size = collector.stats().mark_stack_size;
    println!("test_overflow_grows_the_stack got {} expected more than {}", size, 4);
    assert!(size > 4);
}

#[test]
fn test_incremental_rescue_finds_late_stores() {
    let (collector, roots) = setup(CollectorCreateInfo {
        incremental: Some(true),
        ..CollectorCreateInfo::default()
    });
    let holder = collector.allocate(KindId::NORMAL, 2 * WORD).unwrap();
    let hidden = collector.allocate(KindId::NORMAL, 2 * WORD).unwrap();
    roots.push(holder);

    assert!(collector.begin_cycle());
    let mut done = false;
    while !done && collector.mark_state() != MarkState::PushDirtyRoots {
        done = collector.advance_one_slice();
    }
    assert!(!done);
    assert!(collector.is_marked(holder));
    assert!(!collector.is_marked(hidden));

    // written after the holder was scanned
    collector.store(holder, 1, hidden.as_word()).unwrap();
    while !collector.advance_one_slice() {}

    assert!(collector.is_marked(hidden));
    let report = collector.sweep(false);
    assert!(report.objects_reclaimed == 0);
}

#[test]
fn test_pointer_moved_into_scanned_object_survives() {
    for incremental in [false, true] {
        let (collector, roots) = setup(CollectorCreateInfo {
            incremental: Some(incremental),
            ..CollectorCreateInfo::default()
        });
        // the big object takes several slices to scan, and the moved
        // pointer sits in its last word
        let big = collector.allocate(KindId::NORMAL, BLOCK_SIZE).unwrap();
        let last = BLOCK_SIZE / WORD - 1;
        let scanned = collector.allocate(KindId::NORMAL, 2 * WORD).unwrap();
        let moved = collector.allocate(KindId::NORMAL, 2 * WORD).unwrap();
        collector.store(big, last, moved.as_word()).unwrap();
        roots.push(big);
        roots.push(scanned);

        assert!(collector.begin_cycle());
        while collector.mark_state() != MarkState::RootsPushed {
            assert!(!collector.advance_one_slice());
        }
        assert!(!collector.advance_one_slice());
        assert!(!collector.is_marked(moved));

        collector.store(scanned, 0, moved.as_word()).unwrap();
        collector.store(big, last, 0).unwrap();
        while !collector.advance_one_slice() {}

        println!(
            "test_pointer_moved_into_scanned_object_survives incremental {} got {} expected {}",
            incremental,
            collector.is_marked(moved),
            true
        );
        assert!(collector.is_marked(moved));
        let report = collector.sweep(false);
        assert!(report.objects_reclaimed == 0);
        assert!(collector.load(scanned, 0) == Ok(moved.as_word()));
    }
}

#[test]
fn test_large_root_set_does_not_invalidate() {
    let (collector, roots) = setup(CollectorCreateInfo {
        initial_mark_stack_size: Some(64),
        max_mark_stack_size: Some(64),
        ..CollectorCreateInfo::default()
    });
    let objects: Vec<RawPtr> = (0..200)
        .map(|_| collector.allocate(KindId::NORMAL, 2 * WORD).unwrap())
        .collect();
    for object in objects.iter() {
        roots.push(*object);
    }

    assert!(collector.begin_cycle());
    let mut states = Vec::new();
    while !collector.advance_one_slice() {
        states.push(collector.mark_state());
    }

    println!("test_large_root_set_does_not_invalidate got {:?}", states);
    assert!(!states.contains(&MarkState::Invalid));
    assert!(!states.contains(&MarkState::PartiallyInvalid));
    assert!(marked_count(&collector, &objects) == 200);
}

#[test]
fn test_abandoned_cycle_resumes() {
    let (collector, roots) = setup(CollectorCreateInfo::default());
    let objects = chain(&collector, KindId::NORMAL, 300);
    roots.push(objects[0]);

    assert!(collector.begin_cycle());
    collector.advance_one_slice();
    collector.advance_one_slice();
    collector.abandon_cycle();
    assert!(collector.mark_state() == MarkState::Invalid);
    assert!(collector.sweep(false).deferred);

    assert!(collector.begin_cycle());
    while !collector.advance_one_slice() {}
    assert!(marked_count(&collector, &objects) == 300);
}

#[test]
fn test_uncollectable_until_freed() {
    let (collector, _roots) = setup(CollectorCreateInfo::default());
    let pinned = collector
        .allocate(KindId::UNCOLLECTABLE, 2 * WORD)
        .unwrap();
    let target = collector.allocate(KindId::NORMAL, 2 * WORD).unwrap();
    collector.store(pinned, 0, target.as_word()).unwrap();

    collector.collect();
    assert!(collector.is_marked(pinned));
    assert!(collector.is_marked(target));

    collector.free(pinned).unwrap();
    collector.collect();
    assert!(!collector.is_marked(target));
}

#[test]
fn test_scan_proc_descriptor() {
    let (collector, roots) = setup(CollectorCreateInfo::default());

    // marks only the field whose index is the environment word
    let field_scanner = |object: RawPtr, env: usize, tracer: &mut Tracer<'_>| {
        if let Some(word) = tracer.load_field(object, env) {
            tracer.mark(word);
        }
    };
    let proc = collector.register_scan_proc(Arc::new(field_scanner)).unwrap();
    let kind = collector
        .register_kind(KindProperties::typed("second-field", Descriptor::proc(proc, 1)))
        .unwrap();

    let object = collector.allocate(kind, 4 * WORD).unwrap();
    let first = collector.allocate(KindId::NORMAL, 2 * WORD).unwrap();
    let second = collector.allocate(KindId::NORMAL, 2 * WORD).unwrap();
    collector.store(object, 0, first.as_word()).unwrap();
    collector.store(object, 1, second.as_word()).unwrap();
    roots.push(object);

    collector.collect();
    assert!(collector.is_marked(object));
    assert!(collector.is_marked(second));
    assert!(!collector.is_marked(first));
}

#[test]
fn test_bitmap_descriptor() {
    let (collector, roots) = setup(CollectorCreateInfo::default());
    let descr = Descriptor::from_pointer_words(&[1, 3]).unwrap();
    let kind = collector
        .register_kind(KindProperties::typed("odd-fields", descr))
        .unwrap();

    let object = collector.allocate(kind, 4 * WORD).unwrap();
    let fields: Vec<RawPtr> = (0..4)
        .map(|_| collector.allocate(KindId::NORMAL, 2 * WORD).unwrap())
        .collect();
    for (index, field) in fields.iter().enumerate() {
        collector.store(object, index, field.as_word()).unwrap();
    }
    roots.push(object);

    collector.collect();
    let got: Vec<bool> = fields.iter().map(|f| collector.is_marked(*f)).collect();
    println!("test_bitmap_descriptor got {:?}", got);
    assert!(got == vec![false, true, false, true]);
}

#[test]
fn test_interior_pointers() {
    let (exact, exact_roots) = setup(CollectorCreateInfo::default());
    let object = exact.allocate(KindId::NORMAL, 4 * WORD).unwrap();
    exact_roots.push(object.offset_words(2));
    exact.collect();
    assert!(!exact.is_marked(object));

    let (interior, interior_roots) = setup(CollectorCreateInfo {
        interior_pointers: Some(true),
        ..CollectorCreateInfo::default()
    });
    let object = interior.allocate(KindId::NORMAL, 4 * WORD).unwrap();
    interior_roots.push(object.offset_words(2));
    interior.collect();
    assert!(interior.is_marked(object));
}

#[test]
fn test_leak_report() {
    let (collector, roots) = setup(CollectorCreateInfo {
        find_leak: Some(true),
        ..CollectorCreateInfo::default()
    });
    let kept = collector.allocate(KindId::NORMAL, 2 * WORD).unwrap();
    let lost: Vec<RawPtr> = (0..2)
        .map(|_| collector.allocate(KindId::NORMAL, 2 * WORD).unwrap())
        .collect();
    roots.push(kept);

    let report = collector.collect();
    let mut leaked: Vec<usize> = report.leaks.iter().map(|leak| leak.address).collect();
    leaked.sort();
    let mut expect: Vec<usize> = lost.iter().map(|obj| obj.as_word()).collect();
    expect.sort();
    println!("test_leak_report got {:?} expected {:?}", leaked, expect);
    assert!(leaked == expect);
    assert!(report.objects_reclaimed == 0);

    // nothing was reclaimed, so the same objects are reported again
    let report = collector.collect();
    assert!(report.leaks.len() == 2);
}

#[test]
fn test_exhaustion_collects_and_retries() {
    let config = GcConfig::from_info(&CollectorCreateInfo::default());
    let collector = Collector::with_pages(
        config,
        Box::new(SystemPages::with_limit(2 * BLOCK_SIZE)),
        Box::new(AllDirty),
    );

    let per_block = BLOCK_SIZE / (2 * WORD);
    for _ in 0..3 * per_block {
        collector.allocate(KindId::NORMAL, 2 * WORD).unwrap();
    }

    let stats = collector.stats();
    println!("test_exhaustion_collects_and_retries got {:?}", stats);
    assert!(stats.collections == 1);
    assert!(stats.heap_bytes <= 2 * BLOCK_SIZE);
}

#[test]
fn test_exhaustion_with_live_heap_fails() {
    let config = GcConfig::from_info(&CollectorCreateInfo::default());
    let collector = Collector::with_pages(
        config,
        Box::new(SystemPages::with_limit(BLOCK_SIZE)),
        Box::new(AllDirty),
    );
    let roots = Arc::new(RootSlots::new(0));
    collector.add_roots(roots.clone());

    let result = (0..BLOCK_SIZE).try_for_each(|_| {
        let object = collector.allocate(KindId::NORMAL, 2 * WORD)?;
        roots.push(object);
        Ok::<(), marksweep::AllocError>(())
    });
    assert!(result == Err(marksweep::AllocError::OOM));
}
