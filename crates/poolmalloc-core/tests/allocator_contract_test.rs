#![allow(unsafe_code)]

use poolmalloc_core::{Allocator, AllocatorConfig};

fn allocator(config: AllocatorConfig) -> Allocator {
    Allocator::builder(config)
        .background_maintenance(false)
        .build()
        .expect("allocator")
}

#[test]
fn every_class_boundary_is_aligned() {
    let layouts: [(usize, Vec<usize>); 3] = [
        (8, AllocatorConfig::default().size_classes),
        (16, vec![16, 48, 96, 256, 1024]),
        (64, vec![64, 192, 512, 2048]),
    ];
    for (alignment, classes) in layouts {
        let alloc = allocator(
            AllocatorConfig::default()
                .with_alignment(alignment)
                .with_size_classes(classes),
        );
        let config = alloc.config();
        let mut boundaries: Vec<usize> = config.size_classes.clone();
        boundaries.extend(config.size_classes.iter().map(|s| s + 1));
        boundaries.push(1);
        boundaries.push(5000);

        let mut live = Vec::new();
        for size in boundaries {
            let ptr = alloc.allocate(size).expect("allocation");
            assert_eq!(
                ptr.as_ptr() as usize % alignment,
                0,
                "size {size} misaligned at alignment {alignment}"
            );
            live.push(ptr);
        }
        for ptr in live {
            unsafe { alloc.deallocate(ptr.as_ptr()) };
        }
        assert_eq!(alloc.stats().current_used, 0);
    }
}

#[test]
fn allocate_then_free_restores_usage() {
    let alloc = allocator(AllocatorConfig::default());
    let keep = alloc.allocate(300).unwrap();
    for size in [1usize, 8, 33, 512, 1024, 1025, 70_000] {
        let before = alloc.stats();
        let ptr = alloc.allocate(size).unwrap();
        unsafe { alloc.deallocate(ptr.as_ptr()) };
        let after = alloc.stats();
        assert_eq!(after.current_used, before.current_used, "size {size}");
        assert_eq!(after.alloc_count, before.alloc_count + 1);
        assert_eq!(after.free_count, before.free_count + 1);
    }
    unsafe { alloc.deallocate(keep.as_ptr()) };
}

#[test]
fn uncached_free_lands_on_pool_free_list() {
    let alloc = allocator(AllocatorConfig::default().with_thread_cache(false));
    let ptr = alloc.allocate(100).unwrap();
    let pool = alloc.stats().pools[4];
    assert_eq!((pool.in_use, pool.free), (1, 0));

    unsafe { alloc.deallocate(ptr.as_ptr()) };
    let stats = alloc.stats();
    assert_eq!((stats.pools[4].in_use, stats.pools[4].free), (0, 1));
    assert_eq!(stats.current_free, 128);
    assert_eq!(stats.cached_blocks, 0);

    let again = alloc.allocate(120).unwrap();
    assert_eq!(again, ptr);
    assert_eq!(alloc.stats().current_free, 0);
    unsafe { alloc.deallocate(again.as_ptr()) };
}

#[test]
fn second_free_changes_nothing() {
    for thread_cache in [true, false] {
        let alloc = allocator(AllocatorConfig::default().with_thread_cache(thread_cache));
        for size in [24usize, 4096] {
            let ptr = alloc.allocate(size).unwrap();
            unsafe { alloc.deallocate(ptr.as_ptr()) };
            let once = alloc.stats();
            unsafe { alloc.deallocate(ptr.as_ptr()) };
            let twice = alloc.stats();

            assert_eq!(twice.invalid_frees, once.invalid_frees + 1);
            let mut normalized = twice.clone();
            normalized.invalid_frees = once.invalid_frees;
            assert_eq!(normalized, once, "size {size}, cache {thread_cache}");
        }
    }
}

#[test]
fn null_free_is_ignored() {
    let alloc = allocator(AllocatorConfig::default());
    unsafe { alloc.deallocate(std::ptr::null_mut()) };
    let stats = alloc.stats();
    assert_eq!(stats.free_count, 0);
    assert_eq!(stats.invalid_frees, 0);
}

#[test]
fn store_and_free_scenario() {
    let alloc = allocator(AllocatorConfig::default());
    let ptr = alloc.allocate(64).expect("64 bytes");
    unsafe {
        ptr.as_ptr().cast::<i32>().write(42);
        assert_eq!(ptr.as_ptr().cast::<i32>().read(), 42);
        alloc.deallocate(ptr.as_ptr());
    }
    let stats = alloc.stats();
    assert_eq!(stats.alloc_count, 1);
    assert_eq!(stats.free_count, 1);
    assert_eq!(stats.current_used, 0);
}

#[test]
fn in_place_shrink_of_oversized_block_keeps_layout_bytes() {
    let alloc = allocator(AllocatorConfig::default());
    let ptr = alloc.allocate(2000).unwrap();
    let same = unsafe { alloc.reallocate(ptr.as_ptr(), 1500) }.unwrap();
    assert_eq!(same, ptr);

    let stats = alloc.stats();
    assert_eq!(stats.current_used, 1500);
    assert_eq!(stats.fallback_bytes, 2000);
    assert_eq!(stats.fallback_blocks, 1);

    unsafe { alloc.deallocate(ptr.as_ptr()) };
    let stats = alloc.stats();
    assert_eq!(stats.current_used, 0);
    assert_eq!(stats.fallback_bytes, 0);
    assert_eq!(stats.fallback_blocks, 0);
}

#[test]
fn oversized_requests_bypass_pools() {
    let alloc = allocator(AllocatorConfig::default());
    let ptr = alloc.allocate(1025).unwrap();
    let stats = alloc.stats();
    assert!(stats.pools.iter().all(|p| p.total_carved == 0 && p.total() == 0));
    assert_eq!(stats.fallback_blocks, 1);
    assert_eq!(stats.fallback_bytes, 1025);
    assert_eq!(stats.current_used, 1025);

    unsafe { alloc.deallocate(ptr.as_ptr()) };
    let stats = alloc.stats();
    assert!(stats.pools.iter().all(|p| p.total_carved == 0 && p.total() == 0));
    assert_eq!(stats.fallback_blocks, 0);
    assert_eq!(stats.current_used, 0);
    assert_eq!(stats.current_free, 0);
}

#[test]
fn reallocate_in_place_window() {
    let alloc = allocator(AllocatorConfig::default());
    for (old, new) in [(100usize, 100usize), (100, 51), (100, 75), (2000, 1500), (1, 1)] {
        let ptr = alloc.allocate(old).unwrap();
        let same = unsafe { alloc.reallocate(ptr.as_ptr(), new) }.unwrap();
        assert_eq!(same, ptr, "{old} -> {new}");
        assert_eq!(alloc.usable_size(same.as_ptr()), Some(new));
        assert_eq!(alloc.stats().current_used, new as u64);
        unsafe { alloc.deallocate(same.as_ptr()) };
        assert_eq!(alloc.stats().current_used, 0);
    }
}

#[test]
fn reallocate_moves_and_preserves_prefix() {
    let alloc = allocator(AllocatorConfig::default());
    for (old, new) in [(100usize, 50usize), (100, 101), (16, 4000), (4000, 16), (3000, 5000)] {
        let ptr = alloc.allocate(old).unwrap();
        unsafe {
            for i in 0..old {
                ptr.as_ptr().add(i).write((i % 251) as u8);
            }
        }
        let moved = unsafe { alloc.reallocate(ptr.as_ptr(), new) }.unwrap();
        assert_ne!(moved, ptr, "{old} -> {new}");
        for i in 0..old.min(new) {
            assert_eq!(unsafe { moved.as_ptr().add(i).read() }, (i % 251) as u8);
        }
        assert_eq!(alloc.usable_size(ptr.as_ptr()), None);
        assert_eq!(alloc.stats().current_used, new as u64);
        unsafe { alloc.deallocate(moved.as_ptr()) };
    }
}

#[test]
fn reallocate_edge_cases() {
    let alloc = allocator(AllocatorConfig::default());

    let fresh = unsafe { alloc.reallocate(std::ptr::null_mut(), 40) }.unwrap();
    assert_eq!(alloc.usable_size(fresh.as_ptr()), Some(40));

    assert!(unsafe { alloc.reallocate(fresh.as_ptr(), 0) }.is_none());
    assert_eq!(alloc.usable_size(fresh.as_ptr()), Some(40));

    let mut local = [0u8; 16];
    assert!(unsafe { alloc.reallocate(local.as_mut_ptr(), 8) }.is_none());

    unsafe { alloc.deallocate(fresh.as_ptr()) };
    assert!(unsafe { alloc.reallocate(fresh.as_ptr(), 8) }.is_none());
    assert_eq!(alloc.stats().current_used, 0);
}

#[test]
fn totals_stay_balanced() {
    let alloc = allocator(AllocatorConfig::default());
    let a = alloc.allocate(10).unwrap();
    let b = alloc.allocate(2000).unwrap();
    let a = unsafe { alloc.reallocate(a.as_ptr(), 900) }.unwrap();
    let b = unsafe { alloc.reallocate(b.as_ptr(), 1200) }.unwrap();
    let stats = alloc.stats();
    assert_eq!(stats.total_allocated - stats.total_freed, stats.current_used);
    assert_eq!(stats.current_used, 2100);
    unsafe {
        alloc.deallocate(a.as_ptr());
        alloc.deallocate(b.as_ptr());
    }
    let stats = alloc.stats();
    assert_eq!(stats.total_allocated, stats.total_freed);
}

#[test]
fn stats_render_as_text_and_json() {
    let alloc = allocator(AllocatorConfig::default());
    let ptr = alloc.allocate(8).unwrap();
    let stats = alloc.stats();
    let text = stats.to_string();
    assert!(text.contains("Current Used: 8 bytes"));
    assert!(text.contains("Pool[0] (Block Size: 8): Used=1, Free=0, Total=1"));
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["pools"].as_array().unwrap().len(), 8);
    assert_eq!(json["pools"][0]["in_use"], 1);
    unsafe { alloc.deallocate(ptr.as_ptr()) };
}

#[test]
fn config_copy_is_independent() {
    let config = AllocatorConfig::default().with_thread_cache_capacity(4);
    let alloc = allocator(config.clone());
    let mut copy = alloc.config();
    assert_eq!(copy, config);
    copy.thread_cache_capacity = 99;
    assert_eq!(alloc.config().thread_cache_capacity, 4);
}

#[test]
fn invalid_config_is_rejected_at_build() {
    let err = Allocator::new(AllocatorConfig::default().with_alignment(3)).unwrap_err();
    assert!(err.to_string().contains("power of two"));
    let err = Allocator::new(AllocatorConfig::default().with_size_classes(vec![9, 12])).unwrap_err();
    assert!(err.to_string().contains("ascending"));
}
