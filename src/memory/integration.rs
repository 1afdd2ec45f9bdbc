#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::buddy;
    use crate::memory::cells::{CELL_PAYLOAD_OFFSET, CELL_SIZE, CELLS_PER_SUPERBLOCK, SUPERBLOCK_SIZE};
    use crate::memory::context::{Context, ContextConfig};
    use crate::sync::Arc;
    use crate::sync::thread;

    fn ctx_with(reserve: usize) -> Context {
        Context::with_config(ContextConfig {
            reserve_size: reserve,
            ..ContextConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn minimal_lifecycle() {
        let ctx = ctx_with(64 * 1024 * 1024);
        let p = ctx.alloc_bytes(16, 0, 8).unwrap();
        // Safety: p is live.
        unsafe {
            *p.as_ptr() = 1;
            ctx.free_bytes(p.as_ptr());
        }
        #[cfg(feature = "leak-tracking")]
        assert_eq!(ctx.live_allocation_count(), 0);
        drop(ctx);
    }

    #[test]
    fn size_class_sweep_with_patterns() {
        let ctx = ctx_with(128 * 1024 * 1024);
        let classes = [16usize, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

        let ptrs: Vec<_> = classes
            .iter()
            .map(|&size| {
                let p = ctx.alloc_bytes(size, 0, 8).unwrap();
                // Class-dependent fill pattern across the full request.
                // Safety: p spans `size` exclusive bytes.
                unsafe {
                    std::ptr::write_bytes(p.as_ptr(), (size % 251) as u8, size)
                };
                (p, size)
            })
            .collect();

        // Verify every pattern survived its neighbours.
        for &(p, size) in &ptrs {
            // Safety: still live.
            unsafe {
                for off in [0, size / 2, size - 1] {
                    assert_eq!(
                        *p.as_ptr().add(off),
                        (size % 251) as u8,
                        "pattern damaged in class {size} at offset {off}"
                    );
                }
            }
        }

        // Free in reverse order.
        for &(p, _) in ptrs.iter().rev() {
            // Safety: live pointers.
            unsafe { ctx.free_bytes(p.as_ptr()) };
        }

        #[cfg(feature = "stats")]
        assert_eq!(ctx.get_stats().current_allocated, 0);
    }

    #[test]
    fn buddy_coalescing_rebuilds_superblock() {
        let ctx = ctx_with(256 * 1024 * 1024);

        // 64 minimum-order blocks: exactly one superblock's worth.
        let request = 32 * 1024 - buddy::HEADER_SIZE;
        let mut ptrs: Vec<_> = (0..64)
            .map(|_| ctx.alloc_large(request, 0, false).unwrap())
            .collect();
        let committed = ctx.committed_bytes();

        // 50-50 shuffled free order.
        let len = ptrs.len();
        for i in 0..len {
            ptrs.swap(i, (i * 37 + 11) % len);
        }
        for p in ptrs {
            // Safety: live buddy blocks.
            unsafe { ctx.free_bytes(p.as_ptr()) };
        }

        // One 2MB block must fit into the coalesced space without another
        // superblock commit.
        let big = ctx.alloc_large(buddy::MAX_BLOCK_SIZE, 0, false).unwrap();
        assert!(
            ctx.committed_bytes() <= committed,
            "coalescing failed: a fresh superblock was committed"
        );
        // Safety: big is live.
        unsafe { ctx.free_bytes(big.as_ptr()) };
    }

    #[test]
    fn decommit_returns_superblock_granular_bytes() {
        let ctx = ctx_with(64 * 1024 * 1024);

        // Fill and free a full superblock's worth of cells.
        let mut cells = Vec::new();
        for i in 0..CELLS_PER_SUPERBLOCK {
            let c = ctx.alloc_cell(0).unwrap();
            // Safety: payload is ours.
            unsafe { *c.as_ptr().add(CELL_PAYLOAD_OFFSET) = i as u8 };
            cells.push(c);
        }
        for c in cells {
            // Safety: live cells.
            unsafe { ctx.free_cell(c.as_ptr()) };
        }

        let released = ctx.decommit_unused();
        assert!(released >= CELLS_PER_SUPERBLOCK * CELL_SIZE);
        assert!(released.is_multiple_of(SUPERBLOCK_SIZE));

        // A subsequent cell allocation recommits transparently.
        let c = ctx.alloc_cell(0).unwrap();
        // Safety: recommitted payload must be writable.
        unsafe {
            *c.as_ptr().add(CELL_PAYLOAD_OFFSET) = 0x42;
            assert_eq!(*c.as_ptr().add(CELL_PAYLOAD_OFFSET), 0x42);
            ctx.free_cell(c.as_ptr());
        }
    }

    #[test]
    fn warm_reserve_bounds_empty_cells() {
        let ctx = ctx_with(256 * 1024 * 1024);

        // Push several cells' worth of one class through alloc/free.
        let mut ptrs = Vec::new();
        for _ in 0..2000 {
            ptrs.push(ctx.alloc_bytes(4096, 0, 8).unwrap());
        }
        for p in ptrs {
            // Safety: live pointers.
            unsafe { ctx.free_bytes(p.as_ptr()) };
        }
        ctx.flush_thread_bin_caches();

        // After the flush the bins hold at most the warm reserve; the rest
        // of the cells went back to the pool and decommit can reclaim
        // nearly everything.
        let released = ctx.decommit_unused();
        assert!(released > 0, "churned cells should be reclaimable");
    }

    #[test]
    fn mixed_sizes_across_all_tiers() {
        let ctx = ctx_with(256 * 1024 * 1024);
        let sizes = [
            1usize,
            16,
            100,
            4 * 1024,
            8 * 1024,
            12 * 1024,
            64 * 1024,
            1024 * 1024,
            3 * 1024 * 1024,
        ];

        let mut live = Vec::new();
        for round in 0u8..4 {
            for &size in &sizes {
                let p = ctx.alloc_bytes(size, round, 8).unwrap();
                // Safety: p spans `size` exclusive bytes.
                unsafe {
                    *p.as_ptr() = round;
                    *p.as_ptr().add(size - 1) = round;
                }
                live.push((p, size, round));
            }
            // Free every other allocation to interleave tiers.
            let mut i = 0;
            live.retain(|&(p, size, r)| {
                i += 1;
                if i % 2 == 0 {
                    // Safety: live pointer.
                    unsafe {
                        assert_eq!(*p.as_ptr(), r);
                        assert_eq!(*p.as_ptr().add(size - 1), r);
                        ctx.free_bytes(p.as_ptr());
                    }
                    false
                } else {
                    true
                }
            });
        }

        for (p, size, r) in live {
            // Safety: live pointer.
            unsafe {
                assert_eq!(*p.as_ptr(), r);
                assert_eq!(*p.as_ptr().add(size - 1), r);
                ctx.free_bytes(p.as_ptr());
            }
        }

        #[cfg(feature = "stats")]
        assert_eq!(ctx.get_stats().current_allocated, 0);
    }

    #[test]
    fn multithreaded_mixed_stress() {
        let ctx = Arc::new(ctx_with(512 * 1024 * 1024));
        let threads = 8;
        let ops = 400;

        let mut handles = Vec::new();
        for t in 0..threads {
            let ctx = Arc::clone(&ctx);
            handles.push(thread::spawn(move || {
                let sizes = [16usize, 64, 256, 1024, 4096, 10000, 64 * 1024];
                let mut held: Vec<(*mut u8, usize)> = Vec::new();

                for i in 0..ops {
                    let size = sizes[(t * 7 + i) % sizes.len()];
                    let p = ctx.alloc_bytes(size, t as u8, 8).unwrap();
                    // Safety: p spans `size` exclusive bytes.
                    unsafe {
                        *p.as_ptr() = t as u8;
                        *p.as_ptr().add(size - 1) = i as u8;
                    }
                    held.push((p.as_ptr(), size));

                    if i % 3 == 0
                        && let Some((q, qsize)) = held.pop()
                    {
                        // Safety: q is live and exclusively ours.
                        unsafe {
                            assert_eq!(*q, t as u8, "cross-thread corruption");
                            assert_eq!(*q.add(qsize - 1), i as u8);
                            ctx.free_bytes(q);
                        }
                    }
                }

                for (p, _) in held {
                    // Safety: live pointers.
                    unsafe {
                        assert_eq!(*p, t as u8, "cross-thread corruption");
                        ctx.free_bytes(p);
                    }
                }
                ctx.flush_thread_caches();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        #[cfg(feature = "stats")]
        assert_eq!(ctx.get_stats().current_allocated, 0);
    }

    #[test]
    fn producer_consumer_handover() {
        let ctx = Arc::new(ctx_with(128 * 1024 * 1024));
        let (tx, rx) = std::sync::mpsc::channel::<(usize, usize)>();

        let producer = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                for i in 0..500usize {
                    let size = 16 << (i % 8);
                    let p = ctx.alloc_bytes(size, 1, 8).unwrap();
                    // Safety: p spans `size` exclusive bytes.
                    unsafe {
                        std::ptr::write_bytes(p.as_ptr(), (i % 256) as u8, size);
                    }
                    // The channel provides the acquire-release edge.
                    tx.send((p.as_ptr() as usize, size)).unwrap();
                }
                ctx.flush_thread_caches();
            })
        };

        let consumer = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                let mut count = 0usize;
                while let Ok((addr, size)) = rx.recv() {
                    let p = addr as *mut u8;
                    // Safety: ownership was transferred through the channel.
                    unsafe {
                        assert_eq!(*p, (count % 256) as u8, "handover corruption");
                        assert_eq!(*p.add(size - 1), (count % 256) as u8);
                        ctx.free_bytes(p);
                    }
                    count += 1;
                }
                assert_eq!(count, 500);
                ctx.flush_thread_caches();
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();

        #[cfg(feature = "stats")]
        assert_eq!(ctx.get_stats().current_allocated, 0);
    }

    #[test]
    fn address_reuse_is_bounded_single_threaded() {
        let ctx = ctx_with(64 * 1024 * 1024);

        // With a warm bin cache, alloc-free cycles of one class revisit a
        // bounded set of addresses no matter how many cycles run.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            let p = ctx.alloc_bytes(64, 0, 8).unwrap();
            seen.insert(p.as_ptr() as usize);
            // Safety: p is live.
            unsafe { ctx.free_bytes(p.as_ptr()) };
        }
        assert!(
            seen.len() <= 4,
            "expected tight address reuse, saw {} distinct addresses",
            seen.len()
        );
    }
}
