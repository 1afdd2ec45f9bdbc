//! Loom-based concurrency tests.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --lib --release`.
//!
//! These exercise the lock-free cell stack and the decommit drain under
//! every interleaving loom can explore, against the heap-backed VM mock.
//!
//! # Design notes
//!
//! - Thread counts stay at 2 and loop bodies tiny: the state space is
//!   exponential.
//! - Each model iteration builds a fresh `CellAllocator` (the mock VM
//!   backs reservations with plain heap memory).
//! - The TLS-cached fast paths are not modelled — they are single-threaded
//!   by construction. `push_global` / `pop_global` / `decommit_unused`
//!   carry all the cross-thread interaction.
//! - Cells popped in the models are never written to, so the in-cell link
//!   atomics stay valid across push/pop cycles.
#[cfg(loom)]
mod tests {
    use crate::memory::cells::{CellAllocator, SUPERBLOCK_SIZE};
    use crate::sync::Arc;

    fn small_allocator() -> Arc<CellAllocator> {
        use crate::sync::atomic::{AtomicU64, Ordering};
        loom::lazy_static! {
            static ref NEXT_ID: AtomicU64 = AtomicU64::new(0x5000_0000);
        }
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(CellAllocator::new(id, SUPERBLOCK_SIZE).unwrap())
    }

    #[test]
    fn loom_stack_push_pop_two_threads() {
        loom::model(|| {
            let cells = small_allocator();

            // Seed: one committed superblock, keep two cells out.
            let a = cells.alloc_cell().unwrap();
            let b = cells.pop_global().unwrap();

            let c1 = Arc::clone(&cells);
            let t1 = loom::thread::spawn(move || {
                c1.push_global(a);
            });
            let c2 = Arc::clone(&cells);
            let t2 = loom::thread::spawn(move || {
                c2.push_global(b);
                c2.pop_global().expect("at least b was pushed");
            });

            t1.join().unwrap();
            t2.join().unwrap();
        });
    }

    #[test]
    fn loom_concurrent_pops_never_share_a_cell() {
        loom::model(|| {
            let cells = small_allocator();
            let _first = cells.alloc_cell().unwrap(); // commits, fills stack

            let c1 = Arc::clone(&cells);
            let t1 = loom::thread::spawn(move || c1.pop_global().map(|p| p.as_ptr() as usize));
            let c2 = Arc::clone(&cells);
            let t2 = loom::thread::spawn(move || c2.pop_global().map(|p| p.as_ptr() as usize));

            let r1 = t1.join().unwrap();
            let r2 = t2.join().unwrap();
            if let (Some(x), Some(y)) = (r1, r2) {
                assert_ne!(x, y, "two pops returned the same cell");
            }
        });
    }

    #[test]
    fn loom_decommit_races_with_pop() {
        let mut builder = loom::model::Builder::new();
        builder.preemption_bound = Some(3);
        builder.check(|| {
            let cells = small_allocator();

            // All 128 cells on the stack: the superblock is decommittable.
            let first = cells.alloc_cell().unwrap();
            cells.push_global(first);

            let popper = {
                let cells = Arc::clone(&cells);
                loom::thread::spawn(move || {
                    // Either wins the race against the drain (gets a cell)
                    // or loses and recommits via the mutex path.
                    let p = cells.alloc_cell().unwrap();
                    cells.push_global(p);
                })
            };
            let trimmer = {
                let cells = Arc::clone(&cells);
                loom::thread::spawn(move || {
                    cells.decommit_unused();
                })
            };

            popper.join().unwrap();
            trimmer.join().unwrap();

            // Whatever interleaving ran, the allocator still works.
            let p = cells.alloc_cell().unwrap();
            cells.push_global(p);
        });
    }

    #[test]
    fn loom_free_counts_settle() {
        use crate::memory::cells::{CELLS_PER_SUPERBLOCK, SB_FREE};

        loom::model(|| {
            let cells = small_allocator();
            let a = cells.alloc_cell().unwrap();
            let b = cells.pop_global().unwrap();

            let c1 = Arc::clone(&cells);
            let t1 = loom::thread::spawn(move || c1.push_global(a));
            let c2 = Arc::clone(&cells);
            let t2 = loom::thread::spawn(move || c2.push_global(b));
            t1.join().unwrap();
            t2.join().unwrap();

            // With every cell back on the stack the superblock must have
            // settled into the FREE state.
            assert_eq!(cells.superblock_state(0), SB_FREE);
            let _ = CELLS_PER_SUPERBLOCK;
        });
    }
}
