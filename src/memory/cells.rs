//! Cell allocator: hands out 16KB aligned cells from a reserved region.
//!
//! Three tiers, fastest first:
//!   1. thread-local cell cache (no synchronization)
//!   2. global lock-free stack (Treiber, single-word CAS)
//!   3. OS superblock commit (CAS on the commit high-water mark)
//!
//! A free cell stores the stack link in its first word. The single-word
//! Treiber protocol is ABA-safe here because cell addresses are never
//! returned to the OS while the context lives: a decommitted superblock's
//! cells are removed from the stack first (under the decommit mutex), and
//! the mapping itself stays readable, so the classic speculative
//! read-of-popped-node either sees valid memory or is discarded by the
//! failing CAS.

use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Log2 of the cell size.
pub(crate) const CELL_SIZE_LOG2: usize = 14;

/// Cell size in bytes (16KB). The fundamental allocation grain.
pub const CELL_SIZE: usize = 1 << CELL_SIZE_LOG2;

/// Mask recovering the cell base from any interior pointer.
pub(crate) const CELL_MASK: usize = !(CELL_SIZE - 1);

/// Offset of the usable payload within a cell. The header and bin metadata
/// live in the first cache line; the payload is 64-byte aligned.
pub const CELL_PAYLOAD_OFFSET: usize = 64;

/// Superblock size in bytes (2MB). The physical commit grain.
pub(crate) const SUPERBLOCK_SIZE: usize = 1 << 21;

/// Cells carved from each superblock.
pub(crate) const CELLS_PER_SUPERBLOCK: usize = SUPERBLOCK_SIZE / CELL_SIZE;

/// Cells cached per thread before spilling to the global stack.
pub(crate) const TLS_CELL_CACHE_CAPACITY: usize = 64;

// Superblock lifecycle. Advisory except DECOMMITTED, which is only ever
// read and written under the decommit mutex.
pub(crate) const SB_UNCOMMITTED: u8 = 0;
pub(crate) const SB_IN_USE: u8 = 1;
pub(crate) const SB_FREE: u8 = 2;
pub(crate) const SB_DECOMMITTED: u8 = 3;

pub(crate) struct Superblock {
    pub(crate) state: AtomicU8,
    /// Number of this superblock's cells currently on the global stack.
    /// Advisory (relaxed): drives the IN_USE <-> FREE transition; the
    /// decommit scan re-derives the truth by draining the stack.
    pub(crate) free_cells: AtomicU32,
}

pub(crate) struct CellAllocator {
    /// Aligned base of the cell region (superblock-aligned).
    base: NonNull<u8>,
    /// Usable reserved bytes (multiple of SUPERBLOCK_SIZE).
    reserved: usize,
    /// Raw reservation (base may be offset into it for alignment).
    original: NonNull<u8>,
    original_len: usize,
    /// High-water mark for superblock commits, in bytes from `base`.
    commit_mark: AtomicUsize,
    /// Treiber stack head: address of the top free cell, 0 when empty.
    global_head: AtomicUsize,
    superblocks: Box<[Superblock]>,
    committed: AtomicUsize,
    /// Serialises decommit scans against superblock recommit.
    decommit_lock: Mutex<()>,
    /// Context identity, keys the thread-local caches.
    id: u64,
}

// Safety: CellAllocator owns the reserved region; all shared state is
// atomic or behind the decommit mutex.
unsafe impl Send for CellAllocator {}
// Safety: internal synchronization per the tier description above.
unsafe impl Sync for CellAllocator {}

impl Drop for CellAllocator {
    fn drop(&mut self) {
        // Safety: the region was reserved in `new` and nothing inside it
        // outlives the allocator (caller contract).
        unsafe {
            drop(PlatformVmOps::release(self.original, self.original_len));
        }
    }
}

// ---------------------------------------------------------------------------
// Thread-local cell cache, keyed by context id
// ---------------------------------------------------------------------------

pub(crate) struct CellCache {
    cells: [*mut u8; TLS_CELL_CACHE_CAPACITY],
    len: usize,
}

impl CellCache {
    fn new() -> Self {
        Self {
            cells: [std::ptr::null_mut(); TLS_CELL_CACHE_CAPACITY],
            len: 0,
        }
    }

    #[inline]
    fn pop(&mut self) -> Option<NonNull<u8>> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        NonNull::new(self.cells[self.len])
    }

    #[inline]
    fn push(&mut self, ptr: NonNull<u8>) -> bool {
        if self.len >= TLS_CELL_CACHE_CAPACITY {
            return false;
        }
        self.cells[self.len] = ptr.as_ptr();
        self.len += 1;
        true
    }
}

thread_local! {
    // Small inline map: one cache per context this thread has touched.
    // Keyed by context id so two live contexts never share a cache.
    static CELL_CACHES: RefCell<Vec<(u64, CellCache)>> = const { RefCell::new(Vec::new()) };
}

fn with_cell_cache<R>(id: u64, f: impl FnOnce(&mut CellCache) -> R) -> R {
    CELL_CACHES.with(|caches| {
        let mut caches = caches.borrow_mut();
        if let Some(idx) = caches.iter().position(|(cid, _)| *cid == id) {
            f(&mut caches[idx].1)
        } else {
            caches.push((id, CellCache::new()));
            let last = caches.len() - 1;
            f(&mut caches[last].1)
        }
    })
}

/// Remove this thread's cache entry for a context without folding the
/// cells anywhere. Used on context drop, where the whole region is about
/// to be released.
pub(crate) fn discard_thread_cache(id: u64) {
    CELL_CACHES.with(|caches| {
        caches.borrow_mut().retain(|(cid, _)| *cid != id);
    });
}

// ---------------------------------------------------------------------------

impl CellAllocator {
    /// Reserve `reserve_size` bytes (rounded down to whole superblocks) of
    /// address space for cells. Nothing is committed yet.
    pub(crate) fn new(id: u64, reserve_size: usize) -> Result<Self, VmError> {
        let reserved = reserve_size & !(SUPERBLOCK_SIZE - 1);
        if reserved == 0 {
            return Err(VmError::InitializationFailed(format!(
                "cell region too small: {reserve_size} bytes cannot hold one superblock"
            )));
        }

        // Over-reserve so the base can be aligned up to a superblock
        // boundary; cell masks rely on cells being 16KB aligned.
        let original_len = reserved.checked_add(SUPERBLOCK_SIZE).ok_or_else(|| {
            VmError::InitializationFailed("cell region reservation size overflow".to_string())
        })?;
        // Safety: plain reservation, no aliasing.
        let original = unsafe { PlatformVmOps::reserve(original_len)? };

        let aligned = (original.as_ptr() as usize).next_multiple_of(SUPERBLOCK_SIZE);
        // Safety: aligned lies within the reservation and is non-zero.
        let base = unsafe { NonNull::new_unchecked(aligned as *mut u8) };

        let superblock_count = reserved / SUPERBLOCK_SIZE;
        let superblocks = (0..superblock_count)
            .map(|_| Superblock {
                state: AtomicU8::new(SB_UNCOMMITTED),
                free_cells: AtomicU32::new(0),
            })
            .collect();

        Ok(Self {
            base,
            reserved,
            original,
            original_len,
            commit_mark: AtomicUsize::new(0),
            global_head: AtomicUsize::new(0),
            superblocks,
            committed: AtomicUsize::new(0),
            decommit_lock: Mutex::new(()),
            id,
        })
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.reserved
    }

    #[inline]
    fn superblock_index(&self, addr: usize) -> usize {
        (addr - self.base.as_ptr() as usize) / SUPERBLOCK_SIZE
    }

    pub(crate) fn committed_bytes(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    #[cfg(any(test, loom))]
    pub(crate) fn superblock_state(&self, idx: usize) -> u8 {
        self.superblocks[idx].state.load(Ordering::Relaxed)
    }

    /// Allocate one 16KB aligned cell. Tier 1 → 2 → 3.
    pub(crate) fn alloc_cell(&self) -> Result<NonNull<u8>, VmError> {
        if let Some(ptr) = with_cell_cache(self.id, CellCache::pop) {
            return Ok(ptr);
        }

        if let Some(ptr) = self.pop_global() {
            return Ok(ptr);
        }

        self.commit_fresh_superblock()
    }

    /// Return a cell to the pool: TLS cache if it has room, else the
    /// global stack.
    pub(crate) fn free_cell(&self, ptr: NonNull<u8>) {
        debug_assert!(
            self.contains(ptr.as_ptr() as usize),
            "free_cell: pointer {ptr:p} is outside the cell region"
        );
        debug_assert!(
            (ptr.as_ptr() as usize).is_multiple_of(CELL_SIZE),
            "free_cell: pointer {ptr:p} is not cell-aligned"
        );

        let spilled = with_cell_cache(self.id, |cache| !cache.push(ptr));
        if spilled {
            self.push_global(ptr);
        }
    }

    /// Move every cell in this thread's cache onto the global stack.
    /// Call before thread exit or before a decommit scan.
    pub(crate) fn flush_thread_cache(&self) {
        loop {
            let cell = with_cell_cache(self.id, CellCache::pop);
            match cell {
                Some(ptr) => self.push_global(ptr),
                None => break,
            }
        }
    }

    // -- Tier 2: lock-free global stack ------------------------------------

    pub(crate) fn push_global(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        // Safety: ptr is a cell base inside the committed region; the first
        // word of a free cell is the stack link (constructed at carve time).
        let link = unsafe { &*(addr as *const AtomicUsize) };

        let mut head = self.global_head.load(Ordering::Relaxed);
        loop {
            link.store(head, Ordering::Relaxed);
            match self.global_head.compare_exchange_weak(
                head,
                addr,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        // Advisory superblock accounting, after the cell is published. The
        // counter can transiently wrap when a pop's decrement lands before
        // the matching push's increment, hence the wrapping add.
        let sb = &self.superblocks[self.superblock_index(addr)];
        let prev = sb.free_cells.fetch_add(1, Ordering::Relaxed);
        if prev.wrapping_add(1) == CELLS_PER_SUPERBLOCK as u32 {
            // All cells back on the stack: eligible for decommit.
            let _ = sb.state.compare_exchange(
                SB_IN_USE,
                SB_FREE,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    pub(crate) fn pop_global(&self) -> Option<NonNull<u8>> {
        let mut head = self.global_head.load(Ordering::Acquire);
        while head != 0 {
            // Speculative: another thread may pop `head` between this load
            // and the CAS. The mapping stays accessible (see VmOps::decommit)
            // and a stale value makes the CAS fail, so it is discarded.
            // Safety: head was published by push_global and its memory is
            // never unmapped while the allocator lives.
            let next = unsafe { (*(head as *const AtomicUsize)).load(Ordering::Relaxed) };
            match self.global_head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let sb = &self.superblocks[self.superblock_index(head)];
                    sb.free_cells.fetch_sub(1, Ordering::Relaxed);
                    let _ = sb.state.compare_exchange(
                        SB_FREE,
                        SB_IN_USE,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                    // Safety: head is non-zero inside the loop.
                    return Some(unsafe { NonNull::new_unchecked(head as *mut u8) });
                }
                Err(observed) => head = observed,
            }
        }
        None
    }

    // -- Tier 3: OS superblock commit --------------------------------------

    fn commit_fresh_superblock(&self) -> Result<NonNull<u8>, VmError> {
        // Atomically claim the next uncommitted superblock.
        let mut cur = self.commit_mark.load(Ordering::Relaxed);
        let claimed = loop {
            let new_end = match cur.checked_add(SUPERBLOCK_SIZE) {
                Some(e) if e <= self.reserved => e,
                _ => {
                    // Reservation exhausted: fall back to recommitting a
                    // previously decommitted superblock.
                    return self.recommit_superblock();
                }
            };
            match self.commit_mark.compare_exchange_weak(
                cur,
                new_end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break cur,
                Err(observed) => cur = observed,
            }
        };

        // Safety: claimed + SUPERBLOCK_SIZE <= reserved.
        let sb_start = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(claimed)) };
        // Safety: committing freshly claimed pages inside our reservation.
        unsafe { PlatformVmOps::commit(sb_start, SUPERBLOCK_SIZE)? };
        self.committed.fetch_add(SUPERBLOCK_SIZE, Ordering::Relaxed);

        let sb_idx = claimed / SUPERBLOCK_SIZE;
        self.superblocks[sb_idx].state.store(SB_IN_USE, Ordering::Relaxed);

        Ok(self.carve_superblock(sb_start))
    }

    /// Carve a committed superblock into cells: return the first, push the
    /// other 127 onto the global stack.
    fn carve_superblock(&self, sb_start: NonNull<u8>) -> NonNull<u8> {
        for i in 0..CELLS_PER_SUPERBLOCK {
            // Safety: i * CELL_SIZE < SUPERBLOCK_SIZE.
            let cell = unsafe { NonNull::new_unchecked(sb_start.as_ptr().add(i * CELL_SIZE)) };
            // Construct the stack-link atomic in place. A plain zero write
            // in production; under loom this creates the tracked atomic
            // object that push/pop later address.
            // Safety: the cell's first word is ours until it is handed out.
            unsafe { cell.as_ptr().cast::<AtomicUsize>().write(AtomicUsize::new(0)) };
            if i > 0 {
                self.push_global(cell);
            }
        }
        sb_start
    }

    /// Recommit a decommitted superblock under the decommit mutex. Last
    /// resort before reporting OOM.
    fn recommit_superblock(&self) -> Result<NonNull<u8>, VmError> {
        let _guard = self
            .decommit_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let sb_idx = self
            .superblocks
            .iter()
            .position(|sb| sb.state.load(Ordering::Relaxed) == SB_DECOMMITTED);

        let Some(sb_idx) = sb_idx else {
            return Err(VmError::CommitFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "cell region exhausted",
            )));
        };

        let sb_start =
            // Safety: sb_idx indexes within the reservation.
            unsafe { NonNull::new_unchecked(self.base.as_ptr().add(sb_idx * SUPERBLOCK_SIZE)) };
        // Safety: recommitting pages we decommitted earlier.
        unsafe { PlatformVmOps::commit(sb_start, SUPERBLOCK_SIZE)? };
        self.committed.fetch_add(SUPERBLOCK_SIZE, Ordering::Relaxed);

        let sb = &self.superblocks[sb_idx];
        sb.state.store(SB_IN_USE, Ordering::Relaxed);
        debug_assert_eq!(sb.free_cells.load(Ordering::Relaxed), 0);

        Ok(self.carve_superblock(sb_start))
    }

    // -- Decommit ----------------------------------------------------------

    /// Release physical pages of every superblock whose full 128 cells are
    /// sitting on the global stack. Returns bytes released.
    ///
    /// The caller should flush thread-local cell caches first; cells held
    /// in other threads' caches keep their superblocks committed.
    pub(crate) fn decommit_unused(&self) -> usize {
        let _guard = self
            .decommit_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Take the whole stack. Concurrent pops fail their CAS and observe
        // an empty stack; concurrent frees push onto the fresh empty stack
        // and are simply not considered this round.
        let mut head = self.global_head.swap(0, Ordering::AcqRel);
        if head == 0 {
            return 0;
        }

        let mut per_sb: HashMap<usize, Vec<usize>> = HashMap::new();
        while head != 0 {
            // Safety: drained cells are exclusively ours after the swap.
            let next = unsafe { (*(head as *const AtomicUsize)).load(Ordering::Relaxed) };
            per_sb.entry(self.superblock_index(head)).or_default().push(head);
            head = next;
        }

        let mut released = 0usize;
        for (sb_idx, cells) in per_sb {
            let sb = &self.superblocks[sb_idx];
            // The drained cells are the ground truth; reset the advisory
            // counter and let push-backs rebuild it.
            sb.free_cells.store(0, Ordering::Relaxed);

            if cells.len() == CELLS_PER_SUPERBLOCK {
                let sb_start = unsafe {
                    // Safety: superblock index derived from a cell address
                    // inside the region.
                    NonNull::new_unchecked(self.base.as_ptr().add(sb_idx * SUPERBLOCK_SIZE))
                };
                // Safety: every cell of this superblock is in our scratch
                // list, so nothing live points into it.
                if unsafe { PlatformVmOps::decommit(sb_start, SUPERBLOCK_SIZE) }.is_ok() {
                    sb.state.store(SB_DECOMMITTED, Ordering::Relaxed);
                    self.committed.fetch_sub(SUPERBLOCK_SIZE, Ordering::Relaxed);
                    released += SUPERBLOCK_SIZE;
                    continue;
                }
            }

            // Partially free (or decommit failed): put the cells back.
            sb.state.store(SB_IN_USE, Ordering::Relaxed);
            for addr in cells {
                // Safety: addr came off the stack moments ago.
                self.push_global(unsafe { NonNull::new_unchecked(addr as *mut u8) });
            }
        }

        released
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::thread;

    fn test_id() -> u64 {
        use crate::sync::atomic::AtomicU64;
        static NEXT: AtomicU64 = AtomicU64::new(0x1000_0000);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    #[test]
    fn alloc_returns_aligned_cells() {
        let cells = CellAllocator::new(test_id(), 4 * SUPERBLOCK_SIZE).unwrap();
        let a = cells.alloc_cell().unwrap();
        let b = cells.alloc_cell().unwrap();
        assert_ne!(a, b);
        assert!((a.as_ptr() as usize).is_multiple_of(CELL_SIZE));
        assert!((b.as_ptr() as usize).is_multiple_of(CELL_SIZE));

        // Cells are writable across their full span.
        // Safety: cells are committed and exclusively owned.
        unsafe {
            a.as_ptr().write(1);
            a.as_ptr().add(CELL_SIZE - 1).write(2);
            assert_eq!(*a.as_ptr(), 1);
        }

        cells.free_cell(a);
        cells.free_cell(b);
        cells.flush_thread_cache();
    }

    #[test]
    fn first_superblock_commit_carves_128_cells() {
        let cells = CellAllocator::new(test_id(), 4 * SUPERBLOCK_SIZE).unwrap();
        let first = cells.alloc_cell().unwrap();
        assert_eq!(cells.committed_bytes(), SUPERBLOCK_SIZE);

        // 127 siblings are on the stack; draining them must not commit more.
        let mut rest = Vec::new();
        for _ in 0..CELLS_PER_SUPERBLOCK - 1 {
            rest.push(cells.alloc_cell().unwrap());
        }
        assert_eq!(cells.committed_bytes(), SUPERBLOCK_SIZE);

        // One more forces a second superblock.
        let overflow = cells.alloc_cell().unwrap();
        assert_eq!(cells.committed_bytes(), 2 * SUPERBLOCK_SIZE);

        cells.free_cell(first);
        cells.free_cell(overflow);
        for c in rest {
            cells.free_cell(c);
        }
        cells.flush_thread_cache();
    }

    #[test]
    fn tls_cache_reuses_recently_freed_cell() {
        let cells = CellAllocator::new(test_id(), 2 * SUPERBLOCK_SIZE).unwrap();
        let a = cells.alloc_cell().unwrap();
        cells.free_cell(a);
        let b = cells.alloc_cell().unwrap();
        assert_eq!(a, b, "TLS cache should hand back the same cell LIFO");
        cells.free_cell(b);
        cells.flush_thread_cache();
    }

    #[test]
    fn exhaustion_returns_error() {
        let cells = CellAllocator::new(test_id(), SUPERBLOCK_SIZE).unwrap();
        let mut held = Vec::new();
        for _ in 0..CELLS_PER_SUPERBLOCK {
            held.push(cells.alloc_cell().unwrap());
        }
        assert!(cells.alloc_cell().is_err(), "region is exhausted");
        for c in held {
            cells.free_cell(c);
        }
        cells.flush_thread_cache();
    }

    #[test]
    fn decommit_and_recommit_cycle() {
        let cells = CellAllocator::new(test_id(), SUPERBLOCK_SIZE).unwrap();
        let mut held = Vec::new();
        for _ in 0..CELLS_PER_SUPERBLOCK {
            held.push(cells.alloc_cell().unwrap());
        }
        for c in held {
            cells.free_cell(c);
        }
        cells.flush_thread_cache();

        let released = cells.decommit_unused();
        assert_eq!(released, SUPERBLOCK_SIZE);
        assert_eq!(cells.committed_bytes(), 0);
        assert_eq!(cells.superblock_state(0), SB_DECOMMITTED);

        // Next alloc recommits and the cell is writable again.
        let p = cells.alloc_cell().unwrap();
        assert_eq!(cells.committed_bytes(), SUPERBLOCK_SIZE);
        // Safety: freshly recommitted cell.
        unsafe {
            p.as_ptr().write(0xAB);
            assert_eq!(*p.as_ptr(), 0xAB);
        }
        cells.free_cell(p);
        cells.flush_thread_cache();
    }

    #[test]
    fn decommit_skips_superblocks_with_live_cells() {
        let cells = CellAllocator::new(test_id(), SUPERBLOCK_SIZE).unwrap();
        let keep = cells.alloc_cell().unwrap();
        let mut others = Vec::new();
        for _ in 0..CELLS_PER_SUPERBLOCK - 1 {
            others.push(cells.alloc_cell().unwrap());
        }
        for c in others {
            cells.free_cell(c);
        }
        cells.flush_thread_cache();

        assert_eq!(cells.decommit_unused(), 0, "one cell is still live");
        assert_eq!(cells.committed_bytes(), SUPERBLOCK_SIZE);

        // The live cell must still hold data.
        // Safety: keep is live.
        unsafe {
            keep.as_ptr().write(0x77);
            assert_eq!(*keep.as_ptr(), 0x77);
        }
        cells.free_cell(keep);
        cells.flush_thread_cache();
    }

    #[test]
    fn concurrent_alloc_free_no_duplicates() {
        let cells = Arc::new(CellAllocator::new(test_id(), 16 * SUPERBLOCK_SIZE).unwrap());
        let threads = 4;
        let per_thread = 200;

        let mut handles = Vec::new();
        for t in 0..threads {
            let cells = cells.clone();
            handles.push(thread::spawn(move || {
                let mut held = Vec::new();
                for i in 0..per_thread {
                    let c = cells.alloc_cell().unwrap();
                    // Safety: exclusively owned cell.
                    unsafe { c.as_ptr().write((t * 31 + i) as u8) };
                    held.push((c, (t * 31 + i) as u8));
                    if i % 3 == 0
                        && let Some((c, v)) = held.pop()
                    {
                        // Safety: still exclusively owned.
                        unsafe { assert_eq!(*c.as_ptr(), v, "cell handed to two owners") };
                        cells.free_cell(c);
                    }
                }
                for (c, v) in held {
                    // Safety: still exclusively owned.
                    unsafe { assert_eq!(*c.as_ptr(), v, "cell handed to two owners") };
                    cells.free_cell(c);
                }
                cells.flush_thread_cache();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
