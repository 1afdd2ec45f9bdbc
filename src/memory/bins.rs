//! Sub-cell bin allocator: carves 16KB cells into power-of-two blocks.
//!
//! Ten size classes (16B..8KB). Each class has a bin: a singly-linked list
//! of partial cells (cells with at least one free block, plus empty cells
//! kept as warm reserve) behind a mutex. The nine hot classes (16B..4KB)
//! additionally have a per-thread block cache refilled in batches under
//! the bin lock.
//!
//! Block ownership is recoverable from any block pointer by masking off
//! the low 14 bits, which lands on the owning cell's header.

use super::cells::{CELL_MASK, CELL_PAYLOAD_OFFSET, CELL_SIZE, CellAllocator};
use super::debug::POISON_BYTE;
use super::vm::VmError;
use crate::sync::Mutex;
use std::cell::RefCell;
use std::ptr::NonNull;

/// Number of size class bins.
pub(crate) const NUM_SIZE_BINS: usize = 10;

/// Power-of-two block sizes, one per bin.
pub(crate) const SIZE_CLASSES: [usize; NUM_SIZE_BINS] =
    [16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

/// Smallest block size; must fit a free-list link.
pub(crate) const MIN_BLOCK_SIZE: usize = 16;

/// Largest sub-cell request. Bigger goes to a whole cell or beyond.
pub(crate) const MAX_SUB_CELL_SIZE: usize = 8192;

/// Size-class byte marking a whole-mode cell (no sub-cell blocks).
pub(crate) const WHOLE_CELL_MARKER: u8 = 0xFF;

/// Empty cells retained on a bin's partial list to dampen churn.
pub(crate) const WARM_CELLS_PER_BIN: usize = 2;

/// Bins 0..9 (16B..4KB) get a thread-local block cache.
pub(crate) const HOT_BIN_COUNT: usize = 9;

/// Blocks cached per hot bin per thread.
pub(crate) const TLS_BIN_CACHE_CAPACITY: usize = 32;

/// Blocks moved into the cache per refill.
pub(crate) const TLS_BIN_BATCH_REFILL: usize = 16;

/// Header magic, checked in debug builds on every locked free.
pub(crate) const CELL_MAGIC: u32 = 0xCE11_CA5E;

/// Header at the base of every cell. Must stay within the first cache
/// line; the block payload begins at [`CELL_PAYLOAD_OFFSET`].
///
/// `next_partial` and `free_head` are meaningful only while the cell is
/// owned by a bin. A free cell's first word is overwritten by the cell
/// stack link.
#[repr(C)]
pub(crate) struct CellHeader {
    pub(crate) tag: u8,
    /// Size-class index, or [`WHOLE_CELL_MARKER`].
    pub(crate) class: u8,
    /// Free blocks currently in this cell (bin-mode).
    pub(crate) free_count: u16,
    pub(crate) magic: u32,
    /// Next cell in the owning bin's partial list.
    pub(crate) next_partial: *mut CellHeader,
    /// Head of the block free-list inside this cell.
    pub(crate) free_head: *mut u8,
    /// Bumped every time the cell is re-initialised for a bin.
    pub(crate) generation: u32,
    _reserved: u32,
}

const _: () = assert!(std::mem::size_of::<CellHeader>() <= CELL_PAYLOAD_OFFSET);
const _: () = assert!(CELL_PAYLOAD_OFFSET.is_multiple_of(16));

/// Recover the owning cell's header from any pointer into the cell.
#[inline]
pub(crate) fn header_of(ptr: *mut u8) -> *mut CellHeader {
    ((ptr as usize) & CELL_MASK) as *mut CellHeader
}

/// Stamp a whole-mode header onto a cell handed out as a single 16KB
/// allocation. Keeps its generation across reuse like the bin path does.
///
/// # Safety
/// `cell` must be a committed, cell-aligned region exclusively owned by
/// the caller.
pub(crate) unsafe fn init_whole_cell(cell: *mut u8, tag: u8) {
    // Safety: per fn contract.
    unsafe {
        let h = cell.cast::<CellHeader>();
        let generation = if (*h).magic == CELL_MAGIC {
            (*h).generation.wrapping_add(1)
        } else {
            0
        };
        h.write(CellHeader {
            tag,
            class: WHOLE_CELL_MARKER,
            free_count: 0,
            magic: CELL_MAGIC,
            next_partial: std::ptr::null_mut(),
            free_head: std::ptr::null_mut(),
            generation,
            _reserved: 0,
        });
    }
}

/// Blocks that fit in one cell for the given class size.
#[inline]
pub(crate) const fn blocks_per_cell(class_size: usize) -> usize {
    (CELL_SIZE - CELL_PAYLOAD_OFFSET) / class_size
}

/// Pick the smallest class whose block size fits `size` at `align`.
///
/// Block bases sit at `cell + 64 + i * class`, so a class satisfies an
/// alignment up to `min(class, 64)`. Returns `None` when no class fits;
/// the caller falls through to the next tier.
pub(crate) fn size_class_for(size: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    let size = size.max(MIN_BLOCK_SIZE);
    if size > MAX_SUB_CELL_SIZE || align > CELL_PAYLOAD_OFFSET {
        return None;
    }

    // Classes are powers of two: the index is ceil(log2(size)) - 4.
    let mut idx = (usize::BITS - (size - 1).leading_zeros()) as usize - 4;
    while idx < NUM_SIZE_BINS {
        if SIZE_CLASSES[idx] >= align {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Per-bin state
// ---------------------------------------------------------------------------

struct SizeBin {
    /// Head of the partial-cell list (cells with >= 1 free block, plus
    /// warm empties).
    partial_head: *mut CellHeader,
    /// Fully-free cells currently held on the partial list.
    warm_empty: usize,
    /// Cumulative blocks handed out of cells (drains to TLS caches count).
    total_allocated: u64,
    /// Blocks out of cells right now (user-live plus TLS-cached).
    current_allocated: u64,
}

// Safety: SizeBin's raw pointers reference cells owned by the context;
// access is serialised by the enclosing Mutex.
unsafe impl Send for SizeBin {}

pub(crate) struct BinAllocator {
    bins: [Mutex<SizeBin>; NUM_SIZE_BINS],
    /// Context identity, keys the thread-local caches.
    id: u64,
}

// ---------------------------------------------------------------------------
// Thread-local hot-bin caches, keyed by context id
// ---------------------------------------------------------------------------

pub(crate) struct BinCache {
    blocks: [[*mut u8; TLS_BIN_CACHE_CAPACITY]; HOT_BIN_COUNT],
    lens: [usize; HOT_BIN_COUNT],
}

impl BinCache {
    fn new() -> Self {
        Self {
            blocks: [[std::ptr::null_mut(); TLS_BIN_CACHE_CAPACITY]; HOT_BIN_COUNT],
            lens: [0; HOT_BIN_COUNT],
        }
    }

    #[inline]
    fn pop(&mut self, class_idx: usize) -> Option<NonNull<u8>> {
        let len = self.lens[class_idx];
        if len == 0 {
            return None;
        }
        self.lens[class_idx] = len - 1;
        NonNull::new(self.blocks[class_idx][len - 1])
    }

    #[inline]
    fn push(&mut self, class_idx: usize, ptr: NonNull<u8>) -> bool {
        let len = self.lens[class_idx];
        if len >= TLS_BIN_CACHE_CAPACITY {
            return false;
        }
        self.blocks[class_idx][len] = ptr.as_ptr();
        self.lens[class_idx] = len + 1;
        true
    }

    /// Bulk-move up to `out.len()` cached blocks into `out`. Returns the
    /// number moved. A straight block copy from the cache tail.
    #[inline]
    fn drain(&mut self, class_idx: usize, out: &mut [*mut u8]) -> usize {
        let len = self.lens[class_idx];
        let n = len.min(out.len());
        if n == 0 {
            return 0;
        }
        out[..n].copy_from_slice(&self.blocks[class_idx][len - n..len]);
        self.lens[class_idx] = len - n;
        n
    }
}

thread_local! {
    static BIN_CACHES: RefCell<Vec<(u64, BinCache)>> = const { RefCell::new(Vec::new()) };
}

fn with_bin_cache<R>(id: u64, f: impl FnOnce(&mut BinCache) -> R) -> R {
    BIN_CACHES.with(|caches| {
        let mut caches = caches.borrow_mut();
        if let Some(idx) = caches.iter().position(|(cid, _)| *cid == id) {
            f(&mut caches[idx].1)
        } else {
            caches.push((id, BinCache::new()));
            let last = caches.len() - 1;
            f(&mut caches[last].1)
        }
    })
}

/// Drop this thread's cache entry for a context without folding blocks
/// back. Used on context drop.
pub(crate) fn discard_thread_caches(id: u64) {
    BIN_CACHES.with(|caches| {
        caches.borrow_mut().retain(|(cid, _)| *cid != id);
    });
}

// ---------------------------------------------------------------------------

impl BinAllocator {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            bins: std::array::from_fn(|_| {
                Mutex::new(SizeBin {
                    partial_head: std::ptr::null_mut(),
                    warm_empty: 0,
                    total_allocated: 0,
                    current_allocated: 0,
                })
            }),
            id,
        }
    }

    /// Allocate one block of the given class. Returns the block base.
    pub(crate) fn alloc_block(
        &self,
        cells: &CellAllocator,
        class_idx: usize,
        tag: u8,
    ) -> Result<NonNull<u8>, VmError> {
        debug_assert!(class_idx < NUM_SIZE_BINS);

        if class_idx < HOT_BIN_COUNT {
            if let Some(block) = with_bin_cache(self.id, |c| c.pop(class_idx)) {
                check_free_poison(block.as_ptr(), SIZE_CLASSES[class_idx]);
                return Ok(block);
            }
            self.refill_cache(cells, class_idx, tag)?;
            if let Some(block) = with_bin_cache(self.id, |c| c.pop(class_idx)) {
                check_free_poison(block.as_ptr(), SIZE_CLASSES[class_idx]);
                return Ok(block);
            }
            return Err(out_of_blocks());
        }

        // Cold bin: straight to the lock.
        let mut guard = self.lock_bin(class_idx);
        let bin = &mut *guard;
        if let Some(block) = Self::pop_block_locked(bin, class_idx) {
            check_free_poison(block.as_ptr(), SIZE_CLASSES[class_idx]);
            return Ok(block);
        }

        let cell = cells.alloc_cell()?;
        // Safety: fresh cell, exclusively ours until it joins the list.
        unsafe { Self::init_cell_for_bin(bin, cell.as_ptr(), class_idx, tag) };
        let block = Self::pop_block_locked(bin, class_idx).ok_or_else(out_of_blocks)?;
        check_free_poison(block.as_ptr(), SIZE_CLASSES[class_idx]);
        Ok(block)
    }

    /// Free one block (block base, not a guard-offset user pointer).
    pub(crate) fn free_block(&self, cells: &CellAllocator, ptr: NonNull<u8>, class_idx: usize) {
        debug_assert!(class_idx < NUM_SIZE_BINS);

        // Poison everything past the link word before the block becomes
        // reachable again.
        #[cfg(debug_assertions)]
        // Safety: the block slot spans the class size and is ours now.
        unsafe {
            std::ptr::write_bytes(
                ptr.as_ptr().add(std::mem::size_of::<usize>()),
                POISON_BYTE,
                SIZE_CLASSES[class_idx] - std::mem::size_of::<usize>(),
            );
        }

        if class_idx < HOT_BIN_COUNT && with_bin_cache(self.id, |c| c.push(class_idx, ptr)) {
            return;
        }

        let mut guard = self.lock_bin(class_idx);
        // Safety: ptr is a block of a cell owned by this bin (caller routed
        // it by address + class byte).
        unsafe { Self::fold_block_locked(&mut guard, cells, ptr.as_ptr(), class_idx) };
    }

    /// Bulk-drain this thread's cache into `out` (hot classes only).
    pub(crate) fn drain_cache(&self, class_idx: usize, out: &mut [*mut u8]) -> usize {
        if class_idx >= HOT_BIN_COUNT {
            return 0;
        }
        with_bin_cache(self.id, |c| c.drain(class_idx, out))
    }

    /// Refill this thread's cache for a hot class up to the batch target.
    ///
    /// Errors only when not a single block could be produced.
    pub(crate) fn refill_cache(
        &self,
        cells: &CellAllocator,
        class_idx: usize,
        tag: u8,
    ) -> Result<(), VmError> {
        debug_assert!(class_idx < HOT_BIN_COUNT);

        with_bin_cache(self.id, |cache| {
            let want = (cache.lens[class_idx] + TLS_BIN_BATCH_REFILL).min(TLS_BIN_CACHE_CAPACITY);
            if cache.lens[class_idx] >= want {
                return Ok(());
            }

            let mut guard = self.lock_bin(class_idx);
            let bin = &mut *guard;

            while cache.lens[class_idx] < want {
                if let Some(block) = Self::pop_block_locked(bin, class_idx) {
                    let pushed = cache.push(class_idx, block);
                    debug_assert!(pushed);
                    continue;
                }

                // Partial cells exhausted: pull one fresh cell and keep
                // draining from it (it lands at the list head).
                match cells.alloc_cell() {
                    Ok(cell) => {
                        // Safety: fresh cell, exclusively ours.
                        unsafe {
                            Self::init_cell_for_bin(bin, cell.as_ptr(), class_idx, tag);
                        }
                    }
                    Err(e) => {
                        // Out of cells. Partial progress is fine; total
                        // failure is the caller's error.
                        if cache.lens[class_idx] == 0 {
                            return Err(e);
                        }
                        break;
                    }
                }
            }
            Ok(())
        })
    }

    /// Free a batch of same-class blocks: fill the TLS cache first, fold
    /// the spill under a single lock acquisition.
    ///
    /// # Safety
    /// Every pointer must be a block base of `class_idx` inside this
    /// context's cell region, none already free.
    pub(crate) unsafe fn free_blocks_bulk(
        &self,
        cells: &CellAllocator,
        blocks: &[*mut u8],
        class_idx: usize,
    ) {
        debug_assert!(class_idx < NUM_SIZE_BINS);
        let class_size = SIZE_CLASSES[class_idx];

        #[cfg(debug_assertions)]
        for &block in blocks {
            // Safety: per fn contract.
            unsafe {
                std::ptr::write_bytes(
                    block.add(std::mem::size_of::<usize>()),
                    POISON_BYTE,
                    class_size - std::mem::size_of::<usize>(),
                );
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = class_size;

        let mut spill_from = 0;
        if class_idx < HOT_BIN_COUNT {
            spill_from = with_bin_cache(self.id, |cache| {
                let mut i = 0;
                while i < blocks.len() {
                    // Blocks come from the caller, never null.
                    let Some(ptr) = NonNull::new(blocks[i]) else {
                        i += 1;
                        continue;
                    };
                    if !cache.push(class_idx, ptr) {
                        break;
                    }
                    i += 1;
                }
                i
            });
        }

        if spill_from < blocks.len() {
            let mut guard = self.lock_bin(class_idx);
            for &block in &blocks[spill_from..] {
                if block.is_null() {
                    continue;
                }
                // Safety: per fn contract.
                unsafe { Self::fold_block_locked(&mut guard, cells, block, class_idx) };
            }
        }
    }

    /// Fold every block in this thread's bin caches back into its owning
    /// cell. Call before thread exit.
    pub(crate) fn flush_thread_caches(&self, cells: &CellAllocator) {
        for class_idx in 0..HOT_BIN_COUNT {
            let mut spill = [std::ptr::null_mut(); TLS_BIN_CACHE_CAPACITY];
            let n = with_bin_cache(self.id, |c| c.drain(class_idx, &mut spill));
            if n == 0 {
                continue;
            }
            let mut guard = self.lock_bin(class_idx);
            for &block in &spill[..n] {
                // Safety: each block came from this bin's cells via the
                // owning thread's cache.
                unsafe { Self::fold_block_locked(&mut guard, cells, block, class_idx) };
            }
        }
    }

    /// (cumulative, current) block counters for a bin.
    #[cfg(test)]
    pub(crate) fn bin_counters(&self, class_idx: usize) -> (u64, u64) {
        let guard = self.lock_bin(class_idx);
        (guard.total_allocated, guard.current_allocated)
    }

    /// Number of fully-free cells held warm by a bin.
    #[allow(dead_code)]
    pub(crate) fn warm_count(&self, class_idx: usize) -> usize {
        self.lock_bin(class_idx).warm_empty
    }

    fn lock_bin(&self, class_idx: usize) -> crate::sync::MutexGuard<'_, SizeBin> {
        self.bins[class_idx]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // -- Locked internals ---------------------------------------------------

    /// Take one block from the head partial cell. Maintains the warm
    /// counter and unlinks cells that go full.
    fn pop_block_locked(bin: &mut SizeBin, class_idx: usize) -> Option<NonNull<u8>> {
        let class_size = SIZE_CLASSES[class_idx];
        let capacity = blocks_per_cell(class_size) as u16;

        let header = bin.partial_head;
        if header.is_null() {
            return None;
        }

        // Safety: cells on the partial list are owned by this bin; the
        // lock serialises all header access.
        unsafe {
            let h = &mut *header;
            debug_assert_eq!(h.magic, CELL_MAGIC, "cell header magic clobbered");
            debug_assert_eq!(h.class as usize, class_idx);
            debug_assert!(h.free_count > 0, "full cell left on partial list");

            if h.free_count == capacity {
                // Was a warm empty; it now holds a live block.
                debug_assert!(bin.warm_empty > 0);
                bin.warm_empty -= 1;
            }

            let block = h.free_head;
            debug_assert!(!block.is_null());
            h.free_head = (*block.cast::<usize>()) as *mut u8;
            h.free_count -= 1;

            if h.free_count == 0 {
                // Cell is full: off the list until a block comes back.
                bin.partial_head = h.next_partial;
                h.next_partial = std::ptr::null_mut();
            }

            bin.total_allocated += 1;
            bin.current_allocated += 1;
            Some(NonNull::new_unchecked(block))
        }
    }

    /// Write a fresh bin-mode header and thread the block free-list in
    /// ascending address order, then prepend the cell to the partial list.
    ///
    /// # Safety
    /// `cell` must be a committed, cell-aligned region exclusively owned by
    /// the caller, and the bin lock must be held.
    unsafe fn init_cell_for_bin(bin: &mut SizeBin, cell: *mut u8, class_idx: usize, tag: u8) {
        let class_size = SIZE_CLASSES[class_idx];
        let capacity = blocks_per_cell(class_size);
        debug_assert!(capacity >= 1 && capacity <= u16::MAX as usize);

        // Safety: caller owns the cell.
        unsafe {
            let h = cell.cast::<CellHeader>();
            // Preserve the generation across re-initialisation when the
            // header looks intact; a recycled cell's count of lives.
            let generation = if (*h).magic == CELL_MAGIC {
                (*h).generation.wrapping_add(1)
            } else {
                0
            };

            let payload = cell.add(CELL_PAYLOAD_OFFSET);
            h.write(CellHeader {
                tag,
                class: class_idx as u8,
                free_count: capacity as u16,
                magic: CELL_MAGIC,
                next_partial: bin.partial_head,
                free_head: payload,
                generation,
                _reserved: 0,
            });

            for i in 0..capacity {
                let block = payload.add(i * class_size);
                let next = if i + 1 < capacity {
                    payload.add((i + 1) * class_size) as usize
                } else {
                    0
                };
                block.cast::<usize>().write(next);
                // Seed the poison window so the alloc-time check holds for
                // never-freed blocks too.
                #[cfg(debug_assertions)]
                std::ptr::write_bytes(
                    block.add(std::mem::size_of::<usize>()),
                    POISON_BYTE,
                    std::mem::size_of::<usize>(),
                );
            }

            bin.partial_head = h;
            // A fresh cell enters the list fully free.
            bin.warm_empty += 1;
        }
    }

    /// Fold a block back into its owning cell, applying the warm-reserve
    /// policy and the full/partial list transitions.
    ///
    /// # Safety
    /// `block` must be a block base inside a bin-mode cell of this bin, not
    /// currently on any free list, and the bin lock must be held.
    unsafe fn fold_block_locked(
        bin: &mut SizeBin,
        cells: &CellAllocator,
        block: *mut u8,
        class_idx: usize,
    ) {
        let class_size = SIZE_CLASSES[class_idx];
        let capacity = blocks_per_cell(class_size) as u16;
        let header = header_of(block);

        // Safety: per fn contract; lock held.
        unsafe {
            let h = &mut *header;
            debug_assert_eq!(h.magic, CELL_MAGIC, "cell header magic clobbered");
            debug_assert_eq!(
                h.class as usize, class_idx,
                "block freed into the wrong bin"
            );
            debug_assert!(h.free_count < capacity, "double free of sub-cell block");

            let was_full = h.free_count == 0;

            block.cast::<usize>().write(h.free_head as usize);
            h.free_head = block;
            h.free_count += 1;
            bin.current_allocated = bin.current_allocated.saturating_sub(1);

            if h.free_count == capacity {
                // Cell is now empty: keep it warm or hand it back.
                if bin.warm_empty < WARM_CELLS_PER_BIN {
                    bin.warm_empty += 1;
                    if was_full {
                        // capacity == 1: never made it onto the list.
                        h.next_partial = bin.partial_head;
                        bin.partial_head = h;
                    }
                } else {
                    if was_full {
                        // Straight from full to empty, never listed.
                    } else {
                        Self::unlink_cell(bin, header);
                    }
                    cells.free_cell(NonNull::new_unchecked(header.cast::<u8>()));
                }
            } else if was_full {
                // Full -> partial: back onto the list.
                h.next_partial = bin.partial_head;
                bin.partial_head = h;
            }
        }
    }

    /// Remove a cell from the partial list (linear scan from the head).
    fn unlink_cell(bin: &mut SizeBin, header: *mut CellHeader) {
        if bin.partial_head == header {
            // Safety: header is on the list, lock held.
            unsafe {
                bin.partial_head = (*header).next_partial;
                (*header).next_partial = std::ptr::null_mut();
            }
            return;
        }
        let mut cur = bin.partial_head;
        // Safety: list nodes are live bin-owned cells; lock held.
        unsafe {
            while !cur.is_null() {
                if (*cur).next_partial == header {
                    (*cur).next_partial = (*header).next_partial;
                    (*header).next_partial = std::ptr::null_mut();
                    return;
                }
                cur = (*cur).next_partial;
            }
        }
        debug_assert!(false, "unlink_cell: cell not found on partial list");
    }
}

fn out_of_blocks() -> VmError {
    VmError::CommitFailed(std::io::Error::new(
        std::io::ErrorKind::OutOfMemory,
        "sub-cell bins exhausted",
    ))
}

/// Debug check: a block coming off a free list must still carry the poison
/// written when it was freed (or seeded at cell init). A mismatch means
/// something wrote through a stale pointer.
#[inline]
fn check_free_poison(block: *const u8, class_size: usize) {
    #[cfg(debug_assertions)]
    {
        let word = std::mem::size_of::<usize>();
        debug_assert!(class_size >= 2 * word);
        // Safety: the block slot spans class_size >= 16 bytes.
        let window = unsafe { std::slice::from_raw_parts(block.add(word), word) };
        assert!(
            window.iter().all(|&b| b == POISON_BYTE),
            "cellar corruption: use-after-free write detected in free block {block:p}"
        );
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = (block, class_size);
    }
}
