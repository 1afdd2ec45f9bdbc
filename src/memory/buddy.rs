//! Power-of-two buddy allocator for 32KB..2MB blocks.
//!
//! A separate reserved region, committed in 2MB superblocks. Free blocks
//! live on per-order doubly-linked intrusive lists; allocation splits the
//! smallest sufficient block downward, free coalesces with the XOR buddy
//! upward. An 8-byte header in front of each allocated block records the
//! order; the user pointer is `header + 8`.
//!
//! One exception keeps 2MB requests in this tier: when `size + 8` would
//! not fit any order, the block is handed out headerless as a whole
//! superblock. Such a user pointer is 2MB aligned, which is how `free`
//! recognizes it (headered user pointers are always 8 bytes past a 32KB
//! boundary).

use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicUsize, Ordering};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Minimum order: 2^15 = 32KB.
pub(crate) const MIN_ORDER: usize = 15;

/// Maximum order: 2^21 = 2MB, the superblock size.
pub(crate) const MAX_ORDER: usize = 21;

/// Orders 15..=21.
pub(crate) const NUM_ORDERS: usize = MAX_ORDER - MIN_ORDER + 1;

/// Smallest buddy block (32KB).
pub(crate) const MIN_BLOCK_SIZE: usize = 1 << MIN_ORDER;

/// Largest buddy block / commit grain (2MB).
pub(crate) const MAX_BLOCK_SIZE: usize = 1 << MAX_ORDER;

/// Per-block header: byte 0 holds the order, byte 1 the allocation tag,
/// the rest is reserved zero.
pub(crate) const HEADER_SIZE: usize = 8;

/// Intrusive free-list node, stored in the first bytes of a free block.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
    prev: *mut FreeBlock,
}

struct BuddyInner {
    free_lists: [*mut FreeBlock; NUM_ORDERS],
    /// Committed bytes (multiple of MAX_BLOCK_SIZE), grows monotonically.
    committed: usize,
    superblock_count: usize,
    /// One bit per 32KB chunk: set while that chunk starts a live block.
    #[cfg(debug_assertions)]
    live: FixedBitSet,
}

// Safety: the raw list pointers reference memory owned by the enclosing
// allocator; the Mutex serialises all access.
unsafe impl Send for BuddyInner {}

pub(crate) struct BuddyAllocator {
    inner: Mutex<BuddyInner>,
    /// Aligned base (2MB), so block addresses are aligned to their size.
    base: NonNull<u8>,
    reserved: usize,
    original: NonNull<u8>,
    original_len: usize,
    committed: AtomicUsize,
    allocated: AtomicUsize,
}

// Safety: region owner; interior state behind the mutex or atomic.
unsafe impl Send for BuddyAllocator {}
// Safety: same.
unsafe impl Sync for BuddyAllocator {}

impl Drop for BuddyAllocator {
    fn drop(&mut self) {
        // Safety: we own the reservation; nothing inside outlives us.
        unsafe {
            drop(PlatformVmOps::release(self.original, self.original_len));
        }
    }
}

impl BuddyAllocator {
    pub(crate) fn new(reserve_size: usize) -> Result<Self, VmError> {
        let reserved = reserve_size & !(MAX_BLOCK_SIZE - 1);
        if reserved == 0 {
            return Err(VmError::InitializationFailed(format!(
                "buddy region too small: {reserve_size} bytes cannot hold one superblock"
            )));
        }

        let original_len = reserved.checked_add(MAX_BLOCK_SIZE).ok_or_else(|| {
            VmError::InitializationFailed("buddy region reservation size overflow".to_string())
        })?;
        // Safety: plain reservation.
        let original = unsafe { PlatformVmOps::reserve(original_len)? };
        let aligned = (original.as_ptr() as usize).next_multiple_of(MAX_BLOCK_SIZE);
        // Safety: aligned lies within the reservation.
        let base = unsafe { NonNull::new_unchecked(aligned as *mut u8) };

        Ok(Self {
            inner: Mutex::new(BuddyInner {
                free_lists: [std::ptr::null_mut(); NUM_ORDERS],
                committed: 0,
                superblock_count: 0,
                #[cfg(debug_assertions)]
                live: FixedBitSet::new(),
            }),
            base,
            reserved,
            original,
            original_len,
            committed: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.reserved
    }

    #[allow(dead_code)]
    pub(crate) fn bytes_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub(crate) fn superblock_count(&self) -> usize {
        self.lock().superblock_count
    }

    fn lock(&self) -> crate::sync::MutexGuard<'_, BuddyInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Smallest order whose block holds `total` bytes.
    fn size_to_order(total: usize) -> usize {
        if total <= MIN_BLOCK_SIZE {
            return MIN_ORDER;
        }
        (usize::BITS - (total - 1).leading_zeros()) as usize
    }

    /// Allocate at least `size` bytes. Fails when `size` exceeds
    /// [`MAX_BLOCK_SIZE`] or the region is exhausted.
    pub(crate) fn alloc(&self, size: usize, tag: u8) -> Result<NonNull<u8>, VmError> {
        debug_assert!(size > 0);
        if size > MAX_BLOCK_SIZE {
            return Err(too_large(size));
        }

        // A size the header cannot share a 2MB block with gets the whole
        // superblock, headerless (so such blocks carry no tag byte).
        if size + HEADER_SIZE > MAX_BLOCK_SIZE {
            return self.alloc_whole_superblock();
        }

        let order = Self::size_to_order(size + HEADER_SIZE);
        debug_assert!(order <= MAX_ORDER);

        let mut inner = self.lock();
        let block = loop {
            if let Some(block) = Self::take_block(&mut inner, order) {
                break block;
            }
            self.grow(&mut inner)?;
        };

        // Safety: block is committed, exclusively ours.
        unsafe {
            let header = block.as_ptr();
            header.write(order as u8);
            header.add(1).write(tag);
            std::ptr::write_bytes(header.add(2), 0, HEADER_SIZE - 2);
        }
        self.mark_live(&mut inner, block.as_ptr() as usize);
        drop(inner);

        self.allocated.fetch_add(1 << order, Ordering::Relaxed);
        // Safety: block + 8 is inside the block.
        Ok(unsafe { NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE)) })
    }

    fn alloc_whole_superblock(&self) -> Result<NonNull<u8>, VmError> {
        let mut inner = self.lock();
        let block = loop {
            if let Some(block) = Self::take_block(&mut inner, MAX_ORDER) {
                break block;
            }
            self.grow(&mut inner)?;
        };
        self.mark_live(&mut inner, block.as_ptr() as usize);
        drop(inner);

        self.allocated.fetch_add(MAX_BLOCK_SIZE, Ordering::Relaxed);
        Ok(block)
    }

    /// Pop a block of exactly `order`, splitting a larger one if needed.
    fn take_block(inner: &mut BuddyInner, order: usize) -> Option<NonNull<u8>> {
        for o in order..=MAX_ORDER {
            let head = inner.free_lists[o - MIN_ORDER];
            if head.is_null() {
                continue;
            }
            // Safety: list nodes are free blocks we own; lock held.
            unsafe {
                Self::remove_from_free_list(inner, head, o);

                // Split down: the upper buddy of each halving goes back on
                // the next-lower list.
                let mut o = o;
                while o > order {
                    o -= 1;
                    let upper = head.cast::<u8>().add(1 << o);
                    Self::add_to_free_list(inner, upper, o);
                }

                return Some(NonNull::new_unchecked(head.cast::<u8>()));
            }
        }
        None
    }

    /// Free a pointer previously returned by [`alloc`](Self::alloc).
    pub(crate) fn free(&self, user_ptr: NonNull<u8>) {
        let addr = user_ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        debug_assert!(self.contains(addr));

        let (internal, mut order) = if (addr - base).is_multiple_of(MAX_BLOCK_SIZE) {
            // Headerless whole-superblock block.
            (user_ptr.as_ptr(), MAX_ORDER)
        } else {
            // Safety: headered user pointers are header + 8.
            let internal = unsafe { user_ptr.as_ptr().sub(HEADER_SIZE) };
            // Safety: the header is inside the allocated block.
            let order = unsafe { *internal } as usize;
            assert!(
                (MIN_ORDER..=MAX_ORDER).contains(&order),
                "cellar corruption: buddy header at {internal:p} holds invalid order {order}"
            );
            (internal, order)
        };

        self.allocated.fetch_sub(1 << order, Ordering::Relaxed);

        let mut inner = self.lock();
        self.clear_live(&mut inner, internal as usize);

        let mut offset = internal as usize - base;
        while order < MAX_ORDER {
            let buddy_offset = offset ^ (1 << order);
            if buddy_offset >= inner.committed {
                break;
            }

            // Membership test: linear scan of this order's free list. Free
            // lists stay short relative to allocation cost.
            let buddy = (base + buddy_offset) as *mut FreeBlock;
            if !Self::free_list_contains(&inner, buddy, order) {
                break;
            }

            // Safety: buddy verified free; lock held.
            unsafe { Self::remove_from_free_list(&mut inner, buddy, order) };
            offset = offset.min(buddy_offset);
            order += 1;
        }

        // Safety: the merged block is exclusively ours; lock held.
        unsafe { Self::add_to_free_list(&mut inner, (base + offset) as *mut u8, order) };
    }

    /// Tag recorded at allocation. Headerless whole-superblock blocks have
    /// no tag byte and report 0.
    pub(crate) fn tag_of(&self, user_ptr: NonNull<u8>) -> u8 {
        let addr = user_ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        if (addr - base).is_multiple_of(MAX_BLOCK_SIZE) {
            return 0;
        }
        // Safety: headered pointer; the header is live while the block is.
        unsafe { *user_ptr.as_ptr().sub(HEADER_SIZE).add(1) }
    }

    /// Usable bytes behind a user pointer from this tier.
    pub(crate) fn usable_size(&self, user_ptr: NonNull<u8>) -> usize {
        let addr = user_ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        if (addr - base).is_multiple_of(MAX_BLOCK_SIZE) {
            return MAX_BLOCK_SIZE;
        }
        // Safety: headered pointer; the header is live while the block is.
        let order = unsafe { *user_ptr.as_ptr().sub(HEADER_SIZE) } as usize;
        debug_assert!((MIN_ORDER..=MAX_ORDER).contains(&order));
        (1 << order) - HEADER_SIZE
    }

    /// Commit one more superblock and put it on the top-order free list.
    fn grow(&self, inner: &mut BuddyInner) -> Result<(), VmError> {
        let next_end = inner.committed + MAX_BLOCK_SIZE;
        if next_end > self.reserved {
            return Err(VmError::CommitFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "buddy region exhausted",
            )));
        }

        let sb_start =
            // Safety: next_end <= reserved.
            unsafe { NonNull::new_unchecked(self.base.as_ptr().add(inner.committed)) };
        // Safety: committing pages inside our reservation.
        unsafe { PlatformVmOps::commit(sb_start, MAX_BLOCK_SIZE)? };

        inner.committed = next_end;
        inner.superblock_count += 1;
        self.committed.store(next_end, Ordering::Relaxed);

        #[cfg(debug_assertions)]
        inner.live.grow(inner.committed / MIN_BLOCK_SIZE);

        // Safety: fresh superblock, exclusively ours; lock held.
        unsafe { Self::add_to_free_list(inner, sb_start.as_ptr(), MAX_ORDER) };
        Ok(())
    }

    // -- Free list helpers (lock held) --------------------------------------

    /// # Safety
    /// `ptr` must be a free, committed, order-aligned block; lock held.
    unsafe fn add_to_free_list(inner: &mut BuddyInner, ptr: *mut u8, order: usize) {
        debug_assert!((ptr as usize).is_multiple_of(1 << order), "buddy block misaligned");
        let block = ptr.cast::<FreeBlock>();
        let list = &mut inner.free_lists[order - MIN_ORDER];
        // Safety: per contract.
        unsafe {
            (*block).prev = std::ptr::null_mut();
            (*block).next = *list;
            if !(*list).is_null() {
                (**list).prev = block;
            }
        }
        *list = block;
    }

    /// # Safety
    /// `block` must be on the `order` free list; lock held.
    unsafe fn remove_from_free_list(inner: &mut BuddyInner, block: *mut FreeBlock, order: usize) {
        // Safety: per contract.
        unsafe {
            if (*block).prev.is_null() {
                inner.free_lists[order - MIN_ORDER] = (*block).next;
            } else {
                (*(*block).prev).next = (*block).next;
            }
            if !(*block).next.is_null() {
                (*(*block).next).prev = (*block).prev;
            }
        }
    }

    fn free_list_contains(inner: &BuddyInner, block: *mut FreeBlock, order: usize) -> bool {
        let mut cur = inner.free_lists[order - MIN_ORDER];
        while !cur.is_null() {
            if cur == block {
                return true;
            }
            // Safety: list nodes are free blocks we own; lock held.
            cur = unsafe { (*cur).next };
        }
        false
    }

    // -- Debug live map ------------------------------------------------------

    #[allow(unused_variables)]
    fn mark_live(&self, inner: &mut BuddyInner, internal_addr: usize) {
        #[cfg(debug_assertions)]
        {
            let chunk = (internal_addr - self.base.as_ptr() as usize) / MIN_BLOCK_SIZE;
            debug_assert!(
                !inner.live.contains(chunk),
                "buddy block at {internal_addr:#x} handed out twice"
            );
            inner.live.insert(chunk);
        }
    }

    #[allow(unused_variables)]
    fn clear_live(&self, inner: &mut BuddyInner, internal_addr: usize) {
        #[cfg(debug_assertions)]
        {
            let chunk = (internal_addr - self.base.as_ptr() as usize) / MIN_BLOCK_SIZE;
            assert!(
                inner.live.contains(chunk),
                "cellar corruption: double free or foreign pointer in buddy tier ({internal_addr:#x})"
            );
            inner.live.set(chunk, false);
        }
    }
}

fn too_large(size: usize) -> VmError {
    VmError::CommitFailed(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("size {size} exceeds the buddy tier maximum"),
    ))
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn fixture() -> BuddyAllocator {
        BuddyAllocator::new(32 * MAX_BLOCK_SIZE).unwrap()
    }

    #[test]
    fn alloc_write_free_roundtrip() {
        let buddy = fixture();
        let p = buddy.alloc(40 * 1024, 0).unwrap();
        assert_eq!(buddy.usable_size(p), (1 << 17) - HEADER_SIZE);

        // Safety: p spans at least 40KB of exclusive memory.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0x5A, 40 * 1024);
            assert_eq!(*p.as_ptr().add(40 * 1024 - 1), 0x5A);
        }

        buddy.free(p);
        assert_eq!(buddy.bytes_allocated(), 0);
    }

    #[test]
    fn minimum_order_serves_small_sizes() {
        let buddy = fixture();
        // Anything up to 32KB - 8 rides the minimum order.
        let p = buddy.alloc(1, 0).unwrap();
        assert_eq!(buddy.usable_size(p), MIN_BLOCK_SIZE - HEADER_SIZE);
        buddy.free(p);
    }

    #[test]
    fn block_addresses_are_order_aligned() {
        let buddy = fixture();
        for &size in &[32 * 1024 - 8, 64 * 1024 - 8, 256 * 1024 - 8, 1024 * 1024 - 8] {
            let p = buddy.alloc(size, 0).unwrap();
            let internal = p.as_ptr() as usize - HEADER_SIZE;
            let order_size = size + HEADER_SIZE;
            assert!(
                internal.is_multiple_of(order_size.next_power_of_two()),
                "block for {size} not aligned to its order"
            );
            buddy.free(p);
        }
    }

    #[test]
    fn splitting_and_coalescing_roundtrip() {
        let buddy = fixture();

        // Fill one superblock with minimum-order blocks.
        let count = MAX_BLOCK_SIZE / MIN_BLOCK_SIZE;
        let mut blocks = Vec::new();
        for _ in 0..count {
            blocks.push(buddy.alloc(MIN_BLOCK_SIZE - HEADER_SIZE, 0).unwrap());
        }
        assert_eq!(buddy.superblock_count(), 1, "should all fit in one superblock");

        // Free in a scrambled order, then a full-superblock allocation must
        // succeed without committing another superblock.
        let mut order: Vec<usize> = (0..count).collect();
        for i in 0..count {
            order.swap(i, (i * 29 + 13) % count);
        }
        for &i in &order {
            buddy.free(blocks[i]);
        }
        assert_eq!(buddy.bytes_allocated(), 0);

        let big = buddy.alloc(MAX_BLOCK_SIZE, 0).unwrap();
        assert_eq!(
            buddy.superblock_count(),
            1,
            "coalescing should have rebuilt the 2MB block"
        );
        buddy.free(big);
    }

    #[test]
    fn adjacent_pair_coalesces_to_double_size() {
        let buddy = fixture();
        let a = buddy.alloc(MIN_BLOCK_SIZE - HEADER_SIZE, 0).unwrap();
        let b = buddy.alloc(MIN_BLOCK_SIZE - HEADER_SIZE, 0).unwrap();
        let committed_before = buddy.bytes_committed();

        buddy.free(a);
        buddy.free(b);

        // A 64KB request is served from the coalesced pair (or its parent),
        // with no further commit.
        let c = buddy.alloc(2 * MIN_BLOCK_SIZE - HEADER_SIZE, 0).unwrap();
        assert_eq!(buddy.bytes_committed(), committed_before);
        buddy.free(c);
    }

    #[test]
    fn whole_superblock_requests_stay_in_tier() {
        let buddy = fixture();
        // 2MB exactly: header would not fit, so the block is headerless and
        // superblock-aligned.
        let p = buddy.alloc(MAX_BLOCK_SIZE, 0).unwrap();
        assert!((p.as_ptr() as usize).is_multiple_of(MAX_BLOCK_SIZE));
        assert_eq!(buddy.usable_size(p), MAX_BLOCK_SIZE);

        // Safety: whole superblock is ours.
        unsafe {
            *p.as_ptr() = 1;
            *p.as_ptr().add(MAX_BLOCK_SIZE - 1) = 2;
        }

        buddy.free(p);
        assert_eq!(buddy.bytes_allocated(), 0);

        // The freed superblock is reusable for ordinary blocks.
        let q = buddy.alloc(MIN_BLOCK_SIZE - HEADER_SIZE, 0).unwrap();
        buddy.free(q);
    }

    #[test]
    fn oversize_requests_fail() {
        let buddy = fixture();
        assert!(buddy.alloc(MAX_BLOCK_SIZE + 1, 0).is_err());
    }

    #[test]
    fn exhaustion_returns_error() {
        let buddy = BuddyAllocator::new(2 * MAX_BLOCK_SIZE).unwrap();
        let a = buddy.alloc(MAX_BLOCK_SIZE, 0).unwrap();
        let b = buddy.alloc(MAX_BLOCK_SIZE, 0).unwrap();
        assert!(buddy.alloc(MIN_BLOCK_SIZE, 0).is_err());
        buddy.free(a);
        buddy.free(b);
    }

    #[test]
    fn commit_grows_on_demand() {
        let buddy = fixture();
        assert_eq!(buddy.bytes_committed(), 0);
        let a = buddy.alloc(MIN_BLOCK_SIZE, 0).unwrap();
        assert_eq!(buddy.bytes_committed(), MAX_BLOCK_SIZE);

        // A second superblock only once the first cannot satisfy a request.
        let b = buddy.alloc(MAX_BLOCK_SIZE, 0).unwrap();
        assert_eq!(buddy.bytes_committed(), 2 * MAX_BLOCK_SIZE);

        buddy.free(a);
        buddy.free(b);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_detected() {
        let buddy = fixture();
        let p = buddy.alloc(MIN_BLOCK_SIZE - HEADER_SIZE, 0).unwrap();
        buddy.free(p);
        buddy.free(p);
    }
}
