//! Context façade: the one object clients see.
//!
//! Owns the four tiers (cells, sub-cell bins, buddy, large registry) plus
//! the telemetry layers, and routes every request by size:
//!
//! | request              | tier       |
//! |----------------------|------------|
//! | 0 bytes              | error      |
//! | <= 8KB               | bins       |
//! | <= 16KB - 64         | whole cell |
//! | <= 2MB               | buddy      |
//! | > 2MB                | large      |
//!
//! The tier that served a pointer is recoverable from its address alone
//! (cell region / buddy region / large map), so `free_bytes` needs no
//! size argument.

use super::bins::{self, BinAllocator, HOT_BIN_COUNT, SIZE_CLASSES, WHOLE_CELL_MARKER};
use super::buddy::{self, BuddyAllocator};
use super::cells::{self, CELL_PAYLOAD_OFFSET, CELL_SIZE, CellAllocator};
use super::debug;
use super::large::LargeRegistry;
use super::vm::VmError;
use crate::sync::atomic::{AtomicU64, Ordering};
use std::fmt;
use std::ptr::NonNull;

#[cfg(feature = "budget")]
use crate::sync::atomic::AtomicUsize;
#[cfg(any(feature = "budget", feature = "instrumentation"))]
use crate::sync::{Arc, RwLock};

#[cfg(feature = "leak-tracking")]
use super::debug::LeakTable;
#[cfg(feature = "stats")]
use super::stats::{MemoryStats, StatsSnapshot, Tier};

/// Largest request a whole-mode cell can hold.
pub(crate) const WHOLE_CELL_MAX: usize = CELL_SIZE - CELL_PAYLOAD_OFFSET;

/// Largest alignment `alloc_bytes` accepts; bigger goes through
/// [`Context::alloc_aligned`].
pub(crate) const HOT_PATH_MAX_ALIGN: usize = 16;

crate::sync::static_atomic! {
    static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
}

#[derive(Debug)]
pub enum AllocError {
    /// Zero-byte request.
    ZeroSize,
    /// Alignment not a power of two, or beyond what the chosen entry point
    /// supports.
    InvalidAlignment(usize),
    /// Free/realloc of a pointer no tier owns.
    UnknownPointer,
    /// The configured memory budget would be exceeded.
    BudgetExceeded {
        requested: usize,
        used: usize,
        limit: usize,
    },
    /// Reservation exhausted or the OS refused pages.
    Vm(VmError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ZeroSize => write!(f, "zero-size allocation"),
            AllocError::InvalidAlignment(a) => write!(f, "unsupported alignment {a}"),
            AllocError::UnknownPointer => write!(f, "pointer not owned by this context"),
            AllocError::BudgetExceeded {
                requested,
                used,
                limit,
            } => write!(
                f,
                "memory budget exceeded: requested {requested} with {used}/{limit} in use"
            ),
            AllocError::Vm(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::Vm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VmError> for AllocError {
    fn from(e: VmError) -> Self {
        AllocError::Vm(e)
    }
}

/// Configuration for [`Context::with_config`].
#[derive(Clone, Debug)]
pub struct ContextConfig {
    /// Total virtual address space to reserve, split evenly between the
    /// cell and buddy regions (each rounded down to 2MB). Default: 16GB.
    pub reserve_size: usize,
    /// Maximum simultaneously live bytes, tier-rounded. 0 = unlimited.
    /// Enforced only with the `budget` feature.
    pub memory_budget: usize,
    /// Attempt explicit huge pages for large allocations. Default: true.
    pub use_huge_pages: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            reserve_size: 16 * 1024 * 1024 * 1024,
            memory_budget: 0,
            use_huge_pages: true,
        }
    }
}

/// Direction flag handed to the instrumentation callback.
#[cfg(feature = "instrumentation")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocEvent {
    Alloc,
    Free,
}

#[cfg(feature = "instrumentation")]
pub type AllocCallback = Arc<dyn Fn(*mut u8, usize, u8, AllocEvent) + Send + Sync>;

/// Fires with `(requested, used, limit)` when an allocation would blow
/// the budget.
#[cfg(feature = "budget")]
pub type BudgetCallback = Arc<dyn Fn(usize, usize, usize) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TierKind {
    Cell,
    SubCell,
    Buddy,
    Large,
}

#[cfg(feature = "stats")]
impl TierKind {
    fn stats(self) -> Tier {
        match self {
            TierKind::Cell => Tier::Cell,
            TierKind::SubCell => Tier::SubCell,
            TierKind::Buddy => Tier::Buddy,
            TierKind::Large => Tier::Large,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    SubCell { class: usize, guarded: bool },
    WholeCell,
    Buddy,
    Large,
}

/// An independent allocator instance owning its reserved regions and all
/// tier state. Internally synchronised; share freely across threads.
///
/// Lifetime contract: every pointer handed out must be freed (or simply
/// abandoned) before the context is dropped, and each thread that touched
/// the context should call [`flush_thread_caches`](Self::flush_thread_caches)
/// before it exits. Unflushed caches are not leaks — the blocks stay
/// reachable through their owning cells — but their cells cannot be
/// recycled until the context goes away.
pub struct Context {
    id: u64,
    config: ContextConfig,
    cells: CellAllocator,
    bins: BinAllocator,
    buddy: BuddyAllocator,
    large: LargeRegistry,
    #[cfg(feature = "stats")]
    stats: MemoryStats,
    #[cfg(feature = "leak-tracking")]
    leaks: LeakTable,
    #[cfg(feature = "budget")]
    budget_used: AtomicUsize,
    #[cfg(feature = "budget")]
    budget_callback: RwLock<Option<BudgetCallback>>,
    #[cfg(feature = "instrumentation")]
    alloc_callback: RwLock<Option<AllocCallback>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("committed_bytes", &self.committed_bytes())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Create a context with the default configuration (16GB reserve).
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(ContextConfig::default())
    }

    pub fn with_config(config: ContextConfig) -> Result<Self, AllocError> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let half = config.reserve_size / 2;

        Ok(Self {
            cells: CellAllocator::new(id, half)?,
            bins: BinAllocator::new(id),
            buddy: BuddyAllocator::new(half)?,
            large: LargeRegistry::new(config.use_huge_pages),
            #[cfg(feature = "stats")]
            stats: MemoryStats::new(),
            #[cfg(feature = "leak-tracking")]
            leaks: LeakTable::new(),
            #[cfg(feature = "budget")]
            budget_used: AtomicUsize::new(0),
            #[cfg(feature = "budget")]
            budget_callback: RwLock::new(None),
            #[cfg(feature = "instrumentation")]
            alloc_callback: RwLock::new(None),
            id,
            config,
        })
    }

    // =====================================================================
    // Allocation
    // =====================================================================

    /// Allocate `size` bytes. `alignment` must be a power of two in
    /// 1..=16; use [`alloc_aligned`](Self::alloc_aligned) for more.
    pub fn alloc_bytes(
        &self,
        size: usize,
        tag: u8,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if !alignment.is_power_of_two() || alignment > HOT_PATH_MAX_ALIGN {
            return Err(AllocError::InvalidAlignment(alignment));
        }
        self.alloc_routed(size, tag, alignment)
    }

    /// Free memory from any tier. Null-safe; a pointer no tier owns is a
    /// silent no-op.
    ///
    /// # Safety
    /// A non-null `ptr` must have been returned by an allocation method of
    /// this context and not freed since.
    pub unsafe fn free_bytes(&self, ptr: *mut u8) {
        let Some(nn) = NonNull::new(ptr) else { return };
        let addr = ptr as usize;

        if self.cells.contains(addr) {
            // Safety: pointers into the cell region always sit inside a
            // cell whose header is live.
            unsafe { self.free_in_cell_region(nn) };
        } else if self.buddy.contains(addr) {
            let charged = self.buddy.usable_size(nn);
            let tag = self.buddy.tag_of(nn);
            self.note_free(ptr, charged, tag, TierKind::Buddy);
            self.uncharge_budget(charged);
            self.buddy.free(nn);
        } else if let Some(entry) = self.large.free(nn) {
            self.note_free(ptr, entry.size, entry.tag, TierKind::Large);
            self.uncharge_budget(entry.size);
        }
        // else: UnknownPointer — silent no-op by contract.
    }

    /// POSIX `realloc` semantics.
    ///
    /// - `(null, n)` allocates.
    /// - `(p, 0)` frees and returns [`AllocError::ZeroSize`].
    /// - A sub-cell block whose new size lands in the same class is
    ///   returned unchanged; likewise a whole-mode cell staying whole.
    /// - Anything else is allocate-copy-free. On failure the old block is
    ///   valid and unchanged.
    ///
    /// # Safety
    /// A non-null `ptr` must have been returned by this context and not
    /// freed since.
    pub unsafe fn realloc_bytes(
        &self,
        ptr: *mut u8,
        new_size: usize,
        tag: u8,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(nn) = NonNull::new(ptr) else {
            return self.alloc_bytes(new_size, tag, 8);
        };
        if new_size == 0 {
            // Safety: forwarded caller contract.
            unsafe { self.free_bytes(ptr) };
            return Err(AllocError::ZeroSize);
        }

        let addr = ptr as usize;
        let old_usable = if self.cells.contains(addr) {
            let header = bins::header_of(ptr);
            // Safety: live cell header.
            let class = unsafe { (*header).class };
            if class == WHOLE_CELL_MARKER {
                if self.route(new_size, 8) == Route::WholeCell {
                    return Ok(nn);
                }
                WHOLE_CELL_MAX
            } else {
                let class_idx = class as usize;
                let (_, offset_in_block) = self.resolve_block(nn, class_idx);
                let guarded = offset_in_block == debug::GUARD_SIZE;
                if let Route::SubCell {
                    class: new_class,
                    guarded: new_guarded,
                } = self.route(new_size, 8)
                    && new_class == class_idx
                    && new_guarded == guarded
                {
                    return Ok(nn);
                }
                let overhead = if guarded { debug::GUARD_OVERHEAD } else { 0 };
                SIZE_CLASSES[class_idx] - overhead
            }
        } else if self.buddy.contains(addr) {
            self.buddy.usable_size(nn)
        } else if let Some(entry) = self.large.lookup(nn) {
            entry.size
        } else {
            return Err(AllocError::UnknownPointer);
        };

        let new_ptr = self.alloc_routed(new_size, tag, 8)?;
        // Safety: both blocks are live; the overlap length is within both.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_usable.min(new_size));
            self.free_bytes(ptr);
        }
        Ok(new_ptr)
    }

    /// Allocate with any power-of-two alignment. A bin serves the request
    /// when some class covers both size and alignment; everything else
    /// takes the large registry's aligned primitive, regardless of size.
    pub fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        tag: u8,
    ) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }

        if let Route::SubCell { class, guarded } = self.route(size, alignment) {
            return self.alloc_sub_cell(size, tag, class, guarded);
        }

        self.charge_budget(size, size)?;
        match self.large.alloc_aligned(size, alignment, tag) {
            Ok(p) => {
                self.note_alloc(p.as_ptr(), size, size, tag, TierKind::Large);
                Ok(p)
            }
            Err(e) => {
                self.uncharge_budget(size);
                Err(e.into())
            }
        }
    }

    /// Explicit large-path allocation: buddy for <= 2MB, OS-direct beyond
    /// (honouring `huge_hint`).
    pub fn alloc_large(
        &self,
        size: usize,
        tag: u8,
        huge_hint: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        if size <= buddy::MAX_BLOCK_SIZE {
            let charged = buddy_charged(size);
            self.charge_budget(charged, size)?;
            match self.buddy.alloc(size, tag) {
                Ok(p) => {
                    self.note_alloc(p.as_ptr(), charged, size, buddy_tag(charged, tag), TierKind::Buddy);
                    Ok(p)
                }
                Err(e) => {
                    self.uncharge_budget(charged);
                    Err(e.into())
                }
            }
        } else {
            self.charge_budget(size, size)?;
            match self.large.alloc(size, tag, huge_hint && self.config.use_huge_pages) {
                Ok(p) => {
                    self.note_alloc(p.as_ptr(), size, size, tag, TierKind::Large);
                    Ok(p)
                }
                Err(e) => {
                    self.uncharge_budget(size);
                    Err(e.into())
                }
            }
        }
    }

    /// Free a pointer from the buddy or large tier. Equivalent to
    /// [`free_bytes`](Self::free_bytes) for those pointers.
    ///
    /// # Safety
    /// Same as `free_bytes`.
    pub unsafe fn free_large(&self, ptr: *mut u8) {
        // Safety: forwarded caller contract.
        unsafe { self.free_bytes(ptr) }
    }

    /// Allocate up to `out.len()` blocks of `size` bytes, writing user
    /// pointers into `out`. Returns the count delivered, which may fall
    /// short on OOM or budget exhaustion.
    pub fn alloc_batch(&self, size: usize, out: &mut [*mut u8], tag: u8) -> usize {
        if size == 0 || out.is_empty() {
            return 0;
        }

        let route = self.route(size, 8);
        let Route::SubCell { class, guarded } = route else {
            // No bulk lane outside the hot bins: per-call path.
            return self.alloc_batch_fallback(size, out, tag);
        };
        if class >= HOT_BIN_COUNT {
            return self.alloc_batch_fallback(size, out, tag);
        }

        let class_size = SIZE_CLASSES[class];
        let mut produced = 0;
        let mut chunk = [std::ptr::null_mut::<u8>(); bins::TLS_BIN_CACHE_CAPACITY];

        while produced < out.len() {
            let want = (out.len() - produced).min(chunk.len());
            let mut got = self.bins.drain_cache(class, &mut chunk[..want]);
            if got == 0 {
                if self.bins.refill_cache(&self.cells, class, tag).is_err() {
                    break;
                }
                got = self.bins.drain_cache(class, &mut chunk[..want]);
                if got == 0 {
                    break;
                }
            }

            for i in 0..got {
                let block = chunk[i];
                if self.charge_budget(class_size, size).is_err() {
                    // Hand the untouched remainder straight back.
                    // Safety: these blocks were never exposed to the caller.
                    unsafe {
                        self.bins.free_blocks_bulk(&self.cells, &chunk[i..got], class);
                    }
                    return produced;
                }
                let user = self.finish_sub_cell_block(block, class_size, guarded, size);
                out[produced] = user;
                produced += 1;
            }
        }
        produced
    }

    fn alloc_batch_fallback(&self, size: usize, out: &mut [*mut u8], tag: u8) -> usize {
        for (i, slot) in out.iter_mut().enumerate() {
            match self.alloc_routed(size, tag, 8) {
                Ok(p) => *slot = p.as_ptr(),
                Err(_) => return i,
            }
        }
        out.len()
    }

    /// Free a batch of pointers sharing one size class, all from the cell
    /// region.
    ///
    /// # Safety
    /// Precondition (documented, not checked in release): every non-null
    /// pointer came from this context's sub-cell tier, all from the same
    /// size class, none freed since. Violations corrupt the free lists.
    pub unsafe fn free_batch(&self, ptrs: &[*mut u8]) {
        let Some(&first) = ptrs.iter().find(|p| !p.is_null()) else {
            return;
        };
        debug_assert!(self.cells.contains(first as usize));
        let header = bins::header_of(first);
        // Safety: live bin-mode cell header.
        let class_idx = unsafe { (*header).class } as usize;
        debug_assert!(class_idx < bins::NUM_SIZE_BINS);
        let class_size = SIZE_CLASSES[class_idx];

        let mut blocks = Vec::with_capacity(ptrs.len());
        for &ptr in ptrs {
            let Some(nn) = NonNull::new(ptr) else { continue };
            debug_assert!(self.cells.contains(ptr as usize));
            let (block, offset_in_block) = self.resolve_block(nn, class_idx);
            #[cfg(debug_assertions)]
            if offset_in_block == debug::GUARD_SIZE {
                self.validate_guards(block, class_size);
            } else {
                debug_assert_eq!(offset_in_block, 0, "free_batch: interior pointer");
            }
            #[cfg(not(debug_assertions))]
            let _ = offset_in_block;

            let tag = unsafe { (*bins::header_of(ptr)).tag };
            self.note_free(ptr, class_size, tag, TierKind::SubCell);
            self.uncharge_budget(class_size);
            blocks.push(block);
        }

        // Safety: per the documented precondition.
        unsafe { self.bins.free_blocks_bulk(&self.cells, &blocks, class_idx) };
    }

    // =====================================================================
    // Whole-cell API
    // =====================================================================

    /// Allocate a whole 16KB cell. The first [`CELL_PAYLOAD_OFFSET`] bytes
    /// hold the cell header; the usable payload follows it.
    pub fn alloc_cell(&self, tag: u8) -> Result<NonNull<u8>, AllocError> {
        self.charge_budget(CELL_SIZE, CELL_SIZE)?;
        let cell = match self.cells.alloc_cell() {
            Ok(c) => c,
            Err(e) => {
                self.uncharge_budget(CELL_SIZE);
                return Err(e.into());
            }
        };
        // Safety: fresh cell, exclusively ours.
        unsafe { bins::init_whole_cell(cell.as_ptr(), tag) };
        self.note_alloc(cell.as_ptr(), CELL_SIZE, CELL_SIZE, tag, TierKind::Cell);
        Ok(cell)
    }

    /// Return a cell obtained from [`alloc_cell`](Self::alloc_cell).
    /// Null-safe.
    ///
    /// # Safety
    /// A non-null `ptr` must be a cell from this context, with no live
    /// pointers into it.
    pub unsafe fn free_cell(&self, ptr: *mut u8) {
        let Some(nn) = NonNull::new(ptr) else { return };
        debug_assert!(self.cells.contains(ptr as usize));
        debug_assert!((ptr as usize).is_multiple_of(CELL_SIZE));
        // Safety: live whole-mode cell header.
        let tag = unsafe {
            let h = bins::header_of(ptr);
            debug_assert_eq!((*h).class, WHOLE_CELL_MARKER, "free_cell of a bin-mode cell");
            (*h).tag
        };
        self.note_free(ptr, CELL_SIZE, tag, TierKind::Cell);
        self.uncharge_budget(CELL_SIZE);
        self.cells.free_cell(nn);
    }

    // =====================================================================
    // Thread and region management
    // =====================================================================

    /// Fold this thread's sub-cell block caches back into their bins.
    pub fn flush_thread_bin_caches(&self) {
        self.bins.flush_thread_caches(&self.cells);
    }

    /// Flush both of this thread's caches (bin blocks and whole cells).
    /// Call before thread exit.
    pub fn flush_thread_caches(&self) {
        self.bins.flush_thread_caches(&self.cells);
        self.cells.flush_thread_cache();
    }

    /// Decommit every fully-free superblock. Returns bytes released.
    pub fn decommit_unused(&self) -> usize {
        self.cells.flush_thread_cache();
        self.cells.decommit_unused()
    }

    /// Physical bytes currently committed across all tiers.
    pub fn committed_bytes(&self) -> usize {
        self.cells.committed_bytes() + self.buddy.bytes_committed() + self.large.mapped_bytes()
    }

    // =====================================================================
    // Introspection
    // =====================================================================

    #[cfg(feature = "stats")]
    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[cfg(feature = "stats")]
    pub fn dump_stats(&self) {
        self.stats.dump();
    }

    #[cfg(feature = "stats")]
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Verify the guard runs around a sub-cell allocation. Pointers from
    /// other tiers (or unguarded allocations) report `true`.
    #[cfg(debug_assertions)]
    pub fn check_guards(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        if !self.cells.contains(addr) {
            return true;
        }
        let header = bins::header_of(ptr.cast_mut());
        // Safety: live cell header.
        let class = unsafe { (*header).class };
        if class == WHOLE_CELL_MARKER {
            return true;
        }
        let class_idx = class as usize;
        let nn = NonNull::new(ptr.cast_mut()).unwrap();
        let (block, offset_in_block) = self.resolve_block(nn, class_idx);
        if offset_in_block != debug::GUARD_SIZE {
            return true;
        }
        // Safety: block spans the whole class slot.
        unsafe { debug::guards_intact(block, SIZE_CLASSES[class_idx]) }
    }

    #[cfg(feature = "leak-tracking")]
    pub fn report_leaks(&self) -> usize {
        self.leaks.report()
    }

    #[cfg(feature = "leak-tracking")]
    pub fn live_allocation_count(&self) -> usize {
        self.leaks.live_count()
    }

    #[cfg(feature = "instrumentation")]
    pub fn set_alloc_callback(&self, callback: Option<AllocCallback>) {
        *self
            .alloc_callback
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = callback;
    }

    #[cfg(feature = "instrumentation")]
    pub fn get_alloc_callback(&self) -> Option<AllocCallback> {
        self.alloc_callback
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[cfg(feature = "budget")]
    pub fn set_budget_callback(&self, callback: Option<BudgetCallback>) {
        *self
            .budget_callback
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = callback;
    }

    /// Tier-rounded bytes currently counted against the budget.
    #[cfg(feature = "budget")]
    pub fn budget_used(&self) -> usize {
        self.budget_used.load(Ordering::Relaxed)
    }

    // =====================================================================
    // Routing internals
    // =====================================================================

    fn route(&self, size: usize, align: usize) -> Route {
        // Guard padding applies when the padded request still fits a class
        // and the guard offset keeps the alignment.
        #[cfg(debug_assertions)]
        if align <= debug::GUARD_SIZE
            && let Some(class) = bins::size_class_for(size + debug::GUARD_OVERHEAD, align)
        {
            return Route::SubCell {
                class,
                guarded: true,
            };
        }

        if let Some(class) = bins::size_class_for(size, align) {
            return Route::SubCell {
                class,
                guarded: false,
            };
        }
        if size <= WHOLE_CELL_MAX && align <= CELL_PAYLOAD_OFFSET {
            return Route::WholeCell;
        }
        if size <= buddy::MAX_BLOCK_SIZE && align <= buddy::HEADER_SIZE {
            return Route::Buddy;
        }
        Route::Large
    }

    fn alloc_routed(&self, size: usize, tag: u8, align: usize) -> Result<NonNull<u8>, AllocError> {
        match self.route(size, align) {
            Route::SubCell { class, guarded } => self.alloc_sub_cell(size, tag, class, guarded),
            Route::WholeCell => {
                // Telemetry keys on the pointer the caller will free, which
                // is the payload, so this cannot ride the public alloc_cell.
                self.charge_budget(CELL_SIZE, size)?;
                let cell = match self.cells.alloc_cell() {
                    Ok(c) => c,
                    Err(e) => {
                        self.uncharge_budget(CELL_SIZE);
                        return Err(e.into());
                    }
                };
                // Safety: fresh cell, exclusively ours.
                unsafe { bins::init_whole_cell(cell.as_ptr(), tag) };
                // Safety: payload offset is inside the cell.
                let user = unsafe { cell.as_ptr().add(CELL_PAYLOAD_OFFSET) };
                self.note_alloc(user, CELL_SIZE, size, tag, TierKind::Cell);
                // Safety: non-null by construction.
                Ok(unsafe { NonNull::new_unchecked(user) })
            }
            Route::Buddy => {
                let charged = buddy_charged(size);
                self.charge_budget(charged, size)?;
                match self.buddy.alloc(size, tag) {
                    Ok(p) => {
                        self.note_alloc(
                            p.as_ptr(),
                            charged,
                            size,
                            buddy_tag(charged, tag),
                            TierKind::Buddy,
                        );
                        Ok(p)
                    }
                    Err(e) => {
                        self.uncharge_budget(charged);
                        Err(e.into())
                    }
                }
            }
            Route::Large => {
                self.charge_budget(size, size)?;
                let result = if align <= page_size() {
                    self.large.alloc(size, tag, self.config.use_huge_pages)
                } else {
                    self.large.alloc_aligned(size, align, tag)
                };
                match result {
                    Ok(p) => {
                        self.note_alloc(p.as_ptr(), size, size, tag, TierKind::Large);
                        Ok(p)
                    }
                    Err(e) => {
                        self.uncharge_budget(size);
                        Err(e.into())
                    }
                }
            }
        }
    }

    fn alloc_sub_cell(
        &self,
        size: usize,
        tag: u8,
        class: usize,
        guarded: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        let class_size = SIZE_CLASSES[class];
        self.charge_budget(class_size, size)?;
        let block = match self.bins.alloc_block(&self.cells, class, tag) {
            Ok(b) => b,
            Err(e) => {
                self.uncharge_budget(class_size);
                return Err(e.into());
            }
        };
        let user = self.finish_sub_cell_block(block.as_ptr(), class_size, guarded, size);
        // Safety: user points into the block.
        Ok(unsafe { NonNull::new_unchecked(user) })
    }

    /// Guard-wrap a freshly produced block and run the alloc-side layers.
    /// Returns the user pointer.
    fn finish_sub_cell_block(
        &self,
        block: *mut u8,
        class_size: usize,
        guarded: bool,
        requested: usize,
    ) -> *mut u8 {
        let user = if guarded {
            #[cfg(debug_assertions)]
            // Safety: the block slot is exclusively ours.
            unsafe {
                debug::write_guards(block, class_size);
            }
            // Safety: guard offset is inside the slot.
            unsafe { block.add(debug::GUARD_SIZE) }
        } else {
            block
        };
        // Per-tag accounting is cell-granular for this tier: the cell's
        // tag byte is what free() can recover.
        // Safety: live cell header.
        let tag = unsafe { (*bins::header_of(block)).tag };
        self.note_alloc(user, class_size, requested, tag, TierKind::SubCell);
        user
    }

    /// Free a pointer that lies in the cell region (sub-cell block or
    /// whole-mode cell payload).
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this context.
    unsafe fn free_in_cell_region(&self, ptr: NonNull<u8>) {
        let header = bins::header_of(ptr.as_ptr());
        // Safety: live cell header.
        let (class, tag) = unsafe { ((*header).class, (*header).tag) };

        if class == WHOLE_CELL_MARKER {
            self.note_free(ptr.as_ptr(), CELL_SIZE, tag, TierKind::Cell);
            self.uncharge_budget(CELL_SIZE);
            // Safety: the payload pointer belongs to the masked cell.
            self.cells
                .free_cell(unsafe { NonNull::new_unchecked(header.cast::<u8>()) });
            return;
        }

        let class_idx = class as usize;
        debug_assert!(class_idx < bins::NUM_SIZE_BINS, "corrupt size-class byte");
        let class_size = SIZE_CLASSES[class_idx];
        let (block, offset_in_block) = self.resolve_block(ptr, class_idx);

        #[cfg(debug_assertions)]
        if offset_in_block == debug::GUARD_SIZE {
            self.validate_guards(block, class_size);
        } else {
            debug_assert_eq!(offset_in_block, 0, "free_bytes: interior pointer");
        }
        #[cfg(not(debug_assertions))]
        let _ = offset_in_block;

        self.note_free(ptr.as_ptr(), class_size, tag, TierKind::SubCell);
        self.uncharge_budget(class_size);
        // Safety: block base of a live sub-cell allocation.
        self.bins
            .free_block(&self.cells, unsafe { NonNull::new_unchecked(block) }, class_idx);
    }

    /// Map a user pointer to its block base and offset within the block.
    fn resolve_block(&self, ptr: NonNull<u8>, class_idx: usize) -> (*mut u8, usize) {
        let class_size = SIZE_CLASSES[class_idx];
        let header_addr = bins::header_of(ptr.as_ptr()) as usize;
        let payload = header_addr + CELL_PAYLOAD_OFFSET;
        let offset = ptr.as_ptr() as usize - payload;
        let block = payload + (offset / class_size) * class_size;
        (block as *mut u8, offset % class_size)
    }

    #[cfg(debug_assertions)]
    fn validate_guards(&self, block: *mut u8, class_size: usize) {
        // Safety: block spans the class slot.
        let intact = unsafe { debug::guards_intact(block, class_size) };
        assert!(
            intact,
            "cellar corruption: guard bytes damaged around allocation at {:p}",
            // Safety: guard offset is inside the slot.
            unsafe { block.add(debug::GUARD_SIZE) },
        );
    }

    // =====================================================================
    // Layer hooks
    // =====================================================================

    #[allow(unused_variables)]
    fn note_alloc(&self, ptr: *mut u8, charged: usize, requested: usize, tag: u8, tier: TierKind) {
        #[cfg(feature = "stats")]
        self.stats.record_alloc(charged, tag, tier.stats());
        #[cfg(feature = "leak-tracking")]
        self.leaks.record(ptr as usize, requested, tag);
        #[cfg(feature = "instrumentation")]
        if let Some(cb) = self.get_alloc_callback() {
            cb(ptr, requested, tag, AllocEvent::Alloc);
        }
    }

    #[allow(unused_variables)]
    fn note_free(&self, ptr: *mut u8, charged: usize, tag: u8, tier: TierKind) {
        #[cfg(feature = "stats")]
        self.stats.record_free(charged, tag, tier.stats());
        #[cfg(feature = "leak-tracking")]
        self.leaks.forget(ptr as usize);
        #[cfg(feature = "instrumentation")]
        if let Some(cb) = self.get_alloc_callback() {
            cb(ptr, charged, tag, AllocEvent::Free);
        }
    }

    #[allow(unused_variables)]
    fn charge_budget(&self, charged: usize, requested: usize) -> Result<(), AllocError> {
        #[cfg(feature = "budget")]
        {
            let limit = self.config.memory_budget;
            if limit == 0 {
                return Ok(());
            }
            let prev = self.budget_used.fetch_add(charged, Ordering::Relaxed);
            if prev + charged > limit {
                self.budget_used.fetch_sub(charged, Ordering::Relaxed);
                let cb = self
                    .budget_callback
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone();
                if let Some(cb) = cb {
                    cb(requested, prev, limit);
                }
                return Err(AllocError::BudgetExceeded {
                    requested,
                    used: prev,
                    limit,
                });
            }
        }
        Ok(())
    }

    #[allow(unused_variables)]
    fn uncharge_budget(&self, charged: usize) {
        #[cfg(feature = "budget")]
        if self.config.memory_budget != 0 {
            self.budget_used.fetch_sub(charged, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    pub(crate) fn owning_region(&self, ptr: *const u8) -> &'static str {
        let addr = ptr as usize;
        if self.cells.contains(addr) {
            "cells"
        } else if self.buddy.contains(addr) {
            "buddy"
        } else if NonNull::new(ptr.cast_mut()).is_some_and(|nn| self.large.owns(nn)) {
            "large"
        } else {
            "unknown"
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        #[cfg(feature = "leak-tracking")]
        self.leaks.report();

        // Remove this thread's cache entries. Other threads' entries are
        // keyed by this context's unique id and can never match again;
        // their few stale slots are reclaimed when those threads exit.
        bins::discard_thread_caches(self.id);
        cells::discard_thread_cache(self.id);
        // Tier drops release both regions and every large mapping.
    }
}

/// Tier-rounded size a buddy allocation occupies (what budget and stats
/// charge). Mirrors the order selection in the buddy tier.
fn buddy_charged(size: usize) -> usize {
    if size + buddy::HEADER_SIZE > buddy::MAX_BLOCK_SIZE {
        buddy::MAX_BLOCK_SIZE
    } else {
        (size + buddy::HEADER_SIZE)
            .max(buddy::MIN_BLOCK_SIZE)
            .next_power_of_two()
            - buddy::HEADER_SIZE
    }
}

/// Headerless whole-superblock buddy blocks carry no tag byte, so their
/// telemetry uses tag 0 on both sides.
fn buddy_tag(charged: usize, tag: u8) -> u8 {
    if charged == buddy::MAX_BLOCK_SIZE { 0 } else { tag }
}

fn page_size() -> usize {
    use super::vm::{PlatformVmOps, VmOps};
    PlatformVmOps::page_size()
}
