//! Registry for OS-direct large allocations (beyond the buddy tier) and
//! for aligned requests no size class can satisfy.
//!
//! Every mapping is tracked in a serialised map keyed by the user pointer.
//! Plain allocations attempt explicit huge pages first (with a runtime
//! probe that strikes out sizes after their first failure); over-aligned
//! allocations over-reserve and return an aligned sub-pointer.

use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Everything below this normally routes to the buddy tier; the registry
/// still accepts smaller sizes for the over-aligned path.
#[allow(dead_code)]
pub(crate) const MIN_LARGE_SIZE: usize = 2 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub(crate) struct LargeAlloc {
    /// User-visible size (the charged size).
    pub(crate) size: usize,
    /// Base of the OS mapping (differs from the key for aligned allocs).
    base: usize,
    /// Total mapped bytes.
    mapped: usize,
    pub(crate) tag: u8,
    #[allow(dead_code)]
    pub(crate) huge: bool,
    #[allow(dead_code)]
    aligned: bool,
}

/// Runtime probe for huge page availability, seeded from
/// `supported_page_sizes()`. A size is tried largest-first and struck off
/// after its first runtime failure, so a system without a hugetlb pool
/// pays for exactly one failed mmap.
struct HugePageProbe {
    /// `(page_size, should_try)`, sorted descending.
    sizes: Vec<(usize, bool)>,
}

impl HugePageProbe {
    fn new() -> Self {
        let base = PlatformVmOps::page_size();
        let mut sizes: Vec<(usize, bool)> = PlatformVmOps::supported_page_sizes()
            .into_iter()
            .filter(|&s| s > base)
            .map(|s| (s, true))
            .collect();
        sizes.sort_by_key(|&(s, _)| std::cmp::Reverse(s));
        Self { sizes }
    }

    fn disabled() -> Self {
        Self { sizes: Vec::new() }
    }

    fn mark_unavailable(&mut self, page_size: usize) {
        if let Some(entry) = self.sizes.iter_mut().find(|(s, _)| *s == page_size) {
            entry.1 = false;
        }
        #[cfg(debug_assertions)]
        eprintln!(
            "[cellar] {}MB huge pages unavailable at runtime; falling back to regular pages",
            page_size / (1024 * 1024),
        );
    }
}

struct LargeInner {
    allocs: HashMap<usize, LargeAlloc>,
    /// Sum of user-visible sizes.
    total_allocated: usize,
    /// Sum of mapped bytes (committed physical backing).
    total_mapped: usize,
    huge_probe: HugePageProbe,
}

pub(crate) struct LargeRegistry {
    inner: Mutex<LargeInner>,
}

// Safety: the registry owns every mapping it tracks; the mutex serialises
// all access.
unsafe impl Send for LargeRegistry {}
// Safety: same.
unsafe impl Sync for LargeRegistry {}

impl LargeRegistry {
    pub(crate) fn new(use_huge_pages: bool) -> Self {
        Self {
            inner: Mutex::new(LargeInner {
                allocs: HashMap::new(),
                total_allocated: 0,
                total_mapped: 0,
                huge_probe: if use_huge_pages {
                    HugePageProbe::new()
                } else {
                    HugePageProbe::disabled()
                },
            }),
        }
    }

    fn lock(&self) -> crate::sync::MutexGuard<'_, LargeInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Map a fresh region of at least `size` bytes, trying huge pages
    /// first when `huge_hint` is set.
    pub(crate) fn alloc(
        &self,
        size: usize,
        tag: u8,
        huge_hint: bool,
    ) -> Result<NonNull<u8>, VmError> {
        debug_assert!(size > 0);
        let page_size = PlatformVmOps::page_size();
        let map_len = size.next_multiple_of(page_size);

        let mut inner = self.lock();

        if huge_hint {
            for i in 0..inner.huge_probe.sizes.len() {
                let (hp_size, should_try) = inner.huge_probe.sizes[i];
                if !should_try || hp_size > map_len {
                    continue;
                }
                let alloc_len = map_len.next_multiple_of(hp_size);
                // Safety: alloc_len is a non-zero multiple of hp_size.
                match unsafe { PlatformVmOps::alloc_huge(alloc_len, hp_size) } {
                    Ok(ptr) => {
                        inner.allocs.insert(
                            ptr.as_ptr() as usize,
                            LargeAlloc {
                                size,
                                base: ptr.as_ptr() as usize,
                                mapped: alloc_len,
                                tag,
                                huge: true,
                                aligned: false,
                            },
                        );
                        inner.total_allocated += size;
                        inner.total_mapped += alloc_len;
                        return Ok(ptr);
                    }
                    Err(_) => inner.huge_probe.mark_unavailable(hp_size),
                }
            }
        }

        // Regular pages: reserve + commit in one go.
        // Safety: fresh mapping of map_len bytes.
        let ptr = unsafe {
            let ptr = PlatformVmOps::reserve(map_len)?;
            if let Err(e) = PlatformVmOps::commit(ptr, map_len) {
                drop(PlatformVmOps::release(ptr, map_len));
                return Err(e);
            }
            ptr
        };

        inner.allocs.insert(
            ptr.as_ptr() as usize,
            LargeAlloc {
                size,
                base: ptr.as_ptr() as usize,
                mapped: map_len,
                tag,
                huge: false,
                aligned: false,
            },
        );
        inner.total_allocated += size;
        inner.total_mapped += map_len;
        Ok(ptr)
    }

    /// Map a region whose start address is a multiple of `align`.
    /// Alignments up to the page size come for free; larger ones
    /// over-reserve by `align` and commit only the aligned window.
    pub(crate) fn alloc_aligned(
        &self,
        size: usize,
        align: usize,
        tag: u8,
    ) -> Result<NonNull<u8>, VmError> {
        debug_assert!(size > 0 && align.is_power_of_two());
        let page_size = PlatformVmOps::page_size();
        if align <= page_size {
            return self.alloc(size, tag, false);
        }

        let map_len = size.next_multiple_of(page_size);
        // Worst case the base sits (align - page_size) bytes before the
        // next aligned boundary.
        let total = (map_len + align - page_size).next_multiple_of(page_size);

        // Safety: fresh reservation; the aligned window is committed below.
        let (base, aligned_ptr) = unsafe {
            let base = PlatformVmOps::reserve(total)?;
            let aligned_addr = (base.as_ptr() as usize).next_multiple_of(align);
            let aligned_ptr = NonNull::new_unchecked(aligned_addr as *mut u8);
            if let Err(e) = PlatformVmOps::commit(aligned_ptr, map_len) {
                drop(PlatformVmOps::release(base, total));
                return Err(e);
            }
            (base, aligned_ptr)
        };

        let mut inner = self.lock();
        inner.allocs.insert(
            aligned_ptr.as_ptr() as usize,
            LargeAlloc {
                size,
                base: base.as_ptr() as usize,
                mapped: total,
                tag,
                huge: false,
                aligned: true,
            },
        );
        inner.total_allocated += size;
        inner.total_mapped += total;
        Ok(aligned_ptr)
    }

    /// Unmap a registered allocation. Returns the record, or `None` when
    /// the pointer is not ours (the caller treats that as a no-op).
    pub(crate) fn free(&self, ptr: NonNull<u8>) -> Option<LargeAlloc> {
        let mut inner = self.lock();
        let entry = inner.allocs.remove(&(ptr.as_ptr() as usize))?;
        inner.total_allocated -= entry.size;
        inner.total_mapped -= entry.mapped;
        drop(inner);

        // Safety: the mapping belongs to us and nothing references it any
        // more (caller contract).
        unsafe {
            let base = NonNull::new_unchecked(entry.base as *mut u8);
            drop(PlatformVmOps::release(base, entry.mapped));
        }
        Some(entry)
    }

    /// Registered record for a pointer, if it is ours.
    pub(crate) fn lookup(&self, ptr: NonNull<u8>) -> Option<LargeAlloc> {
        self.lock().allocs.get(&(ptr.as_ptr() as usize)).copied()
    }

    #[allow(dead_code)]
    pub(crate) fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.lock().allocs.contains_key(&(ptr.as_ptr() as usize))
    }

    #[allow(dead_code)]
    pub(crate) fn bytes_allocated(&self) -> usize {
        self.lock().total_allocated
    }

    pub(crate) fn mapped_bytes(&self) -> usize {
        self.lock().total_mapped
    }

    #[allow(dead_code)]
    pub(crate) fn allocation_count(&self) -> usize {
        self.lock().allocs.len()
    }
}

impl Drop for LargeRegistry {
    fn drop(&mut self) {
        let mut inner = self.lock();
        for (_, entry) in inner.allocs.drain() {
            // Safety: context teardown; the caller guarantees no pointer
            // into these mappings survives.
            unsafe {
                let base = NonNull::new_unchecked(entry.base as *mut u8);
                drop(PlatformVmOps::release(base, entry.mapped));
            }
        }
        inner.total_allocated = 0;
        inner.total_mapped = 0;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let registry = LargeRegistry::new(true);
        let size = 3 * 1024 * 1024;
        let p = registry.alloc(size, 5, true).unwrap();

        // Safety: mapping spans `size` exclusive bytes.
        unsafe {
            *p.as_ptr() = 0x11;
            *p.as_ptr().add(size - 1) = 0x22;
            assert_eq!(*p.as_ptr(), 0x11);
        }

        assert!(registry.owns(p));
        assert_eq!(registry.bytes_allocated(), size);
        assert_eq!(registry.allocation_count(), 1);

        let entry = registry.free(p).expect("registry should own p");
        assert_eq!(entry.size, size);
        assert_eq!(entry.tag, 5);
        assert_eq!(registry.allocation_count(), 0);
        assert_eq!(registry.bytes_allocated(), 0);
    }

    #[test]
    fn free_of_unknown_pointer_is_none() {
        let registry = LargeRegistry::new(false);
        let bogus = NonNull::new(0x1000 as *mut u8).unwrap();
        assert!(registry.free(bogus).is_none());
    }

    #[test]
    fn aligned_beyond_page_size() {
        let registry = LargeRegistry::new(false);
        let align = PlatformVmOps::page_size() * 16;
        let size = 64 * 1024;
        let p = registry.alloc_aligned(size, align, 0).unwrap();
        assert!((p.as_ptr() as usize).is_multiple_of(align));

        // Safety: the aligned window is committed.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0xEE, size);
            assert_eq!(*p.as_ptr().add(size - 1), 0xEE);
        }

        assert!(registry.free(p).is_some());
    }

    #[test]
    fn aligned_within_page_size_takes_plain_path() {
        let registry = LargeRegistry::new(false);
        let p = registry.alloc_aligned(8192, 64, 0).unwrap();
        assert!((p.as_ptr() as usize).is_multiple_of(64));
        registry.free(p);
    }

    #[test]
    fn lookup_reports_record() {
        let registry = LargeRegistry::new(false);
        let p = registry.alloc(MIN_LARGE_SIZE + 1, 9, false).unwrap();
        let rec = registry.lookup(p).expect("registry should own p");
        assert_eq!(rec.size, MIN_LARGE_SIZE + 1);
        assert_eq!(rec.tag, 9);
        assert!(!rec.huge);
        registry.free(p);
        assert!(registry.lookup(p).is_none());
    }

    #[test]
    fn drop_releases_everything() {
        let registry = LargeRegistry::new(false);
        let _a = registry.alloc(MIN_LARGE_SIZE, 0, false).unwrap();
        let _b = registry.alloc_aligned(4096, PlatformVmOps::page_size() * 4, 0).unwrap();
        assert_eq!(registry.allocation_count(), 2);
        drop(registry);
        // No assertion possible beyond "does not crash / leak tracked by OS".
    }
}
