use std::fmt;
use std::ptr::NonNull;

/// Huge page size constants.
#[allow(dead_code)]
pub(crate) const PAGE_SIZE_2MB: usize = 2 * 1024 * 1024;
#[allow(dead_code)]
pub(crate) const PAGE_SIZE_1GB: usize = 1024 * 1024 * 1024;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    DecommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::DecommitFailed(e) => write!(f, "VM decommit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e) => Some(e),
            VmError::InitializationFailed(_) => None,
        }
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// The range is inaccessible until committed.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    /// Idempotent: committing an already-committed range succeeds.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Return the physical pages of a committed range to the OS while
    /// keeping the address range mapped and accessible.
    ///
    /// Contents are undefined afterwards; on Linux the pages refault as
    /// zero-fill, on macOS and Windows stale data may persist until the
    /// kernel reclaims.
    ///
    /// Accessibility after decommit is load-bearing: the cell allocator's
    /// lock-free stack may issue a speculative read of a cell whose
    /// superblock was decommitted between the head load and the CAS. The
    /// read value is discarded when the CAS fails, but the load itself must
    /// not fault.
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    /// Supported page sizes, ascending (e.g. `[4096, 2097152]`).
    /// Reports what the kernel supports, not what is currently available;
    /// `alloc_huge` may still fail at runtime.
    fn supported_page_sizes() -> Vec<usize>;

    /// Allocate memory backed by explicit huge pages (reserve + commit in
    /// one step; the whole region is physically backed immediately).
    ///
    /// `size` must be a non-zero multiple of `huge_page_size`, which must
    /// be a power of two the platform supports (2MB, and 1GB on Linux with
    /// boot-time configuration). Free with [`release`](VmOps::release).
    unsafe fn alloc_huge(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError>;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    /// Linux: MAP_HUGETLB with the page-size log2 encoded in flag bits
    /// [31:26]. Requires a pre-populated hugetlb pool
    /// (`/proc/sys/vm/nr_hugepages`; 1GB pages need boot-time setup).
    #[cfg(target_os = "linux")]
    unsafe fn alloc_huge_impl(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
        const MAP_HUGE_SHIFT: libc::c_int = 26;
        const MAP_HUGE_2MB: libc::c_int = 21 << MAP_HUGE_SHIFT;
        const MAP_HUGE_1GB: libc::c_int = 30 << MAP_HUGE_SHIFT;

        let huge_flag = match huge_page_size {
            super::PAGE_SIZE_2MB => libc::MAP_HUGETLB | MAP_HUGE_2MB,
            super::PAGE_SIZE_1GB => libc::MAP_HUGETLB | MAP_HUGE_1GB,
            _ => {
                return Err(VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported huge page size {huge_page_size} on Linux"),
                )));
            }
        };

        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | huge_flag,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::ReservationFailed(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::other("mmap returned null for huge pages"))
        })
    }

    /// macOS Intel: XNU 2MB superpages, requested through the upper 16 bits
    /// of the mmap flags (`VM_FLAGS_SUPERPAGE_SIZE_2MB << 16`).
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    unsafe fn alloc_huge_impl(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
        const SUPERPAGE_2MB: libc::c_int = 1 << 16;

        if huge_page_size != super::PAGE_SIZE_2MB {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("macOS x86_64 only supports 2MB superpages, requested {huge_page_size}"),
            )));
        }

        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | SUPERPAGE_2MB,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::ReservationFailed(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::other("mmap returned null for superpages"))
        })
    }

    /// Apple Silicon: 16KB pages only, no superpage mechanism. Any attempt
    /// returns KERN_INVALID_ARGUMENT from the Mach VM layer, so fail early.
    #[cfg(all(target_os = "macos", not(target_arch = "x86_64")))]
    unsafe fn alloc_huge_impl(
        _size: usize,
        _huge_page_size: usize,
    ) -> Result<NonNull<u8>, VmError> {
        Err(VmError::ReservationFailed(io::Error::new(
            io::ErrorKind::Unsupported,
            "Apple Silicon does not support superpages",
        )))
    }

    /// Linux: probe /sys/kernel/mm/hugepages/ for kernel-supported sizes.
    /// Directory names are "hugepages-NkB".
    #[cfg(target_os = "linux")]
    fn probe_supported_page_sizes() -> Vec<usize> {
        let base = PlatformVmOps::page_size();
        let mut sizes = vec![base];

        if let Ok(entries) = std::fs::read_dir("/sys/kernel/mm/hugepages") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(kb_str) = name
                    .strip_prefix("hugepages-")
                    .and_then(|s| s.strip_suffix("kB"))
                    && let Ok(kb) = kb_str.parse::<usize>()
                {
                    sizes.push(kb * 1024);
                }
            }
        }

        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    #[cfg(target_os = "macos")]
    fn probe_supported_page_sizes() -> Vec<usize> {
        let base = PlatformVmOps::page_size();
        #[cfg(target_arch = "x86_64")]
        {
            vec![base, super::PAGE_SIZE_2MB]
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            vec![base]
        }
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            if size >= super::PAGE_SIZE_2MB {
                // Superblock-sized commits: ask for transparent huge pages.
                // Safety: FFI call to madvise.
                unsafe {
                    libc::madvise(
                        ptr.as_ptr().cast::<libc::c_void>(),
                        size,
                        libc::MADV_HUGEPAGE,
                    )
                };
            }

            // No zeroing here: commit() is idempotent and may target a range
            // that still holds live data. Zero-fill guarantees, where needed,
            // live in the allocator layers.

            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_DONTNEED (Linux) drops the pages immediately; the next
            // touch refaults zero-filled. MADV_FREE (macOS) marks them for
            // lazy reclaim. Neither changes protection: the range stays
            // accessible, which the lock-free cell stack depends on.
            #[cfg(target_os = "linux")]
            let advice = libc::MADV_DONTNEED;
            #[cfg(target_os = "macos")]
            let advice = libc::MADV_FREE;

            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, advice) } != 0 {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // 64-bit targets only; page size fits in usize.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        fn supported_page_sizes() -> Vec<usize> {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<Vec<usize>> = OnceLock::new();
            CACHED.get_or_init(probe_supported_page_sizes).clone()
        }

        unsafe fn alloc_huge(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(
                size != 0 && huge_page_size != 0 && size.is_multiple_of(huge_page_size),
                "alloc_huge: size ({size}) must be a non-zero multiple of huge_page_size ({huge_page_size})"
            );
            debug_assert!(
                huge_page_size.is_power_of_two(),
                "alloc_huge: huge_page_size ({huge_page_size}) must be a power of two"
            );

            // Safety: preconditions verified above; the impl is pure FFI.
            unsafe { alloc_huge_impl(size, huge_page_size) }
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    /// `MEM_RESET`: physical pages become reclaimable but the range stays
    /// committed and accessible. Not exposed by the libc crate.
    const MEM_RESET: u32 = 0x80000;

    /// `MEM_LARGE_PAGES` flag for VirtualAlloc. Requires the process to
    /// hold `SeLockMemoryPrivilege`. Not exposed by the libc crate.
    const MEM_LARGE_PAGES: u32 = 0x20000000;

    unsafe extern "system" {
        /// Minimum large page size supported by the system, or 0 if large
        /// pages are not supported. Not exposed by the libc crate.
        fn GetLargePageMinimum() -> usize;
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                libc::VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    libc::MEM_RESERVE,
                    libc::PAGE_NOACCESS,
                )
            };
            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe {
                libc::VirtualAlloc(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::MEM_COMMIT,
                    libc::PAGE_READWRITE,
                )
            };
            if result.is_null() {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MEM_RESET matches the trait's accessibility contract:
            // contents become disposable but the range never faults.
            // MEM_DECOMMIT would make it inaccessible.
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe {
                libc::VirtualAlloc(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    MEM_RESET,
                    libc::PAGE_READWRITE,
                )
            };
            if result.is_null() {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // MEM_RELEASE requires size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe {
                libc::VirtualFree(ptr.as_ptr().cast::<libc::c_void>(), 0, libc::MEM_RELEASE)
            } == 0
            {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to GetSystemInfo.
                unsafe {
                    let mut info: libc::SYSTEM_INFO = std::mem::zeroed();
                    libc::GetSystemInfo(&mut info);
                    info.dwPageSize as usize
                }
            })
        }

        fn supported_page_sizes() -> Vec<usize> {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<Vec<usize>> = OnceLock::new();
            CACHED
                .get_or_init(|| {
                    let base = Self::page_size();
                    let mut sizes = vec![base];
                    // Safety: FFI call.
                    let large = unsafe { GetLargePageMinimum() };
                    if large > 0 && large != base {
                        sizes.push(large);
                    }
                    sizes.sort_unstable();
                    sizes.dedup();
                    sizes
                })
                .clone()
        }

        unsafe fn alloc_huge(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(
                size != 0 && huge_page_size != 0 && size.is_multiple_of(huge_page_size),
                "alloc_huge: size ({size}) must be a non-zero multiple of huge_page_size ({huge_page_size})"
            );

            // Safety: FFI call.
            let system_large = unsafe { GetLargePageMinimum() };
            if system_large == 0 || huge_page_size != system_large {
                return Err(VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("large page size {huge_page_size} unavailable (system: {system_large})"),
                )));
            }

            // MEM_LARGE_PAGES must be combined with MEM_RESERVE | MEM_COMMIT;
            // the allocation is fully backed from the start.
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                libc::VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    libc::MEM_RESERVE | libc::MEM_COMMIT | MEM_LARGE_PAGES,
                    libc::PAGE_READWRITE,
                )
            };
            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::last_os_error())),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Every "reservation" is backed by
// a plain heap allocation; commit/decommit are no-ops (the memory is always
// accessible, which also matches the accessibility contract of `decommit`).
// This is enough to model the synchronization logic of the allocators; real
// page behaviour is covered by the platform implementations above.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }

    fn supported_page_sizes() -> Vec<usize> {
        vec![4096]
    }

    unsafe fn alloc_huge(_size: usize, _huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
        // No huge pages under the mock; callers fall back to reserve+commit.
        Err(VmError::ReservationFailed(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "huge pages unavailable under mock VM",
        )))
    }
}
