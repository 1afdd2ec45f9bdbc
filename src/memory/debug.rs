//! Debug-layer support: guard bytes, free-poisoning, leak tracking.
//!
//! Guards and poison follow the canary scheme: active only under
//! `debug_assertions`, zero overhead in release builds. Leak tracking is a
//! cargo feature (`leak-tracking`) because production builds sometimes want
//! it too.

#![allow(dead_code)]

/// Byte pattern written into both guard runs.
pub(crate) const GUARD_PATTERN: u8 = 0xAB;

/// Guard run length, bytes. One run before the user range, one at the end
/// of the block slot.
pub(crate) const GUARD_SIZE: usize = 16;

/// Bytes a guarded allocation adds to the routed size.
pub(crate) const GUARD_OVERHEAD: usize = 2 * GUARD_SIZE;

/// Byte written over freed sub-cell blocks (minus the link word).
pub(crate) const POISON_BYTE: u8 = 0xDD;

/// Guarded sub-cell block layout:
///
/// ```text
///   [0 .. 16)            front guard
///   [16 .. 16 + user)    user data
///   [class-16 .. class)  rear guard
/// ```
///
/// Both guard runs sit at offsets derived from the class size alone, so
/// validation needs no record of the requested size. The user pointer is
/// `block + GUARD_SIZE`; `free_bytes` recognizes a guarded block by that
/// offset within the block slot.
#[cfg(debug_assertions)]
pub(crate) unsafe fn write_guards(block: *mut u8, class_size: usize) {
    debug_assert!(class_size >= GUARD_OVERHEAD);
    // Safety: caller owns the whole block slot.
    unsafe {
        std::ptr::write_bytes(block, GUARD_PATTERN, GUARD_SIZE);
        std::ptr::write_bytes(block.add(class_size - GUARD_SIZE), GUARD_PATTERN, GUARD_SIZE);
    }
}

/// Check both guard runs of a guarded block. `block` is the slot base, not
/// the user pointer.
#[cfg(debug_assertions)]
pub(crate) unsafe fn guards_intact(block: *const u8, class_size: usize) -> bool {
    // Safety: caller guarantees block spans class_size readable bytes.
    unsafe {
        let front = std::slice::from_raw_parts(block, GUARD_SIZE);
        let rear = std::slice::from_raw_parts(block.add(class_size - GUARD_SIZE), GUARD_SIZE);
        front.iter().all(|&b| b == GUARD_PATTERN) && rear.iter().all(|&b| b == GUARD_PATTERN)
    }
}

// ---------------------------------------------------------------------------
// Leak tracking
// ---------------------------------------------------------------------------

#[cfg(feature = "leak-tracking")]
pub(crate) use leak_table::LeakTable;

#[cfg(feature = "leak-tracking")]
mod leak_table {
    use crate::sync::Mutex;
    use std::collections::HashMap;

    #[derive(Clone, Copy, Debug)]
    pub(crate) struct LeakRecord {
        pub(crate) size: usize,
        pub(crate) tag: u8,
    }

    /// Serialised map from user pointer to allocation record. Every alloc
    /// inserts, every free removes; what remains at context drop leaked.
    pub(crate) struct LeakTable {
        live: Mutex<HashMap<usize, LeakRecord>>,
    }

    impl LeakTable {
        pub(crate) fn new() -> Self {
            Self {
                live: Mutex::new(HashMap::new()),
            }
        }

        pub(crate) fn record(&self, ptr: usize, size: usize, tag: u8) {
            let mut live = self
                .live
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            live.insert(ptr, LeakRecord { size, tag });
        }

        pub(crate) fn forget(&self, ptr: usize) {
            let mut live = self
                .live
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            live.remove(&ptr);
        }

        pub(crate) fn live_count(&self) -> usize {
            self.live
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .len()
        }

        /// Print every live allocation to stderr. Returns the count.
        pub(crate) fn report(&self) -> usize {
            let live = self
                .live
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if live.is_empty() {
                return 0;
            }
            eprintln!("[cellar] {} live allocation(s):", live.len());
            let mut entries: Vec<_> = live.iter().collect();
            entries.sort_by_key(|(ptr, _)| **ptr);
            for (ptr, rec) in entries {
                eprintln!(
                    "  {:#x}: {} bytes, tag {}",
                    ptr, rec.size, rec.tag
                );
            }
            live.len()
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    #[cfg(debug_assertions)]
    #[test]
    fn guards_detect_overflow() {
        use super::*;
        let mut block = vec![0u8; 128];
        // Safety: block spans 128 bytes.
        unsafe {
            write_guards(block.as_mut_ptr(), 128);
            assert!(guards_intact(block.as_ptr(), 128));

            // Scribble one byte past the user range (into the rear guard).
            block[127] = 0x00;
            assert!(!guards_intact(block.as_ptr(), 128));
        }
    }

    #[cfg(feature = "leak-tracking")]
    #[test]
    fn leak_table_tracks_live_set() {
        use super::LeakTable;
        let table = LeakTable::new();
        table.record(0x1000, 64, 1);
        table.record(0x2000, 128, 2);
        assert_eq!(table.live_count(), 2);

        table.forget(0x1000);
        assert_eq!(table.live_count(), 1);

        table.forget(0x2000);
        assert_eq!(table.live_count(), 0);
        assert_eq!(table.report(), 0);
    }
}
