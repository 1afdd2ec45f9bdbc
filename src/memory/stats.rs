//! Per-context allocation statistics.
//!
//! All counters use `Relaxed` ordering: individual values are eventually
//! consistent and cross-counter snapshots may transiently disagree (e.g.
//! `current_allocated` vs. the per-tag sum mid-update). That is acceptable
//! for diagnostic display. Do NOT use these values for allocation decisions.
//!
//! Compiled only with the `stats` feature; the context's recording hooks
//! collapse to nothing without it.

#![cfg(feature = "stats")]

use crate::sync::atomic::{AtomicU64, Ordering};

/// Allocation tier, for per-tier counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tier {
    Cell,
    SubCell,
    Buddy,
    Large,
}

/// Live counters owned by a context.
///
/// Sizes recorded here are the *charged* sizes (size-class block size,
/// whole-cell size, buddy block size, large mapping size), the same value
/// on the alloc and the free side, so current bytes always balance.
pub(crate) struct MemoryStats {
    total_allocated: AtomicU64,
    total_freed: AtomicU64,
    current_allocated: AtomicU64,
    peak_allocated: AtomicU64,

    cell_allocs: AtomicU64,
    cell_frees: AtomicU64,
    subcell_allocs: AtomicU64,
    subcell_frees: AtomicU64,
    buddy_allocs: AtomicU64,
    buddy_frees: AtomicU64,
    large_allocs: AtomicU64,
    large_frees: AtomicU64,

    per_tag_current: [AtomicU64; 256],
}

/// Plain-data view of [`MemoryStats`] returned by `Context::get_stats`.
#[derive(Clone, Debug, Default)]
pub struct StatsSnapshot {
    pub total_allocated: u64,
    pub total_freed: u64,
    pub current_allocated: u64,
    pub peak_allocated: u64,
    pub cell_allocs: u64,
    pub cell_frees: u64,
    pub subcell_allocs: u64,
    pub subcell_frees: u64,
    pub buddy_allocs: u64,
    pub buddy_frees: u64,
    pub large_allocs: u64,
    pub large_frees: u64,
    pub per_tag_current: Vec<(u8, u64)>,
}

impl MemoryStats {
    pub(crate) fn new() -> Self {
        Self {
            total_allocated: AtomicU64::new(0),
            total_freed: AtomicU64::new(0),
            current_allocated: AtomicU64::new(0),
            peak_allocated: AtomicU64::new(0),
            cell_allocs: AtomicU64::new(0),
            cell_frees: AtomicU64::new(0),
            subcell_allocs: AtomicU64::new(0),
            subcell_frees: AtomicU64::new(0),
            buddy_allocs: AtomicU64::new(0),
            buddy_frees: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            large_frees: AtomicU64::new(0),
            per_tag_current: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub(crate) fn record_alloc(&self, size: usize, tag: u8, tier: Tier) {
        let size = size as u64;
        self.total_allocated.fetch_add(size, Ordering::Relaxed);
        let current = self.current_allocated.fetch_add(size, Ordering::Relaxed) + size;

        // Peak update: compare-exchange loop, approximate under contention.
        let mut peak = self.peak_allocated.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_allocated.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }

        self.per_tag_current[tag as usize].fetch_add(size, Ordering::Relaxed);
        self.tier_counter(tier, true).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self, size: usize, tag: u8, tier: Tier) {
        let size = size as u64;
        self.total_freed.fetch_add(size, Ordering::Relaxed);
        self.current_allocated.fetch_sub(size, Ordering::Relaxed);
        self.per_tag_current[tag as usize].fetch_sub(size, Ordering::Relaxed);
        self.tier_counter(tier, false).fetch_add(1, Ordering::Relaxed);
    }

    fn tier_counter(&self, tier: Tier, alloc: bool) -> &AtomicU64 {
        match (tier, alloc) {
            (Tier::Cell, true) => &self.cell_allocs,
            (Tier::Cell, false) => &self.cell_frees,
            (Tier::SubCell, true) => &self.subcell_allocs,
            (Tier::SubCell, false) => &self.subcell_frees,
            (Tier::Buddy, true) => &self.buddy_allocs,
            (Tier::Buddy, false) => &self.buddy_frees,
            (Tier::Large, true) => &self.large_allocs,
            (Tier::Large, false) => &self.large_frees,
        }
    }

    pub(crate) fn reset(&self) {
        self.total_allocated.store(0, Ordering::Relaxed);
        self.total_freed.store(0, Ordering::Relaxed);
        self.current_allocated.store(0, Ordering::Relaxed);
        self.peak_allocated.store(0, Ordering::Relaxed);
        self.cell_allocs.store(0, Ordering::Relaxed);
        self.cell_frees.store(0, Ordering::Relaxed);
        self.subcell_allocs.store(0, Ordering::Relaxed);
        self.subcell_frees.store(0, Ordering::Relaxed);
        self.buddy_allocs.store(0, Ordering::Relaxed);
        self.buddy_frees.store(0, Ordering::Relaxed);
        self.large_allocs.store(0, Ordering::Relaxed);
        self.large_frees.store(0, Ordering::Relaxed);
        for tag in &self.per_tag_current {
            tag.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let per_tag_current = self
            .per_tag_current
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                let v = v.load(Ordering::Relaxed);
                (v > 0).then_some((i as u8, v))
            })
            .collect();

        StatsSnapshot {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            current_allocated: self.current_allocated.load(Ordering::Relaxed),
            peak_allocated: self.peak_allocated.load(Ordering::Relaxed),
            cell_allocs: self.cell_allocs.load(Ordering::Relaxed),
            cell_frees: self.cell_frees.load(Ordering::Relaxed),
            subcell_allocs: self.subcell_allocs.load(Ordering::Relaxed),
            subcell_frees: self.subcell_frees.load(Ordering::Relaxed),
            buddy_allocs: self.buddy_allocs.load(Ordering::Relaxed),
            buddy_frees: self.buddy_frees.load(Ordering::Relaxed),
            large_allocs: self.large_allocs.load(Ordering::Relaxed),
            large_frees: self.large_frees.load(Ordering::Relaxed),
            per_tag_current,
        }
    }

    pub(crate) fn dump(&self) {
        let s = self.snapshot();
        println!("=== cellar memory stats ===");
        println!("total allocated:   {} bytes", s.total_allocated);
        println!("total freed:       {} bytes", s.total_freed);
        println!("current allocated: {} bytes", s.current_allocated);
        println!("peak allocated:    {} bytes", s.peak_allocated);
        println!("cell allocs/frees:     {} / {}", s.cell_allocs, s.cell_frees);
        println!("sub-cell allocs/frees: {} / {}", s.subcell_allocs, s.subcell_frees);
        println!("buddy allocs/frees:    {} / {}", s.buddy_allocs, s.buddy_frees);
        println!("large allocs/frees:    {} / {}", s.large_allocs, s.large_frees);
        if !s.per_tag_current.is_empty() {
            println!("per-tag current:");
            for (tag, bytes) in &s.per_tag_current {
                println!("  tag {tag:3}: {bytes} bytes");
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn record_and_snapshot_balance() {
        let stats = MemoryStats::new();
        stats.record_alloc(64, 1, Tier::SubCell);
        stats.record_alloc(2048, 1, Tier::SubCell);
        stats.record_alloc(65536, 2, Tier::Buddy);

        let s = stats.snapshot();
        assert_eq!(s.total_allocated, 64 + 2048 + 65536);
        assert_eq!(s.current_allocated, 64 + 2048 + 65536);
        assert_eq!(s.subcell_allocs, 2);
        assert_eq!(s.buddy_allocs, 1);
        assert_eq!(s.per_tag_current, vec![(1, 2112), (2, 65536)]);

        stats.record_free(2048, 1, Tier::SubCell);
        stats.record_free(65536, 2, Tier::Buddy);
        let s = stats.snapshot();
        assert_eq!(s.current_allocated, 64);
        assert_eq!(s.total_freed, 2048 + 65536);
        assert_eq!(s.per_tag_current, vec![(1, 64)]);
    }

    #[test]
    fn peak_tracks_high_water() {
        let stats = MemoryStats::new();
        stats.record_alloc(1000, 0, Tier::Large);
        stats.record_free(1000, 0, Tier::Large);
        stats.record_alloc(400, 0, Tier::Large);

        let s = stats.snapshot();
        assert_eq!(s.peak_allocated, 1000);
        assert_eq!(s.current_allocated, 400);
    }

    #[test]
    fn reset_clears_everything() {
        let stats = MemoryStats::new();
        stats.record_alloc(512, 7, Tier::Cell);
        stats.reset();

        let s = stats.snapshot();
        assert_eq!(s.total_allocated, 0);
        assert_eq!(s.current_allocated, 0);
        assert_eq!(s.peak_allocated, 0);
        assert_eq!(s.cell_allocs, 0);
        assert!(s.per_tag_current.is_empty());
    }
}
