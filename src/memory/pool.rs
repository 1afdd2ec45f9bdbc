//! Typed object pool: a thin wrapper over the context's byte allocator
//! with in-place construction and destruction.
//!
//! Thread safety is the context's (per-bin locking); the pool itself
//! holds no state beyond the tag.

use super::context::{AllocError, Context};
use std::marker::PhantomData;
use std::ptr::NonNull;

pub struct Pool<'ctx, T> {
    ctx: &'ctx Context,
    tag: u8,
    _marker: PhantomData<fn() -> T>,
}

impl<'ctx, T> Pool<'ctx, T> {
    /// Create a pool backed by the given context. `T` must not be
    /// zero-sized.
    pub fn new(ctx: &'ctx Context, tag: u8) -> Self {
        debug_assert!(std::mem::size_of::<T>() > 0, "Pool of a zero-sized type");
        Self {
            ctx,
            tag,
            _marker: PhantomData,
        }
    }

    /// Allocate memory for one `T` without constructing it.
    pub fn alloc(&self) -> Result<NonNull<T>, AllocError> {
        self.ctx
            .alloc_aligned(std::mem::size_of::<T>(), std::mem::align_of::<T>(), self.tag)
            .map(NonNull::cast)
    }

    /// Allocate memory for `count` contiguous `T` without constructing.
    pub fn alloc_array(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        let layout = std::alloc::Layout::array::<T>(count)
            .map_err(|_| AllocError::ZeroSize)?;
        self.ctx
            .alloc_aligned(layout.size(), layout.align(), self.tag)
            .map(NonNull::cast)
    }

    /// Free memory without running `T`'s destructor.
    ///
    /// # Safety
    /// `ptr` must come from this pool's [`alloc`](Self::alloc) or
    /// [`alloc_array`](Self::alloc_array) and not be freed since. Any
    /// constructed value inside is leaked, not dropped.
    pub unsafe fn free(&self, ptr: NonNull<T>) {
        // Safety: forwarded caller contract.
        unsafe { self.ctx.free_bytes(ptr.as_ptr().cast()) };
    }

    /// Allocate and move-construct one value.
    pub fn create(&self, value: T) -> Result<NonNull<T>, AllocError> {
        let ptr = self.alloc()?;
        // Safety: freshly allocated, aligned storage for T.
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Drop the value in place and free its memory.
    ///
    /// # Safety
    /// `ptr` must come from [`create`](Self::create) (or `alloc` followed
    /// by a write) and not be freed since.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        // Safety: per fn contract the value is initialised and ours.
        unsafe {
            std::ptr::drop_in_place(ptr.as_ptr());
            self.ctx.free_bytes(ptr.as_ptr().cast());
        }
    }

    /// Allocate up to `out.len()` objects, returning how many succeeded.
    pub fn alloc_batch(&self, out: &mut [Option<NonNull<T>>]) -> usize {
        for (i, slot) in out.iter_mut().enumerate() {
            match self.alloc() {
                Ok(ptr) => *slot = Some(ptr),
                Err(_) => return i,
            }
        }
        out.len()
    }

    /// Free a batch allocated by [`alloc_batch`](Self::alloc_batch).
    ///
    /// # Safety
    /// Every `Some` pointer must come from this pool and not be freed
    /// since; destructors are not run.
    pub unsafe fn free_batch(&self, ptrs: &[Option<NonNull<T>>]) {
        for ptr in ptrs.iter().flatten() {
            // Safety: per fn contract.
            unsafe { self.free(*ptr) };
        }
    }

    pub const fn object_size() -> usize {
        std::mem::size_of::<T>()
    }

    pub const fn object_alignment() -> usize {
        std::mem::align_of::<T>()
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::context::ContextConfig;

    fn ctx() -> Context {
        Context::with_config(ContextConfig {
            reserve_size: 128 * 1024 * 1024,
            ..ContextConfig::default()
        })
        .unwrap()
    }

    #[derive(Debug, PartialEq)]
    struct Body {
        position: [f32; 3],
        mass: f32,
    }

    #[test]
    fn create_and_destroy() {
        let ctx = ctx();
        let pool: Pool<'_, Body> = Pool::new(&ctx, 7);

        let body = pool
            .create(Body {
                position: [1.0, 2.0, 3.0],
                mass: 80.0,
            })
            .unwrap();
        // Safety: body is live and initialised.
        unsafe {
            assert_eq!(body.as_ref().mass, 80.0);
            assert_eq!(body.as_ref().position[2], 3.0);
            pool.destroy(body);
        }
        #[cfg(feature = "leak-tracking")]
        assert_eq!(ctx.live_allocation_count(), 0);
    }

    #[test]
    fn destroy_runs_drop() {
        use crate::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let ctx = ctx();
        let pool: Pool<'_, Tracked> = Pool::new(&ctx, 0);
        let a = pool.create(Tracked).unwrap();
        let before = DROPS.load(Ordering::Relaxed);
        // Safety: a is live.
        unsafe { pool.destroy(a) };
        assert_eq!(DROPS.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn alloc_array_is_contiguous() {
        let ctx = ctx();
        let pool: Pool<'_, u64> = Pool::new(&ctx, 0);
        let arr = pool.alloc_array(16).unwrap();
        // Safety: 16 u64 slots, exclusively ours.
        unsafe {
            for i in 0..16 {
                arr.as_ptr().add(i).write(i as u64 * 3);
            }
            for i in 0..16 {
                assert_eq!(arr.as_ptr().add(i).read(), i as u64 * 3);
            }
            pool.free(arr);
        }
    }

    #[test]
    fn high_alignment_types_are_respected() {
        #[repr(align(64))]
        struct CacheLine([u8; 64]);

        let ctx = ctx();
        let pool: Pool<'_, CacheLine> = Pool::new(&ctx, 0);
        let p = pool.create(CacheLine([0xAA; 64])).unwrap();
        assert!((p.as_ptr() as usize).is_multiple_of(64));
        // Safety: p is live.
        unsafe { pool.destroy(p) };
    }

    #[test]
    fn batch_roundtrip() {
        let ctx = ctx();
        let pool: Pool<'_, [u8; 48]> = Pool::new(&ctx, 0);
        let mut slots = [None; 32];
        let n = pool.alloc_batch(&mut slots);
        assert_eq!(n, 32);
        assert!(slots.iter().all(Option::is_some));
        // Safety: all slots are live pool allocations.
        unsafe { pool.free_batch(&slots) };
        #[cfg(feature = "leak-tracking")]
        assert_eq!(ctx.live_allocation_count(), 0);
    }
}
