//! The block allocator interface consumed by the cache.
//!
//! The block (page) allocator itself is an external collaborator: it supplies and
//! releases fixed-size, naturally-aligned blocks and owns each block's atomic
//! reference counter. This module only describes the boundary the cache needs;
//! `pfrag` ships no allocator implementation of its own (see
//! [`crate::mock`] for a test double backed by plain heap memory).

/// Flags the caller passes down to [`BlockSource::alloc_block`].
///
/// The cache recognises and augments a subset of these on the large-block path
/// (see [`crate::cache::PageFragCache::refill`]); the caller's original flags are
/// preserved verbatim on the order-0 fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Request a single compound allocation rather than separate pages.
    pub const COMPOUND: AllocFlags = AllocFlags(1 << 0);
    /// Suppress allocator warnings on failure.
    pub const NO_WARN: AllocFlags = AllocFlags(1 << 1);
    /// Do not retry the allocation if it fails once.
    pub const NO_RETRY: AllocFlags = AllocFlags(1 << 2);
    /// Do not dip into the emergency reserve to satisfy this request.
    pub const NO_MEMALLOC: AllocFlags = AllocFlags(1 << 3);
    /// Permit the allocator to reclaim memory synchronously to satisfy the request.
    pub const DIRECT_RECLAIM: AllocFlags = AllocFlags(1 << 4);

    /// The flag set the large-block refill path adds on top of the caller's flags:
    /// {compound, no-warn, no-retry, no-memalloc} minus direct reclaim.
    #[inline]
    pub const fn cheap_large_block(caller_flags: AllocFlags) -> AllocFlags {
        AllocFlags(
            (caller_flags.0 & !Self::DIRECT_RECLAIM.0)
                | Self::COMPOUND.0
                | Self::NO_WARN.0
                | Self::NO_RETRY.0
                | Self::NO_MEMALLOC.0,
        )
    }

    #[inline(always)]
    pub const fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for AllocFlags {
    type Output = AllocFlags;

    #[inline(always)]
    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

/// A freshly allocated block, as reported by the block allocator.
#[derive(Debug, Clone, Copy)]
pub struct AllocatedBlock {
    /// Base virtual address, aligned to `PAGE_SIZE << order`.
    pub base: usize,
    /// Size class: the block is `PAGE_SIZE << order` bytes.
    pub order: u8,
    /// Set if this block was drawn from the emergency reserve.
    pub pfmemalloc: bool,
}

/// External collaborator: supplies and releases blocks, and owns each block's
/// atomic reference counter.
///
/// Implementors only need to make `alloc_block`/`free_block`/`locate` consistent
/// with each other; the refcount primitives are required to be sequentially
/// consistent read-modify-write operations, matching the contract in the design
/// document (§5 Concurrency & Resource Model).
pub trait BlockSource {
    /// Allocate a compound block of `PAGE_SIZE << order` bytes, aligned to that
    /// size. Returns `None` on failure.
    fn alloc_block(&self, order: u8, flags: AllocFlags) -> Option<AllocatedBlock>;

    /// Release a block whose refcount has fallen to zero.
    fn free_block(&self, base: usize, order: u8);

    /// Bijection from any address inside any live block back to that block's
    /// `(base, order)`. Must keep working for blocks the cache itself has long
    /// forgotten, as long as some external fragment reference keeps them alive.
    fn locate(&self, addr: usize) -> Option<(usize, u8)>;

    /// Atomically add `n` to the block's reference count.
    fn ref_add(&self, base: usize, n: u32);

    /// Atomically subtract `n` from the block's reference count. Returns `true`
    /// iff the count reached zero.
    fn ref_sub_test(&self, base: usize, n: u32) -> bool;

    /// Atomically set the block's reference count. Only ever called immediately
    /// after a `ref_sub_test` that returned `true` for the same block, so there
    /// are by definition no observers left to race with.
    fn ref_set(&self, base: usize, n: u32);

    /// Atomically decrement the block's reference count by one and test for
    /// zero, in a single step. Used by the free-standing [`crate::cache::free`].
    fn put_test(&self, base: usize) -> bool;
}
