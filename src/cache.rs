//! The page-fragment cache itself.
//!
//! `PageFragCache` carves many small, variable-length, variable-alignment byte
//! ranges out of a single block obtained from a [`BlockSource`]. It exists to
//! avoid paying for a full allocator call (and an atomic refcount bump) on every
//! small buffer a caller needs -- the dominant use case is a high-rate producer
//! of small scratch buffers that allocates in one context and frees in another.
//!
//! # Single-threaded discipline
//!
//! A cache is not `Sync`: every mutating operation takes `&mut self`, which is
//! enough for the borrow checker to guarantee the exclusive access the design
//! requires. Callers that share one cache across contexts (per-CPU data,
//! softirq, a caller-owned lock) are responsible for the equivalent of that
//! `&mut` at their own layer; this type adds no locking of its own, because that
//! would defeat the point of the design.
//!
//! # The reference-count bias
//!
//! When the cache installs a fresh block it atomically adds [`MAX_BIAS`] to the
//! block's refcount and sets `pagecnt_bias = MAX_BIAS + 1`. Every committed
//! fragment then only decrements the local, non-atomic `pagecnt_bias` -- the
//! atomic refcount is touched at most twice per block lifetime (once on refill,
//! once on exhaustion or drain), plus one `ref_set` on in-place recycle. Losing
//! track of this invariant produces a correct but needlessly slow port; see
//! [`PageFragCache::reuse_or_refill`] for where it is collapsed back into the
//! atomic counter.

use log::trace;

use crate::align::{align_up_mask, alignment_of_mask};
use crate::block::{AllocFlags, BlockSource};
use crate::encoded::{EncodedPage, MAX_BIAS, PAGE_SIZE};
use crate::error::CacheError;

/// A tentative or committed byte range inside the cache's current block.
#[derive(Debug, Clone, Copy)]
pub struct Fragment {
    /// Virtual address of the first byte.
    pub va: usize,
    /// Base address of the block the fragment lives in.
    pub block_base: usize,
    /// Offset of the fragment from `block_base`.
    pub offset: usize,
    /// Size made available to the caller. For [`PageFragCache::prepare`] this is
    /// the *maximum* contiguous space left in the block, not necessarily the
    /// size requested.
    pub size: usize,
}

/// A per-context amortising sub-allocator over blocks from `S`.
///
/// Empty state (`encoded_page` all zero) and in-use state are distinguished
/// internally; `encoded_page == 0` can never collide with a real block since the
/// block allocator never hands back address zero.
pub struct PageFragCache<S: BlockSource> {
    encoded_page: Option<EncodedPage>,
    offset: usize,
    pagecnt_bias: u32,
    source: S,
}

impl<S: BlockSource> PageFragCache<S> {
    /// Create an empty cache over the given block source. No block is allocated
    /// until the first [`prepare`](Self::prepare) or [`alloc`](Self::alloc).
    pub const fn new(source: S) -> Self {
        PageFragCache {
            encoded_page: None,
            offset: 0,
            pagecnt_bias: 0,
            source,
        }
    }

    /// Whether the cache currently holds a block.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.encoded_page.is_none()
    }

    /// Access to the underlying block source, e.g. to call
    /// [`free`](crate::cache::free) on a fragment this cache previously handed
    /// out.
    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Obtain a new block and install it, discarding whatever this cache used to
    /// reference (the caller must have already dealt with the old block via
    /// [`reuse_or_refill`](Self::reuse_or_refill) or [`drain`](Self::drain)).
    ///
    /// Tries a block of [`MAX_ORDER`](crate::encoded::MAX_ORDER) first (a cheap,
    /// best-effort request that must not stall under memory pressure), then
    /// falls back to a single order-0 block with the caller's original flags.
    /// On total failure the cache is left empty and `None` is returned.
    fn refill(&mut self, flags: AllocFlags) -> Option<EncodedPage> {
        let large_flags = AllocFlags::cheap_large_block(flags);
        let block = self
            .source
            .alloc_block(crate::encoded::MAX_ORDER, large_flags)
            .or_else(|| self.source.alloc_block(0, flags));

        let block = match block {
            Some(b) => b,
            None => {
                self.encoded_page = None;
                self.offset = 0;
                self.pagecnt_bias = 0;
                return None;
            }
        };

        self.source.ref_add(block.base, MAX_BIAS);
        let encoded = EncodedPage::encode(block.base, block.order, block.pfmemalloc);
        self.encoded_page = Some(encoded);
        self.offset = 0;
        self.pagecnt_bias = MAX_BIAS + 1;
        trace!(
            "pfrag: refilled block base={:#x} order={} pfmemalloc={}",
            block.base, block.order, block.pfmemalloc
        );
        Some(encoded)
    }

    /// Ensure the current block can satisfy `fragsz` bytes aligned to
    /// `align_mask`, refilling if needed. Returns the encoded word of the block
    /// to use and the already-aligned offset to hand out from, or an error.
    ///
    /// This implements §4.3 of the design: collapse the bias into the atomic
    /// counter when the block is exhausted, recycle in place if no external
    /// reference survived (and the block isn't pfmemalloc), otherwise forget the
    /// block and refill.
    fn reuse_or_refill(
        &mut self,
        fragsz: usize,
        align_mask: usize,
        flags: AllocFlags,
    ) -> Result<(EncodedPage, usize), CacheError> {
        if fragsz > PAGE_SIZE {
            return Err(CacheError::TooLarge);
        }
        debug_assert!(
            alignment_of_mask(align_mask) <= PAGE_SIZE,
            "alignment wider than a block can never be satisfied"
        );

        if let Some(encoded) = self.encoded_page {
            let aligned = align_up_mask(self.offset, align_mask);
            if aligned + fragsz <= encoded.block_size() {
                return Ok((encoded, aligned));
            }
            // Exhausted. A recycled block always starts at offset 0, and
            // fragsz <= PAGE_SIZE <= block_size, so it is guaranteed to fit.
            if let Some(recycled) = self.collapse_and_maybe_recycle(encoded) {
                return Ok((recycled, 0));
            }
        }

        let encoded = self.refill(flags).ok_or(CacheError::OutOfMemory)?;
        Ok((encoded, 0))
    }

    /// Collapse `pagecnt_bias` into the block's atomic refcount. If the
    /// subtract reaches zero and the block is not pfmemalloc, recycle it in
    /// place (reset offset and bias, refresh the atomic count) and return the
    /// encoded word. Otherwise the block is forgotten -- released immediately
    /// if it was pfmemalloc, left for its surviving external references to free
    /// individually otherwise -- and `None` is returned.
    fn collapse_and_maybe_recycle(&mut self, encoded: EncodedPage) -> Option<EncodedPage> {
        let base = encoded.base();
        let reached_zero = self.source.ref_sub_test(base, self.pagecnt_bias);
        if reached_zero && !encoded.pfmemalloc() {
            self.source.ref_set(base, MAX_BIAS + 1);
            self.offset = 0;
            self.pagecnt_bias = MAX_BIAS + 1;
            trace!("pfrag: recycled block base={:#x} in place", base);
            return Some(encoded);
        }

        if reached_zero {
            trace!("pfrag: releasing pfmemalloc block base={:#x}", base);
            self.source.free_block(base, encoded.order());
        } else {
            trace!(
                "pfrag: forgetting block base={:#x}, external refs survive",
                base
            );
        }
        self.encoded_page = None;
        self.offset = 0;
        self.pagecnt_bias = 0;
        None
    }

    /// Ensure a contiguous region of at least `fragsz` bytes, aligned per
    /// `align_mask`, is available at the current aligned offset. May refill.
    ///
    /// On success the returned [`Fragment::size`] is the *maximum* available
    /// space up to the end of the block, not `fragsz` -- the caller may choose
    /// to use more than it asked for. `prepare` never mutates `offset` or
    /// `pagecnt_bias`; use [`commit`](Self::commit) to consume the space.
    pub fn prepare(
        &mut self,
        fragsz: usize,
        align_mask: usize,
        flags: AllocFlags,
    ) -> Result<Fragment, CacheError> {
        let (encoded, aligned_offset) = self.reuse_or_refill(fragsz, align_mask, flags)?;
        Ok(Fragment {
            va: encoded.base() + aligned_offset,
            block_base: encoded.base(),
            offset: aligned_offset,
            size: encoded.block_size() - aligned_offset,
        })
    }

    /// Non-refilling variant of [`prepare`](Self::prepare): returns a fragment
    /// iff the current block already satisfies the request without touching the
    /// block allocator. Used to decide whether a would-be fragment can be
    /// merged into the one just committed.
    pub fn probe(&self, fragsz: usize, align_mask: usize) -> Option<Fragment> {
        let encoded = self.encoded_page?;
        let aligned = align_up_mask(self.offset, align_mask);
        if aligned + fragsz > encoded.block_size() {
            return None;
        }
        Some(Fragment {
            va: encoded.base() + aligned,
            block_base: encoded.base(),
            offset: aligned,
            size: encoded.block_size() - aligned,
        })
    }

    /// Mark `used_sz` bytes as consumed from `fragment.offset`, taking a new
    /// external reference (decrementing `pagecnt_bias` by one). Returns the
    /// true number of bytes consumed including alignment padding, i.e.
    /// `new_offset - previous_offset`.
    ///
    /// # Panics (debug only)
    /// Panics if `used_sz > fragment.size`, or if `fragment` does not belong to
    /// the block this cache currently holds.
    pub fn commit(&mut self, fragment: &Fragment, used_sz: usize) -> usize {
        let consumed = self.commit_noref(fragment, used_sz);
        debug_assert!(self.pagecnt_bias >= 1, "pagecnt_bias underflow on commit");
        self.pagecnt_bias -= 1;
        consumed
    }

    /// Same as [`commit`](Self::commit) but does not decrement `pagecnt_bias`.
    /// Used when the caller is coalescing this fragment into a previously
    /// committed one that already holds a reference, so no new external
    /// reference is created.
    ///
    /// # Panics (debug only)
    /// Panics if called on an empty cache, if `used_sz > fragment.size`, or if
    /// `fragment` does not belong to the block this cache currently holds. In
    /// release builds an empty cache is instead trusted rather than checked
    /// (see the `unsafe` block below); the other two conditions remain
    /// unchecked misuse, per this module's error-handling policy.
    pub fn commit_noref(&mut self, fragment: &Fragment, used_sz: usize) -> usize {
        debug_assert!(self.encoded_page.is_some(), "commit on an empty cache");
        // SAFETY: committing a fragment the cache never handed out via
        // `prepare`/`probe` is caller misuse, checked above in debug builds;
        // a correctly-used cache always holds a block here.
        let encoded = unsafe { self.encoded_page.unwrap_unchecked() };
        debug_assert_eq!(
            encoded.base(),
            fragment.block_base,
            "fragment does not belong to the cache's current block"
        );
        debug_assert!(used_sz <= fragment.size, "commit exceeds prepared size");

        let new_offset = fragment.offset + used_sz;
        let consumed = new_offset - self.offset;
        self.offset = new_offset;
        consumed
    }

    /// Caller-side undo for the most recent commit of exactly `fragsz` bytes
    /// that took an external reference: `offset -= fragsz; pagecnt_bias += 1`.
    ///
    /// Valid only if no external reference to that fragment was ever taken
    /// (otherwise use [`abort_ref`](Self::abort_ref), which restores only the
    /// bias).
    ///
    /// # Panics (debug only)
    /// Panics if `fragsz > offset`.
    pub fn abort(&mut self, fragsz: usize) {
        debug_assert!(fragsz <= self.offset, "abort underflows offset");
        self.offset -= fragsz;
        self.pagecnt_bias += 1;
    }

    /// Restore only the bias consumed by a prior [`commit_noref`](Self::commit_noref)
    /// undo path, without moving `offset` back. Use when the fragment's bytes
    /// stay committed (e.g. a coalesced write that is being unwound at a higher
    /// level) but the reference itself needs giving back.
    pub fn abort_ref(&mut self) {
        self.pagecnt_bias += 1;
    }

    /// Convenience: [`prepare`](Self::prepare) then
    /// [`commit`](Self::commit)(`fragsz`). Returns the virtual address handed
    /// out -- the dominant caller path.
    pub fn alloc(
        &mut self,
        fragsz: usize,
        align_mask: usize,
        flags: AllocFlags,
    ) -> Result<usize, CacheError> {
        let fragment = self.prepare(fragsz, align_mask, flags)?;
        self.commit(&fragment, fragsz);
        Ok(fragment.va)
    }

    /// Tear the cache down: release the cached block back to the allocator by
    /// posting `pagecnt_bias` to the atomic counter, freeing the block if that
    /// reaches zero. Idempotent -- draining an already-empty cache is a no-op.
    pub fn drain(&mut self) {
        let encoded = match self.encoded_page.take() {
            Some(e) => e,
            None => return,
        };
        let base = encoded.base();
        if self.source.ref_sub_test(base, self.pagecnt_bias) {
            self.source.free_block(base, encoded.order());
        }
        self.offset = 0;
        self.pagecnt_bias = 0;
    }
}

impl<S: BlockSource> Drop for PageFragCache<S> {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Free a single fragment by address, independent of any particular cache.
///
/// Locates the containing block via `source`, then does the put-and-test-zero
/// dance on its refcount; if it reaches zero the block is returned to the
/// allocator. Tolerates addresses from blocks a cache has long forgotten, as
/// long as `source` can still `locate` them.
pub fn free<S: BlockSource>(source: &S, va: usize) {
    if let Some((base, order)) = source.locate(va) {
        if source.put_test(base) {
            source.free_block(base, order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoded::{MAX_BIAS, MAX_ORDER, MAX_SIZE};
    use crate::mock::MockSource;

    fn cache() -> PageFragCache<MockSource> {
        PageFragCache::new(MockSource::new())
    }

    #[test]
    fn fresh_alloc_takes_one_bias_unit() {
        let mut c = cache();
        let va = c.alloc(64, !0, AllocFlags::NONE).unwrap();
        assert_eq!(va, c.encoded_page.unwrap().base());
        assert_eq!(c.pagecnt_bias, MAX_BIAS);
        assert_eq!(c.source().refcount(c.encoded_page.unwrap().base()), MAX_BIAS + 1);
    }

    #[test]
    fn oversized_fragment_is_rejected_without_touching_state() {
        let mut c = cache();
        let err = c.alloc(PAGE_SIZE + 1, !0, AllocFlags::NONE).unwrap_err();
        assert_eq!(err, CacheError::TooLarge);
        assert!(c.is_empty());
    }

    #[test]
    fn out_of_memory_leaves_cache_empty() {
        let mut c = cache();
        c.source().set_out_of_memory(true);
        let err = c.alloc(64, !0, AllocFlags::NONE).unwrap_err();
        assert_eq!(err, CacheError::OutOfMemory);
        assert!(c.is_empty());
    }

    #[test]
    fn probe_sees_space_left_by_a_prior_commit() {
        let mut c = cache();
        let f1 = c.prepare(64, !0, AllocFlags::NONE).unwrap();
        c.commit(&f1, 64);
        let probed = c.probe(32, !0).expect("block still has room");
        assert_eq!(probed.offset, 64);
        assert!(c.probe(MAX_SIZE, !0).is_none());
    }

    #[test]
    fn align_mask_forces_padding() {
        let mut c = cache();
        let f1 = c.prepare(1, !0, AllocFlags::NONE).unwrap();
        c.commit(&f1, 1);
        // Next fragment must start on a 16-byte boundary.
        let align_mask = !0usize << 4;
        let f2 = c.prepare(16, align_mask, AllocFlags::NONE).unwrap();
        assert_eq!(f2.offset % 16, 0);
        assert!(f2.offset >= 1);
    }

    #[test]
    fn commit_then_abort_restores_offset_and_bias() {
        let mut c = cache();
        let f = c.prepare(128, !0, AllocFlags::NONE).unwrap();
        let offset_before = c.offset;
        let bias_before = c.pagecnt_bias;
        let consumed = c.commit(&f, 128);
        c.abort(consumed);
        assert_eq!(c.offset, offset_before);
        assert_eq!(c.pagecnt_bias, bias_before);
    }

    #[test]
    fn exhausting_a_block_with_no_frees_forgets_it() {
        let mut c = cache();
        // MAX_ORDER block is MAX_SIZE bytes; 16 fragments of that size fill it
        // exactly with no alignment padding.
        let fragsz = MAX_SIZE / 16;
        let mut first_base = 0;
        for i in 0..16 {
            let _va = c.alloc(fragsz, !0, AllocFlags::NONE).unwrap();
            if i == 0 {
                first_base = c.encoded_page.unwrap().base();
            }
        }
        assert_eq!(c.source().live_block_count(), 1);

        // One more allocation must exhaust and, since nothing was ever freed,
        // forget the old block (its refcount cannot reach zero) and refill.
        let va = c.alloc(fragsz, !0, AllocFlags::NONE).unwrap();
        let new_base = c.encoded_page.unwrap().base();
        assert_ne!(new_base, first_base);
        assert_eq!(c.source().live_block_count(), 2);
        assert_eq!(c.source().refcount(first_base), 16);
        assert_eq!(va, new_base);
    }

    #[test]
    fn exhausting_a_fully_freed_block_recycles_it_in_place() {
        let mut c = cache();
        let fragsz = MAX_SIZE / 16;
        let mut addrs = std::vec::Vec::new();
        for _ in 0..16 {
            addrs.push(c.alloc(fragsz, !0, AllocFlags::NONE).unwrap());
        }
        let base = c.encoded_page.unwrap().base();
        // 16 commits (none atomic) plus 16 external puts (each atomic) bring the
        // real refcount down to exactly `pagecnt_bias`, so the next exhaustion
        // collapses it to zero.
        for va in &addrs {
            free(c.source(), *va);
        }
        assert_eq!(c.source().refcount(base), c.pagecnt_bias);

        let next = c.alloc(fragsz, !0, AllocFlags::NONE).unwrap();
        assert_eq!(c.encoded_page.unwrap().base(), base, "block recycled in place");
        assert_eq!(next, base);
        assert_eq!(c.source().live_block_count(), 1);
        assert_eq!(c.source().refcount(base), MAX_BIAS + 1);
    }

    #[test]
    fn exhausting_a_fully_freed_pfmemalloc_block_is_released_not_recycled() {
        let mut c = cache();
        c.source().force_next_pfmemalloc();
        let fragsz = MAX_SIZE / 16;
        let mut addrs = std::vec::Vec::new();
        for _ in 0..16 {
            addrs.push(c.alloc(fragsz, !0, AllocFlags::NONE).unwrap());
        }
        let base = c.encoded_page.unwrap().base();
        assert!(c.encoded_page.unwrap().pfmemalloc());
        for va in &addrs {
            free(c.source(), *va);
        }
        assert_eq!(c.source().refcount(base), c.pagecnt_bias);

        // The collapse still reaches zero, but a pfmemalloc block must be
        // released back to the allocator rather than recycled in place.
        let next = c.alloc(fragsz, !0, AllocFlags::NONE).unwrap();
        let new_base = c.encoded_page.unwrap().base();
        assert_ne!(new_base, base, "pfmemalloc block must not be recycled in place");
        assert!(!c.source().is_live(base));
        assert_eq!(c.source().freed_bases(), std::vec![base]);
        assert_eq!(c.source().live_block_count(), 1);
        assert_eq!(next, new_base);
    }

    #[test]
    fn drain_keeps_block_alive_while_an_external_fragment_survives() {
        let mut c = cache();
        let va = c.alloc(64, !0, AllocFlags::NONE).unwrap();
        let base = c.encoded_page.unwrap().base();
        c.drain();
        assert!(c.is_empty());
        assert!(c.source().is_live(base));
        assert_eq!(c.source().refcount(base), 1);

        free(c.source(), va);
        assert!(!c.source().is_live(base));
        assert_eq!(c.source().freed_bases(), std::vec![base]);
    }

    #[test]
    fn large_block_refill_falls_back_to_order_zero() {
        let mut c = cache();
        c.source().fail_next_order(MAX_ORDER);
        let va = c.alloc(64, !0, AllocFlags::NONE).unwrap();
        let encoded = c.encoded_page.unwrap();
        assert_eq!(encoded.order(), 0);
        assert_eq!(encoded.block_size(), PAGE_SIZE);
        assert_eq!(va, encoded.base());
    }
}
