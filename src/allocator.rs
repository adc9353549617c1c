//! The allocator proper: heap skeleton, segregated free lists, placement,
//! coalescing, and in-place resizing over a [`Region`].
//!
//! ## Basic Types
//!
//! ### [`Allocator`](struct.Allocator.html)
//!
//! An `Allocator` owns its region and every piece of bookkeeping inside it:
//! the seglist head/tail/bound arrays at the region base, the prologue and
//! epilogue sentinels, and the blocks between them. It is single-threaded;
//! every call runs to completion before another may begin.
//!
//! ### [`Ptr`](../block/struct.Ptr.html)
//!
//! Payloads are addressed by `Ptr`, a 32-bit byte offset into the region.
//! `Ptr::NIL` plays the role a null pointer would.
//!
//! ### [`AllocatorConfig`](struct.AllocatorConfig.html)
//!
//! Runtime switches: placement policy, free-list insertion policy, and the
//! self-auditing hooks.
//!
//! ## Heap layout
//!
//! ```text
//!  [ head offsets,  one word per bin ]
//!  [ tail offsets,  one word per bin ]
//!  [ bin bounds,    one word per bin ]
//!  [ padding ][ prologue hdr ][ prologue ftr ][ block ]...[ block ][ epilogue hdr ]
//!                             ^ anchor
//! ```
//!
//! Free blocks keep their next/prev siblings in the first two payload words,
//! compressed to 32-bit offsets from the anchor; allocated blocks have no
//! footer, so a payload costs one header word of overhead.

use core::fmt;

use log::debug;

use crate::block::{
    align_up, decode_link, encode_link, HeaderWord, Ptr, ALIGNMENT, CHUNK_SIZE, DSIZE, MIN_BLOCK,
    NUM_BINS, WSIZE,
};
use crate::region::Region;

pub(crate) const HEADS_AT: u32 = 0;
pub(crate) const TAILS_AT: u32 = NUM_BINS * WSIZE;
pub(crate) const BOUNDS_AT: u32 = 2 * NUM_BINS * WSIZE;

/// The region provider refused to extend: the request cannot be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    Exhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Exhausted => write!(f, "heap exhausted"),
        }
    }
}

/// Placement search policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FitPolicy {
    /// Scan the bin for the smallest block that fits, stopping early once a
    /// candidate is too tight to split.
    Best,
    /// Take the first block that fits.
    First,
}

/// Free-list insertion policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertPolicy {
    /// Push freed blocks at the head of their bin.
    Lifo,
    /// Keep each bin sorted by block address.
    AddressOrdered,
}

/// Runtime switches. All fields have workable defaults.
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    pub fit: FitPolicy,
    pub insert: InsertPolicy,
    /// Audit every invariant after each mutating call, logging violations.
    pub debug_checks: bool,
    /// Log a block-by-block heap dump from each audit.
    pub view_heap: bool,
    /// Log the contents of each free list from each audit.
    pub view_free_list: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            fit: FitPolicy::Best,
            insert: InsertPolicy::Lifo,
            debug_checks: false,
            view_heap: false,
            view_free_list: false,
        }
    }
}

/// Round a request up to a legal block size: payload plus one header word,
/// aligned, never below the minimum block.
pub(crate) fn adjusted_size(n: usize) -> Result<usize, AllocError> {
    if n <= DSIZE as usize {
        return Ok(MIN_BLOCK as usize);
    }
    let padded = n
        .checked_add((WSIZE + ALIGNMENT - 1) as usize)
        .ok_or(AllocError::Exhausted)?;
    Ok(padded & !(ALIGNMENT as usize - 1))
}

/// A segregated-list, boundary-tag heap over a growable region.
pub struct Allocator<R: Region> {
    pub(crate) region: R,
    /// The prologue block pointer: anchor for compressed free-list links.
    pub(crate) anchor: u32,
    pub(crate) config: AllocatorConfig,
}

impl<R: Region> Allocator<R> {
    /// Install the heap skeleton and an initial chunk on `region`.
    pub fn new(region: R) -> Result<Self, AllocError> {
        Self::with_config(region, AllocatorConfig::default())
    }

    pub fn with_config(region: R, config: AllocatorConfig) -> Result<Self, AllocError> {
        let mut alloc = Allocator {
            region,
            anchor: 0,
            config,
        };

        // Seglist arrays plus padding, prologue header/footer, and the
        // epilogue header.
        let skeleton = align_up(((4 + 3 * NUM_BINS) * WSIZE) as usize);
        alloc
            .region
            .extend(skeleton)
            .map_err(|_| AllocError::Exhausted)?;

        for bin in 0..NUM_BINS {
            alloc.set_word(HEADS_AT + bin * WSIZE, 0);
            alloc.set_word(TAILS_AT + bin * WSIZE, 0);
            alloc.set_word(BOUNDS_AT + bin * WSIZE, 1 << (bin + 4));
        }

        let base = align_up((3 * NUM_BINS * WSIZE) as usize) as u32;
        alloc.set_word(base, 0); // alignment padding
        alloc.set_word(base + WSIZE, HeaderWord::new(DSIZE, true).raw()); // prologue header
        alloc.set_word(base + 2 * WSIZE, HeaderWord::new(DSIZE, true).raw()); // prologue footer
        alloc.set_word(base + 3 * WSIZE, HeaderWord::new(0, true).raw()); // epilogue header
        alloc.anchor = base + 2 * WSIZE;

        // The epilogue must know the prologue is allocated.
        alloc.set_succ_pred_allocated(Ptr(alloc.anchor), true);

        alloc.extend_heap(CHUNK_SIZE as usize)?;
        alloc.maybe_check(line!());
        Ok(alloc)
    }

    /// Allocate at least `n` usable bytes, 8-byte aligned.
    ///
    /// A zero-byte request succeeds with [`Ptr::NIL`].
    pub fn allocate(&mut self, n: usize) -> Result<Ptr, AllocError> {
        if n == 0 {
            return Ok(Ptr::NIL);
        }
        let asize = adjusted_size(n)?;
        debug!("allocate({}) rounded to {}", n, asize);

        // Anything too big for a 32-bit header cannot be sitting on a free
        // list; send it straight to the extender, which will refuse it.
        if asize <= u32::MAX as usize {
            if let Some(bp) = self.find_fit(asize as u32) {
                debug!("  found fit at {:?}", bp);
                self.place(bp, asize as u32);
                self.maybe_check(line!());
                return Ok(bp);
            }
        }

        let esize = asize.max(CHUNK_SIZE as usize);
        let bp = self.extend_heap(esize)?;
        debug!("  extended heap by {} for {:?}", esize, bp);
        self.place(bp, asize as u32);
        self.maybe_check(line!());
        Ok(bp)
    }

    /// Return the block at `bp` to the free lists, coalescing with its
    /// physical neighbors. A NIL handle is a no-op.
    ///
    /// `bp` must have come from a prior `allocate`/`resize`/`zeroed` call on
    /// this allocator and not have been released since; anything else leaves
    /// the heap undefined, as a foreign or double free would.
    pub fn release(&mut self, bp: Ptr) {
        if bp.is_nil() {
            return;
        }
        let size = self.header(bp).size();
        debug!("release({:?}) size {}", bp, size);

        let w = HeaderWord::new(size, false);
        self.set_header_soft(bp, w);
        self.set_footer(bp, w);
        self.set_succ_pred_allocated(bp, false);
        self.insert_free(bp);
        self.coalesce(bp);
        self.maybe_check(line!());
    }

    /// Resize the allocation at `bp` to at least `n` usable bytes.
    ///
    /// Shrinks and grows in place when the block (plus a free successor)
    /// allows it; otherwise allocates fresh, copies the surviving prefix of
    /// the payload, and releases the original. `resize(NIL, n)` allocates;
    /// `resize(bp, 0)` releases and returns NIL.
    pub fn resize(&mut self, bp: Ptr, n: usize) -> Result<Ptr, AllocError> {
        if bp.is_nil() {
            return self.allocate(n);
        }
        if n == 0 {
            self.release(bp);
            return Ok(Ptr::NIL);
        }

        let old = self.header(bp).size();
        let asize = adjusted_size(n)?;
        debug!("resize({:?}, {}) from {} to {}", bp, n, old, asize);

        if old as usize >= asize {
            // Shrinking in place.
            let asize = asize as u32;
            if old - asize >= MIN_BLOCK {
                let mut avail = old;
                let succ = self.succ(bp);
                if !self.header(succ).is_allocated() {
                    // Absorbing a free successor enlarges the remainder
                    // instead of stranding it next to one.
                    avail += self.header(succ).size();
                    self.remove_free(succ);
                }
                self.shrink_to(bp, asize, avail);
            } else {
                self.set_header_soft(bp, HeaderWord::new(old, true));
                self.set_succ_pred_allocated(bp, true);
            }
            self.maybe_check(line!());
            return Ok(bp);
        }

        // Growing: the free successor may already hold enough.
        let succ = self.succ(bp);
        if !self.header(succ).is_allocated()
            && (old + self.header(succ).size()) as usize >= asize
        {
            let asize = asize as u32;
            self.remove_free(succ);
            let avail = old + self.header(succ).size();
            if avail - asize >= MIN_BLOCK {
                self.shrink_to(bp, asize, avail);
            } else {
                self.set_header_soft(bp, HeaderWord::new(avail, true));
                self.set_succ_pred_allocated(bp, true);
            }
            self.maybe_check(line!());
            return Ok(bp);
        }

        // Fall back to allocate + copy + release. Only the payload bytes the
        // old block actually held may be read.
        let newp = self.allocate(n)?;
        let surviving = ((old - WSIZE) as usize).min(n);
        let (src, dst) = (bp.0 as usize, newp.0 as usize);
        self.region
            .bytes_mut()
            .copy_within(src..src + surviving, dst);
        self.release(bp);
        self.maybe_check(line!());
        Ok(newp)
    }

    /// Allocate `count * size` bytes, zeroed.
    pub fn zeroed(&mut self, count: usize, size: usize) -> Result<Ptr, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError::Exhausted)?;
        let bp = self.allocate(total)?;
        if !bp.is_nil() {
            let at = bp.0 as usize;
            self.region.bytes_mut()[at..at + total].fill(0);
        }
        self.maybe_check(line!());
        Ok(bp)
    }

    /// The usable bytes of the allocated block at `bp`: everything past the
    /// header, which is at least the `n` the block was requested with.
    ///
    /// Panics if `bp` is not a live allocation.
    pub fn payload(&self, bp: Ptr) -> &[u8] {
        assert!(!bp.is_nil(), "payload of NIL");
        let h = self.header(bp);
        assert!(h.is_allocated(), "payload of a free block");
        let at = bp.0 as usize;
        &self.region.bytes()[at..at + (h.size() - WSIZE) as usize]
    }

    pub fn payload_mut(&mut self, bp: Ptr) -> &mut [u8] {
        assert!(!bp.is_nil(), "payload of NIL");
        let h = self.header(bp);
        assert!(h.is_allocated(), "payload of a free block");
        let at = bp.0 as usize;
        &mut self.region.bytes_mut()[at..at + (h.size() - WSIZE) as usize]
    }

    /// The provider underneath, for drivers that track its growth.
    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    ////////////////////////////////////////////////////////////
    // Word and header plumbing

    pub(crate) fn word(&self, at: u32) -> u32 {
        let at = at as usize;
        let b = self.region.bytes();
        u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
    }

    pub(crate) fn set_word(&mut self, at: u32, value: u32) {
        let at = at as usize;
        self.region.bytes_mut()[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn header(&self, bp: Ptr) -> HeaderWord {
        HeaderWord::from_raw(self.word(bp.0 - WSIZE))
    }

    fn set_header(&mut self, bp: Ptr, h: HeaderWord) {
        self.set_word(bp.0 - WSIZE, h.raw());
    }

    /// Rewrite size and allocation state, leaving the predecessor bit as it
    /// was. Free-to-allocated transitions must not clobber that bit.
    fn set_header_soft(&mut self, bp: Ptr, h: HeaderWord) {
        let pred = self.header(bp).is_pred_allocated();
        self.set_header(bp, h.with_pred_allocated(pred));
    }

    /// The footer is the last word of a free block; `bp`'s header must
    /// already hold the final size.
    pub(crate) fn footer(&self, bp: Ptr) -> HeaderWord {
        HeaderWord::from_raw(self.word(bp.0 + self.header(bp).size() - DSIZE))
    }

    fn set_footer(&mut self, bp: Ptr, h: HeaderWord) {
        let at = bp.0 + self.header(bp).size() - DSIZE;
        self.set_word(at, h.raw());
    }

    /// The next block in address order.
    pub(crate) fn succ(&self, bp: Ptr) -> Ptr {
        Ptr(bp.0 + self.header(bp).size())
    }

    /// The previous block in address order. Only meaningful when that block
    /// is free: its footer is the word just below `bp`'s header.
    pub(crate) fn pred(&self, bp: Ptr) -> Ptr {
        let footer = HeaderWord::from_raw(self.word(bp.0 - DSIZE));
        Ptr(bp.0 - footer.size())
    }

    fn set_succ_pred_allocated(&mut self, bp: Ptr, allocated: bool) {
        let succ = self.succ(bp);
        let h = self.header(succ).with_pred_allocated(allocated);
        self.set_header(succ, h);
    }

    /// One past the last committed byte; the epilogue header sits just below.
    pub(crate) fn top(&self) -> u32 {
        self.region.committed() as u32
    }

    ////////////////////////////////////////////////////////////
    // Seglist index

    pub(crate) fn head(&self, bin: u32) -> Ptr {
        decode_link(self.word(HEADS_AT + bin * WSIZE), self.anchor)
    }

    fn set_head(&mut self, bin: u32, p: Ptr) {
        let link = encode_link(p, self.anchor);
        self.set_word(HEADS_AT + bin * WSIZE, link);
    }

    pub(crate) fn tail(&self, bin: u32) -> Ptr {
        decode_link(self.word(TAILS_AT + bin * WSIZE), self.anchor)
    }

    fn set_tail(&mut self, bin: u32, p: Ptr) {
        let link = encode_link(p, self.anchor);
        self.set_word(TAILS_AT + bin * WSIZE, link);
    }

    pub(crate) fn bin_bound(&self, bin: u32) -> u32 {
        self.word(BOUNDS_AT + bin * WSIZE)
    }

    /// The bin whose upper bound is the smallest one at or above `size`,
    /// clamped to the last (unbounded) bin.
    pub(crate) fn bin_of(&self, size: u32) -> u32 {
        let mut bin = 0;
        while size > self.bin_bound(bin) && bin < NUM_BINS - 1 {
            bin += 1;
        }
        bin
    }

    ////////////////////////////////////////////////////////////
    // Free-list store

    pub(crate) fn next_free(&self, bp: Ptr) -> Ptr {
        decode_link(self.word(bp.0), self.anchor)
    }

    pub(crate) fn prev_free(&self, bp: Ptr) -> Ptr {
        decode_link(self.word(bp.0 + WSIZE), self.anchor)
    }

    fn set_next_free(&mut self, bp: Ptr, to: Ptr) {
        let link = encode_link(to, self.anchor);
        self.set_word(bp.0, link);
    }

    fn set_prev_free(&mut self, bp: Ptr, to: Ptr) {
        let link = encode_link(to, self.anchor);
        self.set_word(bp.0 + WSIZE, link);
    }

    fn insert_free(&mut self, bp: Ptr) {
        let bin = self.bin_of(self.header(bp).size());
        let head = self.head(bin);

        if head.is_nil() {
            self.set_head(bin, bp);
            self.set_tail(bin, bp);
            // Overwrite both link slots; the payload may hold garbage.
            self.set_next_free(bp, Ptr::NIL);
            self.set_prev_free(bp, Ptr::NIL);
            return;
        }

        match self.config.insert {
            InsertPolicy::Lifo => {
                self.set_next_free(bp, head);
                self.set_prev_free(head, bp);
                self.set_head(bin, bp);
                self.set_prev_free(bp, Ptr::NIL);
            }
            InsertPolicy::AddressOrdered => self.insert_address_ordered(bin, bp, head),
        }
    }

    /// Keep the bin sorted by address: front, back, or a scan that starts
    /// from whichever end is closer to `bp`.
    fn insert_address_ordered(&mut self, bin: u32, bp: Ptr, head: Ptr) {
        let tail = self.tail(bin);
        if bp < head {
            self.set_next_free(bp, head);
            self.set_prev_free(head, bp);
            self.set_head(bin, bp);
            self.set_prev_free(bp, Ptr::NIL);
        } else if bp > tail {
            self.set_next_free(tail, bp);
            self.set_prev_free(bp, tail);
            self.set_tail(bin, bp);
            self.set_next_free(bp, Ptr::NIL);
        } else {
            // bp lands strictly between two siblings; find the first one
            // past it.
            let at = if bp.0 - head.0 < tail.0 - bp.0 {
                let mut at = head;
                while at < bp {
                    at = self.next_free(at);
                }
                at
            } else {
                let mut at = tail;
                while at > bp {
                    at = self.prev_free(at);
                }
                self.next_free(at)
            };
            let before = self.prev_free(at);
            self.set_next_free(bp, at);
            self.set_prev_free(bp, before);
            self.set_next_free(before, bp);
            self.set_prev_free(at, bp);
        }
    }

    fn remove_free(&mut self, bp: Ptr) {
        let bin = self.bin_of(self.header(bp).size());
        let head = self.head(bin);
        let tail = self.tail(bin);

        if head == tail {
            // bp is the only block in this bin.
            self.set_head(bin, Ptr::NIL);
            self.set_tail(bin, Ptr::NIL);
        } else if bp == head {
            let next = self.next_free(bp);
            self.set_head(bin, next);
            self.set_prev_free(next, Ptr::NIL);
        } else if bp == tail {
            let prev = self.prev_free(bp);
            self.set_tail(bin, prev);
            self.set_next_free(prev, Ptr::NIL);
        } else {
            let prev = self.prev_free(bp);
            let next = self.next_free(bp);
            self.set_next_free(prev, next);
            self.set_prev_free(next, prev);
        }
    }

    ////////////////////////////////////////////////////////////
    // Placement engine

    fn find_fit(&self, asize: u32) -> Option<Ptr> {
        let mut bin = self.bin_of(asize);
        while bin < NUM_BINS {
            let found = match self.config.fit {
                FitPolicy::Best => self.best_in_bin(bin, asize),
                FitPolicy::First => self.first_in_bin(bin, asize),
            };
            if found.is_some() {
                return found;
            }
            bin += 1;
        }
        None
    }

    fn best_in_bin(&self, bin: u32, asize: u32) -> Option<Ptr> {
        let mut candidate = None;
        let mut best = u32::MAX;
        let mut bp = self.head(bin);
        while !bp.is_nil() {
            let size = self.header(bp).size();
            if asize <= size && size < best {
                best = size;
                candidate = Some(bp);
                if size - asize < MIN_BLOCK {
                    // Too tight to split; nothing later can beat it.
                    break;
                }
            }
            bp = self.next_free(bp);
        }
        candidate
    }

    fn first_in_bin(&self, bin: u32, asize: u32) -> Option<Ptr> {
        let mut bp = self.head(bin);
        while !bp.is_nil() {
            if asize <= self.header(bp).size() {
                return Some(bp);
            }
            bp = self.next_free(bp);
        }
        None
    }

    /// Carve `asize` bytes out of the free block `bp`, splitting off the
    /// tail when the slack can stand alone as a block.
    fn place(&mut self, bp: Ptr, asize: u32) {
        let bsize = self.header(bp).size();
        // Splice out before touching any word of the block, so the list
        // never sees half-rewritten state.
        self.remove_free(bp);

        if bsize - asize >= MIN_BLOCK {
            self.set_header_soft(bp, HeaderWord::new(asize, true));
            let rest = self.succ(bp);
            let w = HeaderWord::new(bsize - asize, false);
            self.set_header(rest, w);
            self.set_footer(rest, w);
            self.set_succ_pred_allocated(bp, true);
            self.insert_free(rest);
            // The block past the tail still follows something free.
            self.set_succ_pred_allocated(rest, false);
        } else {
            self.set_header_soft(bp, HeaderWord::new(bsize, true));
            self.set_succ_pred_allocated(bp, true);
        }
    }

    ////////////////////////////////////////////////////////////
    // Coalescer

    /// Boundary-tag coalescing: one case per allocation state of the
    /// physical neighbors. `bp` must already be on a free list; the block
    /// that owns the merged region is returned.
    fn coalesce(&mut self, bp: Ptr) -> Ptr {
        let succ = self.succ(bp);
        let pred_allocated = self.header(bp).is_pred_allocated();
        let succ_allocated = self.header(succ).is_allocated();
        let mut size = self.header(bp).size();

        // The predecessor's footer is only read when the predecessor bit
        // says it is free, which is exactly when the footer exists.
        match (pred_allocated, succ_allocated) {
            (true, true) => bp,
            (true, false) => {
                size += self.header(succ).size();
                self.remove_free(succ);
                self.remove_free(bp);
                let w = HeaderWord::new(size, false);
                self.set_header_soft(bp, w);
                self.set_footer(bp, w);
                self.insert_free(bp);
                bp
            }
            (false, true) => {
                let pred = self.pred(bp);
                size += self.header(pred).size();
                self.remove_free(pred);
                self.remove_free(bp);
                let w = HeaderWord::new(size, false);
                self.set_header_soft(pred, w);
                self.set_footer(pred, w);
                self.insert_free(pred);
                pred
            }
            (false, false) => {
                let pred = self.pred(bp);
                size += self.header(pred).size() + self.header(succ).size();
                self.remove_free(pred);
                self.remove_free(succ);
                self.remove_free(bp);
                let w = HeaderWord::new(size, false);
                self.set_header_soft(pred, w);
                self.set_footer(pred, w);
                self.insert_free(pred);
                pred
            }
        }
    }

    ////////////////////////////////////////////////////////////
    // Resize engine

    /// Rewrite `bp` as `asize` allocated bytes out of `avail`, building a
    /// free block from the remainder; `avail - asize` must be at least the
    /// minimum block.
    fn shrink_to(&mut self, bp: Ptr, asize: u32, avail: u32) {
        self.set_header_soft(bp, HeaderWord::new(asize, true));
        let rest = self.succ(bp);
        let w = HeaderWord::new(avail - asize, false);
        self.set_header(rest, w);
        self.set_footer(rest, w);
        self.set_succ_pred_allocated(bp, true);
        self.insert_free(rest);
        // Whatever follows the remainder now follows a free block.
        self.set_succ_pred_allocated(rest, false);
    }

    ////////////////////////////////////////////////////////////
    // Heap extender

    /// Grow the region, rewrite the old epilogue into the header of a fresh
    /// free block, and hand that block to the coalescer.
    fn extend_heap(&mut self, bytes: usize) -> Result<Ptr, AllocError> {
        let size = align_up(bytes);
        let base = self
            .region
            .extend(size)
            .map_err(|_| AllocError::Exhausted)?;

        // The old epilogue header sits exactly one word below the new bytes.
        let bp = Ptr(base as u32);
        let w = HeaderWord::new(size as u32, false);
        self.set_header_soft(bp, w);
        self.set_footer(bp, w);
        let epilogue = self.succ(bp);
        self.set_header(epilogue, HeaderWord::new(0, true));

        self.insert_free(bp);
        Ok(self.coalesce(bp))
    }

    fn maybe_check(&self, line: u32) {
        if self.config.debug_checks {
            let _ = self.check(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::ToyRegion;

    use test_log::test;

    fn new_toy() -> Allocator<ToyRegion> {
        Allocator::new(ToyRegion::default()).unwrap()
    }

    fn assert_clean(alloc: &Allocator<ToyRegion>) {
        let (audit, _) = alloc.check(line!());
        assert!(audit.is_clean(), "audit failed: {:?}", audit);
    }

    #[test]
    fn test_adjusted_size() {
        assert_eq!(adjusted_size(1).unwrap(), 16);
        assert_eq!(adjusted_size(8).unwrap(), 16);
        assert_eq!(adjusted_size(9).unwrap(), 16);
        assert_eq!(adjusted_size(13).unwrap(), 24);
        assert_eq!(adjusted_size(24).unwrap(), 32);
        assert_eq!(adjusted_size(100).unwrap(), 104);
        assert!(adjusted_size(usize::MAX - 2).is_err());
    }

    #[test]
    fn test_bin_of() {
        let alloc = new_toy();
        assert_eq!(alloc.bin_of(16), 0);
        assert_eq!(alloc.bin_of(17), 1);
        assert_eq!(alloc.bin_of(32), 1);
        assert_eq!(alloc.bin_of(33), 2);
        assert_eq!(alloc.bin_of(64), 2);
        assert_eq!(alloc.bin_of(16384), 10);
        assert_eq!(alloc.bin_of(16392), 11);
        assert_eq!(alloc.bin_of(1 << 20), 11);
    }

    #[test]
    fn test_first_allocation() {
        let mut alloc = new_toy();
        assert_clean(&alloc);

        let p = alloc.allocate(1).unwrap();
        assert!(!p.is_nil());
        assert_eq!(p.offset() % 8, 0);
        assert_eq!(alloc.header(p).size(), 16);
        assert!(alloc.header(p).is_pred_allocated()); // the prologue
        assert_eq!(alloc.payload(p).len(), 12);
        assert_clean(&alloc);
    }

    #[test]
    fn test_zero_sized_requests() {
        let mut alloc = new_toy();
        assert_eq!(alloc.allocate(0).unwrap(), Ptr::NIL);
        alloc.release(Ptr::NIL);

        let p = alloc.resize(Ptr::NIL, 24).unwrap();
        assert!(!p.is_nil());
        assert_eq!(alloc.resize(p, 0).unwrap(), Ptr::NIL);
        assert_clean(&alloc);
    }

    #[test]
    fn test_release_coalesces_neighbors() {
        let mut alloc = new_toy();

        let a = alloc.allocate(24).unwrap();
        let b = alloc.allocate(24).unwrap();
        // Consume the rest of the initial chunk so a and b are the only
        // blocks that can become free.
        let c = alloc.allocate(188).unwrap();
        assert_eq!(alloc.header(c).size(), 192);

        alloc.release(a);
        assert_clean(&alloc);
        alloc.release(b);
        assert_clean(&alloc);

        // Two 32-byte blocks merged into one 64-byte block, filed in the
        // (32, 64] bin, and nothing else is free.
        let (_, stats) = alloc.check(line!());
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 64);
        assert_eq!(alloc.head(2), a);
        assert!(alloc.next_free(a).is_nil());
        assert_eq!(alloc.header(a).size(), 64);
    }

    #[test]
    fn test_resize_shrinks_in_place() {
        let mut alloc = new_toy();

        let p = alloc.allocate(100).unwrap();
        assert_eq!(alloc.header(p).size(), 104);

        let q = alloc.resize(p, 50).unwrap();
        assert_eq!(q, p);
        assert_eq!(alloc.header(p).size(), 56);

        let rest = alloc.succ(p);
        assert!(!alloc.header(rest).is_allocated());
        assert!(alloc.header(rest).size() >= 16);
        assert_clean(&alloc);
    }

    #[test]
    fn test_resize_expands_into_free_successor() {
        let mut alloc = new_toy();

        let p = alloc.allocate(100).unwrap();
        let q = alloc.allocate(100).unwrap();
        alloc.release(q);

        let r = alloc.resize(p, 180).unwrap();
        assert_eq!(r, p);
        assert_eq!(alloc.header(p).size(), 184);

        let rest = alloc.succ(p);
        assert!(!alloc.header(rest).is_allocated());
        assert_eq!(alloc.header(rest).size(), 72);
        assert_clean(&alloc);
    }

    #[test]
    fn test_resize_identity_preserves_contents() {
        let mut alloc = new_toy();

        let p = alloc.allocate(40).unwrap();
        for (i, b) in alloc.payload_mut(p).iter_mut().enumerate() {
            *b = i as u8;
        }
        let payload = alloc.payload(p).len();

        let q = alloc.resize(p, payload).unwrap();
        assert_eq!(q, p);
        for (i, b) in alloc.payload(p).iter().enumerate() {
            assert_eq!(*b, i as u8);
        }
        assert_clean(&alloc);
    }

    #[test]
    fn test_resize_fallback_copies_surviving_prefix() {
        let mut alloc = new_toy();

        let p = alloc.allocate(24).unwrap();
        // Pin an allocated block behind p so it cannot grow in place.
        let guard = alloc.allocate(24).unwrap();
        for b in alloc.payload_mut(p).iter_mut() {
            *b = 0x5A;
        }

        let q = alloc.resize(p, 200).unwrap();
        assert_ne!(q, p);
        // The old payload was 28 bytes; that prefix must have moved intact.
        assert!(alloc.payload(q)[..28].iter().all(|&b| b == 0x5A));
        assert_clean(&alloc);

        alloc.release(guard);
        alloc.release(q);
        assert_clean(&alloc);
    }

    #[test]
    fn test_extension_count_is_bounded() {
        let mut alloc = new_toy();
        let baseline = alloc.region().growths;

        for _ in 0..32 {
            alloc.allocate(8).unwrap();
        }
        // 32 minimum blocks plus an epilogue rewrite fit in ceil(520/256)
        // chunk extensions.
        assert!(alloc.region().growths - baseline <= 3);
        assert_clean(&alloc);
    }

    #[test]
    fn test_exhaustion_leaves_heap_consistent() {
        let mut alloc = new_toy();

        assert_eq!(alloc.allocate(1 << 31), Err(AllocError::Exhausted));
        assert_clean(&alloc);

        // The failed extension must not have disturbed anything.
        let p = alloc.allocate(8).unwrap();
        assert!(!p.is_nil());
        assert_clean(&alloc);
    }

    #[test]
    fn test_release_restores_free_state() {
        let mut alloc = new_toy();
        let (_, before) = alloc.check(line!());

        let p = alloc.allocate(100).unwrap();
        alloc.release(p);
        assert_clean(&alloc);

        let (_, after) = alloc.check(line!());
        assert_eq!(before.free_blocks, after.free_blocks);
        assert_eq!(before.free_bytes, after.free_bytes);
    }

    #[test]
    fn test_zeroed_clears_recycled_memory() {
        let mut alloc = new_toy();

        let p = alloc.allocate(40).unwrap();
        for b in alloc.payload_mut(p).iter_mut() {
            *b = 0xFF;
        }
        alloc.release(p);

        let z = alloc.zeroed(5, 8).unwrap();
        assert!(alloc.payload(z)[..40].iter().all(|&b| b == 0));
        assert_clean(&alloc);
    }

    #[test]
    fn test_zeroed_overflow_is_exhaustion() {
        let mut alloc = new_toy();
        assert_eq!(alloc.zeroed(usize::MAX, 2), Err(AllocError::Exhausted));
        assert_eq!(alloc.zeroed(3, 0).unwrap(), Ptr::NIL);
        assert_clean(&alloc);
    }

    #[test]
    fn test_first_fit_differs_from_best_fit() {
        // One bin holding [56-byte, 40-byte] blocks, in that list order:
        // first-fit grabs the 56, best-fit keeps looking and takes the 40.
        fn prepare(alloc: &mut Allocator<ToyRegion>) -> (Ptr, Ptr) {
            let a = alloc.allocate(52).unwrap();
            let _s1 = alloc.allocate(8).unwrap();
            let b = alloc.allocate(36).unwrap();
            let _s2 = alloc.allocate(8).unwrap();
            alloc.release(b);
            alloc.release(a); // LIFO: a ends up at the head
            (a, b)
        }

        let mut best = new_toy();
        let (_, b) = prepare(&mut best);
        assert_eq!(best.allocate(36).unwrap(), b);
        assert_clean(&best);

        let config = AllocatorConfig {
            fit: FitPolicy::First,
            ..AllocatorConfig::default()
        };
        let mut first = Allocator::with_config(ToyRegion::default(), config).unwrap();
        let (a, _) = prepare(&mut first);
        assert_eq!(first.allocate(36).unwrap(), a);
        let (audit, _) = first.check(line!());
        assert!(audit.is_clean(), "audit failed: {:?}", audit);
    }

    #[test]
    fn test_address_ordered_insertion() {
        let config = AllocatorConfig {
            insert: InsertPolicy::AddressOrdered,
            ..AllocatorConfig::default()
        };
        let mut alloc = Allocator::with_config(ToyRegion::default(), config).unwrap();

        // Three same-bin blocks separated by pinned allocations, released
        // out of address order: front, back, and the middle scan.
        let a = alloc.allocate(24).unwrap();
        let _s1 = alloc.allocate(8).unwrap();
        let b = alloc.allocate(24).unwrap();
        let _s2 = alloc.allocate(8).unwrap();
        let c = alloc.allocate(24).unwrap();
        let _s3 = alloc.allocate(8).unwrap();

        alloc.release(a);
        alloc.release(c);
        alloc.release(b);

        let bin = alloc.bin_of(32);
        assert_eq!(alloc.head(bin), a);
        assert_eq!(alloc.next_free(a), b);
        assert_eq!(alloc.next_free(b), c);
        assert!(alloc.next_free(c).is_nil());
        assert_eq!(alloc.tail(bin), c);

        let (audit, _) = alloc.check(line!());
        assert!(audit.is_clean(), "audit failed: {:?}", audit);
    }
}
