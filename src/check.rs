//! The heap checker: a post-condition audit of every invariant the allocator
//! maintains, plus the dump views it can log.
//!
//! The checker reports and keeps going. Violations are counted in an
//! [`Audit`](struct.Audit.html) and logged with the caller's line hint, so a
//! damaged heap can still be walked, dumped, and diagnosed instead of
//! panicking at the first bad word.

use core::fmt;

use log::{trace, warn};

use crate::allocator::Allocator;
use crate::block::{Ptr, ALIGNMENT, DSIZE, MIN_BLOCK, NUM_BINS};
use crate::region::Region;

/// A count of violations per invariant class found by one audit.
///
/// All zeros means the heap checked out clean.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Audit {
    /// Prologue or epilogue sentinels damaged or out of place.
    pub bad_sentinels: usize,
    /// Block payloads that are not 8-byte aligned.
    pub misaligned: usize,
    /// Blocks below the 16-byte minimum, with a ragged size, or overrunning
    /// the region.
    pub bad_sizes: usize,
    /// Free blocks whose header and footer disagree.
    pub footer_mismatches: usize,
    /// Blocks whose predecessor bit contradicts the predecessor's header.
    pub stale_pred_bits: usize,
    /// Pairs of physically adjacent free blocks.
    pub uncoalesced: usize,
    /// Free-list links that decode to somewhere outside the walkable heap.
    pub wild_links: usize,
    /// Head/tail/next/prev disagreements, allocated blocks on a list, or
    /// lists that fail to terminate.
    pub broken_links: usize,
    /// Free blocks filed in the wrong bin.
    pub misfiled: usize,
    /// 1 when the heap walk and the bin walk disagree on the free count.
    pub count_mismatches: usize,
}

impl Audit {
    /// Returns a boolean - a simple check if all counts are 0
    pub fn is_clean(&self) -> bool {
        self.bad_sentinels == 0
            && self.misaligned == 0
            && self.bad_sizes == 0
            && self.footer_mismatches == 0
            && self.stale_pred_bits == 0
            && self.uncoalesced == 0
            && self.wild_links == 0
            && self.broken_links == 0
            && self.misfiled == 0
            && self.count_mismatches == 0
    }
}

impl From<Audit> for bool {
    fn from(a: Audit) -> bool {
        a.is_clean()
    }
}

/// Occupancy totals gathered during the audit's heap walk.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Blocks between the prologue and the epilogue.
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
}

impl<R: Region> Allocator<R> {
    /// Walk the heap and every free list, verifying each invariant.
    ///
    /// `line` is a hint naming the call site, carried into every diagnostic
    /// so batch runs can locate the call that left the heap damaged.
    pub fn check(&self, line: u32) -> (Audit, Stats) {
        let mut audit = Audit::default();
        let mut stats = Stats::default();

        if self.config.view_heap {
            trace!("heap at line {}:\n{}", line, self.heap_dump());
        }
        if self.config.view_free_list {
            trace!("free lists at line {}:\n{}", line, self.free_list_dump());
        }

        let top = self.top();
        let prologue = Ptr(self.anchor);
        let ph = self.header(prologue);
        if ph.size() != DSIZE || !ph.is_allocated() {
            audit.bad_sentinels += 1;
            warn!(
                "check (line {}): bad prologue header {:#010x}",
                line,
                ph.raw()
            );
        } else {
            let pf = self.footer(prologue);
            if pf.size() != DSIZE || !pf.is_allocated() {
                audit.bad_sentinels += 1;
                warn!(
                    "check (line {}): bad prologue footer {:#010x}",
                    line,
                    pf.raw()
                );
            }
        }

        // Heap walk, prologue to epilogue. Structural damage (a ragged or
        // overrunning size) ends the walk; everything else is counted and
        // walked past.
        let mut expect_pred = true; // the prologue is allocated
        let mut bp = Ptr(self.anchor + DSIZE);
        loop {
            if bp.0 > top {
                audit.bad_sizes += 1;
                warn!(
                    "check (line {}): heap walk ran past the region end at {:?}",
                    line, bp
                );
                break;
            }
            let h = self.header(bp);
            if h.size() == 0 {
                // The epilogue.
                if !h.is_allocated() {
                    audit.bad_sentinels += 1;
                    warn!(
                        "check (line {}): epilogue {:?} not marked allocated",
                        line, bp
                    );
                }
                if h.is_pred_allocated() != expect_pred {
                    audit.stale_pred_bits += 1;
                    warn!(
                        "check (line {}): epilogue predecessor bit is stale",
                        line
                    );
                }
                if bp.0 != top {
                    audit.bad_sentinels += 1;
                    warn!(
                        "check (line {}): epilogue at {:?} before the region end {}",
                        line, bp, top
                    );
                }
                break;
            }

            stats.blocks += 1;
            if bp.0 % ALIGNMENT != 0 {
                audit.misaligned += 1;
                warn!("check (line {}): block {:?} is misaligned", line, bp);
            }
            if h.size() % ALIGNMENT != 0 || h.size() < MIN_BLOCK {
                audit.bad_sizes += 1;
                warn!(
                    "check (line {}): block {:?} has bad size {}",
                    line,
                    bp,
                    h.size()
                );
                break;
            }
            if h.is_pred_allocated() != expect_pred {
                audit.stale_pred_bits += 1;
                warn!(
                    "check (line {}): block {:?} disagrees with its predecessor's state",
                    line, bp
                );
            }

            let next = match bp.0.checked_add(h.size()) {
                Some(n) if n <= top => Ptr(n),
                _ => {
                    audit.bad_sizes += 1;
                    warn!("check (line {}): block {:?} overruns the region", line, bp);
                    break;
                }
            };

            if !h.is_allocated() {
                stats.free_blocks += 1;
                stats.free_bytes += h.size() as usize;

                let f = self.footer(bp);
                if f.size() != h.size() || f.is_allocated() {
                    audit.footer_mismatches += 1;
                    warn!(
                        "check (line {}): free block {:?} header {:#010x} does not match footer {:#010x}",
                        line,
                        bp,
                        h.raw(),
                        f.raw()
                    );
                }
                if !self.header(next).is_allocated() && self.header(next).size() != 0 {
                    audit.uncoalesced += 1;
                    warn!(
                        "check (line {}): adjacent free blocks at {:?} and {:?}",
                        line, bp, next
                    );
                }
            }

            expect_pred = h.is_allocated();
            bp = next;
        }

        // Free-list traversal: link discipline, bin membership, and the
        // free-count parity with the walk above.
        let mut free_by_bins = 0usize;
        let step_limit = stats.blocks + 1;
        for bin in 0..NUM_BINS {
            let head = self.head(bin);
            let tail = self.tail(bin);
            if head.is_nil() {
                if !tail.is_nil() {
                    audit.broken_links += 1;
                    warn!(
                        "check (line {}): empty bin {} still has tail {:?}",
                        line, bin, tail
                    );
                }
                continue;
            }

            let mut bp = head;
            let mut steps = 0usize;
            while !bp.is_nil() {
                if steps >= step_limit {
                    audit.broken_links += 1;
                    warn!("check (line {}): bin {} does not terminate", line, bin);
                    break;
                }
                steps += 1;

                if !self.in_walkable(bp) {
                    audit.wild_links += 1;
                    warn!(
                        "check (line {}): bin {} link {:?} is outside the heap",
                        line, bin, bp
                    );
                    break;
                }
                free_by_bins += 1;

                let h = self.header(bp);
                if h.is_allocated() {
                    audit.broken_links += 1;
                    warn!(
                        "check (line {}): allocated block {:?} on free list {}",
                        line, bp, bin
                    );
                }

                let prev = self.prev_free(bp);
                let next = self.next_free(bp);
                if bp == head {
                    if !prev.is_nil() {
                        audit.broken_links += 1;
                        warn!(
                            "check (line {}): bin {} head has prev {:?}",
                            line, bin, prev
                        );
                    }
                } else if !prev.is_nil() {
                    if !self.in_walkable(prev) {
                        audit.wild_links += 1;
                        warn!(
                            "check (line {}): bin {} prev link {:?} is outside the heap",
                            line, bin, prev
                        );
                    } else if self.next_free(prev) != bp {
                        audit.broken_links += 1;
                        warn!(
                            "check (line {}): {:?} and its prev {:?} disagree",
                            line, bp, prev
                        );
                    }
                }
                if bp == tail {
                    if !next.is_nil() {
                        audit.broken_links += 1;
                        warn!(
                            "check (line {}): bin {} tail has next {:?}",
                            line, bin, next
                        );
                    }
                } else if next.is_nil() {
                    audit.broken_links += 1;
                    warn!(
                        "check (line {}): bin {} ends before its tail {:?}",
                        line, bin, tail
                    );
                } else if !self.in_walkable(next) {
                    audit.wild_links += 1;
                    warn!(
                        "check (line {}): bin {} next link {:?} is outside the heap",
                        line, bin, next
                    );
                    break;
                } else if self.prev_free(next) != bp {
                    audit.broken_links += 1;
                    warn!(
                        "check (line {}): {:?} and its next {:?} disagree",
                        line, bp, next
                    );
                }

                let want = self.bin_of(h.size());
                if want != bin {
                    audit.misfiled += 1;
                    warn!(
                        "check (line {}): block {:?} of size {} filed in bin {}, belongs in {}",
                        line,
                        bp,
                        h.size(),
                        bin,
                        want
                    );
                }

                bp = next;
            }
        }

        if free_by_bins != stats.free_blocks {
            audit.count_mismatches = 1;
            warn!(
                "check (line {}): {} free blocks by heap walk, {} by bin walk",
                line, stats.free_blocks, free_by_bins
            );
        }

        (audit, stats)
    }

    /// A block-by-block view of the heap, one line per block.
    pub fn heap_dump(&self) -> HeapDump<'_, R> {
        HeapDump { alloc: self }
    }

    /// A bin-by-bin view of the free lists.
    pub fn free_list_dump(&self) -> FreeListDump<'_, R> {
        FreeListDump { alloc: self }
    }

    /// Whether `p` could be a block pointer: inside the walkable span, with
    /// room for a header below and a link pair above.
    pub(crate) fn in_walkable(&self, p: Ptr) -> bool {
        p.0 >= self.anchor + DSIZE && p.0 <= self.top().saturating_sub(DSIZE)
    }
}

pub struct HeapDump<'a, R: Region> {
    alloc: &'a Allocator<R>,
}

impl<'a, R: Region> fmt::Display for HeapDump<'a, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alloc = self.alloc;
        let top = alloc.top();
        let prologue = Ptr(alloc.anchor);
        writeln!(
            f,
            "  prologue  @{:#08x} header{}",
            prologue.0,
            alloc.header(prologue)
        )?;

        let mut bp = Ptr(alloc.anchor + DSIZE);
        while bp.0 <= top {
            let h = alloc.header(bp);
            if h.size() == 0 {
                writeln!(f, "  epilogue  @{:#08x} header{}", bp.0, h)?;
                return Ok(());
            }
            let sane = h.size() % ALIGNMENT == 0
                && h.size() >= MIN_BLOCK
                && bp.0.checked_add(h.size()).map_or(false, |end| end <= top);
            if !sane {
                return writeln!(f, "  ...walk abandoned: bad size at {:#08x}", bp.0);
            }
            if h.is_allocated() {
                writeln!(f, "  allocated @{:#08x} header{}", bp.0, h)?;
            } else {
                writeln!(
                    f,
                    "  free      @{:#08x} header{} footer{} next({:?}) prev({:?})",
                    bp.0,
                    h,
                    alloc.footer(bp),
                    alloc.next_free(bp),
                    alloc.prev_free(bp)
                )?;
            }
            bp = Ptr(bp.0 + h.size());
        }
        writeln!(f, "  ...walk abandoned: ran past the region end")
    }
}

pub struct FreeListDump<'a, R: Region> {
    alloc: &'a Allocator<R>,
}

impl<'a, R: Region> fmt::Display for FreeListDump<'a, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alloc = self.alloc;
        for bin in 0..NUM_BINS {
            let head = alloc.head(bin);
            if head.is_nil() {
                continue;
            }
            let lower = if bin == 0 { 0 } else { alloc.bin_bound(bin - 1) };
            if bin == NUM_BINS - 1 {
                writeln!(f, "  bin {:2} ({}, inf):", bin, lower)?;
            } else {
                writeln!(f, "  bin {:2} ({}, {}]:", bin, lower, alloc.bin_bound(bin))?;
            }

            let mut bp = head;
            let mut steps = 0usize;
            while !bp.is_nil() {
                if !alloc.in_walkable(bp) {
                    writeln!(f, "    {:?} (outside the heap)", bp)?;
                    break;
                }
                writeln!(f, "    {:?} size {}", bp, alloc.header(bp).size())?;
                steps += 1;
                if steps > alloc.top() as usize / MIN_BLOCK as usize {
                    writeln!(f, "    ...list abandoned: does not terminate")?;
                    break;
                }
                bp = alloc.next_free(bp);
            }
        }
        Ok(())
    }
}
