//! Region providers: the growable memory underneath the allocator.
//!
//! ## Basic Types
//!
//! ### [`Region`](trait.Region.html)
//!
//! `Region` is the seam between the allocator and whatever supplies its
//! memory: a contiguous byte region that only ever grows, bounded to less
//! than 2^32 bytes so that 32-bit offsets can address any block.
//!
//! ### [`ToyRegion`](struct.ToyRegion.html)
//!
//! A fixed array pretending to be a growable region. It is mainly useful for
//! testing, and for small fully self-contained heaps.
//!
//! ### [`MmapRegion`](struct.MmapRegion.html)
//!
//! Reserves its full capacity up front with `mmap` and commits by bumping a
//! watermark. Only available with the `use_libc` feature.

use core::fmt;

/// Largest region any provider may ever report: just under 2^32 bytes,
/// rounded down to the block alignment.
pub const MAX_REGION: usize = (u32::MAX & !0x7) as usize;

/// The provider seam the allocator grows through.
///
/// Implementations promise that `bytes()` stays contiguous across `extend`
/// calls (the region never moves and never shrinks) and that `committed()`
/// never exceeds [`MAX_REGION`].
pub trait Region {
    type Err;

    /// Bytes currently committed.
    fn committed(&self) -> usize;

    /// Grow the committed extent by exactly `bytes` (callers keep this
    /// 8-byte aligned) and return the offset of the first new byte.
    ///
    /// On failure nothing changes; the allocator relies on that to stay
    /// consistent when it propagates exhaustion.
    fn extend(&mut self, bytes: usize) -> Result<usize, Self::Err>;

    /// The committed bytes.
    fn bytes(&self) -> &[u8];

    fn bytes_mut(&mut self) -> &mut [u8];
}

/// The provider refused to grow: its backing capacity is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionFull;

impl fmt::Display for RegionFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region capacity exhausted")
    }
}

/// Capacity of a [`ToyRegion`], in bytes.
pub const TOY_CAPACITY: usize = 256 * 1024;

/// A fixed array on the stack that can pretend to be a growable region.
pub struct ToyRegion {
    committed: usize,
    /// Number of successful `extend` calls, for drivers that bound how often
    /// the heap may grow.
    pub growths: usize,
    heap: [u8; TOY_CAPACITY],
}

impl Default for ToyRegion {
    fn default() -> Self {
        ToyRegion {
            committed: 0,
            growths: 0,
            heap: [0; TOY_CAPACITY],
        }
    }
}

impl Region for ToyRegion {
    type Err = RegionFull;

    fn committed(&self) -> usize {
        self.committed
    }

    fn extend(&mut self, bytes: usize) -> Result<usize, RegionFull> {
        let end = self.committed.checked_add(bytes).ok_or(RegionFull)?;
        if end > self.heap.len() {
            return Err(RegionFull);
        }
        let base = self.committed;
        self.committed = end;
        self.growths += 1;
        Ok(base)
    }

    fn bytes(&self) -> &[u8] {
        &self.heap[..self.committed]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.heap[..self.committed]
    }
}

/// `mmap` refused the reservation.
#[cfg(feature = "use_libc")]
#[derive(Debug)]
pub struct MapError(pub errno::Errno);

#[cfg(feature = "use_libc")]
impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mmap failed: {}", self.0)
    }
}

/// A region reserved up front with `mmap` and committed by bumping a
/// watermark.
///
/// Reserving the whole capacity at construction is what keeps the region
/// contiguous: `extend` never remaps, it only advances the watermark.
#[cfg(feature = "use_libc")]
pub struct MmapRegion {
    base: *mut u8,
    capacity: usize,
    committed: usize,
    page_size: usize,
    /// Pages spanned by the committed extent. Just for tracking.
    pub pages: usize,
    /// Number of successful `extend` calls.
    pub growths: usize,
}

// The mapping is owned by exactly one MmapRegion, so moving it across
// threads is fine; it is the raw base pointer that suppresses the auto impl.
#[cfg(feature = "use_libc")]
unsafe impl Send for MmapRegion {}

#[cfg(feature = "use_libc")]
impl MmapRegion {
    /// Default reservation: 16 MB, comfortably above what the trace drivers
    /// exercise.
    pub const DEFAULT_CAPACITY: usize = 1 << 24;

    /// Reserve `capacity` bytes of address space, rounded up to the page
    /// size and clamped to [`MAX_REGION`]. Nothing is committed yet.
    pub fn new(capacity: usize) -> Result<MmapRegion, MapError> {
        let page_size = sysconf::page::pagesize();
        let rounded = match capacity.max(page_size).checked_add(page_size - 1) {
            Some(v) => v / page_size * page_size,
            None => MAX_REGION,
        };
        let capacity = rounded.min(MAX_REGION);

        let ptr = unsafe {
            libc::mmap(
                // We don't care where the mapping lands.
                core::ptr::null_mut(),
                capacity,
                // Read/write access; the commit watermark is ours to track.
                libc::PROT_WRITE | libc::PROT_READ,
                // Anonymous memory, private to this process.
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MapError(errno::errno()));
        }

        Ok(MmapRegion {
            base: ptr as *mut u8,
            capacity,
            committed: 0,
            page_size,
            pages: 0,
            growths: 0,
        })
    }
}

#[cfg(feature = "use_libc")]
impl Region for MmapRegion {
    type Err = RegionFull;

    fn committed(&self) -> usize {
        self.committed
    }

    fn extend(&mut self, bytes: usize) -> Result<usize, RegionFull> {
        let end = self.committed.checked_add(bytes).ok_or(RegionFull)?;
        if end > self.capacity {
            return Err(RegionFull);
        }
        let base = self.committed;
        self.committed = end;
        self.pages = (self.committed + self.page_size - 1) / self.page_size;
        self.growths += 1;
        Ok(base)
    }

    fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.base as *const u8, self.committed) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.base, self.committed) }
    }
}

#[cfg(feature = "use_libc")]
impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity);
        }
    }
}
