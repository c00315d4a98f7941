//! Ring geometry.
//!
//! [`Geometry`] is derived once from the negotiated setup parameters and is
//! the only place slot sizes and index shifts are computed. The memory
//! manager, the submission queue and the completion queue all read their
//! shifts from it.

use nix::errno::Errno;

use crate::sys::{setup_flags, CqringOffsets, IoUringParams, SqringOffsets};
use crate::sys::{Cqe, Sqe, KERN_MAX_CQ_ENTRIES, KERN_MAX_ENTRIES};

/// Huge page size used for the engine-allocated no-mmap layout.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Bytes reserved in front of the CQEs for the kernel's ring header.
pub const KRING_HEADER_SIZE: usize = 64;

const CACHE_LINE: usize = 64;

/// Round up to the next power of two. `0` stays `0`.
#[inline]
pub fn roundup_pow2(n: u32) -> u32 {
    if n == 0 {
        0
    } else {
        n.next_power_of_two()
    }
}

#[inline]
pub fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Validate a requested entry count and derive `(sq_entries, cq_entries)`
/// the way the kernel will, without contacting it.
///
/// Oversized requests fail with `EINVAL` unless `CLAMP` is set. With
/// `CQSIZE` the CQ size comes from `params.cq_entries` and must not be
/// smaller than the SQ size; otherwise it is twice the SQ size.
pub fn sq_cq_entries(entries: u32, params: &IoUringParams) -> Result<(u32, u32), Errno> {
    if entries == 0 {
        return Err(Errno::EINVAL);
    }
    let clamp = params.has_flag(setup_flags::CLAMP);

    let mut sq = entries;
    if sq > KERN_MAX_ENTRIES {
        if !clamp {
            return Err(Errno::EINVAL);
        }
        sq = KERN_MAX_ENTRIES;
    }
    let sq = roundup_pow2(sq);

    let cq = if params.has_flag(setup_flags::CQSIZE) {
        let mut cq = params.cq_entries;
        if cq == 0 {
            return Err(Errno::EINVAL);
        }
        if cq > KERN_MAX_CQ_ENTRIES {
            if !clamp {
                return Err(Errno::EINVAL);
            }
            cq = KERN_MAX_CQ_ENTRIES;
        }
        let cq = roundup_pow2(cq);
        if cq < sq {
            return Err(Errno::EINVAL);
        }
        cq
    } else {
        2 * sq
    };

    Ok((sq, cq))
}

/// Negotiated ring shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sq_entries: u32,
    pub cq_entries: u32,
    /// 1 under `SQE128`, else 0.
    pub sqe_shift: u32,
    /// 1 under `CQE32`, else 0.
    pub cqe_shift: u32,
    /// Whether the SQ carries an index array (`NO_SQARRAY` not set).
    pub sq_array: bool,
}

impl Geometry {
    pub fn new(sq_entries: u32, cq_entries: u32, flags: u32) -> Self {
        Self {
            sq_entries,
            cq_entries,
            sqe_shift: Self::sqe_shift_from_flags(flags),
            cqe_shift: Self::cqe_shift_from_flags(flags),
            sq_array: flags & setup_flags::NO_SQARRAY == 0,
        }
    }

    /// Geometry of a ring after setup returned.
    pub fn from_params(p: &IoUringParams) -> Self {
        Self::new(p.sq_entries, p.cq_entries, p.flags)
    }

    #[inline]
    pub fn sqe_shift_from_flags(flags: u32) -> u32 {
        (flags & setup_flags::SQE128 != 0) as u32
    }

    #[inline]
    pub fn cqe_shift_from_flags(flags: u32) -> u32 {
        (flags & setup_flags::CQE32 != 0) as u32
    }

    /// Bytes per submission slot.
    #[inline]
    pub fn sqe_size(&self) -> usize {
        std::mem::size_of::<Sqe>() << self.sqe_shift
    }

    /// Bytes per completion slot.
    #[inline]
    pub fn cqe_size(&self) -> usize {
        std::mem::size_of::<Cqe>() << self.cqe_shift
    }

    /// Bytes of the SQE array.
    #[inline]
    pub fn sqes_bytes(&self) -> usize {
        self.sq_entries as usize * self.sqe_size()
    }

    /// Bytes of the CQE array.
    #[inline]
    pub fn cqes_bytes(&self) -> usize {
        self.cq_entries as usize * self.cqe_size()
    }

    /// Size of the SQ control block mapping.
    pub fn sq_ring_bytes(&self, off: &SqringOffsets) -> usize {
        off.array as usize + self.sq_entries as usize * std::mem::size_of::<u32>()
    }

    /// Size of the CQ control block mapping.
    pub fn cq_ring_bytes(&self, off: &CqringOffsets) -> usize {
        off.cqes as usize + self.cqes_bytes()
    }

    /// Layout for `NO_MMAP` rings.
    pub fn no_mmap_layout(&self, page_size: usize) -> NoMmapLayout {
        let sqes_bytes = align_up(self.sqes_bytes(), page_size);

        let mut rings_bytes = KRING_HEADER_SIZE + self.cqes_bytes();
        if self.sq_array {
            rings_bytes = align_up(rings_bytes, CACHE_LINE)
                + self.sq_entries as usize * std::mem::size_of::<u32>();
        }
        let rings_bytes = align_up(rings_bytes, page_size);

        NoMmapLayout {
            sqes_bytes,
            rings_offset: sqes_bytes,
            rings_bytes,
            total: sqes_bytes + rings_bytes,
        }
    }
}

/// Placement of SQEs and control blocks for a no-mmap ring.
///
/// A caller-supplied buffer holds both parts back to back:
///
/// ```text
/// [0 .. rings_offset)                 SQE array
/// [rings_offset .. total)             kernel ring header, CQEs, SQ index array
/// ```
///
/// Engine-allocated memory uses one region per part, each on a huge page
/// only when it would not fit a regular page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoMmapLayout {
    /// Page-aligned bytes of the SQE part.
    pub sqes_bytes: usize,
    pub rings_offset: usize,
    /// Page-aligned bytes of the control block part.
    pub rings_bytes: usize,
    pub total: usize,
}

impl NoMmapLayout {
    /// Whether a part of `bytes` needs a huge page.
    #[inline]
    pub fn wants_huge_page(bytes: usize, page_size: usize) -> bool {
        bytes > page_size
    }

    /// Whether engine-allocated memory can hold this layout at all.
    #[inline]
    pub fn fits_huge_page(&self) -> bool {
        self.sqes_bytes <= HUGE_PAGE_SIZE && self.rings_bytes <= HUGE_PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(flags: u32, cq_entries: u32) -> IoUringParams {
        IoUringParams { flags, cq_entries, ..Default::default() }
    }

    #[test]
    fn test_roundup_pow2() {
        assert_eq!(roundup_pow2(0), 0);
        assert_eq!(roundup_pow2(1), 1);
        assert_eq!(roundup_pow2(3), 4);
        assert_eq!(roundup_pow2(4), 4);
        assert_eq!(roundup_pow2(100), 128);
    }

    #[test]
    fn test_entries_default_cq_is_double() {
        assert_eq!(sq_cq_entries(4, &params(0, 0)), Ok((4, 8)));
        assert_eq!(sq_cq_entries(5, &params(0, 0)), Ok((8, 16)));
    }

    #[test]
    fn test_entries_rejects_zero_and_oversize() {
        assert_eq!(sq_cq_entries(0, &params(0, 0)), Err(Errno::EINVAL));
        assert_eq!(
            sq_cq_entries(KERN_MAX_ENTRIES + 1, &params(0, 0)),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn test_entries_clamp() {
        let p = params(setup_flags::CLAMP, 0);
        assert_eq!(
            sq_cq_entries(KERN_MAX_ENTRIES * 4, &p),
            Ok((KERN_MAX_ENTRIES, 2 * KERN_MAX_ENTRIES))
        );
    }

    #[test]
    fn test_entries_cqsize() {
        let p = params(setup_flags::CQSIZE, 100);
        assert_eq!(sq_cq_entries(16, &p), Ok((16, 128)));

        // CQ smaller than SQ after rounding
        let p = params(setup_flags::CQSIZE, 9);
        assert_eq!(sq_cq_entries(32, &p), Err(Errno::EINVAL));

        // CQSIZE without a size
        let p = params(setup_flags::CQSIZE, 0);
        assert_eq!(sq_cq_entries(8, &p), Err(Errno::EINVAL));

        let p = params(setup_flags::CQSIZE | setup_flags::CLAMP, u32::MAX);
        assert_eq!(sq_cq_entries(8, &p), Ok((8, KERN_MAX_CQ_ENTRIES)));
    }

    #[test]
    fn test_shifts_are_independent() {
        let g = Geometry::new(8, 16, setup_flags::CQE32);
        assert_eq!(g.sqe_size(), 64);
        assert_eq!(g.cqe_size(), 32);
        // CQ bytes follow the CQE shift, not the SQE one.
        assert_eq!(g.cqes_bytes(), 16 * 32);

        let g = Geometry::new(8, 16, setup_flags::SQE128);
        assert_eq!(g.sqe_size(), 128);
        assert_eq!(g.cqe_size(), 16);
        assert_eq!(g.sqes_bytes(), 8 * 128);
    }

    #[test]
    fn test_ring_bytes_from_offsets() {
        let g = Geometry::new(4, 8, 0);
        let sq_off = SqringOffsets { array: 320, ..Default::default() };
        let cq_off = CqringOffsets { cqes: 64, ..Default::default() };
        assert_eq!(g.sq_ring_bytes(&sq_off), 320 + 16);
        assert_eq!(g.cq_ring_bytes(&cq_off), 64 + 8 * 16);
    }

    #[test]
    fn test_no_mmap_layout() {
        let g = Geometry::new(4, 8, 0);
        let layout = g.no_mmap_layout(4096);
        assert_eq!(layout.sqes_bytes, 4096);
        assert_eq!(layout.rings_offset, 4096);
        assert_eq!(layout.rings_bytes, 4096);
        assert_eq!(layout.total, 8192);
        assert!(!NoMmapLayout::wants_huge_page(layout.sqes_bytes, 4096));
        assert!(layout.fits_huge_page());
    }

    #[test]
    fn test_no_mmap_layout_spills_to_huge_page() {
        // 256 SQEs * 64 bytes = 16 KiB: more than one regular page
        let g = Geometry::new(256, 512, 0);
        let layout = g.no_mmap_layout(4096);
        assert_eq!(layout.sqes_bytes, 16384);
        assert!(NoMmapLayout::wants_huge_page(layout.sqes_bytes, 4096));

        let g = Geometry::new(KERN_MAX_ENTRIES, KERN_MAX_CQ_ENTRIES, setup_flags::CQE32);
        assert!(!g.no_mmap_layout(4096).fits_huge_page());
    }
}
