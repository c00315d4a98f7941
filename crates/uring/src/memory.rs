//! Shared ring memory.
//!
//! A ring lives in up to three regions: the SQ control block, the CQ
//! control block and the SQE array. Each region records who owns it. Owned
//! regions are released by their own `Drop`, so a construction that fails
//! halfway releases exactly what it obtained, and an alias (the CQ sharing
//! the SQ mapping under `FEAT_SINGLE_MMAP`) is never a second region.
//!
//! ```text
//! kernel-mapped            SQ ring @ OFF_SQ_RING, CQ ring @ OFF_CQ_RING
//!                          (one mapping if FEAT_SINGLE_MMAP), SQEs @ OFF_SQES
//! NO_MMAP, engine memory   SQEs | rings, split over two regions if needed
//! NO_MMAP, caller buffer   SQEs | rings inside the caller's buffer
//! ```

use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use uring_core::geometry::{Geometry, NoMmapLayout, HUGE_PAGE_SIZE};
use uring_core::sys::{features, IoUringParams, IORING_OFF_CQ_RING, IORING_OFF_SQES, IORING_OFF_SQ_RING};
use uring_core::{kdebug, Errno, UringError};

use crate::kernel::Kernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Mapped from the ring descriptor.
    RingMapped,
    /// Engine-allocated anonymous memory.
    Anonymous,
    /// Engine-allocated huge page.
    HugePage,
    /// Caller-supplied, never released by the engine.
    Borrowed,
}

/// One contiguous region with a single owner.
pub struct Region<K: Kernel> {
    ptr: NonNull<u8>,
    len: usize,
    kind: RegionKind,
    kernel: K,
}

impl<K: Kernel> Region<K> {
    pub fn ring(kernel: &K, fd: RawFd, len: usize, offset: u64) -> Result<Self, Errno> {
        let ptr = kernel.mmap_ring(fd, len, offset)?;
        Ok(Self { ptr, len, kind: RegionKind::RingMapped, kernel: kernel.clone() })
    }

    pub fn anonymous(kernel: &K, len: usize, huge: bool) -> Result<Self, Errno> {
        let ptr = kernel.mmap_anonymous(len, huge)?;
        let kind = if huge { RegionKind::HugePage } else { RegionKind::Anonymous };
        Ok(Self { ptr, len, kind, kernel: kernel.clone() })
    }

    /// # Safety
    /// `ptr` must stay valid for `len` bytes for the region's lifetime.
    pub unsafe fn borrowed(kernel: &K, ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len, kind: RegionKind::Borrowed, kernel: kernel.clone() }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    #[inline]
    pub fn is_owned(&self) -> bool {
        self.kind != RegionKind::Borrowed
    }
}

impl<K: Kernel> Drop for Region<K> {
    fn drop(&mut self) {
        if self.is_owned() {
            unsafe { self.kernel.munmap(self.ptr, self.len) };
        }
    }
}

/// The set of regions backing one ring, plus where each part starts.
pub struct RingMemory<K: Kernel> {
    sq_ring: NonNull<u8>,
    cq_ring: NonNull<u8>,
    sqes: NonNull<u8>,
    regions: Vec<Region<K>>,
}

impl<K: Kernel> RingMemory<K> {
    /// Map a kernel-allocated ring after setup.
    pub fn map(kernel: &K, fd: RawFd, p: &IoUringParams, geo: &Geometry) -> Result<Self, Errno> {
        let mut sq_len = geo.sq_ring_bytes(&p.sq_off);
        let mut cq_len = geo.cq_ring_bytes(&p.cq_off);
        let single = p.has_feature(features::SINGLE_MMAP);
        if single {
            sq_len = sq_len.max(cq_len);
            cq_len = sq_len;
        }

        let mut regions = Vec::with_capacity(3);

        let sq = Region::ring(kernel, fd, sq_len, IORING_OFF_SQ_RING)?;
        let sq_ring = sq.ptr;
        regions.push(sq);

        let cq_ring = if single {
            sq_ring
        } else {
            let cq = Region::ring(kernel, fd, cq_len, IORING_OFF_CQ_RING)?;
            let ptr = cq.ptr;
            regions.push(cq);
            ptr
        };

        let sqes = Region::ring(kernel, fd, geo.sqes_bytes(), IORING_OFF_SQES)?;
        let sqes_ptr = sqes.ptr;
        regions.push(sqes);

        kdebug!(
            "mapped ring fd={} sq_ring={} cq_ring={} sqes={} single_mmap={}",
            fd, sq_len, cq_len, geo.sqes_bytes(), single
        );

        Ok(Self { sq_ring, cq_ring, sqes: sqes_ptr, regions })
    }

    /// Engine-allocated memory for a `NO_MMAP` ring.
    ///
    /// The SQEs go first. The control blocks share that region when the
    /// whole layout fits, otherwise they get a region of their own.
    pub fn allocate(kernel: &K, geo: &Geometry, page_size: usize) -> Result<Self, Errno> {
        let layout = geo.no_mmap_layout(page_size);
        if !layout.fits_huge_page() {
            return Err(Errno::ENOMEM);
        }

        let region_len = |bytes: usize| {
            if NoMmapLayout::wants_huge_page(bytes, page_size) {
                (HUGE_PAGE_SIZE, true)
            } else {
                (page_size, false)
            }
        };

        let mut regions = Vec::with_capacity(2);

        let (len, huge) = region_len(layout.sqes_bytes);
        let first = Region::anonymous(kernel, len, huge)?;
        let sqes = first.ptr;
        regions.push(first);

        let rings = if layout.total <= len {
            // Safety: rings_offset + rings_bytes == total <= len
            unsafe { NonNull::new_unchecked(sqes.as_ptr().add(layout.rings_offset)) }
        } else {
            let (len, huge) = region_len(layout.rings_bytes);
            let second = Region::anonymous(kernel, len, huge)?;
            let ptr = second.ptr;
            regions.push(second);
            ptr
        };

        kdebug!(
            "allocated no-mmap ring: {} region(s), sqes={} rings={}",
            regions.len(), layout.sqes_bytes, layout.rings_bytes
        );

        Ok(Self { sq_ring: rings, cq_ring: rings, sqes, regions })
    }

    /// Wrap a caller buffer for a `NO_MMAP` ring.
    ///
    /// # Safety
    /// `buf` must stay valid for `len` bytes, and untouched by the caller,
    /// for as long as the ring exists.
    pub unsafe fn borrow(
        kernel: &K,
        buf: NonNull<u8>,
        len: usize,
        geo: &Geometry,
        page_size: usize,
    ) -> Result<Self, UringError> {
        if buf.as_ptr() as usize % page_size != 0 {
            return Err(UringError::InvalidConfig("ring buffer is not page-aligned"));
        }
        let layout = geo.no_mmap_layout(page_size);
        if !layout.fits_huge_page() {
            return Err(UringError::Mapping(Errno::ENOMEM));
        }
        if len < layout.total {
            return Err(UringError::InvalidConfig("ring buffer too small"));
        }

        let rings = NonNull::new_unchecked(buf.as_ptr().add(layout.rings_offset));
        let region = Region::borrowed(kernel, buf, len);
        Ok(Self { sq_ring: rings, cq_ring: rings, sqes: buf, regions: vec![region] })
    }

    /// Tell the kernel where a `NO_MMAP` ring lives.
    pub fn publish_user_addrs(&self, p: &mut IoUringParams) {
        p.sq_off.user_addr = self.sqes.as_ptr() as u64;
        p.cq_off.user_addr = self.sq_ring.as_ptr() as u64;
    }

    #[inline]
    pub fn sq_ring(&self) -> *mut u8 {
        self.sq_ring.as_ptr()
    }

    #[inline]
    pub fn cq_ring(&self) -> *mut u8 {
        self.cq_ring.as_ptr()
    }

    #[inline]
    pub fn sqes(&self) -> *mut u8 {
        self.sqes.as_ptr()
    }

    pub fn regions(&self) -> &[Region<K>] {
        &self.regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Event, SimKernel};
    use uring_core::sys::setup_flags;

    #[test]
    fn test_allocate_small_ring_splits_pages() {
        let sim = SimKernel::new();
        let geo = Geometry::new(4, 8, setup_flags::NO_MMAP);
        let mem = RingMemory::allocate(&sim, &geo, 4096).unwrap();

        // one page of SQEs plus one page of rings do not fit one page
        assert_eq!(mem.regions().len(), 2);
        assert!(mem.regions().iter().all(|r| r.kind() == RegionKind::Anonymous));
        assert_eq!(mem.sqes(), mem.regions()[0].as_ptr());
        assert_eq!(mem.sq_ring(), mem.regions()[1].as_ptr());
        assert_eq!(mem.sq_ring(), mem.cq_ring());
        drop(mem);

        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_allocate_spills_sqes_to_huge_page() {
        let sim = SimKernel::new();
        let geo = Geometry::new(256, 512, setup_flags::NO_MMAP);
        let mem = RingMemory::allocate(&sim, &geo, 4096).unwrap();

        assert_eq!(mem.regions()[0].kind(), RegionKind::HugePage);
        assert_eq!(mem.regions()[0].len(), HUGE_PAGE_SIZE);
        // 16 KiB of SQEs and 12 KiB of rings share the huge page
        assert_eq!(mem.regions().len(), 1);
        drop(mem);
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_allocate_rolls_back_first_region() {
        let sim = SimKernel::new();
        sim.fail_mmap_at(2, Errno::ENOMEM);
        let geo = Geometry::new(4, 8, setup_flags::NO_MMAP);

        let err = RingMemory::allocate(&sim, &geo, 4096).err();
        assert_eq!(err, Some(Errno::ENOMEM));
        assert_eq!(sim.live_mappings(), 0);
        assert_eq!(sim.count(|e| matches!(e, Event::Munmap { .. })), 1);
    }

    #[test]
    fn test_borrow_validates_buffer() {
        let sim = SimKernel::new();
        let geo = Geometry::new(4, 8, setup_flags::NO_MMAP);
        let mut buf = crate::sim::PageBuf::new(2 * 4096);

        let misaligned = NonNull::new(unsafe { buf.as_mut_ptr().add(8) }).unwrap();
        let err = unsafe { RingMemory::borrow(&sim, misaligned, 4096, &geo, 4096) }.err();
        assert!(matches!(err, Some(UringError::InvalidConfig(_))));

        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let err = unsafe { RingMemory::borrow(&sim, base, 4096, &geo, 4096) }.err();
        assert_eq!(err, Some(UringError::InvalidConfig("ring buffer too small")));

        let mem = unsafe { RingMemory::borrow(&sim, base, 2 * 4096, &geo, 4096) }.unwrap();
        assert!(!mem.regions()[0].is_owned());
        drop(mem);
        // Borrowed memory is never released by the engine.
        assert_eq!(sim.count(|e| matches!(e, Event::Munmap { .. })), 0);
    }
}
