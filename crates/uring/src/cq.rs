//! Completion queue: the consumer side of the shared CQ ring.
//!
//! The kernel appends at `ktail`; we consume from `khead`. Reading the tail
//! with acquire makes the slots before it visible. Nothing here moves the
//! head except [`CompletionQueue::advance`].

use std::sync::atomic::{AtomicU32, Ordering};

use uring_core::geometry::Geometry;
use uring_core::sys::{CqringOffsets, Cqe};

use crate::sq::ring_field;

pub struct CompletionQueue {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    /// Null if the kernel exposes no CQ flags word.
    kflags: *const AtomicU32,
    koverflow: *const AtomicU32,
    cqes: *const Cqe,

    ring_mask: u32,
    cqe_shift: u32,
}

impl CompletionQueue {
    /// # Safety
    /// `ring` must point to a live CQ control block laid out as described by
    /// `off` and `geo`, and outlive the queue.
    pub unsafe fn new(ring: *mut u8, off: &CqringOffsets, geo: &Geometry) -> Self {
        let kflags = if off.flags != 0 {
            ring_field(ring, off.flags)
        } else {
            std::ptr::null()
        };
        Self {
            khead: ring_field(ring, off.head),
            ktail: ring_field(ring, off.tail),
            kflags,
            koverflow: ring_field(ring, off.overflow),
            cqes: ring.add(off.cqes as usize) as *const Cqe,
            ring_mask: (*ring_field(ring, off.ring_mask)).load(Ordering::Relaxed),
            cqe_shift: geo.cqe_shift,
        }
    }

    /// Completions posted and not yet consumed.
    #[inline]
    pub fn ready(&self) -> u32 {
        self.tail().wrapping_sub(self.head())
    }

    /// The completion at the head and how many are available, without
    /// consuming it.
    #[inline]
    pub fn peek(&self) -> Option<(Cqe, u32)> {
        let available = self.ready();
        if available == 0 {
            return None;
        }
        Some((self.at(self.head()), available))
    }

    /// Copy up to `out.len()` completions from the head. Does not advance.
    pub fn copy_batch(&self, out: &mut [Cqe]) -> usize {
        let head = self.head();
        let count = (self.ready() as usize).min(out.len());
        for (i, slot) in out[..count].iter_mut().enumerate() {
            *slot = self.at(head.wrapping_add(i as u32));
        }
        count
    }

    /// Visit every available completion. Does not advance.
    pub fn for_each<F: FnMut(&Cqe)>(&self, mut f: F) -> u32 {
        let mut head = self.head();
        let mut count = 0;
        while head != self.tail() {
            f(&self.at(head));
            head = head.wrapping_add(1);
            count += 1;
        }
        count
    }

    /// Mark `n` completions consumed, handing their slots back to the kernel.
    #[inline]
    pub fn advance(&mut self, n: u32) {
        if n > 0 {
            let head = self.khead().load(Ordering::Relaxed);
            self.khead().store(head.wrapping_add(n), Ordering::Release);
        }
    }

    /// Trailing 16 bytes of the head slot under `CQE32`.
    pub fn big_at_head(&self) -> Option<[u64; 2]> {
        if self.cqe_shift == 0 || self.ready() == 0 {
            return None;
        }
        let index = ((self.head() & self.ring_mask) << self.cqe_shift) as usize;
        unsafe {
            let extra = self.cqes.add(index + 1) as *const [u64; 2];
            Some(extra.read())
        }
    }

    /// Completions the kernel had to drop because the ring was full.
    #[inline]
    pub fn overflow(&self) -> u32 {
        unsafe { &*self.koverflow }.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        if self.kflags.is_null() {
            return 0;
        }
        unsafe { &*self.kflags }.load(Ordering::Relaxed)
    }

    #[inline]
    fn at(&self, index: u32) -> Cqe {
        let slot = ((index & self.ring_mask) << self.cqe_shift) as usize;
        unsafe { self.cqes.add(slot).read() }
    }

    #[inline(always)]
    fn head(&self) -> u32 {
        self.khead().load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn tail(&self) -> u32 {
        unsafe { &*self.ktail }.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn khead(&self) -> &AtomicU32 {
        unsafe { &*self.khead }
    }
}
