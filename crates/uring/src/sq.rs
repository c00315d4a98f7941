//! Submission queue: the producer side of the shared SQ ring.
//!
//! # Indices
//!
//! - `khead` is written by the kernel as it consumes slots.
//! - `ktail` is written by us when slots are published.
//! - `sqe_head..sqe_tail` is the local range handed out by [`get_sqe`]
//!   but not yet published by [`flush`].
//!
//! All four are free-running `u32`s; the slot index is `value & ring_mask`.
//! `sqe_tail - khead` never exceeds `ring_entries`.
//!
//! [`get_sqe`]: SubmissionQueue::get_sqe
//! [`flush`]: SubmissionQueue::flush

use std::sync::atomic::{fence, AtomicU32, Ordering};

use uring_core::geometry::Geometry;
use uring_core::sys::{sq_flags, SqringOffsets, Sqe};
use uring_core::QueueFull;

pub struct SubmissionQueue {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    kflags: *const AtomicU32,
    kdropped: *const AtomicU32,
    /// Null under `NO_SQARRAY`.
    array: *mut u32,
    sqes: *mut Sqe,

    ring_mask: u32,
    ring_entries: u32,
    sqe_shift: u32,
    sqpoll: bool,

    sqe_head: u32,
    sqe_tail: u32,
}

#[inline(always)]
pub(crate) unsafe fn ring_field(base: *mut u8, offset: u32) -> *const AtomicU32 {
    base.add(offset as usize) as *const AtomicU32
}

impl SubmissionQueue {
    /// Bind to a mapped SQ control block and SQE array.
    ///
    /// # Safety
    /// `ring` and `sqes` must point to live memory laid out as described by
    /// `off` and `geo`, and outlive the queue.
    pub unsafe fn new(
        ring: *mut u8,
        off: &SqringOffsets,
        sqes: *mut u8,
        geo: &Geometry,
        sqpoll: bool,
    ) -> Self {
        let ring_mask = (*ring_field(ring, off.ring_mask)).load(Ordering::Relaxed);
        let ring_entries = (*ring_field(ring, off.ring_entries)).load(Ordering::Relaxed);
        let array = if geo.sq_array {
            ring.add(off.array as usize) as *mut u32
        } else {
            std::ptr::null_mut()
        };

        Self {
            khead: ring_field(ring, off.head),
            ktail: ring_field(ring, off.tail),
            kflags: ring_field(ring, off.flags),
            kdropped: ring_field(ring, off.dropped),
            array,
            sqes: sqes as *mut Sqe,
            ring_mask,
            ring_entries,
            sqe_shift: geo.sqe_shift,
            sqpoll,
            sqe_head: 0,
            sqe_tail: 0,
        }
    }

    /// Point every index-array entry at the slot of the same number.
    ///
    /// Slots are then consumed in ring order and the array never needs
    /// touching again.
    pub fn init_identity_array(&mut self) {
        if self.array.is_null() {
            return;
        }
        for i in 0..self.ring_entries {
            unsafe { self.array.add(i as usize).write(i) };
        }
    }

    /// Hand out the next free slot.
    ///
    /// On a full queue nothing changes, locally or in shared memory.
    #[inline]
    pub fn get_sqe(&mut self) -> Result<&mut Sqe, QueueFull> {
        let tail = self.sqe_tail;
        if tail.wrapping_sub(self.load_head()) >= self.ring_entries {
            return Err(QueueFull);
        }
        let index = ((tail & self.ring_mask) << self.sqe_shift) as usize;
        self.sqe_tail = tail.wrapping_add(1);
        Ok(unsafe { &mut *self.sqes.add(index) })
    }

    /// Publish every slot handed out since the last flush.
    ///
    /// Returns how many published slots the kernel has not consumed yet.
    pub fn flush(&mut self) -> u32 {
        let tail = self.sqe_tail;
        if self.sqe_head != tail {
            self.sqe_head = tail;
            // Without SQPOLL the kernel only reads the tail inside enter.
            let order = if self.sqpoll { Ordering::Release } else { Ordering::Relaxed };
            self.ktail().store(tail, order);
        }
        tail.wrapping_sub(self.khead().load(Ordering::Relaxed))
    }

    /// Slots handed out and not yet consumed by the kernel.
    #[inline]
    pub fn ready(&self) -> u32 {
        self.sqe_tail.wrapping_sub(self.load_head())
    }

    #[inline]
    pub fn space_left(&self) -> u32 {
        self.ring_entries - self.ready()
    }

    /// Kernel-written SQ flags.
    #[inline]
    pub fn flags(&self) -> u32 {
        unsafe { &*self.kflags }.load(Ordering::Relaxed)
    }

    /// Whether an SQPOLL thread went idle and must be woken.
    ///
    /// The full fence orders our tail store before the flag load, pairing
    /// with the kernel thread's fence between its flag store and tail load.
    #[inline]
    pub fn needs_wakeup(&self) -> bool {
        fence(Ordering::SeqCst);
        self.flags() & sq_flags::NEED_WAKEUP != 0
    }

    /// Slots the kernel dropped for carrying an invalid index.
    #[inline]
    pub fn dropped(&self) -> u32 {
        unsafe { &*self.kdropped }.load(Ordering::Relaxed)
    }

    #[inline]
    fn load_head(&self) -> u32 {
        let order = if self.sqpoll { Ordering::Acquire } else { Ordering::Relaxed };
        self.khead().load(order)
    }

    #[inline(always)]
    fn khead(&self) -> &AtomicU32 {
        unsafe { &*self.khead }
    }

    #[inline(always)]
    fn ktail(&self) -> &AtomicU32 {
        unsafe { &*self.ktail }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::PageBuf;
    use uring_core::sys::setup_flags;

    struct FakeSq {
        ring: PageBuf,
        sqes: PageBuf,
        off: SqringOffsets,
    }

    impl FakeSq {
        fn new(entries: u32) -> Self {
            let off = SqringOffsets {
                head: 0,
                tail: 4,
                ring_mask: 8,
                ring_entries: 12,
                flags: 16,
                dropped: 20,
                array: 64,
                ..Default::default()
            };
            let mut ring = PageBuf::new(4096);
            ring.write_u32(8, entries - 1);
            ring.write_u32(12, entries);
            let sqes = PageBuf::new(entries as usize * 128);
            Self { ring, sqes, off }
        }

        fn queue(&mut self, flags: u32) -> SubmissionQueue {
            let entries = self.ring.read_u32(12);
            let geo = Geometry::new(entries, entries * 2, flags);
            unsafe {
                SubmissionQueue::new(
                    self.ring.as_mut_ptr(),
                    &self.off,
                    self.sqes.as_mut_ptr(),
                    &geo,
                    flags & setup_flags::SQPOLL != 0,
                )
            }
        }

        /// Pretend the kernel consumed up to `head`.
        fn consume_to(&mut self, head: u32) {
            self.ring.write_u32(0, head);
        }

        fn ktail(&self) -> u32 {
            self.ring.read_u32(4)
        }
    }

    #[test]
    fn test_full_at_capacity_plus_one() {
        let mut fake = FakeSq::new(4);
        let mut sq = fake.queue(0);

        for i in 0..4 {
            sq.get_sqe().unwrap().set_data(i);
        }
        assert_eq!(sq.get_sqe().err(), Some(QueueFull));
        // Nothing published by a failed get
        assert_eq!(fake.ktail(), 0);
        assert_eq!(sq.ready(), 4);
        assert_eq!(sq.space_left(), 0);
    }

    #[test]
    fn test_flush_publishes_and_reports_inflight() {
        let mut fake = FakeSq::new(4);
        let mut sq = fake.queue(0);

        sq.get_sqe().unwrap();
        sq.get_sqe().unwrap();
        assert_eq!(sq.flush(), 2);
        assert_eq!(fake.ktail(), 2);

        // Second flush with nothing new is a no-op on the tail.
        assert_eq!(sq.flush(), 2);

        fake.consume_to(2);
        assert_eq!(sq.flush(), 0);
        assert_eq!(sq.space_left(), 4);
    }

    #[test]
    fn test_indices_wrap() {
        let mut fake = FakeSq::new(4);
        let start = u32::MAX - 1;
        fake.ring.write_u32(0, start);
        let mut sq = fake.queue(0);
        sq.sqe_head = start;
        sq.sqe_tail = start;

        for _ in 0..4 {
            sq.get_sqe().unwrap();
        }
        assert!(sq.get_sqe().is_err());
        assert_eq!(sq.flush(), 4);
        assert_eq!(fake.ktail(), start.wrapping_add(4));
    }

    #[test]
    fn test_slots_follow_sqe_shift() {
        let mut fake = FakeSq::new(4);
        let base = fake.sqes.as_mut_ptr() as usize;
        let mut sq = fake.queue(setup_flags::SQE128);

        let a = sq.get_sqe().unwrap() as *mut Sqe as usize;
        let b = sq.get_sqe().unwrap() as *mut Sqe as usize;
        assert_eq!(a, base);
        assert_eq!(b - a, 128);
    }

    #[test]
    fn test_identity_array() {
        let mut fake = FakeSq::new(4);
        let mut sq = fake.queue(0);
        sq.init_identity_array();
        for i in 0..4 {
            assert_eq!(fake.ring.read_u32(64 + 4 * i), i as u32);
        }

        let mut fake = FakeSq::new(4);
        fake.ring.write_u32(64, 0xdead);
        let mut sq = fake.queue(setup_flags::NO_SQARRAY);
        sq.init_identity_array();
        assert_eq!(fake.ring.read_u32(64), 0xdead);
    }

    #[test]
    fn test_needs_wakeup() {
        let mut fake = FakeSq::new(4);
        let sq = fake.queue(setup_flags::SQPOLL);
        assert!(!sq.needs_wakeup());
        fake.ring.write_u32(16, sq_flags::NEED_WAKEUP);
        assert!(sq.needs_wakeup());
    }
}
