//! In-process stand-in for the kernel side of a ring.
//!
//! [`SimKernel`] implements [`Kernel`] over plain heap memory so the
//! engine's protocol can be driven deterministically. Every call is logged
//! as an [`Event`], failures can be injected, and operations complete
//! synchronously inside `enter` unless their fd is blocked, in which case
//! they (and anything linked behind them) stay parked until canceled.
//!
//! The control block is more compact than the kernel's but follows the same
//! rules: the engine only ever finds fields through the offsets returned
//! by `setup`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{HashMap, HashSet, VecDeque};
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uring_core::geometry::{self, align_up, Geometry};
use uring_core::sys::{
    enter_flags, features, op, register_op, setup_flags, sq_flags, sqe_flags, CqringOffsets,
    Cqe, GeteventsArg, IoUringParams, RsrcUpdate, SqringOffsets, Sqe, IORING_OFF_CQ_RING,
    IORING_OFF_SQES, IORING_OFF_SQ_RING,
};
use uring_core::Errno;

use crate::kernel::Kernel;

/// Descriptor handed out by a successful setup.
pub const SIM_FD: RawFd = 42;

const PAGE: usize = 4096;

// Control block layout
const SQ_HEAD: u32 = 0;
const SQ_TAIL: u32 = 4;
const CQ_HEAD: u32 = 8;
const CQ_TAIL: u32 = 12;
const SQ_MASK: u32 = 16;
const CQ_MASK: u32 = 20;
const SQ_ENTRIES: u32 = 24;
const CQ_ENTRIES: u32 = 28;
const SQ_DROPPED: u32 = 32;
const SQ_FLAGS: u32 = 36;
const CQ_FLAGS: u32 = 40;
const CQ_OVERFLOW: u32 = 44;
const CQES: u32 = 64;

/// Zeroed, page-aligned heap buffer.
pub struct PageBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for PageBuf {}

impl PageBuf {
    pub fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len.max(1), PAGE).unwrap();
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("out of memory");
        Self { ptr, layout }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn read_u32(&self, off: usize) -> u32 {
        self.word(off).load(Ordering::SeqCst)
    }

    pub fn write_u32(&mut self, off: usize, value: u32) {
        self.word(off).store(value, Ordering::SeqCst);
    }

    pub fn write_u64(&mut self, off: usize, value: u64) {
        assert!(off + 8 <= self.layout.size());
        unsafe { (self.ptr.as_ptr().add(off) as *mut u64).write_unaligned(value) };
    }

    fn word(&self, off: usize) -> &AtomicU32 {
        assert!(off % 4 == 0 && off + 4 <= self.layout.size());
        unsafe { &*(self.ptr.as_ptr().add(off) as *const AtomicU32) }
    }
}

impl Drop for PageBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Setup { entries: u32, flags: u32 },
    Mmap { len: usize, offset: Option<u64>, huge: bool },
    Munmap { len: usize },
    Close { fd: RawFd },
    Enter { fd: RawFd, to_submit: u32, min_complete: u32, flags: u32 },
    Register { fd: RawFd, opcode: u32 },
}

/// Where the simulated ring lives. Plain addresses, copied freely.
#[derive(Debug, Clone, Copy)]
struct SimRing {
    flags: u32,
    sq_entries: u32,
    cq_entries: u32,
    sqe_shift: u32,
    cqe_shift: u32,
    /// 0 under `NO_SQARRAY`.
    array_off: u32,
    rings: usize,
    rings_len: usize,
    sqes: usize,
    sqes_len: usize,
}

impl SimRing {
    fn word(&self, off: u32) -> &AtomicU32 {
        unsafe { &*((self.rings + off as usize) as *const AtomicU32) }
    }

    fn sqe(&self, slot: u32) -> Sqe {
        let addr = self.sqes + ((slot << self.sqe_shift) as usize) * size_of::<Sqe>();
        unsafe { (addr as *const Sqe).read() }
    }

    fn array_at(&self, index: u32) -> u32 {
        self.word(self.array_off + 4 * index).load(Ordering::Relaxed)
    }

    fn cq_ready(&self) -> u32 {
        let tail = self.word(CQ_TAIL).load(Ordering::Relaxed);
        tail.wrapping_sub(self.word(CQ_HEAD).load(Ordering::Acquire))
    }

    fn write_cqe(&self, cqe: Cqe) {
        let tail = self.word(CQ_TAIL).load(Ordering::Relaxed);
        let slot = ((tail & (self.cq_entries - 1)) << self.cqe_shift) as usize;
        unsafe {
            let dst = (self.rings + CQES as usize + slot * size_of::<Cqe>()) as *mut Cqe;
            dst.write(cqe);
            if self.cqe_shift == 1 {
                let ud = cqe.user_data;
                (dst.add(1) as *mut [u64; 2]).write([ud.wrapping_mul(10), ud.wrapping_mul(100)]);
            }
        }
        self.word(CQ_TAIL).store(tail.wrapping_add(1), Ordering::Release);
    }
}

enum Link {
    /// Followers join the parked chain at this index.
    Parked(usize),
    /// The chain failed; followers complete with `-ECANCELED`.
    Broken,
}

#[derive(Default)]
struct State {
    features: u32,
    events: Vec<Event>,
    /// Mappings handed to the engine and not yet released. A multiset:
    /// the same rings may be mapped at two offsets.
    live: Vec<(usize, usize)>,
    anon: Vec<PageBuf>,
    backing: Vec<PageBuf>,
    mmap_calls: usize,
    fail_mmap_at: Option<(usize, Errno)>,
    fail_setup: Option<Errno>,
    fail_enter: Option<Errno>,
    /// Waits that cannot be satisfied return success with nothing posted.
    wake_empty: bool,

    ring: Option<SimRing>,
    fd_only: bool,
    registered: Option<u32>,

    blocked: HashSet<RawFd>,
    failing: HashMap<RawFd, Errno>,
    parked: Vec<Vec<Sqe>>,
    overflow: VecDeque<Cqe>,
    /// Completions posted during the current enter.
    posted: u32,
}

impl State {
    fn check_fd(&self, fd: RawFd, registered: bool) -> Result<(), Errno> {
        let ok = if registered {
            fd >= 0 && self.registered == Some(fd as u32)
        } else {
            fd == SIM_FD && !self.fd_only && self.ring.is_some()
        };
        if ok {
            Ok(())
        } else {
            Err(Errno::EBADF)
        }
    }

    /// Consume up to `limit` published submissions.
    fn drain(&mut self, limit: u32) -> u32 {
        let Some(ring) = self.ring else { return 0 };
        let head = ring.word(SQ_HEAD).load(Ordering::Relaxed);
        let tail = ring.word(SQ_TAIL).load(Ordering::Acquire);
        let n = tail.wrapping_sub(head).min(limit);
        let mask = ring.sq_entries - 1;

        let mut link = None;
        for i in 0..n {
            let index = head.wrapping_add(i) & mask;
            let slot = if ring.array_off != 0 { ring.array_at(index) } else { index };
            if slot >= ring.sq_entries {
                ring.word(SQ_DROPPED).fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let sqe = ring.sqe(slot);
            let linked = sqe.flags & (sqe_flags::IO_LINK | sqe_flags::IO_HARDLINK) != 0;

            match link.take() {
                Some(Link::Parked(chain)) => {
                    self.parked[chain].push(sqe);
                    if linked {
                        link = Some(Link::Parked(chain));
                    }
                    continue;
                }
                Some(Link::Broken) => {
                    self.complete(&sqe, -libc::ECANCELED);
                    if linked {
                        link = Some(Link::Broken);
                    }
                    continue;
                }
                None => {}
            }

            match self.execute(&sqe) {
                None => {
                    self.parked.push(vec![sqe]);
                    if linked {
                        link = Some(Link::Parked(self.parked.len() - 1));
                    }
                }
                Some(res) => {
                    self.complete(&sqe, res);
                    let hard = sqe.flags & sqe_flags::IO_HARDLINK != 0;
                    if linked && res < 0 && !hard {
                        link = Some(Link::Broken);
                    }
                }
            }
        }

        ring.word(SQ_HEAD).store(head.wrapping_add(n), Ordering::Release);
        n
    }

    /// Run one operation. `None` parks it.
    fn execute(&mut self, sqe: &Sqe) -> Option<i32> {
        match sqe.opcode {
            op::NOP => Some(0),
            op::READ | op::WRITE | op::READ_FIXED | op::WRITE_FIXED | op::SPLICE | op::TEE => {
                self.io(sqe.fd, sqe.len as i32)
            }
            op::READV | op::WRITEV | op::READV_FIXED | op::WRITEV_FIXED => {
                let iovs = unsafe {
                    std::slice::from_raw_parts(sqe.addr as *const libc::iovec, sqe.len as usize)
                };
                let total: usize = iovs.iter().map(|v| v.iov_len).sum();
                self.io(sqe.fd, total as i32)
            }
            op::ASYNC_CANCEL => Some(self.cancel(sqe.addr)),
            op::TIMEOUT => {
                let count = sqe.off as u32;
                Some(if count > 0 && self.posted >= count { 0 } else { -libc::ETIME })
            }
            _ => Some(-libc::EINVAL),
        }
    }

    fn io(&self, fd: RawFd, res: i32) -> Option<i32> {
        if self.blocked.contains(&fd) {
            return None;
        }
        match self.failing.get(&fd) {
            Some(e) => Some(-(*e as i32)),
            None => Some(res),
        }
    }

    fn cancel(&mut self, target: u64) -> i32 {
        match self.parked.iter().position(|chain| chain[0].user_data == target) {
            Some(i) => {
                for sqe in self.parked.remove(i) {
                    self.complete(&sqe, -libc::ECANCELED);
                }
                0
            }
            None => -libc::ENOENT,
        }
    }

    fn complete(&mut self, sqe: &Sqe, res: i32) {
        if res >= 0 && sqe.flags & sqe_flags::CQE_SKIP_SUCCESS != 0 {
            return;
        }
        self.post_cqe(Cqe { user_data: sqe.user_data, res, flags: 0 });
    }

    fn post_cqe(&mut self, cqe: Cqe) {
        let Some(ring) = self.ring else { return };
        self.posted += 1;
        if self.overflow.is_empty() && ring.cq_ready() < ring.cq_entries {
            ring.write_cqe(cqe);
        } else if self.features & features::NODROP != 0 {
            self.overflow.push_back(cqe);
            ring.word(SQ_FLAGS).fetch_or(sq_flags::CQ_OVERFLOW, Ordering::Release);
        } else {
            ring.word(CQ_OVERFLOW).fetch_add(1, Ordering::Release);
        }
    }

    fn flush_overflow(&mut self) {
        let Some(ring) = self.ring else { return };
        while ring.cq_ready() < ring.cq_entries {
            match self.overflow.pop_front() {
                Some(cqe) => ring.write_cqe(cqe),
                None => break,
            }
        }
        if self.overflow.is_empty() {
            ring.word(SQ_FLAGS).fetch_and(!sq_flags::CQ_OVERFLOW, Ordering::Release);
        }
    }

    fn next_mmap_fails(&mut self) -> Option<Errno> {
        self.mmap_calls += 1;
        match self.fail_mmap_at {
            Some((n, e)) if n == self.mmap_calls => Some(e),
            _ => None,
        }
    }
}

/// Shared handle to one simulated kernel.
#[derive(Clone)]
pub struct SimKernel(Arc<Mutex<State>>);

impl SimKernel {
    /// Modern kernel: single mmap, no-drop CQ, extended enter arguments.
    pub fn new() -> Self {
        Self::with_features(features::SINGLE_MMAP | features::NODROP | features::EXT_ARG)
    }

    pub fn with_features(features: u32) -> Self {
        Self(Arc::new(Mutex::new(State { features, ..State::default() })))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ring(&self) -> SimRing {
        self.state().ring.expect("no ring set up")
    }

    // Fault injection

    /// Fail the `nth` (1-based) mmap call.
    pub fn fail_mmap_at(&self, nth: usize, errno: Errno) {
        self.state().fail_mmap_at = Some((nth, errno));
    }

    pub fn fail_setup(&self, errno: Errno) {
        self.state().fail_setup = Some(errno);
    }

    pub fn fail_next_enter(&self, errno: Errno) {
        self.state().fail_enter = Some(errno);
    }

    pub fn wake_empty(&self, on: bool) {
        self.state().wake_empty = on;
    }

    /// Operations on `fd` park until canceled.
    pub fn block_fd(&self, fd: RawFd) {
        self.state().blocked.insert(fd);
    }

    pub fn unblock_fd(&self, fd: RawFd) {
        self.state().blocked.remove(&fd);
    }

    /// Operations on `fd` complete with `-errno`.
    pub fn fail_fd(&self, fd: RawFd, errno: Errno) {
        self.state().failing.insert(fd, errno);
    }

    // Kernel-side activity

    /// SQPOLL thread going idle (or waking up).
    pub fn set_need_wakeup(&self, on: bool) {
        let ring = self.ring();
        let flags = ring.word(SQ_FLAGS);
        if on {
            flags.fetch_or(sq_flags::NEED_WAKEUP, Ordering::SeqCst);
        } else {
            flags.fetch_and(!sq_flags::NEED_WAKEUP, Ordering::SeqCst);
        }
    }

    /// Task work pending that only an enter will run.
    pub fn raise_taskrun(&self) {
        self.ring().word(SQ_FLAGS).fetch_or(sq_flags::TASKRUN, Ordering::SeqCst);
    }

    /// One pass of the SQPOLL thread.
    pub fn poll_sq(&self) -> u32 {
        let mut st = self.state();
        st.posted = 0;
        st.drain(u32::MAX)
    }

    /// Post a completion out of band.
    pub fn post(&self, user_data: u64, res: i32) {
        self.state().post_cqe(Cqe { user_data, res, flags: 0 });
    }

    // Inspection

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.state().events.iter().filter(|e| pred(e)).count()
    }

    pub fn enters(&self) -> Vec<Event> {
        self.state()
            .events
            .iter()
            .filter(|e| matches!(e, Event::Enter { .. }))
            .cloned()
            .collect()
    }

    pub fn live_mappings(&self) -> usize {
        self.state().live.len()
    }

    pub fn registered(&self) -> Option<u32> {
        self.state().registered
    }

    pub fn sq_flags(&self) -> u32 {
        self.ring().word(SQ_FLAGS).load(Ordering::SeqCst)
    }

    pub fn parked(&self) -> usize {
        self.state().parked.len()
    }
}

impl Kernel for SimKernel {
    fn setup(&self, entries: u32, p: &mut IoUringParams) -> Result<RawFd, Errno> {
        let mut st = self.state();
        st.events.push(Event::Setup { entries, flags: p.flags });
        if let Some(e) = st.fail_setup.take() {
            return Err(e);
        }

        let (sq, cq) = geometry::sq_cq_entries(entries, p)?;
        let no_mmap = p.has_flag(setup_flags::NO_MMAP);
        let fd_only = p.has_flag(setup_flags::REGISTERED_FD_ONLY);
        if fd_only && !no_mmap {
            return Err(Errno::EINVAL);
        }

        let geo = Geometry::new(sq, cq, p.flags);
        let cqes_end = CQES as usize + geo.cqes_bytes();
        let (array_off, ring_end) = if geo.sq_array {
            let array = align_up(cqes_end, 64);
            (array, array + 4 * sq as usize)
        } else {
            (0, cqes_end)
        };
        let rings_len = align_up(ring_end, PAGE);
        let sqes_len = align_up(geo.sqes_bytes(), PAGE);

        let (rings, sqes) = if no_mmap {
            let rings = p.cq_off.user_addr as usize;
            let sqes = p.sq_off.user_addr as usize;
            if rings == 0 || sqes == 0 {
                return Err(Errno::EFAULT);
            }
            (rings, sqes)
        } else {
            let rings = PageBuf::new(rings_len);
            let sqes = PageBuf::new(sqes_len);
            let addrs = (rings.addr(), sqes.addr());
            st.backing.push(rings);
            st.backing.push(sqes);
            addrs
        };

        let ring = SimRing {
            flags: p.flags,
            sq_entries: sq,
            cq_entries: cq,
            sqe_shift: geo.sqe_shift,
            cqe_shift: geo.cqe_shift,
            array_off: array_off as u32,
            rings,
            rings_len,
            sqes,
            sqes_len,
        };
        ring.word(SQ_MASK).store(sq - 1, Ordering::Relaxed);
        ring.word(SQ_ENTRIES).store(sq, Ordering::Relaxed);
        ring.word(CQ_MASK).store(cq - 1, Ordering::Relaxed);
        ring.word(CQ_ENTRIES).store(cq, Ordering::Relaxed);

        p.sq_entries = sq;
        p.cq_entries = cq;
        p.features = st.features;
        p.sq_off = SqringOffsets {
            head: SQ_HEAD,
            tail: SQ_TAIL,
            ring_mask: SQ_MASK,
            ring_entries: SQ_ENTRIES,
            flags: SQ_FLAGS,
            dropped: SQ_DROPPED,
            array: array_off as u32,
            ..p.sq_off
        };
        p.cq_off = CqringOffsets {
            head: CQ_HEAD,
            tail: CQ_TAIL,
            ring_mask: CQ_MASK,
            ring_entries: CQ_ENTRIES,
            overflow: CQ_OVERFLOW,
            cqes: CQES,
            flags: CQ_FLAGS,
            ..p.cq_off
        };

        st.ring = Some(ring);
        st.fd_only = fd_only;
        if fd_only {
            st.registered = Some(0);
            Ok(0)
        } else {
            Ok(SIM_FD)
        }
    }

    unsafe fn enter(
        &self,
        fd: RawFd,
        to_submit: u32,
        min_complete: u32,
        flags: u32,
        arg: *const libc::c_void,
        argsz: usize,
    ) -> Result<u32, Errno> {
        let mut st = self.state();
        st.events.push(Event::Enter { fd, to_submit, min_complete, flags });
        st.check_fd(fd, flags & enter_flags::REGISTERED_RING != 0)?;
        if let Some(e) = st.fail_enter.take() {
            return Err(e);
        }
        let ring = st.ring.ok_or(Errno::EBADF)?;

        let getevents = flags & enter_flags::GETEVENTS != 0;
        let mut has_ts = false;
        if getevents && flags & enter_flags::EXT_ARG != 0 {
            if arg.is_null() || argsz != size_of::<GeteventsArg>() {
                return Err(Errno::EINVAL);
            }
            has_ts = (arg as *const GeteventsArg).read().ts != 0;
        }

        st.posted = 0;
        let consumed = if ring.flags & setup_flags::SQPOLL != 0 {
            if flags & enter_flags::SQ_WAKEUP != 0 {
                ring.word(SQ_FLAGS).fetch_and(!sq_flags::NEED_WAKEUP, Ordering::SeqCst);
                st.drain(u32::MAX);
            }
            to_submit
        } else {
            st.drain(to_submit)
        };

        if getevents {
            st.flush_overflow();
            ring.word(SQ_FLAGS).fetch_and(!sq_flags::TASKRUN, Ordering::SeqCst);
            if min_complete > ring.cq_ready() {
                if st.wake_empty {
                    return Ok(consumed);
                }
                // Nothing else will ever complete; a real wait would block.
                return Err(if has_ts { Errno::ETIME } else { Errno::EINTR });
            }
        }
        Ok(consumed)
    }

    unsafe fn register(
        &self,
        fd: RawFd,
        opcode: u32,
        arg: *const libc::c_void,
        nr_args: u32,
    ) -> Result<u32, Errno> {
        let mut st = self.state();
        st.events.push(Event::Register { fd, opcode });
        st.check_fd(fd, opcode & register_op::USE_REGISTERED_RING != 0)?;
        if nr_args != 1 || arg.is_null() {
            return Err(Errno::EINVAL);
        }

        match opcode & !register_op::USE_REGISTERED_RING {
            register_op::REGISTER_RING_FDS => {
                let up = &mut *(arg as *mut RsrcUpdate);
                if st.registered.is_some() {
                    return Err(Errno::EBUSY);
                }
                if up.data as RawFd != SIM_FD {
                    return Err(Errno::EBADF);
                }
                if up.offset == u32::MAX {
                    up.offset = 0;
                }
                st.registered = Some(up.offset);
                Ok(1)
            }
            register_op::UNREGISTER_RING_FDS => {
                let up = &*(arg as *const RsrcUpdate);
                if st.registered != Some(up.offset) {
                    return Err(Errno::EINVAL);
                }
                st.registered = None;
                Ok(1)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn mmap_ring(&self, fd: RawFd, len: usize, offset: u64) -> Result<NonNull<u8>, Errno> {
        let mut st = self.state();
        st.events.push(Event::Mmap { len, offset: Some(offset), huge: false });
        if let Some(e) = st.next_mmap_fails() {
            return Err(e);
        }
        st.check_fd(fd, false)?;
        let ring = st.ring.ok_or(Errno::EINVAL)?;

        let (addr, max) = match offset {
            IORING_OFF_SQ_RING | IORING_OFF_CQ_RING => (ring.rings, ring.rings_len),
            IORING_OFF_SQES => (ring.sqes, ring.sqes_len),
            _ => return Err(Errno::EINVAL),
        };
        if len > max {
            return Err(Errno::EINVAL);
        }
        st.live.push((addr, len));
        NonNull::new(addr as *mut u8).ok_or(Errno::EINVAL)
    }

    fn mmap_anonymous(&self, len: usize, huge: bool) -> Result<NonNull<u8>, Errno> {
        let mut st = self.state();
        st.events.push(Event::Mmap { len, offset: None, huge });
        if let Some(e) = st.next_mmap_fails() {
            return Err(e);
        }
        let buf = PageBuf::new(len);
        let addr = buf.addr();
        st.anon.push(buf);
        st.live.push((addr, len));
        NonNull::new(addr as *mut u8).ok_or(Errno::ENOMEM)
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) {
        let addr = ptr.as_ptr() as usize;
        let mut st = self.state();
        st.events.push(Event::Munmap { len });
        match st.live.iter().position(|&m| m == (addr, len)) {
            Some(i) => {
                st.live.swap_remove(i);
            }
            None => {
                drop(st);
                panic!("munmap of unknown mapping {:#x}+{}", addr, len);
            }
        }
        if let Some(i) = st.anon.iter().position(|b| b.addr() == addr) {
            st.anon.swap_remove(i);
        }
    }

    fn close(&self, fd: RawFd) {
        self.state().events.push(Event::Close { fd });
    }

    fn page_size(&self) -> usize {
        PAGE
    }
}
