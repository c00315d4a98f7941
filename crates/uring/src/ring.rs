//! The ring engine.
//!
//! A [`Ring`] owns one SQ, one CQ and the memory behind them, and decides
//! when the kernel has to be entered. Everything that can be done by
//! reading or writing shared memory is done without a system call:
//!
//! - submitting enters only if there is something to hand over (and, under
//!   SQPOLL, only if the kernel thread sleeps), or completions must be
//!   reaped;
//! - peeking never enters;
//! - waiting enters only when fewer completions are available than asked
//!   for, or the CQ has state only the kernel can flush (overflow, pending
//!   task work, IOPOLL).
//!
//! # Example
//!
//! ```rust,ignore
//! let mut ring = Ring::new(8)?;
//! ring.get_sqe()?.prep_nop();
//! ring.submit()?;
//! let cqe = ring.wait_cqe()?;
//! ring.cqe_seen();
//! ```
//!
//! A ring is `Send` but not `Sync`: hand it between threads, never share it.

use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::time::Duration;

use nix::sys::signal::SigSet;

use uring_core::geometry::{self, Geometry};
use uring_core::sys::{
    enter_flags, features, register_op, setup_flags, sq_flags, Cqe, GeteventsArg,
    IoUringParams, KernelTimespec, RsrcUpdate, Sqe, NSIG_BYTES, UDATA_TIMEOUT,
};
use uring_core::{kdebug, kwarn, CancelPolicy, Errno, QueueFull, Result, UringError};

use crate::config::RingConfig;
use crate::cq::CompletionQueue;
use crate::kernel::{DefaultKernel, Kernel};
use crate::memory::RingMemory;
use crate::sq::SubmissionQueue;

/// Owner of the ring descriptor.
struct RingFd<K: Kernel> {
    fd: RawFd,
    kernel: K,
}

impl<K: Kernel> Drop for RingFd<K> {
    fn drop(&mut self) {
        self.kernel.close(self.fd);
    }
}

/// Arguments of one pass through the shared wait loop.
struct GetData {
    /// Flushed slots not yet handed to the kernel.
    submit: u32,
    wait_nr: u32,
    get_flags: u32,
    /// A deadline travels in `arg`.
    has_ts: bool,
    arg: *const libc::c_void,
    sz: usize,
}

pub struct Ring<K: Kernel = DefaultKernel> {
    sq: SubmissionQueue,
    cq: CompletionQueue,
    params: IoUringParams,
    geometry: Geometry,
    cancel_policy: CancelPolicy,

    /// Descriptor or registered index passed to enter.
    enter_fd: RawFd,
    /// `enter_fd` is a registered index.
    registered: bool,
    /// Register calls may use the registered index too.
    registered_for_register: bool,

    /// Deadline read by the internal timeout slot. Boxed so its address
    /// survives moves of the ring until the kernel consumed the slot.
    timeout_ts: Box<KernelTimespec>,

    // Dropped in declaration order: memory first, descriptor last.
    mem: RingMemory<K>,
    fd: Option<RingFd<K>>,
    kernel: K,
}

// Safety: the shared indices are only touched through &mut self (or read
// through &self), so one thread at a time drives the ring.
unsafe impl<K: Kernel + Send> Send for Ring<K> {}

impl Ring<DefaultKernel> {
    /// Ring with `entries` submission slots and library defaults.
    pub fn new(entries: u32) -> Result<Self> {
        Self::with_config(&RingConfig::new().entries(entries))
    }

    pub fn with_config(config: &RingConfig) -> Result<Self> {
        Ring::with_kernel(DefaultKernel::default(), config)
    }
}

impl<K: Kernel> Ring<K> {
    pub fn with_kernel(kernel: K, config: &RingConfig) -> Result<Self> {
        Self::build(kernel, config, None)
    }

    /// `NO_MMAP` ring living in a caller buffer.
    ///
    /// The buffer must be page-aligned and large enough for the SQEs and
    /// control blocks; both are checked before the kernel is contacted.
    ///
    /// # Safety
    /// `buf` must stay valid for `len` bytes, and must not be accessed by
    /// the caller, until the ring is dropped.
    pub unsafe fn with_buffer(
        kernel: K,
        config: &RingConfig,
        buf: NonNull<u8>,
        len: usize,
    ) -> Result<Self> {
        Self::build(kernel, config, Some((buf, len)))
    }

    fn build(kernel: K, config: &RingConfig, buf: Option<(NonNull<u8>, usize)>) -> Result<Self> {
        config.validate()?;
        let mut p = config.params();
        let no_mmap = p.has_flag(setup_flags::NO_MMAP);
        if buf.is_some() && !no_mmap {
            return Err(UringError::InvalidConfig("caller buffer requires NO_MMAP"));
        }

        // Entry counts are settled locally so oversized rings fail before
        // any kernel contact or allocation.
        let (sq_entries, cq_entries) =
            geometry::sq_cq_entries(config.entries, &p).map_err(UringError::Setup)?;

        let premapped = if no_mmap {
            let geo = Geometry::new(sq_entries, cq_entries, p.flags);
            let page = kernel.page_size();
            let mem = match buf {
                Some((ptr, len)) => unsafe { RingMemory::borrow(&kernel, ptr, len, &geo, page)? },
                None => RingMemory::allocate(&kernel, &geo, page).map_err(|e| {
                    kwarn!("no-mmap ring allocation failed: {}", e);
                    UringError::Mapping(e)
                })?,
            };
            mem.publish_user_addrs(&mut p);
            Some(mem)
        } else {
            None
        };

        let raw = kernel.setup(config.entries, &mut p).map_err(|e| {
            kwarn!("io_uring_setup(entries={}, flags={:#x}) failed: {}", config.entries, p.flags, e);
            UringError::Setup(e)
        })?;

        // REGISTERED_FD_ONLY hands back a registered index, not a descriptor.
        let registered_only = p.has_flag(setup_flags::REGISTERED_FD_ONLY);
        let fd = if registered_only {
            None
        } else {
            Some(RingFd { fd: raw, kernel: kernel.clone() })
        };

        let geo = Geometry::from_params(&p);
        let mem = match premapped {
            Some(mem) => mem,
            None => RingMemory::map(&kernel, raw, &p, &geo).map_err(|e| {
                kwarn!("mapping ring fd={} failed: {}", raw, e);
                UringError::Mapping(e)
            })?,
        };

        let sqpoll = p.has_flag(setup_flags::SQPOLL);
        let mut sq = unsafe { SubmissionQueue::new(mem.sq_ring(), &p.sq_off, mem.sqes(), &geo, sqpoll) };
        sq.init_identity_array();
        let cq = unsafe { CompletionQueue::new(mem.cq_ring(), &p.cq_off, &geo) };

        kdebug!(
            "ring up: fd={} sq={} cq={} flags={:#x} features={:#x} regions={}",
            raw, p.sq_entries, p.cq_entries, p.flags, p.features, mem.regions().len()
        );

        Ok(Self {
            sq,
            cq,
            params: p,
            geometry: geo,
            cancel_policy: config.cancel_policy,
            enter_fd: raw,
            registered: registered_only,
            registered_for_register: registered_only,
            timeout_ts: Box::default(),
            mem,
            fd,
            kernel,
        })
    }

    // ── Submission ──

    /// Next free submission slot. Fill it with one of the `prep_*` encoders.
    ///
    /// Nothing becomes visible to the kernel until [`submit`](Self::submit).
    #[inline]
    pub fn get_sqe(&mut self) -> std::result::Result<&mut Sqe, QueueFull> {
        self.sq.get_sqe()
    }

    /// Publish prepared slots. Returns how many the kernel took (or, when no
    /// entry was needed, how many are in flight).
    pub fn submit(&mut self) -> Result<u32> {
        self.submit_and_wait(0)
    }

    /// Publish prepared slots and block until `wait_nr` completions exist.
    pub fn submit_and_wait(&mut self, wait_nr: u32) -> Result<u32> {
        let submitted = self.sq.flush();
        self.submit_flushed(submitted, wait_nr, false)
    }

    /// Enter only to flush kernel-side completion state.
    pub fn get_events(&mut self) -> Result<()> {
        let flags = enter_flags::GETEVENTS | self.ring_enter_flags();
        self.enter(0, 0, flags, ptr::null(), NSIG_BYTES).map(|_| ())
    }

    fn submit_flushed(&mut self, submitted: u32, wait_nr: u32, getevents: bool) -> Result<u32> {
        let cq_needs_enter = getevents || wait_nr > 0 || self.cq_needs_enter();
        let mut flags = self.ring_enter_flags();
        if self.sq_needs_enter(submitted, &mut flags) || cq_needs_enter {
            if cq_needs_enter {
                flags |= enter_flags::GETEVENTS;
            }
            self.enter(submitted, wait_nr, flags, ptr::null(), NSIG_BYTES)
        } else {
            Ok(submitted)
        }
    }

    // ── Completion ──

    /// The next completion, without entering the kernel and without
    /// consuming it. Repeated calls return the same completion until
    /// [`cqe_seen`](Self::cqe_seen).
    pub fn peek(&mut self) -> Result<Option<Cqe>> {
        self.peek_inner().map(|(cqe, _)| cqe)
    }

    /// Like [`peek`](Self::peek), but enters once if the kernel holds
    /// completions that have not reached the ring yet.
    pub fn peek_cqe(&mut self) -> Result<Option<Cqe>> {
        if let (Some(cqe), _) = self.peek_inner()? {
            return Ok(Some(cqe));
        }
        self.wait_cqe_nr(0)
    }

    /// Block until a completion is available and return it (not consumed).
    pub fn wait_cqe(&mut self) -> Result<Cqe> {
        if let (Some(cqe), _) = self.peek_inner()? {
            return Ok(cqe);
        }
        self.wait_cqe_nr(1)?.ok_or(UringError::Enter(Errno::EAGAIN))
    }

    /// Block until `wait_nr` completions are available and return the first.
    pub fn wait_cqe_nr(&mut self, wait_nr: u32) -> Result<Option<Cqe>> {
        self.get_cqe(0, wait_nr, None)
    }

    /// The shared wait loop. `submit` is the number of already flushed
    /// slots to hand over on the way in.
    pub fn get_cqe(
        &mut self,
        submit: u32,
        wait_nr: u32,
        sigmask: Option<&SigSet>,
    ) -> Result<Option<Cqe>> {
        let mut data = GetData {
            submit,
            wait_nr,
            get_flags: 0,
            has_ts: false,
            arg: sigmask_ptr(sigmask),
            sz: NSIG_BYTES,
        };
        self.get_cqe_loop(&mut data)
    }

    /// Wait for `wait_nr` completions, for at most `timeout`.
    ///
    /// Returns `Err(Timeout)` if the deadline passes with nothing to return.
    pub fn wait_cqes(
        &mut self,
        wait_nr: u32,
        timeout: Option<Duration>,
        sigmask: Option<&SigSet>,
    ) -> Result<Option<Cqe>> {
        let mut to_submit = 0;
        if let Some(ts) = timeout.map(KernelTimespec::from) {
            if self.params.has_feature(features::EXT_ARG) {
                return self.wait_ext_arg(0, wait_nr, &ts, sigmask);
            }
            to_submit = self.submit_timeout(wait_nr, ts)?;
        }
        self.get_cqe(to_submit, wait_nr, sigmask)
    }

    pub fn wait_cqe_timeout(&mut self, timeout: Duration) -> Result<Cqe> {
        if let (Some(cqe), _) = self.peek_inner()? {
            return Ok(cqe);
        }
        self.wait_cqes(1, Some(timeout), None)?.ok_or(UringError::Timeout)
    }

    /// Submit and wait in one entry, bounded by `timeout`.
    pub fn submit_and_wait_timeout(
        &mut self,
        wait_nr: u32,
        timeout: Option<Duration>,
        sigmask: Option<&SigSet>,
    ) -> Result<Option<Cqe>> {
        let to_submit = match timeout.map(KernelTimespec::from) {
            Some(ts) if self.params.has_feature(features::EXT_ARG) => {
                let submit = self.sq.flush();
                return self.wait_ext_arg(submit, wait_nr, &ts, sigmask);
            }
            Some(ts) => self.submit_timeout(wait_nr, ts)?,
            None => self.sq.flush(),
        };
        self.get_cqe(to_submit, wait_nr, sigmask)
    }

    /// Copy up to `out.len()` available completions into `out` without
    /// consuming them. Flushes an overflowed CQ once if nothing is ready.
    pub fn peek_batch_cqe(&mut self, out: &mut [Cqe]) -> Result<usize> {
        let mut overflow_checked = false;
        loop {
            if self.cq.ready() > 0 {
                return Ok(self.cq.copy_batch(out));
            }
            if overflow_checked || !self.cq_needs_flush() {
                return Ok(0);
            }
            self.get_events()?;
            overflow_checked = true;
        }
    }

    /// Visit every available completion in order. Consumes nothing.
    pub fn for_each_cqe<F: FnMut(&Cqe)>(&self, f: F) -> u32 {
        self.cq.for_each(f)
    }

    /// Consume the completion returned by the last peek or wait.
    #[inline]
    pub fn cqe_seen(&mut self) {
        self.cq.advance(1);
    }

    #[inline]
    pub fn cq_advance(&mut self, n: u32) {
        self.cq.advance(n);
    }

    /// Trailing 16 bytes of the next completion on a `CQE32` ring.
    pub fn big_cqe(&self) -> Option<[u64; 2]> {
        self.cq.big_at_head()
    }

    // ── Registered ring descriptor ──

    /// Register the ring descriptor with itself so enter skips the fd
    /// lookup. Returns the registered index.
    pub fn register_ring_fd(&mut self) -> Result<u32> {
        if self.registered {
            return Err(UringError::Register(Errno::EEXIST));
        }
        let mut up = RsrcUpdate { offset: u32::MAX, resv: 0, data: self.raw_fd() as u64 };
        let arg = &mut up as *mut RsrcUpdate as *const libc::c_void;
        if self.register(register_op::REGISTER_RING_FDS, arg, 1)? != 1 {
            return Err(UringError::Register(Errno::EINVAL));
        }
        self.enter_fd = up.offset as RawFd;
        self.registered = true;
        self.registered_for_register = self.params.has_feature(features::REG_REG_RING);
        kdebug!("ring fd={} registered as index {}", self.raw_fd(), up.offset);
        Ok(up.offset)
    }

    pub fn unregister_ring_fd(&mut self) -> Result<()> {
        if !self.registered {
            return Err(UringError::Register(Errno::EINVAL));
        }
        if self.fd.is_none() {
            return Err(UringError::InvalidConfig("REGISTERED_FD_ONLY ring cannot unregister"));
        }
        self.unregister_inner()
    }

    fn unregister_inner(&mut self) -> Result<()> {
        let up = RsrcUpdate { offset: self.enter_fd as u32, ..RsrcUpdate::default() };
        let arg = &up as *const RsrcUpdate as *const libc::c_void;
        if self.register(register_op::UNREGISTER_RING_FDS, arg, 1)? == 1 {
            self.enter_fd = self.raw_fd();
            self.registered = false;
            self.registered_for_register = false;
        }
        Ok(())
    }

    // ── Diagnostics ──

    /// Slots handed out and not yet consumed by the kernel.
    #[inline]
    pub fn sq_ready(&self) -> u32 {
        self.sq.ready()
    }

    #[inline]
    pub fn sq_space_left(&self) -> u32 {
        self.sq.space_left()
    }

    #[inline]
    pub fn cq_ready(&self) -> u32 {
        self.cq.ready()
    }

    /// The kernel holds completions that did not fit the CQ.
    #[inline]
    pub fn cq_has_overflow(&self) -> bool {
        self.sq.flags() & sq_flags::CQ_OVERFLOW != 0
    }

    /// Caller-owned CQ flags word (`EVENTFD_DISABLED`), 0 if the kernel has none.
    pub fn cq_flags(&self) -> u32 {
        self.cq.flags()
    }

    pub fn sq_dropped(&self) -> u32 {
        self.sq.dropped()
    }

    /// Completions lost to a full CQ (kernels without `FEAT_NODROP`).
    pub fn cq_overflow(&self) -> u32 {
        self.cq.overflow()
    }

    /// Negotiated setup parameters.
    pub fn params(&self) -> &IoUringParams {
        &self.params
    }

    pub fn features(&self) -> u32 {
        self.params.features
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn cancel_policy(&self) -> CancelPolicy {
        self.cancel_policy
    }

    /// The ring descriptor, `None` for `REGISTERED_FD_ONLY` rings.
    pub fn ring_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|f| f.fd)
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    // ── Protocol internals ──

    /// The completion at the head, skipping internal timeout slots.
    fn peek_inner(&mut self) -> Result<(Option<Cqe>, u32)> {
        // With EXT_ARG the engine never queues a timeout slot, so the
        // sentinel tag is an ordinary user tag.
        let sentinel = !self.params.has_feature(features::EXT_ARG);
        loop {
            let Some((cqe, available)) = self.cq.peek() else {
                return Ok((None, 0));
            };
            if sentinel && cqe.user_data == UDATA_TIMEOUT {
                self.cq.advance(1);
                match cqe.error() {
                    None => continue,
                    Some(Errno::ETIME) => return Err(UringError::Timeout),
                    Some(e) => return Err(UringError::Completion(e)),
                }
            }
            return Ok((Some(cqe), available));
        }
    }

    fn get_cqe_loop(&mut self, data: &mut GetData) -> Result<Option<Cqe>> {
        // Entries that came back with no completion. One retry after the
        // first, never more.
        let mut empty_enters = 0u32;
        loop {
            let (cqe, available) = self.peek_inner()?;
            let looped = empty_enters > 0;
            let mut need_enter = false;
            let mut flags = 0;

            if cqe.is_none() && data.wait_nr == 0 && data.submit == 0 {
                // One entry already happened; nothing would change.
                if looped || !self.cq_needs_enter() {
                    return Ok(None);
                }
                need_enter = true;
            }
            if data.wait_nr > available || need_enter {
                flags = enter_flags::GETEVENTS | data.get_flags;
                need_enter = true;
            }
            if self.sq_needs_enter(data.submit, &mut flags) {
                need_enter = true;
            }
            if !need_enter {
                return Ok(cqe);
            }
            if looped && data.has_ts {
                return match cqe {
                    Some(cqe) => Ok(Some(cqe)),
                    None => Err(UringError::Timeout),
                };
            }
            if empty_enters >= 2 {
                kdebug!("wait for {} gave up after {} empty enters", data.wait_nr, empty_enters);
                return Err(UringError::Enter(Errno::EAGAIN));
            }

            flags |= self.ring_enter_flags();
            let ret = self.enter(data.submit, data.wait_nr, flags, data.arg, data.sz)?;
            data.submit = data.submit.saturating_sub(ret);
            if cqe.is_some() {
                return Ok(cqe);
            }
            empty_enters += 1;
        }
    }

    fn wait_ext_arg(
        &mut self,
        submit: u32,
        wait_nr: u32,
        ts: &KernelTimespec,
        sigmask: Option<&SigSet>,
    ) -> Result<Option<Cqe>> {
        let arg = GeteventsArg {
            sigmask: sigmask_ptr(sigmask) as u64,
            sigmask_sz: NSIG_BYTES as u32,
            min_wait_usec: 0,
            ts: ts as *const KernelTimespec as u64,
        };
        let mut data = GetData {
            submit,
            wait_nr,
            get_flags: enter_flags::EXT_ARG,
            has_ts: true,
            arg: &arg as *const GeteventsArg as *const libc::c_void,
            sz: size_of::<GeteventsArg>(),
        };
        self.get_cqe_loop(&mut data)
    }

    /// Queue the internal timeout slot for kernels without `EXT_ARG` and
    /// flush. Returns the flushed count.
    fn submit_timeout(&mut self, wait_nr: u32, ts: KernelTimespec) -> Result<u32> {
        if self.sq.space_left() == 0 {
            self.submit()?;
        }
        *self.timeout_ts = ts;
        let sqe = self.sq.get_sqe().map_err(|_| UringError::Enter(Errno::EAGAIN))?;
        sqe.prep_timeout(&self.timeout_ts, wait_nr, 0);
        sqe.set_data(UDATA_TIMEOUT);
        Ok(self.sq.flush())
    }

    fn sq_needs_enter(&self, submit: u32, flags: &mut u32) -> bool {
        if submit == 0 {
            return false;
        }
        if !self.params.has_flag(setup_flags::SQPOLL) {
            return true;
        }
        if self.sq.needs_wakeup() {
            *flags |= enter_flags::SQ_WAKEUP;
            return true;
        }
        false
    }

    #[inline]
    fn cq_needs_flush(&self) -> bool {
        self.sq.flags() & (sq_flags::CQ_OVERFLOW | sq_flags::TASKRUN) != 0
    }

    #[inline]
    fn cq_needs_enter(&self) -> bool {
        self.params.has_flag(setup_flags::IOPOLL) || self.cq_needs_flush()
    }

    #[inline]
    fn ring_enter_flags(&self) -> u32 {
        if self.registered {
            enter_flags::REGISTERED_RING
        } else {
            0
        }
    }

    #[inline]
    fn raw_fd(&self) -> RawFd {
        self.ring_fd().unwrap_or(-1)
    }

    fn enter(
        &self,
        to_submit: u32,
        min_complete: u32,
        flags: u32,
        arg: *const libc::c_void,
        argsz: usize,
    ) -> Result<u32> {
        // Safety: `arg` is null, a sigset from the caller, or a getevents
        // block on the caller's stack, each `argsz` bytes long.
        let ret = unsafe {
            self.kernel.enter(self.enter_fd, to_submit, min_complete, flags, arg, argsz)
        };
        ret.map_err(|e| match e {
            Errno::ETIME => UringError::Timeout,
            e => {
                let err = UringError::Enter(e);
                if !err.is_retryable() {
                    kwarn!("io_uring_enter(fd={}, flags={:#x}) failed: {}", self.enter_fd, flags, e);
                }
                err
            }
        })
    }

    fn register(&self, opcode: u32, arg: *const libc::c_void, nr_args: u32) -> Result<u32> {
        let (fd, opcode) = if self.registered_for_register {
            (self.enter_fd, opcode | register_op::USE_REGISTERED_RING)
        } else {
            (self.raw_fd(), opcode)
        };
        unsafe { self.kernel.register(fd, opcode, arg, nr_args) }.map_err(|e| {
            kwarn!("io_uring_register(opcode={:#x}) failed: {}", opcode, e);
            UringError::Register(e)
        })
    }
}

impl<K: Kernel> Drop for Ring<K> {
    fn drop(&mut self) {
        if self.registered {
            if let Err(e) = self.unregister_inner() {
                kdebug!("unregistering ring index {} on teardown: {}", self.enter_fd, e);
            }
        }
        kdebug!("ring down: fd={:?} regions={}", self.ring_fd(), self.mem.regions().len());
    }
}

#[inline]
fn sigmask_ptr(sigmask: Option<&SigSet>) -> *const libc::c_void {
    sigmask.map_or(ptr::null(), |set| {
        let raw: &libc::sigset_t = set.as_ref();
        raw as *const libc::sigset_t as *const libc::c_void
    })
}
