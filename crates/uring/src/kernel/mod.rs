//! The kernel side of a ring.
//!
//! [`Kernel`] is the seam between the engine and the three io_uring system
//! calls plus the memory calls around them. The engine never issues a raw
//! syscall itself; it asks its `Kernel`. Production rings use
//! [`DefaultKernel`], tests substitute a simulated one.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use uring_core::sys::IoUringParams;
use uring_core::Errno;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::LinuxKernel;
        pub type DefaultKernel = LinuxKernel;
    } else {
        mod unsupported;
        pub use unsupported::UnsupportedKernel;
        pub type DefaultKernel = UnsupportedKernel;
    }
}

/// System-call surface used by a ring.
///
/// Every method reports failure as a positive errno. Implementations are
/// cheap handles; the engine clones one into each region it owns so the
/// region can release itself.
pub trait Kernel: Clone {
    /// `io_uring_setup(2)`. Fills the output half of `params` and returns
    /// the ring descriptor (or the registered index under
    /// `REGISTERED_FD_ONLY`).
    fn setup(&self, entries: u32, params: &mut IoUringParams) -> Result<RawFd, Errno>;

    /// `io_uring_enter(2)`. Returns how many submissions were consumed.
    ///
    /// # Safety
    /// `arg` must be null or point to `argsz` readable bytes of the kind
    /// selected by `flags` (a sigset, or a getevents argument block under
    /// `EXT_ARG`). Submission slots handed over by `to_submit` must
    /// reference memory that stays valid until their completions arrive.
    unsafe fn enter(
        &self,
        fd: RawFd,
        to_submit: u32,
        min_complete: u32,
        flags: u32,
        arg: *const libc::c_void,
        argsz: usize,
    ) -> Result<u32, Errno>;

    /// `io_uring_register(2)`.
    ///
    /// # Safety
    /// `arg` must point to `nr_args` records of the type `opcode` expects.
    unsafe fn register(
        &self,
        fd: RawFd,
        opcode: u32,
        arg: *const libc::c_void,
        nr_args: u32,
    ) -> Result<u32, Errno>;

    /// Map `len` bytes of the ring at one of the `IORING_OFF_*` offsets.
    fn mmap_ring(&self, fd: RawFd, len: usize, offset: u64) -> Result<NonNull<u8>, Errno>;

    /// Shared anonymous memory for `NO_MMAP` rings. `huge` asks for a
    /// huge-page backed mapping.
    fn mmap_anonymous(&self, len: usize, huge: bool) -> Result<NonNull<u8>, Errno>;

    /// # Safety
    /// `ptr`/`len` must describe a live mapping returned by this kernel,
    /// not used afterwards.
    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize);

    fn close(&self, fd: RawFd);

    fn page_size(&self) -> usize;
}
