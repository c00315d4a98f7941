//! Raw io_uring ABI.
//!
//! Mirrors `<linux/io_uring.h>` - the shared contract between kernel and
//! userspace. Every record here is `repr(C)` and its size is asserted at
//! compile time; field offsets inside the shared rings are never hard-coded,
//! they come from [`IoUringParams`] after setup.

// ── Kernel limits ──

/// Largest SQ size the kernel accepts.
pub const KERN_MAX_ENTRIES: u32 = 32768;
/// Largest CQ size the kernel accepts.
pub const KERN_MAX_CQ_ENTRIES: u32 = 2 * KERN_MAX_ENTRIES;

/// `user_data` reserved for the engine's internal timeout slot.
pub const UDATA_TIMEOUT: u64 = u64::MAX;

/// Size of the kernel sigset passed through enter (`_NSIG / 8`).
pub const NSIG_BYTES: usize = 8;

// ── mmap offsets ──

pub const IORING_OFF_SQ_RING: u64 = 0;
pub const IORING_OFF_CQ_RING: u64 = 0x0800_0000;
pub const IORING_OFF_SQES: u64 = 0x1000_0000;

/// `io_uring_setup(2)` flags.
pub mod setup_flags {
    pub const IOPOLL: u32 = 1 << 0;
    pub const SQPOLL: u32 = 1 << 1;
    pub const SQ_AFF: u32 = 1 << 2;
    pub const CQSIZE: u32 = 1 << 3;
    pub const CLAMP: u32 = 1 << 4;
    pub const ATTACH_WQ: u32 = 1 << 5;
    pub const R_DISABLED: u32 = 1 << 6;
    pub const SUBMIT_ALL: u32 = 1 << 7;
    pub const COOP_TASKRUN: u32 = 1 << 8;
    pub const TASKRUN_FLAG: u32 = 1 << 9;
    pub const SQE128: u32 = 1 << 10;
    pub const CQE32: u32 = 1 << 11;
    pub const SINGLE_ISSUER: u32 = 1 << 12;
    pub const DEFER_TASKRUN: u32 = 1 << 13;
    pub const NO_MMAP: u32 = 1 << 14;
    pub const REGISTERED_FD_ONLY: u32 = 1 << 15;
    pub const NO_SQARRAY: u32 = 1 << 16;
}

/// Feature bits reported back by setup.
pub mod features {
    pub const SINGLE_MMAP: u32 = 1 << 0;
    pub const NODROP: u32 = 1 << 1;
    pub const SUBMIT_STABLE: u32 = 1 << 2;
    pub const RW_CUR_POS: u32 = 1 << 3;
    pub const CUR_PERSONALITY: u32 = 1 << 4;
    pub const FAST_POLL: u32 = 1 << 5;
    pub const POLL_32BITS: u32 = 1 << 6;
    pub const SQPOLL_NONFIXED: u32 = 1 << 7;
    pub const EXT_ARG: u32 = 1 << 8;
    pub const NATIVE_WORKERS: u32 = 1 << 9;
    pub const RSRC_TAGS: u32 = 1 << 10;
    pub const CQE_SKIP: u32 = 1 << 11;
    pub const LINKED_FILE: u32 = 1 << 12;
    pub const REG_REG_RING: u32 = 1 << 13;
}

/// Bits in the shared SQ `flags` word (kernel-written).
pub mod sq_flags {
    pub const NEED_WAKEUP: u32 = 1 << 0;
    pub const CQ_OVERFLOW: u32 = 1 << 1;
    pub const TASKRUN: u32 = 1 << 2;
}

/// Bits in the shared CQ `flags` word.
pub mod cq_flags {
    pub const EVENTFD_DISABLED: u32 = 1 << 0;
}

/// `io_uring_enter(2)` flags.
pub mod enter_flags {
    pub const GETEVENTS: u32 = 1 << 0;
    pub const SQ_WAKEUP: u32 = 1 << 1;
    pub const SQ_WAIT: u32 = 1 << 2;
    pub const EXT_ARG: u32 = 1 << 3;
    pub const REGISTERED_RING: u32 = 1 << 4;
}

/// Per-slot `flags` (IOSQE_*).
pub mod sqe_flags {
    pub const FIXED_FILE: u8 = 1 << 0;
    pub const IO_DRAIN: u8 = 1 << 1;
    pub const IO_LINK: u8 = 1 << 2;
    pub const IO_HARDLINK: u8 = 1 << 3;
    pub const ASYNC: u8 = 1 << 4;
    pub const BUFFER_SELECT: u8 = 1 << 5;
    pub const CQE_SKIP_SUCCESS: u8 = 1 << 6;
}

/// Completion `flags` (IORING_CQE_F_*).
pub mod cqe_flags {
    pub const BUFFER: u32 = 1 << 0;
    pub const MORE: u32 = 1 << 1;
    pub const SOCK_NONEMPTY: u32 = 1 << 2;
    pub const NOTIF: u32 = 1 << 3;
    pub const BUFFER_SHIFT: u32 = 16;
}

/// IORING_OP_* opcodes.
pub mod op {
    pub const NOP: u8 = 0;
    pub const READV: u8 = 1;
    pub const WRITEV: u8 = 2;
    pub const FSYNC: u8 = 3;
    pub const READ_FIXED: u8 = 4;
    pub const WRITE_FIXED: u8 = 5;
    pub const POLL_ADD: u8 = 6;
    pub const POLL_REMOVE: u8 = 7;
    pub const SYNC_FILE_RANGE: u8 = 8;
    pub const SENDMSG: u8 = 9;
    pub const RECVMSG: u8 = 10;
    pub const TIMEOUT: u8 = 11;
    pub const TIMEOUT_REMOVE: u8 = 12;
    pub const ACCEPT: u8 = 13;
    pub const ASYNC_CANCEL: u8 = 14;
    pub const LINK_TIMEOUT: u8 = 15;
    pub const CONNECT: u8 = 16;
    pub const FALLOCATE: u8 = 17;
    pub const OPENAT: u8 = 18;
    pub const CLOSE: u8 = 19;
    pub const FILES_UPDATE: u8 = 20;
    pub const STATX: u8 = 21;
    pub const READ: u8 = 22;
    pub const WRITE: u8 = 23;
    pub const FADVISE: u8 = 24;
    pub const MADVISE: u8 = 25;
    pub const SEND: u8 = 26;
    pub const RECV: u8 = 27;
    pub const OPENAT2: u8 = 28;
    pub const EPOLL_CTL: u8 = 29;
    pub const SPLICE: u8 = 30;
    pub const PROVIDE_BUFFERS: u8 = 31;
    pub const REMOVE_BUFFERS: u8 = 32;
    pub const TEE: u8 = 33;
    pub const SHUTDOWN: u8 = 34;
    pub const READV_FIXED: u8 = 60;
    pub const WRITEV_FIXED: u8 = 61;
}

/// Verb-specific flag words.
pub mod op_flags {
    /// `len` of POLL_ADD: multishot.
    pub const POLL_ADD_MULTI: u32 = 1 << 0;
    /// `len` of POLL_REMOVE: update events.
    pub const POLL_UPDATE_EVENTS: u32 = 1 << 1;
    /// `len` of POLL_REMOVE: update user_data.
    pub const POLL_UPDATE_USER_DATA: u32 = 1 << 2;
    /// `ioprio` of RECVMSG: multishot.
    pub const RECV_MULTISHOT: u16 = 1 << 1;
    /// `fsync_flags`.
    pub const FSYNC_DATASYNC: u32 = 1 << 0;
    /// `timeout_flags`.
    pub const TIMEOUT_ABS: u32 = 1 << 0;
    /// `cancel_flags`.
    pub const ASYNC_CANCEL_ALL: u32 = 1 << 0;
}

/// `io_uring_register(2)` opcodes used by the engine.
pub mod register_op {
    pub const REGISTER_PROBE: u32 = 8;
    pub const REGISTER_RING_FDS: u32 = 20;
    pub const UNREGISTER_RING_FDS: u32 = 21;
    /// OR'd into the opcode when `fd` is a registered ring index.
    pub const USE_REGISTERED_RING: u32 = 1 << 31;
}

// ── Setup parameters ──

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqringOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CqringOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// In/out record of `io_uring_setup(2)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqringOffsets,
    pub cq_off: CqringOffsets,
}

impl IoUringParams {
    pub fn with_flags(flags: u32) -> Self {
        Self { flags, ..Self::default() }
    }

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn has_feature(&self, feature: u32) -> bool {
        self.features & feature != 0
    }
}

// ── Submission slot (64 bytes) ──

/// One submission queue entry.
///
/// Unions of the C header are flattened to their widest member; the
/// verb-specific views (`splice_off_in`, `file_index`, `poll32_events`, ...)
/// are accessors in [`crate::prep`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    /// `off` / `addr2`.
    pub off: u64,
    /// `addr` / `splice_off_in`.
    pub addr: u64,
    pub len: u32,
    /// `rw_flags` / `fsync_flags` / `poll32_events` / `msg_flags` / ...
    pub op_flags: u32,
    pub user_data: u64,
    /// `buf_index` / `buf_group`.
    pub buf_index: u16,
    pub personality: u16,
    /// `splice_fd_in` / `file_index` / `optlen`.
    pub splice_fd_in: i32,
    pub addr3: u64,
    pub pad2: u64,
}

// ── Completion slot (16 bytes) ──

/// One completion queue entry. Copied out of the ring by value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

impl Cqe {
    /// Negative `res` as an errno, if the operation failed.
    #[inline]
    pub fn error(&self) -> Option<nix::errno::Errno> {
        if self.res < 0 {
            Some(nix::errno::Errno::from_raw(-self.res))
        } else {
            None
        }
    }

    #[inline]
    pub fn has_more(&self) -> bool {
        self.flags & cqe_flags::MORE != 0
    }

    /// Provided-buffer id, when `IORING_CQE_F_BUFFER` is set.
    #[inline]
    pub fn buffer_id(&self) -> Option<u16> {
        if self.flags & cqe_flags::BUFFER != 0 {
            Some((self.flags >> cqe_flags::BUFFER_SHIFT) as u16)
        } else {
            None
        }
    }
}

// ── Enter / register argument blocks ──

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl From<std::time::Duration> for KernelTimespec {
    fn from(d: std::time::Duration) -> Self {
        Self {
            tv_sec: d.as_secs() as i64,
            tv_nsec: d.subsec_nanos() as i64,
        }
    }
}

/// Extra argument for `IORING_ENTER_EXT_ARG`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeteventsArg {
    pub sigmask: u64,
    pub sigmask_sz: u32,
    pub min_wait_usec: u32,
    pub ts: u64,
}

/// Element of `IORING_REGISTER_RING_FDS`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RsrcUpdate {
    pub offset: u32,
    pub resv: u32,
    pub data: u64,
}

const _: () = assert!(std::mem::size_of::<IoUringParams>() == 120);
const _: () = assert!(std::mem::size_of::<Sqe>() == 64);
const _: () = assert!(std::mem::size_of::<Cqe>() == 16);
const _: () = assert!(std::mem::align_of::<Cqe>() == 8);
const _: () = assert!(std::mem::size_of::<GeteventsArg>() == 24);
const _: () = assert!(std::mem::size_of::<RsrcUpdate>() == 16);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_sqe_field_offsets() {
        assert_eq!(offset_of!(Sqe, fd), 4);
        assert_eq!(offset_of!(Sqe, off), 8);
        assert_eq!(offset_of!(Sqe, addr), 16);
        assert_eq!(offset_of!(Sqe, len), 24);
        assert_eq!(offset_of!(Sqe, op_flags), 28);
        assert_eq!(offset_of!(Sqe, user_data), 32);
        assert_eq!(offset_of!(Sqe, buf_index), 40);
        assert_eq!(offset_of!(Sqe, personality), 42);
        assert_eq!(offset_of!(Sqe, splice_fd_in), 44);
        assert_eq!(offset_of!(Sqe, addr3), 48);
    }

    #[test]
    fn test_params_offsets() {
        assert_eq!(offset_of!(IoUringParams, sq_off), 40);
        assert_eq!(offset_of!(IoUringParams, cq_off), 80);
        assert_eq!(offset_of!(SqringOffsets, user_addr), 32);
        assert_eq!(offset_of!(CqringOffsets, user_addr), 32);
    }

    #[test]
    fn test_cqe_error() {
        let ok = Cqe { user_data: 1, res: 512, flags: 0 };
        assert_eq!(ok.error(), None);

        let canceled = Cqe { user_data: 1, res: -libc::ECANCELED, flags: 0 };
        assert_eq!(canceled.error(), Some(nix::errno::Errno::ECANCELED));
    }

    #[test]
    fn test_cqe_buffer_id() {
        let cqe = Cqe { user_data: 0, res: 0, flags: cqe_flags::BUFFER | (7 << 16) };
        assert_eq!(cqe.buffer_id(), Some(7));
        assert_eq!(Cqe::default().buffer_id(), None);
    }

    #[test]
    fn test_timespec_from_duration() {
        let ts = KernelTimespec::from(std::time::Duration::from_millis(1500));
        assert_eq!(ts.tv_sec, 1);
        assert_eq!(ts.tv_nsec, 500_000_000);
    }
}
