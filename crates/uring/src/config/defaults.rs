//! Library defaults for [`RingConfig`](super::RingConfig).

use uring_core::CancelPolicy;

/// Requested SQ entries.
pub const ENTRIES: u32 = 64;

/// Extra `IORING_SETUP_*` flags.
pub const SETUP_FLAGS: u32 = 0;

pub const SQPOLL: bool = false;

/// SQPOLL idle time before the kernel thread sleeps. 0 lets the kernel pick.
pub const SQ_THREAD_IDLE_MS: u32 = 0;

pub const CANCEL_POLICY: CancelPolicy = CancelPolicy::Surface;
