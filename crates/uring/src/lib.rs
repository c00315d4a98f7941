//! # uring - User-space io_uring ring engine
//!
//! Sets up a kernel submission/completion ring pair, maps its shared
//! memory, and drives the submit/wait protocol with as few system calls as
//! the ring's state allows.
//!
//! ## Quick Start
//!
//! ```ignore
//! use uring::Ring;
//!
//! let mut ring = Ring::new(8)?;
//! let sqe = ring.get_sqe()?;
//! sqe.prep_nop();
//! sqe.set_data(42);
//! ring.submit()?;
//!
//! let cqe = ring.wait_cqe()?;
//! assert_eq!(cqe.user_data, 42);
//! ring.cqe_seen();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Caller                                │
//! │         get_sqe + prep_*, submit, wait/peek, cqe_seen       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Ring                                 │
//! │     enter decisions, timeouts, registered ring descriptor   │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │    SQ     │      │    CQ     │      │  Memory   │
//!    │ producer  │      │ consumer  │      │  regions  │
//!    └───────────┘      └───────────┘      └───────────┘
//!                              │
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                    Kernel trait                         │
//!    │   io_uring_setup / enter / register, mmap, munmap       │
//!    └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//!
//! [`RingConfig::from_env`] reads `URING_*` variables; see
//! [`config`]. Logging goes to stderr at the level in `URING_LOG_LEVEL`
//! (`off`, `error`, `warn`, `info`, `debug`, `trace`).

pub mod config;
pub mod kernel;
pub mod memory;
pub mod ring;

mod cq;
mod sq;

/// Simulated kernel for driving a ring without io_uring. Tests here and
/// in downstream crates (`features = ["sim"]`).
#[cfg(any(test, feature = "sim"))]
#[doc(hidden)]
pub mod sim;

pub use config::RingConfig;
pub use kernel::{DefaultKernel, Kernel};
pub use ring::Ring;

// Re-export core types
pub use uring_core::{
    geometry, prep, sys, CancelAction, CancelPolicy, Cqe, Errno, Geometry, IoUringParams,
    KernelTimespec, QueueFull, Result, Sqe, UringError, UDATA_TIMEOUT,
};

// Re-export kprint macros for debug logging
pub use uring_core::{kdebug, kerror, kinfo, ktrace, kwarn};
pub use uring_core::kprint::{init as init_logging, set_log_level, LogLevel};

// Re-export env utilities
pub use uring_core::{env_get, env_get_bool, env_get_flags, env_get_opt};
