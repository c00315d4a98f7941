//! # uring-core
//!
//! Platform-agnostic building blocks of the uring engine.
//!
//! Nothing in here talks to the kernel. The engine crate (`uring`) owns the
//! syscalls and the shared mappings; this crate owns the shapes that cross
//! that boundary.
//!
//! ## Modules
//!
//! - `sys` - io_uring ABI records, flags and opcodes (repr(C))
//! - `geometry` - entry-count negotiation and slot/region sizing
//! - `prep` - per-verb submission slot encoders
//! - `policy` - caller-side handling of canceled completions
//! - `error` - Error types
//! - `kprint` - Kernel-style logging macros
//! - `env` - Environment variable utilities

pub mod sys;
pub mod geometry;
pub mod prep;
pub mod policy;
pub mod error;
pub mod kprint;
pub mod env;

pub use sys::{Cqe, IoUringParams, KernelTimespec, Sqe, UDATA_TIMEOUT};
pub use geometry::{Geometry, NoMmapLayout};
pub use policy::{CancelAction, CancelPolicy};
pub use error::{QueueFull, Result, UringError};
pub use env::{env_get, env_get_bool, env_get_flags, env_get_opt};

pub use nix::errno::Errno;
