//! Ring configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use uring::config::RingConfig;
//! use uring::sys::setup_flags;
//!
//! // Defaults with env overrides
//! let config = RingConfig::from_env();
//!
//! // Or fully programmatic
//! let config = RingConfig::new()
//!     .entries(256)
//!     .cq_entries(1024)
//!     .flag(setup_flags::NO_SQARRAY);
//! ```

pub mod defaults;

use uring_core::env::{env_get, env_get_bool, env_get_flags, env_get_opt};
use uring_core::sys::{setup_flags, IoUringParams};
use uring_core::{CancelPolicy, Result, UringError};

/// Ring configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Requested SQ entries, rounded up to a power of two at setup
    pub entries: u32,
    /// Explicit CQ size. Implies `IORING_SETUP_CQSIZE`.
    pub cq_entries: Option<u32>,
    /// `IORING_SETUP_*` flags
    pub flags: u32,
    /// Kernel-side submission polling
    pub sqpoll: bool,
    pub sq_thread_idle_ms: u32,
    /// Pin the SQPOLL thread. Implies `IORING_SETUP_SQ_AFF`.
    pub sq_thread_cpu: Option<u32>,
    /// How callers should treat canceled completions
    pub cancel_policy: CancelPolicy,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RingConfig {
    /// Library defaults, no environment.
    pub fn new() -> Self {
        Self {
            entries: defaults::ENTRIES,
            cq_entries: None,
            flags: defaults::SETUP_FLAGS,
            sqpoll: defaults::SQPOLL,
            sq_thread_idle_ms: defaults::SQ_THREAD_IDLE_MS,
            sq_thread_cpu: None,
            cancel_policy: defaults::CANCEL_POLICY,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `URING_ENTRIES` - SQ entries
    /// - `URING_CQ_ENTRIES` - CQ entries (sets CQSIZE)
    /// - `URING_SETUP_FLAGS` - setup flags, decimal or 0x-hex
    /// - `URING_SQPOLL` - kernel submission polling (0/1)
    /// - `URING_SQ_THREAD_IDLE_MS` - SQPOLL idle time
    /// - `URING_SQ_THREAD_CPU` - SQPOLL CPU (sets SQ_AFF)
    /// - `URING_CANCEL_POLICY` - `surface`, `resubmit` or `resubmit:N`
    pub fn from_env() -> Self {
        Self {
            entries: env_get("URING_ENTRIES", defaults::ENTRIES),
            cq_entries: env_get_opt("URING_CQ_ENTRIES"),
            flags: env_get_flags("URING_SETUP_FLAGS", defaults::SETUP_FLAGS),
            sqpoll: env_get_bool("URING_SQPOLL", defaults::SQPOLL),
            sq_thread_idle_ms: env_get("URING_SQ_THREAD_IDLE_MS", defaults::SQ_THREAD_IDLE_MS),
            sq_thread_cpu: env_get_opt("URING_SQ_THREAD_CPU"),
            cancel_policy: env_get("URING_CANCEL_POLICY", defaults::CANCEL_POLICY),
        }
    }

    // Builder methods

    pub fn entries(mut self, n: u32) -> Self {
        self.entries = n;
        self
    }

    pub fn cq_entries(mut self, n: u32) -> Self {
        self.cq_entries = Some(n);
        self
    }

    /// Replace the setup flag word.
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Add one or more setup flags.
    pub fn flag(mut self, flag: u32) -> Self {
        self.flags |= flag;
        self
    }

    pub fn sqpoll(mut self, enable: bool) -> Self {
        self.sqpoll = enable;
        self
    }

    pub fn sq_thread_idle_ms(mut self, ms: u32) -> Self {
        self.sq_thread_idle_ms = ms;
        self
    }

    pub fn sq_thread_cpu(mut self, cpu: u32) -> Self {
        self.sq_thread_cpu = Some(cpu);
        self
    }

    pub fn cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    /// Effective setup flags after folding in the typed options.
    pub fn setup_flags(&self) -> u32 {
        let mut flags = self.flags;
        if self.cq_entries.is_some() {
            flags |= setup_flags::CQSIZE;
        }
        if self.sqpoll {
            flags |= setup_flags::SQPOLL;
        }
        if self.sq_thread_cpu.is_some() {
            flags |= setup_flags::SQ_AFF;
        }
        flags
    }

    /// Input half of the setup parameters.
    pub fn params(&self) -> IoUringParams {
        IoUringParams {
            flags: self.setup_flags(),
            cq_entries: self.cq_entries.unwrap_or(0),
            sq_thread_idle: self.sq_thread_idle_ms,
            sq_thread_cpu: self.sq_thread_cpu.unwrap_or(0),
            ..IoUringParams::default()
        }
    }

    /// Reject combinations the kernel would refuse, before contacting it.
    pub fn validate(&self) -> Result<()> {
        let flags = self.setup_flags();
        if flags & setup_flags::REGISTERED_FD_ONLY != 0 && flags & setup_flags::NO_MMAP == 0 {
            return Err(UringError::InvalidConfig("REGISTERED_FD_ONLY requires NO_MMAP"));
        }
        if flags & setup_flags::CQSIZE != 0 && self.cq_entries.unwrap_or(0) == 0 {
            return Err(UringError::InvalidConfig("CQSIZE without a CQ size"));
        }
        if flags & setup_flags::SQ_AFF != 0 && flags & setup_flags::SQPOLL == 0 {
            return Err(UringError::InvalidConfig("SQ thread CPU requires SQPOLL"));
        }
        Ok(())
    }
}
