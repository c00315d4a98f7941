//! Error types for the ring engine.

use core::fmt;

use nix::errno::Errno;

/// Result type for ring operations
pub type Result<T> = std::result::Result<T, UringError>;

/// Errors surfaced by ring construction and the submit/wait protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UringError {
    /// `io_uring_setup` refused the configuration, or it was rejected locally
    /// before contacting the kernel (oversized or zero entries).
    Setup(Errno),

    /// A shared region could not be mapped or allocated.
    Mapping(Errno),

    /// `io_uring_enter` failed.
    Enter(Errno),

    /// `io_uring_register` failed.
    Register(Errno),

    /// Inconsistent configuration, rejected before any kernel contact.
    InvalidConfig(&'static str),

    /// No free submission slot.
    QueueFull,

    /// A deadline wait expired without a completion.
    Timeout,

    /// The engine's internal timeout slot completed with an error.
    Completion(Errno),
}

impl UringError {
    /// Whether retrying the same call may succeed.
    ///
    /// Only entry failures with EAGAIN, EINTR or EBUSY qualify; EBUSY means
    /// the CQ must be drained first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UringError::Enter(Errno::EAGAIN | Errno::EINTR | Errno::EBUSY)
        )
    }

    /// The underlying errno, if any.
    pub fn errno(&self) -> Option<Errno> {
        match *self {
            UringError::Setup(e)
            | UringError::Mapping(e)
            | UringError::Enter(e)
            | UringError::Register(e)
            | UringError::Completion(e) => Some(e),
            UringError::Timeout => Some(Errno::ETIME),
            UringError::InvalidConfig(_) => Some(Errno::EINVAL),
            UringError::QueueFull => None,
        }
    }
}

impl fmt::Display for UringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UringError::Setup(e) => write!(f, "io_uring setup: {}", e),
            UringError::Mapping(e) => write!(f, "ring mapping failed: {}", e),
            UringError::Enter(e) => write!(f, "io_uring enter: {}", e),
            UringError::Register(e) => write!(f, "io_uring register: {}", e),
            UringError::InvalidConfig(why) => write!(f, "invalid ring config: {}", why),
            UringError::QueueFull => write!(f, "submission queue full"),
            UringError::Timeout => write!(f, "wait timed out"),
            UringError::Completion(e) => write!(f, "completion failed: {}", e),
        }
    }
}

impl std::error::Error for UringError {}

/// Returned by `get_sqe` when every submission slot is taken.
///
/// Nothing in shared memory changed; submit and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "submission queue full")
    }
}

impl std::error::Error for QueueFull {}

impl From<QueueFull> for UringError {
    fn from(_: QueueFull) -> Self {
        UringError::QueueFull
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = UringError::Enter(Errno::EBUSY);
        assert!(format!("{}", e).starts_with("io_uring enter: EBUSY"));

        let e = UringError::InvalidConfig("REGISTERED_FD_ONLY requires NO_MMAP");
        assert_eq!(
            format!("{}", e),
            "invalid ring config: REGISTERED_FD_ONLY requires NO_MMAP"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(UringError::Enter(Errno::EAGAIN).is_retryable());
        assert!(UringError::Enter(Errno::EINTR).is_retryable());
        assert!(UringError::Enter(Errno::EBUSY).is_retryable());
        assert!(!UringError::Enter(Errno::EBADF).is_retryable());
        assert!(!UringError::Setup(Errno::EAGAIN).is_retryable());
        assert!(!UringError::QueueFull.is_retryable());
    }

    #[test]
    fn test_queue_full_conversion() {
        fn take() -> Result<()> {
            Err(QueueFull)?;
            Ok(())
        }
        assert_eq!(take(), Err(UringError::QueueFull));
        assert_eq!(UringError::QueueFull.errno(), None);
        assert_eq!(UringError::Timeout.errno(), Some(Errno::ETIME));
    }
}
