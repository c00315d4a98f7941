//! What to do with a canceled completion.
//!
//! When one slot of a linked chain fails, the kernel completes the rest of
//! the chain with `-ECANCELED`. The engine never resubmits on its own; a
//! caller holding a [`CancelPolicy`] asks it per completion.

use core::fmt;
use std::str::FromStr;

use nix::errno::Errno;

use crate::sys::Cqe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Report ECANCELED to the caller like any other failure.
    #[default]
    Surface,
    /// Resubmit the same operation, up to `max_attempts` times per tag
    /// (`0` means no limit).
    Resubmit { max_attempts: u32 },
}

/// Verdict for one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAction {
    /// Success, hand the result on.
    Complete(u32),
    /// Canceled and within budget: queue the operation again.
    Resubmit,
    /// Failed. Surface the error.
    Fail(Errno),
}

impl CancelPolicy {
    /// Classify `cqe`, given how many times its operation was already
    /// resubmitted.
    pub fn decide(&self, cqe: &Cqe, attempts: u32) -> CancelAction {
        match cqe.error() {
            None => CancelAction::Complete(cqe.res as u32),
            Some(Errno::ECANCELED) => match *self {
                CancelPolicy::Resubmit { max_attempts }
                    if max_attempts == 0 || attempts < max_attempts =>
                {
                    CancelAction::Resubmit
                }
                _ => CancelAction::Fail(Errno::ECANCELED),
            },
            Some(e) => CancelAction::Fail(e),
        }
    }
}

impl FromStr for CancelPolicy {
    type Err = String;

    /// `surface`, `resubmit` (unbounded) or `resubmit:N`.
    fn from_str(s: &str) -> Result<Self, String> {
        let s = s.trim();
        match s.split_once(':') {
            None if s.eq_ignore_ascii_case("surface") => Ok(CancelPolicy::Surface),
            None if s.eq_ignore_ascii_case("resubmit") => {
                Ok(CancelPolicy::Resubmit { max_attempts: 0 })
            }
            Some((verb, n)) if verb.eq_ignore_ascii_case("resubmit") => n
                .trim()
                .parse()
                .map(|max_attempts| CancelPolicy::Resubmit { max_attempts })
                .map_err(|_| format!("bad resubmit limit '{}'", n)),
            _ => Err(format!("unknown cancel policy '{}'", s)),
        }
    }
}

impl fmt::Display for CancelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelPolicy::Surface => write!(f, "surface"),
            CancelPolicy::Resubmit { max_attempts: 0 } => write!(f, "resubmit"),
            CancelPolicy::Resubmit { max_attempts } => write!(f, "resubmit:{}", max_attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cqe(res: i32) -> Cqe {
        Cqe { user_data: 1, res, flags: 0 }
    }

    #[test]
    fn test_success_passes_through() {
        let p = CancelPolicy::Surface;
        assert_eq!(p.decide(&cqe(4096), 0), CancelAction::Complete(4096));
    }

    #[test]
    fn test_surface_reports_cancel() {
        let p = CancelPolicy::Surface;
        assert_eq!(
            p.decide(&cqe(-libc::ECANCELED), 0),
            CancelAction::Fail(Errno::ECANCELED)
        );
    }

    #[test]
    fn test_resubmit_budget() {
        let p = CancelPolicy::Resubmit { max_attempts: 2 };
        let c = cqe(-libc::ECANCELED);
        assert_eq!(p.decide(&c, 0), CancelAction::Resubmit);
        assert_eq!(p.decide(&c, 1), CancelAction::Resubmit);
        assert_eq!(p.decide(&c, 2), CancelAction::Fail(Errno::ECANCELED));

        let unbounded = CancelPolicy::Resubmit { max_attempts: 0 };
        assert_eq!(unbounded.decide(&c, 1000), CancelAction::Resubmit);
    }

    #[test]
    fn test_other_errors_never_resubmit() {
        let p = CancelPolicy::Resubmit { max_attempts: 0 };
        assert_eq!(p.decide(&cqe(-libc::EIO), 0), CancelAction::Fail(Errno::EIO));
    }

    #[test]
    fn test_parse() {
        assert_eq!("surface".parse(), Ok(CancelPolicy::Surface));
        assert_eq!("Resubmit".parse(), Ok(CancelPolicy::Resubmit { max_attempts: 0 }));
        assert_eq!("resubmit:3".parse(), Ok(CancelPolicy::Resubmit { max_attempts: 3 }));
        assert!("resubmit:x".parse::<CancelPolicy>().is_err());
        assert!("retry".parse::<CancelPolicy>().is_err());
        assert_eq!(CancelPolicy::Resubmit { max_attempts: 3 }.to_string(), "resubmit:3");
    }
}
