//! Kernel error codes.
//!
//! Every fallible kernel call returns `OsResult`. Errors are plain values;
//! the kernel never unwinds across an operation. A blocking call delivers
//! its wake-up reason through the suspended thread, so the code a waiter
//! observes after resuming is one of these values as well.

use core::fmt;

/// Error codes of the kernel ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsError {
    /// Generic failure: wrong state for the call, or the object the caller
    /// was waiting on was torn down underneath it.
    Error,
    /// A blocking operation did not complete inside its wait window, or a
    /// poll-mode attempt found the resource unavailable.
    Timeout,
    /// A bounded container (mailbox ring, message pool) has no free slot.
    Full,
    /// A bounded container has nothing to take.
    Empty,
    /// Object or stack allocation failed.
    NoMem,
    /// The calling thread was suspended; re-issue the call on the next
    /// dispatch to collect the real result. Never observed by a well-formed
    /// thread body.
    WouldBlock,
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "operation failed"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Full => write!(f, "no free slot"),
            Self::Empty => write!(f, "nothing to take"),
            Self::NoMem => write!(f, "out of memory"),
            Self::WouldBlock => write!(f, "caller suspended"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for OsError {}

#[cfg(feature = "defmt")]
impl defmt::Format for OsError {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.as_str());
    }
}

impl OsError {
    /// Short static name, mainly for trace sinks.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Full => "FULL",
            Self::Empty => "EMPTY",
            Self::NoMem => "NOMEM",
            Self::WouldBlock => "WOULDBLOCK",
        }
    }
}

pub type OsResult<T> = Result<T, OsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable() {
        assert_eq!(OsError::Timeout.as_str(), "TIMEOUT");
        assert_eq!(OsError::Full.as_str(), "FULL");
        assert_ne!(OsError::Error, OsError::Timeout);
    }
}
