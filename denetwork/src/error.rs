//! Error taxonomy shared by every fallible operation in the crate.

use std::fmt;
use std::io;

/// Reason a connection attempt or an established connection failed.
///
/// Mirrors the `ConnectionFailedReason`/error taxonomy of the wire protocol:
/// every value here can be the payload of a `connection_failed` callback or
/// of a `LINK_DOWN` rejection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FailureReason {
    Generic,
    Timeout,
    Rejected,
    NoCommonProtocol,
    InvalidMessage,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::Generic => "generic failure",
            FailureReason::Timeout => "timed out",
            FailureReason::Rejected => "rejected by peer",
            FailureReason::NoCommonProtocol => "no common protocol",
            FailureReason::InvalidMessage => "invalid message",
        };
        f.write_str(text)
    }
}

/// Non-fatal vs. fatal split, the same shape as the teacher's
/// `NetworkError::{Wait, Fatal}`: a would-block condition from the
/// underlying socket is not a protocol error and callers must not treat it
/// as one (it is filtered out before it ever reaches a user callback).
#[derive(Debug)]
pub enum NetworkError {
    /// The operation could not complete right now (e.g. socket would block,
    /// or a write does not fit in the remaining buffer capacity). Retriable.
    Wait,
    /// A fatal condition; the connection that produced it must close.
    Fatal(FailureReason),
    /// An I/O error that isn't a would-block condition.
    Io(io::ErrorKind),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Wait => write!(f, "operation would block"),
            NetworkError::Fatal(reason) => write!(f, "fatal network error: {}", reason),
            NetworkError::Io(kind) => write!(f, "io error: {:?}", kind),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Io(kind),
        }
    }
}

impl From<FailureReason> for NetworkError {
    #[inline]
    fn from(reason: FailureReason) -> Self {
        NetworkError::Fatal(reason)
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Augments a result with the "was this actually a failure" question the
/// teacher's `ErrorUtils::has_failed` answers: `Wait` is not a failure, it
/// just means "try again later".
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(NetworkError::Wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_not_a_failure() {
        let result: NetworkResult<()> = Err(io::Error::from(io::ErrorKind::WouldBlock).into());
        assert!(!result.has_failed());
        assert!(matches!(result, Err(NetworkError::Wait)));
    }

    #[test]
    fn fatal_is_a_failure() {
        let result: NetworkResult<()> = Err(FailureReason::Timeout.into());
        assert!(result.has_failed());
    }

    #[test]
    fn ok_is_not_a_failure() {
        let result: NetworkResult<()> = Ok(());
        assert!(!result.has_failed());
    }
}
