/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every protocol client and the orchestrator.
///
/// Each variant carries a policy (see the per-variant docs); the
/// orchestrator and the CLI only ever match on the variant, never on the
/// message text.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Bad argument or missing input file. Surfaced to the user, exit 1.
    #[error("invalid input: {0}")]
    UserInput(String),

    /// The transport vanished mid-operation. The session is dead and must
    /// not be retried automatically.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// A deadline lapsed. The watchdog may rearm once; a second timeout on
    /// the same command escalates to [`Error::Protocol`].
    #[error("'{operation}' timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    /// Unexpected opcode, framing failure or CRC mismatch. Chunk-level
    /// retries apply; the session stays open.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An authentication ritual was refused by the device.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Hash or CRC verification failed on otherwise well-formed data.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// The device or vendor cannot serve the request.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Cooperative cancellation was requested.
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation. Fatal for the session.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn user_input<S: Into<String>>(msg: S) -> Self {
        Error::UserInput(msg.into())
    }

    pub fn disconnected<S: Into<String>>(msg: S) -> Self {
        Error::Disconnected(msg.into())
    }

    pub fn timeout<S: Into<String>>(operation: S, elapsed: Duration) -> Self {
        Error::Timeout { operation: operation.into(), elapsed }
    }

    pub fn proto<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn integrity<S: Into<String>>(msg: S) -> Self {
        Error::Integrity(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether the owning session must be torn down when this error
    /// escapes an operation.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::Disconnected(_) | Error::Internal(_))
    }

    /// Process exit code for front-ends: 0 ok, 1 user error, 2 device
    /// error, 3 cancelled, 4 unsupported.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UserInput(_) => 1,
            Error::Cancelled => 3,
            Error::Unsupported(_) => 4,
            _ => 2,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Error::timeout("io", Duration::ZERO)
            }
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Error::Disconnected(err.to_string()),
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                Error::UserInput(err.to_string())
            }
            _ => Error::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        assert_eq!(Error::user_input("x").exit_code(), 1);
        assert_eq!(Error::Cancelled.exit_code(), 3);
        assert_eq!(Error::unsupported("x").exit_code(), 4);
        assert_eq!(Error::proto("x").exit_code(), 2);
        assert_eq!(Error::disconnected("x").exit_code(), 2);
    }

    #[test]
    fn io_errors_are_classified_by_kind() {
        let gone = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(Error::from(gone), Error::Disconnected(_)));

        let slow = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(Error::from(slow), Error::Timeout { .. }));

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(matches!(Error::from(missing), Error::UserInput(_)));
    }

    #[test]
    fn only_disconnect_and_internal_kill_the_session() {
        assert!(Error::disconnected("x").is_session_fatal());
        assert!(Error::internal("x").is_session_fatal());
        assert!(!Error::proto("x").is_session_fatal());
        assert!(!Error::Cancelled.is_session_fatal());
    }
}
