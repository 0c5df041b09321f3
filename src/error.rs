use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::session::state::NetplayState;
use crate::IndexedFrame;

/// This enum contains all error messages this library can return. Most API functions will
/// generally return a [`Result<(), NetplayError>`].
///
/// Every variant except [`NetplayError::InvalidRequest`] is session-fatal: the driver is
/// expected to log it and abort the session.
///
/// [`Result<(), NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq)]
pub enum NetplayError {
    /// The reliable channel heard nothing from the peer for the whole keep-alive window.
    TransportTimeout {
        /// The peer the channel was talking to.
        peer: String,
        /// The keep-alive window that elapsed.
        keep_alive_ms: u64,
    },
    /// The peer sent something that cannot be part of a valid exchange.
    ProtocolViolation {
        /// What was received and why it was rejected.
        context: String,
    },
    /// The state machine was asked to move along an edge that is not in the transition table.
    IllegalTransition {
        /// The state the session was in.
        from: NetplayState,
        /// The requested next state.
        to: NetplayState,
    },
    /// No retained snapshot is old enough to satisfy a rollback.
    RollbackFailed {
        /// The frame the rollback wanted to restore.
        target: IndexedFrame,
        /// The oldest retained snapshot, if any.
        oldest: Option<IndexedFrame>,
    },
    /// Both peers hashed the same frame and got different results.
    DesyncDetected {
        /// The frame both hashes were taken at.
        indexed_frame: IndexedFrame,
        /// The local hash.
        local_hash: u64,
        /// The hash reported by the peer.
        remote_hash: u64,
        /// A human readable dump of the local state.
        local_dump: String,
        /// A human readable dump of the remote state.
        remote_dump: String,
    },
    /// The peer reported an error and is aborting.
    RemoteError {
        /// The text sent by the peer.
        message: String,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        kind: InvalidRequestKind,
    },
    /// An internal error occurred that should not happen under normal operation.
    /// If you encounter this error, please report it as a bug.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
}

/// The reason a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidRequestKind {
    /// A numeric configuration value is outside its allowed range.
    ConfigValueOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest allowed value.
        min: u64,
        /// Largest allowed value.
        max: u64,
        /// The value that was supplied.
        actual: u64,
    },
    /// A duration configuration value is outside its allowed range.
    DurationConfigOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest allowed value in milliseconds.
        min_ms: u64,
        /// Largest allowed value in milliseconds.
        max_ms: u64,
        /// The value that was supplied, in milliseconds.
        actual_ms: u64,
    },
    /// The input delay has not been negotiated yet (`delay == 0xFF`).
    NotNegotiated,
    /// A snapshot operation was attempted before the pool was allocated.
    SnapshotStoreNotAllocated,
    /// The encoded simulation state does not fit in one snapshot slot.
    SnapshotTooLarge {
        /// Encoded size of the state.
        required: usize,
        /// Size of one slot.
        capacity: usize,
    },
    /// A player number other than 1 or 2.
    InvalidPlayerNumber {
        /// The number that was supplied.
        number: u8,
    },
}

impl Display for InvalidRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidRequestKind::ConfigValueOutOfRange {
                field,
                min,
                max,
                actual,
            } => write!(
                f,
                "{} must be between {} and {}, got {}",
                field, min, max, actual
            ),
            InvalidRequestKind::DurationConfigOutOfRange {
                field,
                min_ms,
                max_ms,
                actual_ms,
            } => write!(
                f,
                "{} must be between {}ms and {}ms, got {}ms",
                field, min_ms, max_ms, actual_ms
            ),
            InvalidRequestKind::NotNegotiated => {
                write!(f, "input delay has not been negotiated yet")
            }
            InvalidRequestKind::SnapshotStoreNotAllocated => {
                write!(f, "snapshot store is not allocated")
            }
            InvalidRequestKind::SnapshotTooLarge { required, capacity } => write!(
                f,
                "encoded state needs {} bytes but a snapshot slot holds {}",
                required, capacity
            ),
            InvalidRequestKind::InvalidPlayerNumber { number } => {
                write!(f, "invalid player number {}, expected 1 or 2", number)
            }
        }
    }
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::TransportTimeout {
                peer,
                keep_alive_ms,
            } => {
                write!(
                    f,
                    "Channel to {} timed out after {}ms without traffic",
                    peer, keep_alive_ms
                )
            }
            NetplayError::ProtocolViolation { context } => {
                write!(f, "Protocol violation: {}", context)
            }
            NetplayError::IllegalTransition { from, to } => {
                write!(f, "Illegal state transition: {} -> {}", from, to)
            }
            NetplayError::RollbackFailed { target, oldest } => match oldest {
                Some(oldest) => write!(
                    f,
                    "Rollback to {} failed: oldest retained snapshot is {}",
                    target, oldest
                ),
                None => write!(f, "Rollback to {} failed: no snapshots retained", target),
            },
            NetplayError::DesyncDetected {
                indexed_frame,
                local_hash,
                remote_hash,
                ..
            } => {
                write!(
                    f,
                    "Desync detected at {}: local hash {:#018x}, remote hash {:#018x}",
                    indexed_frame, local_hash, remote_hash
                )
            }
            NetplayError::RemoteError { message } => {
                write!(f, "Remote error: {}", message)
            }
            NetplayError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
            NetplayError::InvalidRequest { kind } => {
                write!(f, "Invalid Request: {}", kind)
            }
            NetplayError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            }
        }
    }
}

impl Error for NetplayError {}

impl From<InvalidRequestKind> for NetplayError {
    fn from(kind: InvalidRequestKind) -> Self {
        NetplayError::InvalidRequest { kind }
    }
}

impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        NetplayError::SerializationError {
            context: err.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn display_illegal_transition_names_both_states() {
        let err = NetplayError::IllegalTransition {
            from: NetplayState::InGame,
            to: NetplayState::RetryMenu,
        };
        assert_eq!(
            err.to_string(),
            "Illegal state transition: InGame -> RetryMenu"
        );
    }

    #[test]
    fn display_rollback_failed_with_and_without_oldest() {
        let with = NetplayError::RollbackFailed {
            target: IndexedFrame::new(1, 5),
            oldest: Some(IndexedFrame::new(1, 9)),
        };
        assert!(with.to_string().contains("oldest retained snapshot is 1:9"));

        let without = NetplayError::RollbackFailed {
            target: IndexedFrame::new(1, 5),
            oldest: None,
        };
        assert!(without.to_string().contains("no snapshots retained"));
    }

    #[test]
    fn display_desync_omits_dumps() {
        let err = NetplayError::DesyncDetected {
            indexed_frame: IndexedFrame::new(3, 60),
            local_hash: 1,
            remote_hash: 2,
            local_dump: "a very long dump".to_owned(),
            remote_dump: "another long dump".to_owned(),
        };
        let text = err.to_string();
        assert!(text.contains("3:60"));
        assert!(!text.contains("long dump"));
    }

    #[test]
    fn invalid_request_kind_converts() {
        let err: NetplayError = InvalidRequestKind::ConfigValueOutOfRange {
            field: "rollback",
            min: 0,
            max: 9,
            actual: 12,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Invalid Request: rollback must be between 0 and 9, got 12"
        );
    }

    #[test]
    fn codec_error_becomes_serialization_error() {
        let err: NetplayError = CodecError::BufferTooSmall {
            required: 10,
            provided: 4,
        }
        .into();
        assert!(matches!(err, NetplayError::SerializationError { .. }));
    }

    #[test]
    fn errors_are_std_errors() {
        fn takes_error(_: &dyn Error) {}
        takes_error(&NetplayError::InternalError {
            context: "x".to_owned(),
        });
    }
}
