//! Error types for the mesh control plane.
//!
//! Most failures inside the mesh are recovered locally and only show up as
//! delegate events. The variants here cover what a caller can act on.

use crate::priority::MessagePriority;
use crate::storage::StoreError;
use crate::types::ConnectionId;
use std::fmt;

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by mesh operations.
#[derive(Debug)]
pub enum Error {
    /// The message queue is full and holds nothing this message may evict.
    QueueFull {
        /// Priority of the rejected message.
        priority: MessagePriority,
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Failed to encode a frame or payload.
    Encode(String),

    /// Failed to decode a frame or payload.
    Decode(String),

    /// The connection handle does not refer to a live connection.
    UnknownConnection(ConnectionId),

    /// A handler is already registered for this message type.
    HandlerExists(u16),

    /// The message type lies in a range reserved for the core protocol.
    ReservedType(u16),

    /// Persistent queue storage failed.
    Storage(StoreError),

    /// Internal channel error.
    Channel(String),

    /// Configuration error.
    Config(String),

    /// The mesh has been stopped.
    Shutdown,

    /// Generic IO error.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::QueueFull { priority, capacity } => {
                write!(
                    f,
                    "message queue full ({} slots), cannot admit {} message",
                    capacity,
                    priority.name()
                )
            }
            Error::Encode(msg) => write!(f, "failed to encode: {}", msg),
            Error::Decode(msg) => write!(f, "failed to decode: {}", msg),
            Error::UnknownConnection(id) => write!(f, "unknown connection {}", id),
            Error::HandlerExists(ty) => {
                write!(f, "a handler for message type {} is already registered", ty)
            }
            Error::ReservedType(ty) => {
                write!(f, "message type {} is reserved for the mesh protocol", ty)
            }
            Error::Storage(err) => write!(f, "queue storage error: {}", err),
            Error::Channel(msg) => write!(f, "channel error: {}", msg),
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Shutdown => write!(f, "mesh has been stopped"),
            Error::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Storage(err)
    }
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(err: async_channel::SendError<T>) -> Self {
        Error::Channel(err.to_string())
    }
}

impl From<async_channel::RecvError> for Error {
    fn from(err: async_channel::RecvError) -> Self {
        Error::Channel(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::QueueFull {
            priority: MessagePriority::Critical,
            capacity: 10,
        };
        assert!(err.to_string().contains("10 slots"));
        assert!(err.to_string().contains("critical"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_store() {
        let err: Error = StoreError::Corrupt("short record".into()).into();
        assert!(matches!(err, Error::Storage(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
