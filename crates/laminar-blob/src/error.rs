//! Error types for BLOB stream operations.

use std::io;

use crate::identity::StreamId;

/// Errors raised by providers, managers and stream views.
///
/// Stream views implement `std::io` traits, so their failures travel as
/// [`io::Error`]. A `BlobError` converted into an `io::Error` keeps itself as
/// the inner error and converting back recovers it unchanged.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Operation on an identity that has no live header.
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    /// Malformed identity, offset or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A private buffer would exceed the configured maximum length.
    #[error("copy-on-write buffer of {len} bytes exceeds the limit of {max} bytes")]
    CopyOnWriteOverflow {
        /// Length the buffer would have reached.
        len: u64,
        /// Configured maximum.
        max: u64,
    },

    /// The stream still has open handles.
    #[error("stream {id} is in use ({open_count} open)")]
    StreamInUse {
        /// The stream in use.
        id: StreamId,
        /// Number of outstanding opens.
        open_count: u32,
    },

    /// Mutation attempted through a read-only handle.
    #[error("stream {0} is open read-only")]
    ReadOnly(StreamId),

    /// The manager has been shut down or disposed.
    #[error("stream manager is closed")]
    ManagerClosed,

    /// Backing store I/O failure.
    #[error("storage error: {0}")]
    Storage(#[source] io::Error),
}

impl BlobError {
    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::StreamNotFound(_) => io::ErrorKind::NotFound,
            Self::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            Self::CopyOnWriteOverflow { .. } => io::ErrorKind::OutOfMemory,
            Self::StreamInUse { .. } => io::ErrorKind::ResourceBusy,
            Self::ReadOnly(_) => io::ErrorKind::PermissionDenied,
            Self::ManagerClosed => io::ErrorKind::NotConnected,
            Self::Storage(e) => e.kind(),
        }
    }
}

impl From<io::Error> for BlobError {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<BlobError>()) {
            return Self::Storage(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<BlobError>()) {
            Some(Ok(blob)) => *blob,
            Some(Err(other)) => Self::Storage(io::Error::new(kind, other)),
            None => Self::Storage(kind.into()),
        }
    }
}

impl From<BlobError> for io::Error {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::Storage(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_error_survives_io_round_trip() {
        let io_err: io::Error = BlobError::ReadOnly(StreamId::new(4)).into();
        assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);

        let back = BlobError::from(io_err);
        assert!(matches!(back, BlobError::ReadOnly(id) if id == StreamId::new(4)));
    }

    #[test]
    fn test_plain_io_error_becomes_storage() {
        let err = BlobError::from(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert!(matches!(err, BlobError::Storage(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));

        // Storage errors unwrap to the original io::Error.
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_overflow_message() {
        let err = BlobError::CopyOnWriteOverflow { len: 10, max: 4 };
        assert_eq!(
            err.to_string(),
            "copy-on-write buffer of 10 bytes exceeds the limit of 4 bytes"
        );
    }
}
