//! Error types for the vdkit core library.

use std::path::PathBuf;

/// The main error type for vdkit operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Two extents claim the same bytes of the composed stream.
    #[error("extent [{first_start}, {first_end}) overlaps extent [{second_start}, {second_end})")]
    Overlap {
        first_start: u64,
        first_end: u64,
        second_start: u64,
        second_end: u64,
    },

    /// A read touched bytes that the stream does not define.
    #[error("read of {count} bytes at offset {offset} is outside the covered range (stream length {total_length})")]
    OutOfRange {
        offset: u64,
        count: u64,
        total_length: u64,
    },

    /// An extent could not materialize its content.
    #[error("failed to prepare extent at {start}: {reason}")]
    Preparation { start: u64, reason: String },

    /// The backing source of a pass-through extent failed.
    #[error("source read failed at disk offset {offset}: {source}")]
    SourceRead {
        offset: u64,
        source: std::io::Error,
    },

    /// An extent range is unusable (empty, overflowing, or misbehaving).
    #[error("invalid extent at {start} (length {length}): {reason}")]
    InvalidExtent {
        start: u64,
        length: u64,
        reason: String,
    },

    /// An extent with transient content was read before `prepare_for_read`.
    #[error("extent at {start} was read before being prepared")]
    NotPrepared { start: u64 },

    /// A non-blocking read was cancelled.
    #[error("read cancelled after {bytes_written} bytes")]
    Cancelled { bytes_written: usize },

    /// The operation is not allowed in the stream's current state.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// Inconsistent builder or encoder configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Error encoding or decoding a VMDK image.
    #[error("VMDK error: {message}")]
    Vmdk { message: String },
}

/// A specialized Result type for vdkit operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a preparation error for the extent starting at `start`.
    pub fn preparation(start: u64, reason: impl Into<String>) -> Self {
        Self::Preparation {
            start,
            reason: reason.into(),
        }
    }

    /// Create a source read error at the given disk offset.
    pub fn source_read(offset: u64, source: std::io::Error) -> Self {
        Self::SourceRead { offset, source }
    }

    /// Create an invalid extent error.
    pub fn invalid_extent(start: u64, length: u64, reason: impl Into<String>) -> Self {
        Self::InvalidExtent {
            start,
            length,
            reason: reason.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a VMDK error.
    pub fn vmdk(message: impl Into<String>) -> Self {
        Self::Vmdk {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;

        match err {
            Error::Io { source, .. } | Error::SourceRead { source, .. } => source,
            Error::OutOfRange { .. } => std::io::Error::new(ErrorKind::InvalidInput, err),
            Error::Cancelled { .. } => std::io::Error::new(ErrorKind::Interrupted, err),
            other => std::io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/path/to/disk.raw");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/path/to/disk.raw"));
    }

    #[test]
    fn test_io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io_simple(io_err);
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(!msg.contains("at '"));
    }

    #[test]
    fn test_overlap_error_names_both_ranges() {
        let err = Error::Overlap {
            first_start: 0,
            first_end: 4,
            second_start: 2,
            second_end: 6,
        };
        let msg = err.to_string();
        assert!(msg.contains("[0, 4)"));
        assert!(msg.contains("[2, 6)"));
    }

    #[test]
    fn test_preparation_error() {
        let err = Error::preparation(512, "bitmap unavailable");
        assert!(err.to_string().contains("prepare extent at 512"));
        assert!(err.to_string().contains("bitmap unavailable"));
    }

    #[test]
    fn test_vmdk_error() {
        let err = Error::vmdk("unsupported format");
        assert!(err.to_string().contains("VMDK error"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }

    #[test]
    fn test_into_io_error_keeps_source_kind() {
        let err = Error::source_read(
            10,
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short"),
        );
        let io_err: std::io::Error = err.into();
        assert_eq!(io_err.kind(), std::io::ErrorKind::UnexpectedEof);

        let io_err: std::io::Error = Error::Cancelled { bytes_written: 3 }.into();
        assert_eq!(io_err.kind(), std::io::ErrorKind::Interrupted);
    }
}
