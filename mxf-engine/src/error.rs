//! Error types for the MXF engine.
//!
//! Low-level codec failures are never swallowed. The partition, index and
//! demux layers wrap them with [`MxfError::with_context`] so a failure names
//! the partition or edit unit it happened at.

use thiserror::Error;

/// MXF engine error types.
#[derive(Error, Debug)]
pub enum MxfError {
    /// Fewer bytes were available than a read required.
    #[error("Truncated stream: {0}")]
    TruncatedStream(String),

    /// Malformed BER length.
    #[error("Invalid BER length encoding at offset {offset}: {message}")]
    InvalidLengthEncoding {
        /// Byte offset of the length field, when known.
        offset: u64,
        /// Description of the encoding error.
        message: String,
    },

    /// Invalid partition pack or random index pack.
    #[error("Invalid partition: {0}")]
    InvalidPartition(String),

    /// Invalid or inconsistent index table segment.
    #[error("Invalid index table segment: {0}")]
    InvalidIndexSegment(String),

    /// Interleaved elements do not match the registered tracks.
    #[error("Demux desync at position {position}: expected {expected}, found {found}")]
    DemuxDesync {
        /// Edit unit position of the content package being read.
        position: i64,
        /// Description of the element that was expected.
        expected: String,
        /// Description of what was found instead.
        found: String,
    },

    /// A fixed-size track received a sample of a different size.
    #[error("Sample size mismatch on track {track_index}: expected {expected} bytes, got {actual}")]
    SampleSizeMismatch {
        /// Track the sample was written to.
        track_index: u32,
        /// Declared size.
        expected: u64,
        /// Supplied size.
        actual: u64,
    },

    /// Samples or index entries supplied out of position order.
    #[error("Out of sequence on track {track_index}: {message}")]
    OutOfSequence {
        /// Track the write was attempted on.
        track_index: u32,
        /// Description of the ordering violation.
        message: String,
    },

    /// No index information for the requested position.
    #[error("No index available for position {position}")]
    IndexUnavailable {
        /// Requested edit unit position.
        position: i64,
    },

    /// Attempt to patch an index entry whose segment was already written.
    #[error("Index entry at position {position} is already finalized")]
    IndexEntryFinalized {
        /// Position of the entry.
        position: i64,
    },

    /// Attempt to finalize index data while entries are still unresolved.
    #[error("{count} index entries still pending (first at position {first_position})")]
    PendingIndexEntries {
        /// Number of unresolved entries.
        count: usize,
        /// Lowest unresolved position.
        first_position: i64,
    },

    /// Re-rendered header metadata no longer fits the reserved space.
    #[error("Header metadata needs {required} bytes but only {available} are reserved")]
    HeaderMetadataOverflow {
        /// Size of the new metadata block including filler.
        required: u64,
        /// Space reserved when the header partition was first written.
        available: u64,
    },

    /// Invalid writer or demuxer configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unknown track index.
    #[error("Invalid track index: {0}")]
    InvalidTrack(u32),

    /// An error annotated with where it happened.
    #[error("{context}: {source}")]
    Context {
        /// Location description (partition offset, position, ...).
        context: String,
        /// Underlying error.
        #[source]
        source: Box<MxfError>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl MxfError {
    /// Wrap this error with a location description.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        MxfError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers.
    pub fn root(&self) -> &MxfError {
        match self {
            MxfError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if the caller can carry on, e.g. by treating the failure as end
    /// of data or falling back to a linear scan.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            MxfError::TruncatedStream(_) | MxfError::IndexUnavailable { .. }
        )
    }
}

impl From<std::io::Error> for MxfError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            MxfError::TruncatedStream(e.to_string())
        } else {
            MxfError::Io(e)
        }
    }
}

impl From<String> for MxfError {
    fn from(s: String) -> Self {
        MxfError::Other(s)
    }
}

impl From<&str> for MxfError {
    fn from(s: &str) -> Self {
        MxfError::Other(s.to_string())
    }
}

/// Result type for MXF operations.
pub type Result<T> = std::result::Result<T, MxfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MxfError::IndexUnavailable { position: 42 };
        assert_eq!(err.to_string(), "No index available for position 42");

        let err = MxfError::SampleSizeMismatch {
            track_index: 1,
            expected: 100,
            actual: 99,
        };
        assert!(err.to_string().contains("expected 100 bytes"));
    }

    #[test]
    fn test_eof_maps_to_truncated() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: MxfError = io.into();
        assert!(matches!(err, MxfError::TruncatedStream(_)));
        assert!(err.is_recoverable());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: MxfError = io.into();
        assert!(matches!(err, MxfError::Io(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_context_keeps_root() {
        let err = MxfError::InvalidPartition("bad key".into()).with_context("partition at 0x200");
        assert!(err.to_string().starts_with("partition at 0x200"));
        assert!(matches!(err.root(), MxfError::InvalidPartition(_)));
    }

    #[test]
    fn test_error_from_string() {
        let err: MxfError = "test error".into();
        assert!(matches!(err, MxfError::Other(_)));
    }
}
