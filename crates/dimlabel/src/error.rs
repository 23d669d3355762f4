//! Error and Result types for dimension label operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for dimension label operations.
pub type Result<T> = std::result::Result<T, DimLabelError>;

/// Coarse classification of a [`DimLabelError`].
///
/// Callers branch on the kind rather than on individual variants: the
/// variants carry detail for messages, the kind carries the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Label pair order, datatype or domain incompatible with its target.
    SchemaMismatch,
    /// A requested range does not overlap stored data.
    EmptyIntersection,
    /// A caller supplied buffer cannot hold the result.
    BufferTooSmall,
    /// A required buffer was never set.
    BufferUnset,
    /// An operation was invoked out of protocol order.
    OrderingViolation,
    /// Malformed caller input.
    InvalidArgument,
    /// Failure reported by the array storage layer.
    StorageFailure,
}

/// The error type for dimension label operations.
#[derive(Debug, Error)]
pub enum DimLabelError {
    /// Label pair or range incompatible with the target schema.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Requested range does not intersect the stored data.
    #[error("Empty intersection: range {range} does not overlap stored data")]
    EmptyIntersection {
        /// Display form of the requested range.
        range: String,
    },

    /// Buffer capacity is smaller than the number of bytes to produce.
    #[error("Buffer too small: {required} bytes required, {available} available")]
    BufferTooSmall {
        /// Bytes needed to hold the result.
        required: u64,
        /// Bytes the buffer can hold.
        available: u64,
    },

    /// A buffer required for the operation was not set.
    #[error("Buffer unset: {0}")]
    BufferUnset(String),

    /// Operation invoked in an invalid protocol state.
    #[error("Ordering violation: {0}")]
    OrderingViolation(String),

    /// Malformed input supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid magic bytes at the start or end of a file.
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// File checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// File content could not be decoded.
    #[error("Corrupt file: {0}")]
    Corrupt(String),

    /// No array exists at the given location.
    #[error("Array not found: {}", .0.display())]
    ArrayNotFound(PathBuf),

    /// An array already exists at the given location.
    #[error("Array already exists: {}", .0.display())]
    ArrayExists(PathBuf),

    /// Operation requires an open array or label pair.
    #[error("Not open: {0}")]
    NotOpen(String),

    /// Open was called on an array or label pair that is already open.
    #[error("Already open: {0}")]
    AlreadyOpen(String),

    /// Operation is not valid for the mode the array was opened in.
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// Opening with an encryption type the array was not created with.
    #[error("Encryption mismatch: {0}")]
    EncryptionMismatch(String),

    /// Worker pool no longer accepts jobs.
    #[error("Worker pool is shut down")]
    PoolShutdown,

    /// A job running on a worker thread panicked.
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DimLabelError {
    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            Self::EmptyIntersection { .. } => ErrorKind::EmptyIntersection,
            Self::BufferTooSmall { .. } => ErrorKind::BufferTooSmall,
            Self::BufferUnset(_) => ErrorKind::BufferUnset,
            Self::OrderingViolation(_) | Self::NotOpen(_) | Self::AlreadyOpen(_) => {
                ErrorKind::OrderingViolation
            }
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidMagic(_)
            | Self::UnsupportedVersion(_)
            | Self::ChecksumMismatch { .. }
            | Self::Corrupt(_)
            | Self::ArrayNotFound(_)
            | Self::ArrayExists(_)
            | Self::InvalidMode(_)
            | Self::EncryptionMismatch(_)
            | Self::PoolShutdown
            | Self::WorkerPanicked(_)
            | Self::Io(_) => ErrorKind::StorageFailure,
        }
    }

    /// Returns false for conditions callers may treat as "no results".
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::EmptyIntersection
    }
}
