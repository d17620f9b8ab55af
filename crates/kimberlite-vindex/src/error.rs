//! Error types for the value index.

use kimberlite_io::IoError;

/// Errors produced by the value index.
#[derive(Debug, thiserror::Error)]
pub enum VIndexError {
    /// An operation was attempted after the index was closed.
    #[error("index is closed")]
    IndexClosed,

    /// The on-disk structures violate an invariant this index relies on
    /// (for example, two directory slots holding the same key, or a
    /// posting-list length prefix that does not fit within the heap file).
    /// Fatal to the operation that discovered it.
    #[error("corrupt index input: {reason}")]
    CorruptInput { reason: String },

    /// A key expected to exist in the directory was not found. Fatal to
    /// the `delete` call that encountered it.
    #[error("key not found: {key:?}")]
    MissingKey { key: Vec<u8> },

    /// A record id expected to be present in a key's posting list was not
    /// found. Tolerated (not fatal) on the delete leg of `replace`; see
    /// [`crate::index::ValueIndex::replace`].
    #[error("id {id} not found under key {key:?}")]
    MissingId { key: Vec<u8>, id: u64 },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
}

pub type Result<T> = std::result::Result<T, VIndexError>;
