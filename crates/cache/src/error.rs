use std::io;

use lodestore_primitives::buffer::DecodeError;
use thiserror::Error;

/// Errors that cross the cache's public boundary.
///
/// Everything else — double retires, unknown extent types, version
/// mismatches that must not happen — is an invariant violation and aborts
/// the process instead of surfacing here.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The transaction's read set was invalidated by a concurrent commit.
    /// Recoverable: discard the transaction and optionally retry.
    #[error("transaction conflicted")]
    Conflict,

    /// Device or journal I/O failed. Pending-I/O barriers on affected
    /// extents stay unresolved; the shard is expected to be torn down.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// An alloc-info or journal-tail delta failed to decode during replay.
    /// Fatal for the mount.
    #[error("failed to decode replay delta")]
    ReplayDecode(#[from] DecodeError),
}

pub type Result<T> = std::result::Result<T, CacheError>;
