//! Master error abstractions.

pub use nimbus_core::{ClusterError, ShutdownError, ShutdownResult};

/// A result type for cluster operations carrying the typed taxonomy.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";
