//! Error types for the CapTP engine.

use thiserror::Error;

use crate::marshal::MarshalError;
use crate::value::Rejection;

/// Top-level error type for engine entry points.
#[derive(Debug, Error)]
pub enum CapTpError {
    /// The connection has been aborted; no further questions may be
    /// created and no messages may be sent.
    #[error("connection unplugged: {reason}")]
    Unplugged {
        /// The abort reason every pending question was rejected with.
        reason: Rejection,
    },

    /// The engine behind this remote reference has been dropped.
    #[error("connection dropped")]
    ConnectionDropped,

    /// A value could not be marshalled or unmarshalled.
    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),
}

/// Alias for Result with CapTpError.
pub type CapTpResult<T> = Result<T, CapTpError>;
