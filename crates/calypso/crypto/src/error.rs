//! Error types for Calypso secure session operations

use crate::session::{Operation, SessionState};

/// Result type for Calypso crypto operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Calypso crypto operations
///
/// Certificate and MAC mismatches are not errors: verification operations
/// report them as `Ok(false)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation invoked outside of the states allowing it
    #[error(
        "Invalid state: {operation} is not allowed while the session is {state}"
    )]
    InvalidState {
        /// Rejected operation
        operation: Operation,
        /// State of the session when the operation was attempted
        state: SessionState,
    },

    /// Malformed or empty input buffer
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    /// Wrong data length
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// The key back end cannot resolve the requested key
    #[error("Key not found: KIF={kif:#04x}, KVC={kvc:#04x}")]
    KeyNotFound {
        /// Key identifier
        kif: u8,
        /// Key version
        kvc: u8,
    },

    /// APDU payloads supplied out of the expected request/response order
    #[error("Protocol sequence error: {0}")]
    ProtocolSequence(&'static str),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(&'static str),
}

impl Error {
    /// Whether the error reports a malformed, empty or wrong-length input
    pub const fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::InvalidLength { .. })
    }
}

impl From<cipher::InvalidLength> for Error {
    fn from(_: cipher::InvalidLength) -> Self {
        Self::Crypto("invalid key or IV length")
    }
}

/// Check that `data` is exactly `expected` bytes long
pub(crate) const fn check_length(data: &[u8], expected: usize) -> Result<()> {
    if data.len() != expected {
        return Err(Error::InvalidLength {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}
