//! Error taxonomy shared by every layer of the server.
//!
//! All variants are recovered at the HTTP boundary and turned into a short
//! `{"error": ...}` body. Only `Internal` carries detail that must stay in the
//! logs.

use firestore::errors::FirestoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or out-of-range input (bad port, empty name, unparsable key).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown index, session or user.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Cryptographic verification failed. Expired and consumed challenges
    /// land here too.
    #[error("invalid signature")]
    InvalidSignature,

    /// Duplicate registration of an existing public key.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage or cryptography backend failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidArgument(reason.into())
    }

    /// HTTP status used when this error reaches a client.
    pub fn status(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) => 400,
            Error::InvalidSignature => 401,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Internal(_) => 500,
        }
    }

    /// Reason shown to clients. Never includes backend detail.
    pub fn public_message(&self) -> String {
        match self {
            Error::InvalidArgument(reason) => reason.clone(),
            Error::NotFound(what) => format!("{what} not found"),
            Error::InvalidSignature => "invalid signature".to_string(),
            Error::Conflict(reason) => reason.clone(),
            Error::Internal(_) => "internal error".to_string(),
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Error::Internal(format!("openssl: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("json: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("io: {err}"))
    }
}

impl From<FirestoreError> for Error {
    fn from(err: FirestoreError) -> Self {
        match err {
            FirestoreError::DataConflictError(_) => Error::Conflict("already registered".to_string()),
            other => Error::Internal(format!("firestore: {other}")),
        }
    }
}
