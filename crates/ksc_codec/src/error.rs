//! Error types for the codec crate.

use crate::envelope::PxgError;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding a request or decoding a reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The reply body is not valid JSON.
    #[error("malformed JSON: {message}")]
    MalformedJson {
        /// Parser diagnostic.
        message: String,
    },

    /// The reply parsed, but its shape is not one the envelope allows.
    #[error("unexpected shape: {message}")]
    UnexpectedShape {
        /// Description of what was expected.
        message: String,
    },

    /// The reply carried an in-band `PxgError`.
    #[error("server error: {0}")]
    Server(PxgError),
}

impl CodecError {
    /// Create a malformed JSON error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedJson {
            message: message.into(),
        }
    }

    /// Create an unexpected shape error.
    pub fn unexpected_shape(message: impl Into<String>) -> Self {
        Self::UnexpectedShape {
            message: message.into(),
        }
    }

    /// Returns the server error if this is an in-band `PxgError`.
    pub fn server_error(&self) -> Option<&PxgError> {
        match self {
            Self::Server(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() {
            Self::malformed(err.to_string())
        } else {
            Self::unexpected_shape(err.to_string())
        }
    }
}
