use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::canonical::CanonicalError;
use crate::pipeline::{PipelineError, StepKind, StepPath};

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("Invalid Attribute Combination: {0}")]
    InvalidCombination(String),
    #[error("Invalid key source: {0}")]
    InvalidKeySource(String),
    #[error("Failed to read key set from {path}: {reason}")]
    KeySourceRead { path: String, reason: String },
    #[error("Failed to parse key set: {0}")]
    KeyParse(String),
    #[error("Key set contains {count} keys; a key id is required to choose one")]
    AmbiguousKey { count: usize },
    #[error("Key {key_id:?} not found in key set")]
    KeyNotFound { key_id: String },
    #[error("Unsupported signing algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
    #[error("{kind} steps are not signable")]
    NotSignable { kind: StepKind },
    #[error("Invalid step: {0}")]
    InvalidStep(String),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("Failed to sign {path} with key {key_id:?}: {source}")]
    AtStep {
        path: StepPath,
        key_id: String,
        #[source]
        source: Box<SigningError>,
    },
}

impl SigningError {
    /// Errors caused by the caller's input rather than by key material
    /// or cryptography failing underneath a well-formed request.
    pub fn is_client_error(&self) -> bool {
        match self {
            SigningError::InvalidCombination(_)
            | SigningError::InvalidKeySource(_)
            | SigningError::AmbiguousKey { .. }
            | SigningError::KeyNotFound { .. }
            | SigningError::NotSignable { .. }
            | SigningError::InvalidStep(_)
            | SigningError::Pipeline(_) => true,
            SigningError::AtStep { source, .. } => source.is_client_error(),
            _ => false,
        }
    }
}

impl From<CanonicalError> for SigningError {
    fn from(error: CanonicalError) -> Self {
        match error {
            CanonicalError::NotSignable { kind } => SigningError::NotSignable { kind },
            other => SigningError::InvalidStep(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("No signing keys are configured")]
    KeysNotConfigured,
}

/// Trait implementation to convert this error into an axum http response
impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            ServerError::Signing(error) if error.is_client_error() => {
                (StatusCode::BAD_REQUEST, error.to_string()).into_response()
            }
            not_configured @ ServerError::KeysNotConfigured => {
                (StatusCode::SERVICE_UNAVAILABLE, not_configured.to_string()).into_response()
            }
            error => {
                tracing::error!(%error, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Something wrong happened.",
                )
                    .into_response()
            }
        }
    }
}
