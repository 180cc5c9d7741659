//! Attribute-combination checks that run before any key material is read.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::SigningError;
use crate::keys::KeySource;

/// Inputs for signing a pipeline: the shape a data source or CLI exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SigningInput {
    pub repository: String,
    pub unsigned_steps: String,
    #[serde(default)]
    pub jwks: Option<String>,
    #[serde(default)]
    pub jwks_file: Option<PathBuf>,
    #[serde(default)]
    pub jwks_key_id: Option<String>,
}

impl SigningInput {
    pub fn validate(&self) -> Result<(), SigningError> {
        require("repository", &self.repository)?;
        require("unsigned_steps", &self.unsigned_steps)?;
        validate_key_sources(self.jwks.as_deref(), self.jwks_file.as_deref())?;
        if let Some(key_id) = &self.jwks_key_id {
            require("jwks_key_id", key_id)?;
        }
        Ok(())
    }

    pub fn key_source(&self) -> Result<KeySource, SigningError> {
        KeySource::select(self.jwks.as_deref(), self.jwks_file.as_deref())
    }
}

/// Inputs for verifying a signed pipeline against trusted keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VerificationInput {
    pub repository: String,
    pub signed_steps: String,
    #[serde(default)]
    pub jwks: Option<String>,
    #[serde(default)]
    pub jwks_file: Option<PathBuf>,
}

impl VerificationInput {
    pub fn validate(&self) -> Result<(), SigningError> {
        require("repository", &self.repository)?;
        require("signed_steps", &self.signed_steps)?;
        validate_key_sources(self.jwks.as_deref(), self.jwks_file.as_deref())
    }

    pub fn key_source(&self) -> Result<KeySource, SigningError> {
        KeySource::select(self.jwks.as_deref(), self.jwks_file.as_deref())
    }
}

/// Exactly one of `jwks` and `jwks_file`, and neither may be empty.
pub fn validate_key_sources(jwks: Option<&str>, jwks_file: Option<&Path>) -> Result<(), SigningError> {
    match (jwks, jwks_file) {
        (Some(_), Some(_)) => Err(SigningError::InvalidCombination(
            "only one of `jwks` or `jwks_file` may be set".to_string(),
        )),
        (None, None) => Err(SigningError::InvalidCombination(
            "exactly one of `jwks` or `jwks_file` must be set".to_string(),
        )),
        (Some(jwks), None) => require("jwks", jwks),
        (None, Some(file)) => {
            if file.as_os_str().is_empty() {
                Err(SigningError::InvalidCombination(
                    "`jwks_file` must not be empty".to_string(),
                ))
            } else {
                Ok(())
            }
        }
    }
}

pub fn require(attribute: &str, value: &str) -> Result<(), SigningError> {
    if value.trim().is_empty() {
        return Err(SigningError::InvalidCombination(format!(
            "`{attribute}` must be set and non-empty"
        )));
    }
    Ok(())
}
