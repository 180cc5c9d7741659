//! End-to-end flows over pipeline text: validate, load keys, walk, write.

use tracing::info;

use crate::error::SigningError;
use crate::keys::KeySet;
use crate::pipeline::PipelineDocument;
use crate::pipeline::walker::{VerificationReport, sign_all, verify_all};
use crate::validate::{SigningInput, VerificationInput};

/// Signs `input.unsigned_steps` and returns the signed document text.
///
/// Attribute combinations are checked before the key set is read or parsed.
pub fn sign_pipeline(input: &SigningInput) -> Result<String, SigningError> {
    input.validate()?;
    let keys = KeySet::from_source(&input.key_source()?)?;
    sign_document_text(
        &input.unsigned_steps,
        &input.repository,
        &keys,
        input.jwks_key_id.as_deref(),
    )
}

pub fn verify_pipeline(input: &VerificationInput) -> Result<VerificationReport, SigningError> {
    input.validate()?;
    let keys = KeySet::from_source(&input.key_source()?)?;
    verify_document_text(&input.signed_steps, &input.repository, &keys)
}

pub fn sign_document_text(
    text: &str,
    repository: &str,
    keys: &KeySet,
    key_id: Option<&str>,
) -> Result<String, SigningError> {
    let key = keys.select(key_id)?;
    let document = PipelineDocument::parse(text)?;
    info!(
        repository,
        key_id = key.id(),
        steps = document.step_count(),
        "signing pipeline"
    );
    let signed = sign_all(document, repository, key)?;
    Ok(signed.to_text()?)
}

pub fn verify_document_text(
    text: &str,
    repository: &str,
    keys: &KeySet,
) -> Result<VerificationReport, SigningError> {
    let document = PipelineDocument::parse(text)?;
    Ok(verify_all(&document, repository, keys))
}
