use serde::Serialize;
use serde_yaml::Mapping;
use tracing::{info, warn};

use super::{PipelineDocument, Step, StepKind, StepPath};
use crate::error::SigningError;
use crate::keys::{Key, KeySet};
use crate::signing::{VerifyFailure, sign_step_with_env, verify_step_with_env};

/// Signs every command step, depth-first in document order.
///
/// Stops at the first failing step; the error names its path and the key.
/// The key is checked for a supported algorithm and private material before
/// any step is touched.
pub fn sign_all(
    mut document: PipelineDocument,
    repository: &str,
    key: &Key,
) -> Result<PipelineDocument, SigningError> {
    let signer = key.signer()?;
    if !signer.can_sign() {
        return Err(SigningError::SigningFailed(format!(
            "key {:?} has no private key material",
            key.id()
        )));
    }

    let env = document.env().cloned();
    let mut signed = 0;
    sign_steps(
        document.steps_mut(),
        &StepPath::root(),
        repository,
        key,
        env.as_ref(),
        &mut signed,
    )?;

    info!(repository, key_id = key.id(), signed, "signed pipeline");
    Ok(document)
}

fn sign_steps(
    steps: &mut [Step],
    parent: &StepPath,
    repository: &str,
    key: &Key,
    env: Option<&Mapping>,
    signed: &mut usize,
) -> Result<(), SigningError> {
    for (index, step) in steps.iter_mut().enumerate() {
        let path = parent.child(index);
        match step {
            Step::Group(group) => {
                sign_steps(group.steps_mut(), &path, repository, key, env, signed)?
            }
            Step::Command(_) => {
                sign_step_with_env(step, repository, key, env).map_err(|source| {
                    SigningError::AtStep {
                        path,
                        key_id: key.id().to_string(),
                        source: Box::new(source),
                    }
                })?;
                *signed += 1;
            }
            _ => {}
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "failure", rename_all = "snake_case")]
pub enum Outcome {
    Valid,
    Skipped,
    Failed(VerifyFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub path: StepPath,
    pub kind: StepKind,
    pub outcome: Outcome,
}

/// Per-step verification results for a whole document, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub steps: Vec<StepReport>,
}

impl VerificationReport {
    /// No step failed verification.
    pub fn is_trusted(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&StepPath, &VerifyFailure)> {
        self.steps.iter().filter_map(|report| match &report.outcome {
            Outcome::Failed(failure) => Some((&report.path, failure)),
            _ => None,
        })
    }

    pub fn valid_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|report| report.outcome == Outcome::Valid)
            .count()
    }
}

/// Verifies every step without stopping at failures. Groups are not
/// reported themselves; their nested steps are.
pub fn verify_all(
    document: &PipelineDocument,
    repository: &str,
    keys: &KeySet,
) -> VerificationReport {
    let mut report = VerificationReport::default();
    verify_steps(
        document.steps(),
        &StepPath::root(),
        repository,
        keys,
        document.env(),
        &mut report,
    );

    let failed = report.failures().count();
    if failed > 0 {
        warn!(repository, failed, "pipeline failed verification");
    } else {
        info!(repository, valid = report.valid_count(), "verified pipeline");
    }
    report
}

fn verify_steps(
    steps: &[Step],
    parent: &StepPath,
    repository: &str,
    keys: &KeySet,
    env: Option<&Mapping>,
    report: &mut VerificationReport,
) {
    for (index, step) in steps.iter().enumerate() {
        let path = parent.child(index);
        if let Step::Group(group) = step {
            verify_steps(group.steps(), &path, repository, keys, env, report);
            continue;
        }

        let outcome = match verify_step_with_env(step, repository, keys, env) {
            Ok(()) => Outcome::Valid,
            Err(VerifyFailure::NotSignable { .. }) => Outcome::Skipped,
            Err(failure) => {
                warn!(%path, %failure, "step failed verification");
                Outcome::Failed(failure)
            }
        };
        report.steps.push(StepReport {
            path,
            kind: step.kind(),
            outcome,
        });
    }
}
