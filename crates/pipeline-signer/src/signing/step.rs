use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use sha2::{Digest, Sha256};

use crate::canonical::{self, CanonicalError, PAYLOAD_VERSION};
use crate::error::SigningError;
use crate::keys::{Key, KeySet};
use crate::pipeline::{Step, StepKind};

/// Signature attached to a command step under its `signature` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub algorithm: String,
    pub key_id: String,
    /// Version of the signed field list.
    pub version: u32,
    /// Raw signature bytes, base64url without padding.
    pub value: String,
}

/// Why a step did not verify.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum VerifyFailure {
    #[error("{kind} steps are not signable")]
    NotSignable { kind: StepKind },
    #[error("step has no signature")]
    SignatureMissing,
    #[error("signature is malformed: {reason}")]
    MalformedSignature { reason: String },
    #[error("key {key_id:?} is not in the trusted key set")]
    KeyNotFound { key_id: String },
    #[error("unsupported signing algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
    #[error("unsupported signed field list version {version}")]
    UnsupportedVersion { version: u32 },
    #[error("step content cannot be canonicalized: {reason}")]
    InvalidStep { reason: String },
    #[error("signature by key {key_id:?} does not match the step content")]
    TamperDetected { key_id: String },
}

impl VerifyFailure {
    /// True when the step is known to have been altered, as opposed to
    /// unverifiable for lack of a key or algorithm.
    pub fn is_tamper(&self) -> bool {
        matches!(
            self,
            VerifyFailure::TamperDetected { .. }
                | VerifyFailure::MalformedSignature { .. }
                | VerifyFailure::InvalidStep { .. }
        )
    }
}

pub fn sign_step(step: &mut Step, repository: &str, key: &Key) -> Result<(), SigningError> {
    sign_step_with_env(step, repository, key, None)
}

/// Signs one command step, replacing any existing signature. No other
/// field of the step is touched.
pub fn sign_step_with_env(
    step: &mut Step,
    repository: &str,
    key: &Key,
    inherited_env: Option<&Mapping>,
) -> Result<(), SigningError> {
    let Step::Command(command) = step else {
        return Err(SigningError::NotSignable { kind: step.kind() });
    };
    let signer = key.signer()?;

    let payload =
        canonical::canonicalize_command(command, repository, inherited_env, PAYLOAD_VERSION)?;
    let raw = signer
        .sign(&payload)
        .map_err(|e| SigningError::SigningFailed(format!("{e:#}")))?;

    tracing::debug!(
        key_id = key.id(),
        algorithm = %signer.algorithm(),
        digest = %hex::encode(Sha256::digest(&payload)),
        "signed step"
    );

    command.set_signature(&Signature {
        algorithm: signer.algorithm().as_str().to_string(),
        key_id: key.id().to_string(),
        version: PAYLOAD_VERSION,
        value: URL_SAFE_NO_PAD.encode(raw),
    })?;
    Ok(())
}

pub fn verify_step(step: &Step, repository: &str, keys: &KeySet) -> Result<(), VerifyFailure> {
    verify_step_with_env(step, repository, keys, None)
}

/// Recomputes the payload from the step's current fields and checks the
/// attached signature against the key it names.
pub fn verify_step_with_env(
    step: &Step,
    repository: &str,
    keys: &KeySet,
    inherited_env: Option<&Mapping>,
) -> Result<(), VerifyFailure> {
    let Step::Command(command) = step else {
        return Err(VerifyFailure::NotSignable { kind: step.kind() });
    };
    let signature = command
        .signature()
        .map_err(|reason| VerifyFailure::MalformedSignature { reason })?
        .ok_or(VerifyFailure::SignatureMissing)?;

    if canonical::signed_fields(signature.version).is_none() {
        return Err(VerifyFailure::UnsupportedVersion {
            version: signature.version,
        });
    }
    let key = keys
        .lookup(&signature.key_id)
        .map_err(|_| VerifyFailure::KeyNotFound {
            key_id: signature.key_id.clone(),
        })?;
    let signer = key
        .signer()
        .map_err(|_| VerifyFailure::UnsupportedAlgorithm {
            algorithm: key.algorithm().to_string(),
        })?;
    let tampered = || VerifyFailure::TamperDetected {
        key_id: signature.key_id.clone(),
    };
    // A signature claiming a different algorithm than the key's is never
    // checked with the key's algorithm.
    if signature.algorithm != signer.algorithm().as_str() {
        return Err(tampered());
    }

    let raw = URL_SAFE_NO_PAD
        .decode(&signature.value)
        .map_err(|e| VerifyFailure::MalformedSignature {
            reason: format!("value is not base64url: {e}"),
        })?;
    let payload = canonical::canonicalize_command(command, repository, inherited_env, signature.version)
        .map_err(|e| match e {
            CanonicalError::NotSignable { kind } => VerifyFailure::NotSignable { kind },
            other => VerifyFailure::InvalidStep {
                reason: other.to_string(),
            },
        })?;

    if signer.verify(&payload, &raw) {
        Ok(())
    } else {
        Err(tampered())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Algorithm, key_pair_from_seed};
    use crate::pipeline::StepPath;
    use serde_yaml::Value;

    fn step(yaml: &str) -> Step {
        Step::from_value(serde_yaml::from_str(yaml).unwrap(), &StepPath::root()).unwrap()
    }

    fn key_set(algorithm: Algorithm) -> KeySet {
        let (private, _) = key_pair_from_seed("my-key", algorithm, "step-tests").unwrap();
        KeySet::load(private.to_json().unwrap().as_bytes()).unwrap()
    }

    fn signed(yaml: &str, keys: &KeySet) -> Step {
        let mut step = step(yaml);
        sign_step(&mut step, "my-repo", keys.select(None).unwrap()).unwrap();
        step
    }

    fn set(step: &mut Step, key: &str, value: Value) {
        let Step::Command(command) = step else {
            panic!("expected a command step");
        };
        command.fields_mut().insert(Value::from(key), value);
    }

    #[test]
    fn round_trip_for_each_algorithm() {
        for algorithm in [Algorithm::EdDsa, Algorithm::Es256k, Algorithm::Hs256] {
            let keys = key_set(algorithm);
            let step = signed("command: make test", &keys);
            assert_eq!(verify_step(&step, "my-repo", &keys), Ok(()), "{algorithm}");
        }
    }

    #[test]
    fn signature_records_key_and_version() {
        let keys = key_set(Algorithm::EdDsa);
        let Step::Command(command) = signed("command: make", &keys) else {
            panic!("expected a command step");
        };
        let signature = command.signature().unwrap().unwrap();
        assert_eq!(signature.key_id, "my-key");
        assert_eq!(signature.algorithm, "EdDSA");
        assert_eq!(signature.version, PAYLOAD_VERSION);
    }

    #[test]
    fn signing_only_adds_the_signature() {
        let keys = key_set(Algorithm::EdDsa);
        let before = step("label: build\ncommand: make\nretry: {automatic: true}\n");
        let mut after = before.clone();
        sign_step(&mut after, "my-repo", keys.select(None).unwrap()).unwrap();
        let (Step::Command(before), Step::Command(after)) = (before, after) else {
            panic!("expected command steps");
        };
        let mut stripped = after.fields().clone();
        stripped.remove("signature");
        assert_eq!(&stripped, before.fields());
    }

    #[test]
    fn each_signed_field_is_tamper_sensitive() {
        let keys = key_set(Algorithm::EdDsa);
        let original = "command: make\nenv: {A: b}\nplugins: [docker#v1]\nmatrix: [x, y]\nagents: {queue: q}\n";
        let changes = [
            ("command", Value::from("make deploy")),
            ("env", serde_yaml::from_str("{A: c}").unwrap()),
            ("plugins", serde_yaml::from_str("[docker#v2]").unwrap()),
            ("matrix", serde_yaml::from_str("[x]").unwrap()),
            ("agents", serde_yaml::from_str("{queue: other}").unwrap()),
        ];
        for (field, value) in changes {
            let mut tampered = signed(original, &keys);
            set(&mut tampered, field, value);
            assert_eq!(
                verify_step(&tampered, "my-repo", &keys),
                Err(VerifyFailure::TamperDetected {
                    key_id: "my-key".into()
                }),
                "changing {field} should be detected"
            );
        }
    }

    #[test]
    fn unsigned_fields_can_change() {
        let keys = key_set(Algorithm::EdDsa);
        let mut step = signed("label: a\ncommand: make", &keys);
        set(&mut step, "label", Value::from("b"));
        assert_eq!(verify_step(&step, "my-repo", &keys), Ok(()));
    }

    #[test]
    fn other_repository_is_rejected() {
        let keys = key_set(Algorithm::EdDsa);
        let step = signed("command: make", &keys);
        assert!(matches!(
            verify_step(&step, "other-repo", &keys),
            Err(VerifyFailure::TamperDetected { .. })
        ));
    }

    #[test]
    fn missing_signature_is_reported() {
        let keys = key_set(Algorithm::EdDsa);
        assert_eq!(
            verify_step(&step("command: make"), "my-repo", &keys),
            Err(VerifyFailure::SignatureMissing)
        );
    }

    #[test]
    fn unknown_key_is_not_tampering() {
        let keys = key_set(Algorithm::EdDsa);
        let step = signed("command: make", &keys);
        let (other, _) = key_pair_from_seed("other-key", Algorithm::EdDsa, "x").unwrap();
        let other = KeySet::load(other.to_json().unwrap().as_bytes()).unwrap();
        let failure = verify_step(&step, "my-repo", &other).unwrap_err();
        assert_eq!(
            failure,
            VerifyFailure::KeyNotFound {
                key_id: "my-key".into()
            }
        );
        assert!(!failure.is_tamper());
    }

    #[test]
    fn algorithm_swap_is_tampering() {
        let keys = key_set(Algorithm::EdDsa);
        let mut step = signed("command: make", &keys);
        let Step::Command(command) = &mut step else {
            panic!("expected a command step");
        };
        let mut signature = command.signature().unwrap().unwrap();
        signature.algorithm = "HS256".into();
        command.set_signature(&signature).unwrap();
        assert!(matches!(
            verify_step(&step, "my-repo", &keys),
            Err(VerifyFailure::TamperDetected { .. })
        ));
    }

    #[test]
    fn garbled_signature_value_is_malformed() {
        let keys = key_set(Algorithm::EdDsa);
        let mut step = signed("command: make", &keys);
        let Step::Command(command) = &mut step else {
            panic!("expected a command step");
        };
        let mut signature = command.signature().unwrap().unwrap();
        signature.value = "***".into();
        command.set_signature(&signature).unwrap();
        let failure = verify_step(&step, "my-repo", &keys).unwrap_err();
        assert!(matches!(failure, VerifyFailure::MalformedSignature { .. }));
        assert!(failure.is_tamper());
    }

    #[test]
    fn future_version_is_unsupported() {
        let keys = key_set(Algorithm::EdDsa);
        let mut step = signed("command: make", &keys);
        let Step::Command(command) = &mut step else {
            panic!("expected a command step");
        };
        let mut signature = command.signature().unwrap().unwrap();
        signature.version = 2;
        command.set_signature(&signature).unwrap();
        assert_eq!(
            verify_step(&step, "my-repo", &keys),
            Err(VerifyFailure::UnsupportedVersion { version: 2 })
        );
    }

    #[test]
    fn wait_step_cannot_be_signed() {
        let keys = key_set(Algorithm::EdDsa);
        let mut wait = step("wait");
        assert!(matches!(
            sign_step(&mut wait, "my-repo", keys.select(None).unwrap()),
            Err(SigningError::NotSignable { kind: StepKind::Wait })
        ));
        assert_eq!(wait, step("wait"));
    }

    #[test]
    fn unsupported_key_fails_both_ways() {
        let keys = KeySet::load(br#"{"kty":"EC","crv":"P-384","kid":"p384"}"#).unwrap();
        let mut command = step("command: make");
        assert!(matches!(
            sign_step(&mut command, "my-repo", keys.lookup("p384").unwrap()),
            Err(SigningError::UnsupportedAlgorithm { .. })
        ));

        let mut signed = step(
            "command: make\nsignature: {algorithm: ES384, key_id: p384, version: 1, value: AA}\n",
        );
        assert_eq!(
            verify_step(&signed, "my-repo", &keys),
            Err(VerifyFailure::UnsupportedAlgorithm {
                algorithm: "ES384".into()
            })
        );
        set(&mut signed, "signature", Value::from("not a mapping"));
        assert!(matches!(
            verify_step(&signed, "my-repo", &keys),
            Err(VerifyFailure::MalformedSignature { .. })
        ));
    }
}
