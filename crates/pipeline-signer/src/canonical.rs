//! Canonical signing payloads.
//!
//! The payload of a command step is a JSON object whose keys are the signed
//! fields in protocol order, with every nested mapping sorted by key and
//! absent fields written as `null`. The field list is versioned: signers
//! record the version in the signature and verifiers refuse versions they do
//! not know, so the list can only change together with the version number.

use std::collections::BTreeMap;

use serde_yaml::{Mapping, Value};

use crate::pipeline::{CommandStep, Step, StepKind};

/// Version written into every new signature.
pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedField {
    Command,
    Env,
    Plugins,
    Matrix,
    Agents,
    RepositoryUrl,
}

impl SignedField {
    pub fn name(&self) -> &'static str {
        match self {
            SignedField::Command => "command",
            SignedField::Env => "env",
            SignedField::Plugins => "plugins",
            SignedField::Matrix => "matrix",
            SignedField::Agents => "agents",
            SignedField::RepositoryUrl => "repository_url",
        }
    }
}

/// The repository always comes last.
pub const SIGNED_FIELDS_V1: [SignedField; 6] = [
    SignedField::Command,
    SignedField::Env,
    SignedField::Plugins,
    SignedField::Matrix,
    SignedField::Agents,
    SignedField::RepositoryUrl,
];

pub fn signed_fields(version: u32) -> Option<&'static [SignedField]> {
    match version {
        1 => Some(&SIGNED_FIELDS_V1),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalError {
    #[error("{kind} steps are not signable")]
    NotSignable { kind: StepKind },
    #[error("step sets both `{0}` and `{1}`")]
    Conflict(&'static str, &'static str),
    #[error("`{field}` contains a mapping key that is not a scalar")]
    UnsupportedKey { field: &'static str },
    #[error("`{field}` is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
}

pub fn canonicalize(step: &Step, repository: &str) -> Result<Vec<u8>, CanonicalError> {
    canonicalize_with_env(step, repository, None)
}

/// Like [`canonicalize`], with pipeline-level `env` merged beneath the
/// step's own `env` so that both are covered by the signature.
pub fn canonicalize_with_env(
    step: &Step,
    repository: &str,
    inherited_env: Option<&Mapping>,
) -> Result<Vec<u8>, CanonicalError> {
    match step {
        Step::Command(command) => canonicalize_command(command, repository, inherited_env, PAYLOAD_VERSION),
        other => Err(CanonicalError::NotSignable { kind: other.kind() }),
    }
}

pub fn canonicalize_command(
    command: &CommandStep,
    repository: &str,
    inherited_env: Option<&Mapping>,
    version: u32,
) -> Result<Vec<u8>, CanonicalError> {
    let fields = signed_fields(version).ok_or(CanonicalError::Malformed {
        field: "signature",
        reason: format!("unknown payload version {version}"),
    })?;

    let mut out = String::from("{");
    for (position, field) in fields.iter().enumerate() {
        if position > 0 {
            out.push(',');
        }
        write_str(&mut out, field.name());
        out.push(':');
        let value = field_value(*field, command, repository, inherited_env)?;
        write_value(&mut out, &value, field.name())?;
    }
    out.push('}');
    Ok(out.into_bytes())
}

fn field_value(
    field: SignedField,
    command: &CommandStep,
    repository: &str,
    inherited_env: Option<&Mapping>,
) -> Result<Value, CanonicalError> {
    match field {
        SignedField::Command => command_text(command),
        SignedField::Env => merged_env(command.get("env"), inherited_env),
        SignedField::Plugins => plugin_list(command.get("plugins")),
        SignedField::Matrix => Ok(command.get("matrix").cloned().unwrap_or(Value::Null)),
        SignedField::Agents => agent_rules(command.get("agents")),
        SignedField::RepositoryUrl => Ok(Value::String(repository.to_owned())),
    }
}

/// `command` and `commands` are aliases; a list is run as newline-joined
/// script lines.
fn command_text(command: &CommandStep) -> Result<Value, CanonicalError> {
    let value = match (command.get("command"), command.get("commands")) {
        (Some(_), Some(_)) => return Err(CanonicalError::Conflict("command", "commands")),
        (Some(value), None) | (None, Some(value)) => value,
        (None, None) => return Ok(Value::Null),
    };
    match untag(value) {
        Value::Null => Ok(Value::Null),
        Value::Sequence(lines) => {
            let lines = lines
                .iter()
                .map(|line| {
                    scalar_string(line).ok_or_else(|| CanonicalError::Malformed {
                        field: "command",
                        reason: "command lists may only contain strings".to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::String(lines.join("\n")))
        }
        scalar => scalar_string(scalar).map(Value::String).ok_or_else(|| {
            CanonicalError::Malformed {
                field: "command",
                reason: "expected a string or a list of strings".to_string(),
            }
        }),
    }
}

fn merged_env(step_env: Option<&Value>, inherited: Option<&Mapping>) -> Result<Value, CanonicalError> {
    let step_env = match step_env.map(untag) {
        None | Some(Value::Null) => None,
        Some(Value::Mapping(env)) => Some(env),
        Some(_) => {
            return Err(CanonicalError::Malformed {
                field: "env",
                reason: "expected a mapping".to_string(),
            });
        }
    };
    if step_env.is_none() && inherited.is_none() {
        return Ok(Value::Null);
    }

    let mut merged = Mapping::new();
    for env in inherited.into_iter().chain(step_env) {
        for (name, value) in env {
            let name = scalar_string(name).ok_or(CanonicalError::UnsupportedKey { field: "env" })?;
            let value = match untag(value) {
                Value::Null => Value::Null,
                scalar => Value::String(scalar_string(scalar).ok_or_else(|| {
                    CanonicalError::Malformed {
                        field: "env",
                        reason: format!("value of {name} is not a scalar"),
                    }
                })?),
            };
            merged.insert(Value::String(name), value);
        }
    }
    Ok(Value::Mapping(merged))
}

/// Plugins normalise to a list of single-entry mappings, in declaration
/// order. A bare `name#version` string is a plugin with no configuration.
fn plugin_list(plugins: Option<&Value>) -> Result<Value, CanonicalError> {
    let malformed = |reason: &str| CanonicalError::Malformed {
        field: "plugins",
        reason: reason.to_string(),
    };
    let single = |name: Value, config: Value| {
        let mut entry = Mapping::new();
        entry.insert(name, config);
        Value::Mapping(entry)
    };

    let mut normalised = Vec::new();
    match plugins.map(untag) {
        None | Some(Value::Null) => return Ok(Value::Null),
        Some(Value::Mapping(map)) => {
            for (name, config) in map {
                normalised.push(single(name.clone(), config.clone()));
            }
        }
        Some(Value::Sequence(list)) => {
            for item in list {
                match untag(item) {
                    Value::String(name) => normalised.push(single(Value::String(name.clone()), Value::Null)),
                    Value::Mapping(map) => {
                        for (name, config) in map {
                            normalised.push(single(name.clone(), config.clone()));
                        }
                    }
                    _ => return Err(malformed("plugin entries must be strings or mappings")),
                }
            }
        }
        Some(_) => return Err(malformed("expected a list or a mapping")),
    }
    Ok(Value::Sequence(normalised))
}

/// Agent query rules accept both `{queue: default}` and `["queue=default"]`.
/// Values are stringified and a rule key may appear only once.
fn agent_rules(agents: Option<&Value>) -> Result<Value, CanonicalError> {
    let malformed = |reason: &str| CanonicalError::Malformed {
        field: "agents",
        reason: reason.to_string(),
    };
    let mut map = Mapping::new();
    let mut insert = |name: String, value: String| {
        if map.insert(Value::from(name.clone()), Value::from(value)).is_some() {
            return Err(malformed(&format!("duplicate rule {name:?}")));
        }
        Ok(())
    };

    match agents.map(untag) {
        None | Some(Value::Null) => return Ok(Value::Null),
        Some(Value::Mapping(rules)) => {
            for (name, value) in rules {
                let name = scalar_string(name).ok_or_else(|| malformed("rule keys must be scalars"))?;
                let value =
                    scalar_string(value).ok_or_else(|| malformed("rule values must be scalars"))?;
                insert(name, value)?;
            }
        }
        Some(Value::Sequence(rules)) => {
            for rule in rules {
                let (name, value) = untag(rule)
                    .as_str()
                    .and_then(|rule| rule.split_once('='))
                    .ok_or_else(|| malformed("list entries must look like key=value"))?;
                insert(name.to_string(), value.to_string())?;
            }
        }
        Some(_) => return Err(malformed("expected a mapping or a list")),
    }
    Ok(Value::Mapping(map))
}

fn untag(value: &Value) -> &Value {
    match value {
        Value::Tagged(tagged) => untag(&tagged.value),
        other => other,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match untag(value) {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn write_str(out: &mut String, s: &str) {
    out.push_str(&serde_json::Value::from(s).to_string());
}

fn write_value(out: &mut String, value: &Value, field: &'static str) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_str(out, s),
        Value::Sequence(items) => {
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_value(out, item, field)?;
            }
            out.push(']');
        }
        Value::Mapping(map) => {
            let mut sorted = BTreeMap::new();
            for (key, item) in map {
                let key = match untag(key) {
                    Value::Null => "null".to_string(),
                    other => scalar_string(other).ok_or(CanonicalError::UnsupportedKey { field })?,
                };
                if sorted.insert(key, item).is_some() {
                    return Err(CanonicalError::Malformed {
                        field,
                        reason: "duplicate mapping key".to_string(),
                    });
                }
            }
            out.push('{');
            for (position, (key, item)) in sorted.into_iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_str(out, &key);
                out.push(':');
                write_value(out, item, field)?;
            }
            out.push('}');
        }
        Value::Tagged(tagged) => write_value(out, &tagged.value, field)?,
    }
    Ok(())
}
