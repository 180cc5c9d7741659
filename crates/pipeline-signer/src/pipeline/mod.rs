//! Parsed pipeline documents.
//!
//! A document is kept as close to its source mapping as possible: only the
//! step tree is lifted into typed variants, everything else (top-level keys,
//! unknown step attributes, key order) is carried through untouched so that a
//! signed document differs from its input only by the `signature` entries.

pub mod walker;

use std::fmt;

use serde::{Serialize, Serializer};
use serde_yaml::{Mapping, Value};

use crate::signing::Signature;

const SIGNATURE_KEY: &str = "signature";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to parse pipeline: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Pipeline must be a list of steps or a mapping with a `steps` list")]
    MissingSteps,
    #[error("Unrecognised step at {path}")]
    UnknownStep { path: StepPath },
    #[error("Step at {path} is declared as {declared} but carries a command")]
    ConflictingStep { path: StepPath, declared: StepKind },
    #[error("Invalid group at {path}: {reason}")]
    InvalidGroup { path: StepPath, reason: String },
    #[error("Failed to serialize pipeline: {0}")]
    Serialize(String),
}

/// Position of a step in the step tree, outermost index first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StepPath(Vec<usize>);

impl StepPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }
}

impl fmt::Display for StepPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("steps");
        }
        for (depth, index) in self.0.iter().enumerate() {
            if depth > 0 {
                f.write_str(".")?;
            }
            write!(f, "steps[{index}]")?;
        }
        Ok(())
    }
}

impl Serialize for StepPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Command,
    Wait,
    Block,
    Input,
    Trigger,
    Group,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Command => "command",
            StepKind::Wait => "wait",
            StepKind::Block => "block",
            StepKind::Input => "input",
            StepKind::Trigger => "trigger",
            StepKind::Group => "group",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "command" | "commands" | "script" => Some(StepKind::Command),
            "wait" | "waiter" => Some(StepKind::Wait),
            "block" | "manual" => Some(StepKind::Block),
            "input" => Some(StepKind::Input),
            "trigger" => Some(StepKind::Trigger),
            "group" => Some(StepKind::Group),
            _ => None,
        }
    }

    /// Infers the kind of a mapping step from the keys it carries.
    ///
    /// A step carrying `command`, `commands` or `plugins` is a command step.
    /// If it also declares another kind, through `type` or a kind key, the
    /// declared kind is returned as the error.
    fn from_keys(fields: &Mapping) -> Result<Option<Self>, StepKind> {
        let typed = match fields.get("type").and_then(Value::as_str) {
            Some(name) => match Self::from_name(name) {
                Some(kind) => Some(kind),
                None => return Ok(None),
            },
            None => None,
        };
        let has = |key: &str| fields.contains_key(key);
        let executable = has("command") || has("commands") || has("plugins");

        if executable {
            return match typed
                .filter(|kind| *kind != StepKind::Command)
                .or_else(|| Self::from_markers(fields))
            {
                Some(declared) => Err(declared),
                None => Ok(Some(StepKind::Command)),
            };
        }
        Ok(typed.or_else(|| Self::from_markers(fields)))
    }

    /// Kind keys other than the executable ones.
    fn from_markers(fields: &Mapping) -> Option<Self> {
        let has = |key: &str| fields.contains_key(key);
        if has("group") {
            Some(StepKind::Group)
        } else if has("trigger") {
            Some(StepKind::Trigger)
        } else if has("block") || has("manual") {
            Some(StepKind::Block)
        } else if has("input") {
            Some(StepKind::Input)
        } else if has("wait") || has("waiter") {
            Some(StepKind::Wait)
        } else {
            None
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step carrying executable content.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandStep {
    fields: Mapping,
}

impl CommandStep {
    pub fn new(fields: Mapping) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &Mapping {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Mutable access to the step's attributes, e.g. for callers editing a
    /// step before (re-)signing it.
    pub fn fields_mut(&mut self) -> &mut Mapping {
        &mut self.fields
    }

    /// The attached signature, `Ok(None)` if the step is unsigned and `Err`
    /// if the `signature` entry does not have the expected shape.
    pub fn signature(&self) -> Result<Option<Signature>, String> {
        match self.fields.get(SIGNATURE_KEY) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_yaml::from_value(value.clone())
                .map(Some)
                .map_err(|e| e.to_string()),
        }
    }

    /// Replaces the signature in place. An existing `signature` entry keeps
    /// its position in the mapping; a new one is appended.
    pub fn set_signature(&mut self, signature: &Signature) -> Result<(), PipelineError> {
        let value =
            serde_yaml::to_value(signature).map_err(|e| PipelineError::Serialize(e.to_string()))?;
        self.fields.insert(Value::from(SIGNATURE_KEY), value);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupStep {
    fields: Mapping,
    steps: Vec<Step>,
}

impl GroupStep {
    pub fn fields(&self) -> &Mapping {
        &self.fields
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut [Step] {
        &mut self.steps
    }

    fn to_value(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert(Value::from("steps"), steps_to_value(&self.steps));
        Value::Mapping(fields)
    }
}

/// One node of the step tree.
///
/// Non-command variants hold their source value verbatim; they are never
/// rewritten, so they serialize back exactly as parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Command(CommandStep),
    Wait(Value),
    Block(Value),
    Input(Value),
    Trigger(Value),
    Group(GroupStep),
}

impl Step {
    pub fn from_value(value: Value, path: &StepPath) -> Result<Self, PipelineError> {
        let kind = match &value {
            Value::String(name) => StepKind::from_name(name)
                .filter(|kind| !matches!(kind, StepKind::Command | StepKind::Group | StepKind::Trigger)),
            Value::Mapping(fields) => StepKind::from_keys(fields).map_err(|declared| {
                PipelineError::ConflictingStep {
                    path: path.clone(),
                    declared,
                }
            })?,
            _ => None,
        };
        let kind = kind.ok_or_else(|| PipelineError::UnknownStep { path: path.clone() })?;

        Ok(match (kind, value) {
            (StepKind::Command, Value::Mapping(fields)) => Step::Command(CommandStep::new(fields)),
            (StepKind::Group, Value::Mapping(fields)) => {
                let nested = match fields.get("steps") {
                    Some(Value::Sequence(nested)) => nested.clone(),
                    Some(_) => {
                        return Err(PipelineError::InvalidGroup {
                            path: path.clone(),
                            reason: "`steps` must be a list".to_string(),
                        });
                    }
                    None => {
                        return Err(PipelineError::InvalidGroup {
                            path: path.clone(),
                            reason: "missing `steps`".to_string(),
                        });
                    }
                };
                let steps = parse_steps(nested, path)?;
                Step::Group(GroupStep { fields, steps })
            }
            (StepKind::Wait, value) => Step::Wait(value),
            (StepKind::Block, value) => Step::Block(value),
            (StepKind::Input, value) => Step::Input(value),
            (StepKind::Trigger, value) => Step::Trigger(value),
            _ => return Err(PipelineError::UnknownStep { path: path.clone() }),
        })
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::Command(_) => StepKind::Command,
            Step::Wait(_) => StepKind::Wait,
            Step::Block(_) => StepKind::Block,
            Step::Input(_) => StepKind::Input,
            Step::Trigger(_) => StepKind::Trigger,
            Step::Group(_) => StepKind::Group,
        }
    }

    pub fn is_signable(&self) -> bool {
        matches!(self, Step::Command(_))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Step::Command(command) => Value::Mapping(command.fields.clone()),
            Step::Group(group) => group.to_value(),
            Step::Wait(value) | Step::Block(value) | Step::Input(value) | Step::Trigger(value) => {
                value.clone()
            }
        }
    }
}

fn parse_steps(values: Vec<Value>, parent: &StepPath) -> Result<Vec<Step>, PipelineError> {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| Step::from_value(value, &parent.child(index)))
        .collect()
}

fn steps_to_value(steps: &[Step]) -> Value {
    Value::Sequence(steps.iter().map(Step::to_value).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
enum Layout {
    /// `steps:` under a top-level mapping, alongside pipeline-level keys.
    Mapping(Mapping),
    /// A bare list of steps.
    Sequence,
}

/// An ordered step tree plus whatever surrounded it in the source text.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDocument {
    layout: Layout,
    steps: Vec<Step>,
    format: DocumentFormat,
}

impl PipelineDocument {
    /// Parses YAML or JSON pipeline text. The output of [`Self::to_text`]
    /// uses the same format as the input.
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let trimmed = text.trim_start();
        let format = if trimmed.starts_with('{') || trimmed.starts_with('[') {
            DocumentFormat::Json
        } else {
            DocumentFormat::Yaml
        };
        let value: Value = serde_yaml::from_str(text)?;
        Self::from_value(value, format)
    }

    pub fn from_value(value: Value, format: DocumentFormat) -> Result<Self, PipelineError> {
        let root = StepPath::root();
        match value {
            Value::Sequence(steps) => Ok(Self {
                layout: Layout::Sequence,
                steps: parse_steps(steps, &root)?,
                format,
            }),
            Value::Mapping(fields) => {
                let steps = match fields.get("steps") {
                    Some(Value::Sequence(steps)) => steps.clone(),
                    _ => return Err(PipelineError::MissingSteps),
                };
                Ok(Self {
                    steps: parse_steps(steps, &root)?,
                    layout: Layout::Mapping(fields),
                    format,
                })
            }
            _ => Err(PipelineError::MissingSteps),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut [Step] {
        &mut self.steps
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    /// Pipeline-level `env`, inherited by every command step.
    pub fn env(&self) -> Option<&Mapping> {
        match &self.layout {
            Layout::Mapping(fields) => fields.get("env").and_then(Value::as_mapping),
            Layout::Sequence => None,
        }
    }

    /// Total number of steps at every depth, groups included.
    pub fn step_count(&self) -> usize {
        fn count(steps: &[Step]) -> usize {
            steps
                .iter()
                .map(|step| match step {
                    Step::Group(group) => 1 + count(group.steps()),
                    _ => 1,
                })
                .sum()
        }
        count(&self.steps)
    }

    pub fn to_value(&self) -> Value {
        match &self.layout {
            Layout::Sequence => steps_to_value(&self.steps),
            Layout::Mapping(fields) => {
                let mut fields = fields.clone();
                fields.insert(Value::from("steps"), steps_to_value(&self.steps));
                Value::Mapping(fields)
            }
        }
    }

    pub fn to_text(&self) -> Result<String, PipelineError> {
        let value = self.to_value();
        match self.format {
            DocumentFormat::Yaml => {
                serde_yaml::to_string(&value).map_err(|e| PipelineError::Serialize(e.to_string()))
            }
            DocumentFormat::Json => serde_json::to_string_pretty(&value)
                .map(|mut text| {
                    text.push('\n');
                    text
                })
                .map_err(|e| PipelineError::Serialize(e.to_string())),
        }
    }
}
