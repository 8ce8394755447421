//! Values a work item produces: a plain value or a recovered error.

use serde::{Deserialize, Serialize};

/// A failure produced inside a worker, or reconstructed from its diagnostic output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ErrorValue {
    /// Type tag, e.g. `Panic`, `FatalError` or an exception class name.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
}

impl ErrorValue {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            file: None,
            line: None,
            trace: Vec::new(),
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }
}

/// What invoking a work item yielded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ReturnValue {
    Value(serde_json::Value),
    Error(ErrorValue),
}

impl ReturnValue {
    /// The absence of a value, used when a worker produced nothing at all.
    pub fn none() -> Self {
        Self::Value(serde_json::Value::Null)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::Value(serde_json::Value::Null))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Self::Value(_) => None,
            Self::Error(error) => Some(error),
        }
    }
}

impl From<Result<serde_json::Value, ErrorValue>> for ReturnValue {
    fn from(result: Result<serde_json::Value, ErrorValue>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(error) => Self::Error(error),
        }
    }
}
