//! Control data: what a worker must do before it can decode its work item.
//!
//! Control is an ordered mapping. Keys are applied in mapping order:
//! - `cwd`: change the working directory
//! - `env`: set process environment variables (string values)
//! - `definitions`: named values exposed to jobs
//! - `autoload`: names of catalog bundles to activate
//!
//! Unknown keys are ignored. Shape problems surface from [`Control::apply`],
//! never from construction.

use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::job::WorkerContext;

pub type ControlData = Map<String, Value>;

pub const AUTOLOAD: &str = "autoload";
pub const CWD: &str = "cwd";
pub const ENV: &str = "env";
pub const DEFINITIONS: &str = "definitions";

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control key `{key}` must be {expected}")]
    InvalidShape { key: String, expected: &'static str },

    #[error("autoload bundle `{0}` is not in the worker catalog")]
    UnknownBundle(String),

    #[error("failed to change directory to {}", path.display())]
    Cwd {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ControlError {
    fn shape(key: &str, expected: &'static str) -> Self {
        Self::InvalidShape {
            key: key.to_string(),
            expected,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Control {
    data: ControlData,
}

impl Control {
    pub fn new(data: ControlData) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &ControlData {
        &self.data
    }

    pub fn into_data(self) -> ControlData {
        self.data
    }

    pub fn with_autoload<I, S>(mut self, bundles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = bundles
            .into_iter()
            .map(|name| Value::String(name.into()))
            .collect();
        self.data.insert(AUTOLOAD.to_string(), Value::Array(names));
        self
    }

    pub fn with_cwd(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into().to_string_lossy().into_owned();
        self.data.insert(CWD.to_string(), Value::String(path));
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let entry = self
            .data
            .entry(ENV)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(vars) = entry {
            vars.insert(name.into(), Value::String(value.into()));
        }
        self
    }

    pub fn with_definition(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let entry = self
            .data
            .entry(DEFINITIONS)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(defs) = entry {
            defs.insert(name.into(), value.into());
        }
        self
    }

    /// Prepare the worker for decoding the work item.
    ///
    /// Meant to run once per worker process: `cwd` and `env` mutate
    /// process-wide state. Errors are fatal to the worker.
    pub fn apply(&self, ctx: &mut WorkerContext) -> Result<(), ControlError> {
        for (key, value) in &self.data {
            match key.as_str() {
                CWD => {
                    let path = value
                        .as_str()
                        .map(PathBuf::from)
                        .ok_or_else(|| ControlError::shape(CWD, "a string path"))?;
                    std::env::set_current_dir(&path)
                        .map_err(|source| ControlError::Cwd { path: path.clone(), source })?;
                    tracing::debug!(cwd = %path.display(), "Changed working directory");
                }
                ENV => {
                    let vars = value
                        .as_object()
                        .ok_or_else(|| ControlError::shape(ENV, "an object of strings"))?;
                    for (name, value) in vars {
                        let value = value
                            .as_str()
                            .ok_or_else(|| ControlError::shape(ENV, "an object of strings"))?;
                        // SAFETY: control is applied on the worker's main thread before the
                        // work item is decoded, while no other thread reads the environment.
                        unsafe { std::env::set_var(name, value) };
                    }
                    tracing::debug!(count = vars.len(), "Set environment variables");
                }
                DEFINITIONS => {
                    let defs = value
                        .as_object()
                        .ok_or_else(|| ControlError::shape(DEFINITIONS, "an object"))?;
                    for (name, value) in defs {
                        ctx.define(name.clone(), value.clone());
                    }
                }
                AUTOLOAD => {
                    let bundles = value
                        .as_array()
                        .ok_or_else(|| ControlError::shape(AUTOLOAD, "an array of bundle names"))?;
                    for bundle in bundles {
                        let name = bundle.as_str().ok_or_else(|| {
                            ControlError::shape(AUTOLOAD, "an array of bundle names")
                        })?;
                        if !ctx.activate(name) {
                            return Err(ControlError::UnknownBundle(name.to_string()));
                        }
                        tracing::debug!(bundle = name, "Activated bundle");
                    }
                }
                other => {
                    tracing::debug!(key = other, "Ignoring unknown control key");
                }
            }
        }
        Ok(())
    }
}

impl From<ControlData> for Control {
    fn from(data: ControlData) -> Self {
        Self::new(data)
    }
}
