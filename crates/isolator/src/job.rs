//! Work items and the registry they resolve against.
//!
//! A work item crosses the process boundary as data: a job name plus the
//! arguments it captured. The worker turns that back into something callable
//! by looking the name up in its active [`JobRegistry`]. Jobs live in
//! [`Bundle`]s; a worker binary lists the bundles it could load in a
//! [`Catalog`], and control data decides which ones become active.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::{self, DeserializeSeed, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::outcome::{ErrorValue, ReturnValue};

/// Named values established by control before any job runs.
pub type Definitions = Map<String, Value>;

/// Portable capture of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job: String,
    #[serde(default)]
    pub args: Value,
}

impl WorkItem {
    pub fn new(job: impl Into<String>, args: Value) -> Self {
        Self {
            job: job.into(),
            args,
        }
    }
}

/// Everything a job sees when it is invoked.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub args: Value,
    pub definitions: Arc<Definitions>,
}

impl JobInput {
    pub fn definition(&self, name: &str) -> Option<&Value> {
        self.definitions.get(name)
    }
}

pub type JobFn = Arc<dyn Fn(JobInput) -> Result<Value, ErrorValue> + Send + Sync>;

/// A named group of jobs that is activated as a unit.
#[derive(Clone)]
pub struct Bundle {
    name: String,
    jobs: Vec<(String, JobFn)>,
}

impl Bundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
        }
    }

    pub fn job<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobInput) -> Result<Value, ErrorValue> + Send + Sync + 'static,
    {
        self.jobs.push((name.into(), Arc::new(f)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("name", &self.name)
            .field("jobs", &self.job_names().collect::<Vec<_>>())
            .finish()
    }
}

/// Bundles a worker is able to load, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    bundles: HashMap<String, Bundle>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle(mut self, bundle: Bundle) -> Self {
        self.add(bundle);
        self
    }

    pub fn add(&mut self, bundle: Bundle) {
        self.bundles.insert(bundle.name.clone(), bundle);
    }

    pub fn get(&self, name: &str) -> Option<&Bundle> {
        self.bundles.get(name)
    }
}

/// Jobs that can currently be resolved by name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, JobFn>,
}

impl JobRegistry {
    pub fn activate(&mut self, bundle: &Bundle) {
        for (name, f) in &bundle.jobs {
            self.jobs.insert(name.clone(), Arc::clone(f));
        }
    }

    pub fn resolve(&self, job: &str) -> Option<JobFn> {
        self.jobs.get(job).cloned()
    }

    pub fn contains(&self, job: &str) -> bool {
        self.jobs.contains_key(job)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.jobs.keys().collect();
        names.sort();
        f.debug_struct("JobRegistry").field("jobs", &names).finish()
    }
}

/// Per-process bootstrap state, prepared by control before the work item is decoded.
#[derive(Debug, Default)]
pub struct WorkerContext {
    catalog: Catalog,
    registry: JobRegistry,
    definitions: Definitions,
    activated: Vec<String>,
}

impl WorkerContext {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            ..Self::default()
        }
    }

    /// Make a bundle's jobs resolvable. Returns false if the catalog does not have it.
    pub fn activate(&mut self, bundle: &str) -> bool {
        match self.catalog.get(bundle) {
            Some(found) => {
                self.registry.activate(found);
                if !self.activated.iter().any(|name| name == bundle) {
                    self.activated.push(bundle.to_string());
                }
                true
            }
            None => false,
        }
    }

    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.definitions.insert(name.into(), value);
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn definitions(&self) -> &Definitions {
        &self.definitions
    }

    pub fn activated(&self) -> &[String] {
        &self.activated
    }

    /// Seed that decodes a [`WorkItem`] and binds it to a registered job.
    pub fn work_item_seed(&self) -> WorkItemSeed<'_> {
        WorkItemSeed { ctx: self }
    }
}

/// Decodes a work item, failing if its job is not resolvable in this context.
pub struct WorkItemSeed<'a> {
    ctx: &'a WorkerContext,
}

impl<'de> DeserializeSeed<'de> for WorkItemSeed<'_> {
    type Value = ResolvedWorkItem;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = WorkItem::deserialize(deserializer)?;
        let handler = self.ctx.registry.resolve(&raw.job).ok_or_else(|| {
            de::Error::custom(format!(
                "unresolved job `{}`: no active bundle provides it",
                raw.job
            ))
        })?;

        Ok(ResolvedWorkItem {
            raw,
            handler,
            definitions: Arc::new(self.ctx.definitions.clone()),
        })
    }
}

/// A work item bound to its handler; invocable with no arguments.
#[derive(Clone)]
pub struct ResolvedWorkItem {
    raw: WorkItem,
    handler: JobFn,
    definitions: Arc<Definitions>,
}

impl ResolvedWorkItem {
    pub fn raw(&self) -> &WorkItem {
        &self.raw
    }

    pub fn invoke(&self) -> ReturnValue {
        let input = JobInput {
            args: self.raw.args.clone(),
            definitions: Arc::clone(&self.definitions),
        };
        (self.handler)(input).into()
    }
}

impl fmt::Debug for ResolvedWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedWorkItem")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}
