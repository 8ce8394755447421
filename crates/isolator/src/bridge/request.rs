//! Request payload: control data followed by the work item.
//!
//! Decoding is staged. Only the control frame is decoded first, and control is
//! applied before the work item frame is touched, because resolving the work
//! item depends on the bundles control activates.

use serde::de::DeserializeSeed;
use serde_json::Value;
use tokio_util::bytes::Bytes;

use super::codec::{self, CodecError};
use super::control::{Control, ControlData, ControlError};
use crate::job::{ResolvedWorkItem, WorkItem, WorkerContext};

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("failed to decode request payload")]
    Codec(#[from] CodecError),

    #[error("control data must be a mapping, got {0}")]
    ControlShape(&'static str),

    #[error("failed to apply control")]
    Control(#[from] ControlError),

    #[error("failed to decode work item")]
    WorkItem(#[source] serde_json::Error),
}

/// Outbound request, built by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    control: ControlData,
    work_item: WorkItem,
}

impl Request {
    pub fn new(control: impl Into<Control>, work_item: WorkItem) -> Self {
        Self {
            control: control.into().into_data(),
            work_item,
        }
    }

    pub fn control(&self) -> Control {
        Control::new(self.control.clone())
    }

    pub fn work_item(&self) -> &WorkItem {
        &self.work_item
    }

    /// Encode as `[control, work_item]`, control first.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let work_item = serde_json::to_value(&self.work_item)?;
        codec::encode(&[Value::Object(self.control.clone()), work_item])
    }

    /// Decode a request inside the worker, applying its control on the way.
    ///
    /// The work item frame is only read after `Control::apply` succeeded.
    pub fn decode(payload: &[u8], ctx: &mut WorkerContext) -> Result<DecodedRequest, RequestError> {
        let control = match codec::decode(payload, 0, 1)?.pop() {
            Some(Value::Object(map)) => map,
            Some(other) => return Err(RequestError::ControlShape(json_type(&other))),
            None => return Err(CodecError::Truncated { wanted: 1, found: 0 }.into()),
        };

        Control::new(control.clone()).apply(ctx)?;
        tracing::debug!(activated = ?ctx.activated(), "Control applied");

        let raw = codec::decode(payload, 1, 1)?
            .pop()
            .ok_or(CodecError::Truncated { wanted: 2, found: 1 })?;
        let work_item = ctx
            .work_item_seed()
            .deserialize(raw)
            .map_err(RequestError::WorkItem)?;

        Ok(DecodedRequest { control, work_item })
    }
}

/// Request as seen by the worker, after control was applied.
#[derive(Debug)]
pub struct DecodedRequest {
    control: ControlData,
    work_item: ResolvedWorkItem,
}

impl DecodedRequest {
    /// A fresh, unapplied control built from the raw data.
    pub fn control(&self) -> Control {
        Control::new(self.control.clone())
    }

    pub fn control_data(&self) -> &ControlData {
        &self.control
    }

    pub fn work_item(&self) -> &ResolvedWorkItem {
        &self.work_item
    }

    pub fn into_work_item(self) -> ResolvedWorkItem {
        self.work_item
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
