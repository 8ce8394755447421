//! Wire protocol between the orchestrator and a worker process.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed JSON value sequences
//! - **control**: bootstrap data applied before the work item is decoded
//! - **request**: `[control, work_item]` payload on the worker's stdin
//! - **response**: separator plus `[capture, telemetry]` payload on the worker's stderr

pub mod codec;
pub mod control;
pub mod request;
pub mod response;
