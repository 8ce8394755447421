//! Worker side of the protocol - runs inside the spawned process.
//!
//! The orchestrator side (spawning, collecting output) is in orchestrator.rs.
//! A worker handles exactly one request: decode it from the stdin payload,
//! run the work item, write the response to stderr.

use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crate::bridge::request::{Request, RequestError};
use crate::bridge::response::Response;
use crate::job::WorkerContext;
use crate::orchestrator::REQUEST_ID_ENV;
use crate::outcome::{ErrorValue, ReturnValue};
use crate::telemetry::Telemetry;
use crate::version::ISOLATOR_VERSION;

/// Telemetry key for the job's wall-clock run time in seconds.
pub const EXECUTION_TIME: &str = "executionTime";
/// Telemetry key for the worker library version.
pub const WORKER_VERSION: &str = "workerVersion";

/// Failures before a response could be written.
///
/// The caller reports these as plain diagnostic text; the orchestrator
/// recovers them through its fallback path.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to read request")]
    Read(#[source] io::Error),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("failed to write response")]
    Write(#[source] io::Error),
}

/// Run one request and write its response to `stderr`.
///
/// Returns the exit code the process should terminate with.
pub fn execute<W: Write>(
    ctx: &mut WorkerContext,
    payload: &[u8],
    stderr: &mut W,
) -> Result<i32, WorkerError> {
    let request = Request::decode(payload, ctx)?;
    let work_item = request.into_work_item();
    let request_id = std::env::var(REQUEST_ID_ENV).ok();

    tracing::debug!(job = %work_item.raw().job, request_id = ?request_id, "Running work item");

    let started = Instant::now();
    let return_value = panic::catch_unwind(AssertUnwindSafe(|| work_item.invoke()))
        .unwrap_or_else(|payload| ReturnValue::Error(panic_error(payload)));
    let elapsed = started.elapsed();

    if let Some(error) = return_value.as_error() {
        tracing::debug!(kind = %error.kind, message = %error.message, "Work item failed");
    }

    let mut telemetry = Telemetry::new()
        .with(EXECUTION_TIME, elapsed.as_secs_f64())
        .with(WORKER_VERSION, ISOLATOR_VERSION);
    if let Some(id) = request_id {
        telemetry.insert("requestId", id);
    }

    let response = Response::new(return_value, None, telemetry);
    response.write_to(stderr).map_err(WorkerError::Write)?;
    Ok(response.exit_code())
}

/// Read the whole request payload from `input`, then [`execute`] it.
pub fn execute_from<R: io::Read, W: Write>(
    ctx: &mut WorkerContext,
    input: &mut R,
    stderr: &mut W,
) -> Result<i32, WorkerError> {
    let mut payload = Vec::new();
    input.read_to_end(&mut payload).map_err(WorkerError::Read)?;
    execute(ctx, &payload, stderr)
}

fn panic_error(payload: Box<dyn Any + Send>) -> ErrorValue {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    };
    ErrorValue::new("Panic", message)
}
