//! isolator: run units of work in freshly spawned worker processes.
//!
//! The orchestrator encodes a request, hands it to a worker over stdin and
//! reads the response back from the worker's stderr, recovering an error from
//! plain diagnostic text when the worker crashed before replying.

pub mod bridge;
pub mod job;
pub mod orchestrator;
pub mod outcome;
pub mod stderr;
pub mod telemetry;
mod version;
pub mod worker;

pub use bridge::control::{Control, ControlData, ControlError};
pub use bridge::request::{DecodedRequest, Request, RequestError};
pub use bridge::response::{Capture, Response, STDERR_VALUE_SEPARATOR};
pub use job::{Bundle, Catalog, JobInput, JobRegistry, ResolvedWorkItem, WorkItem, WorkerContext};
pub use orchestrator::{
    BinarySpawner, Orchestrator, OrchestratorConfig, OrchestratorError, RequestId, WorkerOutcome,
    WorkerSpawner,
};
pub use outcome::{ErrorValue, ReturnValue};
pub use stderr::StderrStream;
pub use telemetry::Telemetry;
pub use version::ISOLATOR_VERSION;
pub use worker::{WorkerError, execute};
