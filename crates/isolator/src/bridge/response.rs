//! Response payload, written by the worker to its stderr.
//!
//! Stderr layout: any amount of incidental diagnostic text, then
//! [`STDERR_VALUE_SEPARATOR`], then the encoded `[capture, telemetry]` pair.
//!
//! The orchestrator only parses once it has the full capture. Three cases:
//! - separator present: decode the payload after it; leading bytes are noise
//! - nothing at all: the worker died silently
//! - text but no separator: the worker crashed; recover an error from the text

use std::io::Write;

use tokio_util::bytes::Bytes;

use super::codec::{self, CodecError};
use crate::outcome::{ErrorValue, ReturnValue};
use crate::stderr::StderrStream;
use crate::telemetry::Telemetry;

/// Marks the start of the protocol payload on the worker's stderr.
pub const STDERR_VALUE_SEPARATOR: &[u8] = b"\r\n\r\n#|worker-stderr-output|#\r\n\r\n";

/// Deferred return value: holds the encoded value until [`Capture::invoke`] is called.
#[derive(Debug, Clone)]
pub struct Capture {
    frame: Bytes,
}

impl Capture {
    pub fn of(value: &ReturnValue) -> Result<Self, CodecError> {
        Ok(Self {
            frame: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    pub fn invoke(&self) -> Result<ReturnValue, CodecError> {
        Ok(serde_json::from_slice(&self.frame)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    return_value: ReturnValue,
    exit_code: i32,
    telemetry: Telemetry,
    stderr_length: usize,
    has_payload: bool,
}

impl Response {
    /// Build a response. Without an explicit exit code it is 1 for errors, 0 otherwise.
    pub fn new(return_value: ReturnValue, exit_code: Option<i32>, telemetry: Telemetry) -> Self {
        let exit_code = exit_code.unwrap_or(if return_value.is_error() { 1 } else { 0 });
        Self {
            return_value,
            exit_code,
            telemetry,
            stderr_length: 0,
            has_payload: false,
        }
    }

    /// Encode `[capture, telemetry]`, with peak memory usage measured now.
    ///
    /// The separator is not included; see [`Response::write_to`].
    pub fn build_payload(&self) -> Result<Bytes, CodecError> {
        let capture = Capture::of(&self.return_value)?;
        let telemetry = self.telemetry.clone().with_memory_peak_usage();
        codec::encode_frames([capture.frame, Bytes::from(serde_json::to_vec(&telemetry)?)])
    }

    /// Write the separator followed by the payload.
    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let payload = self
            .build_payload()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        out.write_all(STDERR_VALUE_SEPARATOR)?;
        out.write_all(&payload)?;
        out.flush()
    }

    /// Parse a worker's complete stderr capture.
    ///
    /// Worker-side failures always produce a `Response`. Only a payload that is
    /// present but undecodable is an error. Unframed text is decoded lossily
    /// before recovery, see [`StderrStream`].
    pub fn parse(stderr: &[u8]) -> Result<Self, CodecError> {
        let Some(separator_pos) = find(stderr, STDERR_VALUE_SEPARATOR) else {
            if stderr.is_empty() {
                tracing::debug!("Worker produced no stderr output");
                return Ok(Self::new(ReturnValue::none(), Some(1), Telemetry::default()));
            }

            let text = String::from_utf8_lossy(stderr);
            let error = StderrStream::new(&text).error_value();
            tracing::debug!(kind = %error.kind, "Recovered error from worker stderr");
            return Ok(Self::new(ReturnValue::Error(error), Some(1), Telemetry::default()));
        };

        let payload = &stderr[separator_pos + STDERR_VALUE_SEPARATOR.len()..];
        let mut frames = codec::decode_raw(payload, 0, 2)?.into_iter();
        let (Some(capture), Some(telemetry)) = (frames.next(), frames.next()) else {
            return Err(CodecError::Truncated { wanted: 2, found: 0 });
        };

        let telemetry: Option<Telemetry> = serde_json::from_slice(&telemetry)?;
        let return_value = Capture { frame: capture }.invoke()?;

        let mut response = Self::new(return_value, None, telemetry.unwrap_or_default());
        response.stderr_length = separator_pos;
        response.has_payload = true;
        Ok(response)
    }

    pub fn return_value(&self) -> &ReturnValue {
        &self.return_value
    }

    pub fn into_return_value(self) -> ReturnValue {
        self.return_value
    }

    pub fn error(&self) -> Option<&ErrorValue> {
        self.return_value.as_error()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Bytes of diagnostic output written before the payload separator.
    pub fn stderr_length(&self) -> usize {
        self.stderr_length
    }

    /// Whether the worker wrote a protocol payload at all.
    pub fn has_payload(&self) -> bool {
        self.has_payload
    }

    pub(crate) fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
