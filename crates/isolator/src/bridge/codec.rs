//! Payload codec for request and response payloads.
//!
//! A payload is a flat sequence of values. Each value is one frame: a 4-byte
//! length prefix (LengthDelimitedCodec) followed by the value's JSON bytes.
//!
//! Decoding walks frames by their length prefix alone, so a caller can decode
//! a prefix of the sequence without the rest being parseable yet. The request
//! protocol depends on this: the control frame is decoded and applied before
//! the work item frame is looked at.

use std::io;

use serde_json::Value;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound for a single frame. Larger length prefixes are treated as corruption.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame error")]
    Frame(#[from] io::Error),

    #[error("invalid JSON")]
    Json(#[from] serde_json::Error),

    #[error("payload truncated: wanted {wanted} values, found {found}")]
    Truncated { wanted: usize, found: usize },
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Encode an ordered list of values.
pub fn encode(values: &[Value]) -> Result<Bytes, CodecError> {
    let frames = values
        .iter()
        .map(|value| serde_json::to_vec(value).map(Bytes::from))
        .collect::<Result<Vec<_>, _>>()?;
    encode_frames(frames)
}

/// Encode values that are already serialized to JSON.
pub fn encode_frames(frames: impl IntoIterator<Item = Bytes>) -> Result<Bytes, CodecError> {
    let mut codec = frame_codec();
    let mut dst = BytesMut::new();
    for frame in frames {
        let frame_len = frame.len();
        codec.encode(frame, &mut dst)?;
        tracing::trace!(frame_size_bytes = frame_len, "Encoded payload frame");
    }
    Ok(dst.freeze())
}

/// Decode `count` values starting at value index `start`.
///
/// Frames before `start` are skipped by length without being parsed. Bytes
/// after the last requested frame are never read.
pub fn decode(bytes: &[u8], start: usize, count: usize) -> Result<Vec<Value>, CodecError> {
    decode_raw(bytes, start, count)?
        .iter()
        .map(|frame| serde_json::from_slice(frame).map_err(CodecError::from))
        .collect()
}

/// Like [`decode`], but hands back the undecoded JSON of each frame.
pub fn decode_raw(bytes: &[u8], start: usize, count: usize) -> Result<Vec<Bytes>, CodecError> {
    let mut codec = frame_codec();
    let mut src = BytesMut::from(bytes);
    let mut frames = Vec::with_capacity(count);
    let mut index = 0;

    while frames.len() < count {
        match codec.decode(&mut src)? {
            Some(frame) => {
                if index >= start {
                    frames.push(frame.freeze());
                }
                index += 1;
            }
            None => {
                return Err(CodecError::Truncated {
                    wanted: start + count,
                    found: index,
                });
            }
        }
    }

    Ok(frames)
}
