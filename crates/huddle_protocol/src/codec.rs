#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::events::{ClientCommand, ServerEvent};

/// Default maximum text frame size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("empty frame")]
	EmptyFrame,

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Encode a wire value into a JSON text frame.
pub fn encode<T: Serialize>(value: &T, max_frame_size: usize) -> Result<String, CodecError> {
	let text = serde_json::to_string(value)?;
	if text.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_default<T: Serialize>(value: &T) -> Result<String, CodecError> {
	encode(value, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a JSON text frame, rejecting oversized input before parsing.
pub fn decode<T: DeserializeOwned>(text: &str, max_frame_size: usize) -> Result<T, CodecError> {
	if text.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	if text.trim().is_empty() {
		return Err(CodecError::EmptyFrame);
	}
	Ok(serde_json::from_str(text)?)
}

#[inline]
pub fn decode_command(text: &str, max_frame_size: usize) -> Result<ClientCommand, CodecError> {
	decode(text, max_frame_size)
}

#[inline]
pub fn decode_event(text: &str, max_frame_size: usize) -> Result<ServerEvent, CodecError> {
	decode(text, max_frame_size)
}
