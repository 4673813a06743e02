//! Error taxonomy.
//!
//! Errors come at three scopes:
//! * [`Error`]: connection-level. Framing and protocol violations tear the session down because
//!   parsing can no longer be trusted.
//! * [`CallError`]: delivered to a single call's continuation and nothing else.
//! * [`ResponseError`]: the error payload carried inside a response on the wire.

use std::fmt;
use std::io;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::message::CallId;

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Connection-level errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The byte stream could not be split into messages or a message could not be parsed.
	#[error("framing error: {0}")]
	Framing(#[from] FramingError),
	/// A message decoded but is semantically invalid (both result and error, unknown tag, ...).
	#[error("protocol violation: {0}")]
	Protocol(String),
	/// A message could not be encoded.
	#[error("encode failed: {0}")]
	Encode(String),
	/// Input/output errors from the transport or the reactor.
	#[error("{0}")]
	Io(#[from] io::Error),
	/// Invalid session configuration.
	#[error("invalid configuration: {0}")]
	Config(String),
	/// The session was already closed.
	#[error("session closed")]
	Closed,
}

impl Error {
	/// Returns true for errors that desynchronize the byte stream.
	#[must_use]
	pub const fn is_fatal(&self) -> bool {
		matches!(self, Self::Framing(_) | Self::Protocol(_) | Self::Io(_))
	}
}

/// Malformed or invalid byte sequences.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
	/// The frame boundaries were found but the payload does not parse in the wire format.
	#[error("malformed {format} message: {reason}")]
	Malformed {
		/// Wire format name.
		format: &'static str,
		/// Parser diagnostic.
		reason: String,
	},
	/// A declared or scanned frame exceeds the configured limit.
	#[error("frame of {len} bytes exceeds the {limit} byte limit")]
	TooLarge {
		/// Size the frame needs.
		len: usize,
		/// Configured maximum.
		limit: usize,
	},
	/// The stream starts with a byte that can never begin a message in this framing.
	#[error("unexpected byte 0x{byte:02x} at the start of a {format} frame")]
	UnexpectedByte {
		/// Framing name.
		format: &'static str,
		/// Offending byte.
		byte: u8,
	},
	/// A header-delimited frame carried an invalid header block.
	#[error("invalid frame header: {0}")]
	Header(String),
}

/// Numeric error code carried in a [`ResponseError`].
///
/// The predefined codes follow JSON-RPC 2.0 so that JSON peers understand them; the same values
/// are used by every wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i64);

impl ErrorCode {
	/// Invalid bytes received by the peer.
	pub const PARSE_ERROR: Self = Self(-32700);
	/// The message is not a valid request.
	pub const INVALID_REQUEST: Self = Self(-32600);
	/// No request handler is registered for the method.
	pub const METHOD_NOT_FOUND: Self = Self(-32601);
	/// The parameters do not fit the handler.
	pub const INVALID_PARAMS: Self = Self(-32602);
	/// The handler failed without producing an application error.
	pub const INTERNAL_ERROR: Self = Self(-32603);
	/// Generic application-level failure raised by a handler.
	pub const APPLICATION_ERROR: Self = Self(-32000);
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// Error payload of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
	/// Error class.
	pub code: ErrorCode,
	/// Human readable description.
	pub message: String,
	/// Optional structured details. `Some(Value::Null)` survives a round trip.
	#[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
	pub data: Option<Value>,
}

fn present<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<Value>, D::Error> {
	Value::deserialize(de).map(Some)
}

impl ResponseError {
	/// Creates an error without data.
	#[must_use]
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
			data: None,
		}
	}

	/// Creates an [`ErrorCode::APPLICATION_ERROR`].
	#[must_use]
	pub fn application(message: impl Into<String>) -> Self {
		Self::new(ErrorCode::APPLICATION_ERROR, message)
	}

	/// Creates an [`ErrorCode::METHOD_NOT_FOUND`] error for `method`.
	#[must_use]
	pub fn method_not_found(method: &str) -> Self {
		Self::new(ErrorCode::METHOD_NOT_FOUND, format!("method not found: {method}"))
	}

	/// Creates an [`ErrorCode::INVALID_PARAMS`] error.
	#[must_use]
	pub fn invalid_params(message: impl Into<String>) -> Self {
		Self::new(ErrorCode::INVALID_PARAMS, message)
	}

	/// Creates an [`ErrorCode::INTERNAL_ERROR`] error.
	#[must_use]
	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(ErrorCode::INTERNAL_ERROR, message)
	}

	/// Attaches structured details.
	#[must_use]
	pub fn with_data(mut self, data: Value) -> Self {
		self.data = Some(data);
		self
	}

	/// Converts to the `{code, message, data?}` wire value.
	#[must_use]
	pub fn to_value(&self) -> Value {
		let mut map = Map::new();
		map.insert("code".into(), Value::from(self.code.0));
		map.insert("message".into(), Value::String(self.message.clone()));
		if let Some(data) = &self.data {
			map.insert("data".into(), data.clone());
		}
		Value::Object(map)
	}

	/// Interprets an error value received from a peer.
	///
	/// Values in the `{code, message, data?}` shape map back exactly. Anything else (msgpack peers
	/// may send a bare string) becomes an [`ErrorCode::APPLICATION_ERROR`] whose data holds the
	/// original value.
	#[must_use]
	pub fn from_value(value: Value) -> Self {
		if value.is_object()
			&& let Ok(err) = serde_json::from_value::<Self>(value.clone())
		{
			return err;
		}
		let message = match &value {
			Value::String(s) => s.clone(),
			other => other.to_string(),
		};
		Self::application(message).with_data(value)
	}
}

/// Errors observed by the issuer of a single call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
	/// The remote handler raised an error, or the method does not exist on the peer.
	#[error("{0}")]
	Application(#[from] ResponseError),
	/// No response arrived before the call's deadline.
	#[error("call {0} timed out")]
	Timeout(CallId),
	/// The connection closed before a response arrived, or was already closed.
	#[error("connection closed")]
	ConnectionClosed,
	/// Every call id in the configured range is outstanding.
	#[error("no free call id: all ids up to {limit} are outstanding")]
	IdSpaceExhausted {
		/// Largest id of the space.
		limit: u64,
	},
	/// The request could not be encoded.
	#[error("failed to encode call: {0}")]
	Encode(String),
}

impl CallError {
	/// The remote error code, for [`CallError::Application`].
	#[must_use]
	pub const fn code(&self) -> Option<ErrorCode> {
		match self {
			Self::Application(err) => Some(err.code),
			_ => None,
		}
	}
}
