//! Stateless translation between [`Message`] and wire bytes.
//!
//! Every wire format implements [`Codec`] with the same shape; only the byte-level
//! representation and the width of the call-id space differ:
//!
//! | Format | Codec | Call-id width | Default framing |
//! | --- | --- | --- | --- |
//! | [`WireFormat::MsgPack`] | [`MsgPackCodec`] | 32-bit unsigned | self-delimiting scan |
//! | [`WireFormat::Json`] | [`JsonCodec`] | `2^53 - 1` (exact in IEEE doubles) | self-delimiting scan |
//! | [`WireFormat::Native`] | [`NativeCodec`] | 64-bit unsigned | `u32` length prefix |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, FramingError, Result};
use crate::framer::Framing;
use crate::message::{CallId, Message, Params};

mod json;
mod msgpack;
mod native;

pub use json::{JsonCodec, MAX_SAFE_ID};
pub use msgpack::MsgPackCodec;
pub use native::NativeCodec;

/// Encode/decode pair for one wire format.
pub trait Codec {
	/// The format this codec speaks.
	fn format(&self) -> WireFormat;

	/// Largest call id representable on the wire. Allocation wraps to 0 after it.
	fn id_limit(&self) -> u64;

	/// Encodes one message into the body of a wire frame.
	///
	/// # Errors
	///
	/// Returns [`Error::Encode`] if the serializer fails. Every well-formed [`Message`] encodes.
	fn encode(&self, msg: &Message) -> Result<Vec<u8>>;

	/// Decodes the body of one wire frame.
	///
	/// # Errors
	///
	/// - [`Error::Framing`] when the bytes are not valid in this format.
	/// - [`Error::Protocol`] when they decode to something that is not a valid message, e.g. a
	///   response carrying both a result and an error.
	fn decode(&self, frame: &[u8]) -> Result<Message>;
}

/// Supported wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
	/// msgpack-rpc style arrays.
	#[default]
	MsgPack,
	/// JSON-RPC 2.0 objects.
	Json,
	/// postcard-encoded Rust enums.
	Native,
}

impl WireFormat {
	/// Every format, in declaration order.
	pub const ALL: [Self; 3] = [Self::MsgPack, Self::Json, Self::Native];

	/// Lowercase format name.
	#[must_use]
	pub const fn name(self) -> &'static str {
		match self {
			Self::MsgPack => "msgpack",
			Self::Json => "json",
			Self::Native => "native",
		}
	}

	/// Creates the codec for this format.
	#[must_use]
	pub fn codec(self) -> Box<dyn Codec> {
		match self {
			Self::MsgPack => Box::new(MsgPackCodec),
			Self::Json => Box::new(JsonCodec),
			Self::Native => Box::new(NativeCodec),
		}
	}

	/// Framing used when the configuration does not override it.
	#[must_use]
	pub const fn default_framing(self) -> Framing {
		match self {
			Self::MsgPack => Framing::MsgPack,
			Self::Json => Framing::JsonStream,
			Self::Native => Framing::LengthPrefixed,
		}
	}
}

impl fmt::Display for WireFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for WireFormat {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|format| format.name().eq_ignore_ascii_case(s))
			.ok_or_else(|| format!("unknown wire format '{s}' (expected msgpack, json or native)"))
	}
}

fn malformed(format: &'static str, err: impl fmt::Display) -> Error {
	Error::Framing(FramingError::Malformed {
		format,
		reason: err.to_string(),
	})
}

fn violation(reason: impl Into<String>) -> Error {
	Error::Protocol(reason.into())
}

fn parse_id(value: Value, limit: u64) -> Result<CallId> {
	match value.as_u64() {
		Some(id) if id <= limit => Ok(CallId(id)),
		Some(id) => Err(violation(format!("call id {id} exceeds the limit of {limit}"))),
		None => Err(violation(format!("call id must be a non-negative integer, got {value}"))),
	}
}

fn parse_method(value: Value) -> Result<String> {
	match value {
		Value::String(method) => Ok(method),
		other => Err(violation(format!("method must be a string, got {other}"))),
	}
}

fn parse_params(value: Value) -> Result<Params> {
	match value {
		Value::Array(params) => Ok(params),
		other => Err(violation(format!("params must be an array, got {other}"))),
	}
}

#[cfg(test)]
mod tests;
