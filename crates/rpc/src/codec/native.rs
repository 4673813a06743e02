//! postcard-encoded Rust enums.
//!
//! postcard is not self-describing, so dynamic values travel as an explicit [`NativeValue`] tree
//! instead of going through `serde_json::Value`'s `deserialize_any`. Frames need an external
//! length prefix (see [`crate::Framing::LengthPrefixed`]).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::{Codec, WireFormat, malformed, violation};
use crate::error::{ErrorCode, ResponseError, Result};
use crate::message::{CallId, Message};

/// Codec for [`WireFormat::Native`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCodec;

#[derive(Serialize, Deserialize)]
enum Frame {
	Request {
		id: u64,
		method: String,
		params: Vec<NativeValue>,
	},
	Response {
		id: u64,
		result: Option<NativeValue>,
		error: Option<NativeError>,
	},
	Notification {
		method: String,
		params: Vec<NativeValue>,
	},
}

#[derive(Serialize, Deserialize)]
struct NativeError {
	code: i64,
	message: String,
	data: Option<NativeValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum NativeValue {
	Null,
	Bool(bool),
	Int(i64),
	UInt(u64),
	Float(f64),
	Str(String),
	Array(Vec<NativeValue>),
	Map(Vec<(String, NativeValue)>),
}

impl From<&Value> for NativeValue {
	fn from(value: &Value) -> Self {
		match value {
			Value::Null => Self::Null,
			Value::Bool(b) => Self::Bool(*b),
			Value::Number(n) => {
				if let Some(u) = n.as_u64() {
					Self::UInt(u)
				} else if let Some(i) = n.as_i64() {
					Self::Int(i)
				} else {
					n.as_f64().map_or(Self::Null, Self::Float)
				}
			}
			Value::String(s) => Self::Str(s.clone()),
			Value::Array(items) => Self::Array(items.iter().map(Self::from).collect()),
			Value::Object(map) => Self::Map(map.iter().map(|(k, v)| (k.clone(), Self::from(v))).collect()),
		}
	}
}

impl From<NativeValue> for Value {
	fn from(value: NativeValue) -> Self {
		match value {
			NativeValue::Null => Self::Null,
			NativeValue::Bool(b) => Self::Bool(b),
			NativeValue::Int(i) => Self::from(i),
			NativeValue::UInt(u) => Self::from(u),
			NativeValue::Float(f) => Number::from_f64(f).map_or(Self::Null, Self::Number),
			NativeValue::Str(s) => Self::String(s),
			NativeValue::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
			NativeValue::Map(entries) => Self::Object(entries.into_iter().map(|(k, v)| (k, Self::from(v))).collect::<Map<_, _>>()),
		}
	}
}

fn to_native(params: &[Value]) -> Vec<NativeValue> {
	params.iter().map(NativeValue::from).collect()
}

fn from_native(params: Vec<NativeValue>) -> Vec<Value> {
	params.into_iter().map(Value::from).collect()
}

impl Codec for NativeCodec {
	fn format(&self) -> WireFormat {
		WireFormat::Native
	}

	fn id_limit(&self) -> u64 {
		u64::MAX
	}

	fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
		let frame = match msg {
			Message::Request(req) => Frame::Request {
				id: req.id.0,
				method: req.method.clone(),
				params: to_native(&req.params),
			},
			Message::Response(resp) => match &resp.result {
				Ok(result) => Frame::Response {
					id: resp.id.0,
					result: Some(NativeValue::from(result)),
					error: None,
				},
				Err(err) => Frame::Response {
					id: resp.id.0,
					result: None,
					error: Some(NativeError {
						code: err.code.0,
						message: err.message.clone(),
						data: err.data.as_ref().map(NativeValue::from),
					}),
				},
			},
			Message::Notification(notif) => Frame::Notification {
				method: notif.method.clone(),
				params: to_native(&notif.params),
			},
		};
		postcard::to_stdvec(&frame).map_err(|e| crate::Error::Encode(e.to_string()))
	}

	fn decode(&self, bytes: &[u8]) -> Result<Message> {
		let (frame, rest) = postcard::take_from_bytes::<Frame>(bytes).map_err(|e| malformed("native", e))?;
		if !rest.is_empty() {
			return Err(malformed("native", format!("{} trailing bytes after message", rest.len())));
		}

		Ok(match frame {
			Frame::Request { id, method, params } => Message::request(CallId(id), method, from_native(params)),
			Frame::Notification { method, params } => Message::notification(method, from_native(params)),
			Frame::Response { id, result, error } => match (result, error) {
				(Some(result), None) => Message::response_ok(CallId(id), result.into()),
				(None, Some(err)) => Message::response_err(
					CallId(id),
					ResponseError {
						code: ErrorCode(err.code),
						message: err.message,
						data: err.data.map(Value::from),
					},
				),
				(Some(_), Some(_)) => return Err(violation(format!("response {id} carries both result and error"))),
				(None, None) => return Err(violation(format!("response {id} carries neither result nor error"))),
			},
		})
	}
}
