//! JSON-RPC 2.0 objects.
//!
//! Only integer ids are produced and accepted, bounded by [`MAX_SAFE_ID`] so that peers using
//! IEEE doubles for numbers correlate them exactly. Parameters are positional; by-name parameter
//! objects and batch arrays are rejected as protocol violations.

use serde::Serialize;
use serde_json::Value;

use super::{Codec, WireFormat, malformed, parse_id, parse_method, parse_params, violation};
use crate::error::{ResponseError, Result};
use crate::message::{Message, Params};

/// Largest integer exactly representable in an IEEE-754 double.
pub const MAX_SAFE_ID: u64 = (1 << 53) - 1;

const VERSION: &str = "2.0";

/// Codec for [`WireFormat::Json`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

#[derive(Serialize)]
struct RequestOut<'a> {
	jsonrpc: &'static str,
	id: u64,
	method: &'a str,
	params: &'a Params,
}

#[derive(Serialize)]
struct NotificationOut<'a> {
	jsonrpc: &'static str,
	method: &'a str,
	params: &'a Params,
}

#[derive(Serialize)]
struct ResponseOut<'a> {
	jsonrpc: &'static str,
	id: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	result: Option<&'a Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<&'a ResponseError>,
}

impl Codec for JsonCodec {
	fn format(&self) -> WireFormat {
		WireFormat::Json
	}

	fn id_limit(&self) -> u64 {
		MAX_SAFE_ID
	}

	fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
		let bytes = match msg {
			Message::Request(req) => serde_json::to_vec(&RequestOut {
				jsonrpc: VERSION,
				id: req.id.0,
				method: &req.method,
				params: &req.params,
			}),
			Message::Response(resp) => serde_json::to_vec(&ResponseOut {
				jsonrpc: VERSION,
				id: resp.id.0,
				result: resp.result.as_ref().ok(),
				error: resp.result.as_ref().err(),
			}),
			Message::Notification(notif) => serde_json::to_vec(&NotificationOut {
				jsonrpc: VERSION,
				method: &notif.method,
				params: &notif.params,
			}),
		};
		bytes.map_err(|e| crate::Error::Encode(e.to_string()))
	}

	fn decode(&self, frame: &[u8]) -> Result<Message> {
		let value: Value = serde_json::from_slice(frame).map_err(|e| malformed("json", e))?;
		let Value::Object(mut obj) = value else {
			return Err(violation("expected a JSON-RPC object (batches are not supported)"));
		};

		match obj.remove("jsonrpc") {
			Some(Value::String(version)) if version == VERSION => {}
			Some(other) => return Err(violation(format!("unsupported jsonrpc version {other}"))),
			None => return Err(violation("missing jsonrpc version")),
		}

		if let Some(method) = obj.remove("method") {
			let method = parse_method(method)?;
			let params = match obj.remove("params") {
				Some(params) => parse_params(params)?,
				None => Vec::new(),
			};
			return match obj.remove("id") {
				Some(id) => Ok(Message::request(parse_id(id, self.id_limit())?, method, params)),
				None => Ok(Message::notification(method, params)),
			};
		}

		let id = obj
			.remove("id")
			.ok_or_else(|| violation("message has neither a method nor an id"))?;
		let id = parse_id(id, self.id_limit())?;
		match (obj.remove("result"), obj.remove("error")) {
			(Some(result), None) => Ok(Message::response_ok(id, result)),
			(None, Some(error)) => Ok(Message::response_err(id, ResponseError::from_value(error))),
			(Some(_), Some(_)) => Err(violation(format!("response {id} carries both result and error"))),
			(None, None) => Err(violation(format!("response {id} carries neither result nor error"))),
		}
	}
}
