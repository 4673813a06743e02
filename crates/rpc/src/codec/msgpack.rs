//! msgpack-rpc arrays.
//!
//! * Request: `[0, id, method, params]`
//! * Response: `[1, id, error, result]`, `error` nil on success
//! * Notification: `[2, method, params]`
//!
//! Call ids are 32-bit unsigned as in msgpack-rpc. A nil result is a legitimate return value, so a
//! response with both slots nil decodes as `Ok(null)`; only a response with both slots set is
//! rejected.

use serde_json::Value;

use super::{Codec, WireFormat, malformed, parse_id, parse_method, parse_params, violation};
use crate::error::{ResponseError, Result};
use crate::message::Message;

const REQUEST: u8 = 0;
const RESPONSE: u8 = 1;
const NOTIFICATION: u8 = 2;

/// Codec for [`WireFormat::MsgPack`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
	fn format(&self) -> WireFormat {
		WireFormat::MsgPack
	}

	fn id_limit(&self) -> u64 {
		u64::from(u32::MAX)
	}

	fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
		let bytes = match msg {
			Message::Request(req) => rmp_serde::to_vec(&(REQUEST, req.id.0, &req.method, &req.params)),
			Message::Response(resp) => match &resp.result {
				Ok(result) => rmp_serde::to_vec(&(RESPONSE, resp.id.0, (), result)),
				Err(err) => rmp_serde::to_vec(&(RESPONSE, resp.id.0, err.to_value(), ())),
			},
			Message::Notification(notif) => rmp_serde::to_vec(&(NOTIFICATION, &notif.method, &notif.params)),
		};
		bytes.map_err(|e| crate::Error::Encode(e.to_string()))
	}

	fn decode(&self, frame: &[u8]) -> Result<Message> {
		let items: Vec<Value> = rmp_serde::from_slice(frame).map_err(|e| malformed("msgpack", e))?;
		let tag = items.first().and_then(Value::as_u64).and_then(|t| u8::try_from(t).ok());

		match tag {
			Some(REQUEST) => {
				let [_, id, method, params] = arity(items, "request")?;
				Ok(Message::request(
					parse_id(id, self.id_limit())?,
					parse_method(method)?,
					parse_params(params)?,
				))
			}
			Some(RESPONSE) => {
				let [_, id, error, result] = arity(items, "response")?;
				let id = parse_id(id, self.id_limit())?;
				match (error, result) {
					(Value::Null, result) => Ok(Message::response_ok(id, result)),
					(error, Value::Null) => Ok(Message::response_err(id, ResponseError::from_value(error))),
					(_, _) => Err(violation(format!("response {id} carries both an error and a result"))),
				}
			}
			Some(NOTIFICATION) => {
				let [_, method, params] = arity(items, "notification")?;
				Ok(Message::notification(parse_method(method)?, parse_params(params)?))
			}
			_ => Err(violation(format!(
				"unknown message type {}",
				items.first().map_or_else(|| "(empty array)".to_string(), Value::to_string)
			))),
		}
	}
}

fn arity<const N: usize>(items: Vec<Value>, kind: &str) -> Result<[Value; N]> {
	let len = items.len();
	items
		.try_into()
		.map_err(|_| violation(format!("{kind} must have {N} elements, got {len}")))
}
