//! In-memory RPC message model shared by every codec.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResponseError;

/// Ordered positional call parameters.
pub type Params = Vec<Value>;

/// Identifier correlating a request with its response.
///
/// The usable range depends on the codec (see [`crate::Codec::id_limit`]) and may be narrowed per
/// session with [`crate::SessionConfig::id_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// A call whose sender expects exactly one correlated [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
	/// Unique among the sender's outstanding calls.
	pub id: CallId,
	/// Method name looked up in the receiver's request registry.
	pub method: String,
	/// Positional parameters.
	pub params: Params,
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
	/// Id of the request being answered.
	pub id: CallId,
	/// Either the handler's result or the error it raised. Exactly one of the two exists by
	/// construction; decoders reject wire messages that carry both or neither.
	pub result: Result<Value, ResponseError>,
}

/// A one-way message with no id and no response.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
	/// Method name looked up in the receiver's notification registry.
	pub method: String,
	/// Positional parameters.
	pub params: Params,
}

/// Every message that crosses the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	/// An outgoing or incoming call.
	Request(Request),
	/// An answer to a call.
	Response(Response),
	/// A fire-and-forget message.
	Notification(Notification),
}

impl Message {
	/// Builds a request message.
	#[must_use]
	pub fn request(id: CallId, method: impl Into<String>, params: Params) -> Self {
		Self::Request(Request {
			id,
			method: method.into(),
			params,
		})
	}

	/// Builds a successful response message.
	#[must_use]
	pub fn response_ok(id: CallId, result: Value) -> Self {
		Self::Response(Response { id, result: Ok(result) })
	}

	/// Builds an error response message.
	#[must_use]
	pub fn response_err(id: CallId, error: ResponseError) -> Self {
		Self::Response(Response { id, result: Err(error) })
	}

	/// Builds a notification message.
	#[must_use]
	pub fn notification(method: impl Into<String>, params: Params) -> Self {
		Self::Notification(Notification {
			method: method.into(),
			params,
		})
	}

	/// Short name of the message kind, for logs.
	#[must_use]
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::Request(_) => "request",
			Self::Response(_) => "response",
			Self::Notification(_) => "notification",
		}
	}

	/// The call id carried by requests and responses.
	#[must_use]
	pub const fn id(&self) -> Option<CallId> {
		match self {
			Self::Request(req) => Some(req.id),
			Self::Response(resp) => Some(resp.id),
			Self::Notification(_) => None,
		}
	}
}
