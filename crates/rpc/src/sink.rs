//! Local reporting of errors that have no caller to receive them.

use std::fmt;

use crate::error::{FramingError, ResponseError};
use crate::message::CallId;

/// A problem observed by a session that is not delivered to any call.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
	/// A response arrived for an id with no outstanding call. The connection survives.
	UnmatchedResponse {
		/// The unknown id.
		id: CallId,
	},
	/// A notification handler returned an error.
	NotificationFailed {
		/// Notification method.
		method: String,
		/// The handler's error.
		error: ResponseError,
	},
	/// A request or notification handler panicked.
	HandlerPanicked {
		/// Method being handled.
		method: String,
		/// Panic payload, when it was a string.
		message: String,
	},
	/// The byte stream could not be framed or decoded. The session closes.
	Framing(FramingError),
	/// A message was semantically invalid. The session closes.
	Protocol(String),
	/// The transport failed to send or receive.
	Transport(String),
}

impl SinkEvent {
	/// Whether the event tears the connection down.
	#[must_use]
	pub const fn is_fatal(&self) -> bool {
		matches!(self, Self::Framing(_) | Self::Protocol(_) | Self::Transport(_))
	}
}

impl fmt::Display for SinkEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::UnmatchedResponse { id } => write!(f, "response for unknown call id {id}"),
			Self::NotificationFailed { method, error } => write!(f, "notification '{method}' failed: {error}"),
			Self::HandlerPanicked { method, message } => write!(f, "handler for '{method}' panicked: {message}"),
			Self::Framing(err) => write!(f, "framing error: {err}"),
			Self::Protocol(reason) => write!(f, "protocol violation: {reason}"),
			Self::Transport(reason) => write!(f, "transport error: {reason}"),
		}
	}
}

/// Receiver of [`SinkEvent`]s.
pub trait ErrorSink {
	/// Records one event. Must not call back into the reporting session.
	fn report(&self, event: SinkEvent);
}

impl<F: Fn(SinkEvent)> ErrorSink for F {
	fn report(&self, event: SinkEvent) {
		self(event);
	}
}

/// Sink that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
	fn report(&self, event: SinkEvent) {
		if event.is_fatal() {
			tracing::error!(event = %event, "rpc.session.fatal");
		} else {
			tracing::warn!(event = %event, "rpc.session.error");
		}
	}
}
