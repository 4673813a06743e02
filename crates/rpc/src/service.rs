//! Method and notification registries.
//!
//! A [`Service`] is built once with a [`ServiceBuilder`] and then shared read-only by every
//! session that serves it. Handlers receive the session the message arrived on, so they can
//! issue calls back to the peer.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ErrorCode, ResponseError};
use crate::message::{CallId, Params};
use crate::session::{Session, WeakSession};

/// What a request handler produces.
pub type HandlerResult = Result<Value, ResponseError>;

/// Answers requests synchronously.
pub trait RequestHandler {
	/// Handles one request.
	fn call(&self, session: &Session, params: Params) -> HandlerResult;
}

impl<F> RequestHandler for F
where
	F: Fn(&Session, Params) -> HandlerResult,
{
	fn call(&self, session: &Session, params: Params) -> HandlerResult {
		self(session, params)
	}
}

/// Answers requests later through a [`Responder`].
pub trait DeferredHandler {
	/// Starts handling one request. The answer goes through `responder`.
	fn call(&self, session: &Session, params: Params, responder: Responder);
}

impl<F> DeferredHandler for F
where
	F: Fn(&Session, Params, Responder),
{
	fn call(&self, session: &Session, params: Params, responder: Responder) {
		self(session, params, responder);
	}
}

/// Handles notifications. Errors go to the receiving session's error sink.
pub trait NotificationHandler {
	/// Handles one notification.
	fn notify(&self, session: &Session, params: Params) -> Result<(), ResponseError>;
}

impl<F> NotificationHandler for F
where
	F: Fn(&Session, Params) -> Result<(), ResponseError>,
{
	fn notify(&self, session: &Session, params: Params) -> Result<(), ResponseError> {
		self(session, params)
	}
}

#[derive(Clone)]
pub(crate) enum Method {
	Immediate(Rc<dyn RequestHandler>),
	Deferred(Rc<dyn DeferredHandler>),
}

/// Immutable handler registries.
#[derive(Default)]
pub struct Service {
	methods: HashMap<String, Method>,
	notifications: HashMap<String, Rc<dyn NotificationHandler>>,
}

impl Service {
	/// Starts an empty registry.
	#[must_use]
	pub fn builder() -> ServiceBuilder {
		ServiceBuilder::default()
	}

	/// A service without handlers, for pure clients.
	#[must_use]
	pub fn empty() -> Rc<Self> {
		Rc::new(Self::default())
	}

	/// Whether a request handler is registered under `name`.
	#[must_use]
	pub fn has_method(&self, name: &str) -> bool {
		self.methods.contains_key(name)
	}

	/// Whether a notification handler is registered under `name`.
	#[must_use]
	pub fn has_notification(&self, name: &str) -> bool {
		self.notifications.contains_key(name)
	}

	/// Registered request method names, sorted.
	#[must_use]
	pub fn method_names(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}

	pub(crate) fn method(&self, name: &str) -> Option<Method> {
		self.methods.get(name).cloned()
	}

	pub(crate) fn notification(&self, name: &str) -> Option<Rc<dyn NotificationHandler>> {
		self.notifications.get(name).cloned()
	}
}

impl fmt::Debug for Service {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut notifications: Vec<&str> = self.notifications.keys().map(String::as_str).collect();
		notifications.sort_unstable();
		f.debug_struct("Service")
			.field("methods", &self.method_names())
			.field("notifications", &notifications)
			.finish()
	}
}

/// Collects handlers into a [`Service`]. Registering a name twice replaces the first handler.
#[derive(Default)]
pub struct ServiceBuilder {
	methods: HashMap<String, Method>,
	notifications: HashMap<String, Rc<dyn NotificationHandler>>,
}

impl ServiceBuilder {
	/// Registers a synchronous request handler.
	#[must_use]
	pub fn register_method<F>(self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(&Session, Params) -> HandlerResult + 'static,
	{
		self.method_handler(name, Rc::new(handler))
	}

	/// Registers a request handler that answers through a [`Responder`].
	#[must_use]
	pub fn register_deferred<F>(self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(&Session, Params, Responder) + 'static,
	{
		self.deferred_handler(name, Rc::new(handler))
	}

	/// Registers a notification handler.
	#[must_use]
	pub fn register_notification<F>(self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(&Session, Params) -> Result<(), ResponseError> + 'static,
	{
		self.notification_handler(name, Rc::new(handler))
	}

	/// Registers a shared [`RequestHandler`].
	#[must_use]
	pub fn method_handler(mut self, name: impl Into<String>, handler: Rc<dyn RequestHandler>) -> Self {
		self.insert_method(name.into(), Method::Immediate(handler));
		self
	}

	/// Registers a shared [`DeferredHandler`].
	#[must_use]
	pub fn deferred_handler(mut self, name: impl Into<String>, handler: Rc<dyn DeferredHandler>) -> Self {
		self.insert_method(name.into(), Method::Deferred(handler));
		self
	}

	/// Registers a shared [`NotificationHandler`].
	#[must_use]
	pub fn notification_handler(mut self, name: impl Into<String>, handler: Rc<dyn NotificationHandler>) -> Self {
		let name = name.into();
		if self.notifications.insert(name.clone(), handler).is_some() {
			tracing::debug!(method = %name, "rpc.service.notification_replaced");
		}
		self
	}

	fn insert_method(&mut self, name: String, method: Method) {
		if self.methods.insert(name.clone(), method).is_some() {
			tracing::debug!(method = %name, "rpc.service.method_replaced");
		}
	}

	/// Freezes the registries.
	#[must_use]
	pub fn build(self) -> Rc<Service> {
		Rc::new(Service {
			methods: self.methods,
			notifications: self.notifications,
		})
	}
}

/// The answer slot of a request handled by a [`DeferredHandler`].
///
/// Dropping a responder without answering sends an [`ErrorCode::INTERNAL_ERROR`] response so
/// the caller is not left waiting.
pub struct Responder {
	session: WeakSession,
	id: CallId,
	method: String,
	answered: bool,
}

impl Responder {
	pub(crate) fn new(session: WeakSession, id: CallId, method: String) -> Self {
		Self {
			session,
			id,
			method,
			answered: false,
		}
	}

	/// Id of the request being answered.
	#[must_use]
	pub const fn id(&self) -> CallId {
		self.id
	}

	/// Method of the request being answered.
	#[must_use]
	pub fn method(&self) -> &str {
		&self.method
	}

	/// Sends the response. Does nothing if the session has closed meanwhile.
	pub fn respond(mut self, result: HandlerResult) {
		self.answered = true;
		self.send(result);
	}

	/// Sends a successful response.
	pub fn ok(self, value: Value) {
		self.respond(Ok(value));
	}

	/// Sends an error response.
	pub fn err(self, error: ResponseError) {
		self.respond(Err(error));
	}

	fn send(&self, result: HandlerResult) {
		if let Some(session) = self.session.upgrade() {
			session.send_response(self.id, result);
		}
	}
}

impl Drop for Responder {
	fn drop(&mut self) {
		if !self.answered {
			self.send(Err(ResponseError::new(
				ErrorCode::INTERNAL_ERROR,
				format!("handler for '{}' dropped the request without answering", self.method),
			)));
		}
	}
}

impl fmt::Debug for Responder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Responder")
			.field("id", &self.id)
			.field("method", &self.method)
			.field("answered", &self.answered)
			.finish_non_exhaustive()
	}
}

/// Deserializes positional parameters into `T`, typically a tuple.
///
/// # Errors
///
/// An [`ErrorCode::INVALID_PARAMS`] error describing the mismatch.
pub fn decode_params<T: DeserializeOwned>(params: Params) -> Result<T, ResponseError> {
	serde_json::from_value(Value::Array(params)).map_err(|e| ResponseError::invalid_params(e.to_string()))
}

/// Serializes a handler's return value.
///
/// # Errors
///
/// An [`ErrorCode::INTERNAL_ERROR`] error when `value` cannot be represented.
pub fn encode_result<T: Serialize>(value: &T) -> HandlerResult {
	serde_json::to_value(value).map_err(|e| ResponseError::internal(e.to_string()))
}
