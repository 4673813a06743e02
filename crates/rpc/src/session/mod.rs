//! Per-connection dispatcher.
//!
//! A [`Session`] owns everything one connection needs: codec, framer, pending-call table,
//! transport and error sink. Inbound bytes enter through [`Session::data_received`]; each
//! extracted message is dispatched in wire order. No `RefCell` borrow is held while a handler,
//! continuation or transport runs, so all of them may call back into the session, including
//! blocking calls that re-enter the reactor (see [`Session::call`]).

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::codec::Codec;
use crate::config::SessionConfig;
use crate::error::{CallError, Error, ResponseError, Result};
use crate::framer::{Framer, Framing};
use crate::message::{CallId, Message, Notification, Params, Request, Response};
use crate::pending::PendingCalls;
use crate::reactor::Reactor;
use crate::service::{Method, Responder, Service};
use crate::sink::{ErrorSink, SinkEvent, TracingSink};
use crate::transport::Transport;

mod driver;

pub use driver::PendingReply;

/// Message counters of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
	/// Requests received from the peer.
	pub requests_received: u64,
	/// Notifications received from the peer.
	pub notifications_received: u64,
	/// Responses that completed an outstanding call.
	pub responses_matched: u64,
	/// Responses for ids with no outstanding call.
	pub unmatched_responses: u64,
	/// Calls that expired before their response.
	pub timeouts: u64,
	/// Requests sent to the peer.
	pub calls_sent: u64,
	/// Notifications sent to the peer.
	pub notifications_sent: u64,
}

struct SessionInner {
	label: String,
	config: SessionConfig,
	framing: Framing,
	codec: Box<dyn Codec>,
	framer: RefCell<Framer>,
	pending: RefCell<PendingCalls>,
	service: Rc<Service>,
	reactor: Rc<dyn Reactor>,
	transport: RefCell<Option<Rc<dyn Transport>>>,
	sink: Rc<dyn ErrorSink>,
	stats: Cell<SessionStats>,
	open: Cell<bool>,
	depth: Cell<usize>,
}

/// Handle to one connection's RPC state. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session(Rc<SessionInner>);

/// Non-owning reference to a [`Session`].
#[derive(Clone, Default)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
	/// The session, if it is still alive.
	#[must_use]
	pub fn upgrade(&self) -> Option<Session> {
		self.0.upgrade().map(Session)
	}
}

impl fmt::Debug for WeakSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("WeakSession")
	}
}

/// Configures and creates a [`Session`].
pub struct SessionBuilder {
	reactor: Rc<dyn Reactor>,
	config: SessionConfig,
	service: Rc<Service>,
	sink: Rc<dyn ErrorSink>,
	label: Option<String>,
}

impl SessionBuilder {
	/// Replaces the whole configuration.
	#[must_use]
	pub fn config(mut self, config: SessionConfig) -> Self {
		self.config = config;
		self
	}

	/// Sets the wire format, keeping its default framing unless one was chosen explicitly.
	#[must_use]
	pub fn format(mut self, format: crate::WireFormat) -> Self {
		self.config.format = format;
		self
	}

	/// Sets the handlers offered to the peer. Defaults to [`Service::empty`].
	#[must_use]
	pub fn service(mut self, service: Rc<Service>) -> Self {
		self.service = service;
		self
	}

	/// Sets the error sink. Defaults to [`TracingSink`].
	#[must_use]
	pub fn sink(mut self, sink: impl ErrorSink + 'static) -> Self {
		self.sink = Rc::new(sink);
		self
	}

	/// Sets the name used in logs.
	#[must_use]
	pub fn label(mut self, label: impl Into<String>) -> Self {
		self.label = Some(label.into());
		self
	}

	/// The reactor the session will run on.
	#[must_use]
	pub fn reactor(&self) -> &Rc<dyn Reactor> {
		&self.reactor
	}

	/// Creates the session. It has no transport until [`Session::attach`] is called.
	///
	/// # Errors
	///
	/// [`Error::Config`] when the configuration fails [`SessionConfig::validate`].
	pub fn build(self) -> Result<Session> {
		self.config.validate()?;
		let framing = self.config.framing();
		let label = self.label.unwrap_or_else(|| "session".to_string());
		debug!(
			session = %label,
			format = %self.config.format,
			framing = %framing,
			"rpc.session.created"
		);
		Ok(Session(Rc::new(SessionInner {
			codec: self.config.format.codec(),
			framer: RefCell::new(Framer::new(framing, self.config.max_frame_len)),
			pending: RefCell::new(PendingCalls::new(self.config.id_limit())),
			framing,
			label,
			config: self.config,
			service: self.service,
			reactor: self.reactor,
			transport: RefCell::new(None),
			sink: self.sink,
			stats: Cell::new(SessionStats::default()),
			open: Cell::new(true),
			depth: Cell::new(0),
		})))
	}
}

impl Session {
	/// Starts configuring a session that runs on `reactor`.
	#[must_use]
	pub fn builder(reactor: Rc<dyn Reactor>) -> SessionBuilder {
		SessionBuilder {
			reactor,
			config: SessionConfig::default(),
			service: Service::empty(),
			sink: Rc::new(TracingSink),
			label: None,
		}
	}

	/// Connects the outgoing byte path.
	pub fn attach(&self, transport: Rc<dyn Transport>) {
		*self.0.transport.borrow_mut() = Some(transport);
	}

	/// A non-owning handle.
	#[must_use]
	pub fn downgrade(&self) -> WeakSession {
		WeakSession(Rc::downgrade(&self.0))
	}

	/// Name used in logs.
	#[must_use]
	pub fn label(&self) -> &str {
		&self.0.label
	}

	/// The configuration in effect.
	#[must_use]
	pub fn config(&self) -> &SessionConfig {
		&self.0.config
	}

	/// The handlers offered to the peer.
	#[must_use]
	pub fn service(&self) -> &Rc<Service> {
		&self.0.service
	}

	/// The reactor this session runs on.
	#[must_use]
	pub fn reactor(&self) -> &Rc<dyn Reactor> {
		&self.0.reactor
	}

	/// Whether the session still accepts traffic.
	#[must_use]
	pub fn is_open(&self) -> bool {
		self.0.open.get()
	}

	/// Counters since creation.
	#[must_use]
	pub fn stats(&self) -> SessionStats {
		self.0.stats.get()
	}

	/// Number of outstanding outgoing calls.
	#[must_use]
	pub fn pending_calls(&self) -> usize {
		self.0.pending.borrow().len()
	}

	/// Number of blocking calls currently on the stack for this session.
	#[must_use]
	pub fn depth(&self) -> usize {
		self.0.depth.get()
	}

	/// Whether both handles refer to the same session.
	#[must_use]
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.0, &other.0)
	}

	/// Feeds received bytes and dispatches every complete message.
	pub fn data_received(&self, bytes: &[u8]) {
		if self.feed(bytes) {
			self.pump();
		}
	}

	/// Buffers received bytes without dispatching them; [`Session::pump`] does that.
	///
	/// Returns false once the session is closed, in which case the bytes are discarded.
	pub fn feed(&self, bytes: &[u8]) -> bool {
		if !self.is_open() {
			trace!(session = %self.0.label, len = bytes.len(), "rpc.session.data_after_close");
			return false;
		}
		self.0.framer.borrow_mut().feed(bytes);
		true
	}

	/// Bytes received but not yet dispatched.
	#[must_use]
	pub fn buffered(&self) -> usize {
		self.0.framer.borrow().buffered()
	}

	/// Dispatches messages already buffered by the framer, one at a time, in wire order.
	///
	/// A handler may re-enter `pump` (a blocking call does); the nested pass continues with the
	/// next buffered message.
	pub fn pump(&self) {
		while self.is_open() {
			let next = self.0.framer.borrow_mut().try_extract();
			match next {
				Ok(Some(frame)) => self.dispatch_frame(&frame),
				Ok(None) => break,
				Err(err) => self.fail(SinkEvent::Framing(err)),
			}
		}
	}

	fn dispatch_frame(&self, frame: &[u8]) {
		match self.0.codec.decode(frame) {
			Ok(msg) => self.dispatch(msg),
			Err(Error::Framing(err)) => self.fail(SinkEvent::Framing(err)),
			Err(Error::Protocol(reason)) => self.fail(SinkEvent::Protocol(reason)),
			Err(err) => self.fail(SinkEvent::Protocol(err.to_string())),
		}
	}

	/// Routes one decoded message.
	pub fn dispatch(&self, msg: Message) {
		trace!(session = %self.0.label, kind = msg.kind(), id = ?msg.id(), "rpc.session.dispatch");
		match msg {
			Message::Request(req) => self.handle_request(req),
			Message::Notification(notif) => self.handle_notification(notif),
			Message::Response(resp) => self.handle_response(resp),
		}
	}

	fn handle_request(&self, req: Request) {
		self.bump(|s| s.requests_received += 1);
		let Request { id, method, params } = req;

		let Some(handler) = self.0.service.method(&method) else {
			debug!(session = %self.0.label, id = %id, method = %method, "rpc.request.method_not_found");
			self.send_response(id, Err(ResponseError::method_not_found(&method)));
			return;
		};

		match handler {
			Method::Immediate(handler) => {
				let result = self
					.guarded(&method, || handler.call(self, params))
					.unwrap_or_else(|message| Err(ResponseError::internal(format!("handler for '{method}' panicked: {message}"))));
				self.send_response(id, result);
			}
			Method::Deferred(handler) => {
				let responder = Responder::new(self.downgrade(), id, method.clone());
				// A panic drops the responder while unwinding, which answers the caller.
				let _ = self.guarded(&method, || handler.call(self, params, responder));
			}
		}
	}

	fn handle_notification(&self, notif: Notification) {
		self.bump(|s| s.notifications_received += 1);
		let Notification { method, params } = notif;

		let Some(handler) = self.0.service.notification(&method) else {
			debug!(session = %self.0.label, method = %method, "rpc.notification.unhandled");
			return;
		};
		if let Ok(Err(error)) = self.guarded(&method, || handler.notify(self, params)) {
			self.report(SinkEvent::NotificationFailed { method, error });
		}
	}

	fn handle_response(&self, resp: Response) {
		let call = self.0.pending.borrow_mut().take(resp.id);
		let Some(call) = call else {
			self.bump(|s| s.unmatched_responses += 1);
			self.report(SinkEvent::UnmatchedResponse { id: resp.id });
			return;
		};
		self.bump(|s| s.responses_matched += 1);
		trace!(
			session = %self.0.label,
			id = %resp.id,
			method = call.method(),
			elapsed_ms = call.issued_at().elapsed().as_millis() as u64,
			ok = resp.result.is_ok(),
			"rpc.call.completed"
		);
		call.complete(resp.result.map_err(CallError::Application));
	}

	/// Runs a handler, converting a panic into a [`SinkEvent::HandlerPanicked`] report.
	fn guarded<T>(&self, method: &str, f: impl FnOnce() -> T) -> std::result::Result<T, String> {
		panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
			let message = panic_message(payload.as_ref());
			self.report(SinkEvent::HandlerPanicked {
				method: method.to_string(),
				message: message.clone(),
			});
			message
		})
	}

	/// Sends the response to request `id`. Dropped silently once the session has closed.
	pub(crate) fn send_response(&self, id: CallId, result: std::result::Result<Value, ResponseError>) {
		if !self.is_open() {
			debug!(session = %self.0.label, id = %id, "rpc.response.dropped_closed");
			return;
		}
		let msg = Message::Response(Response { id, result });
		let frame = match self.frame(&msg) {
			Ok(frame) => frame,
			Err(err) => {
				warn!(session = %self.0.label, id = %id, error = %err, "rpc.response.encode_failed");
				let fallback = Message::response_err(id, ResponseError::internal(format!("failed to encode response: {err}")));
				match self.frame(&fallback) {
					Ok(frame) => frame,
					Err(_) => return,
				}
			}
		};
		if let Err(err) = self.transmit(frame) {
			self.fail(SinkEvent::Transport(err.to_string()));
		}
	}

	/// Sends a notification to the peer.
	///
	/// # Errors
	///
	/// [`Error::Closed`] after teardown, [`Error::Encode`] if the parameters cannot be encoded,
	/// [`Error::Io`] if the transport failed (the session is closed as a result).
	pub fn notify(&self, method: &str, params: Params) -> Result<()> {
		if !self.is_open() {
			return Err(Error::Closed);
		}
		let frame = self.frame(&Message::notification(method, params))?;
		self.transmit(frame).inspect_err(|err| self.fail(SinkEvent::Transport(err.to_string())))?;
		self.bump(|s| s.notifications_sent += 1);
		trace!(session = %self.0.label, method, "rpc.notification.sent");
		Ok(())
	}

	fn frame(&self, msg: &Message) -> Result<Bytes> {
		let body = self.0.codec.encode(msg)?;
		let mut out = BytesMut::new();
		self.0.framing.write_frame(&body, &mut out)?;
		Ok(out.freeze())
	}

	fn transmit(&self, frame: Bytes) -> io::Result<()> {
		let transport = self.0.transport.borrow().clone();
		match transport {
			Some(transport) => transport.send(frame),
			None => Err(io::Error::new(io::ErrorKind::NotConnected, "session has no transport")),
		}
	}

	/// Completes every call whose deadline has passed with [`CallError::Timeout`].
	///
	/// Returns the number of expired calls.
	pub fn expire_due(&self, now: Instant) -> usize {
		let expired = self.0.pending.borrow_mut().take_expired(now);
		let count = expired.len();
		for (id, call) in expired {
			self.bump(|s| s.timeouts += 1);
			debug!(session = %self.0.label, id = %id, method = call.method(), "rpc.call.timeout");
			call.complete(Err(CallError::Timeout(id)));
		}
		count
	}

	/// Closes the session locally.
	///
	/// Every outstanding call completes with [`CallError::ConnectionClosed`] before this returns.
	/// Idempotent.
	pub fn close(&self) {
		self.shutdown("closed locally");
	}

	/// Tears the session down after the transport hit end-of-stream or failed.
	pub fn connection_lost(&self, error: Option<io::Error>) {
		match error {
			Some(err) if self.is_open() => {
				self.report(SinkEvent::Transport(err.to_string()));
				self.shutdown("transport failed");
			}
			_ => self.shutdown("peer closed the connection"),
		}
	}

	fn fail(&self, event: SinkEvent) {
		let fatal = event.is_fatal();
		self.report(event);
		if fatal {
			self.shutdown("fatal error");
		}
	}

	fn shutdown(&self, reason: &'static str) {
		if !self.0.open.replace(false) {
			return;
		}
		let outstanding = self.pending_calls();
		info!(session = %self.0.label, reason, outstanding, "rpc.session.closed");

		let transport = self.0.transport.borrow_mut().take();
		if let Some(transport) = transport {
			transport.close();
		}
		self.0.framer.borrow_mut().clear();

		let calls = self.0.pending.borrow_mut().drain();
		for (_, call) in calls {
			call.complete(Err(CallError::ConnectionClosed));
		}
	}

	fn report(&self, event: SinkEvent) {
		self.0.sink.report(event);
	}

	fn bump(&self, f: impl FnOnce(&mut SessionStats)) {
		let mut stats = self.0.stats.get();
		f(&mut stats);
		self.0.stats.set(stats);
	}
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("label", &self.0.label)
			.field("open", &self.is_open())
			.field("pending", &self.pending_calls())
			.field("depth", &self.depth())
			.finish_non_exhaustive()
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

#[cfg(test)]
mod tests;
