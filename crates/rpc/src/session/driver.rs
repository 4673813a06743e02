//! Outgoing calls and the reentrant call driver.
//!
//! [`Session::call`] looks blocking to its caller but never blocks the thread on the socket. It
//! loops over three steps until the call's continuation has fired:
//!
//! 1. dispatch frames the framer already holds (readiness will not fire again for them),
//! 2. expire overdue calls,
//! 3. run one reactor pass, waiting no longer than the nearest deadline or the configured slice.
//!
//! Step 3 may dispatch arbitrary callbacks, including handlers that start blocking calls of their
//! own, so the loop nests on the stack.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, trace, warn};

use super::Session;
use crate::error::CallError;
use crate::message::{CallId, Message, Params};
use crate::pending::{CallOutcome, Continuation, PendingCall};
use crate::reactor::wait_bound;
use crate::sink::SinkEvent;

/// The eventual outcome of a call started with [`Session::begin_call`].
///
/// Either `.await` it on an executor that shares the session's thread, poll it with
/// [`PendingReply::try_result`], or hand it to [`Session::wait`].
#[derive(Debug)]
pub struct PendingReply {
	id: Option<CallId>,
	rx: oneshot::Receiver<CallOutcome>,
}

impl PendingReply {
	/// The id of the request, if it was sent.
	#[must_use]
	pub const fn id(&self) -> Option<CallId> {
		self.id
	}

	/// Takes the outcome if it has arrived.
	///
	/// Yields the outcome once; later calls report [`CallError::ConnectionClosed`].
	pub fn try_result(&mut self) -> Option<CallOutcome> {
		match self.rx.try_recv() {
			Ok(outcome) => Some(outcome),
			Err(TryRecvError::Empty) => None,
			Err(TryRecvError::Closed) => Some(Err(CallError::ConnectionClosed)),
		}
	}
}

impl Future for PendingReply {
	type Output = CallOutcome;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.rx)
			.poll(cx)
			.map(|received| received.unwrap_or(Err(CallError::ConnectionClosed)))
	}
}

/// Tracks how many blocking calls are on the stack, unwinding included.
struct DepthGuard<'a> {
	session: &'a Session,
}

impl<'a> DepthGuard<'a> {
	fn enter(session: &'a Session) -> Self {
		let depth = session.0.depth.get() + 1;
		session.0.depth.set(depth);
		trace!(session = %session.0.label, depth, "rpc.driver.enter");
		Self { session }
	}
}

impl Drop for DepthGuard<'_> {
	fn drop(&mut self) {
		let depth = self.session.0.depth.get().saturating_sub(1);
		self.session.0.depth.set(depth);
	}
}

impl Session {
	/// Calls `method` on the peer and returns its result, re-entering the reactor until the
	/// response, the timeout or teardown arrives.
	///
	/// `timeout` of `None` applies [`crate::SessionConfig::call_timeout_ms`], which itself may
	/// be unset (wait forever). Inbound requests and notifications keep being dispatched while
	/// the call waits, in wire order.
	///
	/// Every nested blocking call keeps its caller's frame on the stack, so nesting depth is
	/// bounded by the thread's stack size.
	///
	/// # Errors
	///
	/// - [`CallError::Application`] when the peer answered with an error.
	/// - [`CallError::Timeout`] when the deadline passed first.
	/// - [`CallError::ConnectionClosed`] when the session was or became closed.
	/// - [`CallError::IdSpaceExhausted`] or [`CallError::Encode`] when the request was not sent.
	pub fn call(&self, method: &str, params: Params, timeout: Option<Duration>) -> Result<Value, CallError> {
		let slot: Rc<RefCell<Option<CallOutcome>>> = Rc::default();
		let filled = Rc::clone(&slot);
		self.start_call(
			method,
			params,
			timeout,
			Continuation::callback(move |outcome| *filled.borrow_mut() = Some(outcome)),
		);
		self.drive(|| slot.borrow_mut().take())
	}

	/// Sends a request and returns a handle to its eventual outcome without waiting.
	pub fn begin_call(&self, method: &str, params: Params, timeout: Option<Duration>) -> PendingReply {
		let (continuation, rx) = Continuation::channel();
		let id = self.start_call(method, params, timeout, continuation);
		PendingReply { id, rx }
	}

	/// Sends a request; `callback` receives the outcome from the dispatcher.
	///
	/// The callback runs exactly once: possibly before this returns if the request could not be
	/// sent.
	pub fn call_with(
		&self,
		method: &str,
		params: Params,
		timeout: Option<Duration>,
		callback: impl FnOnce(CallOutcome) + 'static,
	) -> Option<CallId> {
		self.start_call(method, params, timeout, Continuation::callback(callback))
	}

	/// Drives the reactor until `reply` resolves, exactly like [`Session::call`].
	///
	/// # Errors
	///
	/// The call's [`CallError`].
	pub fn wait(&self, mut reply: PendingReply) -> Result<Value, CallError> {
		self.drive(|| reply.try_result())
	}

	fn drive<T>(&self, mut ready: impl FnMut() -> Option<Result<T, CallError>>) -> Result<T, CallError> {
		let _depth = DepthGuard::enter(self);
		let max_wait = self.0.config.max_wait();
		loop {
			if let Some(outcome) = ready() {
				return outcome;
			}

			self.pump();
			if let Some(outcome) = ready() {
				return outcome;
			}

			let now = Instant::now();
			self.expire_due(now);
			if let Some(outcome) = ready() {
				return outcome;
			}

			if !self.is_open() {
				// Teardown completes every call; a continuation left unfired was never registered.
				return Err(CallError::ConnectionClosed);
			}

			let next_deadline = self.0.pending.borrow().next_deadline();
			let wait = wait_bound(now, next_deadline, Some(max_wait));
			if let Err(err) = self.0.reactor.run_once(wait) {
				warn!(session = %self.0.label, error = %err, "rpc.driver.reactor_failed");
				self.fail(SinkEvent::Transport(format!("reactor wait failed: {err}")));
			}
		}
	}

	fn start_call(
		&self,
		method: &str,
		params: Params,
		timeout: Option<Duration>,
		continuation: Continuation,
	) -> Option<CallId> {
		if !self.is_open() {
			continuation.complete(Err(CallError::ConnectionClosed));
			return None;
		}

		let allocated = self.0.pending.borrow_mut().allocate();
		let id = match allocated {
			Ok(id) => id,
			Err(err) => {
				warn!(session = %self.0.label, method, error = %err, "rpc.call.rejected");
				continuation.complete(Err(err));
				return None;
			}
		};

		let frame = match self.frame(&Message::request(id, method, params)) {
			Ok(frame) => frame,
			Err(err) => {
				continuation.complete(Err(CallError::Encode(err.to_string())));
				return None;
			}
		};

		let timeout = timeout.or_else(|| self.0.config.call_timeout());
		self.0
			.pending
			.borrow_mut()
			.insert(id, PendingCall::new(method, timeout, continuation));
		if let Some(timeout) = timeout {
			let session = self.downgrade();
			let timer = self.0.reactor.schedule_after(
				timeout,
				Box::new(move || {
					if let Some(session) = session.upgrade() {
						session.expire_call(id);
					}
				}),
			);
			self.0.pending.borrow_mut().attach_timer(id, timer);
		}

		self.bump(|s| s.calls_sent += 1);
		debug!(session = %self.0.label, id = %id, method, timeout_ms = ?timeout.map(|t| t.as_millis()), "rpc.call.sent");
		if let Err(err) = self.transmit(frame) {
			self.fail(SinkEvent::Transport(err.to_string()));
		}
		Some(id)
	}

	/// Fired by a call's reactor timer.
	fn expire_call(&self, id: CallId) {
		let call = self.0.pending.borrow_mut().take(id);
		if let Some(call) = call {
			self.bump(|s| s.timeouts += 1);
			debug!(session = %self.0.label, id = %id, method = call.method(), "rpc.call.timeout");
			call.complete(Err(CallError::Timeout(id)));
		}
	}
}
