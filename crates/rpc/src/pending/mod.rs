//! Outstanding outgoing calls, keyed by call id.
//!
//! The table owns each [`PendingCall`] from registration until it is resolved, expired or
//! drained. Removal is the linearization point: whoever removes an entry invokes its continuation,
//! so a continuation runs at most once no matter how many responses or timeouts race for it.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::CallError;
use crate::message::CallId;
use crate::reactor::TimerHandle;

/// Outcome delivered to a continuation.
pub type CallOutcome = Result<Value, CallError>;

/// What happens when a call completes.
pub enum Continuation {
	/// Invoke a closure with the outcome.
	Callback(Box<dyn FnOnce(CallOutcome)>),
	/// Send the outcome through a oneshot channel. A dropped receiver is ignored.
	Channel(oneshot::Sender<CallOutcome>),
}

impl Continuation {
	/// Wraps a closure.
	pub fn callback(f: impl FnOnce(CallOutcome) + 'static) -> Self {
		Self::Callback(Box::new(f))
	}

	/// Creates a channel continuation and its receiving end.
	#[must_use]
	pub fn channel() -> (Self, oneshot::Receiver<CallOutcome>) {
		let (tx, rx) = oneshot::channel();
		(Self::Channel(tx), rx)
	}

	/// Delivers the outcome.
	pub fn complete(self, outcome: CallOutcome) {
		match self {
			Self::Callback(f) => f(outcome),
			Self::Channel(tx) => {
				let _ = tx.send(outcome);
			}
		}
	}
}

impl fmt::Debug for Continuation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Callback(_) => f.write_str("Continuation::Callback"),
			Self::Channel(_) => f.write_str("Continuation::Channel"),
		}
	}
}

/// One outstanding call.
#[derive(Debug)]
pub struct PendingCall {
	method: String,
	issued_at: Instant,
	deadline: Option<Instant>,
	continuation: Continuation,
	timer: Option<TimerHandle>,
}

impl PendingCall {
	/// Creates a call issued now. `timeout` of `None` waits forever.
	pub fn new(method: impl Into<String>, timeout: Option<Duration>, continuation: Continuation) -> Self {
		let issued_at = Instant::now();
		Self {
			method: method.into(),
			issued_at,
			deadline: timeout.map(|t| issued_at + t),
			continuation,
			timer: None,
		}
	}

	/// Method name, for diagnostics.
	#[must_use]
	pub fn method(&self) -> &str {
		&self.method
	}

	/// When the request was issued.
	#[must_use]
	pub const fn issued_at(&self) -> Instant {
		self.issued_at
	}

	/// When the call times out, if ever.
	#[must_use]
	pub const fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	/// Cancels the expiry timer, if any, and delivers the outcome.
	pub fn complete(self, outcome: CallOutcome) {
		if let Some(timer) = &self.timer {
			timer.cancel();
		}
		self.continuation.complete(outcome);
	}
}

/// The pending-call table and call-id allocator of one session.
#[derive(Debug)]
pub struct PendingCalls {
	next: u64,
	limit: u64,
	entries: HashMap<CallId, PendingCall>,
}

impl PendingCalls {
	/// Creates an empty table allocating ids in `0..=limit`.
	#[must_use]
	pub fn new(limit: u64) -> Self {
		Self {
			next: 0,
			limit,
			entries: HashMap::new(),
		}
	}

	/// Largest id this table hands out.
	#[must_use]
	pub const fn limit(&self) -> u64 {
		self.limit
	}

	/// Picks the next free id without reserving it.
	///
	/// Ids increase monotonically, wrap to 0 after the limit, and skip ids still in flight.
	///
	/// # Errors
	///
	/// [`CallError::IdSpaceExhausted`] when every id in the range is outstanding.
	pub fn allocate(&mut self) -> Result<CallId, CallError> {
		let live = u64::try_from(self.entries.len()).unwrap_or(u64::MAX);
		if live > self.limit {
			return Err(CallError::IdSpaceExhausted { limit: self.limit });
		}
		loop {
			let id = CallId(self.next);
			self.next = if self.next >= self.limit { 0 } else { self.next + 1 };
			if !self.entries.contains_key(&id) {
				return Ok(id);
			}
		}
	}

	/// Stores a call under an id obtained from [`PendingCalls::allocate`].
	pub fn insert(&mut self, id: CallId, call: PendingCall) {
		let previous = self.entries.insert(id, call);
		debug_assert!(previous.is_none(), "call id {id} allocated twice");
	}

	/// Allocates an id and stores `call` under it.
	///
	/// # Errors
	///
	/// [`CallError::IdSpaceExhausted`]. The call's continuation is completed with that error
	/// before this returns.
	pub fn register(&mut self, call: PendingCall) -> Result<CallId, CallError> {
		match self.allocate() {
			Ok(id) => {
				self.insert(id, call);
				Ok(id)
			}
			Err(err) => {
				call.complete(Err(err.clone()));
				Err(err)
			}
		}
	}

	/// Attaches the reactor timer that expires `id`.
	///
	/// Returns false, after cancelling the timer, when the call is already gone.
	pub fn attach_timer(&mut self, id: CallId, timer: TimerHandle) -> bool {
		match self.entries.get_mut(&id) {
			Some(call) => {
				call.timer = Some(timer);
				true
			}
			None => {
				timer.cancel();
				false
			}
		}
	}

	/// Removes a call without completing it.
	pub fn take(&mut self, id: CallId) -> Option<PendingCall> {
		self.entries.remove(&id)
	}

	/// Removes `id` and completes it with `outcome`. Returns false when `id` is not outstanding.
	pub fn resolve(&mut self, id: CallId, outcome: CallOutcome) -> bool {
		match self.take(id) {
			Some(call) => {
				call.complete(outcome);
				true
			}
			None => false,
		}
	}

	/// Removes every call whose deadline is at or before `now`, earliest deadline first.
	pub fn take_expired(&mut self, now: Instant) -> Vec<(CallId, PendingCall)> {
		let mut due: Vec<CallId> = self
			.entries
			.iter()
			.filter(|(_, call)| call.deadline.is_some_and(|d| d <= now))
			.map(|(id, _)| *id)
			.collect();
		due.sort_by_key(|id| (self.entries[id].deadline, *id));
		due.into_iter()
			.filter_map(|id| self.entries.remove(&id).map(|call| (id, call)))
			.collect()
	}

	/// Completes every expired call with [`CallError::Timeout`] and returns their ids.
	pub fn expire_due(&mut self, now: Instant) -> Vec<CallId> {
		self.take_expired(now)
			.into_iter()
			.map(|(id, call)| {
				call.complete(Err(CallError::Timeout(id)));
				id
			})
			.collect()
	}

	/// Removes every outstanding call, in id order.
	pub fn drain(&mut self) -> Vec<(CallId, PendingCall)> {
		let mut calls: Vec<_> = self.entries.drain().collect();
		calls.sort_by_key(|(id, _)| *id);
		calls
	}

	/// Earliest deadline among outstanding calls.
	#[must_use]
	pub fn next_deadline(&self) -> Option<Instant> {
		self.entries.values().filter_map(|call| call.deadline).min()
	}

	/// Whether `id` is outstanding.
	#[must_use]
	pub fn contains(&self, id: CallId) -> bool {
		self.entries.contains_key(&id)
	}

	/// Number of outstanding calls.
	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether no call is outstanding.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
