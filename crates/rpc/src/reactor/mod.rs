//! The event-loop capability consumed by sessions.
//!
//! A [`Reactor`] is shared as `Rc<dyn Reactor>` and must tolerate reentrancy: a callback it
//! dispatches may itself call [`Reactor::run_once`] (a blocking [`crate::Session::call`] does
//! exactly that). Implementations therefore never hold a borrow of their own state while a
//! callback runs. [`ReadyQueue`] and [`TimerQueue`] are the shared building blocks that make this
//! easy; [`LocalReactor`] and `spindle_reactor::PollReactor` are built from them.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

mod local;

pub use local::LocalReactor;

/// A one-shot unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Readiness callback. Invoked every time the registered descriptor becomes ready.
pub type IoCallback = Rc<dyn Fn()>;

/// Readiness kind a callback is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
	/// Bytes can be read or the peer hung up.
	Readable,
	/// Bytes can be written.
	Writable,
}

/// Registration of one readiness callback, returned by [`Reactor::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandle {
	fd: RawFd,
	interest: Interest,
}

impl IoHandle {
	/// Creates a handle. Only reactor implementations need this.
	#[must_use]
	pub const fn new(fd: RawFd, interest: Interest) -> Self {
		Self { fd, interest }
	}

	/// The registered descriptor.
	#[must_use]
	pub const fn fd(&self) -> RawFd {
		self.fd
	}

	/// The registered readiness kind.
	#[must_use]
	pub const fn interest(&self) -> Interest {
		self.interest
	}
}

/// Cancellation handle of a scheduled timer.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
	cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
	/// Prevents the timer from firing. No effect once it has fired.
	pub fn cancel(&self) {
		self.cancelled.set(true);
	}

	/// Whether [`TimerHandle::cancel`] was called.
	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.cancelled.get()
	}
}

/// Readiness and timer services for a single thread.
pub trait Reactor {
	/// Registers `callback` to run whenever `fd` becomes ready for `interest`.
	///
	/// # Errors
	///
	/// Fails if the descriptor cannot be registered, or if this reactor has no descriptor support.
	fn register(&self, fd: RawFd, interest: Interest, callback: IoCallback) -> io::Result<IoHandle>;

	/// Removes a registration. The callback is not invoked afterwards.
	///
	/// # Errors
	///
	/// Fails if the handle is unknown to this reactor.
	fn deregister(&self, handle: IoHandle) -> io::Result<()>;

	/// Runs `task` once, no earlier than `delay` from now.
	fn schedule_after(&self, delay: Duration, task: Task) -> TimerHandle;

	/// Runs `task` on the next [`Reactor::run_once`] pass without waiting.
	fn defer(&self, task: Task);

	/// Waits up to `max_wait` (forever for `None`) for readiness or timers, then dispatches one
	/// batch of callbacks.
	///
	/// Returns the number of callbacks run. Safe to call from inside a callback.
	///
	/// # Errors
	///
	/// Propagates failures of the underlying readiness wait.
	fn run_once(&self, max_wait: Option<Duration>) -> io::Result<usize>;

	/// Shorthand for [`Reactor::register`] with [`Interest::Readable`].
	///
	/// # Errors
	///
	/// See [`Reactor::register`].
	fn register_readable(&self, fd: RawFd, callback: IoCallback) -> io::Result<IoHandle> {
		self.register(fd, Interest::Readable, callback)
	}

	/// Shorthand for [`Reactor::register`] with [`Interest::Writable`].
	///
	/// # Errors
	///
	/// See [`Reactor::register`].
	fn register_writable(&self, fd: RawFd, callback: IoCallback) -> io::Result<IoHandle> {
		self.register(fd, Interest::Writable, callback)
	}
}

/// FIFO of ready callbacks shared between reentrant `run_once` passes.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct ReadyQueue {
	inner: Rc<RefCell<ReadyTasks>>,
}

/// Queued tasks tagged with their push order.
#[derive(Default)]
struct ReadyTasks {
	tasks: VecDeque<(u64, Task)>,
	pushed: u64,
}

impl ReadyQueue {
	/// Creates an empty queue.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a task.
	pub fn push(&self, task: Task) {
		let mut inner = self.inner.borrow_mut();
		let seq = inner.pushed;
		inner.pushed += 1;
		inner.tasks.push_back((seq, task));
	}

	/// Number of queued tasks.
	#[must_use]
	pub fn len(&self) -> usize {
		self.inner.borrow().tasks.len()
	}

	/// Whether nothing is queued.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.inner.borrow().tasks.is_empty()
	}

	/// Runs the tasks that were queued on entry, popping them one at a time.
	///
	/// The queue is not borrowed while a task runs, so a nested pass started by a task drains
	/// tasks this pass has not reached yet; this pass then stops early. Tasks queued during the
	/// batch, nested passes included, wait for the next one.
	pub fn run_batch(&self) -> usize {
		let end = self.inner.borrow().pushed;
		let mut ran = 0;
		loop {
			let task = {
				let mut inner = self.inner.borrow_mut();
				match inner.tasks.front() {
					Some((seq, _)) if *seq < end => inner.tasks.pop_front().map(|(_, task)| task),
					_ => None,
				}
			};
			let Some(task) = task else {
				break;
			};
			task();
			ran += 1;
		}
		ran
	}
}

impl fmt::Debug for ReadyQueue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ReadyQueue").field("len", &self.len()).finish()
	}
}

struct TimerEntry {
	deadline: Instant,
	seq: u64,
	cancelled: Rc<Cell<bool>>,
	task: Task,
}

impl PartialEq for TimerEntry {
	fn eq(&self, other: &Self) -> bool {
		self.cmp(other) == Ordering::Equal
	}
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for TimerEntry {
	// Reversed: the heap pops the earliest deadline, ties in scheduling order.
	fn cmp(&self, other: &Self) -> Ordering {
		(other.deadline, other.seq).cmp(&(self.deadline, self.seq))
	}
}

/// Heap size below which cancelled timers are only dropped when they reach the head.
const COMPACT_FLOOR: usize = 64;

/// Deadline-ordered timers with lazy cancellation.
///
/// Cancelled timers stay in the heap until they reach the head or until the heap has doubled
/// since the last sweep, whichever comes first.
#[derive(Default)]
pub struct TimerQueue {
	heap: BinaryHeap<TimerEntry>,
	seq: u64,
	compact_at: usize,
}

impl TimerQueue {
	/// Creates an empty queue.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Schedules `task` at `deadline`.
	pub fn push(&mut self, deadline: Instant, task: Task) -> TimerHandle {
		let handle = TimerHandle::default();
		self.seq += 1;
		self.heap.push(TimerEntry {
			deadline,
			seq: self.seq,
			cancelled: Rc::clone(&handle.cancelled),
			task,
		});
		if self.heap.len() > self.compact_at.max(COMPACT_FLOOR) {
			self.compact();
		}
		handle
	}

	/// Drops every cancelled timer.
	pub fn compact(&mut self) {
		self.heap.retain(|entry| !entry.cancelled.get());
		self.compact_at = self.heap.len() * 2;
	}

	/// Earliest deadline of a timer that is still live. Drops cancelled timers at the head.
	pub fn next_deadline(&mut self) -> Option<Instant> {
		while let Some(head) = self.heap.peek() {
			if !head.cancelled.get() {
				return Some(head.deadline);
			}
			self.heap.pop();
		}
		None
	}

	/// Removes every timer due at `now`, in deadline order, skipping cancelled ones.
	pub fn pop_due(&mut self, now: Instant) -> Vec<Task> {
		let mut due = Vec::new();
		while self.heap.peek().is_some_and(|head| head.deadline <= now) {
			if let Some(entry) = self.heap.pop()
				&& !entry.cancelled.get()
			{
				due.push(entry.task);
			}
		}
		due
	}

	/// Number of scheduled timers, cancelled ones included until they are dropped.
	#[must_use]
	pub fn len(&self) -> usize {
		self.heap.len()
	}

	/// Whether no timers are scheduled.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.heap.is_empty()
	}
}

impl fmt::Debug for TimerQueue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TimerQueue").field("len", &self.heap.len()).finish()
	}
}

/// Time left until `deadline`, clamped by `cap`.
///
/// `None` for either bound means unbounded.
#[must_use]
pub fn wait_bound(now: Instant, deadline: Option<Instant>, cap: Option<Duration>) -> Option<Duration> {
	let until = deadline.map(|d| d.saturating_duration_since(now));
	match (until, cap) {
		(Some(a), Some(b)) => Some(a.min(b)),
		(a, b) => a.or(b),
	}
}
