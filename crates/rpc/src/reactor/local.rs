use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::{Interest, IoCallback, IoHandle, ReadyQueue, Reactor, Task, TimerHandle, TimerQueue, wait_bound};

/// A reactor with timers and deferred work but no descriptor readiness.
///
/// Sessions connected through [`crate::loopback`] run entirely on it, which makes it the reactor
/// for tests and in-process peers. Idle passes sleep the thread up to the wait bound.
#[derive(Debug, Default)]
pub struct LocalReactor {
	ready: ReadyQueue,
	timers: RefCell<TimerQueue>,
}

impl LocalReactor {
	/// Creates an idle reactor.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether any deferred work or live timer remains.
	#[must_use]
	pub fn has_work(&self) -> bool {
		!self.ready.is_empty() || self.timers.borrow_mut().next_deadline().is_some()
	}
}

fn unsupported() -> io::Error {
	io::Error::new(io::ErrorKind::Unsupported, "LocalReactor does not poll file descriptors")
}

impl Reactor for LocalReactor {
	fn register(&self, _fd: RawFd, _interest: Interest, _callback: IoCallback) -> io::Result<IoHandle> {
		Err(unsupported())
	}

	fn deregister(&self, _handle: IoHandle) -> io::Result<()> {
		Err(unsupported())
	}

	fn schedule_after(&self, delay: Duration, task: Task) -> TimerHandle {
		self.timers.borrow_mut().push(Instant::now() + delay, task)
	}

	fn defer(&self, task: Task) {
		self.ready.push(task);
	}

	fn run_once(&self, max_wait: Option<Duration>) -> io::Result<usize> {
		if self.ready.is_empty() {
			let next = self.timers.borrow_mut().next_deadline();
			// Nothing can ever become ready without a timer, so an unbounded idle wait returns.
			if next.is_some() || max_wait.is_some() {
				match wait_bound(Instant::now(), next, max_wait) {
					Some(wait) if !wait.is_zero() => std::thread::sleep(wait),
					_ => {}
				}
			}
		}

		let due = self.timers.borrow_mut().pop_due(Instant::now());
		for task in due {
			self.ready.push(task);
		}
		Ok(self.ready.run_batch())
	}
}
