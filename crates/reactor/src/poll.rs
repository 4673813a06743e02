use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use slab::Slab;
use spindle_rpc::reactor::wait_bound;
use spindle_rpc::{Interest, IoCallback, IoHandle, ReadyQueue, Reactor, Task, TimerHandle, TimerQueue};
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

/// Callbacks registered for one descriptor.
struct Source {
	fd: RawFd,
	readable: Option<IoCallback>,
	writable: Option<IoCallback>,
}

impl Source {
	fn interest(&self) -> Option<mio::Interest> {
		match (&self.readable, &self.writable) {
			(Some(_), Some(_)) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
			(Some(_), None) => Some(mio::Interest::READABLE),
			(None, Some(_)) => Some(mio::Interest::WRITABLE),
			(None, None) => None,
		}
	}

	fn slot(&mut self, interest: Interest) -> &mut Option<IoCallback> {
		match interest {
			Interest::Readable => &mut self.readable,
			Interest::Writable => &mut self.writable,
		}
	}
}

/// Edge-triggered readiness reactor over `mio::Poll`.
///
/// Ready callbacks and due timers go through a shared [`ReadyQueue`], so a callback may call
/// [`Reactor::run_once`] again: the nested pass polls for fresh events and continues with the
/// queue the outer pass left behind. Readiness is reported once per edge; callbacks must read or
/// write until `WouldBlock`.
pub struct PollReactor {
	poll: RefCell<Poll>,
	events: RefCell<Events>,
	sources: RefCell<Slab<Source>>,
	by_fd: RefCell<HashMap<RawFd, usize>>,
	ready: ReadyQueue,
	timers: RefCell<TimerQueue>,
}

impl PollReactor {
	/// Creates a reactor backed by a fresh OS selector.
	///
	/// # Errors
	///
	/// Fails if the selector cannot be created.
	pub fn new() -> io::Result<Self> {
		Ok(Self {
			poll: RefCell::new(Poll::new()?),
			events: RefCell::new(Events::with_capacity(EVENT_CAPACITY)),
			sources: RefCell::new(Slab::new()),
			by_fd: RefCell::new(HashMap::new()),
			ready: ReadyQueue::new(),
			timers: RefCell::new(TimerQueue::new()),
		})
	}

	/// Number of registered descriptors.
	#[must_use]
	pub fn sources(&self) -> usize {
		self.sources.borrow().len()
	}

	/// Collects ready callbacks for the events of the last poll.
	fn queue_events(&self) {
		let events = self.events.borrow();
		let sources = self.sources.borrow();
		for event in events.iter() {
			let Some(source) = sources.get(event.token().0) else {
				continue;
			};
			let failed = event.is_error();
			if (event.is_readable() || event.is_read_closed() || failed)
				&& let Some(callback) = &source.readable
			{
				let callback = Rc::clone(callback);
				self.ready.push(Box::new(move || callback()));
			}
			if (event.is_writable() || event.is_write_closed() || failed)
				&& let Some(callback) = &source.writable
			{
				let callback = Rc::clone(callback);
				self.ready.push(Box::new(move || callback()));
			}
		}
	}
}

impl Reactor for PollReactor {
	fn register(&self, fd: RawFd, interest: Interest, callback: IoCallback) -> io::Result<IoHandle> {
		let existing = self.by_fd.borrow().get(&fd).copied();
		let poll = self.poll.borrow();
		let mut sources = self.sources.borrow_mut();

		match existing {
			Some(key) => {
				let source = &mut sources[key];
				*source.slot(interest) = Some(callback);
				if let Some(wanted) = source.interest() {
					poll.registry().reregister(&mut SourceFd(&fd), Token(key), wanted)?;
				}
			}
			None => {
				let entry = sources.vacant_entry();
				let key = entry.key();
				let mut source = Source {
					fd,
					readable: None,
					writable: None,
				};
				*source.slot(interest) = Some(callback);
				if let Some(wanted) = source.interest() {
					poll.registry().register(&mut SourceFd(&fd), Token(key), wanted)?;
				}
				entry.insert(source);
				self.by_fd.borrow_mut().insert(fd, key);
			}
		}
		trace!(fd, ?interest, "reactor.register");
		Ok(IoHandle::new(fd, interest))
	}

	fn deregister(&self, handle: IoHandle) -> io::Result<()> {
		let fd = handle.fd();
		let key = self
			.by_fd
			.borrow()
			.get(&fd)
			.copied()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("fd {fd} is not registered")))?;

		let poll = self.poll.borrow();
		let mut sources = self.sources.borrow_mut();
		let source = &mut sources[key];
		// Dropped outside the borrows: the callback may own the last handle to the stream.
		let callback = source.slot(handle.interest()).take();
		let result = match source.interest() {
			Some(wanted) => poll.registry().reregister(&mut SourceFd(&fd), Token(key), wanted),
			None => {
				let removed = sources.remove(key);
				self.by_fd.borrow_mut().remove(&removed.fd);
				poll.registry().deregister(&mut SourceFd(&fd))
			}
		};
		drop(sources);
		drop(poll);
		drop(callback);
		trace!(fd, interest = ?handle.interest(), "reactor.deregister");
		result
	}

	fn schedule_after(&self, delay: Duration, task: Task) -> TimerHandle {
		self.timers.borrow_mut().push(Instant::now() + delay, task)
	}

	fn defer(&self, task: Task) {
		self.ready.push(task);
	}

	fn run_once(&self, max_wait: Option<Duration>) -> io::Result<usize> {
		let timeout = if self.ready.is_empty() {
			let next = self.timers.borrow_mut().next_deadline();
			wait_bound(Instant::now(), next, max_wait)
		} else {
			Some(Duration::ZERO)
		};

		let polled = {
			let mut poll = self.poll.borrow_mut();
			let mut events = self.events.borrow_mut();
			poll.poll(&mut events, timeout)
		};
		match polled {
			Ok(()) => self.queue_events(),
			Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
			Err(err) => return Err(err),
		}

		let due = self.timers.borrow_mut().pop_due(Instant::now());
		for task in due {
			self.ready.push(task);
		}
		Ok(self.ready.run_batch())
	}
}

impl fmt::Debug for PollReactor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PollReactor")
			.field("sources", &self.sources.borrow().len())
			.field("ready", &self.ready.len())
			.field("timers", &self.timers.borrow().len())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use std::cell::{Cell, RefCell};
	use std::io::Write;
	use std::os::fd::AsRawFd;
	use std::os::unix::net::UnixStream;

	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn timers_and_deferred_tasks_share_the_queue() {
		let reactor = PollReactor::new().expect("poll");
		let log = Rc::new(RefCell::new(Vec::new()));
		for (name, delay) in [("late", 15), ("soon", 1)] {
			let log = Rc::clone(&log);
			reactor.schedule_after(Duration::from_millis(delay), Box::new(move || log.borrow_mut().push(name)));
		}
		let deferred = Rc::clone(&log);
		reactor.defer(Box::new(move || deferred.borrow_mut().push("deferred")));

		let start = Instant::now();
		while log.borrow().len() < 3 && start.elapsed() < Duration::from_secs(1) {
			reactor.run_once(Some(Duration::from_millis(50))).expect("run");
		}
		assert_eq!(*log.borrow(), ["deferred", "soon", "late"]);
	}

	#[test]
	fn readable_callback_fires_and_deregisters() {
		let reactor = PollReactor::new().expect("poll");
		let (mut tx, rx) = UnixStream::pair().expect("pair");
		rx.set_nonblocking(true).expect("nonblocking");

		let hits = Rc::new(Cell::new(0));
		let counter = Rc::clone(&hits);
		let handle = reactor
			.register_readable(rx.as_raw_fd(), Rc::new(move || counter.set(counter.get() + 1)))
			.expect("register");
		assert_eq!(reactor.sources(), 1);

		tx.write_all(b"x").expect("write");
		reactor.run_once(Some(Duration::from_millis(200))).expect("run");
		assert_eq!(hits.get(), 1);

		reactor.deregister(handle).expect("deregister");
		assert_eq!(reactor.sources(), 0);
		tx.write_all(b"y").expect("write");
		reactor.run_once(Some(Duration::from_millis(10))).expect("run");
		assert_eq!(hits.get(), 1);
	}

	#[test]
	fn both_interests_share_one_source() {
		let reactor = PollReactor::new().expect("poll");
		let (_tx, rx) = UnixStream::pair().expect("pair");
		let fd = rx.as_raw_fd();
		let read = reactor.register_readable(fd, Rc::new(|| {})).expect("readable");
		let write = reactor.register_writable(fd, Rc::new(|| {})).expect("writable");
		assert_eq!(reactor.sources(), 1);

		reactor.deregister(read).expect("deregister read");
		assert_eq!(reactor.sources(), 1);
		reactor.deregister(write).expect("deregister write");
		assert_eq!(reactor.sources(), 0);
		assert!(reactor.deregister(write).is_err());
	}
}
