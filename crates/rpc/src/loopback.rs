//! In-memory transport connecting two sessions on the same reactor.
//!
//! Writes are appended to the peer's inbox and delivered by one deferred reactor callback, so
//! several messages written back to back arrive in a single `data_received`, like one socket read.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::Result;
use crate::reactor::Reactor;
use crate::session::{Session, SessionBuilder, WeakSession};
use crate::transport::Transport;

/// One direction of the connection.
struct Pipe {
	reactor: Rc<dyn Reactor>,
	receiver: WeakSession,
	inbox: RefCell<BytesMut>,
	scheduled: Cell<bool>,
	closed: Cell<bool>,
}

impl Pipe {
	fn new(reactor: Rc<dyn Reactor>, receiver: &Session) -> Rc<Self> {
		Rc::new(Self {
			reactor,
			receiver: receiver.downgrade(),
			inbox: RefCell::new(BytesMut::new()),
			scheduled: Cell::new(false),
			closed: Cell::new(false),
		})
	}

	fn write(self: &Rc<Self>, frame: &[u8]) {
		self.inbox.borrow_mut().extend_from_slice(frame);
		if !self.scheduled.replace(true) {
			let pipe = Rc::clone(self);
			self.reactor.defer(Box::new(move || pipe.deliver()));
		}
	}

	fn deliver(&self) {
		self.scheduled.set(false);
		let bytes = self.inbox.borrow_mut().split().freeze();
		if bytes.is_empty() {
			return;
		}
		if let Some(receiver) = self.receiver.upgrade() {
			trace!(session = receiver.label(), len = bytes.len(), "rpc.loopback.deliver");
			receiver.data_received(&bytes);
		}
	}

	/// Signals end-of-stream to the receiver after anything already written.
	fn hang_up(self: &Rc<Self>) {
		if self.closed.replace(true) {
			return;
		}
		let pipe = Rc::clone(self);
		self.reactor.defer(Box::new(move || {
			pipe.deliver();
			if let Some(receiver) = pipe.receiver.upgrade() {
				receiver.connection_lost(None);
			}
		}));
	}
}

/// The transport end owned by one session.
struct LoopbackEnd {
	outgoing: Rc<Pipe>,
	incoming: Rc<Pipe>,
}

impl Transport for LoopbackEnd {
	fn send(&self, frame: Bytes) -> io::Result<()> {
		if self.outgoing.closed.get() {
			return Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer closed"));
		}
		self.outgoing.write(&frame);
		Ok(())
	}

	fn close(&self) {
		self.outgoing.hang_up();
		self.incoming.closed.set(true);
	}
}

/// Builds two sessions and connects them to each other.
///
/// Each side is delivered on its own builder's reactor; normally both share one.
///
/// # Errors
///
/// Configuration errors from either builder.
pub fn pair(left: SessionBuilder, right: SessionBuilder) -> Result<(Session, Session)> {
	let left_reactor = Rc::clone(left.reactor());
	let right_reactor = Rc::clone(right.reactor());
	let left = left.build()?;
	let right = right.build()?;

	let to_right = Pipe::new(right_reactor, &right);
	let to_left = Pipe::new(left_reactor, &left);
	left.attach(Rc::new(LoopbackEnd {
		outgoing: Rc::clone(&to_right),
		incoming: Rc::clone(&to_left),
	}));
	right.attach(Rc::new(LoopbackEnd {
		outgoing: to_left,
		incoming: to_right,
	}));
	Ok((left, right))
}
