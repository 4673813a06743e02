use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use spindle_rpc::{IoHandle, Reactor, Session, SessionBuilder, Transport};
use tracing::{debug, trace};

const READ_CHUNK: usize = 64 * 1024;
/// Bytes read per readiness callback before yielding to the reactor.
const READ_BUDGET: usize = 4 * READ_CHUNK;

/// Non-blocking socket driving one session.
///
/// Holds the session until the connection closes; the session holds this as its transport.
struct StreamIo {
	reactor: Rc<dyn Reactor>,
	stream: TcpStream,
	fd: RawFd,
	session: RefCell<Option<Session>>,
	outbox: RefCell<BytesMut>,
	handles: RefCell<Vec<IoHandle>>,
	closed: Cell<bool>,
}

impl StreamIo {
	/// Reads what the socket holds into the session's framer, then dispatches it.
	///
	/// Buffering everything read before dispatching lets a blocking call made by a handler find
	/// the bytes in the framer; the edge that announced them will not fire again. At most
	/// [`READ_BUDGET`] bytes are taken per callback: the rest is read by a deferred task queued
	/// before dispatch, so other connections and timers get their turn and the framer can reject
	/// an oversized frame before the peer's whole stream sits in memory.
	fn on_readable(self: &Rc<Self>) {
		if self.closed.get() {
			return;
		}
		let Some(session) = self.session.borrow().clone() else {
			return;
		};

		let mut read = 0;
		let mut eof = false;
		let mut failure = None;
		let mut chunk = [0u8; READ_CHUNK];
		loop {
			if read >= READ_BUDGET {
				let again = Rc::downgrade(self);
				self.reactor.defer(Box::new(move || {
					if let Some(io) = again.upgrade() {
						io.on_readable();
					}
				}));
				break;
			}
			match (&self.stream).read(&mut chunk) {
				Ok(0) => {
					eof = true;
					break;
				}
				Ok(n) => {
					read += n;
					if !session.feed(&chunk[..n]) {
						return;
					}
				}
				Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
				Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
				Err(err) => {
					failure = Some(err);
					break;
				}
			}
		}

		if read > 0 {
			trace!(session = session.label(), len = read, buffered = session.buffered(), "reactor.stream.read");
			session.pump();
		}
		if failure.is_some() || eof {
			debug!(session = session.label(), eof, "reactor.stream.closed_by_peer");
			session.connection_lost(failure);
		}
	}

	fn on_writable(&self) {
		if self.closed.get() {
			return;
		}
		if let Err(err) = self.flush() {
			let session = self.session.borrow().clone();
			if let Some(session) = session {
				session.connection_lost(Some(err));
			}
		}
	}

	/// Writes queued bytes until the socket would block.
	fn flush(&self) -> io::Result<()> {
		let mut outbox = self.outbox.borrow_mut();
		while !outbox.is_empty() {
			match (&self.stream).write(&outbox) {
				Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
				Ok(n) => outbox.advance(n),
				Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
				Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
				Err(err) => return Err(err),
			}
		}
		Ok(())
	}
}

impl Transport for StreamIo {
	fn send(&self, frame: Bytes) -> io::Result<()> {
		if self.closed.get() {
			return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
		}
		self.outbox.borrow_mut().extend_from_slice(&frame);
		self.flush()
	}

	fn close(&self) {
		if self.closed.replace(true) {
			return;
		}
		// Best effort: whatever the socket accepts right now still reaches the peer.
		let _ = self.flush();
		let handles = std::mem::take(&mut *self.handles.borrow_mut());
		for handle in handles {
			if let Err(err) = self.reactor.deregister(handle) {
				debug!(fd = self.fd, error = %err, "reactor.stream.deregister_failed");
			}
		}
		let _ = self.stream.shutdown(Shutdown::Both);
		let session = self.session.borrow_mut().take();
		drop(session);
	}
}

/// Creates a session from `builder` and connects it to `stream`.
///
/// The builder's reactor must support descriptor readiness (a [`crate::PollReactor`]).
///
/// # Errors
///
/// Configuration errors, or [`spindle_rpc::Error::Io`] when the stream cannot be registered.
pub fn attach(stream: TcpStream, builder: SessionBuilder) -> spindle_rpc::Result<Session> {
	let reactor = Rc::clone(builder.reactor());
	let session = builder.build()?;
	let fd = stream.as_raw_fd();
	let io = Rc::new(StreamIo {
		reactor: Rc::clone(&reactor),
		stream,
		fd,
		session: RefCell::new(Some(session.clone())),
		outbox: RefCell::new(BytesMut::new()),
		handles: RefCell::new(Vec::new()),
		closed: Cell::new(false),
	});

	let on_read: Weak<StreamIo> = Rc::downgrade(&io);
	let on_write = Weak::clone(&on_read);
	let registered = reactor
		.register_readable(
			fd,
			Rc::new(move || {
				if let Some(io) = on_read.upgrade() {
					io.on_readable();
				}
			}),
		)
		.and_then(|read| {
			io.handles.borrow_mut().push(read);
			reactor.register_writable(
				fd,
				Rc::new(move || {
					if let Some(io) = on_write.upgrade() {
						io.on_writable();
					}
				}),
			)
		});
	match registered {
		Ok(write) => io.handles.borrow_mut().push(write),
		Err(err) => {
			io.close();
			return Err(err.into());
		}
	}

	session.attach(io.clone());
	// Bytes that arrived before registration produced no edge.
	let pending_read = Rc::downgrade(&io);
	reactor.defer(Box::new(move || {
		if let Some(io) = pending_read.upgrade() {
			io.on_readable();
		}
	}));
	Ok(session)
}

/// Connects to `addr` and attaches the stream to a new session.
///
/// The TCP handshake itself blocks; everything after it is non-blocking.
///
/// # Errors
///
/// Connection failures, plus everything [`attach`] reports.
pub fn connect(addr: SocketAddr, builder: SessionBuilder) -> spindle_rpc::Result<Session> {
	let stream = std::net::TcpStream::connect(addr)?;
	stream.set_nonblocking(true)?;
	stream.set_nodelay(true)?;
	attach(TcpStream::from_std(stream), builder)
}
