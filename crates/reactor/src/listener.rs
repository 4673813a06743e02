use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};

use mio::net::TcpListener;
use spindle_rpc::{IoHandle, Reactor, Session, SessionBuilder, WeakSession};
use tracing::{debug, info, warn};

use crate::stream::attach;

type MakeSession = Box<dyn Fn(SocketAddr) -> SessionBuilder>;

struct Inner {
	reactor: Rc<dyn Reactor>,
	socket: TcpListener,
	local_addr: SocketAddr,
	make: MakeSession,
	sessions: RefCell<Vec<WeakSession>>,
	handle: Cell<Option<IoHandle>>,
}

impl Inner {
	/// Accepts until the backlog is empty.
	fn on_acceptable(&self) {
		loop {
			match self.socket.accept() {
				Ok((stream, peer)) => {
					if let Err(err) = stream.set_nodelay(true) {
						debug!(%peer, error = %err, "reactor.listener.nodelay_failed");
					}
					let builder = (self.make)(peer);
					match attach(stream, builder) {
						Ok(session) => {
							info!(%peer, session = session.label(), "reactor.listener.accepted");
							let mut sessions = self.sessions.borrow_mut();
							sessions.retain(|s| s.upgrade().is_some_and(|s| s.is_open()));
							sessions.push(session.downgrade());
						}
						Err(err) => warn!(%peer, error = %err, "reactor.listener.attach_failed"),
					}
				}
				Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
				Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
				Err(err) => {
					warn!(addr = %self.local_addr, error = %err, "reactor.listener.accept_failed");
					break;
				}
			}
		}
	}
}

/// Listening socket that gives every accepted connection its own session.
///
/// Sessions are built by the `make` closure passed to [`Listener::bind`], which receives the peer
/// address and typically clones a shared [`spindle_rpc::Service`] into a fresh
/// [`SessionBuilder`].
pub struct Listener {
	inner: Rc<Inner>,
}

impl Listener {
	/// Binds `addr` and starts accepting on `reactor`.
	///
	/// # Errors
	///
	/// Fails if the address cannot be bound or the socket cannot be registered.
	pub fn bind<F>(reactor: Rc<dyn Reactor>, addr: SocketAddr, make: F) -> io::Result<Self>
	where
		F: Fn(SocketAddr) -> SessionBuilder + 'static,
	{
		let socket = TcpListener::bind(addr)?;
		let local_addr = socket.local_addr()?;
		let fd = socket.as_raw_fd();
		let inner = Rc::new(Inner {
			reactor: Rc::clone(&reactor),
			socket,
			local_addr,
			make: Box::new(make),
			sessions: RefCell::new(Vec::new()),
			handle: Cell::new(None),
		});

		let weak: Weak<Inner> = Rc::downgrade(&inner);
		let handle = reactor.register_readable(
			fd,
			Rc::new(move || {
				if let Some(inner) = weak.upgrade() {
					inner.on_acceptable();
				}
			}),
		)?;
		inner.handle.set(Some(handle));
		info!(addr = %local_addr, "reactor.listener.bound");
		Ok(Self { inner })
	}

	/// Address actually bound, with the port resolved when binding port 0.
	#[must_use]
	pub fn local_addr(&self) -> SocketAddr {
		self.inner.local_addr
	}

	/// Sessions accepted so far that are still open.
	#[must_use]
	pub fn sessions(&self) -> Vec<Session> {
		self.inner
			.sessions
			.borrow()
			.iter()
			.filter_map(WeakSession::upgrade)
			.filter(Session::is_open)
			.collect()
	}

	/// Stops accepting and closes every open session.
	pub fn close(&self) {
		if let Some(handle) = self.inner.handle.take()
			&& let Err(err) = self.inner.reactor.deregister(handle)
		{
			debug!(addr = %self.inner.local_addr, error = %err, "reactor.listener.deregister_failed");
		}
		for session in self.sessions() {
			session.close();
		}
		self.inner.sessions.borrow_mut().clear();
		info!(addr = %self.inner.local_addr, "reactor.listener.closed");
	}
}

impl Drop for Listener {
	fn drop(&mut self) {
		if let Some(handle) = self.inner.handle.take() {
			let _ = self.inner.reactor.deregister(handle);
		}
	}
}

impl fmt::Debug for Listener {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Listener")
			.field("local_addr", &self.inner.local_addr)
			.field("sessions", &self.sessions().len())
			.finish_non_exhaustive()
	}
}
