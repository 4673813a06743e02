//! Outgoing byte path of a session.

use std::io;

use bytes::Bytes;

/// Non-blocking sink for framed bytes.
///
/// Implementations queue what cannot be written immediately; `send` never waits for the peer.
pub trait Transport {
	/// Queues one framed message.
	///
	/// # Errors
	///
	/// Fails when the connection is closed or the write failed fatally.
	fn send(&self, frame: Bytes) -> io::Result<()>;

	/// Stops reading and writing. Further sends fail.
	fn close(&self);
}
