//! RPC correlation and reentrant call engine for callback-driven reactors.
//!
//! This crate provides the protocol core of a spindle connection. The event loop itself is a
//! collaborator behind the [`Reactor`] trait:
//! * [`Codec`]: Stateless translation between [`Message`] and msgpack, JSON-RPC or postcard bytes
//! * [`Framer`]: Incremental extraction of complete wire messages from a byte stream
//! * [`PendingCalls`]: Call-id allocation, continuation bookkeeping and timeouts
//! * [`Session`]: Per-connection dispatcher and the reentrant blocking [`Session::call`]
//! * [`Service`]: Immutable method and notification registries shared between sessions
//!
//! # Blocking calls
//!
//! [`Session::call`] emulates a blocking call on a single thread by re-entering
//! [`Reactor::run_once`] until the matching response arrives. The calling frame stays on the stack
//! for the whole call, so nesting depth (a handler calling back into its peer, whose handler calls
//! back again, ...) is bounded only by the host thread's stack. No execution state is saved
//! anywhere else. [`Session::begin_call`] is the non-nesting alternative: it returns a future
//! resolved by the dispatcher.

#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod error;
pub mod framer;
pub mod loopback;
pub mod message;
pub mod pending;
pub mod reactor;
pub mod service;
pub mod session;
pub mod sink;
pub mod transport;

pub use codec::{Codec, WireFormat};
pub use config::SessionConfig;
pub use error::{CallError, Error, ErrorCode, FramingError, ResponseError, Result};
pub use framer::{Framer, Framing};
pub use message::{CallId, Message, Notification, Params, Request, Response};
pub use pending::{CallOutcome, Continuation, PendingCall, PendingCalls};
pub use reactor::{Interest, IoCallback, IoHandle, LocalReactor, Reactor, ReadyQueue, Task, TimerHandle, TimerQueue};
pub use serde_json::Value;
pub use service::{
	DeferredHandler, HandlerResult, NotificationHandler, RequestHandler, Responder, Service, ServiceBuilder, decode_params,
	encode_result,
};
pub use session::{PendingReply, Session, SessionBuilder, SessionStats, WeakSession};
pub use sink::{ErrorSink, SinkEvent, TracingSink};
pub use transport::Transport;
