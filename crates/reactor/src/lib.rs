//! Readiness reactor and socket glue for spindle sessions.
//!
//! * [`PollReactor`]: a [`spindle_rpc::Reactor`] over `mio`, edge triggered
//! * [`attach`] / [`connect`]: bind a non-blocking TCP stream to a new session
//! * [`Listener`]: accept connections and give each its own session

#![warn(missing_docs)]

mod listener;
mod poll;
mod stream;

pub use listener::Listener;
pub use poll::PollReactor;
pub use stream::{attach, connect};
