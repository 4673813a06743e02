//! Methods offered by `spindle serve`.
//!
//! | Method | Kind | Behavior |
//! | --- | --- | --- |
//! | `add(a, b)` | request | integer sum |
//! | `echo(value)` | request | returns `value` |
//! | `sleep(ms)` | deferred | answers `ms` after a reactor timer fires |
//! | `callback(method, params)` | request | calls `method` on the caller and returns its result |
//! | `stats()` | request | this session's counters |
//! | `log(message)` | notification | logs `message` |

use std::rc::Rc;
use std::time::Duration;

use serde_json::{Value, json};
use spindle_rpc::{ResponseError, Service, Session, decode_params};
use tracing::info;

/// Builds the demo service.
pub fn service() -> Rc<Service> {
	Service::builder()
		.register_method("add", |_: &Session, params| {
			let (a, b): (i64, i64) = decode_params(params)?;
			a.checked_add(b)
				.map(Value::from)
				.ok_or_else(|| ResponseError::application(format!("{a} + {b} overflows")))
		})
		.register_method("echo", |_: &Session, params| {
			let (value,): (Value,) = decode_params(params)?;
			Ok(value)
		})
		.register_deferred("sleep", |session: &Session, params, responder| {
			let (ms,): (u64,) = match decode_params(params) {
				Ok(args) => args,
				Err(err) => return responder.err(err),
			};
			session.reactor().schedule_after(
				Duration::from_millis(ms),
				Box::new(move || responder.ok(json!(ms))),
			);
		})
		.register_method("callback", |session: &Session, params| {
			let (method, args): (String, Vec<Value>) = decode_params(params)?;
			session.call(&method, args, None).map_err(|err| match err {
				spindle_rpc::CallError::Application(inner) => inner,
				other => ResponseError::application(other.to_string()),
			})
		})
		.register_method("stats", |session: &Session, _| {
			let stats = session.stats();
			Ok(json!({
				"requests_received": stats.requests_received,
				"notifications_received": stats.notifications_received,
				"responses_matched": stats.responses_matched,
				"unmatched_responses": stats.unmatched_responses,
				"timeouts": stats.timeouts,
				"calls_sent": stats.calls_sent,
				"notifications_sent": stats.notifications_sent,
				"pending": session.pending_calls(),
			}))
		})
		.register_notification("log", |session: &Session, params| {
			let (message,): (String,) = decode_params(params)?;
			info!(session = session.label(), %message, "spindle.log");
			Ok(())
		})
		.build()
}
