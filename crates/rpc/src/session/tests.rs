use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::json;

use super::*;
use crate::codec::WireFormat;
use crate::error::ErrorCode;
use crate::loopback;
use crate::reactor::LocalReactor;
use crate::service::{Responder, decode_params};

const SECOND: Option<Duration> = Some(Duration::from_secs(1));

#[derive(Default)]
struct Events(RefCell<Vec<SinkEvent>>);

impl Events {
	fn sink(self: &Rc<Self>) -> impl ErrorSink + 'static {
		let events = Rc::clone(self);
		move |event: SinkEvent| events.0.borrow_mut().push(event)
	}

	fn take(&self) -> Vec<SinkEvent> {
		std::mem::take(&mut *self.0.borrow_mut())
	}
}

/// Captures outgoing frames instead of delivering them.
#[derive(Default)]
struct Recorder {
	frames: RefCell<Vec<Bytes>>,
	closed: Cell<bool>,
}

impl Transport for Recorder {
	fn send(&self, frame: Bytes) -> io::Result<()> {
		self.frames.borrow_mut().push(frame);
		Ok(())
	}

	fn close(&self) {
		self.closed.set(true);
	}
}

fn reactor() -> Rc<dyn Reactor> {
	Rc::new(LocalReactor::new())
}

fn wire(format: WireFormat, msg: &Message) -> BytesMut {
	let mut out = BytesMut::new();
	format
		.default_framing()
		.write_frame(&format.codec().encode(msg).expect("encode"), &mut out)
		.expect("frame");
	out
}

fn decode_all(format: WireFormat, frames: &[Bytes]) -> Vec<Message> {
	let mut framer = Framer::new(format.default_framing(), 1 << 20);
	for frame in frames {
		framer.feed(frame);
	}
	let mut msgs = Vec::new();
	while let Some(body) = framer.try_extract().expect("frame") {
		msgs.push(format.codec().decode(&body).expect("decode"));
	}
	msgs
}

fn arithmetic() -> Rc<Service> {
	Service::builder()
		.register_method("add", |_: &Session, params| {
			let (a, b): (i64, i64) = decode_params(params)?;
			Ok(json!(a + b))
		})
		.register_method("fail", |_: &Session, _| Err(ResponseError::application("no luck").with_data(json!({"why": 1}))))
		.register_method("boom", |_: &Session, _| panic!("handler exploded"))
		.build()
}

fn connected(format: WireFormat, server: Rc<Service>) -> (Session, Session) {
	let reactor = reactor();
	loopback::pair(
		Session::builder(Rc::clone(&reactor)).format(format).label("client"),
		Session::builder(reactor).format(format).label("server").service(server),
	)
	.expect("pair")
}

#[rstest]
fn add_over_every_format(#[values(WireFormat::MsgPack, WireFormat::Json, WireFormat::Native)] format: WireFormat) {
	let (client, server) = connected(format, arithmetic());
	assert_eq!(client.call("add", vec![json!(2), json!(3)], SECOND), Ok(json!(5)));
	assert_eq!(client.depth(), 0);
	assert_eq!(client.pending_calls(), 0);
	assert_eq!(server.stats().requests_received, 1);
	assert_eq!(client.stats().responses_matched, 1);
}

#[test]
fn application_errors_reach_the_caller() {
	let (client, _server) = connected(WireFormat::MsgPack, arithmetic());
	let err = client.call("fail", vec![], SECOND).expect_err("remote error");
	assert_eq!(
		err,
		CallError::Application(ResponseError::application("no luck").with_data(json!({"why": 1})))
	);

	let err = client.call("add", vec![json!("two")], SECOND).expect_err("bad params");
	assert_eq!(err.code(), Some(ErrorCode::INVALID_PARAMS));
}

#[test]
fn unknown_method_is_method_not_found() {
	let (client, _server) = connected(WireFormat::Json, arithmetic());
	let err = client.call("nope", vec![], SECOND).expect_err("missing");
	assert_eq!(err.code(), Some(ErrorCode::METHOD_NOT_FOUND));
	assert_eq!(err, CallError::Application(ResponseError::method_not_found("nope")));
}

#[test]
fn panicking_handler_answers_internal_error() {
	let events = Rc::new(Events::default());
	let reactor = reactor();
	let (client, server) = loopback::pair(
		Session::builder(Rc::clone(&reactor)),
		Session::builder(reactor).service(arithmetic()).sink(events.sink()),
	)
	.expect("pair");

	let err = client.call("boom", vec![], SECOND).expect_err("panicked");
	assert_eq!(err.code(), Some(ErrorCode::INTERNAL_ERROR));
	assert_eq!(
		events.take(),
		[SinkEvent::HandlerPanicked {
			method: "boom".into(),
			message: "handler exploded".into(),
		}]
	);
	assert!(server.is_open());
	assert_eq!(client.call("add", vec![json!(1), json!(1)], SECOND), Ok(json!(2)));
}

#[test]
fn notification_produces_no_response_on_the_wire() {
	let seen = Rc::new(RefCell::new(Vec::new()));
	let service = {
		let seen = Rc::clone(&seen);
		Service::builder()
			.register_notification("log", move |_: &Session, params| {
				seen.borrow_mut().push(params);
				Ok(())
			})
			.build()
	};
	let server = Session::builder(reactor()).service(service).build().expect("session");
	let recorder = Rc::new(Recorder::default());
	server.attach(recorder.clone());

	server.data_received(&wire(WireFormat::MsgPack, &Message::notification("log", vec![json!("hello")])));
	assert_eq!(*seen.borrow(), [vec![json!("hello")]]);
	assert!(recorder.frames.borrow().is_empty());

	// Unknown notifications are dropped without an answer too.
	server.data_received(&wire(WireFormat::MsgPack, &Message::notification("other", vec![])));
	assert!(recorder.frames.borrow().is_empty());
	assert_eq!(server.stats().notifications_received, 2);
}

#[test]
fn requests_arriving_in_one_read_are_answered_in_order() {
	let server = Session::builder(reactor()).service(arithmetic()).build().expect("session");
	let recorder = Rc::new(Recorder::default());
	server.attach(recorder.clone());

	let mut input = BytesMut::new();
	for id in 0..3 {
		input.extend_from_slice(&wire(WireFormat::MsgPack, &Message::request(CallId(id), "add", vec![json!(id), json!(1)])));
	}
	server.data_received(&input);

	let answers = decode_all(WireFormat::MsgPack, &recorder.frames.borrow());
	assert_eq!(
		answers,
		[
			Message::response_ok(CallId(0), json!(1)),
			Message::response_ok(CallId(1), json!(2)),
			Message::response_ok(CallId(2), json!(3)),
		]
	);
}

#[test]
fn notification_handler_errors_go_to_the_sink() {
	let events = Rc::new(Events::default());
	let service = Service::builder()
		.register_notification("strict", |_: &Session, _| Err(ResponseError::application("rejected")))
		.build();
	let reactor = reactor();
	let (client, server) = loopback::pair(
		Session::builder(Rc::clone(&reactor)),
		Session::builder(Rc::clone(&reactor)).service(service).sink(events.sink()),
	)
	.expect("pair");

	client.notify("strict", vec![]).expect("notify");
	reactor.run_once(Some(Duration::ZERO)).expect("run");

	assert_eq!(
		events.take(),
		[SinkEvent::NotificationFailed {
			method: "strict".into(),
			error: ResponseError::application("rejected"),
		}]
	);
	assert!(server.is_open());
	assert_eq!(client.stats().responses_matched, 0);
}

#[test]
fn slow_call_times_out_near_its_deadline() {
	let parked = Rc::new(RefCell::new(Vec::<Responder>::new()));
	let service = {
		let parked = Rc::clone(&parked);
		Service::builder()
			.register_deferred("slow", move |_: &Session, _, responder| parked.borrow_mut().push(responder))
			.build()
	};
	let (client, _server) = connected(WireFormat::MsgPack, service);

	let start = Instant::now();
	let err = client.call("slow", vec![], Some(Duration::from_millis(100))).expect_err("timeout");
	let elapsed = start.elapsed();

	assert!(matches!(err, CallError::Timeout(_)), "{err:?}");
	assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
	assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
	assert_eq!(client.stats().timeouts, 1);
	assert_eq!(parked.borrow().len(), 1);
}

#[test]
fn answer_arriving_after_timeout_is_unmatched() {
	let parked = Rc::new(RefCell::new(Vec::<Responder>::new()));
	let service = {
		let parked = Rc::clone(&parked);
		Service::builder()
			.register_deferred("slow", move |_: &Session, _, responder| parked.borrow_mut().push(responder))
			.build()
	};
	let events = Rc::new(Events::default());
	let reactor = reactor();
	let (client, server) = loopback::pair(
		Session::builder(Rc::clone(&reactor)).label("client").sink(events.sink()),
		Session::builder(Rc::clone(&reactor)).label("server").service(service),
	)
	.expect("pair");

	let completions = Rc::new(Cell::new(0u32));
	let seen = Rc::clone(&completions);
	let id = client
		.call_with("slow", vec![], Some(Duration::from_millis(50)), move |outcome| {
			assert!(matches!(outcome, Err(CallError::Timeout(_))), "{outcome:?}");
			seen.set(seen.get() + 1);
		})
		.expect("sent");
	let deadline = Instant::now() + Duration::from_secs(2);
	while completions.get() == 0 && Instant::now() < deadline {
		reactor.run_once(Some(Duration::from_millis(10))).expect("run");
	}
	assert_eq!(completions.get(), 1);
	assert_eq!(client.stats().timeouts, 1);

	let responder = parked.borrow_mut().pop().expect("parked");
	responder.ok(json!("late"));
	for _ in 0..4 {
		reactor.run_once(Some(Duration::ZERO)).expect("run");
	}

	assert_eq!(events.take(), [SinkEvent::UnmatchedResponse { id }]);
	assert_eq!(client.stats().unmatched_responses, 1);
	assert_eq!(client.stats().responses_matched, 0);
	assert_eq!(completions.get(), 1);
	assert!(client.is_open());
	assert!(server.is_open());
}

#[test]
fn timeout_fires_despite_unrelated_traffic() {
	let ticks = Rc::new(Cell::new(0u32));
	let parked = Rc::new(RefCell::new(Vec::<Responder>::new()));
	let service = {
		let parked = Rc::clone(&parked);
		Service::builder()
			.register_deferred("slow", move |session: &Session, _, responder| {
				parked.borrow_mut().push(responder);
				chatter(session.downgrade(), 100);
			})
			.build()
	};
	let client_service = {
		let ticks = Rc::clone(&ticks);
		Service::builder()
			.register_notification("tick", move |_: &Session, _| {
				ticks.set(ticks.get() + 1);
				Ok(())
			})
			.build()
	};

	let reactor = reactor();
	let (client, _server) = loopback::pair(
		Session::builder(Rc::clone(&reactor)).service(client_service),
		Session::builder(reactor).service(service),
	)
	.expect("pair");

	let start = Instant::now();
	let err = client.call("slow", vec![], Some(Duration::from_millis(100))).expect_err("timeout");
	assert!(matches!(err, CallError::Timeout(_)));
	assert!(start.elapsed() < Duration::from_millis(400));
	assert!(ticks.get() > 3, "only {} ticks", ticks.get());
}

/// Sends a `tick` notification every 5ms, `remaining` times.
fn chatter(session: WeakSession, remaining: u32) {
	let Some(live) = session.upgrade() else {
		return;
	};
	if remaining == 0 || live.notify("tick", vec![]).is_err() {
		return;
	}
	live.reactor()
		.schedule_after(Duration::from_millis(5), Box::new(move || chatter(session, remaining - 1)));
}

#[test]
fn nested_call_does_not_reorder_dispatch() {
	let log = Rc::new(RefCell::new(Vec::<String>::new()));
	let server_service = {
		let log_first = Rc::clone(&log);
		let log_rest = Rc::clone(&log);
		Service::builder()
			.register_method("first", move |session: &Session, _| {
				log_first.borrow_mut().push("first:start".into());
				let pong = session.call("ping", vec![], SECOND).map_err(|e| ResponseError::internal(e.to_string()))?;
				log_first.borrow_mut().push(format!("first:end:{pong}"));
				Ok(json!(1))
			})
			.register_method("next", move |_: &Session, params| {
				log_rest.borrow_mut().push(format!("next:{}", params[0]));
				Ok(params[0].clone())
			})
			.build()
	};
	let client_service = Service::builder()
		.register_method("ping", |session: &Session, _| {
			// The client is blocked in `wait` while it answers.
			assert_eq!(session.depth(), 1);
			Ok(json!("pong"))
		})
		.build();

	let reactor = reactor();
	let (client, server) = loopback::pair(
		Session::builder(Rc::clone(&reactor)).service(client_service),
		Session::builder(reactor).service(server_service),
	)
	.expect("pair");

	let first = client.begin_call("first", vec![], SECOND);
	let second = client.begin_call("next", vec![json!(2)], SECOND);
	let third = client.begin_call("next", vec![json!(3)], SECOND);

	assert_eq!(client.wait(first), Ok(json!(1)));
	assert_eq!(client.wait(second), Ok(json!(2)));
	assert_eq!(client.wait(third), Ok(json!(3)));
	assert_eq!(*log.borrow(), ["first:start", "next:2", "next:3", "first:end:\"pong\""]);
	assert_eq!(server.depth(), 0);
}

#[test]
fn teardown_fails_every_outstanding_call() {
	let parked = Rc::new(RefCell::new(Vec::<Responder>::new()));
	let service = {
		let parked = Rc::clone(&parked);
		Service::builder()
			.register_deferred("slow", move |_: &Session, _, responder| parked.borrow_mut().push(responder))
			.build()
	};
	let reactor = reactor();
	let (client, server) = loopback::pair(
		Session::builder(Rc::clone(&reactor)),
		Session::builder(Rc::clone(&reactor)).service(service),
	)
	.expect("pair");

	let mut a = client.begin_call("slow", vec![], None);
	let mut b = client.begin_call("slow", vec![], None);
	let outcome = Rc::new(RefCell::new(None));
	let seen = Rc::clone(&outcome);
	client.call_with("slow", vec![], None, move |result| *seen.borrow_mut() = Some(result));
	reactor.run_once(Some(Duration::ZERO)).expect("deliver");
	assert_eq!(parked.borrow().len(), 3);
	assert_eq!(client.pending_calls(), 3);

	client.close();
	assert_eq!(client.pending_calls(), 0);
	assert_eq!(a.try_result(), Some(Err(CallError::ConnectionClosed)));
	assert_eq!(b.try_result(), Some(Err(CallError::ConnectionClosed)));
	assert_eq!(*outcome.borrow(), Some(Err(CallError::ConnectionClosed)));
	assert_eq!(client.call("slow", vec![], None), Err(CallError::ConnectionClosed));
	assert!(matches!(client.notify("x", vec![]), Err(Error::Closed)));

	// The peer observes end-of-stream on the next pass; parked answers are discarded.
	reactor.run_once(Some(Duration::ZERO)).expect("hang up");
	assert!(!server.is_open());
	parked.borrow_mut().clear();
}

#[test]
fn unmatched_response_is_reported_and_survived() {
	let events = Rc::new(Events::default());
	let session = Session::builder(reactor()).sink(events.sink()).build().expect("session");
	session.attach(Rc::new(Recorder::default()));

	session.data_received(&wire(WireFormat::MsgPack, &Message::response_ok(CallId(999), json!(1))));
	assert_eq!(events.take(), [SinkEvent::UnmatchedResponse { id: CallId(999) }]);
	assert!(session.is_open());
	assert_eq!(session.stats().unmatched_responses, 1);
}

#[test]
fn framing_error_closes_the_session() {
	let events = Rc::new(Events::default());
	let session = Session::builder(reactor()).sink(events.sink()).build().expect("session");
	let recorder = Rc::new(Recorder::default());
	session.attach(recorder.clone());

	let reply = session.begin_call("never", vec![], None);
	session.data_received(&[0xc1]);

	assert!(!session.is_open());
	assert!(recorder.closed.get());
	assert!(matches!(events.take().as_slice(), [SinkEvent::Framing(_)]));
	assert_eq!(session.wait(reply), Err(CallError::ConnectionClosed));
}

#[test]
fn protocol_violation_closes_the_session() {
	let events = Rc::new(Events::default());
	let session = Session::builder(reactor()).sink(events.sink()).build().expect("session");
	session.attach(Rc::new(Recorder::default()));

	let both = rmp_serde::to_vec(&(1u8, 0u32, "err", 1)).expect("encode");
	session.data_received(&both);
	assert!(!session.is_open());
	assert!(matches!(events.take().as_slice(), [SinkEvent::Protocol(_)]));
}

#[test]
fn dropped_responder_answers_internal_error() {
	let service = Service::builder()
		.register_deferred("forgetful", |_: &Session, _, responder: Responder| drop(responder))
		.register_deferred("later", |session: &Session, params, responder: Responder| {
			session
				.reactor()
				.schedule_after(Duration::from_millis(5), Box::new(move || responder.ok(params[0].clone())));
		})
		.build();
	let (client, _server) = connected(WireFormat::Native, service);

	let err = client.call("forgetful", vec![], SECOND).expect_err("dropped");
	assert_eq!(err.code(), Some(ErrorCode::INTERNAL_ERROR));
	assert_eq!(client.call("later", vec![json!("x")], SECOND), Ok(json!("x")));
}

#[test]
fn narrowed_id_space_is_exhausted_by_outstanding_calls() {
	let parked = Rc::new(RefCell::new(Vec::<Responder>::new()));
	let service = {
		let parked = Rc::clone(&parked);
		Service::builder()
			.register_deferred("slow", move |_: &Session, _, responder| parked.borrow_mut().push(responder))
			.build()
	};
	let reactor = reactor();
	let config = SessionConfig {
		id_limit: Some(1),
		..SessionConfig::default()
	};
	let (client, _server) = loopback::pair(
		Session::builder(Rc::clone(&reactor)).config(config),
		Session::builder(reactor).service(service),
	)
	.expect("pair");

	let first = client.begin_call("slow", vec![], None);
	let second = client.begin_call("slow", vec![], None);
	assert_eq!(first.id(), Some(CallId(0)));
	assert_eq!(second.id(), Some(CallId(1)));
	assert_eq!(
		client.call("slow", vec![], None),
		Err(CallError::IdSpaceExhausted { limit: 1 })
	);
}

#[test]
fn invalid_configuration_is_rejected() {
	let config = SessionConfig {
		framing: Some(Framing::MsgPack),
		..SessionConfig::for_format(WireFormat::Json)
	};
	assert!(matches!(Session::builder(reactor()).config(config).build(), Err(Error::Config(_))));
}

#[test]
fn pending_reply_is_a_future() {
	let (client, _server) = connected(WireFormat::MsgPack, arithmetic());
	let mut reply = client.begin_call("add", vec![json!(20), json!(22)], SECOND);

	let waker = std::task::Waker::noop();
	let mut cx = std::task::Context::from_waker(waker);
	assert!(std::pin::Pin::new(&mut reply).poll(&mut cx).is_pending());

	let reactor = Rc::clone(client.reactor());
	while client.pending_calls() > 0 {
		reactor.run_once(Some(Duration::from_millis(10))).expect("run");
	}
	assert_eq!(
		std::pin::Pin::new(&mut reply).poll(&mut cx),
		std::task::Poll::Ready(Ok(json!(42)))
	);
}
