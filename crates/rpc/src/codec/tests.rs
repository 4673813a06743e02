use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;
use serde_json::{Value, json};

use super::*;
use crate::error::{ErrorCode, ResponseError};
use crate::message::{CallId, Message};

fn value_strategy() -> BoxedStrategy<Value> {
	let leaf = prop_oneof![
		Just(Value::Null),
		any::<bool>().prop_map(Value::Bool),
		any::<i64>().prop_map(Value::from),
		any::<u64>().prop_map(Value::from),
		// Quarter steps are exact in binary, so text formats reproduce them bit for bit.
		(-4000i32..4000).prop_map(|n| Value::from(f64::from(n) / 4.0)),
		"[a-zA-Z0-9 _-]{0,12}".prop_map(Value::String),
	];
	leaf.prop_recursive(3, 24, 4, |inner| {
		prop_oneof![
			prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
			prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
				.prop_map(|map| Value::Object(map.into_iter().collect())),
		]
	})
	.boxed()
}

fn error_strategy() -> impl Strategy<Value = ResponseError> {
	(any::<i64>(), "[ -~]{0,16}", prop::option::of(value_strategy())).prop_map(|(code, message, data)| ResponseError {
		code: ErrorCode(code),
		message,
		data,
	})
}

fn message_strategy(id_limit: u64) -> impl Strategy<Value = Message> {
	let id = (0..=id_limit).prop_map(CallId);
	let method = "[a-z_./]{1,12}";
	let params = prop::collection::vec(value_strategy(), 0..4);
	prop_oneof![
		(id.clone(), method, params.clone()).prop_map(|(id, m, p)| Message::request(id, m, p)),
		(id.clone(), value_strategy()).prop_map(|(id, v)| Message::response_ok(id, v)),
		(id, error_strategy()).prop_map(|(id, e)| Message::response_err(id, e)),
		(method, params).prop_map(|(m, p)| Message::notification(m, p)),
	]
}

fn format_and_message() -> impl Strategy<Value = (WireFormat, Message)> {
	prop::sample::select(WireFormat::ALL.to_vec())
		.prop_flat_map(|format| (Just(format), message_strategy(format.codec().id_limit())))
}

proptest! {
	#[test]
	fn roundtrip_preserves_messages((format, msg) in format_and_message()) {
		let codec = format.codec();
		let bytes = codec.encode(&msg).expect("encode");
		let decoded = codec.decode(&bytes).expect("decode");
		prop_assert_eq!(decoded, msg);
	}
}

#[rstest]
fn empty_payloads_roundtrip(#[values(WireFormat::MsgPack, WireFormat::Json, WireFormat::Native)] format: WireFormat) {
	let codec = format.codec();
	for msg in [
		Message::request(CallId(0), "", vec![]),
		Message::notification("tick", vec![]),
		Message::response_ok(CallId(1), Value::Null),
		Message::response_ok(CallId(2), json!([])),
		Message::response_err(CallId(3), ResponseError::new(ErrorCode(0), "")),
	] {
		let bytes = codec.encode(&msg).expect("encode");
		assert_eq!(codec.decode(&bytes).expect("decode"), msg);
	}
}

#[test]
fn msgpack_request_layout() {
	let bytes = MsgPackCodec
		.encode(&Message::request(CallId(7), "add", vec![json!(2), json!(3)]))
		.expect("encode");
	let raw: Value = rmp_serde::from_slice(&bytes).expect("plain msgpack");
	assert_eq!(raw, json!([0, 7, "add", [2, 3]]));
}

#[test]
fn msgpack_response_and_notification_layout() {
	let ok = MsgPackCodec.encode(&Message::response_ok(CallId(7), json!(5))).expect("encode");
	let raw: Value = rmp_serde::from_slice(&ok).expect("plain msgpack");
	assert_eq!(raw, json!([1, 7, null, 5]));

	let notif = MsgPackCodec.encode(&Message::notification("log", vec![json!("hello")])).expect("encode");
	let raw: Value = rmp_serde::from_slice(&notif).expect("plain msgpack");
	assert_eq!(raw, json!([2, "log", ["hello"]]));
}

#[test]
fn msgpack_nil_error_and_nil_result_is_a_null_result() {
	let bytes = rmp_serde::to_vec(&(1u8, 4u32, (), ())).expect("encode");
	assert_eq!(MsgPackCodec.decode(&bytes).expect("decode"), Message::response_ok(CallId(4), Value::Null));
}

#[test]
fn msgpack_rejects_both_error_and_result() {
	let bytes = rmp_serde::to_vec(&(1u8, 4u32, "boom", 5)).expect("encode");
	assert!(matches!(MsgPackCodec.decode(&bytes), Err(crate::Error::Protocol(_))));
}

#[test]
fn msgpack_foreign_error_value_is_wrapped() {
	let bytes = rmp_serde::to_vec(&(1u8, 4u32, "division by zero", ())).expect("encode");
	let Message::Response(resp) = MsgPackCodec.decode(&bytes).expect("decode") else {
		panic!("expected a response");
	};
	let err = resp.result.expect_err("error response");
	assert_eq!(err.code, ErrorCode::APPLICATION_ERROR);
	assert_eq!(err.message, "division by zero");
	assert_eq!(err.data, Some(json!("division by zero")));
}

#[test]
fn msgpack_rejects_wrong_arity_and_unknown_tag() {
	let short = rmp_serde::to_vec(&(0u8, 1u32, "add")).expect("encode");
	assert!(matches!(MsgPackCodec.decode(&short), Err(crate::Error::Protocol(_))));

	let unknown = rmp_serde::to_vec(&(9u8, "x", ())).expect("encode");
	assert!(matches!(MsgPackCodec.decode(&unknown), Err(crate::Error::Protocol(_))));
}

#[test]
fn msgpack_rejects_ids_wider_than_32_bits() {
	let bytes = rmp_serde::to_vec(&(0u8, u64::from(u32::MAX) + 1, "add", [1, 2])).expect("encode");
	assert!(matches!(MsgPackCodec.decode(&bytes), Err(crate::Error::Protocol(_))));
}

#[test]
fn json_wire_shapes() {
	let req: Value = serde_json::from_slice(
		&JsonCodec
			.encode(&Message::request(CallId(1), "add", vec![json!(2), json!(3)]))
			.expect("encode"),
	)
	.expect("json");
	assert_eq!(req, json!({"jsonrpc": "2.0", "id": 1, "method": "add", "params": [2, 3]}));

	let notif: Value = serde_json::from_slice(
		&JsonCodec
			.encode(&Message::notification("log", vec![json!("hello")]))
			.expect("encode"),
	)
	.expect("json");
	assert_eq!(notif, json!({"jsonrpc": "2.0", "method": "log", "params": ["hello"]}));

	let err: Value = serde_json::from_slice(
		&JsonCodec
			.encode(&Message::response_err(CallId(1), ResponseError::method_not_found("nope")))
			.expect("encode"),
	)
	.expect("json");
	assert_eq!(
		err,
		json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "method not found: nope"}})
	);
}

#[test]
fn json_response_with_null_result_is_not_empty() {
	let msg = JsonCodec
		.decode(br#"{"jsonrpc":"2.0","id":3,"result":null}"#)
		.expect("decode");
	assert_eq!(msg, Message::response_ok(CallId(3), Value::Null));
}

#[rstest]
#[case::both(br#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#.as_slice())]
#[case::neither(br#"{"jsonrpc":"2.0","id":1}"#.as_slice())]
#[case::batch(br#"[{"jsonrpc":"2.0","method":"a"}]"#.as_slice())]
#[case::old_version(br#"{"jsonrpc":"1.0","method":"a","params":[]}"#.as_slice())]
#[case::named_params(br#"{"jsonrpc":"2.0","method":"a","params":{"x":1}}"#.as_slice())]
#[case::string_id(br#"{"jsonrpc":"2.0","id":"abc","method":"a","params":[]}"#.as_slice())]
#[case::unsafe_id(br#"{"jsonrpc":"2.0","id":9007199254740992,"method":"a","params":[]}"#.as_slice())]
fn json_protocol_violations(#[case] frame: &[u8]) {
	assert!(matches!(JsonCodec.decode(frame), Err(crate::Error::Protocol(_))));
}

#[test]
fn json_missing_params_means_empty() {
	let msg = JsonCodec.decode(br#"{"jsonrpc":"2.0","method":"ping"}"#).expect("decode");
	assert_eq!(msg, Message::notification("ping", vec![]));
}

#[rstest]
fn garbage_is_a_framing_error(#[values(WireFormat::MsgPack, WireFormat::Json, WireFormat::Native)] format: WireFormat) {
	let result = format.codec().decode(&[0xc1, 0xff, 0x00]);
	assert!(matches!(result, Err(crate::Error::Framing(_))), "{format}: {result:?}");
}

#[test]
fn wire_format_parses_case_insensitively() {
	assert_eq!("MsgPack".parse::<WireFormat>(), Ok(WireFormat::MsgPack));
	assert_eq!("json".parse::<WireFormat>(), Ok(WireFormat::Json));
	assert!("xml".parse::<WireFormat>().is_err());
}
