//! Message schema of the wire protocol.
//!
//! Every frame carries one MessagePack map. The reserved field keys are
//! single short strings to keep framing overhead low; the message type is
//! an integer tag. Constructors below build complete well-formed messages,
//! accessors read fields out of received ones.

use rmpv::Value;

pub const MAGIC: &'static str = "vRPC";
pub const VERSION: f64 = 1.0;

/// Request id reserved for the handshake exchange.
pub const HANDSHAKE_RID: i64 = -1;

pub const FIELD_MSG_TYPE: &'static str = "t";
pub const FIELD_MAGIC: &'static str = "m";
pub const FIELD_VERSION: &'static str = "v";
pub const FIELD_REQUEST_ID: &'static str = "rid";
pub const FIELD_CLIENT_ID: &'static str = "cid";
pub const FIELD_TIMEOUT: &'static str = "sla";
pub const FIELD_FUNCTION: &'static str = "fn";
pub const FIELD_ARGS: &'static str = "args";
pub const FIELD_RESULT: &'static str = "res";
pub const FIELD_ERROR: &'static str = "err";
pub const FIELD_VALUE: &'static str = "val";

/// Wire tag of a message, carried in the `t` field.
#[derive(strum::Display, strum::FromRepr, PartialEq, Eq, Clone, Copy)]
#[repr(i64)]
pub enum MessageType {
    HandshakeRequest = 0,
    HandshakeResponse = 1,
    FunctionRequest = 2,
    FunctionResponse = 3,
    GetStreamRequest = 4,
    PutStreamRequest = 5,
    ChatRequest = 6,
    ErrorResponse = 7,
    StreamReady = 8,
    StreamValue = 9,
    StreamEnd = 10,
    CancelRequest = 11,
    ThrottleIncrease = 12,
    ThrottleDecrease = 13,
}

impl std::fmt::Debug for MessageType {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

#[inline]
fn entry(key: &'static str, val: Value) -> (Value, Value) {
    (Value::from(key), val)
}

/// Find a field in a message map. Nil values count as absent.
pub fn get_field<'a>(msg: &'a Value, key: &str) -> Option<&'a Value> {
    if let Value::Map(entries) = msg {
        for (k, v) in entries.iter() {
            if k.as_str() == Some(key) {
                if v.is_nil() {
                    return None;
                }
                return Some(v);
            }
        }
    }
    None
}

/// Take a field out of a message map by value, avoiding a clone of
/// possibly large payloads. Nil values count as absent.
pub fn take_field(msg: &mut Value, key: &str) -> Option<Value> {
    if let Value::Map(entries) = msg {
        for pair in entries.iter_mut() {
            if pair.0.as_str() == Some(key) {
                if pair.1.is_nil() {
                    return None;
                }
                return Some(std::mem::replace(&mut pair.1, Value::Nil));
            }
        }
    }
    None
}

#[inline]
pub fn get_i64(msg: &Value, key: &str) -> Option<i64> {
    get_field(msg, key).and_then(|v| v.as_i64())
}

#[inline]
pub fn get_f64(msg: &Value, key: &str) -> Option<f64> {
    get_field(msg, key).and_then(|v| v.as_f64())
}

#[inline]
pub fn get_str<'a>(msg: &'a Value, key: &str) -> Option<&'a str> {
    get_field(msg, key).and_then(|v| v.as_str())
}

#[inline]
pub fn msg_type(msg: &Value) -> Option<MessageType> {
    MessageType::from_repr(get_i64(msg, FIELD_MSG_TYPE)?)
}

#[inline]
pub fn request_id(msg: &Value) -> Option<i64> {
    get_i64(msg, FIELD_REQUEST_ID)
}

/// Check the handshake sentinel: magic must match exactly, and the peer's
/// version must not be newer than ours.
pub fn valid_magic_and_version(msg: &Value) -> bool {
    if get_str(msg, FIELD_MAGIC) != Some(MAGIC) {
        return false;
    }
    match get_f64(msg, FIELD_VERSION) {
        Some(v) => v <= VERSION,
        None => false,
    }
}

pub fn handshake_request(client_id: i64) -> Value {
    Value::Map(vec![
        entry(FIELD_MAGIC, Value::from(MAGIC)),
        entry(FIELD_VERSION, Value::from(VERSION)),
        entry(FIELD_MSG_TYPE, Value::from(MessageType::HandshakeRequest as i64)),
        entry(FIELD_REQUEST_ID, Value::from(HANDSHAKE_RID)),
        entry(FIELD_CLIENT_ID, Value::from(client_id)),
    ])
}

pub fn handshake_response() -> Value {
    Value::Map(vec![
        entry(FIELD_MAGIC, Value::from(MAGIC)),
        entry(FIELD_VERSION, Value::from(VERSION)),
        entry(FIELD_MSG_TYPE, Value::from(MessageType::HandshakeResponse as i64)),
        entry(FIELD_REQUEST_ID, Value::from(HANDSHAKE_RID)),
    ])
}

fn request(t: MessageType, rid: i64, name: &str, args: Option<Value>, timeout_ms: i64) -> Value {
    let mut entries = vec![
        entry(FIELD_MSG_TYPE, Value::from(t as i64)),
        entry(FIELD_REQUEST_ID, Value::from(rid)),
        entry(FIELD_TIMEOUT, Value::from(timeout_ms)),
        entry(FIELD_FUNCTION, Value::from(name)),
    ];
    if let Some(args) = args {
        entries.push(entry(FIELD_ARGS, args));
    }
    Value::Map(entries)
}

pub fn function_request(rid: i64, name: &str, args: Option<Value>, timeout_ms: i64) -> Value {
    request(MessageType::FunctionRequest, rid, name, args, timeout_ms)
}

pub fn get_stream_request(rid: i64, name: &str, args: Option<Value>, timeout_ms: i64) -> Value {
    request(MessageType::GetStreamRequest, rid, name, args, timeout_ms)
}

pub fn put_stream_request(rid: i64, name: &str, args: Option<Value>, timeout_ms: i64) -> Value {
    request(MessageType::PutStreamRequest, rid, name, args, timeout_ms)
}

pub fn chat_request(rid: i64, name: &str, args: Option<Value>, timeout_ms: i64) -> Value {
    request(MessageType::ChatRequest, rid, name, args, timeout_ms)
}

/// Result is attached only when the function produced one.
pub fn function_response(rid: i64, res: Option<Value>) -> Value {
    let mut entries = vec![
        entry(FIELD_MSG_TYPE, Value::from(MessageType::FunctionResponse as i64)),
        entry(FIELD_REQUEST_ID, Value::from(rid)),
    ];
    if let Some(res) = res {
        entries.push(entry(FIELD_RESULT, res));
    }
    Value::Map(entries)
}

/// A missing request id is reported back with a nil `rid`.
pub fn error_response(rid: Option<i64>, text: String) -> Value {
    let rid = match rid {
        Some(r) => Value::from(r),
        None => Value::Nil,
    };
    Value::Map(vec![
        entry(FIELD_MSG_TYPE, Value::from(MessageType::ErrorResponse as i64)),
        entry(FIELD_REQUEST_ID, rid),
        entry(FIELD_ERROR, Value::from(text)),
    ])
}

pub fn stream_ready(rid: i64) -> Value {
    Value::Map(vec![
        entry(FIELD_MSG_TYPE, Value::from(MessageType::StreamReady as i64)),
        entry(FIELD_REQUEST_ID, Value::from(rid)),
    ])
}

pub fn stream_value(rid: i64, val: Value) -> Value {
    Value::Map(vec![
        entry(FIELD_MSG_TYPE, Value::from(MessageType::StreamValue as i64)),
        entry(FIELD_REQUEST_ID, Value::from(rid)),
        entry(FIELD_VALUE, val),
    ])
}

pub fn stream_end(rid: i64, val: Option<Value>) -> Value {
    let mut entries = vec![
        entry(FIELD_MSG_TYPE, Value::from(MessageType::StreamEnd as i64)),
        entry(FIELD_REQUEST_ID, Value::from(rid)),
    ];
    if let Some(val) = val {
        entries.push(entry(FIELD_VALUE, val));
    }
    Value::Map(entries)
}

pub fn cancel_request(rid: i64) -> Value {
    Value::Map(vec![
        entry(FIELD_MSG_TYPE, Value::from(MessageType::CancelRequest as i64)),
        entry(FIELD_REQUEST_ID, Value::from(rid)),
    ])
}

pub fn throttle_increase(rid: i64) -> Value {
    Value::Map(vec![
        entry(FIELD_MSG_TYPE, Value::from(MessageType::ThrottleIncrease as i64)),
        entry(FIELD_REQUEST_ID, Value::from(rid)),
    ])
}

pub fn throttle_decrease(rid: i64) -> Value {
    Value::Map(vec![
        entry(FIELD_MSG_TYPE, Value::from(MessageType::ThrottleDecrease as i64)),
        entry(FIELD_REQUEST_ID, Value::from(rid)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_fields() {
        let req = handshake_request(7);
        assert_eq!(msg_type(&req), Some(MessageType::HandshakeRequest));
        assert_eq!(request_id(&req), Some(HANDSHAKE_RID));
        assert_eq!(get_i64(&req, FIELD_CLIENT_ID), Some(7));
        assert!(valid_magic_and_version(&req));

        let resp = handshake_response();
        assert_eq!(msg_type(&resp), Some(MessageType::HandshakeResponse));
        assert!(valid_magic_and_version(&resp));
    }

    #[test]
    fn test_magic_and_version_gate() {
        let mut msg = handshake_request(1);
        if let Value::Map(entries) = &mut msg {
            for pair in entries.iter_mut() {
                if pair.0.as_str() == Some(FIELD_VERSION) {
                    pair.1 = Value::from(0.9f64);
                }
            }
        }
        assert!(valid_magic_and_version(&msg));
        if let Value::Map(entries) = &mut msg {
            for pair in entries.iter_mut() {
                if pair.0.as_str() == Some(FIELD_VERSION) {
                    pair.1 = Value::from(1.5f64);
                }
            }
        }
        assert!(!valid_magic_and_version(&msg));

        let bad = Value::Map(vec![
            (Value::from(FIELD_MAGIC), Value::from("mRPC")),
            (Value::from(FIELD_VERSION), Value::from(1.0f64)),
        ]);
        assert!(!valid_magic_and_version(&bad));
    }

    #[test]
    fn test_request_fields() {
        let req = function_request(3, "getName", None, 1000);
        assert_eq!(msg_type(&req), Some(MessageType::FunctionRequest));
        assert_eq!(request_id(&req), Some(3));
        assert_eq!(get_str(&req, FIELD_FUNCTION), Some("getName"));
        assert_eq!(get_i64(&req, FIELD_TIMEOUT), Some(1000));
        assert!(get_field(&req, FIELD_ARGS).is_none());

        let args = Value::Array(vec![Value::from("Alex"), Value::from("Shu")]);
        let req = function_request(4, "setName", Some(args.clone()), 1000);
        assert_eq!(get_field(&req, FIELD_ARGS), Some(&args));
    }

    #[test]
    fn test_response_fields() {
        let resp = function_response(5, None);
        assert!(get_field(&resp, FIELD_RESULT).is_none());
        let resp = function_response(5, Some(Value::from("Alex Shu")));
        assert_eq!(get_str(&resp, FIELD_RESULT), Some("Alex Shu"));

        let err = error_response(None, "request id not found".to_string());
        assert_eq!(request_id(&err), None);
        assert_eq!(get_str(&err, FIELD_ERROR), Some("request id not found"));

        let end = stream_end(9, None);
        assert_eq!(msg_type(&end), Some(MessageType::StreamEnd));
        assert!(get_field(&end, FIELD_VALUE).is_none());
    }

    #[test]
    fn test_take_field() {
        let mut req = function_request(
            4,
            "setName",
            Some(Value::Array(vec![Value::from("a")])),
            0,
        );
        let args = take_field(&mut req, FIELD_ARGS).expect("args");
        assert_eq!(args, Value::Array(vec![Value::from("a")]));
        assert!(get_field(&req, FIELD_ARGS).is_none());
    }

    #[test]
    fn test_message_type_repr() {
        assert_eq!(MessageType::from_repr(0), Some(MessageType::HandshakeRequest));
        assert_eq!(MessageType::from_repr(13), Some(MessageType::ThrottleDecrease));
        assert_eq!(MessageType::from_repr(14), None);
        assert_eq!(MessageType::StreamEnd as i64, 10);
    }
}
