//! JSON envelopes: string-keyed maps that always carry a `type`.
//!
//! No schema is fixed beyond `type`; handlers own their own fields.

use crate::error::{TalkError, TalkResult};
use crate::messages::{fields, ERROR_PREFIX};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    /// Create an envelope with only a `type` field.
    pub fn new(msg_type: &str) -> Self {
        let mut map = Map::new();
        map.insert(fields::TYPE.to_string(), Value::String(msg_type.to_string()));
        Self(map)
    }

    /// Build a reply of `msg_type` that echoes `request` under `recv`.
    pub fn reply_to(msg_type: &str, request: &Envelope) -> Self {
        Self::new(msg_type).with(fields::RECV, request.clone())
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// The `type` field, when present and a string.
    pub fn msg_type(&self) -> Option<&str> {
        self.get_str(fields::TYPE)
    }

    pub fn is_error(&self) -> bool {
        self.msg_type()
            .map(|t| t.starts_with(ERROR_PREFIX))
            .unwrap_or(false)
    }

    /// The `SENDER_ID` correlation tag attached by a client.
    pub fn correlation_id(&self) -> Option<u64> {
        self.get(fields::SENDER_ID).and_then(Value::as_u64)
    }

    /// The correlation tag of the envelope this one answers (`recv.SENDER_ID`).
    pub fn echoed_correlation_id(&self) -> Option<u64> {
        self.get(fields::RECV)?
            .get(fields::SENDER_ID)
            .and_then(Value::as_u64)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn encode(&self) -> TalkResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    /// Decode bytes as an envelope. The payload must be a JSON object; the
    /// `type` field is checked by the dispatcher, not here.
    pub fn decode(bytes: &[u8]) -> TalkResult<Self> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(TalkError::Codec(format!(
                "envelope must be a JSON object, got {}",
                kind_of(&other)
            ))),
        }
    }
}

impl From<Envelope> for Value {
    fn from(envelope: Envelope) -> Self {
        Value::Object(envelope.0)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;
    use serde_json::json;

    #[test]
    fn new_sets_type() {
        let env = Envelope::new(GET_USERS);
        assert_eq!(env.msg_type(), Some("getUsers"));
        assert!(!env.is_error());
    }

    #[test]
    fn decode_rejects_non_objects() {
        assert!(Envelope::decode(b"[1,2]").is_err());
        assert!(Envelope::decode(b"\"ready\"").is_err());
        assert!(Envelope::decode(b"-4").is_err());
        assert!(Envelope::decode(b"{not json").is_err());
    }

    #[test]
    fn decode_keeps_unknown_fields() {
        let env = Envelope::decode(br#"{"type":"whisper","user":"bob","extra":[1]}"#).unwrap();
        assert_eq!(env.get_str(fields::USER), Some("bob"));
        assert_eq!(env.get("extra"), Some(&json!([1])));
    }

    #[test]
    fn missing_type_is_none() {
        let env = Envelope::decode(br#"{"message":"hi"}"#).unwrap();
        assert_eq!(env.msg_type(), None);
        let env = Envelope::decode(br#"{"type":5}"#).unwrap();
        assert_eq!(env.msg_type(), None);
    }

    #[test]
    fn reply_echoes_request_and_correlation() {
        let req = Envelope::new(GET_USERS).with(fields::SENDER_ID, 4242u64);
        let reply = Envelope::reply_to(GET_USERS, &req).with(fields::USERS, json!(["alice"]));
        assert_eq!(req.correlation_id(), Some(4242));
        assert_eq!(reply.echoed_correlation_id(), Some(4242));
        assert_eq!(reply.get(fields::RECV), Some(&json!({"type": "getUsers", "SENDER_ID": 4242})));
    }

    #[test]
    fn error_prefix_detection() {
        assert!(Envelope::new(ERROR_INVALID_USER).is_error());
        assert!(!Envelope::new(WHISPER_OK).is_error());
    }
}
