use serde_json::{Map, Value};

/// Decoded form of an inbound MQTT payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The payload was a JSON object.
    Object(Map<String, Value>),
    /// Anything else, kept as text. JSON string literals are unquoted.
    Text(String),
}

impl Payload {
    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Payload::Object(map) => Some(map),
            Payload::Text(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Object(_) => "object",
            Payload::Text(_) => "text",
        }
    }
}

/// Decode a raw payload. Never fails: unparsable input falls back to text.
pub fn decode(payload: &[u8]) -> Payload {
    let text = String::from_utf8_lossy(payload);

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Payload::Object(map),
        Ok(Value::String(s)) => Payload::Text(s),
        _ => Payload::Text(text.into_owned()),
    }
}
