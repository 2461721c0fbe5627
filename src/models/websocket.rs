use serde_json::Value as JsonValue;
use super::chat::Message;

/// A decoded frame from the live channel.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    Message(Message),
    /// `{"detail": ...}` advisory sent by the backend, e.g. when persistence is down.
    Detail(String),
}

pub fn decode_frame(text: &str) -> Result<InboundFrame, serde_json::Error> {
    let value: JsonValue = serde_json::from_str(text)?;
    match value.get("detail") {
        None | Some(JsonValue::Null) | Some(JsonValue::Bool(false)) => {}
        Some(JsonValue::String(detail)) if detail.is_empty() => {}
        Some(JsonValue::String(detail)) => {
            return Ok(InboundFrame::Detail(detail.clone()));
        }
        Some(other) => {
            return Ok(InboundFrame::Detail(other.to_string()));
        }
    }
    serde_json::from_value(value).map(InboundFrame::Message)
}
