//! Structural payload checks run before dispatch.

use clinic_core::errors::GatewayError;
use clinic_core::message::{Message, MessageType};
use serde_json::Value;

/// Longest accepted question, in characters.
pub const MAX_QUERY_CHARS: usize = 10_000;

/// Accepted feedback ratings.
pub const RATING_RANGE: std::ops::RangeInclusive<i64> = 1..=5;

/// Topics a connection may subscribe to.
pub const KNOWN_TOPICS: [&str; 4] = ["connections", "sessions", "queries", "conversation"];

/// Validate the payload shape of `message` for its type.
///
/// Types without a rule pass through.
pub fn validate(message: &Message) -> Result<(), GatewayError> {
    let payload = &message.payload;
    match message.message_type {
        MessageType::Query => validate_query(payload),
        MessageType::Feedback => validate_feedback(payload),
        MessageType::Cancel => require_str(payload, "queryId").map(|_| ()),
        MessageType::Subscribe | MessageType::Unsubscribe => validate_topics(payload),
        _ => Ok(()),
    }
}

fn validate_query(payload: &Value) -> Result<(), GatewayError> {
    let text = require_str(payload, "query")
        .map_err(|_| GatewayError::InvalidMessage("query text must not be empty".into()))?;
    if text.chars().count() > MAX_QUERY_CHARS {
        return Err(GatewayError::InvalidMessage(format!(
            "query text exceeds {MAX_QUERY_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_feedback(payload: &Value) -> Result<(), GatewayError> {
    let _ = require_str(payload, "messageId")?;
    match payload.get("rating").and_then(Value::as_i64) {
        Some(r) if RATING_RANGE.contains(&r) => Ok(()),
        _ => Err(GatewayError::InvalidMessage(
            "rating must be an integer between 1 and 5".into(),
        )),
    }
}

fn validate_topics(payload: &Value) -> Result<(), GatewayError> {
    let Some(topics) = payload.get("topics").and_then(Value::as_array) else {
        return Err(GatewayError::InvalidMessage("topics must be a list".into()));
    };
    for topic in topics {
        match topic.as_str() {
            Some(t) if KNOWN_TOPICS.contains(&t) => {}
            Some(t) => {
                return Err(GatewayError::InvalidMessage(format!("unknown topic `{t}`")));
            }
            None => return Err(GatewayError::InvalidMessage("topics must be strings".into())),
        }
    }
    Ok(())
}

/// Non-blank string field of the payload.
fn require_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, GatewayError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| GatewayError::InvalidMessage(format!("payload.{field} is required")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(kind: &str, payload: Value) -> Message {
        let mut m = Message::outbound(MessageType::from(kind), "abc12345", payload);
        m.id = "m1".into();
        m
    }

    #[test]
    fn query_needs_text() {
        assert!(validate(&msg("query", json!({"query": "horário"}))).is_ok());
        for bad in [json!({}), json!({"query": ""}), json!({"query": "   "}), json!({"query": 3})] {
            let err = validate(&msg("query", bad)).unwrap_err();
            assert!(err.to_string().contains("must not be empty"));
        }
    }

    #[test]
    fn query_length_is_bounded() {
        let long = "a".repeat(MAX_QUERY_CHARS + 1);
        assert!(validate(&msg("query", json!({ "query": long }))).is_err());
    }

    #[test]
    fn rating_must_be_integer_in_range() {
        for ok in [1, 3, 5] {
            assert!(validate(&msg("feedback", json!({"messageId": "m", "rating": ok}))).is_ok());
        }
        for bad in [json!(0), json!(6), json!(4.5), json!("5"), json!(null)] {
            let err = validate(&msg("feedback", json!({"messageId": "m", "rating": bad}))).unwrap_err();
            assert!(err.to_string().contains("rating"), "{err}");
        }
    }

    #[test]
    fn topics_are_checked() {
        assert!(validate(&msg("subscribe", json!({"topics": ["queries"]}))).is_ok());
        assert!(validate(&msg("subscribe", json!({"topics": ["secrets"]}))).is_err());
        assert!(validate(&msg("unsubscribe", json!({}))).is_err());
    }

    #[test]
    fn other_types_pass() {
        assert!(validate(&msg("ping", json!(null))).is_ok());
        assert!(validate(&msg("inventory_lookup", json!({}))).is_ok());
    }
}
