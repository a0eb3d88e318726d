//! Interpretation of a message's `content` field.
//!
//! Content is either plain text or a JSON object carrying a `type`
//! discriminator (`{"type":"image","fileId":12}`). Anything that does not
//! parse, or parses without a usable `type`, is shown as the raw text.

use serde_json::Value;

use crate::types::ChatMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    /// Plain text, shown verbatim.
    Text(String),
    /// Structured payload; `kind` is the `type` discriminator.
    Structured { kind: String, payload: Value },
}

impl MessageContent {
    pub fn parse(raw: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return Self::Text(raw.to_string());
        };

        let Some(kind) = value.get("type").and_then(discriminator) else {
            return Self::Text(raw.to_string());
        };

        if kind == "text" {
            let text = value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Self::Text(text);
        }

        Self::Structured {
            kind,
            payload: value,
        }
    }

    /// One-line rendering without the sender prefix.
    pub fn summary(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured { kind, .. } => format!("[{kind}]"),
        }
    }
}

// empty strings, false and null do not count as a discriminator
fn discriminator(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

/// Latest-message preview line: `"{fromName}: {text}"` or `"{fromName}: [{type}]"`.
pub fn preview(message: &ChatMessage) -> String {
    let content = MessageContent::parse(&message.content);
    format!("{}: {}", message.from_name, content.summary())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(content: &str) -> ChatMessage {
        ChatMessage {
            id: 1,
            from_name: "ann".into(),
            content: content.into(),
            timestamp: 0,
        }
    }

    #[test]
    fn plain_text() {
        assert_eq!(preview(&msg("hello")), "ann: hello");
    }

    #[test]
    fn structured_type() {
        let m = msg(r#"{"type":"image","fileId":4}"#);
        assert_eq!(preview(&m), "ann: [image]");
        match MessageContent::parse(&m.content) {
            MessageContent::Structured { kind, payload } => {
                assert_eq!(kind, "image");
                assert_eq!(payload["fileId"], 4);
            }
            other => panic!("expected structured, got {other:?}"),
        }
    }

    #[test]
    fn json_without_type_is_raw_text() {
        assert_eq!(preview(&msg(r#"{"foo":1}"#)), r#"ann: {"foo":1}"#);
    }

    #[test]
    fn text_type_uses_text_field() {
        assert_eq!(preview(&msg(r#"{"type":"text","text":"hey"}"#)), "ann: hey");
    }

    #[test]
    fn scalars_and_empty_type_fall_back() {
        assert_eq!(MessageContent::parse("42"), MessageContent::Text("42".into()));
        assert_eq!(
            MessageContent::parse(r#"{"type":""}"#),
            MessageContent::Text(r#"{"type":""}"#.into())
        );
        assert_eq!(MessageContent::parse("{broken"), MessageContent::Text("{broken".into()));
    }
}
