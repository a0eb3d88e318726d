use serde::{Deserialize, Serialize};

/// Server-assigned message id. Monotonic and unique per server.
pub type MessageId = i64;

/// A chat message as delivered by the request API and the messaging channel.
///
/// `content` is either plain text or a JSON-encoded structured payload; see
/// [`crate::content::MessageContent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(default)]
    pub from_name: String,
    #[serde(default)]
    pub content: String,
    /// Epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

/// Envelope every JSON endpoint answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Answer of the version/info endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_uses_camel_case_names() {
        let json = r#"{"id":7,"fromName":"ann","content":"hi","timestamp":1700000000000}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, 7);
        assert_eq!(msg.from_name, "ann");
        assert_eq!(msg.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn message_tolerates_extra_and_missing_fields() {
        let json = r#"{"id":3,"toName":"bob","content":"x"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.from_name, "");
        assert_eq!(msg.timestamp, 0);
    }

    #[test]
    fn envelope_without_data() {
        let resp: ApiResponse<ServerVersion> =
            serde_json::from_str(r#"{"success":false,"message":"nope"}"#).unwrap();
        assert!(!resp.success);
        assert!(resp.data.is_none());
        assert_eq!(resp.message.as_deref(), Some("nope"));
    }
}
