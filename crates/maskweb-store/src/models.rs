//! Plain records persisted in the local database.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use maskweb_shared::MessageId;

/// Persisted form of one registered server.
///
/// Field names match the JSON document earlier client versions wrote, so an
/// existing registry restores unchanged. Connection state, the message log
/// and the profile snapshot are never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    #[serde(default)]
    pub img: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Last activity, epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    /// Preview of the latest message.
    #[serde(rename = "newChatMsg", default)]
    pub preview: String,
    /// Bearer credential; written as `""` when absent.
    #[serde(
        default,
        serialize_with = "token_out",
        deserialize_with = "token_in"
    )]
    pub token: Option<String>,
    #[serde(rename = "watchId", default)]
    pub watch_id: MessageId,
}

fn token_out<S: Serializer>(token: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(token.as_deref().unwrap_or_default())
}

fn token_in<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let token = Option::<String>::deserialize(d)?;
    Ok(token.filter(|t| !t.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_legacy_document() {
        let json = r#"{"img":"a.png","title":"T","description":"D","timestamp":5,
            "baseURL":"http://h:1","newChatMsg":"ann: hi","token":"","watchId":9}"#;
        let rec: ServerRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.base_url, "http://h:1");
        assert_eq!(rec.token, None);
        assert_eq!(rec.watch_id, 9);
        assert_eq!(rec.preview, "ann: hi");
    }

    #[test]
    fn missing_token_and_watch_id_default() {
        let rec: ServerRecord = serde_json::from_str(r#"{"baseURL":"http://h"}"#).unwrap();
        assert_eq!(rec.token, None);
        assert_eq!(rec.watch_id, 0);
    }

    #[test]
    fn absent_token_written_as_empty_string() {
        let rec = ServerRecord {
            base_url: "http://h".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&rec).unwrap();
        assert_eq!(value["token"], "");
        assert_eq!(value["baseURL"], "http://h");
    }
}
