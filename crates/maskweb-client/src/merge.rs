//! Message log merging and the summary fields derived from a log.

use std::collections::BTreeMap;

use maskweb_shared::content::preview;
use maskweb_shared::{ChatMessage, MessageId};

/// Fold `batch` into `log`.
///
/// The result is deduplicated by id and ascending by id. For an id present
/// in both, the incoming message wins. Merging is idempotent and does not
/// depend on batch order (unless the batch itself repeats an id, in which
/// case its last occurrence wins).
pub fn merge_log(
    log: &[ChatMessage],
    batch: impl IntoIterator<Item = ChatMessage>,
) -> Vec<ChatMessage> {
    let mut by_id: BTreeMap<MessageId, ChatMessage> =
        log.iter().map(|m| (m.id, m.clone())).collect();
    for message in batch {
        by_id.insert(message.id, message);
    }
    by_id.into_values().collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    pub preview: String,
    /// Timestamp of the id-maximal message.
    pub timestamp: i64,
    pub watch_id: MessageId,
    pub unread_count: i64,
}

/// Summary fields after a merge. `None` for an empty log, in which case the
/// server's existing fields stay as they are.
///
/// An active server has seen everything: its watch id moves to the latest id.
pub fn summarize(log: &[ChatMessage], watch_id: MessageId, active: bool) -> Option<LogSummary> {
    let latest = log.iter().max_by_key(|m| m.id)?;
    let watch_id = if active { latest.id } else { watch_id };

    Some(LogSummary {
        preview: preview(latest),
        timestamp: latest.timestamp,
        watch_id,
        unread_count: unread_count(latest.id, watch_id),
    })
}

pub fn unread_count(last_id: MessageId, watch_id: MessageId) -> i64 {
    last_id.saturating_sub(watch_id).max(0)
}
