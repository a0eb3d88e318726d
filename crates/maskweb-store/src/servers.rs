use maskweb_shared::constants::REGISTRY_STORAGE_KEY;

use crate::database::Database;
use crate::error::Result;
use crate::models::ServerRecord;

impl Database {
    /// Load the persisted registry. A missing document is an empty registry.
    pub fn load_server_records(&self) -> Result<Vec<ServerRecord>> {
        match self.get_value(REGISTRY_STORAGE_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the persisted registry with `records`, in order.
    pub fn save_server_records(&self, records: &[ServerRecord]) -> Result<()> {
        let json = serde_json::to_string(records)?;
        self.put_value(REGISTRY_STORAGE_KEY, &json)?;
        tracing::debug!(count = records.len(), "server registry saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, ServerRecord, StoreError};

    fn record(url: &str, ts: i64) -> ServerRecord {
        ServerRecord {
            title: url.to_string(),
            base_url: url.to_string(),
            timestamp: ts,
            token: Some("tok".into()),
            watch_id: 3,
            ..Default::default()
        }
    }

    #[test]
    fn empty_registry_when_nothing_saved() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.load_server_records().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_keeps_order() {
        let db = Database::open_in_memory().unwrap();
        let records = vec![record("http://b", 2), record("http://a", 1)];
        db.save_server_records(&records).unwrap();

        let loaded = db.load_server_records().unwrap();
        assert_eq!(loaded, records);
    }

    #[test]
    fn corrupt_document_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        db.put_value("serverList", "not json").unwrap();
        assert!(matches!(db.load_server_records(), Err(StoreError::Json(_))));
    }
}
