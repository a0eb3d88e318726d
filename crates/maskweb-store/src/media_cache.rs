//! Keyed blob cache for downloaded media (images, audio, video).
//!
//! Entries are keyed by a canonical form of the resource address so that the
//! same private file fetched with different per-request tokens hits a single
//! entry.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use url::Url;

use maskweb_shared::constants::MEDIA_CACHE_NAME;

use crate::database::Database;
use crate::error::Result;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Canonical cache key for a resource address.
///
/// `{origin}/file/private/{id}/{token}` becomes `{origin}/file/private/{id}`;
/// every other absolute address is normalised by the URL parser. Addresses
/// that do not parse are used verbatim.
pub fn cache_key(address: &str) -> String {
    let Ok(url) = Url::parse(address) else {
        return address.to_string();
    };

    let parts: Vec<&str> = url.path().split('/').collect();
    if parts.len() == 5 && parts[1] == "file" && parts[2] == "private" {
        return format!(
            "{}/file/private/{}",
            url.origin().ascii_serialization(),
            parts[3]
        );
    }

    url.to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes: u64,
}

/// View of the media cache table for one cache namespace.
pub struct MediaCache<'a> {
    db: &'a Database,
    name: &'a str,
}

impl Database {
    pub fn media_cache(&self) -> MediaCache<'_> {
        MediaCache {
            db: self,
            name: MEDIA_CACHE_NAME,
        }
    }
}

impl<'a> MediaCache<'a> {
    pub fn has(&self, address: &str) -> Result<bool> {
        let found: Option<i64> = self
            .db
            .conn()
            .query_row(
                "SELECT 1 FROM media_cache WHERE cache_name = ?1 AND key = ?2",
                params![self.name, cache_key(address)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get(&self, address: &str) -> Result<Option<Vec<u8>>> {
        let data = self
            .db
            .conn()
            .query_row(
                "SELECT data FROM media_cache WHERE cache_name = ?1 AND key = ?2",
                params![self.name, cache_key(address)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    pub fn content_type(&self, address: &str) -> Result<Option<String>> {
        let content_type = self
            .db
            .conn()
            .query_row(
                "SELECT content_type FROM media_cache WHERE cache_name = ?1 AND key = ?2",
                params![self.name, cache_key(address)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content_type)
    }

    pub fn put(&self, address: &str, data: &[u8], content_type: Option<&str>) -> Result<()> {
        let key = cache_key(address);
        self.db.conn().execute(
            "INSERT OR REPLACE INTO media_cache (cache_name, key, content_type, size, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.name,
                key,
                content_type.unwrap_or(DEFAULT_CONTENT_TYPE),
                data.len() as i64,
                data,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tracing::debug!(key = %key, size = data.len(), "cached media file");
        Ok(())
    }

    /// Drop every entry of this namespace. Returns the number removed.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.db.conn().execute(
            "DELETE FROM media_cache WHERE cache_name = ?1",
            params![self.name],
        )?;
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let (entries, total_bytes): (i64, i64) = self.db.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM media_cache WHERE cache_name = ?1",
            params![self.name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CacheStats {
            entries: entries.max(0) as u64,
            total_bytes: total_bytes.max(0) as u64,
        })
    }
}
