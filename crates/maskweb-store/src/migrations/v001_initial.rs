//! v001 -- Initial schema creation.
//!
//! Creates the namespaced key-value table and the media cache table.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Key-value (registry and other small client documents)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,               -- JSON document
    updated_at TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Media cache
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS media_cache (
    cache_name   TEXT NOT NULL,
    key          TEXT NOT NULL,             -- canonical resource address
    content_type TEXT NOT NULL,
    size         INTEGER NOT NULL,
    data         BLOB NOT NULL,
    created_at   TEXT NOT NULL,

    PRIMARY KEY (cache_name, key)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
