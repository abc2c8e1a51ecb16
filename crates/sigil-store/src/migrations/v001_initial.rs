//! v001 -- Initial schema creation.
//!
//! A single ordered key/value table. Records are grouped by key prefix
//! (`keys:`, `session:`, `chain:<conversation>:`, `queue:`), so the primary
//! key index doubles as the range-scan index.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY NOT NULL,   -- ':'-separated ASCII path
    value BLOB NOT NULL                -- opaque (json / bincode / sealed)
) WITHOUT ROWID;
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
