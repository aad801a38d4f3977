//! SQL schema definitions as const strings.
//!
//! A cache file holds one header row and one row per embedded image.

/// SQL to create the cache header table.
///
/// The single row records which model produced every entry and whether the
/// file was fully written.
pub const CREATE_CACHE_HEADER: &str = r#"
CREATE TABLE IF NOT EXISTS cache_header (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    provenance_model TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('building', 'complete')),
    dimension INTEGER NOT NULL,
    entry_count INTEGER NOT NULL,
    created_at TEXT NOT NULL
)
"#;

/// SQL to create the cache entries table.
///
/// `seq` preserves insertion order, which breaks score ties at search time.
pub const CREATE_CACHE_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id TEXT NOT NULL UNIQUE,
    source TEXT NOT NULL,
    description TEXT NOT NULL,
    metadata TEXT,
    vector BLOB NOT NULL,
    model_id TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#;

/// Returns all migrations in order.
pub fn all_migrations() -> [&'static str; 2] {
    [CREATE_CACHE_HEADER, CREATE_CACHE_ENTRIES]
}
