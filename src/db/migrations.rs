// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.
// Older databases may already hold some of these tables with fewer columns, so
// every table is created IF NOT EXISTS and missing columns are added afterwards.

use rusqlite::Connection;
use anyhow::Result;

use crate::constants::{DEFAULT_CATEGORY, PLUGIN_PRESET_CATEGORY};

/// All migrations in order. Each migration is a SQL string.
const MIGRATIONS: &[&str] = &[
    // Migration 1: Library tables
    r#"
    CREATE TABLE IF NOT EXISTS patches (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        device TEXT NOT NULL DEFAULT '',
        manufacturer TEXT,
        category TEXT NOT NULL DEFAULT 'Uncategorized',
        tags TEXT NOT NULL DEFAULT '[]',
        sysex BLOB,
        parameters TEXT,
        patch_type TEXT NOT NULL DEFAULT 'hardware',
        plugin_id TEXT,
        source_path TEXT,
        last_used TEXT,
        created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        modified TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );

    CREATE TABLE IF NOT EXISTS patch_sets (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        device TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        modified TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );

    CREATE TABLE IF NOT EXISTS patch_set_items (
        set_id TEXT NOT NULL REFERENCES patch_sets(id) ON DELETE CASCADE,
        patch_id TEXT NOT NULL REFERENCES patches(id) ON DELETE CASCADE,
        order_index INTEGER NOT NULL,
        PRIMARY KEY (set_id, patch_id)
    );

    CREATE TABLE IF NOT EXISTS plugins (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        type TEXT NOT NULL DEFAULT '',
        category TEXT NOT NULL DEFAULT '',
        manufacturer TEXT NOT NULL DEFAULT 'Unknown',
        path TEXT NOT NULL DEFAULT '',
        preset_count INTEGER NOT NULL DEFAULT 0,
        created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        modified TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );

    CREATE TABLE IF NOT EXISTS vendor_cache (
        key TEXT PRIMARY KEY NOT NULL,
        manufacturer TEXT,
        source_url TEXT,
        confidence REAL NOT NULL DEFAULT 0,
        updated TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );

    CREATE TABLE IF NOT EXISTS knowledge_docs (
        id TEXT PRIMARY KEY NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL DEFAULT '',
        source TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );
    "#,
];

/// Columns every table must carry. Probed on each open and added when an older
/// database lacks them. Declarations must be valid for ALTER TABLE ADD COLUMN
/// (constant defaults only).
const REQUIRED_COLUMNS: &[(&str, &str, &str)] = &[
    ("patches", "device", "TEXT NOT NULL DEFAULT ''"),
    ("patches", "manufacturer", "TEXT"),
    ("patches", "category", "TEXT NOT NULL DEFAULT 'Uncategorized'"),
    ("patches", "tags", "TEXT NOT NULL DEFAULT '[]'"),
    ("patches", "sysex", "BLOB"),
    ("patches", "parameters", "TEXT"),
    ("patches", "patch_type", "TEXT NOT NULL DEFAULT 'hardware'"),
    ("patches", "plugin_id", "TEXT"),
    ("patches", "source_path", "TEXT"),
    ("patches", "last_used", "TEXT"),
    ("patches", "created", "TEXT NOT NULL DEFAULT ''"),
    ("patches", "modified", "TEXT NOT NULL DEFAULT ''"),
    ("patch_sets", "device", "TEXT NOT NULL DEFAULT ''"),
    ("patch_sets", "description", "TEXT NOT NULL DEFAULT ''"),
    ("patch_sets", "created", "TEXT NOT NULL DEFAULT ''"),
    ("patch_sets", "modified", "TEXT NOT NULL DEFAULT ''"),
    ("patch_set_items", "order_index", "INTEGER NOT NULL DEFAULT 0"),
    ("plugins", "type", "TEXT NOT NULL DEFAULT ''"),
    ("plugins", "category", "TEXT NOT NULL DEFAULT ''"),
    ("plugins", "manufacturer", "TEXT NOT NULL DEFAULT 'Unknown'"),
    ("plugins", "path", "TEXT NOT NULL DEFAULT ''"),
    ("plugins", "preset_count", "INTEGER NOT NULL DEFAULT 0"),
    ("plugins", "created", "TEXT NOT NULL DEFAULT ''"),
    ("plugins", "modified", "TEXT NOT NULL DEFAULT ''"),
    ("vendor_cache", "manufacturer", "TEXT"),
    ("vendor_cache", "source_url", "TEXT"),
    ("vendor_cache", "confidence", "REAL NOT NULL DEFAULT 0"),
    ("vendor_cache", "updated", "TEXT NOT NULL DEFAULT ''"),
    ("knowledge_docs", "body", "TEXT NOT NULL DEFAULT ''"),
    ("knowledge_docs", "source", "TEXT"),
    ("knowledge_docs", "tags", "TEXT NOT NULL DEFAULT '[]'"),
    ("knowledge_docs", "created", "TEXT NOT NULL DEFAULT ''"),
];

/// Indexes are created after column probing so they never reference a column
/// an older table does not have yet.
const INDEXES: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_patches_device ON patches(device);
    CREATE INDEX IF NOT EXISTS idx_patches_category ON patches(category);
    CREATE INDEX IF NOT EXISTS idx_patches_type ON patches(patch_type);
    CREATE INDEX IF NOT EXISTS idx_patch_sets_device ON patch_sets(device);
    CREATE INDEX IF NOT EXISTS idx_patch_set_items_set ON patch_set_items(set_id, order_index);
    CREATE INDEX IF NOT EXISTS idx_patch_set_items_patch ON patch_set_items(patch_id);
    CREATE INDEX IF NOT EXISTS idx_plugins_path ON plugins(path);
"#;

/// Outcome of schema preparation
#[derive(Debug, Clone, Default)]
pub struct SchemaReport {
    pub added_columns: Vec<String>,
    pub normalized_rows: usize,
    pub fts_enabled: bool,
}

/// Get current schema version from database
fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "PRAGMA user_version",
        [],
        |row| row.get(0)
    )?;
    Ok(version)
}

/// Run all pending migrations (crash-safe)
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = MIGRATIONS.len() as u32;

    // Refuse to open a DB created by a newer build
    if current_version > target_version {
        anyhow::bail!(
            "Database schema version {} is newer than this build supports (max {}). Please upgrade Patch Atlas.",
            current_version,
            target_version
        );
    }

    if current_version == target_version {
        return Ok(());
    }

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        conn.execute_batch(migration)?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", migration_version))?;

        log::info!("Applied migration {}", migration_version);
    }

    Ok(())
}

/// Bring a database up to date: versioned migrations, additive columns,
/// indexes, the optional full-text index and legacy row normalization.
pub fn prepare_schema(conn: &Connection) -> Result<SchemaReport> {
    run_migrations(conn)?;
    let added_columns = ensure_columns(conn)?;
    conn.execute_batch(INDEXES)?;
    let fts_enabled = ensure_fts(conn);
    let normalized_rows = normalize_legacy_rows(conn)?;

    Ok(SchemaReport {
        added_columns,
        normalized_rows,
        fts_enabled,
    })
}

/// Column names of a table
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Add any required column missing from an existing table. Never drops anything.
fn ensure_columns(conn: &Connection) -> Result<Vec<String>> {
    let mut added = Vec::new();
    let mut current_table = "";
    let mut existing: Vec<String> = Vec::new();

    for (table, column, decl) in REQUIRED_COLUMNS {
        if *table != current_table {
            existing = table_columns(conn, table)?;
            current_table = *table;
        }
        if existing.iter().any(|c| c == column) {
            continue;
        }
        conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN \"{}\" {}", table, column, decl))?;
        existing.push(column.to_string());
        log::info!("Added missing column {}.{}", table, column);
        added.push(format!("{}.{}", table, column));
    }

    Ok(added)
}

/// Create the knowledge-doc full-text index. Returns false when FTS5 is not
/// available; search then falls back to substring matching.
fn ensure_fts(conn: &Connection) -> bool {
    let existed: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = 'knowledge_docs_fts')",
            [],
            |row| row.get(0),
        )
        .unwrap_or(false);
    if existed {
        return true;
    }

    let created = conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_docs_fts USING fts5(doc_id UNINDEXED, title, body);"
    );
    if let Err(e) = created {
        log::warn!("Full-text index unavailable, doc search uses substring matching: {}", e);
        return false;
    }

    // Backfill docs written before the index existed
    if let Err(e) = conn.execute_batch(
        "INSERT INTO knowledge_docs_fts (doc_id, title, body) SELECT id, title, body FROM knowledge_docs;"
    ) {
        log::warn!("Full-text backfill failed: {}", e);
    }
    true
}

/// Rewrite legacy values that newer code would misread.
fn normalize_legacy_rows(conn: &Connection) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE patches SET category = ?1
         WHERE patch_type = 'plugin' AND (category IS NULL OR TRIM(category) = '' OR category = ?2)",
        rusqlite::params![PLUGIN_PRESET_CATEGORY, DEFAULT_CATEGORY],
    )?;
    let stamped = conn.execute(
        "UPDATE patches SET created = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE created = ''",
        [],
    )?;
    conn.execute(
        "UPDATE patches SET modified = created WHERE modified = ''",
        [],
    )?;
    if changed > 0 {
        log::info!("Normalized {} legacy plugin preset categories", changed);
    }
    Ok(changed + stamped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn test_fresh_database_gets_all_tables() {
        let conn = open();
        let report = prepare_schema(&conn).unwrap();
        assert!(report.added_columns.is_empty(), "fresh tables need no probing");

        let count: i32 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('patches','patch_sets','patch_set_items','plugins','vendor_cache','knowledge_docs')",
            [],
            |row| row.get(0),
        ).unwrap();
        assert_eq!(count, 6);
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let conn = open();
        prepare_schema(&conn).unwrap();
        let second = prepare_schema(&conn).unwrap();
        assert!(second.added_columns.is_empty());
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_legacy_table_gains_columns_and_normalizes_plugins() {
        let conn = open();
        conn.execute_batch(
            "CREATE TABLE patches (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                category TEXT,
                patch_type TEXT NOT NULL DEFAULT 'hardware'
             );
             INSERT INTO patches (id, name, category, patch_type) VALUES ('a', 'Old Lead', 'Uncategorized', 'plugin');
             INSERT INTO patches (id, name, category, patch_type) VALUES ('b', 'Old Pad', '', 'plugin');
             INSERT INTO patches (id, name, category, patch_type) VALUES ('c', 'Old Bass', 'Bass', 'plugin');
             INSERT INTO patches (id, name, category, patch_type) VALUES ('d', 'Old Keys', 'Uncategorized', 'hardware');",
        ).unwrap();

        let report = prepare_schema(&conn).unwrap();
        assert!(report.added_columns.contains(&"patches.tags".to_string()));
        assert!(report.added_columns.contains(&"patches.last_used".to_string()));

        let columns = table_columns(&conn, "patches").unwrap();
        for required in ["device", "sysex", "plugin_id", "source_path", "created", "modified"] {
            assert!(columns.iter().any(|c| c == required), "missing {required}");
        }

        let category = |id: &str| -> String {
            conn.query_row("SELECT category FROM patches WHERE id = ?1", [id], |r| r.get(0)).unwrap()
        };
        assert_eq!(category("a"), PLUGIN_PRESET_CATEGORY);
        assert_eq!(category("b"), PLUGIN_PRESET_CATEGORY);
        assert_eq!(category("c"), "Bass");
        assert_eq!(category("d"), DEFAULT_CATEGORY);

        let tags: String = conn.query_row("SELECT tags FROM patches WHERE id = 'a'", [], |r| r.get(0)).unwrap();
        assert_eq!(tags, "[]");
    }

    #[test]
    fn test_refuses_newer_schema() {
        let conn = open();
        conn.execute_batch("PRAGMA user_version = 99").unwrap();
        assert!(run_migrations(&conn).is_err());
    }
}
