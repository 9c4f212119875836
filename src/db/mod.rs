// Database module

pub mod migrations;
pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use anyhow::Result;

use crate::constants::{DB_FILENAME, JSON_FILENAME};

pub use migrations::SchemaReport;

/// Open or create a database at the given path and bring its schema up to date
pub fn open_db(db_path: &Path) -> Result<(Connection, SchemaReport)> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)?;
    configure(&conn)?;

    // WAL only applies to file databases
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    let report = migrations::prepare_schema(&conn)?;
    Ok((conn, report))
}

/// Open a private in-memory database with the full schema
pub fn open_memory_db() -> Result<(Connection, SchemaReport)> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    let report = migrations::prepare_schema(&conn)?;
    Ok((conn, report))
}

fn configure(conn: &Connection) -> Result<()> {
    // Enable foreign keys (must be done per connection)
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
    Ok(())
}

/// Get the SQLite path for a data directory
pub fn get_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILENAME)
}

/// Get the JSON document path for a data directory
pub fn get_json_path(data_dir: &Path) -> PathBuf {
    data_dir.join(JSON_FILENAME)
}
