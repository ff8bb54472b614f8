use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Single SQLite connection shared by the ledger and the upsert engine.
/// All writers go through keyed upserts or appends partitioned by
/// `(retailer_id, *)`, so serializing access behind one mutex is enough.
pub type SharedConnection = Arc<Mutex<Connection>>;

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA foreign_keys=ON;

    CREATE TABLE IF NOT EXISTS canonical_products (
        barcode       TEXT PRIMARY KEY,
        name          TEXT,
        brand         TEXT,
        last_seen_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS retailer_products (
        retailer_id    TEXT NOT NULL,
        item_code      TEXT NOT NULL,
        barcode        TEXT,
        original_name  TEXT,
        PRIMARY KEY (retailer_id, item_code)
    );

    CREATE TABLE IF NOT EXISTS prices (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        retailer_id  TEXT NOT NULL,
        item_code    TEXT NOT NULL,
        store_id     TEXT NOT NULL,
        price_amount TEXT,
        currency     TEXT NOT NULL,
        observed_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_prices_item
        ON prices (retailer_id, item_code, observed_at);

    CREATE TABLE IF NOT EXISTS processed_files (
        retailer_id   TEXT NOT NULL,
        file_key      TEXT NOT NULL,
        processed_at  TEXT NOT NULL,
        outcome       TEXT NOT NULL,
        PRIMARY KEY (retailer_id, file_key)
    );
"#;

/// Opens (creating if needed) the database file and applies the schema.
pub fn open<P: AsRef<Path>>(path: P) -> Result<SharedConnection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    info!("opened database at {}", path.display());
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database, used by tests.
pub fn open_in_memory() -> Result<SharedConnection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(Mutex::new(conn)))
}
