use bigdecimal::BigDecimal;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use crate::db::SharedConnection;
use crate::error::Result;
use crate::types::PriceRecord;

/// Applies normalized records to the catalog tables in bounded, atomic
/// batches.
///
/// Two upsert phases per record, then a history append:
/// 1. canonical identity keyed by barcode — merge keeps the first non-null
///    name/brand and always refreshes `last_seen_at`;
/// 2. retailer product keyed by `(retailer_id, item_code)` — the latest
///    feed wins, overwriting barcode and display name;
/// 3. price observation append — one row per observation, never collapsed,
///    since re-ingest protection lives in the file ledger, not here.
#[derive(Clone)]
pub struct PriceStore {
    conn: SharedConnection,
    batch_size: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UpsertResult {
    pub records: usize,
    pub canonical: usize,
    pub prices: usize,
}

impl UpsertResult {
    pub fn absorb(&mut self, other: UpsertResult) {
        self.records += other.records;
        self.canonical += other.canonical;
        self.prices += other.prices;
    }
}

/// Canonical product row, as read back for reporting and tests.
#[derive(Debug, Clone)]
pub struct CanonicalRow {
    pub barcode: String,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub last_seen_at: String,
}

#[derive(Debug, Clone)]
pub struct RetailerProductRow {
    pub retailer_id: String,
    pub item_code: String,
    pub barcode: Option<String>,
    pub original_name: Option<String>,
}

impl PriceStore {
    pub fn new(conn: SharedConnection, batch_size: usize) -> Self {
        Self { conn, batch_size: batch_size.max(1) }
    }

    /// Upserts a parsed file's records. Each batch runs in one
    /// transaction: a database failure rolls the whole batch back and
    /// surfaces as a persistence error for the file.
    pub fn apply(&self, records: &[PriceRecord]) -> Result<UpsertResult> {
        let mut total = UpsertResult::default();

        for batch in records.chunks(self.batch_size) {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;

            for record in batch {
                if let Some(barcode) = &record.barcode {
                    tx.execute(
                        "INSERT INTO canonical_products (barcode, name, brand, last_seen_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(barcode) DO UPDATE SET
                             name = COALESCE(name, excluded.name),
                             brand = COALESCE(brand, excluded.brand),
                             last_seen_at = excluded.last_seen_at",
                        params![
                            barcode,
                            non_empty(&record.name),
                            record.brand,
                            record.observed_at.to_rfc3339()
                        ],
                    )?;
                    total.canonical += 1;
                }

                tx.execute(
                    "INSERT INTO retailer_products (retailer_id, item_code, barcode, original_name)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(retailer_id, item_code) DO UPDATE SET
                         barcode = excluded.barcode,
                         original_name = excluded.original_name",
                    params![record.source_id, record.item_code, record.barcode, non_empty(&record.name)],
                )?;

                tx.execute(
                    "INSERT INTO prices (retailer_id, item_code, store_id, price_amount, currency, observed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.source_id,
                        record.item_code,
                        record.store_id,
                        record.price.as_ref().map(BigDecimal::to_string),
                        record.currency,
                        record.observed_at.to_rfc3339()
                    ],
                )?;
                total.prices += 1;
                total.records += 1;
            }

            tx.commit()?;
            debug!(records = batch.len(), "committed upsert batch");
        }

        Ok(total)
    }

    pub fn canonical(&self, barcode: &str) -> Result<Option<CanonicalRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT barcode, name, brand, last_seen_at FROM canonical_products WHERE barcode = ?1",
                params![barcode],
                canonical_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn retailer_product(
        &self,
        retailer_id: &str,
        item_code: &str,
    ) -> Result<Option<RetailerProductRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT retailer_id, item_code, barcode, original_name
                 FROM retailer_products WHERE retailer_id = ?1 AND item_code = ?2",
                params![retailer_id, item_code],
                retailer_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Price-history rows for one retailer item.
    pub fn price_count(&self, retailer_id: &str, item_code: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM prices WHERE retailer_id = ?1 AND item_code = ?2",
            params![retailer_id, item_code],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Total price rows across all sources; the cheap idempotence probe.
    pub fn total_price_rows(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM prices", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Empty display names must not shadow a real name under COALESCE.
fn non_empty(s: &str) -> Option<&str> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn canonical_from_row(row: &Row<'_>) -> rusqlite::Result<CanonicalRow> {
    Ok(CanonicalRow {
        barcode: row.get(0)?,
        name: row.get(1)?,
        brand: row.get(2)?,
        last_seen_at: row.get(3)?,
    })
}

fn retailer_from_row(row: &Row<'_>) -> rusqlite::Result<RetailerProductRow> {
    Ok(RetailerProductRow {
        retailer_id: row.get(0)?,
        item_code: row.get(1)?,
        barcode: row.get(2)?,
        original_name: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::{TimeZone, Utc};
    use std::str::FromStr;

    fn record(barcode: Option<&str>, name: &str, brand: Option<&str>) -> PriceRecord {
        PriceRecord {
            source_id: "mega".to_string(),
            item_code: "1001".to_string(),
            barcode: barcode.map(String::from),
            name: name.to_string(),
            brand: brand.map(String::from),
            price: Some(BigDecimal::from_str("6.90").unwrap()),
            currency: "ILS".to_string(),
            store_id: "31".to_string(),
            observed_at: Utc.with_ymd_and_hms(2026, 8, 6, 8, 0, 0).unwrap(),
        }
    }

    fn store() -> PriceStore {
        PriceStore::new(db::open_in_memory().unwrap(), 1000)
    }

    #[test]
    fn canonical_merge_keeps_first_non_null_per_field() {
        let store = store();

        let mut first = record(Some("7290000046724"), "Milk 3% 1L", None);
        store.apply(std::slice::from_ref(&first)).unwrap();

        first.name = "Milk 1L fresh".to_string();
        first.brand = Some("Tnuva".to_string());
        first.observed_at = Utc.with_ymd_and_hms(2026, 8, 7, 8, 0, 0).unwrap();
        store.apply(&[first]).unwrap();

        let row = store.canonical("7290000046724").unwrap().unwrap();
        // Name came from the first writer, brand from the second.
        assert_eq!(row.name.as_deref(), Some("Milk 3% 1L"));
        assert_eq!(row.brand.as_deref(), Some("Tnuva"));
        // last_seen_at always refreshed.
        assert!(row.last_seen_at.starts_with("2026-08-07"));
    }

    #[test]
    fn retailer_product_takes_the_latest_barcode_and_name() {
        let store = store();

        store.apply(&[record(Some("7290000046724"), "Old label", None)]).unwrap();
        store.apply(&[record(Some("7290000099999"), "New label", None)]).unwrap();

        let row = store.retailer_product("mega", "1001").unwrap().unwrap();
        assert_eq!(row.barcode.as_deref(), Some("7290000099999"));
        assert_eq!(row.original_name.as_deref(), Some("New label"));
    }

    #[test]
    fn price_history_is_append_only() {
        let store = store();

        for day in 1..=3 {
            let mut r = record(Some("7290000046724"), "Milk", None);
            r.observed_at = Utc.with_ymd_and_hms(2026, 8, day, 8, 0, 0).unwrap();
            store.apply(&[r]).unwrap();
        }

        assert_eq!(store.price_count("mega", "1001").unwrap(), 3);
    }

    #[test]
    fn barcodeless_records_are_stored_without_canonical_identity() {
        let store = store();
        let result = store.apply(&[record(None, "Loose tomatoes", None)]).unwrap();
        assert_eq!(result.records, 1);
        assert_eq!(result.canonical, 0);

        assert!(store.canonical("1001").unwrap().is_none());
        let row = store.retailer_product("mega", "1001").unwrap().unwrap();
        assert!(row.barcode.is_none());
    }

    #[test]
    fn priceless_records_append_a_null_amount_row() {
        let store = store();
        let mut r = record(Some("7290000046724"), "Mystery", None);
        r.price = None;
        store.apply(&[r]).unwrap();
        assert_eq!(store.price_count("mega", "1001").unwrap(), 1);
    }

    #[test]
    fn batches_split_and_all_commit() {
        let store = PriceStore::new(db::open_in_memory().unwrap(), 2);
        let records: Vec<PriceRecord> = (0..5)
            .map(|i| {
                let mut r = record(None, "bulk", None);
                r.item_code = format!("code-{i}");
                r
            })
            .collect();
        let result = store.apply(&records).unwrap();
        assert_eq!(result.records, 5);
        assert_eq!(store.total_price_rows().unwrap(), 5);
    }
}
