use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::db::SharedConnection;
use crate::error::Result;
use crate::types::IngestOutcome;

/// Durable record of which files have been ingested; the sole idempotency
/// gate. A row is written only after the file's batch upserts committed,
/// so the ledger never claims success for a half-ingested file.
#[derive(Clone)]
pub struct ProcessedFileLedger {
    conn: SharedConnection,
}

impl ProcessedFileLedger {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Whether this file was already ingested successfully. `force` mode
    /// bypasses the read gate only; it never mutates or deletes ledger
    /// rows, so a normal run afterwards still sees the full history.
    /// Failed rows do not gate: the file stays eligible for retry.
    pub fn is_processed(&self, source_id: &str, file_key: &str, force: bool) -> Result<bool> {
        if force {
            return Ok(false);
        }
        let conn = self.conn.lock().unwrap();
        let outcome: Option<String> = conn
            .query_row(
                "SELECT outcome FROM processed_files WHERE retailer_id = ?1 AND file_key = ?2",
                params![source_id, file_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(outcome.as_deref() == Some("success"))
    }

    /// Records the terminal outcome for a file, overwriting any previous
    /// row for the same `(source_id, file_key)`.
    pub fn mark(&self, source_id: &str, file_key: &str, outcome: IngestOutcome) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO processed_files (retailer_id, file_key, processed_at, outcome)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(retailer_id, file_key) DO UPDATE SET
                 processed_at = excluded.processed_at,
                 outcome = excluded.outcome",
            params![source_id, file_key, Utc::now().to_rfc3339(), outcome.as_str()],
        )?;
        debug!(source = source_id, file = file_key, outcome = outcome.as_str(), "ledger updated");
        Ok(())
    }

    /// Number of ledger rows for a source, regardless of outcome.
    pub fn row_count(&self, source_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_files WHERE retailer_id = ?1",
            params![source_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// Timestamp gate: a file older than the source's cutoff is skipped even
/// if never seen, bounding catch-up cost after long outages. Files with
/// no declared timestamp are never considered stale.
pub fn is_stale(declared_at: Option<DateTime<Utc>>, cutoff_days: Option<i64>) -> bool {
    match (declared_at, cutoff_days) {
        (Some(ts), Some(days)) => ts < Utc::now() - Duration::days(days),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn gate_opens_only_after_success() {
        let ledger = ProcessedFileLedger::new(db::open_in_memory().unwrap());

        assert!(!ledger.is_processed("mega", "f1.gz", false).unwrap());

        ledger.mark("mega", "f1.gz", IngestOutcome::Failed).unwrap();
        assert!(!ledger.is_processed("mega", "f1.gz", false).unwrap());

        ledger.mark("mega", "f1.gz", IngestOutcome::Success).unwrap();
        assert!(ledger.is_processed("mega", "f1.gz", false).unwrap());

        // One row per (source, file), not one per mark.
        assert_eq!(ledger.row_count("mega").unwrap(), 1);
    }

    #[test]
    fn force_bypasses_the_read_gate_without_touching_history() {
        let ledger = ProcessedFileLedger::new(db::open_in_memory().unwrap());
        ledger.mark("mega", "f1.gz", IngestOutcome::Success).unwrap();

        assert!(!ledger.is_processed("mega", "f1.gz", true).unwrap());
        // The stored row survives a forced read.
        assert!(ledger.is_processed("mega", "f1.gz", false).unwrap());
        assert_eq!(ledger.row_count("mega").unwrap(), 1);
    }

    #[test]
    fn sources_do_not_share_ledger_rows() {
        let ledger = ProcessedFileLedger::new(db::open_in_memory().unwrap());
        ledger.mark("mega", "f1.gz", IngestOutcome::Success).unwrap();
        assert!(!ledger.is_processed("city-market", "f1.gz", false).unwrap());
    }

    #[test]
    fn staleness_needs_both_timestamp_and_cutoff() {
        let old = Some(Utc::now() - Duration::days(30));
        let fresh = Some(Utc::now() - Duration::hours(2));
        assert!(is_stale(old, Some(14)));
        assert!(!is_stale(fresh, Some(14)));
        assert!(!is_stale(None, Some(14)));
        assert!(!is_stale(old, None));
    }
}
