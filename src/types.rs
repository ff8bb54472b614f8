use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Standard price-file name shape: `<Kind><chain>-<store>-<YYYYMMDDhhmm>`,
/// e.g. `PriceFull7290027600007-031-202608070300.gz`. Portals that deviate
/// simply yield no hints.
static FILE_NAME_HINTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]+\d+-(\d+)-(\d{12})").expect("valid filename pattern"));

/// A candidate price file enumerated during discovery.
///
/// The `filename` is the stable dedup key for the processed-file ledger;
/// descriptors are never mutated after discovery hands them downstream.
#[derive(Debug, Clone, Serialize)]
pub struct FileDescriptor {
    pub source_id: String,
    pub url: String,
    pub filename: String,
    /// Publication timestamp declared by the portal, recovered from the
    /// filename when it follows the standard shape.
    pub declared_at: Option<DateTime<Utc>>,
    /// Store identifier embedded in the filename, if any. The parser
    /// prefers an explicit tag inside the file over this hint.
    pub store_hint: Option<String>,
}

impl FileDescriptor {
    pub fn new(source_id: &str, url: &str, filename: &str) -> Self {
        let (store_hint, declared_at) = match FILE_NAME_HINTS.captures(filename) {
            Some(caps) => {
                let store = caps.get(1).map(|m| m.as_str().to_string());
                let stamp = caps.get(2).map(|m| m.as_str()).and_then(|s| {
                    NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M")
                        .ok()
                        .map(|dt| dt.and_utc())
                });
                (store, stamp)
            }
            None => (None, None),
        };
        Self {
            source_id: source_id.to_string(),
            url: url.to_string(),
            filename: filename.to_string(),
            declared_at,
            store_hint,
        }
    }

    /// Key under which this file is recorded in the ledger.
    pub fn file_key(&self) -> &str {
        &self.filename
    }
}

/// Downloaded file body, already decompressed. Owned transiently by the
/// download stage and consumed by the parser.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub bytes: Vec<u8>,
    pub was_gzipped: bool,
    /// Digest of the decompressed content, surfaced in run reports.
    pub sha256_hex: String,
}

/// One normalized price observation.
///
/// `barcode` may be absent for retailers that publish internal codes only;
/// such records are still retained keyed by `(source_id, item_code)` and
/// join canonical identity once a barcode shows up in a later feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRecord {
    pub source_id: String,
    pub item_code: String,
    pub barcode: Option<String>,
    pub name: String,
    pub brand: Option<String>,
    pub price: Option<BigDecimal>,
    pub currency: String,
    pub store_id: String,
    pub observed_at: DateTime<Utc>,
}

/// Per-file parse accounting. Every item the parser sees lands in exactly
/// one bucket; nothing is swallowed silently.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ParseReport {
    pub items_seen: usize,
    pub with_barcode: usize,
    pub unparsed_price: usize,
    /// Items with no retailer code at all cannot be keyed and are dropped,
    /// but counted here.
    pub missing_item_code: usize,
}

/// Terminal outcome recorded in the processed-file ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Success,
    Failed,
}

impl IngestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}
