use std::collections::HashMap;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::config::RetailerSource;
use crate::error::{PipelineError, Result};
use crate::types::{FileDescriptor, ParseReport, PriceRecord, RawPayload};

/// Item container tags, in order of preference. Most portals wrap items in
/// `<Item>`; a couple of chains publish `<Product>` instead.
const ITEM_TAGS: [&str; 2] = ["item", "product"];

/// Parses a decompressed price file into normalized records.
///
/// Field extraction is tag-name driven and tolerant: a record missing its
/// barcode is retained keyed by the retailer item code, and a price that
/// will not coerce becomes `None` plus a counter bump. Only a document
/// with no XML content at all (or a syntax error) is treated as corrupt.
pub fn parse(
    payload: &RawPayload,
    source: &RetailerSource,
    descriptor: &FileDescriptor,
) -> Result<(Vec<PriceRecord>, ParseReport)> {
    let mut reader = Reader::from_reader(payload.bytes.as_slice());
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut records = Vec::new();
    let mut report = ParseReport::default();

    let mut saw_element = false;
    // Lowercased tag that opened the current item, when inside one.
    let mut container: Option<String> = None;
    let mut current_tag: Option<String> = None;
    let mut fields: HashMap<String, String> = HashMap::new();
    // Top-level captures like <StoreId> in the file header.
    let mut header: HashMap<String, String> = HashMap::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                saw_element = true;
                let name = lowercase_name(e.local_name().as_ref());
                if container.is_none() && ITEM_TAGS.contains(&name.as_str()) {
                    container = Some(name);
                    current_tag = None;
                    fields.clear();
                } else {
                    current_tag = Some(name);
                }
            }
            Ok(Event::Empty(e)) => {
                saw_element = true;
                let name = lowercase_name(e.local_name().as_ref());
                if container.is_none() && ITEM_TAGS.contains(&name.as_str()) {
                    // Degenerate `<Item/>`: seen, but nothing to key on.
                    report.items_seen += 1;
                    report.missing_item_code += 1;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| corrupt(descriptor, format!("bad text content: {e}")))?
                    .trim()
                    .to_string();
                store_text(text, &container, &current_tag, &mut fields, &mut header);
            }
            Ok(Event::CData(t)) => {
                let text = String::from_utf8_lossy(&t).trim().to_string();
                store_text(text, &container, &current_tag, &mut fields, &mut header);
            }
            Ok(Event::End(e)) => {
                let name = lowercase_name(e.local_name().as_ref());
                if container.as_deref() == Some(name.as_str()) {
                    container = None;
                    current_tag = None;
                    if let Some(record) =
                        finish_item(&fields, source, descriptor, &header, &mut report)
                    {
                        records.push(record);
                    }
                    fields.clear();
                } else if current_tag.as_deref() == Some(name.as_str()) {
                    current_tag = None;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(corrupt(
                    descriptor,
                    format!("XML error at byte {}: {e}", reader.buffer_position()),
                ))
            }
        }
        buf.clear();
    }

    if !saw_element {
        return Err(corrupt(descriptor, "no XML content".to_string()));
    }

    debug!(
        file = %descriptor.filename,
        items = report.items_seen,
        with_barcode = report.with_barcode,
        unparsed_price = report.unparsed_price,
        "parsed price file"
    );
    Ok((records, report))
}

fn store_text(
    text: String,
    container: &Option<String>,
    current_tag: &Option<String>,
    fields: &mut HashMap<String, String>,
    header: &mut HashMap<String, String>,
) {
    if text.is_empty() {
        return;
    }
    if let Some(tag) = current_tag {
        if container.is_some() {
            fields.insert(tag.clone(), text);
        } else {
            header.insert(tag.clone(), text);
        }
    }
}

fn finish_item(
    fields: &HashMap<String, String>,
    source: &RetailerSource,
    descriptor: &FileDescriptor,
    header: &HashMap<String, String>,
    report: &mut ParseReport,
) -> Option<PriceRecord> {
    report.items_seen += 1;

    let item_code = fields.get("itemcode").cloned().unwrap_or_default();
    if item_code.is_empty() {
        report.missing_item_code += 1;
        return None;
    }

    let barcode = fields
        .get("barcode")
        .filter(|b| plausible_barcode(b.as_str()))
        .cloned()
        .or_else(|| plausible_barcode(&item_code).then(|| item_code.clone()));
    if barcode.is_some() {
        report.with_barcode += 1;
    }

    let name = first_field(fields, &["itemname", "itemnm"]).unwrap_or_default();
    let brand = first_field(fields, &["manufacturername", "manufacturernm", "manufacturer"]);

    let price = first_field(fields, &["itemprice", "unitprice"])
        .and_then(|raw| parse_price(&raw));
    if price.is_none() {
        report.unparsed_price += 1;
    }

    let observed_at = first_field(fields, &["priceupdatedate"])
        .and_then(|raw| parse_update_date(&raw))
        .or(descriptor.declared_at)
        .unwrap_or_else(Utc::now);

    let store_id = first_field(fields, &["storeid"])
        .or_else(|| header.get("storeid").cloned())
        .or_else(|| descriptor.store_hint.clone())
        .unwrap_or_else(|| "0".to_string());

    Some(PriceRecord {
        source_id: source.id.clone(),
        item_code,
        barcode,
        name,
        brand,
        price,
        currency: source.currency.clone(),
        store_id,
        observed_at,
    })
}

fn first_field(fields: &HashMap<String, String>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|n| fields.get(*n).cloned())
}

fn lowercase_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}

fn corrupt(descriptor: &FileDescriptor, reason: String) -> PipelineError {
    PipelineError::CorruptFile { filename: descriptor.filename.clone(), reason }
}

/// GTIN-plausible: all digits, 8–14 long, not all zeros.
fn plausible_barcode(code: &str) -> bool {
    (8..=14).contains(&code.len())
        && code.bytes().all(|b| b.is_ascii_digit())
        && code.bytes().any(|b| b != b'0')
}

/// Coerces retailer price text to a decimal amount.
///
/// Currency symbols and stray characters are stripped first. A lone comma
/// followed by one or two digits is a decimal comma (`12,50`); commas next
/// to a dot, or in groups of three, are thousands separators (`1,234.56`).
/// Returns `None` for text with no parsable amount.
pub fn parse_price(raw: &str) -> Option<BigDecimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = if cleaned.contains('.') {
        cleaned.replace(',', "")
    } else if let Some(idx) = cleaned.rfind(',') {
        let fraction_digits = cleaned.len() - idx - 1;
        if fraction_digits <= 2 && cleaned.matches(',').count() == 1 {
            cleaned.replacen(',', ".", 1)
        } else {
            cleaned.replace(',', "")
        }
    } else {
        cleaned
    };

    normalized.parse::<BigDecimal>().ok()
}

fn parse_update_date(raw: &str) -> Option<DateTime<Utc>> {
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y/%m/%d %H:%M:%S"];
    for format in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}
