use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};
use url::Url;

use crate::config::{DiscoveryStrategy, RetailerSource};
use crate::error::{PipelineError, Result};
use crate::fetch::{get_with_retry, Fetcher};
use crate::types::FileDescriptor;

static ANCHORS: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("valid selector"));

/// Enumerates candidate price files from a retailer's listing pages.
///
/// Produces a finite, deduplicated sequence of [`FileDescriptor`]s; every
/// walk is bounded by the strategy's page cap, so discovery can fail but
/// never hang.
pub struct FileDiscoverer {
    fetcher: Arc<dyn Fetcher>,
    retry_attempts: u32,
}

impl FileDiscoverer {
    pub fn new(fetcher: Arc<dyn Fetcher>, retry_attempts: u32) -> Self {
        Self { fetcher, retry_attempts }
    }

    /// Walks the source's listing according to its discovery strategy.
    /// `page_cap_override` tightens (or widens) the configured page bound,
    /// used by the CLI `--max-pages` flag.
    pub async fn discover(
        &self,
        source: &RetailerSource,
        page_cap_override: Option<u32>,
    ) -> Result<Vec<FileDescriptor>> {
        let cap = page_cap_override.unwrap_or_else(|| source.strategy.max_pages()).max(1);
        let delay_ms = source.strategy.page_delay_ms();

        let found = match &source.strategy {
            DiscoveryStrategy::DirectFeed { file_prefix, .. } => {
                self.walk_direct(source, file_prefix, cap, delay_ms).await?
            }
            DiscoveryStrategy::FilteredScan { chain_marker, min_matches, .. } => {
                self.walk_filtered(source, chain_marker, *min_matches, cap, delay_ms).await?
            }
        };

        // Overlapping pages can list the same file twice; keep the first
        // sighting so downstream sees each filename exactly once.
        let mut seen = HashSet::new();
        let deduped: Vec<FileDescriptor> = found
            .into_iter()
            .filter(|d| seen.insert(d.filename.clone()))
            .collect();

        info!(source = %source.id, files = deduped.len(), "discovery complete");
        Ok(deduped)
    }

    /// Bounded index of the chain's own files: walk until an empty page or
    /// the cap, keeping files of the configured kind.
    async fn walk_direct(
        &self,
        source: &RetailerSource,
        file_prefix: &str,
        cap: u32,
        delay_ms: u64,
    ) -> Result<Vec<FileDescriptor>> {
        let prefix = file_prefix.to_ascii_lowercase();
        let mut found = Vec::new();

        for page in 1..=cap {
            if page > 1 && delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            let links = self.load_page(source, page).await?;
            if links.is_empty() {
                debug!(source = %source.id, page, "empty listing page, stopping walk");
                break;
            }
            found.extend(
                links
                    .into_iter()
                    .filter(|(d, _)| d.filename.to_ascii_lowercase().starts_with(&prefix))
                    .map(|(d, _)| d),
            );
        }

        Ok(found)
    }

    /// Sparse chain in a large shared listing: page through, match on the
    /// chain marker in the URL or the surrounding row, stop early once
    /// enough matches accumulated. Zero matches within the cap is a
    /// discovery failure.
    async fn walk_filtered(
        &self,
        source: &RetailerSource,
        chain_marker: &str,
        min_matches: usize,
        cap: u32,
        delay_ms: u64,
    ) -> Result<Vec<FileDescriptor>> {
        let mut matches = Vec::new();

        for page in 1..=cap {
            if page > 1 && delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            let links = self.load_page(source, page).await?;
            matches.extend(
                links
                    .into_iter()
                    .filter(|(d, row)| d.url.contains(chain_marker) || row.contains(chain_marker))
                    .map(|(d, _)| d),
            );
            if matches.len() >= min_matches {
                debug!(source = %source.id, page, matches = matches.len(), "enough matches, stopping scan");
                break;
            }
        }

        if matches.is_empty() {
            return Err(PipelineError::Discovery {
                source_id: source.id.clone(),
                reason: format!("no files matching marker '{chain_marker}' within {cap} pages"),
            });
        }
        Ok(matches)
    }

    async fn load_page(
        &self,
        source: &RetailerSource,
        page: u32,
    ) -> Result<Vec<(FileDescriptor, String)>> {
        let url = page_url(&source.base_url, page);
        let body =
            get_with_retry(self.fetcher.as_ref(), &url, &source.headers, self.retry_attempts)
                .await?;
        let html = String::from_utf8_lossy(&body);
        Ok(extract_file_links(&source.id, &source.base_url, &html))
    }
}

fn page_url(base: &str, page: u32) -> String {
    if page <= 1 {
        base.to_string()
    } else {
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}page={page}")
    }
}

/// Pulls every anchor that plausibly points at a file, together with the
/// text of its table row (some listings carry the chain identifier in a
/// sibling cell rather than the URL).
fn extract_file_links(
    source_id: &str,
    base_url: &str,
    html: &str,
) -> Vec<(FileDescriptor, String)> {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    let mut out = Vec::new();

    for anchor in document.select(&ANCHORS) {
        let Some(href) = anchor.value().attr("href") else { continue };
        if href.starts_with('#') || href.starts_with("javascript:") {
            continue;
        }
        let Some(url) = resolve(base.as_ref(), href) else { continue };
        let Some(filename) = file_name(&url) else { continue };
        out.push((FileDescriptor::new(source_id, url.as_str(), &filename), row_text(&anchor)));
    }

    out
}

fn resolve(base: Option<&Url>, href: &str) -> Option<Url> {
    match base {
        Some(base) => base.join(href).ok(),
        None => Url::parse(href).ok(),
    }
}

/// Last path segment, required to look like a file (navigation links to
/// `?page=N` and friends resolve to extensionless segments and drop out).
fn file_name(url: &Url) -> Option<String> {
    let name = url.path_segments()?.last()?;
    if name.is_empty() || !name.contains('.') {
        return None;
    }
    Some(name.to_string())
}

fn row_text(anchor: &ElementRef<'_>) -> String {
    for node in anchor.ancestors() {
        if let Some(el) = ElementRef::wrap(node) {
            if el.value().name() == "tr" {
                return el.text().collect::<Vec<_>>().join(" ");
            }
        }
    }
    anchor.text().collect::<Vec<_>>().join(" ")
}
