use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{PipelineError, Result};

/// Top-level configuration: pipeline tuning plus the retailer source
/// registry. Loaded once at startup and treated as immutable afterwards;
/// the orchestrator receives it explicitly rather than through any shared
/// global.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default, rename = "source")]
    pub sources: Vec<RetailerSource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Concurrent source workers. Kept modest to stay polite to the portals.
    pub worker_count: usize,
    pub request_timeout_secs: u64,
    /// Total HTTP attempts per request (first try included).
    pub retry_attempts: u32,
    /// Portals reject default client user-agents, so we present a browser one.
    pub user_agent: String,
    /// Records per upsert transaction.
    pub batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            request_timeout_secs: 30,
            retry_attempts: 3,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            batch_size: 1000,
        }
    }
}

/// One retailer transparency portal.
#[derive(Debug, Clone, Deserialize)]
pub struct RetailerSource {
    /// Chain identifier, also the `retailer_id` in every persisted table.
    pub id: String,
    pub name: String,
    /// Listing page URL; discovery appends the page parameter.
    pub base_url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Files whose declared timestamp is older than this are skipped even
    /// if never seen, to bound catch-up cost after long outages.
    #[serde(default)]
    pub cutoff_days: Option<i64>,
    /// Deliberate full-reprocess flag for this source.
    #[serde(default)]
    pub force: bool,
    #[serde(flatten)]
    pub strategy: DiscoveryStrategy,
}

/// How price files are enumerated on the portal.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    /// The portal serves a bounded index of the chain's own files; walk
    /// pages until an empty one and keep files matching the kind prefix.
    DirectFeed {
        #[serde(default = "default_file_prefix")]
        file_prefix: String,
        #[serde(default = "default_feed_pages")]
        max_pages: u32,
        #[serde(default)]
        page_delay_ms: u64,
    },
    /// The chain's files are sparse rows in a much larger shared listing,
    /// identified by a chain marker in the URL or row text. Stops early
    /// after `min_matches`; zero matches within `max_pages` is a discovery
    /// failure, never an unbounded walk.
    FilteredScan {
        chain_marker: String,
        #[serde(default = "default_min_matches")]
        min_matches: usize,
        #[serde(default = "default_scan_pages")]
        max_pages: u32,
        #[serde(default)]
        page_delay_ms: u64,
    },
}

impl DiscoveryStrategy {
    pub fn max_pages(&self) -> u32 {
        match self {
            Self::DirectFeed { max_pages, .. } | Self::FilteredScan { max_pages, .. } => *max_pages,
        }
    }

    pub fn page_delay_ms(&self) -> u64 {
        match self {
            Self::DirectFeed { page_delay_ms, .. } | Self::FilteredScan { page_delay_ms, .. } => {
                *page_delay_ms
            }
        }
    }
}

fn default_currency() -> String {
    "ILS".to_string()
}

fn default_file_prefix() -> String {
    "PriceFull".to_string()
}

fn default_feed_pages() -> u32 {
    50
}

fn default_scan_pages() -> u32 {
    200
}

fn default_min_matches() -> usize {
    2
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read config file '{}': {e}", path.display()))
        })?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(PipelineError::Config("source with empty id".to_string()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
        }
        Ok(())
    }

    pub fn source(&self, id: &str) -> Option<&RetailerSource> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Sources selected for a run: all of them, or one by id.
    pub fn select_sources(&self, filter: Option<&str>) -> Result<Vec<RetailerSource>> {
        match filter {
            None => Ok(self.sources.clone()),
            Some(id) => self
                .source(id)
                .cloned()
                .map(|s| vec![s])
                .ok_or_else(|| PipelineError::Config(format!("unknown source '{id}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [pipeline]
        worker_count = 2
        retry_attempts = 4

        [[source]]
        id = "mega"
        name = "Mega Retail"
        base_url = "https://prices.mega.example/files"
        strategy = "direct_feed"
        file_prefix = "PriceFull"
        max_pages = 30

        [[source]]
        id = "city-market"
        name = "City Market"
        base_url = "https://portal.example/list"
        currency = "EUR"
        cutoff_days = 14
        strategy = "filtered_scan"
        chain_marker = "7290058140886"
        min_matches = 3
        max_pages = 120
        page_delay_ms = 250
    "#;

    #[test]
    fn parses_both_strategies() {
        let settings: Settings = toml::from_str(SAMPLE).unwrap();
        assert_eq!(settings.pipeline.worker_count, 2);
        assert_eq!(settings.pipeline.retry_attempts, 4);
        // Unset fields fall back to defaults.
        assert_eq!(settings.pipeline.batch_size, 1000);
        assert_eq!(settings.sources.len(), 2);

        let mega = settings.source("mega").unwrap();
        assert_eq!(mega.currency, "ILS");
        match &mega.strategy {
            DiscoveryStrategy::DirectFeed { file_prefix, max_pages, .. } => {
                assert_eq!(file_prefix, "PriceFull");
                assert_eq!(*max_pages, 30);
            }
            other => panic!("expected direct feed, got {other:?}"),
        }

        let market = settings.source("city-market").unwrap();
        assert_eq!(market.currency, "EUR");
        assert_eq!(market.cutoff_days, Some(14));
        match &market.strategy {
            DiscoveryStrategy::FilteredScan { chain_marker, min_matches, max_pages, page_delay_ms } => {
                assert_eq!(chain_marker, "7290058140886");
                assert_eq!(*min_matches, 3);
                assert_eq!(*max_pages, 120);
                assert_eq!(*page_delay_ms, 250);
            }
            other => panic!("expected filtered scan, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_source_ids() {
        let doubled = format!(
            "{SAMPLE}\n[[source]]\nid = \"mega\"\nname = \"Mega again\"\n\
             base_url = \"https://x.example\"\nstrategy = \"direct_feed\"\n"
        );
        let settings: Settings = toml::from_str(&doubled).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn select_sources_rejects_unknown_id() {
        let settings: Settings = toml::from_str(SAMPLE).unwrap();
        assert!(settings.select_sources(Some("nope")).is_err());
        assert_eq!(settings.select_sources(None).unwrap().len(), 2);
        assert_eq!(settings.select_sources(Some("mega")).unwrap().len(), 1);
    }
}
