use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{PipelineSettings, RetailerSource};
use crate::discovery::FileDiscoverer;
use crate::download::Downloader;
use crate::error::{PipelineError, Result};
use crate::fetch::Fetcher;
use crate::ledger::{is_stale, ProcessedFileLedger};
use crate::parser;
use crate::store::{PriceStore, UpsertResult};
use crate::types::{FileDescriptor, IngestOutcome, ParseReport};

/// Options for one ingestion run, wired from the CLI. Source selection
/// happens upstream in [`crate::config::Settings::select_sources`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Bypass the ledger's read gate for every source.
    pub force: bool,
    /// Override each source's discovery page cap.
    pub max_pages: Option<u32>,
}

/// Per-source accounting. Every discovered file ends in exactly one of
/// skipped/succeeded/failed; every parsed record lands in a counter.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub source_id: String,
    pub files_discovered: usize,
    pub files_skipped: usize,
    pub files_succeeded: usize,
    pub files_failed: usize,
    pub records_parsed: usize,
    pub records_upserted: usize,
    pub records_with_barcode: usize,
    pub unparsed_prices: usize,
    /// Set when discovery itself failed (no files were processed).
    pub error: Option<String>,
}

impl SourceStats {
    fn new(source_id: &str) -> Self {
        Self { source_id: source_id.to_string(), ..Self::default() }
    }

    fn absorb_report(&mut self, report: &ParseReport) {
        self.records_parsed += report.items_seen;
        self.records_with_barcode += report.with_barcode;
        self.unparsed_prices += report.unparsed_price;
    }

    /// The exit-code condition: the source ended failed with nothing to
    /// show for it.
    pub fn failed_with_no_successes(&self) -> bool {
        (self.error.is_some() || self.files_failed > 0) && self.files_succeeded == 0
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub sources: Vec<SourceStats>,
}

impl RunReport {
    pub fn fully_successful(&self) -> bool {
        !self.sources.iter().any(SourceStats::failed_with_no_successes)
    }

    pub fn total_upserted(&self) -> usize {
        self.sources.iter().map(|s| s.records_upserted).sum()
    }
}

/// Sequences discovery → download → parse → upsert per source and
/// enforces the failure policy: one file's failure never aborts its
/// sibling files, and one source's failure never aborts other sources.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    settings: PipelineSettings,
    fetcher: Arc<dyn Fetcher>,
    store: PriceStore,
    ledger: ProcessedFileLedger,
}

impl PipelineOrchestrator {
    pub fn new(
        settings: PipelineSettings,
        fetcher: Arc<dyn Fetcher>,
        store: PriceStore,
        ledger: ProcessedFileLedger,
    ) -> Self {
        Self { settings, fetcher, store, ledger }
    }

    /// Runs ingestion over the selected sources with a bounded worker
    /// pool. Cancellation stops new workers and in-flight network calls;
    /// an upsert batch that already started is left to commit atomically.
    pub async fn run(
        &self,
        sources: Vec<RetailerSource>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.settings.worker_count.max(1)));
        let mut workers: JoinSet<SourceStats> = JoinSet::new();

        counter!("ps_runs_total").increment(1);

        for source in sources {
            if cancel.is_cancelled() {
                info!("cancellation requested, not launching further sources");
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            let options = options.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let stats = this.process_source(&source, &options, &cancel).await;
                drop(permit);
                stats
            });
        }

        let mut report = RunReport {
            started_at,
            finished_at: started_at,
            cancelled: false,
            sources: Vec::new(),
        };
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(stats) => report.sources.push(stats),
                Err(e) => error!("source worker panicked: {e}"),
            }
        }
        report.sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        report.cancelled = cancel.is_cancelled();
        report.finished_at = Utc::now();

        info!(
            sources = report.sources.len(),
            upserted = report.total_upserted(),
            cancelled = report.cancelled,
            "run finished"
        );
        Ok(report)
    }

    /// One source, files strictly sequential: the ledger ordering stays
    /// deterministic and only one decompressed payload is resident per
    /// worker.
    #[instrument(skip(self, source, options, cancel), fields(source = %source.id))]
    async fn process_source(
        &self,
        source: &RetailerSource,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> SourceStats {
        let mut stats = SourceStats::new(&source.id);
        let force = options.force || source.force;
        let discoverer = FileDiscoverer::new(self.fetcher.clone(), self.settings.retry_attempts);

        let descriptors = match cancellable(cancel, discoverer.discover(source, options.max_pages))
            .await
        {
            Ok(descriptors) => descriptors,
            Err(e) => {
                error!(source = %source.id, "discovery failed: {e}");
                counter!("ps_discovery_failures_total", "source" => source.id.clone()).increment(1);
                stats.error = Some(e.to_string());
                return stats;
            }
        };
        stats.files_discovered = descriptors.len();
        info!(files = descriptors.len(), force, "processing discovered files");

        for descriptor in &descriptors {
            if cancel.is_cancelled() {
                info!("cancellation requested, leaving remaining files for the next run");
                break;
            }
            match self.gate(source, descriptor, force) {
                Ok(true) => {
                    stats.files_skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(file = %descriptor.filename, "ledger read failed: {e}");
                    stats.files_failed += 1;
                    continue;
                }
            }

            let t_file = std::time::Instant::now();
            match self.ingest_file(source, descriptor, cancel).await {
                Ok((report, upserted)) => {
                    stats.files_succeeded += 1;
                    stats.absorb_report(&report);
                    stats.records_upserted += upserted.records;
                    counter!("ps_files_succeeded_total", "source" => source.id.clone())
                        .increment(1);
                    counter!("ps_records_upserted_total", "source" => source.id.clone())
                        .increment(upserted.records as u64);
                    histogram!("ps_file_duration_seconds")
                        .record(t_file.elapsed().as_secs_f64());
                    self.mark(source, descriptor, IngestOutcome::Success);
                }
                Err(PipelineError::Cancelled) => {
                    // Not a file failure; the ledger is untouched so the
                    // next run picks the file up again.
                    info!(file = %descriptor.filename, "cancelled mid-file");
                    break;
                }
                Err(e) => {
                    warn!(
                        file = %descriptor.filename,
                        parsed = stats.records_parsed,
                        "file failed: {e}"
                    );
                    stats.files_failed += 1;
                    counter!("ps_files_failed_total", "source" => source.id.clone()).increment(1);
                    self.mark(source, descriptor, IngestOutcome::Failed);
                }
            }
        }

        info!(
            discovered = stats.files_discovered,
            skipped = stats.files_skipped,
            succeeded = stats.files_succeeded,
            failed = stats.files_failed,
            upserted = stats.records_upserted,
            "source finished"
        );
        stats
    }

    /// Ledger + staleness gate. `Ok(true)` means skip.
    fn gate(&self, source: &RetailerSource, descriptor: &FileDescriptor, force: bool) -> Result<bool> {
        if is_stale(descriptor.declared_at, source.cutoff_days) {
            debug!(file = %descriptor.filename, "older than cutoff, skipping");
            return Ok(true);
        }
        if self.ledger.is_processed(&source.id, descriptor.file_key(), force)? {
            debug!(file = %descriptor.filename, "already in ledger, skipping");
            return Ok(true);
        }
        Ok(false)
    }

    /// Download → parse → upsert for one file. The ledger mark happens in
    /// the caller, strictly after the upserts committed.
    async fn ingest_file(
        &self,
        source: &RetailerSource,
        descriptor: &FileDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(ParseReport, UpsertResult)> {
        let downloader = Downloader::new(self.fetcher.clone(), self.settings.retry_attempts);
        let payload =
            cancellable(cancel, downloader.fetch_file(descriptor, &source.headers)).await?;
        let (records, report) = parser::parse(&payload, source, descriptor)?;
        let upserted = self.store.apply(&records)?;
        debug!(
            file = %descriptor.filename,
            sha256 = %payload.sha256_hex,
            records = upserted.records,
            "file ingested"
        );
        Ok((report, upserted))
    }

    fn mark(&self, source: &RetailerSource, descriptor: &FileDescriptor, outcome: IngestOutcome) {
        if let Err(e) = self.ledger.mark(&source.id, descriptor.file_key(), outcome) {
            // Outcome not recorded; the next run revisits the file, which
            // the keyed upserts tolerate.
            error!(file = %descriptor.filename, "failed to update ledger: {e}");
        }
    }
}

/// Races a pipeline future against run cancellation so in-flight network
/// calls fail fast instead of running to their timeout.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = fut => result,
    }
}
