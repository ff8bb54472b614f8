use thiserror::Error;

/// Failure taxonomy for the ingestion pipeline.
///
/// The split between transient and permanent fetch failures drives the
/// retry policy in the downloader: transient errors are retried with
/// backoff, everything else surfaces immediately as a file-level failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("permanent fetch error (HTTP {status}) for {url}")]
    PermanentFetch { status: u16, url: String },

    #[error("corrupt file {filename}: {reason}")]
    CorruptFile { filename: String, reason: String },

    #[error("discovery failed for source {source_id}: {reason}")]
    Discovery { source_id: String, reason: String },

    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether a retry with backoff could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
