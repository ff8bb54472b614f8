use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::PipelineSettings;
use crate::error::{PipelineError, Result};

/// Backoff base; attempt N waits `RETRY_BACKOFF_MS << N` milliseconds.
const RETRY_BACKOFF_MS: u64 = 250;

/// A portal response reduced to what the pipeline needs. Bodies are either
/// HTML listing pages or (possibly gzip-framed) file payloads.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Seam between the pipeline and the network. Tests substitute an
/// in-memory portal; production uses [`HttpFetcher`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<FetchResponse>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(settings: &PipelineSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&settings.user_agent)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<FetchResponse> {
        let mut request = self.client.get(url);
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(transient)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(transient)?.to_vec();
        Ok(FetchResponse { status, body })
    }
}

/// Connection-level reqwest failures (timeouts, resets, truncated bodies)
/// are all worth a retry; status-code classification happens in
/// [`get_with_retry`] once a response exists.
fn transient(e: reqwest::Error) -> PipelineError {
    PipelineError::TransientNetwork(e.to_string())
}

/// Issues a GET with bounded retries and exponential backoff.
///
/// Retries transport errors, HTTP 5xx and 429. Other 4xx responses are
/// permanent (an expired signed URL will not come back) and fail
/// immediately. `attempts` counts the first try.
pub async fn get_with_retry(
    fetcher: &dyn Fetcher,
    url: &str,
    headers: &BTreeMap<String, String>,
    attempts: u32,
) -> Result<Vec<u8>> {
    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            let delay = Duration::from_millis(RETRY_BACKOFF_MS << attempt);
            warn!(url, attempt, "retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }

        match fetcher.get(url, headers).await {
            Err(e) if e.is_retryable() => {
                warn!(url, "transient error: {e}");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
            Ok(response) => match response.status {
                200..=299 => return Ok(response.body),
                429 | 500..=599 => {
                    warn!(url, status = response.status, "retryable HTTP status");
                    last_error = Some(PipelineError::TransientNetwork(format!(
                        "HTTP {} from {url}",
                        response.status
                    )));
                }
                status => {
                    return Err(PipelineError::PermanentFetch {
                        status,
                        url: url.to_string(),
                    })
                }
            },
        }
    }

    Err(last_error
        .unwrap_or_else(|| PipelineError::TransientNetwork(format!("request to {url} failed"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a scripted sequence of status codes, then repeats the last.
    struct ScriptedFetcher {
        statuses: Vec<u16>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(statuses: Vec<u16>) -> Self {
            Self { statuses, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn get(&self, _url: &str, _headers: &BTreeMap<String, String>) -> Result<FetchResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let status = *self.statuses.get(n).or(self.statuses.last()).unwrap();
            Ok(FetchResponse { status, body: b"body".to_vec() })
        }
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let fetcher = ScriptedFetcher::new(vec![500, 503, 200]);
        let body = get_with_retry(&fetcher, "https://x.example/f", &BTreeMap::new(), 3)
            .await
            .unwrap();
        assert_eq!(body, b"body");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let fetcher = ScriptedFetcher::new(vec![500]);
        let err = get_with_retry(&fetcher, "https://x.example/f", &BTreeMap::new(), 3)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_permanent_and_not_retried() {
        let fetcher = ScriptedFetcher::new(vec![404]);
        let err = get_with_retry(&fetcher, "https://x.example/f", &BTreeMap::new(), 3)
            .await
            .unwrap_err();
        match err {
            PipelineError::PermanentFetch { status, .. } => assert_eq!(status, 404),
            other => panic!("expected permanent fetch error, got {other}"),
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
