use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::fetch::{get_with_retry, Fetcher};
use crate::types::{FileDescriptor, RawPayload};

/// Gzip member header magic.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Fetches price-file bodies and normalizes them to decompressed bytes.
pub struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    retry_attempts: u32,
}

impl Downloader {
    pub fn new(fetcher: Arc<dyn Fetcher>, retry_attempts: u32) -> Self {
        Self { fetcher, retry_attempts }
    }

    /// Downloads one file. Gzip framing is sniffed from the magic bytes
    /// rather than trusted from content-type, since portals mislabel it;
    /// a payload that claims gzip but fails to inflate is corrupt, not
    /// retryable.
    pub async fn fetch_file(
        &self,
        descriptor: &FileDescriptor,
        headers: &BTreeMap<String, String>,
    ) -> Result<RawPayload> {
        let body = get_with_retry(
            self.fetcher.as_ref(),
            &descriptor.url,
            headers,
            self.retry_attempts,
        )
        .await?;

        let was_gzipped = body.starts_with(&GZIP_MAGIC);
        let bytes = if was_gzipped {
            gunzip(&body, &descriptor.filename)?
        } else {
            body
        };
        let sha256_hex = hex::encode(Sha256::digest(&bytes));

        debug!(
            file = %descriptor.filename,
            size = bytes.len(),
            gzipped = was_gzipped,
            sha256 = %sha256_hex,
            "downloaded file"
        );

        Ok(RawPayload { bytes, was_gzipped, sha256_hex })
    }
}

fn gunzip(data: &[u8], filename: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::CorruptFile {
            filename: filename.to_string(),
            reason: format!("gzip decompression failed: {e}"),
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchResponse;
    use async_trait::async_trait;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    struct OneShotFetcher {
        body: Vec<u8>,
    }

    #[async_trait]
    impl Fetcher for OneShotFetcher {
        async fn get(
            &self,
            _url: &str,
            _headers: &BTreeMap<String, String>,
        ) -> crate::error::Result<FetchResponse> {
            Ok(FetchResponse { status: 200, body: self.body.clone() })
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn descriptor() -> FileDescriptor {
        FileDescriptor::new(
            "mega",
            "https://portal.example/PriceFull1-001-202601010000.gz",
            "PriceFull1-001-202601010000.gz",
        )
    }

    #[tokio::test]
    async fn sniffs_and_inflates_gzip_payloads() {
        let fetcher = Arc::new(OneShotFetcher { body: gzip(b"<Root/>") });
        let downloader = Downloader::new(fetcher, 1);
        let payload = downloader.fetch_file(&descriptor(), &BTreeMap::new()).await.unwrap();
        assert!(payload.was_gzipped);
        assert_eq!(payload.bytes, b"<Root/>");
    }

    #[tokio::test]
    async fn passes_plain_payloads_through() {
        let fetcher = Arc::new(OneShotFetcher { body: b"<Root/>".to_vec() });
        let downloader = Downloader::new(fetcher, 1);
        let payload = downloader.fetch_file(&descriptor(), &BTreeMap::new()).await.unwrap();
        assert!(!payload.was_gzipped);
        assert_eq!(payload.bytes, b"<Root/>");
    }

    #[tokio::test]
    async fn truncated_gzip_is_a_corrupt_file() {
        let mut body = gzip(b"<Root>lots of content that will be cut</Root>");
        body.truncate(6);
        let fetcher = Arc::new(OneShotFetcher { body });
        let downloader = Downloader::new(fetcher, 1);
        let err = downloader
            .fetch_file(&descriptor(), &BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::CorruptFile { filename, .. } => {
                assert_eq!(filename, "PriceFull1-001-202601010000.gz");
            }
            other => panic!("expected corrupt file error, got {other}"),
        }
    }
}
