use std::io::Write;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::{DeliveryChannel, DeliveryError, DeliveryReceipt, RejectedItem};
use crate::batch::Batch;

#[derive(Error, Debug)]
pub enum HttpChannelError {
    #[error("invalid endpoint URL '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        source: url::ParseError,
    },

    #[error("failed to build HTTP client: {0}")]
    BuildFailed(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct HttpChannelConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_connections: usize,
    pub user_agent: String,
    pub enable_compression: bool,
    /// Bodies below this size are sent uncompressed.
    pub compress_min_bytes: usize,
}

impl Default for HttpChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9200/_bulk".to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_connections: 20,
            user_agent: concat!("logship/", env!("CARGO_PKG_VERSION")).to_string(),
            enable_compression: true,
            compress_min_bytes: 4 * 1024,
        }
    }
}

/// Per-item acceptance breakdown, for backends that report one in the
/// response body (bulk-API style). Anything else is treated as full
/// acceptance once the status code is a success.
#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
}

/// Bundled [`DeliveryChannel`]: POSTs batches as newline-delimited payloads.
///
/// Payloads are shipped verbatim, one per line, so the embedding application
/// is expected to encode each event without interior newlines.
#[derive(Debug)]
pub struct HttpDeliveryChannel {
    client: Client,
    endpoint: Url,
    config: HttpChannelConfig,
}

impl HttpDeliveryChannel {
    pub fn new(config: HttpChannelConfig) -> Result<Self, HttpChannelError> {
        let endpoint: Url =
            config
                .endpoint
                .parse()
                .map_err(|source| HttpChannelError::InvalidEndpoint {
                    endpoint: config.endpoint.clone(),
                    source,
                })?;
        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .user_agent(&config.user_agent)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn encode_body(&self, batch: &Batch) -> Result<(Vec<u8>, bool), DeliveryError> {
        let mut body = Vec::with_capacity(batch.byte_size() + batch.len());
        for payload in batch.payloads() {
            body.extend_from_slice(payload);
            body.push(b'\n');
        }

        if self.config.enable_compression && body.len() >= self.config.compress_min_bytes {
            let mut encoder = GzEncoder::new(
                Vec::with_capacity(body.len() / 2),
                Compression::fast(),
            );
            encoder
                .write_all(&body)
                .and_then(|()| encoder.finish())
                .map(|compressed| (compressed, true))
                .map_err(|e| DeliveryError::Transport(format!("gzip encoding failed: {e}")))
        } else {
            Ok((body, false))
        }
    }
}

fn receipt_from(bulk: BulkResponse) -> DeliveryReceipt {
    if !bulk.errors {
        return DeliveryReceipt::accepted();
    }
    let rejected = bulk
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.status >= 400)
        .map(|(index, item)| RejectedItem {
            index,
            status: item.status,
        })
        .collect();
    DeliveryReceipt::with_rejected(rejected)
}

impl DeliveryChannel for HttpDeliveryChannel {
    fn send<'a>(
        &'a self,
        batch: &'a Batch,
    ) -> BoxFuture<'a, Result<DeliveryReceipt, DeliveryError>> {
        Box::pin(async move {
            let (body, compressed) = self.encode_body(batch)?;
            let bytes_sent = body.len();

            let mut request = self
                .client
                .post(self.endpoint.clone())
                .header(CONTENT_TYPE, "application/x-ndjson")
                .header("x-batch-id", batch.id())
                .header("x-batch-size", batch.len().to_string());
            if compressed {
                request = request.header(CONTENT_ENCODING, "gzip");
            }

            let response = request.body(body).send().await.map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(self.config.timeout)
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(DeliveryError::Rejected {
                    status: status.as_u16(),
                });
            }
            debug!(
                batch_id = %batch.id(),
                items = batch.len(),
                bytes_sent,
                compressed,
                status = status.as_u16(),
                "batch posted"
            );

            match response.json::<BulkResponse>().await {
                Ok(bulk) => {
                    let receipt = receipt_from(bulk);
                    if !receipt.rejected.is_empty() {
                        warn!(
                            batch_id = %batch.id(),
                            rejected = receipt.rejected.len(),
                            "backend refused individual items"
                        );
                    }
                    Ok(receipt)
                }
                // No parseable breakdown: the status code is the answer.
                Err(_) => Ok(DeliveryReceipt::accepted()),
            }
        })
    }
}
