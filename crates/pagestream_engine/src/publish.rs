use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use engine_logging::{engine_debug, engine_info, engine_warn};
use futures_util::future::join_all;
use pagestream_core::{
    ArtifactSource, ContentKind, CrawlResult, KindDelivery, PublishFailure, PublishReceipt,
    SessionId, StreamOutcome, StreamRequest, StreamResult, TransportTuning, UrlOutcome,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::settings::TransportSettings;

pub const HEADER_URL: &str = "url";
pub const HEADER_TIMESTAMP: &str = "timestamp";
pub const HEADER_SESSION: &str = "sessionID";
pub const HEADER_CONTENT_TYPE: &str = "contentType";

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// One record handed to the broker. Keyed by URL so every kind of a URL
/// lands on the same partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub key: String,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl BrokerMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProducerError {
    pub message: String,
    /// Transient failures (leader moves, timeouts) are retried.
    pub retryable: bool,
}

impl ProducerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Broker client seam. `send` resolves once the broker acknowledged the
/// message; `flush` waits for anything still buffered.
#[async_trait::async_trait]
pub trait MessageProducer: Send + Sync {
    async fn send(&self, topic: &str, message: &BrokerMessage) -> Result<DeliveryReceipt, ProducerError>;

    async fn flush(&self) -> Result<(), ProducerError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a producer needs to reach the broker for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub credentials: Option<Credentials>,
    pub client_id: Option<String>,
    pub use_tls: bool,
    pub max_retry: u32,
    pub tuning: TransportTuning,
}

impl TransportConfig {
    /// Endpoints and tuning come from the validated request; credentials
    /// and connection options from settings.
    pub fn new(settings: &TransportSettings, request: &StreamRequest) -> Self {
        let credentials = match (&settings.username, &settings.password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        Self {
            brokers: request.brokers.clone(),
            topic: request.topic.clone(),
            credentials,
            client_id: settings.client_id.clone().filter(|id| !id.is_empty()),
            use_tls: settings.use_tls,
            max_retry: settings.max_retry,
            tuning: request.tuning,
        }
    }
}

type Clock = Arc<dyn Fn() -> String + Send + Sync>;

/// Publishes crawled artifacts, one message per URL and content kind.
pub struct StreamPublisher {
    config: TransportConfig,
    producer: Arc<dyn MessageProducer>,
    clock: Clock,
}

impl StreamPublisher {
    pub fn new(config: TransportConfig, producer: Arc<dyn MessageProducer>) -> Self {
        Self {
            config,
            producer,
            clock: Arc::new(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }

    /// Replaces the RFC 3339 timestamp source used for message headers.
    pub fn with_clock(mut self, clock: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn publish(&self, crawl: &CrawlResult, request: &StreamRequest) -> StreamResult {
        if request.brokers != self.config.brokers {
            engine_warn!(
                "request brokers {:?} differ from the connected producer {:?}",
                request.brokers,
                self.config.brokers
            );
        }

        let mut result = StreamResult::pending(request.session.clone(), crawl.urls().cloned());
        let budget = Semaphore::new(request.tuning.buffer_memory.clamp(1, Semaphore::MAX_PERMITS));

        let jobs = crawl
            .iter()
            .map(|(url, outcome)| self.publish_url(url, outcome, request, &budget));
        for (url, outcome) in join_all(jobs).await {
            result.record(url, outcome);
        }

        if let Err(err) = self.producer.flush().await {
            engine_warn!("producer flush failed: {}", err);
        }
        engine_info!(
            "session {}: {}/{} url(s) published to {}",
            request.session,
            result.success_count(),
            result.len(),
            request.topic
        );
        result
    }

    async fn publish_url<'a>(
        &self,
        url: &'a str,
        outcome: &UrlOutcome,
        request: &StreamRequest,
        budget: &Semaphore,
    ) -> (&'a str, StreamOutcome) {
        let artifacts = match outcome {
            UrlOutcome::Success { artifacts } => artifacts,
            UrlOutcome::Failure { .. } => {
                let error = outcome.error().unwrap_or_default();
                return (url, StreamOutcome::skipped(error));
            }
        };

        // Sequential per URL: the broker sees markup before text.
        let mut kinds = BTreeMap::new();
        for &kind in request.content.kinds() {
            let delivery = match artifacts.get(kind) {
                Some(source) => self.publish_kind(url, kind, source, request, budget).await,
                None => KindDelivery::Failed(PublishFailure::MissingArtifact),
            };
            kinds.insert(kind, delivery);
        }
        (url, StreamOutcome::from_deliveries(kinds))
    }

    async fn publish_kind(
        &self,
        url: &str,
        kind: ContentKind,
        source: &ArtifactSource,
        request: &StreamRequest,
        budget: &Semaphore,
    ) -> KindDelivery {
        let limit = request.tuning.max_message_size;
        let size = match artifact_size(source, limit).await {
            Ok(size) => size,
            Err(failure) => {
                engine_warn!("{} {}: {}", url, kind, failure);
                return KindDelivery::Failed(failure);
            }
        };

        // Read only while holding the artifact's share of the buffer. Never
        // ask for more than the whole buffer or the acquire would hang.
        let capacity = request.tuning.buffer_memory.clamp(1, Semaphore::MAX_PERMITS);
        let permits = u32::try_from(size.clamp(1, capacity)).unwrap_or(u32::MAX);
        let _permit = match budget.acquire_many(permits).await {
            Ok(permit) => permit,
            Err(err) => return KindDelivery::Failed(PublishFailure::Broker(err.to_string())),
        };

        let value = match read_artifact(source, limit).await {
            Ok(value) => value,
            Err(failure) => {
                engine_warn!("{} {}: {}", url, kind, failure);
                return KindDelivery::Failed(failure);
            }
        };
        let message = self.message(url, kind, value, &request.session);

        let mut attempt = 0;
        loop {
            match self.producer.send(&request.topic, &message).await {
                Ok(receipt) => {
                    engine_debug!(
                        "{} {} -> partition {} offset {}",
                        url,
                        kind,
                        receipt.partition,
                        receipt.offset
                    );
                    return KindDelivery::Delivered(PublishReceipt {
                        topic: request.topic.clone(),
                        partition: Some(receipt.partition),
                        offset: Some(receipt.offset),
                        session_id: request.session.clone(),
                    });
                }
                Err(err) if err.retryable && attempt < self.config.max_retry => {
                    attempt += 1;
                    engine_debug!("retrying {} {} (attempt {}): {}", url, kind, attempt, err);
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(err) => {
                    engine_warn!("publishing {} {} failed: {}", url, kind, err);
                    return KindDelivery::Failed(PublishFailure::Broker(err.message));
                }
            }
        }
    }

    fn message(&self, url: &str, kind: ContentKind, value: Vec<u8>, session: &SessionId) -> BrokerMessage {
        let headers = BTreeMap::from([
            (HEADER_URL.to_string(), url.to_string()),
            (HEADER_TIMESTAMP.to_string(), (self.clock)()),
            (HEADER_SESSION.to_string(), session.to_string()),
            (HEADER_CONTENT_TYPE.to_string(), kind.mime_type().to_string()),
        ]);
        BrokerMessage {
            key: url.to_string(),
            value,
            headers,
        }
    }
}

/// Stable partition index for a message key: the first four bytes of its
/// SHA-256 digest modulo the partition count.
pub fn partition_index(key: &str, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix as usize % partitions
}

/// Size of an artifact without loading it; over `limit` is a failure.
async fn artifact_size(source: &ArtifactSource, limit: usize) -> Result<usize, PublishFailure> {
    let size = match source {
        ArtifactSource::Inline(content) => content.len(),
        ArtifactSource::Path(path) => {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|err| unreadable(path, err))?;
            usize::try_from(metadata.len()).unwrap_or(usize::MAX)
        }
    };
    check_size(size, limit)?;
    Ok(size)
}

/// Loads an artifact. The file may have grown since it was sized, so the
/// limit is checked again.
async fn read_artifact(source: &ArtifactSource, limit: usize) -> Result<Vec<u8>, PublishFailure> {
    let value = match source {
        ArtifactSource::Inline(content) => content.clone().into_bytes(),
        ArtifactSource::Path(path) => tokio::fs::read(path)
            .await
            .map_err(|err| unreadable(path, err))?,
    };
    check_size(value.len(), limit)?;
    Ok(value)
}

fn check_size(size: usize, limit: usize) -> Result<(), PublishFailure> {
    if size > limit {
        return Err(PublishFailure::TooLarge { size, limit });
    }
    Ok(())
}

fn unreadable(path: &Path, err: std::io::Error) -> PublishFailure {
    PublishFailure::Unreadable {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}
