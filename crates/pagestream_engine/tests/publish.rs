use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pagestream_core::{
    ArtifactSource, Artifacts, ContentKind, ContentSelector, CrawlRequest, CrawlResult,
    EngineOptions, ExecutionMode, FailureKind, KindDelivery, PublishFailure, SessionRegistry,
    StreamRequest, TransportTuning, UrlOutcome,
};
use pagestream_engine::{
    BrokerMessage, DeliveryReceipt, MessageProducer, ProducerError, SessionFilter,
    StreamPublisher, TransportConfig, HEADER_CONTENT_TYPE, HEADER_SESSION, HEADER_TIMESTAMP,
    HEADER_URL,
};
use pretty_assertions::assert_eq;
use tokio::sync::{Notify, Semaphore};

/// Keeps every message in memory, numbering offsets per topic.
#[derive(Default)]
struct MemoryProducer {
    sent: Mutex<Vec<(String, BrokerMessage)>>,
    transient_failures: AtomicU32,
    flushed: AtomicBool,
}

impl MemoryProducer {
    fn failing_first(attempts: u32) -> Self {
        Self {
            transient_failures: AtomicU32::new(attempts),
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<(String, BrokerMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MessageProducer for MemoryProducer {
    async fn send(&self, topic: &str, message: &BrokerMessage) -> Result<DeliveryReceipt, ProducerError> {
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(ProducerError::retryable("leader not available"));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((topic.to_string(), message.clone()));
        Ok(DeliveryReceipt {
            partition: 0,
            offset: sent.len() as i64 - 1,
        })
    }

    async fn flush(&self) -> Result<(), ProducerError> {
        self.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Parks every send until the test releases it.
struct GatedProducer {
    entered: Notify,
    release: Semaphore,
    sent: Mutex<Vec<BrokerMessage>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl GatedProducer {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
            sent: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl MessageProducer for GatedProducer {
    async fn send(&self, _topic: &str, message: &BrokerMessage) -> Result<DeliveryReceipt, ProducerError> {
        let size = message.value.len();
        let now = self.in_flight.fetch_add(size, Ordering::SeqCst) + size;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.sent.lock().unwrap().push(message.clone());
        self.entered.notify_one();

        self.release
            .acquire()
            .await
            .map_err(|err| ProducerError::fatal(err.to_string()))?
            .forget();
        self.in_flight.fetch_sub(size, Ordering::SeqCst);
        Ok(DeliveryReceipt {
            partition: 0,
            offset: 0,
        })
    }

    async fn flush(&self) -> Result<(), ProducerError> {
        Ok(())
    }
}

fn stream_request(urls: &[&str], content: ContentSelector, session: &str) -> StreamRequest {
    StreamRequest {
        crawl: CrawlRequest {
            urls: urls.iter().map(|s| s.to_string()).collect(),
            output_dir: None,
            mode: ExecutionMode::Sequential,
            timeout: None,
            engine: EngineOptions::default(),
        },
        brokers: vec!["localhost:9092".into()],
        topic: "crawl_data".into(),
        content,
        session: SessionRegistry.ensure(Some(session)).unwrap(),
        tuning: TransportTuning::default(),
    }
}

fn config(request: &StreamRequest, max_retry: u32) -> TransportConfig {
    TransportConfig {
        brokers: request.brokers.clone(),
        topic: request.topic.clone(),
        credentials: None,
        client_id: None,
        use_tls: false,
        max_retry,
        tuning: request.tuning,
    }
}

fn inline_artifacts(markup: &str, text: &str) -> UrlOutcome {
    let mut artifacts = Artifacts::default();
    artifacts.set(ContentKind::Markup, ArtifactSource::Inline(markup.into()));
    artifacts.set(ContentKind::Text, ArtifactSource::Inline(text.into()));
    UrlOutcome::Success { artifacts }
}

fn crawled(entries: &[(&str, UrlOutcome)]) -> CrawlResult {
    let mut result = CrawlResult::pending(entries.iter().map(|(url, _)| *url));
    for (url, outcome) in entries {
        result.record(url, outcome.clone());
    }
    result
}

fn publisher(request: &StreamRequest, producer: Arc<MemoryProducer>) -> StreamPublisher {
    StreamPublisher::new(config(request, 0), producer).with_clock(|| "2024-01-01T00:00:00Z".to_string())
}

#[tokio::test]
async fn both_kinds_are_published_with_full_headers() {
    let request = stream_request(&["https://example.com"], ContentSelector::Both, "s-1");
    let producer = Arc::new(MemoryProducer::default());
    let crawl = crawled(&[("https://example.com", inline_artifacts("<h1>x</h1>", "# x"))]);

    let result = publisher(&request, producer.clone()).publish(&crawl, &request).await;

    assert!(producer.flushed.load(Ordering::SeqCst));
    let outcome = result.get("https://example.com").unwrap();
    assert!(outcome.success());
    assert_eq!(outcome.kinds().len(), 2);

    let sent = producer.sent();
    assert_eq!(sent.len(), 2);
    let (topic, markup) = &sent[0];
    assert_eq!(topic, "crawl_data");
    assert_eq!(markup.key, "https://example.com");
    assert_eq!(markup.value, b"<h1>x</h1>");
    assert_eq!(markup.header(HEADER_URL), Some("https://example.com"));
    assert_eq!(markup.header(HEADER_SESSION), Some("s-1"));
    assert_eq!(markup.header(HEADER_CONTENT_TYPE), Some("text/html"));
    assert_eq!(markup.header(HEADER_TIMESTAMP), Some("2024-01-01T00:00:00Z"));
    assert_eq!(sent[1].1.header(HEADER_CONTENT_TYPE), Some("text/markdown"));
}

#[tokio::test]
async fn one_session_id_across_every_message_of_a_batch() {
    let urls = ["https://a.example", "https://b.example", "https://c.example"];
    let request = stream_request(&urls, ContentSelector::Both, "nightly-42");
    let producer = Arc::new(MemoryProducer::default());
    let entries: Vec<(&str, UrlOutcome)> = urls
        .iter()
        .map(|url| (*url, inline_artifacts("<p/>", "p")))
        .collect();

    let result = publisher(&request, producer.clone())
        .publish(&crawled(&entries), &request)
        .await;

    assert_eq!(result.session().as_str(), "nightly-42");
    let sessions: BTreeSet<String> = producer
        .sent()
        .iter()
        .map(|(_, m)| m.header(HEADER_SESSION).unwrap().to_string())
        .collect();
    assert_eq!(sessions, BTreeSet::from(["nightly-42".to_string()]));
    assert_eq!(producer.sent().len(), 6);

    let filter = SessionFilter::new(Some("nightly-42".into()), Some(ContentKind::Text));
    let selected = producer
        .sent()
        .iter()
        .filter(|(_, m)| filter.matches_message(m))
        .count();
    assert_eq!(selected, 3);
}

#[tokio::test]
async fn markup_selection_never_publishes_text() {
    let request = stream_request(&["https://example.com"], ContentSelector::Markup, "s");
    let producer = Arc::new(MemoryProducer::default());
    let crawl = crawled(&[("https://example.com", inline_artifacts("<p/>", "text"))]);

    let result = publisher(&request, producer.clone()).publish(&crawl, &request).await;

    let sent = producer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.header(HEADER_CONTENT_TYPE), Some("text/html"));
    let outcome = result.get("https://example.com").unwrap();
    assert!(outcome.success());
    assert!(outcome.delivery(ContentKind::Text).is_none());
}

#[tokio::test]
async fn oversize_artifact_fails_alone() {
    let mut request = stream_request(
        &["https://big.example", "https://small.example"],
        ContentSelector::Text,
        "s",
    );
    request.tuning.max_message_size = 1024;
    let producer = Arc::new(MemoryProducer::default());

    let dir = tempfile::tempdir().unwrap();
    let big = dir.path().join("big.md");
    std::fs::write(&big, vec![b'x'; 2 * 1024]).unwrap();
    let mut big_artifacts = Artifacts::default();
    big_artifacts.set(ContentKind::Text, ArtifactSource::Path(big));

    let crawl = crawled(&[
        ("https://big.example", UrlOutcome::Success { artifacts: big_artifacts }),
        ("https://small.example", inline_artifacts("<p/>", "small")),
    ]);

    let result = publisher(&request, producer.clone()).publish(&crawl, &request).await;

    let big = result.get("https://big.example").unwrap();
    assert!(!big.success());
    assert_eq!(
        big.delivery(ContentKind::Text),
        Some(&KindDelivery::Failed(PublishFailure::TooLarge {
            size: 2048,
            limit: 1024
        }))
    );
    assert!(big.error().unwrap().contains("exceeds max message size"));
    assert!(result.get("https://small.example").unwrap().success());
    assert_eq!(producer.sent().len(), 1);
}

#[tokio::test]
async fn crawl_failures_and_missing_artifacts_are_reported_per_url() {
    let request = stream_request(
        &["https://down.example", "https://partial.example"],
        ContentSelector::Both,
        "s",
    );
    let mut markup_only = Artifacts::default();
    markup_only.set(ContentKind::Markup, ArtifactSource::Inline("<p/>".into()));
    let crawl = crawled(&[
        (
            "https://down.example",
            UrlOutcome::failure(FailureKind::Timeout, "engine did not finish"),
        ),
        ("https://partial.example", UrlOutcome::Success { artifacts: markup_only }),
    ]);
    let producer = Arc::new(MemoryProducer::default());

    let result = publisher(&request, producer.clone()).publish(&crawl, &request).await;

    let down = result.get("https://down.example").unwrap();
    assert!(!down.success());
    assert!(down.kinds().is_empty());
    assert!(down.error().unwrap().starts_with("timeout"));

    let partial = result.get("https://partial.example").unwrap();
    assert!(!partial.success());
    assert!(partial.delivery(ContentKind::Markup).unwrap().is_delivered());
    assert_eq!(
        partial.delivery(ContentKind::Text),
        Some(&KindDelivery::Failed(PublishFailure::MissingArtifact))
    );
}

#[tokio::test(start_paused = true)]
async fn transient_broker_errors_are_retried_up_to_the_limit() {
    let request = stream_request(&["https://example.com"], ContentSelector::Markup, "s");
    let crawl = crawled(&[("https://example.com", inline_artifacts("<p/>", "p"))]);

    let producer = Arc::new(MemoryProducer::failing_first(2));
    let result = StreamPublisher::new(config(&request, 3), producer.clone())
        .publish(&crawl, &request)
        .await;
    assert!(result.get("https://example.com").unwrap().success());

    let producer = Arc::new(MemoryProducer::failing_first(5));
    let result = StreamPublisher::new(config(&request, 1), producer.clone())
        .publish(&crawl, &request)
        .await;
    let outcome = result.get("https://example.com").unwrap();
    assert!(!outcome.success());
    assert!(outcome.error().unwrap().contains("leader not available"));
    assert!(producer.sent().is_empty());
}

#[tokio::test]
async fn artifacts_are_read_only_within_the_buffer_budget() {
    let mut request = stream_request(
        &["https://a.example", "https://b.example"],
        ContentSelector::Markup,
        "s",
    );
    request.tuning.max_message_size = 4;
    request.tuning.buffer_memory = 4;

    let dir = tempfile::tempdir().unwrap();
    let mut entries = Vec::new();
    for (url, name) in [("https://a.example", "a.html"), ("https://b.example", "b.html")] {
        let path = dir.path().join(name);
        std::fs::write(&path, b"old!").unwrap();
        let mut artifacts = Artifacts::default();
        artifacts.set(ContentKind::Markup, ArtifactSource::Path(path));
        entries.push((url, UrlOutcome::Success { artifacts }));
    }
    let crawl = crawled(&entries);
    let producer = Arc::new(GatedProducer::new());
    let publisher = StreamPublisher::new(config(&request, 0), producer.clone());

    let rewrite_waiting_file = async {
        producer.entered.notified().await;
        // The buffer holds one artifact, so the other URL has not read its file yet.
        let first = producer.sent.lock().unwrap()[0].key.clone();
        let waiting = if first == "https://a.example" { "b.html" } else { "a.html" };
        std::fs::write(dir.path().join(waiting), b"new!").unwrap();
        producer.release.add_permits(2);
    };
    let (result, ()) = tokio::join!(publisher.publish(&crawl, &request), rewrite_waiting_file);

    assert_eq!(result.success_count(), 2);
    let sent = producer.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].value, b"old!");
    assert_eq!(sent[1].value, b"new!");
    assert!(producer.peak.load(Ordering::SeqCst) <= request.tuning.buffer_memory);
}
