//! Pre-flight validation of crawl and stream requests.
//!
//! Everything here is synchronous and side-effect free: a request is either
//! normalized completely or rejected with the first offending field, before
//! any process is spawned or any broker is contacted.

use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::request::{
    Compression, ConcurrencyStrategy, ContentSelector, CrawlParams, CrawlRequest, EngineOptions,
    ExecutionMode, StreamParams, StreamRequest, TransportTuning, TuningParams, UploadParams,
    UploadRequest,
};
use crate::SessionRegistry;

/// Hard ceiling for a single broker message.
pub const MAX_MESSAGE_CEILING: usize = 100 * 1024 * 1024;
const MAX_BUFFER_MEMORY: usize = 1024 * 1024 * 1024;
const MAX_TOPIC_LEN: usize = 249;
const MAX_WORKERS: usize = 64;
const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no urls supplied")]
    NoUrls,
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no broker addresses supplied")]
    NoBrokers,
    #[error("invalid broker address {0:?}: expected host:port")]
    InvalidBroker(String),
    #[error("invalid topic name {0:?}")]
    InvalidTopic(String),
    #[error("invalid session id {0:?}")]
    InvalidSession(String),
    #[error("unknown content selector {0:?}")]
    InvalidContent(String),
    #[error("unknown compression {0:?}")]
    InvalidCompression(String),
    #[error("invalid proxy {0:?}: must start with ws:// or wss://")]
    InvalidProxy(String),
    #[error("invalid output location {0:?}")]
    InvalidOutputDir(String),
    #[error("{field} must be a whole number of seconds, got {value:?}")]
    FractionalSeconds { field: &'static str, value: Duration },
    #[error("{field} out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

pub fn validate_crawl(params: CrawlParams) -> Result<CrawlRequest, ValidationError> {
    let urls = normalize_urls(&params.urls)?;
    let output_dir = normalize_output_dir(params.output_dir)?;
    check_mode(params.mode)?;
    if let Some(timeout) = params.timeout {
        check_timeout("timeout", timeout)?;
    }
    let engine = check_engine_options(params.engine)?;

    Ok(CrawlRequest {
        urls,
        output_dir,
        mode: params.mode,
        timeout: params.timeout,
        engine,
    })
}

pub fn validate_stream(params: StreamParams) -> Result<StreamRequest, ValidationError> {
    let crawl = validate_crawl(params.crawl)?;
    let brokers = normalize_brokers(&params.brokers)?;
    let topic = params.topic.trim().to_string();
    check_topic(&topic)?;
    let content = if params.content.trim().is_empty() {
        ContentSelector::default()
    } else {
        ContentSelector::parse(&params.content)
            .ok_or_else(|| ValidationError::InvalidContent(params.content.clone()))?
    };
    let tuning = check_tuning(&params.tuning)?;
    let session = SessionRegistry.ensure(params.session.as_deref())?;

    Ok(StreamRequest {
        crawl,
        brokers,
        topic,
        content,
        session,
        tuning,
    })
}

pub fn validate_upload(params: UploadParams) -> Result<UploadRequest, ValidationError> {
    let crawl = validate_crawl(params.crawl)?;
    let uuid = SessionRegistry.ensure(params.uuid.as_deref())?;
    Ok(UploadRequest { crawl, uuid })
}

fn normalize_urls(raw: &[String]) -> Result<Vec<String>, ValidationError> {
    let mut seen = HashSet::new();
    let mut urls = Vec::with_capacity(raw.len());
    for entry in raw {
        let url = entry.trim();
        check_url(url)?;
        if seen.insert(url.to_string()) {
            urls.push(url.to_string());
        }
    }
    if urls.is_empty() {
        return Err(ValidationError::NoUrls);
    }
    Ok(urls)
}

fn check_url(url: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };
    if url.is_empty() {
        return Err(invalid("empty"));
    }
    if url.starts_with('-') {
        return Err(invalid("would be read as an engine flag"));
    }
    let parsed = Url::parse(url).map_err(|err| invalid(&err.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(invalid("only http and https are supported"));
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid("missing host")),
    }
}

fn normalize_output_dir(dir: Option<PathBuf>) -> Result<Option<PathBuf>, ValidationError> {
    let Some(dir) = dir else {
        return Ok(None);
    };
    let text = dir.to_string_lossy();
    if text.trim().is_empty() {
        return Ok(None);
    }
    if text.starts_with('-') {
        return Err(ValidationError::InvalidOutputDir(text.into_owned()));
    }
    Ok(Some(dir))
}

fn check_mode(mode: ExecutionMode) -> Result<(), ValidationError> {
    if let ExecutionMode::Concurrent(ConcurrencyStrategy::FanOut { workers }) = mode {
        check_range("workers", workers as u64, 1, MAX_WORKERS as u64)?;
    }
    Ok(())
}

fn check_timeout(field: &'static str, timeout: Duration) -> Result<(), ValidationError> {
    if timeout < MIN_TIMEOUT || timeout > MAX_TIMEOUT {
        return Err(ValidationError::OutOfRange {
            field,
            value: timeout.as_secs(),
            min: MIN_TIMEOUT.as_secs(),
            max: MAX_TIMEOUT.as_secs(),
        });
    }
    Ok(())
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn check_engine_options(options: EngineOptions) -> Result<EngineOptions, ValidationError> {
    if let Some(limit) = options.limit {
        check_range("limit", u64::from(limit), 1, u64::from(u32::MAX))?;
    }
    if let Some(timeout) = options.fetch_timeout {
        check_timeout("fetch_timeout", timeout)?;
        // The engine flag only carries whole seconds.
        if timeout.subsec_nanos() != 0 {
            return Err(ValidationError::FractionalSeconds {
                field: "fetch_timeout",
                value: timeout,
            });
        }
    }
    let proxy = match options.proxy {
        Some(proxy) if proxy.trim().is_empty() => None,
        Some(proxy) => {
            let proxy = proxy.trim().to_string();
            if !(proxy.starts_with("ws://") || proxy.starts_with("wss://")) {
                return Err(ValidationError::InvalidProxy(proxy));
            }
            Some(proxy)
        }
        None => None,
    };
    Ok(EngineOptions { proxy, ..options })
}

/// Splits comma-joined entries and checks each one is `host:port`.
fn normalize_brokers(raw: &[String]) -> Result<Vec<String>, ValidationError> {
    let brokers: Vec<String> = raw
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    if brokers.is_empty() {
        return Err(ValidationError::NoBrokers);
    }
    for broker in &brokers {
        check_broker(broker)?;
    }
    Ok(brokers)
}

fn check_broker(broker: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidBroker(broker.to_string());
    let (host, port) = broker.rsplit_once(':').ok_or_else(invalid)?;
    match port.parse::<u16>() {
        Ok(port) if port > 0 => {}
        _ => return Err(invalid()),
    }
    let host_ok = if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        inner.parse::<Ipv6Addr>().is_ok()
    } else {
        !host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    };
    if host_ok {
        Ok(())
    } else {
        Err(invalid())
    }
}

fn check_topic(topic: &str) -> Result<(), ValidationError> {
    let ok = !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && topic != "."
        && topic != ".."
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidTopic(topic.to_string()))
    }
}

fn check_tuning(params: &TuningParams) -> Result<TransportTuning, ValidationError> {
    let defaults = TransportTuning::default();
    let max_message_size = params.max_message_size.unwrap_or(defaults.max_message_size);
    check_range(
        "max_message_size",
        max_message_size as u64,
        1,
        MAX_MESSAGE_CEILING as u64,
    )?;

    // Unset budgets never fall below an explicitly raised message size.
    let buffer_memory = params
        .buffer_memory
        .unwrap_or_else(|| defaults.buffer_memory.max(max_message_size));
    check_range(
        "buffer_memory",
        buffer_memory as u64,
        max_message_size as u64,
        MAX_BUFFER_MEMORY as u64,
    )?;

    let max_request_size = params
        .max_request_size
        .unwrap_or_else(|| defaults.max_request_size.max(max_message_size));
    check_range(
        "max_request_size",
        max_request_size as u64,
        max_message_size as u64,
        MAX_BUFFER_MEMORY as u64,
    )?;

    let compression = match params.compression.as_deref() {
        None => defaults.compression,
        Some(raw) => {
            Compression::parse(raw).ok_or_else(|| ValidationError::InvalidCompression(raw.into()))?
        }
    };

    Ok(TransportTuning {
        max_message_size,
        buffer_memory,
        max_request_size,
        compression,
    })
}
