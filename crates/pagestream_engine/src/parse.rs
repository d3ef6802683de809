//! Tolerant reading of engine stdout into per-URL outcomes.
//!
//! The engine prints log lines around a single JSON object mapping each URL
//! to a record, optionally wrapped as `{"results": {...}}`. Every URL handed
//! to an invocation gets exactly one outcome, whatever the engine printed.
use std::collections::BTreeMap;
use std::path::Path;

use engine_logging::{engine_debug, engine_warn};
use pagestream_core::{
    ArtifactSource, Artifacts, ContentKind, CrawlRequest, CrawlResult, FailureKind, KindDelivery,
    PublishReceipt, StreamOutcome, StreamRequest, StreamResult, UploadOutcome, UploadRequest,
    UploadResult, UrlOutcome,
};
use serde_json::{Map, Value};

use crate::dispatch::InvocationOutcome;
use crate::filename::{find_artifacts, object_key, resolve_reported};

#[derive(Debug, Clone, PartialEq, Eq)]
enum EngineRecord {
    Artifacts(Artifacts),
    Failed(String),
    /// `success: true` without any artifact reference.
    Acknowledged,
    Empty,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Extracted {
    /// No JSON object anywhere in the output.
    Nothing,
    Records(BTreeMap<String, EngineRecord>),
}

pub struct ResultParser;

impl ResultParser {
    /// Outcomes for the `urls` of one crawl invocation.
    pub fn parse(raw: &str, urls: &[String], output_dir: Option<&Path>) -> CrawlResult {
        let mut result = CrawlResult::pending(urls.iter().cloned());
        let records = match extract(raw, output_dir) {
            Ok(Extracted::Records(records)) => records,
            Ok(Extracted::Nothing) => BTreeMap::new(),
            Err(message) => {
                engine_warn!("unreadable engine output: {}", message);
                for url in urls {
                    result.record(url, UrlOutcome::failure(FailureKind::Parse, message.clone()));
                }
                return result;
            }
        };

        for url in urls {
            let outcome = match records.get(url) {
                Some(EngineRecord::Artifacts(artifacts)) => UrlOutcome::Success {
                    artifacts: artifacts.clone(),
                },
                Some(EngineRecord::Failed(message)) => {
                    UrlOutcome::failure(FailureKind::Engine, message.clone())
                }
                Some(EngineRecord::Malformed) => {
                    UrlOutcome::failure(FailureKind::Parse, "record is not an object")
                }
                Some(EngineRecord::Acknowledged | EngineRecord::Empty) | None => {
                    from_output_dir(url, output_dir)
                }
            };
            result.record(url, outcome);
        }
        result
    }

    /// Folds every invocation of a crawl batch into one result keyed by the
    /// request's URL set.
    pub fn collect(outcomes: &[InvocationOutcome], request: &CrawlRequest) -> CrawlResult {
        let output_dir = request.output_dir.as_deref();
        let mut result = CrawlResult::pending(request.urls.iter().cloned());
        for outcome in outcomes {
            match &outcome.result {
                Ok(raw) => {
                    let parsed = Self::parse(&raw.stdout, &outcome.urls, output_dir);
                    for (url, url_outcome) in parsed.iter() {
                        result.record(url, url_outcome.clone());
                    }
                }
                Err(failure) => {
                    for url in &outcome.urls {
                        result.record(url, UrlOutcome::failure(failure.kind(), failure.to_string()));
                    }
                }
            }
        }
        result
    }

    /// Outcomes of invocations where the engine uploaded to object storage.
    /// A URL counts as uploaded when the engine exited cleanly and left its
    /// local artifacts; each kind present gets the key the engine uses.
    pub fn collect_upload(outcomes: &[InvocationOutcome], request: &UploadRequest) -> UploadResult {
        let crawled = Self::collect(outcomes, &request.crawl);
        let uuid = &request.uuid;
        let mut result = UploadResult::pending(uuid.clone(), crawled.urls().cloned());
        for (url, outcome) in crawled.iter() {
            let upload = match outcome {
                UrlOutcome::Success { artifacts } => {
                    let keys = ContentKind::ALL
                        .into_iter()
                        .filter(|kind| artifacts.get(*kind).is_some())
                        .map(|kind| (kind, object_key(uuid, url, kind)))
                        .collect();
                    UploadOutcome::uploaded(uuid.clone(), keys, artifacts.clone())
                }
                UrlOutcome::Failure { .. } => {
                    UploadOutcome::failed(uuid.clone(), outcome.error().unwrap_or_default())
                }
            };
            result.record(url, upload);
        }
        result
    }

    /// Outcomes of invocations where the engine published to the broker
    /// itself. A clean exit with no JSON at all means every URL of that
    /// invocation was delivered.
    pub fn parse_delivery(outcomes: &[InvocationOutcome], request: &StreamRequest) -> StreamResult {
        let mut result =
            StreamResult::pending(request.session.clone(), request.crawl.urls.iter().cloned());
        let delivered = || {
            let receipt = PublishReceipt {
                topic: request.topic.clone(),
                partition: None,
                offset: None,
                session_id: request.session.clone(),
            };
            let kinds = request
                .content
                .kinds()
                .iter()
                .map(|kind| (*kind, KindDelivery::Delivered(receipt.clone())))
                .collect();
            StreamOutcome::from_deliveries(kinds)
        };

        for outcome in outcomes {
            let raw = match &outcome.result {
                Ok(raw) => raw,
                Err(failure) => {
                    let message = format!("{}: {failure}", failure.kind());
                    for url in &outcome.urls {
                        result.record(url, StreamOutcome::skipped(message.clone()));
                    }
                    continue;
                }
            };
            match extract(&raw.stdout, request.crawl.output_dir.as_deref()) {
                Ok(Extracted::Nothing) => {
                    for url in &outcome.urls {
                        result.record(url, delivered());
                    }
                }
                Ok(Extracted::Records(records)) => {
                    for url in &outcome.urls {
                        let url_outcome = match records.get(url) {
                            Some(EngineRecord::Artifacts(_) | EngineRecord::Acknowledged) => {
                                delivered()
                            }
                            Some(EngineRecord::Failed(message)) => {
                                StreamOutcome::skipped(format!("{}: {message}", FailureKind::Engine))
                            }
                            Some(EngineRecord::Malformed) => StreamOutcome::skipped(format!(
                                "{}: record is not an object",
                                FailureKind::Parse
                            )),
                            Some(EngineRecord::Empty) | None => {
                                StreamOutcome::skipped(FailureKind::NoResult.to_string())
                            }
                        };
                        result.record(url, url_outcome);
                    }
                }
                Err(message) => {
                    for url in &outcome.urls {
                        result.record(
                            url,
                            StreamOutcome::skipped(format!("{}: {message}", FailureKind::Parse)),
                        );
                    }
                }
            }
        }
        result
    }
}

fn from_output_dir(url: &str, output_dir: Option<&Path>) -> UrlOutcome {
    if let Some(dir) = output_dir {
        let artifacts = find_artifacts(dir, url);
        if !artifacts.is_empty() {
            engine_debug!("found artifacts for {} in {}", url, dir.display());
            return UrlOutcome::Success { artifacts };
        }
    }
    UrlOutcome::failure(FailureKind::NoResult, "engine reported nothing for this url")
}

fn extract(raw: &str, output_dir: Option<&Path>) -> Result<Extracted, String> {
    // Prefer an object opening a line so braces inside log messages are skipped.
    let Some(start) = object_start(raw) else {
        return Ok(Extracted::Nothing);
    };
    let value: Value = serde_json::Deserializer::from_str(&raw[start..])
        .into_iter::<Value>()
        .next()
        .ok_or_else(|| "empty JSON stream".to_string())?
        .map_err(|err| err.to_string())?;

    let Value::Object(mut top) = value else {
        return Err("engine output is not a JSON object".to_string());
    };
    if let Some(Value::Object(wrapped)) = top.remove("results") {
        top = wrapped;
    }

    let records = top
        .into_iter()
        .map(|(url, record)| {
            let record = classify(&record, output_dir);
            (url, record)
        })
        .collect();
    Ok(Extracted::Records(records))
}

fn object_start(raw: &str) -> Option<usize> {
    let mut offset = 0;
    for line in raw.split_inclusive('\n') {
        let indent = line.len() - line.trim_start().len();
        if line[indent..].starts_with('{') {
            return Some(offset + indent);
        }
        offset += line.len();
    }
    raw.find('{')
}

fn classify(value: &Value, output_dir: Option<&Path>) -> EngineRecord {
    let Some(record) = value.as_object() else {
        return EngineRecord::Malformed;
    };
    let success = record.get("success").and_then(Value::as_bool);
    let error = record
        .get("error")
        .and_then(Value::as_str)
        .filter(|e| !e.trim().is_empty());

    if success == Some(false) {
        return EngineRecord::Failed(error.unwrap_or("engine reported failure").to_string());
    }

    let mut artifacts = Artifacts::default();
    read_artifacts(record, output_dir, &mut artifacts);
    if let Some(details) = record.get("details").and_then(Value::as_object) {
        read_artifacts(details, output_dir, &mut artifacts);
    }

    if !artifacts.is_empty() {
        EngineRecord::Artifacts(artifacts)
    } else if let Some(error) = error {
        EngineRecord::Failed(error.to_string())
    } else if success == Some(true) {
        EngineRecord::Acknowledged
    } else {
        EngineRecord::Empty
    }
}

/// Fills kinds not already set; the record's own fields win over `details`.
fn read_artifacts(record: &Map<String, Value>, output_dir: Option<&Path>, artifacts: &mut Artifacts) {
    for kind in ContentKind::ALL {
        if artifacts.get(kind).is_some() {
            continue;
        }
        let name = kind.engine_name();
        let path = [name.to_string(), format!("{name}_file"), format!("local_{name}_file")]
            .iter()
            .find_map(|key| non_empty_str(record, key));
        if let Some(path) = path {
            artifacts.set(kind, ArtifactSource::Path(resolve_reported(path, output_dir)));
            continue;
        }
        if let Some(inline) = non_empty_str(record, &format!("{name}_content")) {
            artifacts.set(kind, ArtifactSource::Inline(inline.to_string()));
        }
    }
}

fn non_empty_str<'a>(record: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}
