use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::request::ContentKind;
use crate::SessionId;

const NO_RESULT: &str = "no result";
const NOT_PUBLISHED: &str = "not published";
const NOT_UPLOADED: &str = "not uploaded";

/// Where an artifact's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactSource {
    Path(PathBuf),
    Inline(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Artifacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markup: Option<ArtifactSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<ArtifactSource>,
}

impl Artifacts {
    pub fn get(&self, kind: ContentKind) -> Option<&ArtifactSource> {
        match kind {
            ContentKind::Markup => self.markup.as_ref(),
            ContentKind::Text => self.text.as_ref(),
        }
    }

    pub fn set(&mut self, kind: ContentKind, source: ArtifactSource) {
        match kind {
            ContentKind::Markup => self.markup = Some(source),
            ContentKind::Text => self.text = Some(source),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.markup.is_none() && self.text.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The invocation exceeded its timeout and was killed.
    Timeout,
    /// The engine exited non-zero.
    ProcessExit,
    /// The engine output could not be read.
    Parse,
    /// The engine output said nothing about this URL.
    NoResult,
    /// The engine reported a failure for this URL.
    Engine,
    /// No valid invocation could be built for this URL.
    Build,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::ProcessExit => write!(f, "process exit"),
            FailureKind::Parse => write!(f, "parse error"),
            FailureKind::NoResult => write!(f, "no result"),
            FailureKind::Engine => write!(f, "engine error"),
            FailureKind::Build => write!(f, "invocation error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UrlOutcome {
    Success { artifacts: Artifacts },
    Failure { kind: FailureKind, message: String },
}

impl UrlOutcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        UrlOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UrlOutcome::Success { .. })
    }

    pub fn artifacts(&self) -> Option<&Artifacts> {
        match self {
            UrlOutcome::Success { artifacts } => Some(artifacts),
            UrlOutcome::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            UrlOutcome::Success { .. } => None,
            UrlOutcome::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            UrlOutcome::Success { .. } => None,
            UrlOutcome::Failure { kind, message } => Some(format!("{kind}: {message}")),
        }
    }
}

/// Per-URL crawl outcomes. The key set is fixed when the value is created,
/// so it always equals the requested URL set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CrawlResult {
    entries: BTreeMap<String, UrlOutcome>,
}

impl CrawlResult {
    /// Seeds every URL with a `NoResult` failure.
    pub fn pending<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = urls
            .into_iter()
            .map(|url| (url.into(), UrlOutcome::failure(FailureKind::NoResult, NO_RESULT)))
            .collect();
        Self { entries }
    }

    /// Stores `outcome` for `url`; returns `false` (and drops it) for URLs
    /// that were never requested.
    pub fn record(&mut self, url: &str, outcome: UrlOutcome) -> bool {
        match self.entries.get_mut(url) {
            Some(slot) => {
                *slot = outcome;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, url: &str) -> Option<&UrlOutcome> {
        self.entries.get(url)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &UrlOutcome)> {
        self.entries.iter()
    }

    pub fn urls(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.entries.values().filter(|o| o.is_success()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub topic: String,
    /// Absent when the engine published on our behalf.
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishFailure {
    #[error("artifact of {size} bytes exceeds max message size {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("artifact not produced by the engine")]
    MissingArtifact,
    #[error("failed to read artifact {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("broker error: {0}")]
    Broker(String),
}

impl Serialize for PublishFailure {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KindDelivery {
    Delivered(PublishReceipt),
    Failed(PublishFailure),
}

impl KindDelivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, KindDelivery::Delivered(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamOutcome {
    success: bool,
    kinds: BTreeMap<ContentKind, KindDelivery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl StreamOutcome {
    /// Outcome for a URL whose selected kinds were each attempted.
    pub fn from_deliveries(kinds: BTreeMap<ContentKind, KindDelivery>) -> Self {
        let success = !kinds.is_empty() && kinds.values().all(KindDelivery::is_delivered);
        let error = if success {
            None
        } else {
            let failed: Vec<String> = kinds
                .iter()
                .filter_map(|(kind, delivery)| match delivery {
                    KindDelivery::Failed(failure) => Some(format!("{kind}: {failure}")),
                    KindDelivery::Delivered(_) => None,
                })
                .collect();
            Some(if failed.is_empty() {
                NOT_PUBLISHED.to_string()
            } else {
                failed.join("; ")
            })
        };
        Self {
            success,
            kinds,
            error,
        }
    }

    /// Outcome for a URL that never reached the publish step.
    pub fn skipped(error: impl Into<String>) -> Self {
        Self {
            success: false,
            kinds: BTreeMap::new(),
            error: Some(error.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn kinds(&self) -> &BTreeMap<ContentKind, KindDelivery> {
        &self.kinds
    }

    pub fn delivery(&self, kind: ContentKind) -> Option<&KindDelivery> {
        self.kinds.get(&kind)
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Per-URL publish outcomes for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamResult {
    session: SessionId,
    entries: BTreeMap<String, StreamOutcome>,
}

impl StreamResult {
    pub fn pending<I, S>(session: SessionId, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = urls
            .into_iter()
            .map(|url| (url.into(), StreamOutcome::skipped(NOT_PUBLISHED)))
            .collect();
        Self { session, entries }
    }

    pub fn record(&mut self, url: &str, outcome: StreamOutcome) -> bool {
        match self.entries.get_mut(url) {
            Some(slot) => {
                *slot = outcome;
                true
            }
            None => false,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn get(&self, url: &str) -> Option<&StreamOutcome> {
        self.entries.get(url)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StreamOutcome)> {
        self.entries.iter()
    }

    pub fn urls(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.entries.values().filter(|o| o.success()).count()
    }
}

/// Object-store upload of one URL: where each kind went and the local copy
/// the engine kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    success: bool,
    uuid: SessionId,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    object_keys: BTreeMap<ContentKind, String>,
    #[serde(skip_serializing_if = "Artifacts::is_empty")]
    local: Artifacts,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl UploadOutcome {
    pub fn uploaded(uuid: SessionId, object_keys: BTreeMap<ContentKind, String>, local: Artifacts) -> Self {
        Self {
            success: !object_keys.is_empty(),
            uuid,
            object_keys,
            local,
            error: None,
        }
    }

    pub fn failed(uuid: SessionId, error: impl Into<String>) -> Self {
        Self {
            success: false,
            uuid,
            object_keys: BTreeMap::new(),
            local: Artifacts::default(),
            error: Some(error.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn uuid(&self) -> &SessionId {
        &self.uuid
    }

    pub fn object_key(&self, kind: ContentKind) -> Option<&str> {
        self.object_keys.get(&kind).map(String::as_str)
    }

    pub fn local(&self) -> &Artifacts {
        &self.local
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Per-URL upload outcomes for one uuid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    uuid: SessionId,
    entries: BTreeMap<String, UploadOutcome>,
}

impl UploadResult {
    pub fn pending<I, S>(uuid: SessionId, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = urls
            .into_iter()
            .map(|url| (url.into(), UploadOutcome::failed(uuid.clone(), NOT_UPLOADED)))
            .collect();
        Self { uuid, entries }
    }

    pub fn record(&mut self, url: &str, outcome: UploadOutcome) -> bool {
        match self.entries.get_mut(url) {
            Some(slot) => {
                *slot = outcome;
                true
            }
            None => false,
        }
    }

    pub fn uuid(&self) -> &SessionId {
        &self.uuid
    }

    pub fn get(&self, url: &str) -> Option<&UploadOutcome> {
        self.entries.get(url)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &UploadOutcome)> {
        self.entries.iter()
    }

    pub fn urls(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.entries.values().filter(|o| o.success()).count()
    }
}
