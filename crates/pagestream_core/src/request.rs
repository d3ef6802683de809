use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::SessionId;

/// How the engine is driven across the URLs of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// One engine invocation per URL, one after another.
    #[default]
    Sequential,
    Concurrent(ConcurrencyStrategy),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyStrategy {
    /// One invocation carrying every URL with the engine's `-parallel` flag set.
    Delegated,
    /// One invocation per URL, at most `workers` running at a time.
    FanOut { workers: usize },
}

/// Content kinds the engine produces for a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Markup,
    Text,
}

impl ContentKind {
    pub const ALL: [ContentKind; 2] = [ContentKind::Markup, ContentKind::Text];

    pub fn mime_type(self) -> &'static str {
        match self {
            ContentKind::Markup => "text/html",
            ContentKind::Text => "text/markdown",
        }
    }

    /// Name used by the engine for this kind.
    pub fn engine_name(self) -> &'static str {
        match self {
            ContentKind::Markup => "html",
            ContentKind::Text => "markdown",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Markup => write!(f, "markup"),
            ContentKind::Text => write!(f, "text"),
        }
    }
}

/// Which content kinds a stream request publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentSelector {
    Markup,
    Text,
    #[default]
    Both,
}

impl ContentSelector {
    /// Accepts both the neutral names and the engine's own spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "markup" | "html" => Some(ContentSelector::Markup),
            "text" | "markdown" | "md" => Some(ContentSelector::Text),
            "both" | "all" => Some(ContentSelector::Both),
            _ => None,
        }
    }

    pub fn kinds(self) -> &'static [ContentKind] {
        match self {
            ContentSelector::Markup => &[ContentKind::Markup],
            ContentSelector::Text => &[ContentKind::Text],
            ContentSelector::Both => &ContentKind::ALL,
        }
    }

    pub fn includes(self, kind: ContentKind) -> bool {
        self.kinds().contains(&kind)
    }

    pub fn engine_name(self) -> &'static str {
        match self {
            ContentSelector::Markup => "html",
            ContentSelector::Text => "markdown",
            ContentSelector::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Compression::None),
            "gzip" => Some(Compression::Gzip),
            "snappy" => Some(Compression::Snappy),
            "lz4" => Some(Compression::Lz4),
            "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// Engine-specific switches forwarded as flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Ask the engine to re-validate URLs (private address checks etc.).
    pub validate: bool,
    /// Upper bound on pages handled by one invocation.
    pub limit: Option<u32>,
    /// Browser control endpoint (`ws://` or `wss://`).
    pub proxy: Option<String>,
    /// Engine-side fetch timeout, distinct from the process timeout.
    pub fetch_timeout: Option<Duration>,
}

/// Raw transport tuning as supplied by a caller; `None` keeps the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuningParams {
    pub max_message_size: Option<usize>,
    pub buffer_memory: Option<usize>,
    pub max_request_size: Option<usize>,
    pub compression: Option<String>,
}

/// Unvalidated crawl request fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlParams {
    pub urls: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub mode: ExecutionMode,
    pub timeout: Option<Duration>,
    pub engine: EngineOptions,
}

/// Unvalidated stream request fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamParams {
    pub crawl: CrawlParams,
    pub brokers: Vec<String>,
    pub topic: String,
    pub content: String,
    pub session: Option<String>,
    pub tuning: TuningParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlRequest {
    pub urls: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub mode: ExecutionMode,
    pub timeout: Option<Duration>,
    pub engine: EngineOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTuning {
    pub max_message_size: usize,
    pub buffer_memory: usize,
    pub max_request_size: usize,
    pub compression: Compression,
}

impl TransportTuning {
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
    pub const DEFAULT_BUFFER_MEMORY: usize = 32 * 1024 * 1024;
    pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            max_message_size: Self::DEFAULT_MAX_MESSAGE_SIZE,
            buffer_memory: Self::DEFAULT_BUFFER_MEMORY,
            max_request_size: Self::DEFAULT_MAX_REQUEST_SIZE,
            compression: Compression::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub crawl: CrawlRequest,
    pub brokers: Vec<String>,
    pub topic: String,
    pub content: ContentSelector,
    pub session: SessionId,
    pub tuning: TransportTuning,
}

/// Unvalidated object-store upload fields. The engine uploads each artifact
/// under `uuid`; a fresh one is issued when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadParams {
    pub crawl: CrawlParams,
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub crawl: CrawlRequest,
    pub uuid: SessionId,
}
