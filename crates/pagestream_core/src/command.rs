//! Engine invocation grammar: `[flags...] <action> <urls...>`.
//!
//! The engine rejects any flag after the action token and any URL before
//! it. [`CommandBuilder`] keeps flags and URLs apart until [`Invocation::args`]
//! renders them, so the only way to obtain an [`Invocation`] is in order.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::request::{ContentSelector, CrawlRequest, StreamRequest, UploadRequest};
use crate::SessionId;

/// Every flag the engine understands, with whether it takes a value.
const KNOWN_FLAGS: &[(&str, bool)] = &[
    ("-outdir", true),
    ("-parallel", false),
    ("-validate", false),
    ("-limit", true),
    ("-timeout", true),
    ("-proxy", true),
    ("-content", true),
    ("-session", true),
    ("-topic", true),
    ("-brokers", true),
    ("-uuid", true),
];

/// Argument that makes the engine print its version and exit.
pub const VERSION_FLAG: &str = "-version";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("invocation has no urls")]
    NoUrls,
    #[error("url {0:?} would be read as a flag")]
    UrlLooksLikeFlag(String),
    #[error("invalid value {value:?} for {flag}")]
    InvalidFlagValue { flag: &'static str, value: String },
    #[error("flag {0} given twice")]
    DuplicateFlag(&'static str),
    #[error("no action token in arguments")]
    MissingAction,
    #[error("flag {0:?} placed after the action token")]
    FlagAfterAction(String),
    #[error("argument {0:?} placed before the action token is not a flag")]
    UrlBeforeAction(String),
    #[error("unknown flag {0:?}")]
    UnknownFlag(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Fetch and convert, writing artifacts to the output location.
    Crawl,
    /// Fetch and convert, with the engine publishing to the broker itself.
    Stream,
    /// Fetch and convert, then upload the artifacts to object storage.
    Upload,
}

impl Action {
    pub fn token(self) -> &'static str {
        match self {
            Action::Crawl => "-crawl",
            Action::Stream => "-kafka",
            Action::Upload => "-r2",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "-crawl" => Some(Action::Crawl),
            "-kafka" => Some(Action::Stream),
            "-r2" => Some(Action::Upload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flag {
    OutputDir(PathBuf),
    Parallel,
    Validate,
    Limit(u32),
    FetchTimeout(Duration),
    Proxy(String),
    Content(ContentSelector),
    Session(SessionId),
    Topic(String),
    Brokers(Vec<String>),
    /// Object-store prefix shared by one upload batch.
    Uuid(SessionId),
}

impl Flag {
    pub fn name(&self) -> &'static str {
        match self {
            Flag::OutputDir(_) => "-outdir",
            Flag::Parallel => "-parallel",
            Flag::Validate => "-validate",
            Flag::Limit(_) => "-limit",
            Flag::FetchTimeout(_) => "-timeout",
            Flag::Proxy(_) => "-proxy",
            Flag::Content(_) => "-content",
            Flag::Session(_) => "-session",
            Flag::Topic(_) => "-topic",
            Flag::Brokers(_) => "-brokers",
            Flag::Uuid(_) => "-uuid",
        }
    }

    pub fn value(&self) -> Option<String> {
        match self {
            Flag::OutputDir(dir) => Some(dir.to_string_lossy().into_owned()),
            Flag::Parallel | Flag::Validate => None,
            Flag::Limit(limit) => Some(limit.to_string()),
            Flag::FetchTimeout(timeout) => Some(timeout.as_secs().to_string()),
            Flag::Proxy(proxy) => Some(proxy.clone()),
            Flag::Content(selector) => Some(selector.engine_name().to_string()),
            Flag::Session(session) => Some(session.to_string()),
            Flag::Topic(topic) => Some(topic.clone()),
            Flag::Brokers(brokers) => Some(brokers.join(",")),
            Flag::Uuid(uuid) => Some(uuid.to_string()),
        }
    }
}

/// A fully ordered engine invocation. Only [`CommandBuilder`] creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    flags: Vec<Flag>,
    action: Action,
    urls: Vec<String>,
}

impl Invocation {
    pub fn flags(&self) -> &[Flag] {
        &self.flags
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|flag| flag.name() == name)
    }

    /// Renders the argument vector (without the program name).
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.flags.len() * 2 + 1 + self.urls.len());
        for flag in &self.flags {
            args.push(flag.name().to_string());
            if let Some(value) = flag.value() {
                args.push(value);
            }
        }
        args.push(self.action.token().to_string());
        args.extend(self.urls.iter().cloned());
        args
    }

    /// Checks an arbitrary argument vector against the engine grammar.
    pub fn check_order(args: &[String]) -> Result<(), BuildError> {
        let mut idx = 0;
        let mut saw_action = false;
        while idx < args.len() {
            let token = args[idx].as_str();
            if Action::from_token(token).is_some() {
                saw_action = true;
                idx += 1;
                break;
            }
            let Some(&(name, takes_value)) = KNOWN_FLAGS.iter().find(|(name, _)| *name == token)
            else {
                if token.starts_with('-') {
                    return Err(BuildError::UnknownFlag(token.to_string()));
                }
                return Err(BuildError::UrlBeforeAction(token.to_string()));
            };
            if takes_value {
                match args.get(idx + 1) {
                    Some(value) if !value.is_empty() && !value.starts_with('-') => {}
                    other => {
                        return Err(BuildError::InvalidFlagValue {
                            flag: name,
                            value: other.cloned().unwrap_or_default(),
                        })
                    }
                }
                idx += 2;
            } else {
                idx += 1;
            }
        }
        if !saw_action {
            return Err(BuildError::MissingAction);
        }
        let urls = &args[idx..];
        if urls.is_empty() {
            return Err(BuildError::NoUrls);
        }
        if let Some(stray) = urls.iter().find(|arg| arg.starts_with('-')) {
            return Err(BuildError::FlagAfterAction(stray.clone()));
        }
        Ok(())
    }
}

/// Collects flags and URLs separately and emits them in engine order.
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    flags: Vec<Flag>,
    urls: Vec<String>,
}

impl CommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(mut self, flag: Flag) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    pub fn urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls.extend(urls.into_iter().map(Into::into));
        self
    }

    pub fn build(self, action: Action) -> Result<Invocation, BuildError> {
        let mut seen: Vec<&'static str> = Vec::with_capacity(self.flags.len());
        for flag in &self.flags {
            let name = flag.name();
            if seen.contains(&name) {
                return Err(BuildError::DuplicateFlag(name));
            }
            seen.push(name);
            if let Some(value) = flag.value() {
                if value.is_empty() || value.starts_with('-') {
                    return Err(BuildError::InvalidFlagValue { flag: name, value });
                }
            }
        }
        if self.urls.is_empty() {
            return Err(BuildError::NoUrls);
        }
        if let Some(url) = self.urls.iter().find(|url| url.is_empty() || url.starts_with('-')) {
            return Err(BuildError::UrlLooksLikeFlag(url.clone()));
        }
        Ok(Invocation {
            flags: self.flags,
            action,
            urls: self.urls,
        })
    }

    /// Invocation for a crawl over `urls`, a subset of the request's URLs.
    pub fn for_crawl(
        request: &CrawlRequest,
        urls: &[String],
        parallel: bool,
    ) -> Result<Invocation, BuildError> {
        Self::with_request_flags(request, parallel)
            .urls(urls.iter().cloned())
            .build(Action::Crawl)
    }

    /// Invocation that has the engine publish to the broker itself.
    pub fn for_stream(
        request: &StreamRequest,
        urls: &[String],
        parallel: bool,
    ) -> Result<Invocation, BuildError> {
        Self::with_request_flags(&request.crawl, parallel)
            .flag(Flag::Content(request.content))
            .flag(Flag::Session(request.session.clone()))
            .flag(Flag::Topic(request.topic.clone()))
            .flag(Flag::Brokers(request.brokers.clone()))
            .urls(urls.iter().cloned())
            .build(Action::Stream)
    }

    /// Invocation that has the engine upload its artifacts under the
    /// request's uuid.
    pub fn for_upload(
        request: &UploadRequest,
        urls: &[String],
        parallel: bool,
    ) -> Result<Invocation, BuildError> {
        Self::with_request_flags(&request.crawl, parallel)
            .flag(Flag::Uuid(request.uuid.clone()))
            .urls(urls.iter().cloned())
            .build(Action::Upload)
    }

    fn with_request_flags(request: &CrawlRequest, parallel: bool) -> Self {
        let mut builder = Self::new();
        if let Some(dir) = &request.output_dir {
            builder = builder.flag(Flag::OutputDir(dir.clone()));
        }
        if parallel {
            builder = builder.flag(Flag::Parallel);
        }
        if request.engine.validate {
            builder = builder.flag(Flag::Validate);
        }
        if let Some(limit) = request.engine.limit {
            builder = builder.flag(Flag::Limit(limit));
        }
        if let Some(timeout) = request.engine.fetch_timeout {
            builder = builder.flag(Flag::FetchTimeout(timeout));
        }
        if let Some(proxy) = &request.engine.proxy {
            builder = builder.flag(Flag::Proxy(proxy.clone()));
        }
        builder
    }
}
