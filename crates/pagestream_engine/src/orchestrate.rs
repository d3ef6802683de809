//! Batch driver: validate, dispatch, parse and optionally publish.
//!
//! Only a rejected request or an unreachable engine fail a call; every
//! other problem is recorded against the URLs it affects.
use std::borrow::Cow;
use std::path::{Path, PathBuf};

use engine_logging::{engine_debug, engine_info, engine_warn};
use pagestream_core::{
    advance, validate_crawl, validate_stream, validate_upload, BatchEvent, BatchState, CrawlParams,
    CrawlRequest, CrawlResult, StreamParams, StreamRequest, StreamResult, UploadParams,
    UploadRequest, UploadResult, ValidationError,
};
use tempfile::TempDir;
use thiserror::Error;

use crate::dispatch::ProcessDispatcher;
use crate::locate::InvocationError;
use crate::parse::ResultParser;
use crate::persist::ensure_output_dir;
use crate::publish::StreamPublisher;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("engine unavailable: {0}")]
    Engine(#[from] InvocationError),
}

struct Batch {
    label: String,
    state: BatchState,
}

impl Batch {
    fn start(label: impl Into<String>) -> Self {
        let mut batch = Self {
            label: label.into(),
            state: BatchState::default(),
        };
        batch.step(BatchEvent::Started);
        batch
    }

    fn step(&mut self, event: BatchEvent) {
        let next = advance(self.state, event);
        if next != self.state {
            engine_debug!("batch {}: {:?} -> {:?}", self.label, self.state, next);
        }
        self.state = next;
    }

    fn fail<E: Into<BatchError>>(&mut self, event: BatchEvent, err: E) -> BatchError {
        self.step(event);
        let err = err.into();
        engine_warn!("batch {} failed: {}", self.label, err);
        err
    }
}

pub struct Orchestrator {
    dispatcher: ProcessDispatcher,
}

impl Orchestrator {
    pub fn new(dispatcher: ProcessDispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn crawl(&self, params: CrawlParams) -> Result<CrawlResult, BatchError> {
        let mut batch = Batch::start(format!("crawl of {} url(s)", params.urls.len()));
        let request = validate_crawl(params).map_err(|e| batch.fail(BatchEvent::Rejected, e))?;
        batch.step(BatchEvent::Validated);
        self.run_crawl(&mut batch, &request).await
    }

    /// Crawl for a request that already passed validation.
    pub async fn crawl_request(&self, request: &CrawlRequest) -> Result<CrawlResult, BatchError> {
        let mut batch = Batch::start(format!("crawl of {} url(s)", request.urls.len()));
        batch.step(BatchEvent::Validated);
        self.run_crawl(&mut batch, request).await
    }

    pub async fn stream(
        &self,
        params: StreamParams,
        publisher: &StreamPublisher,
    ) -> Result<StreamResult, BatchError> {
        let mut batch = Batch::start("stream");
        let request = validate_stream(params).map_err(|e| batch.fail(BatchEvent::Rejected, e))?;
        batch.label = format!("session {}", request.session);
        batch.step(BatchEvent::Validated);
        self.run_stream(&mut batch, &request, publisher).await
    }

    /// Stream for a request that already passed validation.
    pub async fn stream_request(
        &self,
        request: &StreamRequest,
        publisher: &StreamPublisher,
    ) -> Result<StreamResult, BatchError> {
        let mut batch = Batch::start(format!("session {}", request.session));
        batch.step(BatchEvent::Validated);
        self.run_stream(&mut batch, request, publisher).await
    }

    /// Lets the engine publish to the broker itself with its `-kafka` action.
    pub async fn stream_via_engine(&self, params: StreamParams) -> Result<StreamResult, BatchError> {
        let mut batch = Batch::start("engine stream");
        let request = validate_stream(params).map_err(|e| batch.fail(BatchEvent::Rejected, e))?;
        batch.label = format!("session {}", request.session);
        batch.step(BatchEvent::Validated);
        prepare_output_dir(request.crawl.output_dir.as_deref());

        let outcomes = self
            .dispatcher
            .run_stream(&request)
            .await
            .map_err(|e| batch.fail(BatchEvent::EngineUnreachable, e))?;
        batch.step(BatchEvent::Dispatched);
        let result = ResultParser::parse_delivery(&outcomes, &request);
        batch.step(BatchEvent::Parsed { publish: true });
        batch.step(BatchEvent::Published);
        engine_info!(
            "{}: engine delivered {}/{} url(s)",
            batch.label,
            result.success_count(),
            result.len()
        );
        Ok(result)
    }

    /// Runs the engine's object-store upload action (`-r2`) under one uuid.
    pub async fn upload(&self, params: UploadParams) -> Result<UploadResult, BatchError> {
        let mut batch = Batch::start("upload");
        let request = validate_upload(params).map_err(|e| batch.fail(BatchEvent::Rejected, e))?;
        batch.step(BatchEvent::Validated);
        self.run_upload(&mut batch, &request).await
    }

    /// Upload for a request that already passed validation.
    pub async fn upload_request(&self, request: &UploadRequest) -> Result<UploadResult, BatchError> {
        let mut batch = Batch::start("upload");
        batch.step(BatchEvent::Validated);
        self.run_upload(&mut batch, request).await
    }

    async fn run_upload(
        &self,
        batch: &mut Batch,
        request: &UploadRequest,
    ) -> Result<UploadResult, BatchError> {
        batch.label = format!("upload {}", request.uuid);
        let request = match kept_output_dir(request.crawl.output_dir.as_deref()) {
            Some(dir) => {
                let mut upload = request.clone();
                upload.crawl.output_dir = Some(dir);
                Cow::Owned(upload)
            }
            None => Cow::Borrowed(request),
        };
        prepare_output_dir(request.crawl.output_dir.as_deref());

        let outcomes = self
            .dispatcher
            .run_upload(&request)
            .await
            .map_err(|e| batch.fail(BatchEvent::EngineUnreachable, e))?;
        batch.step(BatchEvent::Dispatched);
        let result = ResultParser::collect_upload(&outcomes, &request);
        batch.step(BatchEvent::Parsed { publish: true });
        batch.step(BatchEvent::Published);
        engine_info!(
            "{}: {}/{} url(s) uploaded",
            batch.label,
            result.success_count(),
            result.len()
        );
        Ok(result)
    }

    async fn run_crawl(&self, batch: &mut Batch, request: &CrawlRequest) -> Result<CrawlResult, BatchError> {
        // Artifact paths are returned to the caller, so they must outlive the call.
        let request = match kept_output_dir(request.output_dir.as_deref()) {
            Some(dir) => {
                let mut crawl = request.clone();
                crawl.output_dir = Some(dir);
                Cow::Owned(crawl)
            }
            None => Cow::Borrowed(request),
        };
        let result = self.dispatch_and_parse(batch, &request).await?;
        batch.step(BatchEvent::Parsed { publish: false });
        engine_info!(
            "{}: {}/{} url(s) succeeded",
            batch.label,
            result.success_count(),
            result.len()
        );
        Ok(result)
    }

    async fn run_stream(
        &self,
        batch: &mut Batch,
        request: &StreamRequest,
        publisher: &StreamPublisher,
    ) -> Result<StreamResult, BatchError> {
        // Artifacts need somewhere to land until they are published.
        let scratch = match request.crawl.output_dir {
            Some(_) => None,
            None => scratch_dir(),
        };
        let crawl_request = match &scratch {
            Some(dir) => {
                let mut crawl = request.crawl.clone();
                crawl.output_dir = Some(dir.path().to_path_buf());
                Cow::Owned(crawl)
            }
            None => Cow::Borrowed(&request.crawl),
        };

        let crawled = self.dispatch_and_parse(batch, &crawl_request).await?;
        batch.step(BatchEvent::Parsed { publish: true });
        let result = publisher.publish(&crawled, request).await;
        batch.step(BatchEvent::Published);
        drop(scratch);
        Ok(result)
    }

    async fn dispatch_and_parse(
        &self,
        batch: &mut Batch,
        request: &CrawlRequest,
    ) -> Result<CrawlResult, BatchError> {
        prepare_output_dir(request.output_dir.as_deref());
        let outcomes = self
            .dispatcher
            .run(request)
            .await
            .map_err(|e| batch.fail(BatchEvent::EngineUnreachable, e))?;
        batch.step(BatchEvent::Dispatched);
        Ok(ResultParser::collect(&outcomes, request))
    }
}

/// The engine reports its own write failures per URL, so a bad directory
/// is only logged here.
fn prepare_output_dir(dir: Option<&Path>) {
    if let Some(dir) = dir {
        if let Err(err) = ensure_output_dir(dir) {
            engine_warn!("{}", err);
        }
    }
}

/// A fresh `pagestream_*` directory that is not removed on drop, used when
/// the caller gave none.
fn kept_output_dir(requested: Option<&Path>) -> Option<PathBuf> {
    if requested.is_some() {
        return None;
    }
    let dir = scratch_dir()?.keep();
    engine_debug!("artifacts will be written to {}", dir.display());
    Some(dir)
}

fn scratch_dir() -> Option<TempDir> {
    match tempfile::Builder::new().prefix("pagestream_").tempdir() {
        Ok(dir) => Some(dir),
        Err(err) => {
            engine_warn!("no scratch directory, engine will use its default: {}", err);
            None
        }
    }
}
