use std::sync::Arc;
use std::time::Duration;

use engine_logging::{engine_info, engine_warn};
use futures_util::{stream, StreamExt, TryStreamExt};
use pagestream_core::{
    BuildError, CommandBuilder, ConcurrencyStrategy, CrawlRequest, ExecutionMode, FailureKind,
    Invocation, StreamRequest, UploadRequest,
};
use thiserror::Error;

use crate::exec::{EngineExecutor, ExecError, RawOutput};
use crate::locate::InvocationError;
use crate::settings::EngineSettings;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Applied when a request carries no timeout of its own.
    pub default_timeout: Duration,
    /// Upper bound on fan-out workers regardless of what a request asks for.
    pub max_workers: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            max_workers: 8,
        }
    }
}

impl From<&EngineSettings> for DispatchSettings {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            default_timeout: settings.default_timeout(),
            max_workers: settings.max_workers.max(1),
        }
    }
}

/// Why one invocation produced no usable output. Scoped to that
/// invocation's URLs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessFailure {
    #[error("engine did not finish within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("engine exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("engine io error: {0}")]
    Io(String),
    #[error("no valid invocation: {0}")]
    Build(BuildError),
}

impl ProcessFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProcessFailure::Timeout(_) => FailureKind::Timeout,
            ProcessFailure::Exit { .. } | ProcessFailure::Io(_) => FailureKind::ProcessExit,
            ProcessFailure::Build(_) => FailureKind::Build,
        }
    }
}

/// What one invocation returned, tagged with the URLs it covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOutcome {
    pub urls: Vec<String>,
    pub result: Result<RawOutput, ProcessFailure>,
}

type Planned = (Vec<String>, Result<Invocation, BuildError>);

pub struct ProcessDispatcher {
    executor: Arc<dyn EngineExecutor>,
    settings: DispatchSettings,
}

impl ProcessDispatcher {
    pub fn new(executor: Arc<dyn EngineExecutor>, settings: DispatchSettings) -> Self {
        Self { executor, settings }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Runs the engine's crawl action over every URL of `request`.
    pub async fn run(
        &self,
        request: &CrawlRequest,
    ) -> Result<Vec<InvocationOutcome>, InvocationError> {
        let plan = plan(&request.urls, request.mode, |urls, parallel| {
            CommandBuilder::for_crawl(request, urls, parallel)
        });
        self.execute_plan(plan, request.mode, request.timeout).await
    }

    /// Runs the engine's own publishing action over every URL of `request`.
    pub async fn run_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<Vec<InvocationOutcome>, InvocationError> {
        let crawl = &request.crawl;
        let plan = plan(&crawl.urls, crawl.mode, |urls, parallel| {
            CommandBuilder::for_stream(request, urls, parallel)
        });
        self.execute_plan(plan, crawl.mode, crawl.timeout).await
    }

    /// Runs the engine's object-store upload action over every URL of `request`.
    pub async fn run_upload(
        &self,
        request: &UploadRequest,
    ) -> Result<Vec<InvocationOutcome>, InvocationError> {
        let crawl = &request.crawl;
        let plan = plan(&crawl.urls, crawl.mode, |urls, parallel| {
            CommandBuilder::for_upload(request, urls, parallel)
        });
        self.execute_plan(plan, crawl.mode, crawl.timeout).await
    }

    async fn execute_plan(
        &self,
        plan: Vec<Planned>,
        mode: ExecutionMode,
        timeout: Option<Duration>,
    ) -> Result<Vec<InvocationOutcome>, InvocationError> {
        let timeout = timeout.unwrap_or(self.settings.default_timeout);
        engine_info!(
            "dispatching {} invocation(s) in {:?} mode, timeout {}s",
            plan.len(),
            mode,
            timeout.as_secs()
        );

        match mode {
            ExecutionMode::Concurrent(ConcurrencyStrategy::FanOut { workers }) => {
                let workers = workers.clamp(1, self.settings.max_workers.max(1));
                // try_collect stops at the first systemic error and drops
                // the in-flight invocations, which kills their processes.
                stream::iter(plan)
                    .map(|planned| self.execute_one(planned, timeout))
                    .buffer_unordered(workers)
                    .try_collect()
                    .await
            }
            ExecutionMode::Sequential | ExecutionMode::Concurrent(ConcurrencyStrategy::Delegated) => {
                let mut outcomes = Vec::with_capacity(plan.len());
                for planned in plan {
                    outcomes.push(self.execute_one(planned, timeout).await?);
                }
                Ok(outcomes)
            }
        }
    }

    async fn execute_one(
        &self,
        (urls, invocation): Planned,
        timeout: Duration,
    ) -> Result<InvocationOutcome, InvocationError> {
        let invocation = match invocation {
            Ok(invocation) => invocation,
            Err(err) => {
                engine_warn!("cannot build invocation for {:?}: {}", urls, err);
                return Ok(InvocationOutcome {
                    urls,
                    result: Err(ProcessFailure::Build(err)),
                });
            }
        };

        let result = match tokio::time::timeout(timeout, self.executor.execute(&invocation)).await {
            Err(_) => {
                engine_warn!("engine timed out after {}s for {:?}", timeout.as_secs(), urls);
                Err(ProcessFailure::Timeout(timeout))
            }
            Ok(Ok(output)) => Ok(output),
            Ok(Err(ExecError::Unavailable(err))) => return Err(err),
            Ok(Err(ExecError::Exit { code, stderr })) => {
                engine_warn!("engine exited with {:?} for {:?}", code, urls);
                Err(ProcessFailure::Exit { code, stderr })
            }
            Ok(Err(ExecError::Io(message))) => Err(ProcessFailure::Io(message)),
            Ok(Err(ExecError::Grammar(err))) => Err(ProcessFailure::Build(err)),
        };
        Ok(InvocationOutcome { urls, result })
    }
}

/// One invocation per URL, except delegated concurrency which hands every
/// URL to a single `-parallel` invocation.
fn plan<F>(urls: &[String], mode: ExecutionMode, build: F) -> Vec<Planned>
where
    F: Fn(&[String], bool) -> Result<Invocation, BuildError>,
{
    match mode {
        ExecutionMode::Concurrent(ConcurrencyStrategy::Delegated) => {
            vec![(urls.to_vec(), build(urls, true))]
        }
        ExecutionMode::Sequential | ExecutionMode::Concurrent(ConcurrencyStrategy::FanOut { .. }) => {
            urls.iter()
                .map(|url| {
                    let single = std::slice::from_ref(url);
                    (single.to_vec(), build(single, false))
                })
                .collect()
        }
    }
}
