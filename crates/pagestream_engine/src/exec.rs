use std::io;
use std::process::Stdio;
use std::sync::Arc;

use engine_logging::{engine_debug, engine_trace};
use pagestream_core::{BuildError, Invocation, VERSION_FLAG};
use thiserror::Error;
use tokio::process::Command;

use crate::locate::{EngineBinary, EngineLocator, InvocationError};

/// Captured output of one engine run that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// Systemic: nothing else in the batch can run either.
    #[error(transparent)]
    Unavailable(#[from] InvocationError),
    #[error("engine exited with {}: {stderr}", exit_label(.code))]
    Exit { code: Option<i32>, stderr: String },
    #[error("engine io error: {0}")]
    Io(String),
    #[error("refusing malformed invocation: {0}")]
    Grammar(#[from] BuildError),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// Runs one invocation of the engine to completion.
///
/// Implementations must be cancel-safe: dropping the returned future has to
/// stop the underlying work, which is how the dispatcher enforces timeouts.
#[async_trait::async_trait]
pub trait EngineExecutor: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> Result<RawOutput, ExecError>;
}

/// Spawns the real engine binary with `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    binary: Arc<EngineBinary>,
}

impl ProcessExecutor {
    pub fn new(binary: EngineBinary) -> Self {
        Self {
            binary: Arc::new(binary),
        }
    }

    pub fn locate(locator: &EngineLocator) -> Result<Self, InvocationError> {
        locator.resolve().map(Self::new)
    }

    pub fn binary(&self) -> &EngineBinary {
        &self.binary
    }

    /// Asks the engine for its version string (`-version`).
    pub async fn version(&self) -> Result<String, ExecError> {
        let output = self.run(&[VERSION_FLAG.to_string()]).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn run(&self, args: &[String]) -> Result<RawOutput, ExecError> {
        let path = self.binary.path();
        engine_trace!("spawning {} {:?}", path.display(), args);

        let child = Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| spawn_error(path, err))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| ExecError::Io(err.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(RawOutput { stdout, stderr })
        } else {
            engine_debug!("engine exited with {:?}", output.status.code());
            Err(ExecError::Exit {
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

fn spawn_error(path: &std::path::Path, err: io::Error) -> ExecError {
    let path = path.to_path_buf();
    match err.kind() {
        io::ErrorKind::NotFound => InvocationError::NotFound {
            searched: vec![path],
        }
        .into(),
        io::ErrorKind::PermissionDenied => InvocationError::NotExecutable(path).into(),
        _ => InvocationError::Spawn {
            path,
            reason: err.to_string(),
        }
        .into(),
    }
}

#[async_trait::async_trait]
impl EngineExecutor for ProcessExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<RawOutput, ExecError> {
        let args = invocation.args();
        Invocation::check_order(&args)?;
        self.run(&args).await
    }
}
