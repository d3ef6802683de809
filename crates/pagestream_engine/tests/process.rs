#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pagestream_core::{CrawlRequest, EngineOptions, ExecutionMode, FailureKind};
use pagestream_engine::{
    DispatchSettings, EngineBinary, EngineExecutor, EngineLocator, ExecError, InvocationError,
    Platform, ProcessDispatcher, ProcessExecutor, ResultParser,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

/// Writes an executable shell script standing in for the engine.
fn fake_engine(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Echoes its arguments into `args.txt` and prints one success record for
/// the last argument.
const ECHO_ENGINE: &str = r#"
if [ "$1" = "-version" ]; then echo "engine v1.2.3"; exit 0; fi
printf '%s\n' "$@" > "$(dirname "$0")/args.txt"
for last; do :; done
echo "Fetching $last"
printf '{"%s": {"success": true, "html_content": "<p>ok</p>"}}\n' "$last"
"#;

fn request(urls: &[&str], timeout: Option<Duration>) -> CrawlRequest {
    CrawlRequest {
        urls: urls.iter().map(|s| s.to_string()).collect(),
        output_dir: None,
        mode: ExecutionMode::Sequential,
        timeout,
        engine: EngineOptions::default(),
    }
}

fn executor(dir: &TempDir, body: &str) -> ProcessExecutor {
    let path = fake_engine(dir.path(), "pagestream-engine", body);
    ProcessExecutor::new(EngineBinary::at(path).unwrap())
}

#[tokio::test]
async fn real_process_receives_well_ordered_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(executor(&dir, ECHO_ENGINE));
    let dispatcher = ProcessDispatcher::new(executor, DispatchSettings::default());
    let mut request = request(&["https://example.com"], None);
    request.output_dir = Some(dir.path().join("out"));

    let outcomes = dispatcher.run(&request).await.unwrap();
    let result = ResultParser::collect(&outcomes, &request);

    assert!(result.get("https://example.com").unwrap().is_success());
    let args = fs::read_to_string(dir.path().join("args.txt")).unwrap();
    let expected = format!(
        "-outdir\n{}\n-crawl\nhttps://example.com\n",
        dir.path().join("out").display()
    );
    assert_eq!(args, expected);
}

#[tokio::test]
async fn version_query_reads_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let version = executor(&dir, ECHO_ENGINE).version().await.unwrap();
    assert_eq!(version, "engine v1.2.3");
}

#[tokio::test]
async fn non_zero_exit_carries_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(executor(&dir, "echo 'chrome not found' >&2\nexit 3"));
    let dispatcher = ProcessDispatcher::new(executor, DispatchSettings::default());
    let request = request(&["https://example.com"], None);

    let outcomes = dispatcher.run(&request).await.unwrap();
    let result = ResultParser::collect(&outcomes, &request);

    let outcome = result.get("https://example.com").unwrap();
    assert_eq!(outcome.failure_kind(), Some(FailureKind::ProcessExit));
    assert!(outcome.error().unwrap().contains("chrome not found"));
}

#[tokio::test]
async fn hung_engine_is_killed_at_the_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(executor(&dir, "exec sleep 30"));
    let dispatcher = ProcessDispatcher::new(executor, DispatchSettings::default());
    let request = request(&["https://slow.example.com"], Some(Duration::from_secs(1)));

    let started = Instant::now();
    let outcomes = dispatcher.run(&request).await.unwrap();
    let result = ResultParser::collect(&outcomes, &request);

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(
        result.get("https://slow.example.com").unwrap().failure_kind(),
        Some(FailureKind::Timeout)
    );
}

#[tokio::test]
async fn non_executable_file_is_a_systemic_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pagestream-engine");
    fs::write(&path, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

    assert_eq!(
        EngineBinary::at(&path).unwrap_err(),
        InvocationError::NotExecutable(path)
    );
}

#[tokio::test]
async fn deleted_binary_surfaces_as_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(&dir, ECHO_ENGINE);
    fs::remove_file(executor.binary().path()).unwrap();

    let invocation = pagestream_core::CommandBuilder::new()
        .url("https://example.com")
        .build(pagestream_core::Action::Crawl)
        .unwrap();
    let err = executor.execute(&invocation).await.unwrap_err();
    assert!(matches!(err, ExecError::Unavailable(InvocationError::NotFound { .. })));
}

#[test]
fn locator_prefers_bundle_then_path() {
    let bundle = tempfile::tempdir().unwrap();
    let on_path = tempfile::tempdir().unwrap();
    let platform = Platform::current().unwrap();

    let path_binary = fake_engine(on_path.path(), &platform.binary_name(), "exit 0");
    let found = EngineLocator::new()
        .with_bundle_dir(bundle.path())
        .with_search_path(on_path.path().as_os_str())
        .resolve()
        .unwrap();
    assert_eq!(found.path(), path_binary);

    let bundled = platform.bundled_path(bundle.path());
    fs::create_dir_all(bundled.parent().unwrap()).unwrap();
    fs::write(&bundled, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&bundled, fs::Permissions::from_mode(0o755)).unwrap();
    let found = EngineLocator::new()
        .with_bundle_dir(bundle.path())
        .with_search_path(on_path.path().as_os_str())
        .resolve()
        .unwrap();
    assert_eq!(found.path(), bundled);

    let err = EngineLocator::new()
        .with_search_path(bundle.path().as_os_str())
        .resolve()
        .unwrap_err();
    assert!(matches!(err, InvocationError::NotFound { .. }));
}
