//! Tool process spawning and single-slot execution
//!
//! A [`Worker`] runs at most one tool process at a time. Each execution
//! spawns a fresh process, streams the document through stdin, collects
//! stdout/stderr and parses the result. When the execution finishes, for
//! any reason, the worker goes idle and tells its observer.

use crate::worker::command::Invocation;
use crate::worker::schema::{Request, Response, WorkerError};
use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

/// Receives a notification whenever a worker becomes idle
pub trait AvailabilityObserver: Send + Sync {
    fn worker_available(self: Arc<Self>, worker: usize);
}

#[derive(Debug, Default)]
struct WorkerState {
    /// Set while an execution holds the worker
    busy: bool,
    /// Incremented on every execution
    execution: u64,
    /// Tool process of the current execution
    pid: Option<u32>,
    /// Cancellation token of the current execution
    cancel: Option<CancellationToken>,
}

/// A reusable slot that runs one tool process at a time
pub struct Worker {
    /// Position of the worker within its pool
    id: usize,
    /// Execution bookkeeping, never locked across an await
    state: Mutex<WorkerState>,
    /// Told when the worker goes idle
    observer: Option<Weak<dyn AvailabilityObserver>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl Worker {
    /// Create a worker nobody is notified about
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: Mutex::new(WorkerState::default()),
            observer: None,
        }
    }

    /// Create a worker that reports availability to `observer`
    pub fn with_observer(id: usize, observer: Weak<dyn AvailabilityObserver>) -> Self {
        Self {
            observer: Some(observer),
            ..Self::new(id)
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    /// Process ID of the running tool, if any
    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    /// Whether the current execution has been asked to stop
    pub fn is_cancelling(&self) -> bool {
        is_cancelled(self.lock().cancel.as_ref())
    }

    /// Run `request` through the tool
    ///
    /// Fails with [`WorkerError::Busy`] if the worker is already executing;
    /// callers going through the pool never hit this.
    pub async fn execute(
        &self,
        request: Request,
        cancel: Option<CancellationToken>,
    ) -> Result<Response, WorkerError> {
        let guard = self.begin(cancel.as_ref())?;
        self.run(guard, request, cancel).await
    }

    /// Mark the worker busy for a new execution
    pub(crate) fn begin(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExecutionGuard<'_>, WorkerError> {
        let mut state = self.lock();
        if state.busy {
            error!(worker = self.id, "execute called on a busy worker");
            return Err(WorkerError::Busy { worker: self.id });
        }

        state.busy = true;
        state.execution += 1;
        state.cancel = cancel.cloned();

        Ok(ExecutionGuard {
            worker: self,
            execution: state.execution,
        })
    }

    pub(crate) async fn run(
        &self,
        guard: ExecutionGuard<'_>,
        request: Request,
        cancel: Option<CancellationToken>,
    ) -> Result<Response, WorkerError> {
        let kind = request.kind();

        if request.should_skip() {
            debug!(worker = self.id, kind = %kind, "Nothing to run, skipping tool");
            return Ok(Response::empty(kind));
        }

        if is_cancelled(cancel.as_ref()) {
            debug!(worker = self.id, kind = %kind, "Cancelled before spawn");
            return Err(WorkerError::Cancelled);
        }

        let span = tracing::info_span!("worker_execution", worker = self.id, kind = %kind);
        self.spawn_and_collect(&guard, request, cancel)
            .instrument(span)
            .await
    }

    async fn spawn_and_collect(
        &self,
        guard: &ExecutionGuard<'_>,
        request: Request,
        cancel: Option<CancellationToken>,
    ) -> Result<Response, WorkerError> {
        let start = Instant::now();
        let kind = request.kind();
        let invocation = Invocation::from_request(&request)?;
        let Request {
            content, file_path, ..
        } = request;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &invocation.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(&invocation.program, e))?;
        guard.attach_process(child.id());
        debug!(pid = ?child.id(), program = %invocation.program, "Spawned tool process");

        let stdin = child.stdin.take().ok_or_else(|| WorkerError::Io {
            reason: "stdin is not available".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::Io {
            reason: "stdout is not available".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| WorkerError::Io {
            reason: "stderr is not available".to_string(),
        })?;

        // Processes forked by the tool may keep the pipes open after the kill,
        // so stream I/O stops as soon as cancellation is requested
        let (status, written, stdout, stderr) = tokio::join!(
            wait_or_kill(&mut child, cancel.as_ref()),
            unless_cancelled(
                write_input(stdin, invocation.input_header, content),
                cancel.as_ref()
            ),
            unless_cancelled(read_stream(stdout), cancel.as_ref()),
            unless_cancelled(read_stream(stderr), cancel.as_ref()),
        );

        let (written, stdout, stderr) = match (written, stdout, stderr) {
            (Some(written), Some(stdout), Some(stderr)) if !is_cancelled(cancel.as_ref()) => {
                (written, stdout, stderr)
            }
            _ => {
                debug!(
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Tool execution cancelled"
                );
                return Err(WorkerError::Cancelled);
            }
        };

        let status = status.map_err(|e| WorkerError::Io {
            reason: format!("Failed to wait for tool process: {}", e),
        })?;

        match written {
            Err(e) if e.kind() != io::ErrorKind::BrokenPipe => {
                return Err(WorkerError::Io {
                    reason: format!("Failed to write to stdin: {}", e),
                });
            }
            Err(_) => debug!("Tool closed stdin before reading the whole document"),
            Ok(()) => {}
        }

        let stdout = into_text(stdout, "stdout")?;
        let stderr = into_text(stderr, "stderr")?;

        if !status.success() {
            warn!(
                exit_code = ?status.code(),
                duration_ms = start.elapsed().as_millis() as u64,
                stderr = %stderr.trim(),
                "Tool exited with an error"
            );
            return Err(WorkerError::ToolFailed {
                code: status.code(),
                stdout,
                stderr,
            });
        }

        debug!(
            duration_ms = start.elapsed().as_millis() as u64,
            output_size_bytes = stdout.len(),
            "Tool execution succeeded"
        );

        Response::parse(kind, file_path.as_deref(), &stdout)
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps a worker busy for one execution
///
/// Dropping the guard returns the worker to idle and notifies the observer,
/// exactly once per execution.
pub(crate) struct ExecutionGuard<'a> {
    worker: &'a Worker,
    /// Execution this guard belongs to
    execution: u64,
}

impl ExecutionGuard<'_> {
    fn attach_process(&self, pid: Option<u32>) {
        let mut state = self.worker.lock();
        if state.execution == self.execution {
            state.pid = pid;
        }
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.worker.lock();
            if state.execution != self.execution {
                return;
            }
            state.cancel = None;
            state.pid = None;
            state.busy = false;
        }

        debug!(worker = self.worker.id, "Worker is idle");
        if let Some(observer) = self.worker.observer.as_ref().and_then(Weak::upgrade) {
            observer.worker_available(self.worker.id);
        }
    }
}

fn is_cancelled(cancel: Option<&CancellationToken>) -> bool {
    cancel.is_some_and(CancellationToken::is_cancelled)
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn spawn_error(program: &str, err: io::Error) -> WorkerError {
    if err.kind() == io::ErrorKind::NotFound {
        WorkerError::ExecutableNotFound {
            program: program.to_string(),
        }
    } else {
        WorkerError::SpawnFailed {
            program: program.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Drive `future` until it completes or cancellation is requested
async fn unless_cancelled<F: Future>(
    future: F,
    cancel: Option<&CancellationToken>,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => None,
        output = future => Some(output),
    }
}

/// Wait for the process to exit, killing it once cancellation is requested
async fn wait_or_kill(
    child: &mut Child,
    cancel: Option<&CancellationToken>,
) -> io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        _ = cancelled(cancel) => {
            debug!(pid = ?child.id(), "Killing tool process");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Write the optional header and the document, then close stdin
async fn write_input(
    mut stdin: ChildStdin,
    header: Option<String>,
    content: String,
) -> io::Result<()> {
    if let Some(header) = header {
        stdin.write_all(header.as_bytes()).await?;
    }
    stdin.write_all(content.as_bytes()).await?;
    drop(content);
    stdin.shutdown().await
}

/// Read a stream to its end
async fn read_stream<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<BytesMut> {
    let mut buffer = BytesMut::with_capacity(8192);
    while reader.read_buf(&mut buffer).await? != 0 {}
    Ok(buffer)
}

fn into_text(output: io::Result<BytesMut>, stream: &str) -> Result<String, WorkerError> {
    let output = output.map_err(|e| WorkerError::Io {
        reason: format!("Failed to read from {}: {}", stream, e),
    })?;
    Ok(String::from_utf8_lossy(&output).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::worker::schema::{Severity, Standard, ToolOptions};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct CountingObserver(AtomicUsize);

    impl AvailabilityObserver for CountingObserver {
        fn worker_available(self: Arc<Self>, _worker: usize) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn observed_worker() -> (Worker, Arc<CountingObserver>) {
        let observer = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let weak: Weak<dyn AvailabilityObserver> = Arc::downgrade(&observer) as _;
        (Worker::with_observer(0, weak), observer)
    }

    /// Create a fake tool script run through `sh`
    fn fake_tool(body: &str) -> NamedTempFile {
        let mut script = NamedTempFile::new().expect("Failed to create temp file");
        script
            .write_all(body.as_bytes())
            .expect("Failed to write tool script");
        script
    }

    fn options(script: &NamedTempFile, standard: Standard) -> ToolOptions {
        ToolOptions {
            executable: format!("sh '{}'", script.path().display()),
            standard,
            report: "SniffPool".to_string(),
        }
    }

    #[tokio::test]
    async fn test_disabled_standard_skips_process() {
        let tool = fake_tool("echo should-not-run >&2; exit 3\n");
        let (worker, observer) = observed_worker();

        let request = Request::diagnostic("<?php echo 1;", options(&tool, Standard::Disabled));
        let response = worker.execute(request, None).await.unwrap();

        assert_eq!(response, Response::Diagnostic(None));
        assert!(!worker.is_busy());
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_document_skips_process() {
        let tool = fake_tool("exit 3\n");
        let (worker, observer) = observed_worker();

        let request = Request::format("", options(&tool, Standard::Default), None, None);
        let response = worker.execute(request, None).await.unwrap();

        assert_eq!(response, Response::Format(None));
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_diagnostics_from_tool() {
        let tool = fake_tool(
            r#"cat > /dev/null
echo "Some banner text"
printf '%s' '{"files":[{"filename":"a.php","diagnostics":[{"code":"X.Y","message":"bad","range":{"start":{"line":0,"character":0},"end":{"line":0,"character":3}},"severity":0}],"codeActions":[{"title":"Fix","kind":"quickfix","diagnostic":0}]}]}'
"#,
        );
        let (worker, observer) = observed_worker();

        let request = Request::diagnostic("<?php\n", options(&tool, Standard::Default));
        let response = worker.execute(request, None).await.unwrap();

        let Response::Diagnostic(Some(report)) = response else {
            panic!("expected diagnostics");
        };
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].severity, Severity::Error);
        assert_eq!(report.code_actions[0].diagnostic, 0);
        assert!(!worker.is_busy());
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stdin_and_environment_contract() {
        // Echo back what the tool received as a format result
        let tool = fake_tool(
            r#"input=$(cat)
case "$TOOL_INPUT" in
  *'"type":"Format"'*) ;;
  *) echo "bad envelope: $TOOL_INPUT" >&2; exit 2 ;;
esac
printf '{"files":[{"content":"%s"}]}' "$(printf '%s' "$input" | head -n 1)"
"#,
        );
        let (worker, _observer) = observed_worker();

        let request = Request::format("<?php\n", options(&tool, Standard::Default), None, None)
            .with_file_path("/src/a.php");
        let response = worker.execute(request, None).await.unwrap();

        let Response::Format(Some(report)) = response else {
            panic!("expected format output");
        };
        assert_eq!(report.content, "input_file: /src/a.php");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_tool_error() {
        let tool = fake_tool("cat > /dev/null\necho partial\necho 'Unknown standard' >&2\nexit 16\n");
        let (worker, observer) = observed_worker();

        let request = Request::diagnostic("<?php\n", options(&tool, Standard::Default));
        let err = worker.execute(request, None).await.unwrap_err();

        match err {
            WorkerError::ToolFailed {
                code,
                stdout,
                stderr,
            } => {
                assert_eq!(code, Some(16));
                assert_eq!(stdout.trim(), "partial");
                assert_eq!(stderr.trim(), "Unknown standard");
            }
            other => panic!("expected tool failure, got {other:?}"),
        }
        assert!(!worker.is_busy());
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let (worker, observer) = observed_worker();
        let options = ToolOptions {
            executable: "/definitely/not/a/real/phpcs".to_string(),
            standard: Standard::Default,
            report: "SniffPool".to_string(),
        };

        let err = worker
            .execute(Request::diagnostic("<?php\n", options), None)
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::ExecutableNotFound { .. }));
        assert!(!worker.is_busy());
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let tool = fake_tool("cat > /dev/null\nexec sleep 30\n");
        let (worker, observer) = observed_worker();
        let worker = Arc::new(worker);
        let cancel = CancellationToken::new();

        let request = Request::diagnostic("<?php\n", options(&tool, Standard::Default));
        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();
            async move { worker.execute(request, Some(cancel)).await }
        });

        // Give the process time to start
        for _ in 0..100 {
            if worker.pid().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(worker.is_busy());
        assert!(worker.pid().is_some());
        assert!(!worker.is_cancelling());

        cancel.cancel();
        assert!(worker.is_cancelling() || !worker.is_busy());
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("cancelled execution should finish promptly")
            .unwrap();

        assert!(result.unwrap_err().is_cancellation());
        assert!(!worker.is_busy());
        assert!(worker.pid().is_none());
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_on_busy_worker_fails() {
        let worker = Worker::new(3);
        let guard = worker.begin(None).unwrap();

        let tool = fake_tool("exit 0\n");
        let request = Request::diagnostic("<?php\n", options(&tool, Standard::Default));
        let err = worker.execute(request, None).await.unwrap_err();
        assert!(matches!(err, WorkerError::Busy { worker: 3 }));

        drop(guard);
        assert!(!worker.is_busy());
    }
}
