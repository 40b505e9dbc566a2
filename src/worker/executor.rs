use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::scheduler::{shell_quote, ReplicaId};
use crate::worker::retry::RetryPolicy;
use crate::worker::session::{CommandOutput, ResilientSession, SessionConnector, SessionTarget};

/// Everything one remote run needs, resolved against the node it landed on.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub replica: ReplicaId,
    pub cycle: u64,
    pub target: SessionTarget,
    /// Architecture tag selecting `lib/<arch>` and `bin/<arch>`
    pub arch: String,
    /// Command after placement rewriting
    pub command: String,
    pub remote_dir: Option<String>,
    pub working_directory: PathBuf,
    pub input_files: Vec<String>,
    pub output_files: Vec<String>,
    pub exec_directory: Option<PathBuf>,
}

/// What the coordinator got back from a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// The bounded wait ran out before both channels delivered
    pub timed_out: bool,
}

impl JobOutput {
    pub fn is_complete(&self) -> bool {
        self.stdout.is_some() && self.stderr.is_some()
    }
}

/// Coordinator's side of one in-flight run: a liveness handle plus the two
/// one-shot result channels.
#[derive(Debug)]
pub struct ExecutionHandle {
    task: JoinHandle<()>,
    stdout: oneshot::Receiver<String>,
    stderr: oneshot::Receiver<String>,
}

impl ExecutionHandle {
    /// Non-destructive liveness check.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Collect stdout and stderr, waiting at most `timeout` in total.
    ///
    /// A worker that failed never sends; its channels close and come back as
    /// `None` without consuming the timeout.
    pub async fn drain(self, timeout: Duration) -> JobOutput {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut output = JobOutput::default();

        match tokio::time::timeout_at(deadline, self.stdout).await {
            Ok(Ok(stdout)) => output.stdout = Some(stdout),
            Ok(Err(_)) => {}
            Err(_) => output.timed_out = true,
        }
        match tokio::time::timeout_at(deadline, self.stderr).await {
            Ok(Ok(stderr)) => output.stderr = Some(stderr),
            Ok(Err(_)) => {}
            Err(_) => output.timed_out = true,
        }
        output
    }
}

/// Runs jobs end to end on remote nodes, one tokio task per job.
#[derive(Clone)]
pub struct RemoteExecutor {
    connector: Arc<dyn SessionConnector>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RemoteExecutor {
    pub fn new(connector: Arc<dyn SessionConnector>, retry: RetryPolicy) -> Self {
        Self { connector, retry }
    }

    /// Start `request` out-of-band. Returns immediately.
    pub fn spawn(&self, request: ExecutionRequest) -> ExecutionHandle {
        let (stdout_tx, stdout_rx) = oneshot::channel();
        let (stderr_tx, stderr_rx) = oneshot::channel();
        let executor = self.clone();

        let task = tokio::spawn(async move {
            match executor.run(&request).await {
                Ok(output) => {
                    let _ = stdout_tx.send(output.stdout);
                    let _ = stderr_tx.send(output.stderr);
                }
                Err(e) => {
                    tracing::error!(
                        replica = request.replica,
                        cycle = request.cycle,
                        host = %request.target.host,
                        error = %e,
                        "Remote execution failed"
                    );
                }
            }
        });

        ExecutionHandle {
            task,
            stdout: stdout_rx,
            stderr: stderr_rx,
        }
    }

    /// Connect, stage, run, fetch, clean up.
    ///
    /// The remote exit status is recorded but never turned into an error.
    pub async fn run(&self, request: &ExecutionRequest) -> Result<CommandOutput> {
        let session =
            ResilientSession::connect(Arc::clone(&self.connector), request.target.clone()).await?;
        tracing::info!(replica = request.replica, host = %request.target.host, "Session established");

        let result = self.run_in_session(&session, request).await;
        session.close().await;
        result
    }

    async fn run_in_session(
        &self,
        session: &ResilientSession,
        request: &ExecutionRequest,
    ) -> Result<CommandOutput> {
        if let Some(ref dir) = request.remote_dir {
            session.exec(&format!("mkdir -p {}", shell_quote(dir))).await?;

            for local in self.staged_files(request).await? {
                let remote = remote_path(dir, &local);
                let (local, remote) = (&local, &remote);
                self.retry
                    .run(&format!("put {}", local.display()), move || {
                        session.put(local, remote)
                    })
                    .await?;
            }

            session.exec(&format!("chmod -R 777 {}", shell_quote(dir)))
                .await?;
        }

        tracing::info!(replica = request.replica, cycle = request.cycle, command = %request.command, "Running job");
        let output = session.exec(&request.command).await?;
        tracing::debug!(replica = request.replica, exit_code = ?output.exit_code, "Remote command returned");

        if let Some(ref dir) = request.remote_dir {
            for name in &request.output_files {
                let local = request.working_directory.join(name);
                let remote = format!("{}/{}", dir, name);
                let (local, remote) = (&local, &remote);
                self.retry
                    .run(&format!("get {}", remote), move || session.get(remote, local))
                    .await?;
            }
            session.exec(&format!("rm -rf {}", shell_quote(dir))).await?;
        }

        Ok(output)
    }

    /// Executables and libraries for the node's architecture, then job inputs.
    async fn staged_files(&self, request: &ExecutionRequest) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if let Some(ref exec_dir) = request.exec_directory {
            files.extend(list_files(&exec_dir.join("lib").join(&request.arch)).await?);
            files.extend(list_files(&exec_dir.join("bin").join(&request.arch)).await?);
        }
        files.extend(
            request
                .input_files
                .iter()
                .map(|name| request.working_directory.join(name)),
        );
        Ok(files)
    }
}

fn remote_path(dir: &str, local: &Path) -> String {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    format!("{}/{}", dir, name)
}

/// Regular files directly under `dir`, sorted. A missing directory is empty.
async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "No executable directory for this architecture");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_uses_file_name() {
        assert_eq!(
            remote_path("/tmp/r3", Path::new("/home/re/work/r3/r3_c1.inp")),
            "/tmp/r3/r3_c1.inp"
        );
    }

    #[tokio::test]
    async fn list_files_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = list_files(&dir.path().join("lib").join("knl")).await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn list_files_sorted_and_skips_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.so"), "").unwrap();
        std::fs::write(dir.path().join("a.so"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let files = list_files(dir.path()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.so", "b.so"]);
    }

    #[tokio::test]
    async fn drain_of_failed_worker_returns_nothing() {
        let (stdout_tx, stdout_rx) = oneshot::channel::<String>();
        let (stderr_tx, stderr_rx) = oneshot::channel::<String>();
        drop(stdout_tx);
        drop(stderr_tx);
        let handle = ExecutionHandle {
            task: tokio::spawn(async {}),
            stdout: stdout_rx,
            stderr: stderr_rx,
        };

        let output = handle.drain(Duration::from_secs(30)).await;
        assert!(output.stdout.is_none());
        assert!(output.stderr.is_none());
        assert!(!output.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_on_silent_worker() {
        let (_stdout_tx, stdout_rx) = oneshot::channel::<String>();
        let (_stderr_tx, stderr_rx) = oneshot::channel::<String>();
        let handle = ExecutionHandle {
            task: tokio::spawn(async {}),
            stdout: stdout_rx,
            stderr: stderr_rx,
        };

        let output = handle.drain(Duration::from_secs(30)).await;
        assert!(output.timed_out);
        assert!(!output.is_complete());
    }
}
