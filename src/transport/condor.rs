//! HTCondor backend.
//!
//! Jobs are submitted as soon as they are launched; the schedd does all
//! placement. The transport only remembers which batch job belongs to which
//! replica and learns about completion by polling `condor_q`: a job that has
//! left the queue is done.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Result, TransportError};
use crate::scheduler::{JobSpec, ReplicaId};
use crate::transport::Transport;

/// `cluster.process` as printed by `condor_q`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchJobId {
    pub cluster: u64,
    pub process: u64,
}

impl fmt::Display for BatchJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cluster, self.process)
    }
}

impl FromStr for BatchJobId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (cluster, process) = s
            .split_once('.')
            .ok_or_else(|| TransportError::JobIdParse(s.to_string()))?;
        Ok(Self {
            cluster: cluster
                .parse()
                .map_err(|_| TransportError::JobIdParse(s.to_string()))?,
            process: process
                .parse()
                .map_err(|_| TransportError::JobIdParse(s.to_string()))?,
        })
    }
}

/// Pull the cluster out of `condor_submit`'s "N job(s) submitted to cluster C."
pub fn parse_submit_output(output: &str) -> Result<BatchJobId> {
    let cluster = output
        .lines()
        .find_map(|line| {
            let (_, rest) = line.split_once("submitted to cluster")?;
            rest.trim().trim_end_matches('.').parse::<u64>().ok()
        })
        .ok_or_else(|| TransportError::JobIdParse(output.trim().to_string()))?;
    Ok(BatchJobId {
        cluster,
        process: 0,
    })
}

/// One `cluster.proc` per line; unparsable lines are skipped.
pub fn parse_queue_listing(output: &str) -> HashSet<BatchJobId> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(line, "Skipping unrecognised condor_q line");
                None
            }
        })
        .collect()
}

/// Command runner for the batch system.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Submit `submit_file` from `working_dir`; returns the submitter's stdout.
    async fn submit(&self, working_dir: &Path, submit_file: &Path) -> Result<String>;

    /// Jobs of `user` still in the queue, one `cluster.proc` per line.
    async fn queue_listing(&self, user: &str) -> Result<String>;
}

/// The real `condor_submit` / `condor_q` binaries.
#[derive(Debug, Clone, Default)]
pub struct CondorCli;

async fn run_tool(mut command: Command, tool: &str) -> Result<String> {
    let output = command
        .output()
        .await
        .map_err(|e| TransportError::Batch(format!("{}: {}", tool, e)))?;
    if !output.status.success() {
        return Err(TransportError::Batch(format!(
            "{} exited with {}: {}",
            tool,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[async_trait]
impl BatchScheduler for CondorCli {
    async fn submit(&self, working_dir: &Path, submit_file: &Path) -> Result<String> {
        let mut command = Command::new("condor_submit");
        command.arg(submit_file).current_dir(working_dir);
        run_tool(command, "condor_submit").await
    }

    async fn queue_listing(&self, user: &str) -> Result<String> {
        let mut command = Command::new("condor_q");
        command.args([
            "-submitter",
            user,
            "-format",
            "%d.",
            "ClusterId",
            "-format",
            "%d\n",
            "ProcId",
        ]);
        run_tool(command, "condor_q").await
    }
}

pub struct CondorTransport {
    jobname: String,
    user: String,
    state_dir: PathBuf,
    replica_jobs: Vec<Option<BatchJobId>>,
    /// Tracked identifiers and whether they have left the queue
    done: HashMap<BatchJobId, bool>,
    scheduler: Arc<dyn BatchScheduler>,
}

impl fmt::Debug for CondorTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondorTransport")
            .field("jobname", &self.jobname)
            .field("user", &self.user)
            .field("replica_jobs", &self.replica_jobs)
            .finish_non_exhaustive()
    }
}

impl CondorTransport {
    pub fn new(
        jobname: impl Into<String>,
        nreplicas: usize,
        state_dir: impl Into<PathBuf>,
        scheduler: Arc<dyn BatchScheduler>,
    ) -> Self {
        Self {
            jobname: jobname.into(),
            user: std::env::var("USER").unwrap_or_default(),
            state_dir: state_dir.into(),
            replica_jobs: vec![None; nreplicas],
            done: HashMap::new(),
            scheduler,
        }
    }

    /// Submitter name passed to `condor_q`. Defaults to `$USER`.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn job_id(&self, replica: ReplicaId) -> Option<BatchJobId> {
        self.replica_jobs.get(replica).copied().flatten()
    }

    /// Tracked jobs that have not yet left the queue.
    pub fn outstanding(&self) -> usize {
        self.done.values().filter(|done| !**done).count()
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir
            .join(format!("{}_condor_stat.json", self.jobname))
    }

    pub fn submit_description(&self, replica: ReplicaId, spec: &JobSpec) -> String {
        let stem = format!("{}_r{}", self.jobname, replica);
        format!(
            "Universe                = vanilla\n\
             Executable              = {}\n\
             Arguments               = {}\n\
             should_transfer_files   = YES\n\
             when_to_transfer_output = ON_EXIT\n\
             transfer_input_files    = {}\n\
             Log                     = {}.log\n\
             Error                   = {}.error\n\
             Queue\n",
            spec.executable,
            spec.input_file,
            spec.job_input_files.join(", "),
            stem,
            stem
        )
    }

    /// Refresh completion flags from the batch queue.
    pub async fn poll(&mut self) -> Result<()> {
        if self.done.is_empty() {
            tracing::debug!("No batch jobs tracked, skipping poll");
            return Ok(());
        }
        let listing = self.scheduler.queue_listing(&self.user).await?;
        let queued = parse_queue_listing(&listing);

        for (id, done) in self.done.iter_mut() {
            if !*done && !queued.contains(id) {
                tracing::info!(job = %id, "Batch job left the queue");
                *done = true;
            }
        }
        Ok(())
    }

    pub async fn save_state(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.replica_jobs)?;
        tokio::fs::write(self.state_file(), data).await?;
        Ok(())
    }

    /// Reload the replica table written by [`save_state`](Self::save_state).
    /// Returns false when there is no state file.
    pub async fn restore(&mut self) -> Result<bool> {
        let path = self.state_file();
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let table: Vec<Option<BatchJobId>> = serde_json::from_slice(&data)?;
        if table.len() != self.replica_jobs.len() {
            return Err(TransportError::InvalidConfig(format!(
                "{} holds {} replicas, expected {}",
                path.display(),
                table.len(),
                self.replica_jobs.len()
            )));
        }

        self.done = table.iter().flatten().map(|id| (*id, false)).collect();
        self.replica_jobs = table;
        tracing::info!(path = %path.display(), tracked = self.done.len(), "Restored batch job table");
        Ok(true)
    }
}

#[async_trait]
impl Transport for CondorTransport {
    async fn launch_job(&mut self, replica: ReplicaId, spec: JobSpec) -> Result<usize> {
        if replica >= self.replica_jobs.len() {
            return Err(TransportError::UnknownReplica(replica));
        }
        if self.replica_jobs[replica].is_some() && !self.is_done(replica, spec.cycle).await {
            tracing::warn!(replica, "Previous batch job still queued, tracking new job");
        }

        let submit_file = spec
            .working_directory
            .join(format!("{}_r{}.submit", self.jobname, replica));
        tokio::fs::write(&submit_file, self.submit_description(replica, &spec)).await?;

        let output = self
            .scheduler
            .submit(&spec.working_directory, &submit_file)
            .await?;
        let id = parse_submit_output(&output)?;

        if let Some(previous) = self.replica_jobs[replica].replace(id) {
            tracing::info!(replica, job = %previous, "No longer tracking batch job");
            self.done.remove(&previous);
        }
        self.done.insert(id, false);
        tracing::info!(replica, cycle = spec.cycle, job = %id, "Submitted batch job");

        if let Err(e) = self.save_state().await {
            tracing::warn!(error = %e, "Unable to save batch job table");
        }
        Ok(self.outstanding())
    }

    async fn is_done(&mut self, replica: ReplicaId, _cycle: u64) -> bool {
        match self.replica_jobs.get(replica) {
            None => {
                tracing::warn!(replica, "is_done: unknown replica id");
                true
            }
            Some(None) => true,
            Some(Some(id)) => self.done.get(id).copied().unwrap_or(true),
        }
    }

    async fn process_job_queue(
        &mut self,
        _min_interval: Duration,
        max_interval: Duration,
    ) -> usize {
        tokio::time::sleep(max_interval).await;
        if let Err(e) = self.poll().await {
            tracing::warn!(error = %e, "Batch queue poll failed");
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedCondor {
        next_cluster: Mutex<u64>,
        queued: Mutex<String>,
        submitted: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl BatchScheduler for ScriptedCondor {
        async fn submit(&self, _working_dir: &Path, submit_file: &Path) -> Result<String> {
            self.submitted.lock().unwrap().push(submit_file.to_path_buf());
            let mut next = self.next_cluster.lock().unwrap();
            *next += 1;
            Ok(format!(
                "Submitting job(s).\n1 job(s) submitted to cluster {}.\n",
                *next
            ))
        }

        async fn queue_listing(&self, _user: &str) -> Result<String> {
            Ok(self.queued.lock().unwrap().clone())
        }
    }

    fn spec(dir: &Path) -> JobSpec {
        JobSpec::new("impact", dir)
            .with_io("r0_c1.inp", "r0_c1.log", "r0_c1.err")
            .with_input_files(vec!["r0_c1.inp".into(), "r0.rst".into()])
            .with_cycle(1)
    }

    #[test]
    fn job_id_parses_and_displays() {
        let id: BatchJobId = "123.4".parse().unwrap();
        assert_eq!(id, BatchJobId { cluster: 123, process: 4 });
        assert_eq!(id.to_string(), "123.4");
        assert!("123".parse::<BatchJobId>().is_err());
        assert!("a.b".parse::<BatchJobId>().is_err());
    }

    #[test]
    fn submit_output_yields_cluster() {
        let out = "Submitting job(s).\n1 job(s) submitted to cluster 4711.\n";
        assert_eq!(
            parse_submit_output(out).unwrap(),
            BatchJobId { cluster: 4711, process: 0 }
        );
        assert!(matches!(
            parse_submit_output("ERROR: no such file"),
            Err(TransportError::JobIdParse(_))
        ));
    }

    #[test]
    fn queue_listing_skips_noise() {
        let ids = parse_queue_listing("10.0\n\n11.0\ngarbage\n");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&BatchJobId { cluster: 11, process: 0 }));
    }

    #[test]
    fn submit_description_lists_inputs() {
        let condor = CondorTransport::new("rex", 2, "/tmp", Arc::new(ScriptedCondor::default()));
        let text = condor.submit_description(1, &spec(Path::new("/work")));
        assert!(text.contains("Universe                = vanilla"));
        assert!(text.contains("Executable              = impact"));
        assert!(text.contains("Arguments               = r0_c1.inp"));
        assert!(text.contains("transfer_input_files    = r0_c1.inp, r0.rst"));
        assert!(text.contains("Log                     = rex_r1.log"));
        assert!(text.trim_end().ends_with("Queue"));
    }

    #[tokio::test]
    async fn launch_poll_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(ScriptedCondor::default());
        let mut condor = CondorTransport::new("rex", 2, dir.path(), scheduler.clone())
            .with_user("alice");

        assert!(condor.is_done(0, 1).await);
        assert_eq!(condor.launch_job(0, spec(dir.path())).await.unwrap(), 1);
        assert_eq!(condor.launch_job(1, spec(dir.path())).await.unwrap(), 2);
        assert!(!condor.is_done(0, 1).await);
        assert!(dir.path().join("rex_r0.submit").exists());
        assert_eq!(scheduler.submitted.lock().unwrap().len(), 2);

        *scheduler.queued.lock().unwrap() = "2.0\n".to_string();
        condor.poll().await.unwrap();

        assert!(condor.is_done(0, 1).await);
        assert!(!condor.is_done(1, 1).await);
        assert_eq!(condor.outstanding(), 1);
    }

    #[tokio::test]
    async fn relaunch_untracks_previous_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut condor =
            CondorTransport::new("rex", 1, dir.path(), Arc::new(ScriptedCondor::default()));

        condor.launch_job(0, spec(dir.path())).await.unwrap();
        condor.launch_job(0, spec(dir.path())).await.unwrap();

        assert_eq!(condor.job_id(0), Some(BatchJobId { cluster: 2, process: 0 }));
        assert_eq!(condor.outstanding(), 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut condor =
            CondorTransport::new("rex", 2, dir.path(), Arc::new(ScriptedCondor::default()));
        condor.launch_job(1, spec(dir.path())).await.unwrap();

        let mut restarted =
            CondorTransport::new("rex", 2, dir.path(), Arc::new(ScriptedCondor::default()));
        assert!(restarted.restore().await.unwrap());
        assert_eq!(restarted.job_id(0), None);
        assert_eq!(restarted.job_id(1), Some(BatchJobId { cluster: 1, process: 0 }));
        assert!(!restarted.is_done(1, 1).await);
    }

    #[tokio::test]
    async fn restore_without_state_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let mut condor =
            CondorTransport::new("rex", 2, dir.path(), Arc::new(ScriptedCondor::default()));
        assert!(!condor.restore().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn process_job_queue_sleeps_then_polls() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(ScriptedCondor::default());
        let mut condor = CondorTransport::new("rex", 1, dir.path(), scheduler.clone());
        condor.launch_job(0, spec(dir.path())).await.unwrap();

        let start = tokio::time::Instant::now();
        let launched = condor
            .process_job_queue(Duration::from_secs(1), Duration::from_secs(60))
            .await;

        assert_eq!(launched, 0);
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(condor.is_done(0, 1).await);
    }
}
