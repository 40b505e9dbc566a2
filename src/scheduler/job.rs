use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::worker::ExecutionHandle;

/// Stable replica index in `[0, nreplicas)`.
pub type ReplicaId = usize;

/// What the driver asks to run for one replica in one cycle.
///
/// Immutable once handed to a transport; everything that depends on the node
/// a job lands on lives in [`Assignment`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub executable: String,
    pub input_file: String,
    pub output_file: String,
    pub error_file: String,
    /// Local directory holding inputs and receiving outputs
    pub working_directory: PathBuf,
    /// Files staged from `working_directory` to the remote scratch directory
    pub job_input_files: Vec<String>,
    /// Files fetched back from the remote scratch directory
    pub job_output_files: Vec<String>,
    /// Root of `lib/<arch>` and `bin/<arch>` trees staged alongside inputs
    pub exec_directory: Option<PathBuf>,
    /// Per-replica subdirectory under the node's scratch root; `None` runs in place
    pub remote_replica_dir: Option<String>,
    pub cycle: u64,
}

impl JobSpec {
    pub fn new(executable: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            input_file: String::new(),
            output_file: String::new(),
            error_file: String::new(),
            working_directory: working_directory.into(),
            job_input_files: Vec::new(),
            job_output_files: Vec::new(),
            exec_directory: None,
            remote_replica_dir: None,
            cycle: 0,
        }
    }

    pub fn with_io(
        mut self,
        input_file: impl Into<String>,
        output_file: impl Into<String>,
        error_file: impl Into<String>,
    ) -> Self {
        self.input_file = input_file.into();
        self.output_file = output_file.into();
        self.error_file = error_file.into();
        self
    }

    pub fn with_input_files(mut self, files: Vec<String>) -> Self {
        self.job_input_files = files;
        self
    }

    pub fn with_output_files(mut self, files: Vec<String>) -> Self {
        self.job_output_files = files;
        self
    }

    pub fn with_exec_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.exec_directory = Some(dir.into());
        self
    }

    pub fn with_remote_replica_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_replica_dir = Some(dir.into());
        self
    }

    pub fn with_cycle(mut self, cycle: u64) -> Self {
        self.cycle = cycle;
        self
    }

    /// The remote replica directory must be a single path component so the
    /// scratch directory removed after the run never reaches above it.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref dir) = self.remote_replica_dir {
            if dir.is_empty() || dir == "." || dir == ".." || dir.contains('/') {
                return Err(TransportError::InvalidConfig(format!(
                    "remote_replica_dir {:?} must be a single directory name",
                    dir
                )));
            }
        }
        Ok(())
    }

    /// Base shell command: `executable input > output 2> error`.
    ///
    /// Empty file names drop the corresponding argument or redirection.
    pub fn command(&self) -> String {
        let mut command = self.executable.clone();
        if !self.input_file.is_empty() {
            command.push(' ');
            command.push_str(&self.input_file);
        }
        if !self.output_file.is_empty() {
            command.push_str(" > ");
            command.push_str(&self.output_file);
        }
        if !self.error_file.is_empty() {
            command.push_str(" 2> ");
            command.push_str(&self.error_file);
        }
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
        }
    }
}

/// Node-dependent state of one dispatch attempt.
#[derive(Debug)]
pub struct Assignment {
    pub node: usize,
    pub remote_dir: Option<String>,
    /// Command after placement rewriting
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub execution: ExecutionHandle,
}

#[derive(Debug)]
pub enum JobState {
    Queued,
    Running(Assignment),
}

/// A replica's outstanding work. Dropped once its result has been reclaimed.
#[derive(Debug)]
pub struct Job {
    pub replica: ReplicaId,
    pub spec: JobSpec,
    pub state: JobState,
    pub queued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(replica: ReplicaId, spec: JobSpec) -> Self {
        Self {
            replica,
            spec,
            state: JobState::Queued,
            queued_at: Utc::now(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Queued => JobStatus::Queued,
            JobState::Running(_) => JobStatus::Running,
        }
    }

    pub fn assigned_node(&self) -> Option<usize> {
        match &self.state {
            JobState::Queued => None,
            JobState::Running(assignment) => Some(assignment.node),
        }
    }
}
