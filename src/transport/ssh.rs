use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::config::{NodeConfig, SshConfig, TransportConfig};
use crate::error::{Result, TransportError};
use crate::scheduler::{
    build_command, Assignment, Job, JobQueue, JobSpec, JobState, JobStatus, NodePool, NodeStatus,
    ReplicaId,
};
use crate::transport::Transport;
use crate::worker::{
    ExecutionRequest, OpenSshConnector, RemoteExecutor, SessionConnector,
    SessionTarget,
};

/// Floor on the rescan interval so a zero `min_interval` cannot spin.
const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(1);

/// A run whose replica was relaunched while it was still going. It keeps its
/// node until it exits.
#[derive(Debug)]
struct DetachedRun {
    replica: ReplicaId,
    assignment: Assignment,
}

/// Node-pool transport: one job per node, each run over a remote session.
///
/// The transport is the only writer of the pool, the queue and the job table.
/// Workers report back solely through their
/// [`ExecutionHandle`](crate::worker::ExecutionHandle)s.
#[derive(Debug)]
pub struct SshTransport {
    pool: NodePool,
    queue: JobQueue,
    jobs: Vec<Option<Job>>,
    detached: Vec<DetachedRun>,
    executor: RemoteExecutor,
    config: TransportConfig,
}

impl SshTransport {
    pub fn new(
        nodes: Vec<NodeConfig>,
        nreplicas: usize,
        config: TransportConfig,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = NodePool::new(nodes)?;
        let executor = RemoteExecutor::new(connector, config.retry);
        Ok(Self {
            pool,
            queue: JobQueue::new(),
            jobs: (0..nreplicas).map(|_| None).collect(),
            detached: Vec::new(),
            executor,
            config,
        })
    }

    /// Transport over OpenSSH.
    pub fn with_openssh(
        nodes: Vec<NodeConfig>,
        nreplicas: usize,
        config: TransportConfig,
        ssh: SshConfig,
    ) -> Result<Self> {
        Self::new(nodes, nreplicas, config, Arc::new(OpenSshConnector::new(ssh)))
    }

    pub fn nreplicas(&self) -> usize {
        self.jobs.len()
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn node_status(&self, node: usize) -> Option<NodeStatus> {
        self.pool.status(node)
    }

    pub fn busy_nodes(&self) -> Vec<(usize, ReplicaId)> {
        self.pool.busy_nodes()
    }

    pub fn job_status(&self, replica: ReplicaId) -> Option<JobStatus> {
        self.jobs.get(replica)?.as_ref().map(Job::status)
    }

    pub fn assigned_node(&self, replica: ReplicaId) -> Option<usize> {
        self.jobs.get(replica)?.as_ref()?.assigned_node()
    }

    /// Node, placed command and start time of a running replica.
    pub fn assignment(&self, replica: ReplicaId) -> Option<&Assignment> {
        match &self.jobs.get(replica)?.as_ref()?.state {
            JobState::Running(assignment) => Some(assignment),
            JobState::Queued => None,
        }
    }

    /// Replicas with queued or running work, in replica order.
    pub fn outstanding_replicas(&self) -> Vec<ReplicaId> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.is_some())
            .map(|(replica, _)| replica)
            .collect()
    }

    /// Place queued jobs on idle nodes until one side runs out.
    fn dispatch(&mut self) -> usize {
        let mut launched = 0;
        let mut deferred = Vec::new();

        while !self.queue.is_empty() {
            let Some(node) = self.pool.available_node() else {
                break;
            };
            let Some(replica) = self.queue.pop() else {
                break;
            };

            if self.detached.iter().any(|run| run.replica == replica) {
                tracing::debug!(replica, "Previous run still active, deferring");
                deferred.push(replica);
                continue;
            }

            if self.start(replica, node) {
                launched += 1;
            }
        }

        for replica in deferred.into_iter().rev() {
            self.queue.push_front(replica);
        }
        launched
    }

    /// Bind `replica` to `node` and start its executor.
    fn start(&mut self, replica: ReplicaId, node: usize) -> bool {
        let Some(job) = self.jobs.get_mut(replica).and_then(Option::as_mut) else {
            tracing::warn!(replica, "Queued replica has no job, dropping");
            return false;
        };
        if !matches!(job.state, JobState::Queued) {
            tracing::warn!(replica, "Queued replica is already running, dropping");
            return false;
        }
        let Some(node_config) = self.pool.node(node).cloned() else {
            tracing::warn!(node, "Unknown node id");
            self.queue.push_front(replica);
            return false;
        };
        if !self.pool.mark_busy(node, replica) {
            self.queue.push_front(replica);
            return false;
        }

        let remote_dir = job
            .spec
            .remote_replica_dir
            .as_deref()
            .map(|sub| remote_working_dir(&node_config.scratch_root, sub));
        let command = build_command(&node_config, &job.spec.command(), remote_dir.as_deref());

        let request = ExecutionRequest {
            replica,
            cycle: job.spec.cycle,
            target: SessionTarget::from(&node_config),
            arch: node_config.arch.clone(),
            command: command.clone(),
            remote_dir: remote_dir.clone(),
            working_directory: job.spec.working_directory.clone(),
            input_files: job.spec.job_input_files.clone(),
            output_files: job.spec.job_output_files.clone(),
            exec_directory: job.spec.exec_directory.clone(),
        };
        let execution = self.executor.spawn(request);

        let started_at = Utc::now();
        tracing::info!(
            replica,
            node,
            host = %node_config.name,
            cycle = job.spec.cycle,
            waited_ms = (started_at - job.queued_at).num_milliseconds(),
            "Job dispatched"
        );

        job.state = JobState::Running(Assignment {
            node,
            remote_dir,
            command,
            started_at,
            execution,
        });
        true
    }

    /// Free the run's node, collect its output and log it.
    async fn reclaim(&mut self, replica: ReplicaId, assignment: Assignment) {
        let Assignment {
            node,
            remote_dir,
            command,
            started_at,
            execution,
        } = assignment;

        match self.pool.free(node) {
            Some(occupant) if occupant != replica => {
                tracing::warn!(node, replica, occupant, "Reclaimed node was held by another replica");
            }
            _ => {}
        }

        let output = execution.drain(self.config.drain_timeout).await;
        if let Some(ref stdout) = output.stdout {
            if !stdout.trim().is_empty() {
                tracing::info!(replica, stdout = %stdout.trim_end(), "Job stdout");
            }
        }
        if let Some(ref stderr) = output.stderr {
            if !stderr.trim().is_empty() {
                tracing::info!(replica, stderr = %stderr.trim_end(), "Job stderr");
            }
        }
        if !output.is_complete() {
            tracing::warn!(
                replica,
                timed_out = output.timed_out,
                "Unable to collect output from job result channels"
            );
        }
        tracing::info!(
            replica,
            node,
            runtime_ms = (Utc::now() - started_at).num_milliseconds(),
            remote_dir = remote_dir.as_deref().unwrap_or("-"),
            command = %command,
            "Node reclaimed"
        );
    }

    /// Reclaim every finished run, tracked or detached.
    async fn reclaim_finished(&mut self) {
        for replica in self.outstanding_replicas() {
            self.is_done(replica, 0).await;
        }

        let mut i = 0;
        while i < self.detached.len() {
            if self.detached[i].assignment.execution.is_finished() {
                let run = self.detached.swap_remove(i);
                self.reclaim(run.replica, run.assignment).await;
            } else {
                i += 1;
            }
        }
    }
}

fn remote_working_dir(scratch_root: &str, replica_dir: &str) -> String {
    let root = scratch_root.trim_end_matches('/');
    if root.is_empty() {
        replica_dir.to_string()
    } else {
        format!("{}/{}", root, replica_dir)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn launch_job(&mut self, replica: ReplicaId, spec: JobSpec) -> Result<usize> {
        if replica >= self.jobs.len() {
            return Err(TransportError::UnknownReplica(replica));
        }
        spec.validate()?;
        let cycle = spec.cycle;

        if self.jobs[replica].is_some() && !self.is_done(replica, cycle).await {
            if let Some(previous) = self.jobs[replica].take() {
                match previous.state {
                    JobState::Queued => {
                        tracing::info!(replica, cycle, "Replacing queued job");
                    }
                    JobState::Running(assignment) => {
                        tracing::warn!(
                            replica,
                            node = assignment.node,
                            "Previous job still running, tracking new job"
                        );
                        self.detached.push(DetachedRun {
                            replica,
                            assignment,
                        });
                    }
                }
            }
        }

        self.jobs[replica] = Some(Job::new(replica, spec));
        self.queue.push(replica);

        let depth = self.queue.len();
        tracing::debug!(replica, cycle, depth, "Job queued");
        Ok(depth)
    }

    async fn is_done(&mut self, replica: ReplicaId, _cycle: u64) -> bool {
        let Some(slot) = self.jobs.get(replica) else {
            tracing::warn!(replica, "is_done: unknown replica id");
            return true;
        };
        let finished = match slot {
            None => return true,
            Some(job) => match &job.state {
                JobState::Queued => false,
                JobState::Running(assignment) => assignment.execution.is_finished(),
            },
        };
        if !finished {
            return false;
        }

        if let Some(job) = self.jobs[replica].take() {
            if let JobState::Running(assignment) = job.state {
                self.reclaim(replica, assignment).await;
            }
        }
        true
    }

    async fn process_job_queue(
        &mut self,
        min_interval: Duration,
        max_interval: Duration,
    ) -> usize {
        let min_interval = min_interval.max(MIN_SCAN_INTERVAL);
        let start = Instant::now();
        let mut launched = 0;

        loop {
            launched += self.dispatch();
            tokio::time::sleep(min_interval).await;
            self.reclaim_finished().await;
            if start.elapsed() >= max_interval {
                break;
            }
        }

        tracing::debug!(launched, queued = self.queue.len(), "Queue scan finished");
        launched
    }
}
