//! The driver-facing contract and its backends.
//!
//! A replica-exchange driver only ever talks to a [`Transport`]:
//!
//! - [`Transport::launch_job`] hands over one replica's work for a cycle
//! - [`Transport::process_job_queue`] gives the transport a time slice to
//!   place queued work and reclaim finished work
//! - [`Transport::is_done`] reports (and on completion reclaims) a replica
//!
//! [`SshTransport`] holds a pool of nodes and runs each job over a remote
//! shell session. [`CondorTransport`] hands jobs to an HTCondor schedd and
//! polls its queue.

pub mod condor;
pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::scheduler::{JobSpec, ReplicaId};

pub use condor::{BatchJobId, BatchScheduler, CondorCli, CondorTransport};
pub use ssh::SshTransport;

#[async_trait]
pub trait Transport: Send {
    /// Record `spec` as the replica's current job and return the queue depth.
    ///
    /// A replica that still has outstanding work is resolved first; the new
    /// job replaces it in tracking.
    async fn launch_job(&mut self, replica: ReplicaId, spec: JobSpec) -> Result<usize>;

    /// True when the replica has no outstanding work. Finding a finished job
    /// reclaims it before returning. `cycle` is not used to disambiguate.
    async fn is_done(&mut self, replica: ReplicaId, cycle: u64) -> bool;

    /// Work the queue for `max_interval`, rescanning every `min_interval`.
    /// Always uses the whole budget. Returns the number of jobs started.
    async fn process_job_queue(&mut self, min_interval: Duration, max_interval: Duration)
        -> usize;
}
