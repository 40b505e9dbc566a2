pub mod job;
pub mod placement;
pub mod pool;
pub mod queue;

pub use job::{Assignment, Job, JobSpec, JobState, JobStatus, ReplicaId};
pub use placement::{build_command, shell_quote, Placement};
pub use pool::{NodePool, NodeStatus};
pub use queue::JobQueue;
