//! Out-of-band execution of jobs on worker nodes.
//!
//! - **Sessions**: [`SessionConnector`] opens a [`RemoteSession`] to a node;
//!   [`ResilientSession`] probes before each operation and reconnects when the
//!   session has dropped
//! - **Transfers**: file staging goes through [`RetryPolicy`]
//! - **Execution**: [`RemoteExecutor::spawn`] runs one job as its own tokio
//!   task and hands back an [`ExecutionHandle`]
//!
//! # Execution Flow
//!
//! 1. Open a session to the node
//! 2. Create the remote working directory and stage executables and inputs
//! 3. Run the placed command, capturing stdout/stderr
//! 4. Fetch outputs and remove the remote working directory
//! 5. Send stdout/stderr over the handle's one-shot channels
//!
//! # Backends
//!
//! - [`OpenSshConnector`]: OpenSSH control-master sessions plus `scp`
//! - [`LocalConnector`]: runs everything on the local host

pub mod executor;
pub mod local;
pub mod retry;
pub mod session;
pub mod ssh;

pub use executor::{ExecutionHandle, ExecutionRequest, JobOutput, RemoteExecutor};
pub use local::LocalConnector;
pub use retry::RetryPolicy;
pub use session::{CommandOutput, RemoteSession, ResilientSession, SessionConnector, SessionTarget};
pub use ssh::OpenSshConnector;
