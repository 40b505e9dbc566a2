use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::worker::retry::RetryPolicy;

/// One worker node as supplied in the node file.
///
/// Field names follow the node-file format used by existing replica-exchange
/// setups so those files load unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host name or address used for ssh/scp
    #[serde(rename = "node_name")]
    pub name: String,
    /// Threads a single job may use on this node
    #[serde(rename = "threads_number")]
    pub threads: u32,
    /// Slot index within the physical host, used for core placement
    #[serde(rename = "slot_number", default)]
    pub slot: u32,
    /// Remote login; `None` uses the ambient ssh identity
    #[serde(rename = "user_name", default)]
    pub username: Option<String>,
    /// Architecture tag (e.g. "linux-x86_64", "-knl", "-knc")
    #[serde(default)]
    pub arch: String,
    /// Root of per-job scratch directories on the node
    #[serde(rename = "tmp_folder", default)]
    pub scratch_root: String,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, threads: u32) -> Self {
        Self {
            name: name.into(),
            threads,
            slot: 0,
            username: None,
            arch: String::new(),
            scratch_root: "/tmp".to_string(),
        }
    }

    pub fn with_slot(mut self, slot: u32) -> Self {
        self.slot = slot;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = arch.into();
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<String>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TransportError::InvalidConfig(
                "node_name cannot be empty".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(TransportError::InvalidConfig(format!(
                "node {} must have threads_number > 0",
                self.name
            )));
        }
        if self
            .slot
            .checked_add(1)
            .and_then(|slots| slots.checked_mul(self.threads))
            .is_none()
        {
            return Err(TransportError::InvalidConfig(format!(
                "node {}: slot_number {} with threads_number {} is out of range",
                self.name, self.slot, self.threads
            )));
        }
        Ok(())
    }
}

/// Load an ordered node list from a JSON file.
pub fn load_nodes(path: &Path) -> Result<Vec<NodeConfig>> {
    let data = std::fs::read_to_string(path)?;
    let nodes: Vec<NodeConfig> = serde_json::from_str(&data)?;
    if nodes.is_empty() {
        return Err(TransportError::InvalidConfig(format!(
            "node file {} lists no nodes",
            path.display()
        )));
    }
    for node in &nodes {
        node.validate()?;
    }
    Ok(nodes)
}

/// Options for the OpenSSH client backend.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// ssh program
    pub ssh_program: String,
    /// scp program
    pub scp_program: String,
    /// Remote port; `None` uses the client default
    pub port: Option<u16>,
    /// Identity file passed with `-i`
    pub identity_file: Option<PathBuf>,
    /// Seconds before an unanswered connect is abandoned
    pub connect_timeout_secs: u64,
    /// Accept unknown host keys (mirrors an auto-add host key policy)
    pub accept_new_host_keys: bool,
    /// Directory holding control-master sockets
    pub control_dir: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            port: None,
            identity_file: None,
            connect_timeout_secs: 10,
            accept_new_host_keys: true,
            control_dir: std::env::temp_dir(),
        }
    }
}

/// Tunables for the node-pool transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Retry budget for file staging
    pub retry: RetryPolicy,
    /// Bounded wait when draining a finished job's output channels
    pub drain_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.drain_timeout.is_zero() {
            return Err(TransportError::InvalidConfig(
                "drain_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
