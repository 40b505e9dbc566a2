//! Shared fixtures: an in-memory session backend that records what the
//! executor asked of it, and node/job builders.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use rex_transport::config::{NodeConfig, TransportConfig};
use rex_transport::error::{Result, TransportError};
use rex_transport::scheduler::JobSpec;
use rex_transport::worker::{
    CommandOutput, RemoteSession, RetryPolicy, SessionConnector, SessionTarget,
};

/// Operations seen by every session the connector handed out.
#[derive(Default)]
pub struct Record {
    pub connects: AtomicUsize,
    pub commands: Mutex<Vec<(String, String)>>,
    pub puts: Mutex<Vec<String>>,
    pub gets: Mutex<Vec<String>>,
    /// Remaining puts that fail before one succeeds
    pub put_failures: AtomicU32,
    /// Remaining probes that report a dropped session
    pub probe_failures: AtomicU32,
}

impl Record {
    /// Commands that are not scratch-directory housekeeping.
    pub fn job_commands(&self) -> Vec<(String, String)> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, cmd)| {
                !cmd.starts_with("mkdir -p ")
                    && !cmd.starts_with("chmod -R ")
                    && !cmd.starts_with("rm -rf ")
            })
            .cloned()
            .collect()
    }
}

/// Scripted connector. When a gate is set, every job command waits for a
/// permit before returning, so tests decide when jobs finish.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    pub record: Arc<Record>,
    pub gate: Option<Arc<Semaphore>>,
    pub refuse_connect: bool,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse_connect: true,
            ..Self::default()
        }
    }

    /// Let `n` gated job commands complete.
    pub fn release(&self, n: usize) {
        if let Some(ref gate) = self.gate {
            gate.add_permits(n);
        }
    }
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        self.record.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect {
            return Err(TransportError::Connect {
                host: target.host.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(ScriptedSession {
            host: target.host.clone(),
            record: Arc::clone(&self.record),
            gate: self.gate.clone(),
        }))
    }
}

struct ScriptedSession {
    host: String,
    record: Arc<Record>,
    gate: Option<Arc<Semaphore>>,
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.record
            .commands
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));

        let housekeeping = command.starts_with("mkdir -p ")
            || command.starts_with("chmod -R ")
            || command.starts_with("rm -rf ");
        if !housekeeping {
            if let Some(ref gate) = self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
        }

        Ok(CommandOutput {
            stdout: format!("ran on {}\n", self.host),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        if take_failure(&self.record.put_failures) {
            return Err(TransportError::Transfer {
                local: local.to_path_buf(),
                remote: remote.to_string(),
                reason: "broken pipe".to_string(),
            });
        }
        self.record.puts.lock().unwrap().push(remote.to_string());
        Ok(())
    }

    async fn get(&self, remote: &str, _local: &Path) -> Result<()> {
        self.record.gets.lock().unwrap().push(remote.to_string());
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        if take_failure(&self.record.probe_failures) {
            return Err(TransportError::Exec {
                host: self.host.clone(),
                reason: "control socket gone".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) {}
}

pub fn nodes(n: usize) -> Vec<NodeConfig> {
    (0..n)
        .map(|i| NodeConfig::new(format!("node{}", i), 4))
        .collect()
}

pub fn fast_config() -> TransportConfig {
    TransportConfig::default()
        .with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
        .with_drain_timeout(Duration::from_secs(5))
}

pub fn job(replica: usize, cycle: u64) -> JobSpec {
    JobSpec::new("impact", "/work")
        .with_io(
            format!("r{}_c{}.inp", replica, cycle),
            format!("r{}_c{}.log", replica, cycle),
            format!("r{}_c{}.err", replica, cycle),
        )
        .with_cycle(cycle)
}
