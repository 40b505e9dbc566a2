//! Loopback backend: "remote" commands run through the local `sh` and file
//! copies are plain filesystem copies. Lets a pool of pseudo-nodes share the
//! current host, which is how single-machine runs and the integration tests
//! drive the transport.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Result, TransportError};
use crate::worker::session::{CommandOutput, RemoteSession, SessionConnector, SessionTarget};

#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

impl LocalConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionConnector for LocalConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        Ok(Box::new(LocalSession {
            host: target.host.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct LocalSession {
    host: String,
}

async fn copy(from: &Path, to: &Path, local: &Path, remote: &str) -> Result<()> {
    tokio::fs::copy(from, to)
        .await
        .map(|_| ())
        .map_err(|e| TransportError::Transfer {
            local: local.to_path_buf(),
            remote: remote.to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| TransportError::Exec {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        copy(local, Path::new(remote), local, remote).await
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        copy(Path::new(remote), local, local, remote).await
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}
