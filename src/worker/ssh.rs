//! OpenSSH client backend.
//!
//! A session is an ssh control master: `connect` starts a backgrounded master
//! on a private socket and every later `ssh`/`scp` call multiplexes over it.
//! `ssh -O check` is the no-op probe and `ssh -O exit` tears the master down.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::SshConfig;
use crate::error::{Result, TransportError};
use crate::worker::session::{CommandOutput, RemoteSession, SessionConnector, SessionTarget};

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone, Default)]
pub struct OpenSshConnector {
    config: SshConfig,
}

impl OpenSshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for OpenSshConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        let control_path = self
            .config
            .control_dir
            .join(format!("rex-{}.sock", Uuid::new_v4().simple()));
        let session = OpenSshSession {
            config: self.config.clone(),
            target: target.clone(),
            control_path,
        };

        let mut args = session.ssh_options();
        args.extend([
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-f".to_string(),
            "-N".to_string(),
            target.destination(),
        ]);

        let output = Command::new(&self.config.ssh_program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| TransportError::Connect {
                host: target.host.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(TransportError::Connect {
                host: target.host.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(host = %target.host, control_path = %session.control_path.display(), "ssh control master started");
        Ok(Box::new(session))
    }
}

#[derive(Debug)]
pub struct OpenSshSession {
    config: SshConfig,
    target: SessionTarget,
    control_path: PathBuf,
}

impl OpenSshSession {
    /// Options shared by every ssh invocation on this session.
    fn ssh_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ];
        if self.config.accept_new_host_keys {
            args.push("-o".to_string());
            args.push("StrictHostKeyChecking=accept-new".to_string());
        }
        if let Some(port) = self.config.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(ref identity) = self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    /// Same as [`Self::ssh_options`] for scp, which spells the port `-P`.
    fn scp_options(&self) -> Vec<String> {
        let mut args = vec![
            "-q".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if self.config.accept_new_host_keys {
            args.push("-o".to_string());
            args.push("StrictHostKeyChecking=accept-new".to_string());
        }
        if let Some(port) = self.config.port {
            args.push("-P".to_string());
            args.push(port.to_string());
        }
        if let Some(ref identity) = self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn remote_spec(&self, remote: &str) -> String {
        format!("{}:{}", self.target.destination(), remote)
    }

    async fn control(&self, operation: &str) -> std::io::Result<std::process::Output> {
        Command::new(&self.config.ssh_program)
            .args(["-O", operation])
            .args(self.ssh_options())
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    }

    async fn scp(&self, from: String, to: String, local: &Path, remote: &str) -> Result<()> {
        let transfer_error = |reason: String| TransportError::Transfer {
            local: local.to_path_buf(),
            remote: remote.to_string(),
            reason,
        };

        let output = Command::new(&self.config.scp_program)
            .args(self.scp_options())
            .arg(from)
            .arg(to)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| transfer_error(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(transfer_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let output = Command::new(&self.config.ssh_program)
            .args(self.ssh_options())
            .arg(self.target.destination())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| TransportError::Exec {
                host: self.target.host.clone(),
                reason: e.to_string(),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();
        if exit_code == Some(SSH_CONNECTION_FAILURE) {
            return Err(TransportError::Exec {
                host: self.target.host.clone(),
                reason: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code,
        })
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let from = local.display().to_string();
        let to = self.remote_spec(remote);
        self.scp(from, to, local, remote).await
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        let from = self.remote_spec(remote);
        let to = local.display().to_string();
        self.scp(from, to, local, remote).await
    }

    async fn probe(&self) -> Result<()> {
        let output = self.control("check").await.map_err(|e| TransportError::Connect {
            host: self.target.host.clone(),
            reason: e.to_string(),
        })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::Connect {
                host: self.target.host.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn close(&self) {
        match self.control("exit").await {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::debug!(
                host = %self.target.host,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "ssh control master already gone"
            ),
            Err(e) => tracing::debug!(host = %self.target.host, error = %e, "Failed to stop ssh control master"),
        }
        let _ = tokio::fs::remove_file(&self.control_path).await;
    }
}
