use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::NodeConfig;
use crate::error::Result;

/// Where a session goes: host plus optional login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub username: Option<String>,
}

impl SessionTarget {
    pub fn new(host: impl Into<String>, username: Option<String>) -> Self {
        Self {
            host: host.into(),
            username,
        }
    }

    /// `user@host`, or bare `host` for the ambient identity.
    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl From<&NodeConfig> for SessionTarget {
    fn from(node: &NodeConfig) -> Self {
        Self::new(node.name.clone(), node.username.clone())
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// An open shell/file-copy channel to one node.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `command` through the remote shell and wait for it.
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    async fn put(&self, local: &Path, remote: &str) -> Result<()>;

    async fn get(&self, remote: &str, local: &Path) -> Result<()>;

    /// No-op round trip used to detect a dropped session.
    async fn probe(&self) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>>;
}

/// A session that probes before every operation and reopens itself with the
/// same target when the probe fails.
pub struct ResilientSession {
    connector: Arc<dyn SessionConnector>,
    target: SessionTarget,
    inner: Mutex<Box<dyn RemoteSession>>,
}

impl ResilientSession {
    pub async fn connect(connector: Arc<dyn SessionConnector>, target: SessionTarget) -> Result<Self> {
        let session = connector.connect(&target).await?;
        Ok(Self {
            connector,
            target,
            inner: Mutex::new(session),
        })
    }

    async fn live(&self) -> Result<MutexGuard<'_, Box<dyn RemoteSession>>> {
        let mut session = self.inner.lock().await;
        if let Err(e) = session.probe().await {
            tracing::warn!(host = %self.target.host, error = %e, "Session lost, reconnecting");
            session.close().await;
            *session = self.connector.connect(&self.target).await?;
            tracing::info!(host = %self.target.host, "Re-established session");
        }
        Ok(session)
    }

    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.live().await?.exec(command).await
    }

    pub async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        self.live().await?.put(local, remote).await
    }

    pub async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        self.live().await?.get(remote, local).await
    }

    pub async fn close(self) {
        self.inner.into_inner().close().await;
    }
}
