//! Peer WebRTC stack process management
//!
//! The peer signalling stack is an external daemon that takes over the
//! capture devices in `peer_webrtc` mode. The arbiter runs it as a child
//! process when a command line is configured; with no command configured
//! the stack is assumed to be managed by the init system and only the
//! device probes arbitrate.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

pub struct PeerStack {
    command: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl PeerStack {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            child: Mutex::new(None),
        }
    }

    pub fn is_managed(&self) -> bool {
        !self.command.is_empty()
    }

    /// Launch the daemon. A no-op when unmanaged or already running.
    pub async fn start(&self) -> Result<()> {
        if !self.is_managed() {
            debug!("Peer stack is externally managed, nothing to launch");
            return Ok(());
        }
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait().map_err(AppError::Io)?.is_none() {
                return Ok(());
            }
        }

        info!(command = %self.command.join(" "), "Launching peer WebRTC stack");
        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::Internal(format!("spawning peer stack '{}': {}", self.command[0], e))
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "peer_stack", "{}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "peer_stack", "{}", line);
                }
            });
        }

        *guard = Some(child);
        Ok(())
    }

    /// Confirm the daemon stays up for a moment after launch
    pub async fn wait_ready(&self, deadline: Duration) -> Result<()> {
        if !self.is_managed() {
            return Ok(());
        }
        let settle = deadline.min(Duration::from_secs(1));
        tokio::time::sleep(settle).await;
        if self.running().await {
            Ok(())
        } else {
            Err(AppError::Internal("peer stack exited right after launch".into()))
        }
    }

    /// Terminate the daemon, bounded by `deadline`
    pub async fn stop(&self, deadline: Duration) {
        if !self.is_managed() {
            return;
        }
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return;
        };
        if let Some(pid) = child.id() {
            info!(pid, "Stopping peer WebRTC stack");
        }
        if let Err(e) = child.kill().await {
            warn!("Failed to kill peer stack: {}", e);
        }
        if tokio::time::timeout(deadline, child.wait()).await.is_err() {
            warn!("Peer stack did not reap within deadline");
        }
    }

    pub async fn running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unmanaged_stack_is_trivially_ready() {
        let stack = PeerStack::new(vec![]);
        assert!(!stack.is_managed());
        stack.start().await.unwrap();
        stack.wait_ready(Duration::from_secs(1)).await.unwrap();
        assert!(!stack.running().await);
        stack.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_managed_stack_lifecycle() {
        let stack = PeerStack::new(vec!["sleep".into(), "30".into()]);
        stack.start().await.unwrap();
        assert!(stack.running().await);
        // idempotent start
        stack.start().await.unwrap();
        stack.stop(Duration::from_secs(5)).await;
        assert!(!stack.running().await);
    }

    #[tokio::test]
    async fn test_missing_binary_fails() {
        let stack = PeerStack::new(vec!["/nonexistent/peerd".into()]);
        assert!(stack.start().await.is_err());
    }
}
