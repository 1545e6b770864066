//! Child process handle with output draining and graceful termination.
//!
//! Backends are spawned into their own process group so a SIGINT delivered
//! to the router never reaches them directly; shutdown goes through
//! `terminate`, which escalates from a polite stop to a hard kill.

use lemonade_common::Result;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{error, info, warn};

const FORCEFUL_KILL_TIMEOUT_SECS: u64 = 2;
const LOG_PREFIX_STDOUT: &str = "stdout";
const LOG_PREFIX_STDERR: &str = "stderr";

/// Opaque handle over one backend subprocess
pub struct ProcessHandle {
    child: Option<Child>,
    exit_status: Option<ExitStatus>,
    name: String,
}

impl ProcessHandle {
    /// Spawn `command` with piped outputs drained onto the log, isolated
    /// into its own process group.
    pub fn spawn(name: &str, mut command: Command) -> Result<Self> {
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let pid = nix::unistd::Pid::from_raw(0);
                nix::unistd::setpgid(pid, pid).map_err(std::io::Error::from)
            });
        }

        let mut child = command.spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let name = name.to_string();
            tokio::spawn(async move {
                let reader = BufReader::new(stdout);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!("{} {}: {}", name, LOG_PREFIX_STDOUT, line);
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let name = name.to_string();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    // stderr often carries the useful diagnostics
                    warn!("{} {}: {}", name, LOG_PREFIX_STDERR, line);
                }
            });
        }

        Ok(Self {
            child: Some(child),
            exit_status: None,
            name: name.to_string(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Check liveness, reaping the exit status when the process is gone
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                self.child = None;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Error checking {} process status: {}", self.name, e);
                false
            }
        }
    }

    /// Exit code once terminated; `None` while running or if killed by signal
    pub fn exit_code(&mut self) -> Option<i32> {
        if self.is_running() {
            return None;
        }
        self.exit_status.and_then(|status| status.code())
    }

    /// Polite stop, bounded wait, then hard kill
    pub async fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("Terminating {} process", self.name);

        if self.try_graceful_shutdown(&mut child, grace).await {
            return;
        }
        self.force_kill(child).await;
    }

    /// Block until the process exits and is reaped
    pub async fn join(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.wait().await {
                Ok(status) => self.exit_status = Some(status),
                Err(e) => warn!("Error waiting for {}: {}", self.name, e),
            }
        }
    }

    #[cfg(unix)]
    async fn try_graceful_shutdown(&mut self, child: &mut Child, grace: Duration) -> bool {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            // The child leads its own process group; signal the whole group
            let _ = signal::kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM);

            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("{} exited gracefully with status: {:?}", self.name, status);
                    self.exit_status = Some(status);
                    return true;
                }
                _ => {
                    warn!("{} didn't exit within grace period, will force kill", self.name);
                }
            }
        }
        false
    }

    #[cfg(not(unix))]
    async fn try_graceful_shutdown(&mut self, _child: &mut Child, _grace: Duration) -> bool {
        // No SIGTERM equivalent; go straight to force kill
        false
    }

    async fn force_kill(&mut self, mut child: Child) {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill {}: {}", self.name, e);
        }

        match timeout(Duration::from_secs(FORCEFUL_KILL_TIMEOUT_SECS), child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} forcefully killed with status: {:?}", self.name, status);
                self.exit_status = Some(status);
            }
            Ok(Err(e)) => {
                error!("Error waiting for {} to exit: {}", self.name, e);
            }
            Err(_) => {
                error!("Timeout waiting for {} to exit after kill", self.name);
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // kill_on_drop handles the child; nothing to await here
        if self.child.is_some() {
            warn!("{} process handle dropped while child may still run", self.name);
        }
    }
}
