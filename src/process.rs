//! Child-process supervisor for a locally managed application binary.
//!
//! When the client is configured with a process path, the supervisor
//! launches the binary, polls its liveness without blocking, relaunches it
//! after an observed exit, and tears it down gracefully on shutdown. The
//! child inherits only an allow-listed slice of the environment and runs
//! with its working directory set to the executable's directory.

use std::path::Path;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::Result;

/// Time the child gets to open its listener after a spawn.
const SPAWN_SETTLE: Duration = Duration::from_millis(500);

/// Grace period between the termination request and the hard kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Environment variables the child is allowed to inherit.
#[cfg(unix)]
const ENV_ALLOW_LIST: &[&str] = &["USER", "HOME"];
#[cfg(windows)]
const ENV_ALLOW_LIST: &[&str] = &[
    "COMPUTERNAME",
    "HOMEDRIVE",
    "HOMEPATH",
    "USERNAME",
    "USERPROFILE",
    "SystemRoot",
    "TMP",
    "TEMP",
    "Path",
];

/// Split a command line into argv tokens, honoring double quotes:
/// `"a b" c` becomes `[a b, c]`. Quote characters are stripped.
pub fn split_command_line(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// The allow-listed slice of the current environment.
fn filtered_env() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(key, _)| ENV_ALLOW_LIST.contains(&key.as_str()))
        .collect()
}

/// Liveness of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildStatus {
    /// Still running.
    Running,
    /// Exit observed by this poll; the handle has been reaped.
    Exited,
    /// No child to supervise (never spawned again after giving up).
    Gone,
}

/// Supervisor for one application binary.
pub struct FcgiProcess {
    command_line: String,
    child: Option<Child>,
}

impl FcgiProcess {
    /// Launch the configured command line and wait for the child to settle.
    pub async fn launch(command_line: impl Into<String>) -> Result<Self> {
        let mut process = Self {
            command_line: command_line.into(),
            child: None,
        };
        process.spawn().await?;
        Ok(process)
    }

    async fn spawn(&mut self) -> Result<()> {
        let argv = split_command_line(&self.command_line);
        if argv.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty process command line",
            )
            .into());
        }

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        command.env_clear();
        command.envs(filtered_env());
        if let Some(dir) = Path::new(&argv[0]).parent() {
            if !dir.as_os_str().is_empty() {
                command.current_dir(dir);
            }
        }

        let child = command.spawn()?;
        tracing::info!(
            pid = child.id(),
            command = %self.command_line,
            "application process launched"
        );
        self.child = Some(child);

        // Give the child time to open its listener.
        tokio::time::sleep(SPAWN_SETTLE).await;
        Ok(())
    }

    /// Non-blocking reap of the child's status.
    pub(crate) fn poll_status(&mut self) -> ChildStatus {
        let Some(child) = self.child.as_mut() else {
            return ChildStatus::Gone;
        };
        match child.try_wait() {
            Ok(None) => ChildStatus::Running,
            Ok(Some(status)) => {
                tracing::warn!(%status, "application process exited");
                self.child = None;
                ChildStatus::Exited
            }
            Err(e) => {
                tracing::error!("reaping application process failed: {}", e);
                self.child = None;
                ChildStatus::Exited
            }
        }
    }

    /// Relaunch after an observed exit.
    pub(crate) async fn respawn(&mut self) -> Result<()> {
        self.spawn().await
    }

    /// Request graceful termination, give the child up to 2 s, then kill.
    pub async fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        if tokio::time::timeout(SHUTDOWN_GRACE, child.wait())
            .await
            .is_err()
        {
            tracing::warn!("application process ignored termination, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

impl Drop for FcgiProcess {
    fn drop(&mut self) {
        // Drop cannot await the graceful path; shutdown() is the polite one.
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}
