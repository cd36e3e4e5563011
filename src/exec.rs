//! External command execution
//!
//! All child processes (`ceph`, `ceph-volume`, `ceph-osd`, `cryptsetup`,
//! `lsblk`, ...) run through the [`Executor`] trait so the provisioning and
//! removal engines can be exercised without real hardware.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Executor Trait
// =============================================================================

/// Runs external commands on behalf of the orchestrator.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a command and return its stdout. Non-zero exit is an error with
    /// captured stderr.
    async fn execute(&self, command: &str, args: &[String]) -> Result<String>;

    /// Run a command with extra environment variables set for the child only.
    async fn execute_with_env(
        &self,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<String>;
}

/// Convenience for call sites with `&str` argument slices.
pub async fn run(executor: &dyn Executor, command: &str, args: &[&str]) -> Result<String> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    executor.execute(command, &args).await
}

// =============================================================================
// Command Executor
// =============================================================================

/// Executor backed by real child processes.
#[derive(Debug, Default, Clone)]
pub struct CommandExecutor;

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, command: &str, args: &[String]) -> Result<String> {
        self.execute_with_env(command, args, &BTreeMap::new()).await
    }

    async fn execute_with_env(
        &self,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<String> {
        debug!("executing: {} {}", command, args.join(" "));

        let output = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: format!("{} {}", command, args.join(" ")),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

// =============================================================================
// Mock Executor (tests)
// =============================================================================

/// Scripted executor for tests. Records every invocation and answers from a
/// caller-supplied closure.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Responder = dyn Fn(&str, &[String]) -> Result<String> + Send + Sync;

    #[derive(Clone)]
    pub struct MockExecutor {
        pub calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
        pub env_seen: Arc<Mutex<Vec<BTreeMap<String, String>>>>,
        responder: Arc<Responder>,
    }

    impl MockExecutor {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&str, &[String]) -> Result<String> + Send + Sync + 'static,
        {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                env_seen: Arc::new(Mutex::new(Vec::new())),
                responder: Arc::new(responder),
            }
        }

        /// An executor that answers every command with empty output.
        pub fn ok() -> Self {
            Self::new(|_, _| Ok(String::new()))
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        /// All invocations of the given command, rendered as single strings.
        pub fn invocations_of(&self, command: &str) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .filter(|(c, _)| c == command)
                .map(|(c, a)| format!("{} {}", c, a.join(" ")))
                .collect()
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn execute(&self, command: &str, args: &[String]) -> Result<String> {
            self.calls
                .lock()
                .push((command.to_string(), args.to_vec()));
            (self.responder)(command, args)
        }

        async fn execute_with_env(
            &self,
            command: &str,
            args: &[String],
            env: &BTreeMap<String, String>,
        ) -> Result<String> {
            self.env_seen.lock().push(env.clone());
            self.execute(command, args).await
        }
    }
}
