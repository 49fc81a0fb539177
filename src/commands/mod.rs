//! Uniform sub-process invocation.
//!
//! Every external binary the orchestrator touches (the container runtime
//! CLI, the cluster runtime CLI, the Kubernetes CLI, ad-hoc shell) goes
//! through a [`CommandRunner`], which captures output, enforces timeouts,
//! honours cancellation, and on Windows transparently rewraps whitelisted
//! commands into the Linux subsystem.

mod runner;
mod wrap;

#[cfg(test)]
pub mod testing;

pub use runner::SystemRunner;
pub use wrap::{is_subsystem_failure, needs_subsystem_wrap, shell_quote, wrap_for_subsystem};

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::CommandError;

/// One sub-process invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub current_dir: Option<PathBuf>,
    pub cancel: Option<CancellationToken>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            current_dir: None,
            cancel: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[allow(dead_code)]
    pub fn with_current_dir(mut self, dir: PathBuf) -> Self {
        self.current_dir = Some(dir);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Render as a single display string (for logs and error messages).
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a completed sub-process.
///
/// A non-zero exit code is delivered here, not as an error; only spawn
/// failure, timeout and cancellation are transport errors.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The more informative of the two streams, trimmed.
    pub fn detail(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

/// Executes commands. The single seam for substituting subprocess behaviour
/// in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Best-effort subsystem recovery (Windows). Returns true when a
    /// recovery was actually attempted.
    async fn attempt_subsystem_recovery(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_display() {
        let spec = CommandSpec::new("k3d", &["cluster", "list"]);
        assert_eq!(spec.display(), "k3d cluster list");
        assert_eq!(CommandSpec::new("docker", &[]).display(), "docker");
    }

    #[test]
    fn test_output_detail_prefers_stderr() {
        let out = CommandOutput {
            stdout: "ok\n".into(),
            stderr: "boom\n".into(),
            exit_code: 1,
        };
        assert_eq!(out.detail(), "boom");

        let out = CommandOutput {
            stdout: "ok\n".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert_eq!(out.detail(), "ok");
        assert!(out.success());
    }
}
