//! Production command runner on top of `tokio::process`.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::process::Command;

use super::{
    is_subsystem_failure, needs_subsystem_wrap, wrap_for_subsystem, CommandOutput, CommandRunner,
    CommandSpec,
};
use crate::error::CommandError;
use crate::platform::{wsl, Platform};

/// Runs commands on the host, rewrapping whitelisted binaries into the
/// Linux subsystem on Windows.
pub struct SystemRunner {
    platform: Platform,
    wsl_distro: Option<String>,
    /// Consecutive subsystem failures observed.
    failure_streak: AtomicU32,
    /// Whether a recovery was already spent on the current streak.
    recovered_streak: AtomicBool,
}

impl SystemRunner {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            wsl_distro: None,
            failure_streak: AtomicU32::new(0),
            recovered_streak: AtomicBool::new(false),
        }
    }

    /// Pin a specific WSL distribution instead of the default one.
    #[allow(dead_code)]
    pub fn with_distro(mut self, distro: impl Into<String>) -> Self {
        self.wsl_distro = Some(distro.into());
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    async fn run_once(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let (program, args) = if needs_subsystem_wrap(self.platform, &spec.program) {
            let user = wsl::default_user(self.wsl_distro.as_deref()).await;
            wrap_for_subsystem(&spec.program, &spec.args, self.wsl_distro.as_deref(), &user)
        } else {
            (spec.program.clone(), spec.args.clone())
        };

        tracing::debug!(command = %spec.display(), wrapped = %program, "Executing command");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| CommandError::Spawn {
            program: spec.program.clone(),
            source: e,
        })?;

        let cancel = spec.cancel.clone().unwrap_or_default();
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let result = if let Some(timeout) = spec.timeout {
            tokio::select! {
                res = tokio::time::timeout(timeout, &mut wait) => match res {
                    Ok(inner) => inner,
                    Err(_) => {
                        return Err(CommandError::TimedOut {
                            program: spec.program.clone(),
                            seconds: timeout.as_secs(),
                        })
                    }
                },
                _ = cancel.cancelled() => return Err(CommandError::Cancelled),
            }
        } else {
            tokio::select! {
                res = &mut wait => res,
                _ = cancel.cancelled() => return Err(CommandError::Cancelled),
            }
        };

        let output = result.map_err(|e| CommandError::Spawn {
            program: spec.program.clone(),
            source: e,
        })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        let output = self.run_once(&spec).await?;

        if output.success() {
            self.failure_streak.store(0, Ordering::SeqCst);
            self.recovered_streak.store(false, Ordering::SeqCst);
            return Ok(output);
        }

        if self.platform.is_windows() && is_subsystem_failure(&output.stderr) {
            let streak = self.failure_streak.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(
                command = %spec.display(),
                streak,
                "Subsystem failure detected"
            );
            // One recovery + one retry per streak; further failures surface
            // to the caller untouched.
            if !self.recovered_streak.swap(true, Ordering::SeqCst)
                && self.attempt_subsystem_recovery().await
            {
                return self.run_once(&spec).await;
            }
        }

        Ok(output)
    }

    async fn attempt_subsystem_recovery(&self) -> bool {
        if !self.platform.is_windows() {
            return false;
        }
        tracing::info!("Attempting subsystem recovery (wsl --shutdown)");
        let restarted = Command::new("wsl")
            .arg("--shutdown")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if restarted {
            // The first wrapped command after shutdown boots the distro again.
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        restarted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn runner() -> SystemRunner {
        SystemRunner::new(Platform::Linux)
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let out = runner()
            .run(CommandSpec::new("sh", &["-c", "printf hello"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.exit_code, 0);
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_transport_error() {
        let out = runner()
            .run(CommandSpec::new("sh", &["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = runner()
            .run(CommandSpec::new("definitely-not-a-binary-k3pilot", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = runner()
            .run(
                CommandSpec::new("sh", &["-c", "sleep 5"])
                    .with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let token = CancellationToken::new();
        let spec = CommandSpec::new("sh", &["-c", "sleep 5"]).with_cancel(token.clone());
        let handle = tokio::spawn(async move { runner().run(spec).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Cancelled));
    }

    #[tokio::test]
    async fn test_no_recovery_off_windows() {
        assert!(!runner().attempt_subsystem_recovery().await);
    }
}
