//! Scripted command runner for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::CommandError;

struct Rule {
    pattern: String,
    /// Consumed one per call; the last response sticks.
    responses: VecDeque<Result<CommandOutput, String>>,
}

/// A `CommandRunner` that matches invocations by substring of their display
/// form and replays scripted responses. Unmatched commands succeed with
/// empty output, so remediation steps do not need individual scripting.
#[derive(Default)]
pub struct MockRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    recoveries: Mutex<u32>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a sticky response for commands containing `pattern`.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.respond_seq(pattern, vec![output]);
    }

    /// Script a sequence of responses; the final one repeats.
    pub fn respond_seq(&self, pattern: &str, outputs: Vec<CommandOutput>) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            responses: outputs.into_iter().map(Ok).collect(),
        });
    }

    /// Convenience: exit 0 with the given stdout.
    pub fn ok(&self, pattern: &str, stdout: &str) {
        self.respond(
            pattern,
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        );
    }

    /// Convenience: non-zero exit with the given stderr.
    pub fn fail(&self, pattern: &str, exit_code: i32, stderr: &str) {
        self.respond(
            pattern,
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
        );
    }

    /// All invocations so far, in display form.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// How many invocations contained `pattern`.
    pub fn count_calls(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn recovery_attempts(&self) -> u32 {
        *self.recoveries.lock().unwrap()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        let display = spec.display();
        self.calls.lock().unwrap().push(display.clone());

        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if display.contains(&rule.pattern) {
                let response = if rule.responses.len() > 1 {
                    rule.responses.pop_front().unwrap()
                } else {
                    rule.responses.front().cloned().unwrap_or(Ok(CommandOutput::default()))
                };
                return response.map_err(|_| CommandError::Cancelled);
            }
        }

        Ok(CommandOutput::default())
    }

    async fn attempt_subsystem_recovery(&self) -> bool {
        *self.recoveries.lock().unwrap() += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sticky_and_sequenced_responses() {
        let mock = MockRunner::new();
        mock.respond_seq(
            "cluster-info",
            vec![
                CommandOutput {
                    exit_code: 1,
                    stderr: "was refused".into(),
                    ..Default::default()
                },
                CommandOutput::default(),
            ],
        );

        let first = mock
            .run(CommandSpec::new("kubectl", &["cluster-info"]))
            .await
            .unwrap();
        assert_eq!(first.exit_code, 1);

        let second = mock
            .run(CommandSpec::new("kubectl", &["cluster-info"]))
            .await
            .unwrap();
        assert_eq!(second.exit_code, 0);

        // Sticky from now on
        let third = mock
            .run(CommandSpec::new("kubectl", &["cluster-info"]))
            .await
            .unwrap();
        assert_eq!(third.exit_code, 0);

        assert_eq!(mock.count_calls("cluster-info"), 3);
    }

    #[tokio::test]
    async fn test_unmatched_commands_succeed() {
        let mock = MockRunner::new();
        let out = mock
            .run(CommandSpec::new("sysctl", &["-w", "fs.inotify.max_user_watches=524288"]))
            .await
            .unwrap();
        assert!(out.success());
    }
}
