//! Progress reporting primitives.
//!
//! Long-running operations report progress as `OutputLine`s over an mpsc
//! channel; the binary drains the channel to the terminal. The reconciler
//! additionally runs a `Spinner` while polling.

use chrono::Local;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Output line type for coloring
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputType {
    Info,
    Success,
    Error,
    Warning,
}

/// A single line of output
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub content: String,
    pub output_type: OutputType,
    pub timestamp: chrono::DateTime<Local>,
}

impl OutputLine {
    pub fn info(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            output_type: OutputType::Info,
            timestamp: Local::now(),
        }
    }

    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            output_type: OutputType::Success,
            timestamp: Local::now(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            output_type: OutputType::Error,
            timestamp: Local::now(),
        }
    }

    pub fn warning(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            output_type: OutputType::Warning,
            timestamp: Local::now(),
        }
    }
}

/// Send a line, ignoring a closed receiver (the UI may have gone away).
pub async fn emit(tx: &mpsc::Sender<OutputLine>, line: OutputLine) {
    let _ = tx.send(line).await;
}

/// Send a multi-line block as individual lines of one type.
pub async fn emit_block(tx: &mpsc::Sender<OutputLine>, content: &str, output_type: OutputType) {
    for line in content.lines() {
        let _ = tx
            .send(OutputLine {
                content: line.to_string(),
                output_type,
                timestamp: Local::now(),
            })
            .await;
    }
}

const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

struct SpinnerInner {
    stopped: bool,
    handle: Option<JoinHandle<()>>,
}

/// Terminal spinner that must stop exactly once on every exit path.
///
/// Both the owning scope (via `stop`/`Drop`) and the signal listener hold a
/// clone; the mutex plus the `stopped` flag make the two paths safe against
/// double-stop.
#[derive(Clone)]
pub struct Spinner {
    inner: Arc<Mutex<SpinnerInner>>,
    message: Arc<Mutex<String>>,
}

impl Spinner {
    /// Start the spinner. With `silent` no render task is spawned, but
    /// stop bookkeeping still works.
    pub fn start(message: impl Into<String>, silent: bool) -> Self {
        let message = Arc::new(Mutex::new(message.into()));
        let inner = Arc::new(Mutex::new(SpinnerInner {
            stopped: false,
            handle: None,
        }));

        if !silent {
            let msg = Arc::clone(&message);
            let handle = tokio::spawn(async move {
                let mut frame = 0usize;
                loop {
                    {
                        let text = msg.lock().map(|m| m.clone()).unwrap_or_default();
                        let mut stderr = std::io::stderr();
                        let _ = write!(
                            stderr,
                            "\r{} {}  ",
                            SPINNER_FRAMES[frame % SPINNER_FRAMES.len()],
                            text
                        );
                        let _ = stderr.flush();
                    }
                    frame += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            });
            if let Ok(mut guard) = inner.lock() {
                guard.handle = Some(handle);
            }
        }

        Self { inner, message }
    }

    /// Update the spinner message.
    pub fn set_message(&self, message: impl Into<String>) {
        if let Ok(mut guard) = self.message.lock() {
            *guard = message.into();
        }
    }

    /// Stop the spinner and clear the line. Safe to call more than once.
    pub fn stop(&self) {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.stopped {
            return;
        }
        guard.stopped = true;
        if let Some(handle) = guard.handle.take() {
            handle.abort();
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "\r\x1b[2K");
            let _ = stderr.flush();
        }
    }

    #[allow(dead_code)]
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().map(|g| g.stopped).unwrap_or(true)
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        // Last clone out turns off the light
        if Arc::strong_count(&self.inner) == 1 {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_silent_spinner_double_stop() {
        let spinner = Spinner::start("working", true);
        assert!(!spinner.is_stopped());
        spinner.stop();
        assert!(spinner.is_stopped());
        // Second stop is a no-op, not a panic
        spinner.stop();
        assert!(spinner.is_stopped());
    }

    #[tokio::test]
    async fn test_spinner_stop_from_clone() {
        let spinner = Spinner::start("working", true);
        let other = spinner.clone();
        other.stop();
        assert!(spinner.is_stopped());
    }

    #[tokio::test]
    async fn test_emit_ignores_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        emit(&tx, OutputLine::info("gone")).await;
    }

    #[test]
    fn test_output_line_constructors() {
        assert_eq!(OutputLine::info("x").output_type, OutputType::Info);
        assert_eq!(OutputLine::success("x").output_type, OutputType::Success);
        assert_eq!(OutputLine::error("x").output_type, OutputType::Error);
        assert_eq!(OutputLine::warning("x").output_type, OutputType::Warning);
    }
}
