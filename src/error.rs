//! Typed error taxonomy for the library core.
//!
//! The binary layers anyhow on top of these; the library itself never calls
//! `process::exit` and never panics on expected failure paths.

use thiserror::Error;

/// Transport-level failures from the command executor.
///
/// A non-zero exit code is NOT a transport error; it is reported through
/// `CommandOutput::exit_code` with captured streams, and callers decide
/// whether it is fatal.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {seconds}s")]
    TimedOut { program: String, seconds: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

/// Top-level error type returned by the provisioner and the reconciler.
#[derive(Debug, Error)]
pub enum Error {
    /// Cluster configuration failed validation.
    #[error("invalid cluster config: {0}")]
    InvalidConfig(String),

    /// The requested cluster type has no provisioner.
    #[error("no provider for cluster type {0:?}")]
    ProviderNotFound(String),

    /// The cluster-runtime CLI exited non-zero or the invocation failed.
    #[error("k3d {operation} failed: {detail}")]
    RuntimeCli { operation: String, detail: String },

    /// TCP probe or node-list retries exhausted.
    #[error("cluster unreachable: {0}")]
    ClusterUnreachable(String),

    /// The applications CRD never appeared.
    #[error("timed out waiting for {0} CRD")]
    CrdTimeout(String),

    /// CD-controller pods never became ready.
    #[error("timed out waiting for pods: {0}")]
    PodTimeout(String),

    /// The overall reconciliation cap was hit.
    #[error("reconciliation did not complete within {minutes} minutes")]
    ReconcileTimeout { minutes: u64 },

    /// All repo-server recovery attempts were spent. Surfaced as a warning;
    /// the reconciler keeps running until the overall timeout.
    #[error("repo-server did not recover after {attempts} attempts")]
    RepoServerUnrecoverable { attempts: u32 },

    /// Context cancelled or interrupt signal received.
    #[error("operation cancelled")]
    Cancelled,

    /// Internal transport categorisation; always classified by the layer
    /// above before reaching the public API.
    #[error(transparent)]
    Transport(#[from] CommandError),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Pass-through for failures with no dedicated classification: daemon
    /// API errors, parse failures, remediation scripts. Callers treat these
    /// as retryable or log-and-continue, never as a typed decision point.
    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this error came from cancellation rather than failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Cancelled | Error::Transport(CommandError::Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_cancellation_classifies() {
        let err: Error = CommandError::Cancelled.into();
        assert!(err.is_cancellation());
        assert!(Error::Cancelled.is_cancellation());
        assert!(!Error::InvalidConfig("x".into()).is_cancellation());
        assert!(!Error::Other("x".into()).is_cancellation());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::ReconcileTimeout { minutes: 60 };
        assert!(err.to_string().contains("60 minutes"));

        let err = Error::RuntimeCli {
            operation: "cluster create".into(),
            detail: "exit status 1".into(),
        };
        assert!(err.to_string().contains("cluster create"));
        assert!(err.to_string().contains("exit status 1"));

        let err = Error::RepoServerUnrecoverable { attempts: 3 };
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_transport_is_transparent() {
        let err: Error = CommandError::TimedOut {
            program: "k3d".into(),
            seconds: 300,
        }
        .into();
        assert!(err.to_string().contains("k3d timed out after 300s"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
