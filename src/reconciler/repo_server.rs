//! Repo-server failure detection and recovery.
//!
//! The manifest-generation sub-service can OOM or stall in constrained
//! environments; its failures surface as application condition messages.
//! Recovery is a pod delete plus a bounded health poll, optionally followed
//! by a refresh annotation on the affected application.

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::config::Timeouts;
use crate::error::Result;
use crate::k8s::apps::{CD_NAMESPACE, REFRESH_ANNOTATION, REPO_SERVER_SELECTOR};
use crate::k8s::K8sClient;
use crate::ui::{emit, OutputLine};

/// Condition-message substrings that implicate the repo-server.
const REPO_ISSUE_MARKERS: &[&str] = &[
    "EOF",
    "Unavailable",
    "error reading from server",
    "failed to generate manifest",
];

pub fn condition_indicates_repo_issue(message: &str) -> bool {
    !message.is_empty() && REPO_ISSUE_MARKERS.iter().any(|m| message.contains(m))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoIssueKind {
    Communication,
    Resource,
    Git,
    Timeout,
}

/// One observation from a health check. Transient; never stored.
#[derive(Debug, Clone)]
pub struct RepoServerIssue {
    pub kind: RepoIssueKind,
    pub message: String,
    pub recoverable: bool,
}

/// Tag a failing condition message with the failure family.
pub fn classify_condition(message: &str) -> RepoIssueKind {
    if message.contains("failed to generate manifest") {
        RepoIssueKind::Git
    } else if message.contains("deadline exceeded") || message.contains("timeout") {
        RepoIssueKind::Timeout
    } else {
        RepoIssueKind::Communication
    }
}

/// Inspect repo-server pods. None means healthy.
pub async fn check_repo_server_health(client: &K8sClient) -> Result<Option<RepoServerIssue>> {
    let pods = client
        .list_pods(CD_NAMESPACE, Some(REPO_SERVER_SELECTOR))
        .await?;
    Ok(assess_pods(&pods))
}

/// Pure assessment of a repo-server pod set.
///
/// OOMKilled is non-recoverable: a restart will run into the same memory
/// limit, so the operator is advised instead.
pub fn assess_pods(pods: &[Pod]) -> Option<RepoServerIssue> {
    for pod in pods {
        let name = pod.metadata.name.as_deref().unwrap_or("repo-server");
        let status = match &pod.status {
            Some(s) => s,
            None => continue,
        };

        let containers = status
            .container_statuses
            .as_deref()
            .unwrap_or(&[]);

        for cs in containers {
            let terminated_reason = cs
                .state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .and_then(|t| t.reason.as_deref());
            let last_terminated_reason = cs
                .last_state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .and_then(|t| t.reason.as_deref());
            if terminated_reason == Some("OOMKilled") || last_terminated_reason == Some("OOMKilled")
            {
                return Some(RepoServerIssue {
                    kind: RepoIssueKind::Resource,
                    message: format!(
                        "{} was OOM-killed; raise the repo-server memory limit",
                        name
                    ),
                    recoverable: false,
                });
            }
        }

        for cs in containers {
            let waiting_reason = cs
                .state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.as_deref());
            if waiting_reason == Some("CrashLoopBackOff") {
                return Some(RepoServerIssue {
                    kind: RepoIssueKind::Resource,
                    message: format!("{} is in CrashLoopBackOff", name),
                    recoverable: true,
                });
            }
            if cs.restart_count > 0 {
                return Some(RepoServerIssue {
                    kind: RepoIssueKind::Resource,
                    message: format!(
                        "{} restarted {} times",
                        name, cs.restart_count
                    ),
                    recoverable: true,
                });
            }
        }

        let phase = status.phase.as_deref().unwrap_or("");
        if phase != "Running" && phase != "Succeeded" {
            return Some(RepoServerIssue {
                kind: RepoIssueKind::Resource,
                message: format!("{} is {}", name, if phase.is_empty() { "phaseless" } else { phase }),
                recoverable: true,
            });
        }
    }
    None
}

/// Delete the repo-server pods and wait for a healthy replacement. When
/// `app_to_refresh` is set, the application is annotated for a normal
/// refresh once the repo-server is back.
pub async fn recover_repo_server(
    client: &K8sClient,
    app_to_refresh: Option<&str>,
    timeouts: &Timeouts,
    output_tx: &mpsc::Sender<OutputLine>,
) -> Result<bool> {
    emit(
        output_tx,
        OutputLine::warning("Restarting repo-server pods..."),
    )
    .await;

    client
        .delete_pods_by_label(CD_NAMESPACE, REPO_SERVER_SELECTOR)
        .await?;

    for _ in 0..timeouts.repo_recovery_retries {
        sleep(timeouts.repo_recovery_delay).await;
        match check_repo_server_health(client).await {
            Ok(None) => {
                if let Some(app) = app_to_refresh {
                    if let Err(e) = client
                        .annotate_application(CD_NAMESPACE, app, REFRESH_ANNOTATION, "normal")
                        .await
                    {
                        tracing::warn!(app = %app, error = %e, "Refresh annotation failed");
                    }
                }
                emit(output_tx, OutputLine::success("Repo-server recovered")).await;
                return Ok(true);
            }
            Ok(Some(issue)) => {
                tracing::debug!(message = %issue.message, "Repo-server still unhealthy");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Repo-server health check failed during recovery");
            }
        }
    }

    emit(
        output_tx,
        OutputLine::warning("Repo-server did not become healthy within the recovery window"),
    )
    .await;
    Ok(false)
}
