//! The GitOps application reconciler.
//!
//! One-shot state machine: wait for the CD platform, discover the expected
//! application set, then poll application health until everything is
//! Healthy+Synced or the overall timeout fires. Repo-server failures are
//! detected and recovered along the way.

pub mod repo_server;
pub mod state;
pub mod stuck;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::commands::{CommandRunner, CommandSpec};
use crate::config::Timeouts;
use crate::diagnostics;
use crate::error::{Error, Result};
use crate::k8s::apps::{
    count_child_applications, AppStatus, APP_CRD_NAME, CD_NAMESPACE, CD_POD_SELECTOR, ROOT_APP,
};
use crate::k8s::{is_pod_ready, K8sClient};
use crate::ui::{emit, OutputLine, Spinner};
use repo_server::{
    check_repo_server_health, classify_condition, condition_indicates_repo_issue,
    recover_repo_server,
};
use state::{interval_due, ReconcilerState};

/// Cluster-connectivity failures tolerated before giving up.
const MAX_CLUSTER_FAILURES: u32 = 5;

/// Repo-server recoveries before the operator is advised instead.
const MAX_REPO_RECOVERIES: u32 = 3;

/// Polling errors that mean the cluster, not the application set, is the
/// problem.
const CONNECTIVITY_MARKERS: &[&str] = &[
    "connection refused",
    "cluster unreachable",
    "was refused",
    "Unable to connect",
    "WSL error",
];

fn is_connectivity_error(message: &str) -> bool {
    CONNECTIVITY_MARKERS.iter().any(|m| message.contains(m))
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dry_run: bool,
    pub silent: bool,
    pub verbose: bool,
    pub cluster_name: String,
    pub skip_crd_wait: bool,
    pub total_timeout: Duration,
    /// Effective deadline inherited from the caller, when it carries one.
    pub deadline: Option<Instant>,
}

impl RunConfig {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            dry_run: false,
            silent: false,
            verbose: false,
            cluster_name: cluster_name.into(),
            skip_crd_wait: false,
            total_timeout: Duration::from_secs(60 * 60),
            deadline: None,
        }
    }
}

pub struct Reconciler {
    client: K8sClient,
    runner: Arc<dyn CommandRunner>,
    run_config: RunConfig,
    timeouts: Timeouts,
    output_tx: mpsc::Sender<OutputLine>,
}

impl Reconciler {
    pub fn new(
        client: K8sClient,
        runner: Arc<dyn CommandRunner>,
        run_config: RunConfig,
        timeouts: Timeouts,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Self {
        Self {
            client,
            runner,
            run_config,
            timeouts,
            output_tx,
        }
    }

    fn context(&self) -> String {
        format!("k3d-{}", self.run_config.cluster_name)
    }

    /// Drive the rollout to completion.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        // Phase 0: short-circuits before any external call.
        if self.run_config.dry_run {
            emit(
                &self.output_tx,
                OutputLine::info("Dry run: skipping application reconciliation"),
            )
            .await;
            return Ok(());
        }
        if let Some(deadline) = self.run_config.deadline {
            if deadline.saturating_duration_since(Instant::now()) < Duration::from_secs(5) {
                return Err(Error::Cancelled);
            }
        }

        // Interrupts must cancel us even if the caller's token is slow to
        // propagate, and the spinner must die with them.
        let cancel = cancel.child_token();
        let spinner = Spinner::start("Waiting for applications...", self.run_config.silent);
        let signal_cancel = cancel.clone();
        let signal_spinner = spinner.clone();
        let signal_task = tokio::spawn(async move {
            wait_for_interrupt().await;
            signal_spinner.stop();
            signal_cancel.cancel();
        });

        let result = self.run_phases(&cancel, &spinner).await;

        spinner.stop();
        signal_task.abort();
        result
    }

    async fn run_phases(&mut self, cancel: &CancellationToken, spinner: &Spinner) -> Result<()> {
        let mut state = ReconcilerState::new(self.run_config.total_timeout);

        // Phase 1: CD-controller readiness.
        if !self.run_config.skip_crd_wait {
            self.wait_for_crd(cancel).await?;
        }
        self.wait_for_cd_pods(cancel).await?;

        // Phase 2: initial repo-server probe. Restarts during installation
        // mean the first manifest generations will fail; restart now while
        // no applications exist yet.
        match check_repo_server_health(&self.client).await {
            Ok(Some(issue)) if issue.recoverable && issue.message.contains("restarted") => {
                emit(
                    &self.output_tx,
                    OutputLine::warning(format!(
                        "Repo-server issue ({:?}): {}",
                        issue.kind, issue.message
                    )),
                )
                .await;
                let _ =
                    recover_repo_server(&self.client, None, &self.timeouts, &self.output_tx).await;
            }
            Ok(Some(issue)) if !issue.recoverable => {
                emit(
                    &self.output_tx,
                    OutputLine::warning(format!(
                        "Repo-server issue ({:?}): {}",
                        issue.kind, issue.message
                    )),
                )
                .await;
            }
            _ => {}
        }

        state.expected_app_count = self.discover_expected_count().await;
        if state.expected_app_count > 0 {
            emit(
                &self.output_tx,
                OutputLine::info(format!(
                    "Expecting {} applications",
                    state.expected_app_count
                )),
            )
            .await;
        }

        // Phase 3: bootstrap window, connectivity only.
        self.bootstrap_wait(cancel, &mut state).await?;

        // Phase 4: the main loop.
        self.main_loop(cancel, spinner, &mut state).await
    }

    async fn wait_for_crd(&self, cancel: &CancellationToken) -> Result<()> {
        emit(
            &self.output_tx,
            OutputLine::info(format!("Waiting for {} CRD...", APP_CRD_NAME)),
        )
        .await;

        for _ in 0..self.timeouts.crd_wait_retries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.client.crd_exists(APP_CRD_NAME).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => tracing::debug!(error = %e, "CRD check failed"),
            }
            sleep(self.timeouts.crd_wait_delay).await;
        }

        diagnostics::report_cd_pods_unready(&self.client, self.runner.as_ref(), &self.output_tx)
            .await;
        Err(Error::CrdTimeout(APP_CRD_NAME.to_string()))
    }

    async fn wait_for_cd_pods(&self, cancel: &CancellationToken) -> Result<()> {
        emit(
            &self.output_tx,
            OutputLine::info("Waiting for CD platform pods..."),
        )
        .await;

        let mut seen = false;
        for _ in 0..self.timeouts.pod_exists_retries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.client.list_pods(CD_NAMESPACE, Some(CD_POD_SELECTOR)).await {
                Ok(pods) if !pods.is_empty() => {
                    seen = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "CD pod listing failed"),
            }
            sleep(self.timeouts.pod_exists_delay).await;
        }
        if !seen {
            diagnostics::report_cd_pods_unready(
                &self.client,
                self.runner.as_ref(),
                &self.output_tx,
            )
            .await;
            return Err(Error::PodTimeout("no CD platform pods appeared".into()));
        }

        let deadline = Instant::now() + self.timeouts.pod_ready;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.client.list_pods(CD_NAMESPACE, Some(CD_POD_SELECTOR)).await {
                Ok(pods) if !pods.is_empty() && pods.iter().all(is_pod_ready) => {
                    emit(&self.output_tx, OutputLine::success("CD platform is ready")).await;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "CD pod readiness check failed"),
            }
            if Instant::now() >= deadline {
                diagnostics::report_cd_pods_unready(
                    &self.client,
                    self.runner.as_ref(),
                    &self.output_tx,
                )
                .await;
                return Err(Error::PodTimeout("CD platform pods never became ready".into()));
            }
            sleep(self.timeouts.pod_exists_delay).await;
        }
    }

    /// How many applications should the root app-of-apps produce?
    async fn discover_expected_count(&self) -> i64 {
        match self.client.get_application_json(CD_NAMESPACE, ROOT_APP).await {
            Ok(Some(app)) => {
                let count = count_child_applications(&app);
                if count >= 1 {
                    return count as i64;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Root application fetch failed, trying CLI mirror");
                if let Ok(count) = self.client.count_root_children_cli(CD_NAMESPACE).await {
                    if count >= 1 {
                        return count as i64;
                    }
                }
            }
        }

        if let Ok(apps) = self.client.list_applications(CD_NAMESPACE).await {
            let count = apps.iter().filter(|a| a.name != ROOT_APP).count();
            if count >= 1 {
                return count as i64;
            }
        }

        // Unknown; grow with observations
        0
    }

    async fn bootstrap_wait(
        &self,
        cancel: &CancellationToken,
        state: &mut ReconcilerState,
    ) -> Result<()> {
        let deadline = Instant::now() + self.timeouts.reconciler_bootstrap;
        let mut ticker = tokio::time::interval(Duration::from_millis(10));

        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            ticker.tick().await;

            if interval_due(
                &mut state.last_cluster_check,
                self.timeouts.bootstrap_probe_interval,
            ) {
                self.check_cluster_connectivity(cancel, state).await?;
            }
        }
        Ok(())
    }

    async fn main_loop(
        &mut self,
        cancel: &CancellationToken,
        spinner: &Spinner,
        state: &mut ReconcilerState,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_millis(10));

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            ticker.tick().await;

            if state.elapsed() >= state.total_timeout {
                emit(
                    &self.output_tx,
                    OutputLine::error("Reconciliation timed out"),
                )
                .await;
                return Err(Error::ReconcileTimeout {
                    minutes: state.total_timeout.as_secs() / 60,
                });
            }

            let connectivity_interval = if state.consecutive_cluster_failures > 0 {
                self.timeouts.connectivity_degraded_interval
            } else {
                self.timeouts.connectivity_interval
            };
            if interval_due(&mut state.last_cluster_check, connectivity_interval) {
                self.check_cluster_connectivity(cancel, state).await?;
            }

            if self.run_config.verbose
                && interval_due(
                    &mut state.last_resource_check,
                    self.timeouts.resource_log_interval,
                )
            {
                self.log_resource_status().await;
            }

            if interval_due(&mut state.last_poll, self.timeouts.app_poll_interval) {
                match self.poll_applications(cancel, spinner, state).await {
                    Ok(true) => {
                        emit(
                            &self.output_tx,
                            OutputLine::success(format!(
                                "All {} applications are Healthy and Synced",
                                state.effective_total()
                            )),
                        )
                        .await;
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) if e.is_cancellation() => return Err(Error::Cancelled),
                    Err(e) => {
                        let message = e.to_string();
                        if is_connectivity_error(&message) {
                            self.note_connectivity_failure(state).await?;
                        } else {
                            tracing::debug!(error = %message, "Application poll failed; retrying");
                        }
                    }
                }
            }
        }
    }

    /// One application poll. Returns true when the rollout is complete.
    async fn poll_applications(
        &mut self,
        cancel: &CancellationToken,
        spinner: &Spinner,
        state: &mut ReconcilerState,
    ) -> Result<bool> {
        let apps = self.client.list_applications(CD_NAMESPACE).await?;
        state.note_apps_seen(apps.len());

        // Repo-server symptom bookkeeping: count consecutive sightings,
        // forget applications whose condition cleared.
        for app in &apps {
            if condition_indicates_repo_issue(&app.condition_message) {
                *state.repo_issue_counts.entry(app.name.clone()).or_insert(0) += 1;
            } else {
                state.repo_issue_counts.remove(&app.name);
            }
        }

        let mut currently_ready = 0usize;
        let mut unready: Vec<String> = Vec::new();
        for app in &apps {
            if app.is_ready() {
                currently_ready += 1;
                state.mark_ever_ready(&app.name);
            } else {
                unready.push(format!("{} ({})", app.name, app.short_status()));
            }
        }

        let total = state.effective_total();
        if total > 0 && currently_ready == total {
            return Ok(true);
        }

        spinner.set_message(format!("{}/{} applications ready", currently_ready, total));

        if self.run_config.verbose
            && total > 0
            && interval_due(&mut state.last_progress_render, Duration::from_secs(10))
        {
            emit(
                &self.output_tx,
                OutputLine::info(format!("{}/{} applications ready", currently_ready, total)),
            )
            .await;
            for line in unready.iter().take(8) {
                emit(&self.output_tx, OutputLine::info(format!("  waiting: {}", line))).await;
            }
        }

        self.maybe_recover_repo_server(cancel, state, &apps).await;
        self.maybe_report_stuck(state, &apps).await;

        Ok(false)
    }

    /// Drive at most one repo-server recovery per poll cycle.
    async fn maybe_recover_repo_server(
        &mut self,
        cancel: &CancellationToken,
        state: &mut ReconcilerState,
        apps: &[AppStatus],
    ) {
        if cancel.is_cancelled() {
            return;
        }
        // Give the rollout a warm-up before blaming the repo-server
        if state.elapsed() <= self.timeouts.repo_diagnostic_interval {
            return;
        }
        if state.repo_recovery_attempts >= MAX_REPO_RECOVERIES {
            if state.repo_recovery_attempts == MAX_REPO_RECOVERIES {
                emit(
                    &self.output_tx,
                    OutputLine::warning(format!(
                        "{}; inspect the repo-server and its resource limits",
                        Error::RepoServerUnrecoverable {
                            attempts: MAX_REPO_RECOVERIES
                        }
                    )),
                )
                .await;
                // One past the maximum so the advice is not repeated
                state.repo_recovery_attempts = MAX_REPO_RECOVERIES + 1;
            }
            return;
        }

        let candidate = state
            .repo_issue_counts
            .iter()
            .find(|(_, count)| **count >= 2)
            .map(|(name, _)| name.clone());
        let name = match candidate {
            Some(name) => name,
            None => return,
        };

        let spaced_out = match state.last_repo_diagnostic {
            Some(last) => last.elapsed() >= self.timeouts.repo_diagnostic_interval,
            None => true,
        };
        if !spaced_out {
            return;
        }

        let family = apps
            .iter()
            .find(|a| a.name == name)
            .map(|a| classify_condition(&a.condition_message))
            .unwrap_or(repo_server::RepoIssueKind::Communication);
        emit(
            &self.output_tx,
            OutputLine::warning(format!(
                "{} shows repo-server symptoms ({:?}); attempting recovery ({}/{})",
                name,
                family,
                state.repo_recovery_attempts + 1,
                MAX_REPO_RECOVERIES
            )),
        )
        .await;

        match recover_repo_server(&self.client, Some(&name), &self.timeouts, &self.output_tx).await
        {
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Repo-server recovery failed"),
        }
        state.repo_recovery_attempts += 1;
        state.repo_issue_counts.insert(name, 0);
        state.last_repo_diagnostic = Some(Instant::now());
    }

    /// Stuck-application reporting past the activation thresholds.
    async fn maybe_report_stuck(&mut self, state: &mut ReconcilerState, apps: &[AppStatus]) {
        if state.elapsed() <= self.timeouts.stuck_after {
            return;
        }
        if !apps.iter().any(|a| a.is_unknown()) {
            return;
        }

        if interval_due(
            &mut state.last_stuck_report,
            self.timeouts.stuck_report_interval,
        ) {
            stuck::report_stuck_fields(apps, &self.output_tx).await;
        }

        if interval_due(&mut state.last_stuck_dump, self.timeouts.stuck_dump_interval) {
            let context = self.context();
            stuck::deep_dump(
                &self.client,
                self.runner.as_ref(),
                Some(&context),
                &self.output_tx,
            )
            .await;
        }

        if state.elapsed() > self.timeouts.workload_scan_after
            && interval_due(
                &mut state.last_workload_scan,
                self.timeouts.workload_scan_interval,
            )
        {
            stuck::workload_scan(&self.client, apps, &self.output_tx).await;
        }
    }

    async fn check_cluster_connectivity(
        &self,
        cancel: &CancellationToken,
        state: &mut ReconcilerState,
    ) -> Result<()> {
        let context = self.context();
        let result = self
            .runner
            .run(
                CommandSpec::new("kubectl", &["--context", &context, "cluster-info"])
                    .with_timeout(self.timeouts.connectivity_check_timeout)
                    .with_cancel(cancel.clone()),
            )
            .await;

        match result {
            Ok(out) if out.success() => {
                state.consecutive_cluster_failures = 0;
                Ok(())
            }
            Ok(_) => self.note_connectivity_failure(state).await,
            Err(e) if matches!(e, crate::error::CommandError::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                tracing::debug!(error = %e, "Connectivity check transport failure");
                self.note_connectivity_failure(state).await
            }
        }
    }

    async fn note_connectivity_failure(&self, state: &mut ReconcilerState) -> Result<()> {
        state.consecutive_cluster_failures += 1;
        let failures = state.consecutive_cluster_failures;
        tracing::warn!(failures, "Cluster connectivity check failed");

        // One subsystem revival before declaring the cluster gone
        if self.client.platform().is_windows() && failures == MAX_CLUSTER_FAILURES - 1 {
            self.runner.attempt_subsystem_recovery().await;
        }

        if failures >= MAX_CLUSTER_FAILURES {
            diagnostics::report_cluster_unreachable(
                self.runner.as_ref(),
                self.client.platform(),
                &self.run_config.cluster_name,
                6550,
                &self.output_tx,
            )
            .await;
            return Err(Error::ClusterUnreachable(format!(
                "{} consecutive connectivity failures",
                failures
            )));
        }

        // Back off so a dead endpoint is not hammered
        let backoff = self
            .timeouts
            .connectivity_degraded_interval
            .saturating_mul(failures)
            .min(self.timeouts.connectivity_interval);
        sleep(backoff).await;
        Ok(())
    }

    /// Verbose-only periodic resource snapshot.
    async fn log_resource_status(&self) {
        let context = self.context();
        for args in [
            vec!["--context", context.as_str(), "top", "nodes"],
            vec!["--context", context.as_str(), "-n", CD_NAMESPACE, "top", "pods"],
        ] {
            if let Ok(out) = self
                .runner
                .run(
                    CommandSpec::new("kubectl", &args)
                        .with_timeout(self.timeouts.connectivity_check_timeout),
                )
                .await
            {
                if out.success() && !out.stdout.trim().is_empty() {
                    crate::ui::emit_block(
                        &self.output_tx,
                        out.stdout.trim_end(),
                        crate::ui::OutputType::Info,
                    )
                    .await;
                }
            }
        }
    }
}

async fn wait_for_interrupt() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
