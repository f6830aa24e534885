//! Deployment coordinator
//!
//! Fans a request out over its target group according to the rollout
//! policy, aggregates host reports and runs rollbacks.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::executor::{rollback_host, EngineContext, HostExecutor, HostOutcome, HostReport};
use super::fsm::{HostDeploymentState, HostPhase, LifecycleEvent};
use super::history::{HistoryRecord, HistorySink};
use crate::models::deployment::{DeploymentRequest, HostId, LifecyclePhase};
use crate::models::result::{DeploymentResult, FailureReason, HostFailure, OverallStatus};

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Runs deployment requests against their target groups
pub struct Coordinator {
    ctx: EngineContext,
    history: Option<Arc<dyn HistorySink>>,
}

impl Coordinator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx, history: None }
    }

    pub fn with_history(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history = Some(sink);
        self
    }

    /// Deploy with no external cancellation
    pub async fn deploy(&self, request: impl Into<Arc<DeploymentRequest>>) -> DeploymentResult {
        self.deploy_with_cancel(request, CancellationToken::new()).await
    }

    /// Deploy until done or `cancel` fires.
    ///
    /// Host failures never surface as errors; they are attributed in the
    /// returned result.
    pub async fn deploy_with_cancel(
        &self,
        request: impl Into<Arc<DeploymentRequest>>,
        cancel: CancellationToken,
    ) -> DeploymentResult {
        let request = request.into();
        let span = info_span!(
            "deployment",
            id = %request.id(),
            policy = %request.config().policy
        );
        self.run(request, cancel).instrument(span).await
    }

    async fn run(&self, request: Arc<DeploymentRequest>, cancel: CancellationToken) -> DeploymentResult {
        let started_at = Utc::now();
        let policy = request.config().policy;
        info!(
            artifact = request.artifact_reference(),
            hosts = request.target_group().len(),
            "Starting deployment"
        );

        let isolated = self.ctx.runner.isolates_hosts();
        if !isolated && request.target_group().len() > 1 {
            warn!("Hook runner reaches a single machine, running host lifecycles one at a time");
        }

        let (tx, rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        let aggregator = tokio::spawn(aggregate(rx, self.history.clone(), request.id()));

        let mut halted = false;
        for batch in policy.batches(request.target_group()) {
            if halted {
                break;
            }
            let batch_ok = if isolated {
                self.run_batch(&request, batch, &cancel, &tx).await
            } else {
                let mut all_ok = true;
                for host in batch {
                    all_ok &= self.run_batch(&request, vec![host], &cancel, &tx).await;
                }
                all_ok
            };
            if !batch_ok && policy.halts_on_failure() {
                warn!("Batch failed, halting {} rollout", policy);
                halted = true;
            }
        }
        drop(tx);

        let mut outcomes = match aggregator.await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!("Report aggregator failed: {}", e);
                HashMap::new()
            }
        };

        let mut succeeded_hosts = Vec::new();
        let mut failed_hosts = Vec::new();
        let mut skipped_hosts = Vec::new();
        for host in request.target_group() {
            match outcomes.remove(host) {
                Some(HostOutcome::Succeeded) => succeeded_hosts.push(host.clone()),
                Some(HostOutcome::Failed(failure)) => failed_hosts.push(failure),
                Some(HostOutcome::NotStarted) | None => skipped_hosts.push(host.clone()),
            }
        }

        let mut overall_status = if halted {
            OverallStatus::Failed
        } else {
            OverallStatus::aggregate(
                succeeded_hosts.len(),
                failed_hosts.len() + skipped_hosts.len(),
            )
        };

        let mut rollbacks = Vec::new();
        if request.hooks().has_rollback() && !cancel.is_cancelled() {
            let full_rollback =
                request.config().rollback_on_failure && overall_status != OverallStatus::Succeeded;
            let targets = rollback_targets(&failed_hosts, &succeeded_hosts, full_rollback);

            if !targets.is_empty() {
                info!(hosts = targets.len(), "Running rollback hooks");
                if isolated {
                    rollbacks = join_all(targets.iter().map(|host| {
                        rollback_host(&self.ctx, &request, host)
                            .instrument(info_span!("rollback", host = %host))
                    }))
                    .await;
                } else {
                    for host in &targets {
                        let outcome = rollback_host(&self.ctx, &request, host)
                            .instrument(info_span!("rollback", host = %host))
                            .await;
                        rollbacks.push(outcome);
                    }
                }

                if full_rollback && rollbacks.iter().all(|r| r.succeeded) {
                    overall_status = OverallStatus::RolledBack;
                }
            }
        }

        let result = DeploymentResult {
            deployment_id: request.id(),
            artifact_reference: request.artifact_reference().to_string(),
            succeeded_hosts,
            failed_hosts,
            skipped_hosts,
            rollbacks,
            overall_status,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            status = %result.overall_status,
            succeeded = result.succeeded_hosts.len(),
            failed = result.failed_hosts.len(),
            skipped = result.skipped_hosts.len(),
            "Deployment finished"
        );
        if let Some(history) = &self.history {
            let record = HistoryRecord::Deployment {
                recorded_at: Utc::now(),
                result: result.clone(),
            };
            if let Err(e) = history.record(&record).await {
                warn!("Failed to write deployment result to history: {}", e);
            }
        }
        result
    }

    /// Run one batch in parallel; true when every host succeeded
    async fn run_batch(
        &self,
        request: &Arc<DeploymentRequest>,
        batch: Vec<HostId>,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<HostReport>,
    ) -> bool {
        let mut tasks = JoinSet::new();
        for host in batch {
            let (progress_tx, progress_rx) = watch::channel(HostDeploymentState::new(host.clone()));
            let executor = HostExecutor::new(self.ctx.clone(), request.clone(), host.clone(), cancel.clone())
                .with_progress(progress_tx);
            let tx = tx.clone();
            let span = info_span!("host", host = %host);

            tasks.spawn(
                async move {
                    let report = match AssertUnwindSafe(executor.execute()).catch_unwind().await {
                        Ok(report) => report,
                        Err(_) => {
                            error!("Host task panicked");
                            let last_state = progress_rx.borrow().clone();
                            panicked_report(last_state)
                        }
                    };
                    let succeeded = report.outcome == HostOutcome::Succeeded;
                    if tx.send(report).await.is_err() {
                        error!("Report channel closed");
                    }
                    succeeded
                }
                .instrument(span),
            );
        }

        let mut all_ok = true;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(succeeded) => all_ok &= succeeded,
                Err(e) => {
                    error!("Host task aborted: {}", e);
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}

/// Single writer for host reports: persists each state, keeps the outcome
async fn aggregate(
    mut rx: mpsc::Receiver<HostReport>,
    history: Option<Arc<dyn HistorySink>>,
    deployment_id: Uuid,
) -> HashMap<HostId, HostOutcome> {
    let mut outcomes = HashMap::new();
    while let Some(report) = rx.recv().await {
        if let Some(history) = &history {
            let record = HistoryRecord::Host {
                deployment_id,
                recorded_at: Utc::now(),
                state: report.state,
            };
            if let Err(e) = history.record(&record).await {
                warn!(host = %report.host, "Failed to write host history: {}", e);
            }
        }
        outcomes.insert(report.host, report.outcome);
    }
    outcomes
}

/// Hosts whose rollback hooks should run, in target order
fn rollback_targets(
    failed: &[HostFailure],
    succeeded: &[HostId],
    include_succeeded: bool,
) -> Vec<HostId> {
    let mut targets: Vec<HostId> = failed
        .iter()
        .filter(|f| f.reason != FailureReason::Cancelled)
        .map(|f| f.host.clone())
        .collect();
    if include_succeeded {
        targets.extend(succeeded.iter().cloned());
    }
    targets
}

/// Report for a host whose task panicked, attributed to the phase it was in
fn panicked_report(mut state: HostDeploymentState) -> HostReport {
    let host = state.host_id().clone();
    let phase = match state.current_phase() {
        HostPhase::Running(phase) => phase,
        _ => state
            .failed_phase()
            .or_else(|| state.entered_phases().last().copied())
            .unwrap_or(LifecyclePhase::BeforeInstall),
    };
    let reason = FailureReason::Internal {
        message: "host task panicked".to_string(),
    };
    if !state.current_phase().is_terminal() {
        if let Err(e) = state.process(LifecycleEvent::Fail {
            hook: None,
            reason: reason.clone(),
        }) {
            error!(host = %host, "Failed to record panic: {}", e);
        }
    }
    HostReport {
        outcome: HostOutcome::Failed(HostFailure {
            host: host.clone(),
            phase,
            hook: None,
            reason,
        }),
        state,
        host,
    }
}
