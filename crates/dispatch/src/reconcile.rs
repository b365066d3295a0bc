//! Periodic reconciliation sweeps.
//!
//! Three passes run on the same interval: approval-gate timeouts, stale
//! executions whose workflow session died, and overdue proposals. Each
//! pass is independent; a failure in one is logged and the others still
//! run.

use crate::model::ExecutionStatus;
use crate::store::DispatchStore;
use berth_core::error::PlatformResult;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub approvals_timed_out: u32,
    pub stale_failed: u32,
    pub proposals_expired: u32,
}

#[derive(Clone)]
pub struct Reconciler {
    store: DispatchStore,
    /// Approval TTL when the workflow does not configure one, seconds.
    default_approval_ttl_secs: u64,
}

impl Reconciler {
    pub fn new(store: DispatchStore, default_approval_ttl_secs: u64) -> Self {
        Reconciler {
            store,
            default_approval_ttl_secs,
        }
    }

    /// One full sweep. Returns what changed, for logging and tests.
    pub async fn sweep(&self, now: OffsetDateTime) -> PlatformResult<SweepReport> {
        let mut report = SweepReport::default();

        match self.sweep_approval_timeouts(now).await {
            Ok(n) => report.approvals_timed_out = n,
            Err(e) => log::error!("reconciler: approval sweep failed: {e}"),
        }
        match self.sweep_stale_executions().await {
            Ok(n) => report.stale_failed = n,
            Err(e) => log::error!("reconciler: stale sweep failed: {e}"),
        }
        match self.store.proposals.expire_overdue(now).await {
            Ok(n) => report.proposals_expired = n,
            Err(e) => log::error!("reconciler: proposal sweep failed: {e}"),
        }

        if report != SweepReport::default() {
            log::info!(
                "reconciler: {} approvals timed out, {} stale failed, {} proposals expired",
                report.approvals_timed_out,
                report.stale_failed,
                report.proposals_expired
            );
        }
        Ok(report)
    }

    /// Executions waiting for approval longer than their workflow's TTL
    /// are finalized as failed, with the resume token cleared.
    async fn sweep_approval_timeouts(&self, now: OffsetDateTime) -> PlatformResult<u32> {
        let waiting = self.store.executions.list_waiting_approval().await?;
        let mut timed_out = 0;
        for execution in waiting {
            let ttl = match self.store.workflows.get(&execution.workflow_id).await? {
                Some(workflow) => workflow.approval_ttl_secs(self.default_approval_ttl_secs),
                None => self.default_approval_ttl_secs,
            };
            let deadline = execution.started_at + time::Duration::seconds(ttl as i64);
            if now <= deadline {
                continue;
            }
            if self
                .store
                .executions
                .finalize(
                    &execution.id,
                    ExecutionStatus::Failed,
                    Some("approval timeout"),
                    None,
                )
                .await?
            {
                timed_out += 1;
            }
        }
        Ok(timed_out)
    }

    /// Non-terminal executions joined to dead workflow sessions are
    /// finalized as failed with a reason naming the session status.
    async fn sweep_stale_executions(&self) -> PlatformResult<u32> {
        let stale = self.store.executions.list_stale().await?;
        let mut failed = 0;
        for (execution, session_status) in stale {
            let reason = format!("workflow session is {session_status}");
            if self
                .store
                .executions
                .finalize(&execution.id, ExecutionStatus::Failed, Some(&reason), None)
                .await?
            {
                failed += 1;
            }
        }
        Ok(failed)
    }
}

/// Run the reconciler forever on an interval (spawned by the service).
pub async fn run_reconcile_loop(reconciler: Reconciler, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = reconciler.sweep(OffsetDateTime::now_utc()).await {
            log::error!("reconciler sweep errored: {e}");
        }
    }
}
