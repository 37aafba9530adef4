//! Re-dispatch of jobs that were recorded but never reached the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use narrate_core::{BackoffPolicy, JobId};

use crate::error::PipelineResult;
use crate::retry::with_store_retry;
use crate::store::PipelineStore;

use super::dispatcher::WorkDispatcher;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub dispatched: Vec<JobId>,
    pub still_degraded: Vec<JobId>,
}

pub struct Reconciler {
    store: Arc<dyn PipelineStore>,
    dispatcher: Arc<WorkDispatcher>,
    retry: BackoffPolicy,
    reconcile_after: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        dispatcher: Arc<WorkDispatcher>,
        retry: BackoffPolicy,
        reconcile_after: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            retry,
            reconcile_after,
        }
    }

    /// Dispatch every undispatched `pending` job idle for at least `reconcile_after`.
    #[instrument(skip(self), err)]
    pub async fn redispatch_stale(&self, now: DateTime<Utc>) -> PipelineResult<ReconcileReport> {
        let threshold = now
            - chrono::Duration::from_std(self.reconcile_after).unwrap_or(chrono::Duration::zero());
        let stale = with_store_retry(&self.retry, "list_undispatched", || {
            self.store.list_undispatched(threshold)
        })
        .await?;

        let mut report = ReconcileReport {
            examined: stale.len(),
            ..Default::default()
        };
        for job in &stale {
            let outcome = self.dispatcher.dispatch_existing(job).await;
            if outcome.degraded {
                report.still_degraded.push(job.id);
            } else {
                report.dispatched.push(job.id);
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                dispatched = report.dispatched.len(),
                still_degraded = report.still_degraded.len(),
                "reconciled undispatched jobs"
            );
        }
        Ok(report)
    }
}
