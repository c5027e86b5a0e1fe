//! Finalizer: polls for job convergence and performs terminal bookkeeping.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::{ReportKind, ReportRow, final_key};
use crate::job::JobEngine;
use crate::store::model::JobStatus;

impl JobEngine {
    /// Poll until every row is accounted for, then merge partial reports
    /// and set the terminal state.
    ///
    /// Chunk completion order is not guaranteed and workers do not signal
    /// the finalizer directly, so convergence is detected from the
    /// counters. Rows parked in the dead counter terminate the job as
    /// Failed instead of letting it poll forever.
    pub(crate) async fn finalize(self: Arc<Self>, job_id: Uuid) {
        loop {
            tokio::time::sleep(self.config.finalize_poll_delay).await;

            let job = match self.store.get_job(job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(job_id = %job_id, "Job vanished, finalizer exiting");
                    return;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Finalizer poll failed");
                    continue;
                }
            };

            if job.status.is_terminal() {
                return;
            }

            if job.attempted >= job.total {
                self.complete(job_id, JobStatus::Completed).await;
                return;
            }

            if job.dead > 0 && job.attempted + job.dead >= job.total {
                warn!(
                    job_id = %job_id,
                    attempted = job.attempted,
                    dead = job.dead,
                    total = job.total,
                    "Dead chunks account for remaining rows, failing job"
                );
                self.complete(job_id, JobStatus::Failed).await;
                return;
            }
        }
    }

    /// Merge chunk reports, record their keys, and set the terminal state.
    async fn complete(&self, job_id: Uuid, status: JobStatus) {
        let success_key = self.merge_reports(job_id, ReportKind::Success).await;
        let failed_key = self.merge_reports(job_id, ReportKind::Failed).await;

        if success_key.is_some() || failed_key.is_some() {
            if let Err(e) = self
                .store
                .set_job_reports(job_id, success_key.as_deref(), failed_key.as_deref())
                .await
            {
                error!(job_id = %job_id, error = %e, "Failed to record report keys");
            }
        }

        match self.store.update_job_status(job_id, status).await {
            Ok(()) => info!(job_id = %job_id, status = status.as_str(), "Job finalized"),
            Err(e) => error!(job_id = %job_id, error = %e, "Terminal transition failed"),
        }
    }

    /// Concatenate every chunk report of one kind into the final artifact.
    ///
    /// Chunk keys are chunk-scoped and overwritten on worker re-runs, so
    /// merging is idempotent; re-running the merge simply rewrites the
    /// final artifact from the same inputs.
    async fn merge_reports(&self, job_id: Uuid, kind: ReportKind) -> Option<String> {
        let prefix = format!("{}_{job_id}_", kind.as_str());
        let keys = match self.artifacts.list(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Report listing failed");
                return None;
            }
        };
        if keys.is_empty() {
            return None;
        }

        // Merge in chunk order: keys sort lexicographically, so order by
        // the numeric start offset parsed back out of the key.
        let mut ordered: Vec<(usize, String)> = keys
            .into_iter()
            .map(|key| (chunk_start_of(&key).unwrap_or(usize::MAX), key))
            .collect();
        ordered.sort();

        let mut merged: Vec<ReportRow> = Vec::new();
        for (_, key) in &ordered {
            match self.artifacts.read_rows(key).await {
                Ok(rows) => merged.extend(rows),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable chunk report"),
            }
        }

        let final_key = final_key(kind, job_id);
        match self.artifacts.put(&final_key, kind, &merged).await {
            Ok(()) => Some(final_key),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Final report write failed");
                None
            }
        }
    }
}

/// Parse the chunk start offset out of `kind_{job}_{start}_{end}.csv`.
fn chunk_start_of(key: &str) -> Option<usize> {
    let stem = key.strip_suffix(".csv")?;
    let mut parts = stem.rsplit('_');
    let _end = parts.next()?;
    parts.next()?.parse().ok()
}
