//! Job orchestration: submission, chunk scheduling, lifecycle transitions.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{JobEngine, chunk_ranges};
use crate::source::RowSource;
use crate::store::model::{BulkJob, JobStatus};
use crate::template::TemplateKind;

impl JobEngine {
    /// Submit a bulk job.
    ///
    /// Validates the template's required columns against the source header
    /// up front — a bad submission never creates a job. Returns once the
    /// job row exists; chunk scheduling continues asynchronously.
    pub async fn submit(
        self: &Arc<Self>,
        source: Arc<dyn RowSource>,
        template: TemplateKind,
    ) -> Result<Uuid> {
        let header = source.header().await?;
        template.validate_header(&header)?;

        let job = BulkJob::new(template);
        let job_id = job.job_id;
        self.store.insert_job(&job).await?;

        info!(job_id = %job_id, template = %template, source = source.locator(), "Bulk job submitted");

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.orchestrate(source, template, job_id).await;
        });

        Ok(job_id)
    }

    /// Read the source, schedule one worker per chunk, then the finalizer.
    async fn orchestrate(
        self: Arc<Self>,
        source: Arc<dyn RowSource>,
        template: TemplateKind,
        job_id: Uuid,
    ) {
        if let Err(e) = self.store.update_job_status(job_id, JobStatus::Queued).await {
            warn!(job_id = %job_id, error = %e, "Failed to mark job queued");
        }

        let rows = match source.read_all().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Row source unreadable, failing job");
                if let Err(e) = self.store.update_job_status(job_id, JobStatus::Failed).await {
                    warn!(job_id = %job_id, error = %e, "Failed to mark job failed");
                }
                return;
            }
        };

        let total = rows.len();
        if let Err(e) = self.store.set_job_total(job_id, total as i64).await {
            warn!(job_id = %job_id, error = %e, "Failed to record job total");
        }

        if total == 0 {
            info!(job_id = %job_id, "Zero-row job, completing immediately");
            if let Err(e) = self
                .store
                .update_job_status(job_id, JobStatus::Completed)
                .await
            {
                warn!(job_id = %job_id, error = %e, "Failed to complete empty job");
            }
            return;
        }

        let ranges = chunk_ranges(total, self.config.chunk_size);
        info!(job_id = %job_id, total, chunks = ranges.len(), "Scheduling chunks");

        for (start, end) in ranges {
            let engine = Arc::clone(&self);
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                engine
                    .run_chunk_with_retry(source, template, job_id, start, end)
                    .await;
            });
        }

        if let Err(e) = self.store.update_job_status(job_id, JobStatus::Running).await {
            warn!(job_id = %job_id, error = %e, "Failed to mark job running");
        }

        let engine = Arc::clone(&self);
        tokio::spawn(async move {
            engine.finalize(job_id).await;
        });
    }
}
