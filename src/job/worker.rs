//! Batch worker: processes one contiguous chunk of a job's rows.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::address::canonical_address;
use crate::artifacts::{ReportKind, ReportRow, chunk_key};
use crate::job::JobEngine;
use crate::source::{Row, RowSource};
use crate::store::model::{ContentKind, MessageLogEntry};
use crate::template::{self, TemplateKind, row_address, row_customer_name};

/// Base delay for whole-chunk retries.
const CHUNK_RETRY_BASE: Duration = Duration::from_secs(2);

/// Per-chunk success/failure tallies.
#[derive(Default)]
struct ChunkTally {
    success: Vec<ReportRow>,
    failed: Vec<ReportRow>,
}

impl JobEngine {
    /// Run one chunk, retrying whole-chunk input failures with backoff.
    ///
    /// A row that fails validation, rendering, or sending degrades to a
    /// Failed log entry and the chunk continues; only a failure to read the
    /// row slice itself retries the chunk. Exhausting those retries moves
    /// the chunk's rows into the job's dead counter — attempted/succeeded/
    /// failed stay untouched so the stuck state is visible.
    pub(crate) async fn run_chunk_with_retry(
        self: Arc<Self>,
        source: Arc<dyn RowSource>,
        template: TemplateKind,
        job_id: Uuid,
        start: usize,
        end: usize,
    ) {
        info!(job_id = %job_id, start, end, "Chunk started");

        let mut last_error = String::new();
        for attempt in 0..=self.config.chunk_max_retries {
            if attempt > 0 {
                let backoff = CHUNK_RETRY_BASE * 2u32.saturating_pow(attempt - 1);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                tokio::time::sleep(backoff + jitter).await;
            }

            match source.read_slice(start, end).await {
                Ok(rows) => {
                    self.process_rows(template, job_id, start, end, rows).await;
                    info!(job_id = %job_id, start, end, "Chunk done");
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        job_id = %job_id, start, end, attempt,
                        error = %last_error, "Chunk slice read failed"
                    );
                }
            }
        }

        error!(
            job_id = %job_id, start, end,
            attempts = self.config.chunk_max_retries + 1,
            error = %last_error,
            "Chunk exhausted retries, marking rows dead"
        );
        if let Err(e) = self
            .store
            .add_dead_rows(job_id, (end - start) as i64)
            .await
        {
            error!(job_id = %job_id, error = %e, "Failed to record dead rows");
        }
    }

    /// Validate, render, send, and log every row, then apply the chunk's
    /// tallies in one atomic counter update and persist partial reports.
    async fn process_rows(
        &self,
        template: TemplateKind,
        job_id: Uuid,
        start: usize,
        end: usize,
        rows: Vec<Row>,
    ) {
        // One template-body fetch per chunk; a missing body fails the rows
        // at render time rather than aborting the chunk.
        let body = match self
            .transport
            .fetch_template_body(template.provider_name())
            .await
        {
            Ok(Some(body)) => body,
            Ok(None) => {
                warn!(job_id = %job_id, template = %template, "Template body not found");
                String::new()
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Template body fetch failed");
                String::new()
            }
        };

        let mut tally = ChunkTally::default();

        for row in &rows {
            self.process_row(template, &body, row, &mut tally).await;
            tokio::time::sleep(self.config.per_row_delay).await;
        }

        let success = tally.success.len() as i64;
        let failed = tally.failed.len() as i64;
        if let Err(e) = self
            .store
            .add_job_counters(job_id, success + failed, success, failed)
            .await
        {
            error!(job_id = %job_id, error = %e, "Counter update failed");
        }

        self.save_partial(job_id, start, end, ReportKind::Success, &tally.success)
            .await;
        self.save_partial(job_id, start, end, ReportKind::Failed, &tally.failed)
            .await;
    }

    async fn process_row(
        &self,
        template: TemplateKind,
        body: &str,
        row: &Row,
        tally: &mut ChunkTally,
    ) {
        let name = row_customer_name(row);
        let raw_mobile = row_address(row);
        let mobile = canonical_address(&raw_mobile);

        // 1. Number pre-check (fail-open inside the transport)
        let check = self.transport.check_number(&mobile).await;
        if !check.valid {
            self.log_row_failure(template, &name, &mobile, &check.reason, tally)
                .await;
            return;
        }

        // 2. Render
        let rendered = match template::render(template, body, row, &raw_mobile) {
            Ok(rendered) => rendered,
            Err(e) => {
                self.log_row_failure(template, &name, &mobile, &e.to_string(), tally)
                    .await;
                return;
            }
        };

        // 3. Send (transport handles its own bounded retries)
        match self
            .transport
            .send_template(&mobile, &rendered.payload)
            .await
        {
            Ok(receipt) => {
                let entry = MessageLogEntry::outbound(&mobile, &rendered.preview, ContentKind::Text)
                    .with_template(template.key())
                    .with_contact_name(&name)
                    .with_external_id(&receipt.external_id);
                if let Err(e) = self.store.insert_log(&entry).await {
                    warn!(error = %e, external_id = %receipt.external_id, "Send log insert failed");
                }
                tally
                    .success
                    .push(ReportRow::new(&name, &mobile, &receipt.external_id));
                debug!(mobile = %mobile, external_id = %receipt.external_id, "Row sent");
            }
            Err(e) => {
                self.log_row_failure(template, &name, &mobile, &e.to_string(), tally)
                    .await;
            }
        }
    }

    async fn log_row_failure(
        &self,
        template: TemplateKind,
        name: &str,
        mobile: &str,
        reason: &str,
        tally: &mut ChunkTally,
    ) {
        let entry = MessageLogEntry::outbound(mobile, "", ContentKind::Text)
            .with_template(template.key())
            .with_contact_name(name)
            .failed(reason);
        if let Err(e) = self.store.insert_log(&entry).await {
            warn!(error = %e, mobile = %mobile, "Failure log insert failed");
        }
        tally.failed.push(ReportRow::new(name, mobile, reason));
        debug!(mobile = %mobile, reason = %reason, "Row failed");
    }

    async fn save_partial(
        &self,
        job_id: Uuid,
        start: usize,
        end: usize,
        kind: ReportKind,
        rows: &[ReportRow],
    ) {
        if rows.is_empty() {
            return;
        }
        let key = chunk_key(kind, job_id, start, end);
        if let Err(e) = self.artifacts.put(&key, kind, rows).await {
            warn!(job_id = %job_id, key = %key, error = %e, "Partial report write failed");
        }
    }
}
