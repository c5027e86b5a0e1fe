//! Unified `Store` trait — single async interface for all persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::model::{
    BulkJob, ContactSummary, JobStatus, LogStatus, MessageLogEntry, MessagesPage,
};

/// Backend-agnostic persistence for bulk jobs and the message log.
///
/// Counter mutations are expressed as increments, never as writes of
/// absolute values — many batch workers bump the same job row concurrently
/// and the backend must apply each delta atomically.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new bulk job.
    async fn insert_job(&self, job: &BulkJob) -> Result<(), DatabaseError>;

    /// Fetch a job by id.
    async fn get_job(&self, job_id: Uuid) -> Result<Option<BulkJob>, DatabaseError>;

    /// Set the job's total row count (known after the first source read).
    async fn set_job_total(&self, job_id: Uuid, total: i64) -> Result<(), DatabaseError>;

    /// Transition a job's lifecycle status.
    ///
    /// Terminal states are write-protected: transitioning a Completed or
    /// Failed job is an error. Entering a terminal state stamps
    /// `completed_at`.
    async fn update_job_status(&self, job_id: Uuid, status: JobStatus)
    -> Result<(), DatabaseError>;

    /// Atomically add a chunk's tallies to the job counters.
    async fn add_job_counters(
        &self,
        job_id: Uuid,
        attempted: i64,
        succeeded: i64,
        failed: i64,
    ) -> Result<(), DatabaseError>;

    /// Atomically add rows lost to an exhausted chunk to the dead counter.
    async fn add_dead_rows(&self, job_id: Uuid, rows: i64) -> Result<(), DatabaseError>;

    /// Record the merged report artifact keys.
    async fn set_job_reports(
        &self,
        job_id: Uuid,
        success_report: Option<&str>,
        failed_report: Option<&str>,
    ) -> Result<(), DatabaseError>;

    // ── Message log ─────────────────────────────────────────────────

    /// Append a message log entry. A duplicate external id is a constraint
    /// violation.
    async fn insert_log(&self, entry: &MessageLogEntry) -> Result<(), DatabaseError>;

    /// Look up an entry by its provider-assigned id.
    async fn get_log_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<MessageLogEntry>, DatabaseError>;

    /// Whether any entry carries this external id (webhook dedup).
    async fn has_external_id(&self, external_id: &str) -> Result<bool, DatabaseError>;

    /// Conditionally transition an entry's status by external id.
    ///
    /// The update applies only while the current status is one of
    /// `allowed_current`; the condition is evaluated inside the UPDATE so
    /// concurrent receipts cannot interleave a downgrade. Returns whether a
    /// row changed.
    async fn apply_receipt_status(
        &self,
        external_id: &str,
        status: LogStatus,
        allowed_current: &[LogStatus],
    ) -> Result<bool, DatabaseError>;

    /// Attach provider-reported error detail to an entry.
    async fn set_log_error(&self, external_id: &str, error: &str) -> Result<(), DatabaseError>;

    /// Attach a stored media reference after async download.
    async fn attach_media(&self, id: Uuid, media_ref: &str) -> Result<(), DatabaseError>;

    /// Bulk Received+Unread → Read for one address. Returns rows changed.
    async fn mark_read(&self, address: &str) -> Result<u64, DatabaseError>;

    // ── Derived views ───────────────────────────────────────────────

    /// Conversation sidebar, most recent first. `q` searches by digit
    /// substring of the address or body substring.
    async fn contacts(&self, q: &str) -> Result<Vec<ContactSummary>, DatabaseError>;

    /// One chronological page of a conversation (1-based page, clamped into
    /// range).
    async fn messages_page(
        &self,
        address: &str,
        page: usize,
        page_size: usize,
    ) -> Result<MessagesPage, DatabaseError>;
}
