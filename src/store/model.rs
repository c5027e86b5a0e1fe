//! Persistent data model: bulk jobs and the message log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::template::TemplateKind;

// ── Job lifecycle ───────────────────────────────────────────────────────

/// Bulk job lifecycle.
///
/// `Pending → Queued → Running → {Completed | Failed}`. Completed and Failed
/// are terminal; the store refuses writes that would leave a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, row count not yet known.
    Pending,
    /// Row count known, chunks about to be scheduled.
    Queued,
    /// All chunk tasks spawned.
    Running,
    /// Finalizer confirmed every row was attempted.
    Completed,
    /// Input unreadable, or dead chunks account for the remaining rows.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(()),
        }
    }
}

/// One bulk dispatch job.
///
/// Counters are monotonically non-decreasing and only ever mutated through
/// the store's atomic increment operations — batch workers never
/// read-modify-write this row.
#[derive(Debug, Clone, Serialize)]
pub struct BulkJob {
    pub job_id: Uuid,
    pub template: TemplateKind,
    /// Total input rows; `attempted <= total` at every instant.
    pub total: i64,
    /// Rows processed to completion (success or failure).
    pub attempted: i64,
    pub succeeded: i64,
    pub failed: i64,
    /// Rows in chunks that exhausted task-level retries. Counted apart from
    /// `failed` so the finalizer can tell a stuck job from a slow one.
    pub dead: i64,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Artifact key of the merged success report, once finalized.
    pub success_report: Option<String>,
    /// Artifact key of the merged failure report, once finalized.
    pub failed_report: Option<String>,
}

impl BulkJob {
    /// Fresh job in the Pending state.
    pub fn new(template: TemplateKind) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            template,
            total: 0,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            dead: 0,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            success_report: None,
            failed_report: None,
        }
    }

    /// Percentage of rows attempted, for the status surface.
    pub fn progress_percent(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        (self.attempted as f64 / self.total as f64 * 100.0 * 100.0).round() / 100.0
    }
}

// ── Message log ─────────────────────────────────────────────────────────

/// Direction of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "Sent",
            Direction::Received => "Received",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Sent" => Ok(Direction::Sent),
            "Received" => Ok(Direction::Received),
            _ => Err(()),
        }
    }
}

/// Content kind of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Interactive,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::Video => "video",
            ContentKind::Audio => "audio",
            ContentKind::Document => "document",
            ContentKind::Interactive => "interactive",
        }
    }

    /// Whether this kind carries a media payload.
    pub fn is_media(self) -> bool {
        matches!(
            self,
            ContentKind::Image | ContentKind::Video | ContentKind::Audio | ContentKind::Document
        )
    }
}

impl std::str::FromStr for ContentKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentKind::Text),
            "image" => Ok(ContentKind::Image),
            "video" => Ok(ContentKind::Video),
            "audio" => Ok(ContentKind::Audio),
            "document" => Ok(ContentKind::Document),
            "interactive" => Ok(ContentKind::Interactive),
            _ => Err(()),
        }
    }
}

/// Delivery status of a message log entry.
///
/// Outbound entries walk `Sent → Delivered → Read` (or end at `Failed`);
/// inbound entries are `Unread` until an agent marks the conversation read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStatus {
    Sent,
    Delivered,
    Read,
    Failed,
    Unread,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Sent => "Sent",
            LogStatus::Delivered => "Delivered",
            LogStatus::Read => "Read",
            LogStatus::Failed => "Failed",
            LogStatus::Unread => "Unread",
        }
    }
}

impl std::str::FromStr for LogStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Sent" => Ok(LogStatus::Sent),
            "Delivered" => Ok(LogStatus::Delivered),
            "Read" => Ok(LogStatus::Read),
            "Failed" => Ok(LogStatus::Failed),
            "Unread" => Ok(LogStatus::Unread),
            _ => Err(()),
        }
    }
}

/// One row of the append-only message log.
#[derive(Debug, Clone, Serialize)]
pub struct MessageLogEntry {
    pub id: Uuid,
    /// Canonical counterpart address.
    pub address: String,
    /// Customer profile name (inbound) or agent username (manual sends).
    pub contact_name: String,
    /// Template name for bulk sends, "manual" for agent sends, "incoming"
    /// for webhook messages.
    pub template: Option<String>,
    pub direction: Direction,
    pub content: ContentKind,
    pub body: String,
    /// Provider-assigned id; unique when present, used for webhook dedup.
    pub external_id: Option<String>,
    pub status: LogStatus,
    pub error: Option<String>,
    /// Storage reference for downloaded/uploaded media.
    pub media_ref: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl MessageLogEntry {
    /// Outbound entry in the Sent state (awaiting webhook confirmation).
    pub fn outbound(address: &str, body: &str, content: ContentKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.to_string(),
            contact_name: String::new(),
            template: None,
            direction: Direction::Sent,
            content,
            body: body.to_string(),
            external_id: None,
            status: LogStatus::Sent,
            error: None,
            media_ref: None,
            sent_at: Utc::now(),
        }
    }

    /// Inbound entry in the Unread state.
    pub fn inbound(address: &str, body: &str, content: ContentKind, external_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.to_string(),
            contact_name: String::new(),
            template: Some("incoming".to_string()),
            direction: Direction::Received,
            content,
            body: body.to_string(),
            external_id: Some(external_id.to_string()),
            status: LogStatus::Unread,
            error: None,
            media_ref: None,
            sent_at: Utc::now(),
        }
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    pub fn with_contact_name(mut self, name: &str) -> Self {
        self.contact_name = name.to_string();
        self
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.external_id = Some(external_id.to_string());
        self
    }

    pub fn failed(mut self, reason: &str) -> Self {
        self.status = LogStatus::Failed;
        self.error = Some(reason.to_string());
        self
    }
}

// ── Derived views ───────────────────────────────────────────────────────

/// Sidebar summary for one conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ContactSummary {
    pub address: String,
    pub last_time: Option<DateTime<Utc>>,
    pub last_body: String,
    pub last_direction: String,
    pub last_status: String,
    pub unread: i64,
}

/// One page of a conversation, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesPage {
    pub items: Vec<MessageLogEntry>,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
