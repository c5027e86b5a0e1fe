//! libSQL backend — async `Store` trait implementation.
//!
//! Counter bumps are single `SET x = x + ?` statements so concurrent chunk
//! completions from the same job never lose updates, and the receipt status
//! guard is part of the UPDATE's WHERE clause so stale webhook events cannot
//! downgrade an entry between a read and a write.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::address::digits_only;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    BulkJob, ContactSummary, Direction, JobStatus, LogStatus, MessageLogEntry, MessagesPage,
};
use crate::store::traits::Store;
use crate::template::TemplateKind;

/// libSQL store.
///
/// Holds a single connection reused for all operations;
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

const JOB_COLUMNS: &str = "job_id, template, total, attempted, succeeded, failed, dead, \
                           status, started_at, completed_at, success_report, failed_report";

fn row_to_job(row: &libsql::Row) -> Result<BulkJob, libsql::Error> {
    let job_id_str: String = row.get(0)?;
    let template_str: String = row.get(1)?;
    let status_str: String = row.get(7)?;
    let started_str: String = row.get(8)?;
    let completed_str: Option<String> = row.get::<String>(9).ok();

    Ok(BulkJob {
        job_id: Uuid::parse_str(&job_id_str).unwrap_or_else(|_| Uuid::nil()),
        template: template_str
            .parse::<TemplateKind>()
            .unwrap_or(TemplateKind::Welcome),
        total: row.get(2)?,
        attempted: row.get(3)?,
        succeeded: row.get(4)?,
        failed: row.get(5)?,
        dead: row.get(6)?,
        status: status_str.parse().unwrap_or(JobStatus::Pending),
        started_at: parse_datetime(&started_str),
        completed_at: completed_str.map(|s| parse_datetime(&s)),
        success_report: row.get::<String>(10).ok(),
        failed_report: row.get::<String>(11).ok(),
    })
}

const LOG_COLUMNS: &str = "id, address, contact_name, template, direction, content, body, \
                           external_id, status, error, media_ref, sent_at";

fn row_to_log(row: &libsql::Row) -> Result<MessageLogEntry, libsql::Error> {
    let id_str: String = row.get(0)?;
    let direction_str: String = row.get(4)?;
    let content_str: String = row.get(5)?;
    let status_str: String = row.get(8)?;
    let sent_str: String = row.get(11)?;

    Ok(MessageLogEntry {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        address: row.get(1)?,
        contact_name: row.get(2)?,
        template: row.get::<String>(3).ok(),
        direction: direction_str.parse().unwrap_or(Direction::Sent),
        content: content_str
            .parse()
            .unwrap_or(crate::store::model::ContentKind::Text),
        body: row.get(6)?,
        external_id: row.get::<String>(7).ok(),
        status: status_str.parse().unwrap_or(LogStatus::Failed),
        error: row.get::<String>(9).ok(),
        media_ref: row.get::<String>(10).ok(),
        sent_at: parse_datetime(&sent_str),
    })
}

fn query_err(e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &BulkJob) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO bulk_jobs (job_id, template, total, attempted, succeeded, failed, \
                 dead, status, started_at, completed_at, success_report, failed_report)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    job.job_id.to_string(),
                    job.template.key(),
                    job.total,
                    job.attempted,
                    job.succeeded,
                    job.failed,
                    job.dead,
                    job.status.as_str(),
                    job.started_at.to_rfc3339(),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.success_report.clone(),
                    job.failed_report.clone(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<BulkJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM bulk_jobs WHERE job_id = ?1"),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_job(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn set_job_total(&self, job_id: Uuid, total: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE bulk_jobs SET total = ?1 WHERE job_id = ?2",
                params![total, job_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> Result<(), DatabaseError> {
        // Terminal states are write-protected inside the UPDATE itself.
        let affected = if status.is_terminal() {
            self.conn()
                .execute(
                    "UPDATE bulk_jobs SET status = ?1, completed_at = ?2
                     WHERE job_id = ?3 AND status NOT IN ('completed', 'failed')",
                    params![
                        status.as_str(),
                        Utc::now().to_rfc3339(),
                        job_id.to_string()
                    ],
                )
                .await
                .map_err(query_err)?
        } else {
            self.conn()
                .execute(
                    "UPDATE bulk_jobs SET status = ?1
                     WHERE job_id = ?2 AND status NOT IN ('completed', 'failed')",
                    params![status.as_str(), job_id.to_string()],
                )
                .await
                .map_err(query_err)?
        };

        if affected == 0 {
            // Distinguish a missing job from a terminal-state write.
            return match self.get_job(job_id).await? {
                Some(job) => Err(DatabaseError::Constraint(format!(
                    "job {job_id} is terminal ({}), refusing transition to {}",
                    job.status.as_str(),
                    status.as_str()
                ))),
                None => Err(DatabaseError::NotFound {
                    entity: "bulk_job".into(),
                    id: job_id.to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn add_job_counters(
        &self,
        job_id: Uuid,
        attempted: i64,
        succeeded: i64,
        failed: i64,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE bulk_jobs SET
                     attempted = attempted + ?1,
                     succeeded = succeeded + ?2,
                     failed = failed + ?3
                 WHERE job_id = ?4",
                params![attempted, succeeded, failed, job_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn add_dead_rows(&self, job_id: Uuid, rows: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE bulk_jobs SET dead = dead + ?1 WHERE job_id = ?2",
                params![rows, job_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_job_reports(
        &self,
        job_id: Uuid,
        success_report: Option<&str>,
        failed_report: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE bulk_jobs SET
                     success_report = COALESCE(?1, success_report),
                     failed_report = COALESCE(?2, failed_report)
                 WHERE job_id = ?3",
                params![success_report, failed_report, job_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Message log ─────────────────────────────────────────────────

    async fn insert_log(&self, entry: &MessageLogEntry) -> Result<(), DatabaseError> {
        let result = self
            .conn()
            .execute(
                "INSERT INTO message_log (id, address, contact_name, template, direction, \
                 content, body, external_id, status, error, media_ref, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    entry.id.to_string(),
                    entry.address.clone(),
                    entry.contact_name.clone(),
                    entry.template.clone(),
                    entry.direction.as_str(),
                    entry.content.as_str(),
                    entry.body.clone(),
                    entry.external_id.clone(),
                    entry.status.as_str(),
                    entry.error.clone(),
                    entry.media_ref.clone(),
                    entry.sent_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE") => Err(DatabaseError::Constraint(format!(
                "duplicate external id {:?}",
                entry.external_id
            ))),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn get_log_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<MessageLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LOG_COLUMNS} FROM message_log WHERE external_id = ?1"),
                params![external_id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_log(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn has_external_id(&self, external_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM message_log WHERE external_id = ?1",
                params![external_id],
            )
            .await
            .map_err(query_err)?;

        let row = rows.next().await.map_err(query_err)?;
        let count: i64 = row.map(|r| r.get(0).unwrap_or(0)).unwrap_or(0);
        Ok(count > 0)
    }

    async fn apply_receipt_status(
        &self,
        external_id: &str,
        status: LogStatus,
        allowed_current: &[LogStatus],
    ) -> Result<bool, DatabaseError> {
        if allowed_current.is_empty() {
            return Ok(false);
        }

        let placeholders: Vec<String> = (0..allowed_current.len())
            .map(|i| format!("?{}", i + 3))
            .collect();
        let sql = format!(
            "UPDATE message_log SET status = ?1
             WHERE external_id = ?2 AND status IN ({})",
            placeholders.join(", ")
        );

        let mut values: Vec<libsql::Value> = vec![
            libsql::Value::from(status.as_str()),
            libsql::Value::from(external_id),
        ];
        values.extend(
            allowed_current
                .iter()
                .map(|s| libsql::Value::from(s.as_str())),
        );

        let affected = self
            .conn()
            .execute(&sql, libsql::params_from_iter(values))
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn set_log_error(&self, external_id: &str, error: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE message_log SET error = ?1 WHERE external_id = ?2",
                params![error, external_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn attach_media(&self, id: Uuid, media_ref: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE message_log SET media_ref = ?1 WHERE id = ?2",
                params![media_ref, id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn mark_read(&self, address: &str) -> Result<u64, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE message_log SET status = 'Read'
                 WHERE address = ?1 AND direction = 'Received' AND status = 'Unread'",
                params![address],
            )
            .await
            .map_err(query_err)?;
        Ok(affected)
    }

    // ── Derived views ───────────────────────────────────────────────

    async fn contacts(&self, q: &str) -> Result<Vec<ContactSummary>, DatabaseError> {
        let base = "SELECT m.address,
                           MAX(m.sent_at) AS last_time,
                           (SELECT body FROM message_log i WHERE i.address = m.address
                            ORDER BY i.sent_at DESC, i.rowid DESC LIMIT 1) AS last_body,
                           (SELECT direction FROM message_log i WHERE i.address = m.address
                            ORDER BY i.sent_at DESC, i.rowid DESC LIMIT 1) AS last_direction,
                           (SELECT status FROM message_log i WHERE i.address = m.address
                            ORDER BY i.sent_at DESC, i.rowid DESC LIMIT 1) AS last_status,
                           SUM(CASE WHEN m.direction = 'Received' AND m.status = 'Unread'
                               THEN 1 ELSE 0 END) AS unread
                    FROM message_log m";

        let digits = digits_only(q);
        let mut rows = if !digits.is_empty() {
            self.conn()
                .query(
                    &format!(
                        "{base} WHERE m.address LIKE ?1 GROUP BY m.address ORDER BY last_time DESC"
                    ),
                    params![format!("%{digits}%")],
                )
                .await
                .map_err(query_err)?
        } else if !q.trim().is_empty() {
            self.conn()
                .query(
                    &format!(
                        "{base} WHERE m.address IN
                             (SELECT address FROM message_log WHERE body LIKE ?1)
                         GROUP BY m.address ORDER BY last_time DESC"
                    ),
                    params![format!("%{}%", q.trim())],
                )
                .await
                .map_err(query_err)?
        } else {
            self.conn()
                .query(
                    &format!("{base} GROUP BY m.address ORDER BY last_time DESC"),
                    (),
                )
                .await
                .map_err(query_err)?
        };

        let mut contacts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let last_time: Option<String> = row.get::<String>(1).ok();
            contacts.push(ContactSummary {
                address: row.get(0).map_err(query_err)?,
                last_time: last_time.map(|s| parse_datetime(&s)),
                last_body: row.get::<String>(2).unwrap_or_default(),
                last_direction: row.get::<String>(3).unwrap_or_default(),
                last_status: row.get::<String>(4).unwrap_or_default(),
                unread: row.get::<i64>(5).unwrap_or(0),
            });
        }
        Ok(contacts)
    }

    async fn messages_page(
        &self,
        address: &str,
        page: usize,
        page_size: usize,
    ) -> Result<MessagesPage, DatabaseError> {
        let page_size = page_size.max(1);

        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM message_log WHERE address = ?1",
                params![address],
            )
            .await
            .map_err(query_err)?;
        let total_items: i64 = rows
            .next()
            .await
            .map_err(query_err)?
            .map(|r| r.get(0).unwrap_or(0))
            .unwrap_or(0);
        let total_items = total_items as usize;

        let total_pages = total_items.div_ceil(page_size).max(1);
        let page = page.clamp(1, total_pages);
        let offset = (page - 1) * page_size;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM message_log WHERE address = ?1
                     ORDER BY sent_at ASC, rowid ASC LIMIT ?2 OFFSET ?3"
                ),
                params![address, page_size as i64, offset as i64],
            )
            .await
            .map_err(query_err)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            items.push(row_to_log(&row).map_err(query_err)?);
        }

        Ok(MessagesPage {
            items,
            page,
            page_size,
            total_pages,
            total_items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::ContentKind;

    async fn store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn sample_job() -> BulkJob {
        BulkJob::new(TemplateKind::EmiReminder)
    }

    #[tokio::test]
    async fn job_round_trip() {
        let s = store().await;
        let job = sample_job();
        s.insert_job(&job).await.unwrap();

        let back = s.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(back.job_id, job.job_id);
        assert_eq!(back.template, TemplateKind::EmiReminder);
        assert_eq!(back.status, JobStatus::Pending);
        assert_eq!(back.total, 0);
    }

    #[tokio::test]
    async fn missing_job_is_none() {
        let s = store().await;
        assert!(s.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn counter_increments_accumulate() {
        let s = store().await;
        let job = sample_job();
        s.insert_job(&job).await.unwrap();
        s.set_job_total(job.job_id, 100).await.unwrap();

        s.add_job_counters(job.job_id, 50, 45, 5).await.unwrap();
        s.add_job_counters(job.job_id, 50, 40, 10).await.unwrap();

        let back = s.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(back.attempted, 100);
        assert_eq!(back.succeeded, 85);
        assert_eq!(back.failed, 15);
        assert_eq!(back.succeeded + back.failed, back.attempted);
        assert!(back.attempted <= back.total);
    }

    #[tokio::test]
    async fn concurrent_counter_increments_do_not_lose_updates() {
        let s = Arc::new(store().await);
        let job = sample_job();
        s.insert_job(&job).await.unwrap();
        s.set_job_total(job.job_id, 200).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let s = Arc::clone(&s);
            let id = job.job_id;
            handles.push(tokio::spawn(async move {
                s.add_job_counters(id, 10, 9, 1).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let back = s.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(back.attempted, 200);
        assert_eq!(back.succeeded, 180);
        assert_eq!(back.failed, 20);
    }

    #[tokio::test]
    async fn terminal_status_is_write_protected() {
        let s = store().await;
        let job = sample_job();
        s.insert_job(&job).await.unwrap();

        s.update_job_status(job.job_id, JobStatus::Queued).await.unwrap();
        s.update_job_status(job.job_id, JobStatus::Completed).await.unwrap();

        let err = s
            .update_job_status(job.job_id, JobStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        let back = s.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(back.status, JobStatus::Completed);
        assert!(back.completed_at.is_some());
    }

    #[tokio::test]
    async fn update_status_on_missing_job_is_not_found() {
        let s = store().await;
        let err = s
            .update_job_status(Uuid::new_v4(), JobStatus::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn dead_rows_accumulate_separately() {
        let s = store().await;
        let job = sample_job();
        s.insert_job(&job).await.unwrap();

        s.add_dead_rows(job.job_id, 50).await.unwrap();
        s.add_job_counters(job.job_id, 10, 10, 0).await.unwrap();

        let back = s.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(back.dead, 50);
        assert_eq!(back.attempted, 10);
        assert_eq!(back.failed, 0);
    }

    #[tokio::test]
    async fn report_keys_are_kept_once_set() {
        let s = store().await;
        let job = sample_job();
        s.insert_job(&job).await.unwrap();

        s.set_job_reports(job.job_id, Some("final_success_x.csv"), None)
            .await
            .unwrap();
        s.set_job_reports(job.job_id, None, Some("final_failed_x.csv"))
            .await
            .unwrap();

        let back = s.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(back.success_report.as_deref(), Some("final_success_x.csv"));
        assert_eq!(back.failed_report.as_deref(), Some("final_failed_x.csv"));
    }

    #[tokio::test]
    async fn log_round_trip_by_external_id() {
        let s = store().await;
        let entry = MessageLogEntry::outbound("+919491006569", "hello", ContentKind::Text)
            .with_external_id("wamid.RT")
            .with_template("manual");
        s.insert_log(&entry).await.unwrap();

        let back = s.get_log_by_external_id("wamid.RT").await.unwrap().unwrap();
        assert_eq!(back.id, entry.id);
        assert_eq!(back.body, "hello");
        assert_eq!(back.status, LogStatus::Sent);
        assert_eq!(back.template.as_deref(), Some("manual"));
    }

    #[tokio::test]
    async fn duplicate_external_id_is_constraint_error() {
        let s = store().await;
        let first = MessageLogEntry::inbound("+919491006569", "hi", ContentKind::Text, "wamid.XYZ");
        let second =
            MessageLogEntry::inbound("+919491006569", "hi again", ContentKind::Text, "wamid.XYZ");

        s.insert_log(&first).await.unwrap();
        let err = s.insert_log(&second).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert!(s.has_external_id("wamid.XYZ").await.unwrap());
    }

    #[tokio::test]
    async fn entries_without_external_id_coexist() {
        let s = store().await;
        for _ in 0..3 {
            let entry = MessageLogEntry::outbound("+919491006569", "x", ContentKind::Text)
                .failed("send failed");
            s.insert_log(&entry).await.unwrap();
        }
        let page = s.messages_page("+919491006569", 1, 10).await.unwrap();
        assert_eq!(page.total_items, 3);
    }

    #[tokio::test]
    async fn receipt_guard_blocks_disallowed_current() {
        let s = store().await;
        let entry = MessageLogEntry::outbound("+919491006569", "m", ContentKind::Text)
            .with_external_id("wamid.G");
        s.insert_log(&entry).await.unwrap();

        // Sent -> Read is allowed from Sent
        let applied = s
            .apply_receipt_status("wamid.G", LogStatus::Read, &[LogStatus::Sent, LogStatus::Delivered])
            .await
            .unwrap();
        assert!(applied);

        // Delivered must not overwrite Read
        let applied = s
            .apply_receipt_status(
                "wamid.G",
                LogStatus::Delivered,
                &[LogStatus::Sent],
            )
            .await
            .unwrap();
        assert!(!applied);

        let back = s.get_log_by_external_id("wamid.G").await.unwrap().unwrap();
        assert_eq!(back.status, LogStatus::Read);
    }

    #[tokio::test]
    async fn mark_read_scoped_to_address() {
        let s = store().await;
        let a = "+919491006569";
        let b = "+919491006570";
        s.insert_log(&MessageLogEntry::inbound(a, "1", ContentKind::Text, "w1"))
            .await
            .unwrap();
        s.insert_log(&MessageLogEntry::inbound(a, "2", ContentKind::Text, "w2"))
            .await
            .unwrap();
        s.insert_log(&MessageLogEntry::inbound(b, "3", ContentKind::Text, "w3"))
            .await
            .unwrap();

        let changed = s.mark_read(a).await.unwrap();
        assert_eq!(changed, 2);

        let contacts = s.contacts("").await.unwrap();
        let unread_a = contacts.iter().find(|c| c.address == a).unwrap().unread;
        let unread_b = contacts.iter().find(|c| c.address == b).unwrap().unread;
        assert_eq!(unread_a, 0);
        assert_eq!(unread_b, 1);
    }

    #[tokio::test]
    async fn contacts_summarize_last_message_and_unread() {
        let s = store().await;
        let a = "+919491006569";
        s.insert_log(&MessageLogEntry::outbound(a, "first", ContentKind::Text))
            .await
            .unwrap();
        s.insert_log(&MessageLogEntry::inbound(a, "latest", ContentKind::Text, "w9"))
            .await
            .unwrap();

        let contacts = s.contacts("").await.unwrap();
        assert_eq!(contacts.len(), 1);
        let c = &contacts[0];
        assert_eq!(c.address, a);
        assert_eq!(c.last_body, "latest");
        assert_eq!(c.last_direction, "Received");
        assert_eq!(c.unread, 1);
    }

    #[tokio::test]
    async fn contacts_search_by_digits_and_body() {
        let s = store().await;
        s.insert_log(&MessageLogEntry::inbound(
            "+919491006569",
            "about the loan",
            ContentKind::Text,
            "wA",
        ))
        .await
        .unwrap();
        s.insert_log(&MessageLogEntry::inbound(
            "+918888888888",
            "unrelated",
            ContentKind::Text,
            "wB",
        ))
        .await
        .unwrap();

        let by_digits = s.contacts("94910").await.unwrap();
        assert_eq!(by_digits.len(), 1);
        assert_eq!(by_digits[0].address, "+919491006569");

        let by_body = s.contacts("loan").await.unwrap();
        assert_eq!(by_body.len(), 1);
        assert_eq!(by_body[0].address, "+919491006569");
    }

    #[tokio::test]
    async fn messages_page_clamps_and_orders() {
        let s = store().await;
        let a = "+919491006569";
        for i in 0..5 {
            let mut entry = MessageLogEntry::outbound(a, &format!("msg-{i}"), ContentKind::Text);
            entry.sent_at = Utc::now() + chrono::Duration::seconds(i);
            s.insert_log(&entry).await.unwrap();
        }

        let page = s.messages_page(a, 1, 2).await.unwrap();
        assert_eq!(page.total_items, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].body, "msg-0");
        assert_eq!(page.items[1].body, "msg-1");

        // Out-of-range page clamps to the last page
        let clamped = s.messages_page(a, 99, 2).await.unwrap();
        assert_eq!(clamped.page, 3);
        assert_eq!(clamped.items.len(), 1);
        assert_eq!(clamped.items[0].body, "msg-4");

        // Page zero clamps up to 1
        let first = s.messages_page(a, 0, 2).await.unwrap();
        assert_eq!(first.page, 1);
    }

    #[tokio::test]
    async fn attach_media_and_error() {
        let s = store().await;
        let entry = MessageLogEntry::inbound("+919491006569", "[Image]", ContentKind::Image, "wM");
        let id = entry.id;
        s.insert_log(&entry).await.unwrap();

        s.attach_media(id, "media/whatsapp_m1.jpeg").await.unwrap();
        s.set_log_error("wM", "131026 - Undeliverable").await.unwrap();

        let back = s.get_log_by_external_id("wM").await.unwrap().unwrap();
        assert_eq!(back.media_ref.as_deref(), Some("media/whatsapp_m1.jpeg"));
        assert_eq!(back.error.as_deref(), Some("131026 - Undeliverable"));
    }
}
