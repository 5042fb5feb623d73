//! SQLite-backed campaign store.
//!
//! Counters are only ever changed by single `UPDATE ... SET x = x + 1`
//! statements guarded by `sent + failed < total`, so concurrent writers (the
//! engine and a dashboard editing the same row) can't lose or overshoot an
//! increment. Status changes run in a transaction that validates the
//! transition against the current row.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use wablast_core::error::{Result, WablastError};
use wablast_core::traits::CampaignStore;
use wablast_core::types::{
    Campaign, CampaignId, CampaignKind, CampaignStatus, CampaignSummary, Contact, MediaPayload,
    NewCampaign,
};

const SUMMARY_COLUMNS: &str =
    "id, name, instance, status, total_contacts, sent_messages, failed_messages, start_time";

const CAMPAIGN_COLUMNS: &str = "id, name, kind, status, instance, message, media, contacts, \
     total_contacts, sent_messages, failed_messages, interval_ms, start_time, status_reason, \
     created_at, updated_at";

/// Campaign store over a single SQLite connection.
pub struct CampaignDb {
    conn: Mutex<Connection>,
}

impl CampaignDb {
    /// Open or create the campaign database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| store_err("open", e))?;
        if let Err(e) = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;") {
            tracing::warn!("⚠️ Campaign store {}: WAL/busy_timeout not applied: {e}", path.display());
        }
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| store_err("open", e))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WablastError::Store(format!("lock poisoned: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS campaigns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'individual',   -- 'individual', 'group'
                status TEXT NOT NULL DEFAULT 'draft',
                instance TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                media TEXT,                                -- JSON MediaPayload
                contacts TEXT NOT NULL DEFAULT '[]',       -- JSON array of Contact
                total_contacts INTEGER NOT NULL DEFAULT 0,
                sent_messages INTEGER NOT NULL DEFAULT 0,
                failed_messages INTEGER NOT NULL DEFAULT 0,
                interval_ms INTEGER NOT NULL DEFAULT 3000,
                start_time TEXT NOT NULL,
                status_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (sent_messages >= 0 AND failed_messages >= 0),
                CHECK (sent_messages + failed_messages <= total_contacts)
            );

            CREATE INDEX IF NOT EXISTS idx_campaigns_status_start
                ON campaigns (status, start_time);
            ",
        )
        .map_err(|e| store_err("migration", e))?;
        Ok(())
    }

    // ─── Campaign CRUD ──────────────────────────────────────

    /// Insert a campaign; `total_contacts` is derived from the contact list.
    pub fn insert_campaign(&self, new: &NewCampaign) -> Result<CampaignId> {
        let now = Utc::now();
        let media = new.media.as_ref().map(serde_json::to_string).transpose()?;
        let contacts = serde_json::to_string(&new.contacts)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO campaigns
             (name, kind, status, instance, message, media, contacts, total_contacts,
              interval_ms, start_time, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                new.name,
                new.kind.as_str(),
                new.status.as_str(),
                new.instance,
                new.message,
                media,
                contacts,
                new.contacts.len() as i64,
                new.interval_ms as i64,
                ts(new.start_time.unwrap_or(now)),
                ts(now),
            ],
        )
        .map_err(|e| store_err("insert campaign", e))?;
        let id = conn.last_insert_rowid();
        tracing::info!("📋 Campaign {} created: '{}' ({} contacts)", id, new.name, new.contacts.len());
        Ok(id)
    }

    /// Load a full campaign.
    pub fn get(&self, id: CampaignId) -> Result<Campaign> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
                [id],
                RawCampaign::from_row,
            )
            .optional()
            .map_err(|e| store_err("load campaign", e))?
            .ok_or(WablastError::NotFound(id))?;
        raw.into_campaign()
    }

    /// All campaigns, newest first.
    pub fn list_campaigns(&self) -> Result<Vec<CampaignSummary>> {
        self.query_summaries(
            &format!("SELECT {SUMMARY_COLUMNS} FROM campaigns ORDER BY id DESC"),
            params![],
        )
    }

    /// Campaigns in one status, oldest start first.
    pub fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<CampaignSummary>> {
        self.query_summaries(
            &format!(
                "SELECT {SUMMARY_COLUMNS} FROM campaigns WHERE status = ?1 ORDER BY start_time, id"
            ),
            params![status.as_str()],
        )
    }

    /// Delete a campaign.
    pub fn delete_campaign(&self, id: CampaignId) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn
            .execute("DELETE FROM campaigns WHERE id = ?1", [id])
            .map_err(|e| store_err("delete campaign", e))?;
        Ok(n > 0)
    }

    fn query_summaries(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<CampaignSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(|e| store_err("prepare", e))?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(|e| store_err("list campaigns", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, name, instance, status, total, sent, failed, start) =
                row.map_err(|e| store_err("read campaign row", e))?;
            out.push(CampaignSummary {
                id,
                name,
                instance,
                status: status.parse().map_err(WablastError::Store)?,
                total_contacts: total,
                sent_messages: sent,
                failed_messages: failed,
                start_time: parse_ts(&start)?,
            });
        }
        Ok(out)
    }

    // ─── Counters ──────────────────────────────────────

    fn increment(&self, id: CampaignId, column: &str) -> Result<u32> {
        let conn = self.lock()?;
        let updated: Option<u32> = conn
            .query_row(
                &format!(
                    "UPDATE campaigns SET {column} = {column} + 1, updated_at = ?2
                     WHERE id = ?1 AND sent_messages + failed_messages < total_contacts
                     RETURNING {column}"
                ),
                params![id, ts(Utc::now())],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| store_err("increment counter", e))?;

        match updated {
            Some(n) => Ok(n),
            None => {
                let exists: bool = conn
                    .query_row("SELECT 1 FROM campaigns WHERE id = ?1", [id], |_| Ok(()))
                    .optional()
                    .map_err(|e| store_err("increment counter", e))?
                    .is_some();
                if exists {
                    Err(WablastError::CounterExhausted(id))
                } else {
                    Err(WablastError::NotFound(id))
                }
            }
        }
    }

    // ─── Status ──────────────────────────────────────

    fn transition(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| store_err("begin", e))?;
        let current: String = tx
            .query_row("SELECT status FROM campaigns WHERE id = ?1", [id], |row| row.get(0))
            .optional()
            .map_err(|e| store_err("read status", e))?
            .ok_or(WablastError::NotFound(id))?;
        let current: CampaignStatus = current.parse().map_err(WablastError::Store)?;

        if !current.can_transition_to(status) {
            return Err(WablastError::InvalidTransition { from: current, to: status });
        }

        tx.execute(
            "UPDATE campaigns SET status = ?2, status_reason = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), reason, ts(Utc::now())],
        )
        .map_err(|e| store_err("update status", e))?;
        tx.commit().map_err(|e| store_err("commit", e))?;

        if current != status {
            tracing::info!("🔀 Campaign {id}: {current} → {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl CampaignStore for CampaignDb {
    async fn list_active(&self) -> Result<Vec<CampaignSummary>> {
        self.list_by_status(CampaignStatus::Active)
    }

    async fn list_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<CampaignSummary>> {
        self.query_summaries(
            &format!(
                "SELECT {SUMMARY_COLUMNS} FROM campaigns
                 WHERE status = 'scheduled' AND start_time <= ?1 ORDER BY start_time, id"
            ),
            params![ts(now)],
        )
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Campaign> {
        self.get(id)
    }

    async fn campaign_status(&self, id: CampaignId) -> Result<CampaignStatus> {
        let conn = self.lock()?;
        let status: String = conn
            .query_row("SELECT status FROM campaigns WHERE id = ?1", [id], |row| row.get(0))
            .optional()
            .map_err(|e| store_err("read status", e))?
            .ok_or(WablastError::NotFound(id))?;
        status.parse().map_err(WablastError::Store)
    }

    async fn increment_sent(&self, id: CampaignId) -> Result<u32> {
        self.increment(id, "sent_messages")
    }

    async fn increment_failed(&self, id: CampaignId) -> Result<u32> {
        self.increment(id, "failed_messages")
    }

    async fn set_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        self.transition(id, status, reason)
    }
}

/// Row as stored, before JSON/enum decoding.
struct RawCampaign {
    id: i64,
    name: String,
    kind: String,
    status: String,
    instance: String,
    message: String,
    media: Option<String>,
    contacts: String,
    total_contacts: u32,
    sent_messages: u32,
    failed_messages: u32,
    interval_ms: i64,
    start_time: String,
    status_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawCampaign {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            status: row.get(3)?,
            instance: row.get(4)?,
            message: row.get(5)?,
            media: row.get(6)?,
            contacts: row.get(7)?,
            total_contacts: row.get(8)?,
            sent_messages: row.get(9)?,
            failed_messages: row.get(10)?,
            interval_ms: row.get(11)?,
            start_time: row.get(12)?,
            status_reason: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn into_campaign(self) -> Result<Campaign> {
        let media: Option<MediaPayload> = self
            .media
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let contacts: Vec<Contact> = serde_json::from_str(&self.contacts)?;
        Ok(Campaign {
            id: self.id,
            name: self.name,
            kind: self.kind.parse::<CampaignKind>().map_err(WablastError::Store)?,
            status: self.status.parse().map_err(WablastError::Store)?,
            instance: self.instance,
            message: self.message,
            media,
            contacts,
            total_contacts: self.total_contacts,
            sent_messages: self.sent_messages,
            failed_messages: self.failed_messages,
            interval_ms: self.interval_ms.max(0) as u64,
            start_time: parse_ts(&self.start_time)?,
            status_reason: self.status_reason,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| WablastError::Store(format!("bad timestamp '{s}': {e}")))
}

/// Busy/locked/unopenable databases are transient; everything else is not.
fn store_err(context: &str, e: rusqlite::Error) -> WablastError {
    use rusqlite::ErrorCode;
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => {
            WablastError::StoreUnavailable(format!("{context}: {e}"))
        }
        _ => WablastError::Store(format!("{context}: {e}")),
    }
}
