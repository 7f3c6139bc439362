use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::params;
use serde::Serialize;

use super::{Database, GroupId, SubjectId};

const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Private notice to the other members, the day before.
    Reminder,
    /// Group post on the day itself.
    Congratulation,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reminder => "reminder",
            Self::Congratulation => "congratulation",
        }
    }
}

/// Durable record of notifications already delivered, keyed by
/// (subject, group, event day, kind).
pub trait ReminderLedger: Send + Sync {
    fn was_sent(
        &self,
        subject: SubjectId,
        group: GroupId,
        day: NaiveDate,
        kind: EventKind,
    ) -> Result<bool>;

    /// Recording the same key twice is a no-op.
    fn record_sent(
        &self,
        subject: SubjectId,
        group: GroupId,
        day: NaiveDate,
        kind: EventKind,
    ) -> Result<()>;

    /// Delete every entry whose event day is strictly before `cutoff`.
    fn purge_older_than(&self, cutoff: NaiveDate) -> Result<usize>;
}

impl ReminderLedger for Database {
    fn was_sent(
        &self,
        subject: SubjectId,
        group: GroupId,
        day: NaiveDate,
        kind: EventKind,
    ) -> Result<bool> {
        let found: i64 = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM sent_reminders \
             WHERE user_id = ?1 AND chat_id = ?2 AND reminder_date = ?3 AND reminder_type = ?4)",
            params![subject, group, day.format(DAY_FORMAT).to_string(), kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(found != 0)
    }

    fn record_sent(
        &self,
        subject: SubjectId,
        group: GroupId,
        day: NaiveDate,
        kind: EventKind,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO sent_reminders (user_id, chat_id, reminder_date, reminder_type) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![subject, group, day.format(DAY_FORMAT).to_string(), kind.as_str()],
            )
            .with_context(|| format!("Failed to record {} for {subject} in {group}", kind.as_str()))?;
        tracing::debug!("Recorded {} for {subject} in {group} on {day}", kind.as_str());
        Ok(())
    }

    fn purge_older_than(&self, cutoff: NaiveDate) -> Result<usize> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM sent_reminders WHERE reminder_date < ?1",
                params![cutoff.format(DAY_FORMAT).to_string()],
            )
            .context("Failed to purge sent reminders")?;
        if deleted > 0 {
            tracing::info!("Purged {deleted} sent reminders older than {cutoff}");
        }
        Ok(deleted)
    }
}
