use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;

use super::{Database, GroupId, SubjectId};
use crate::dates::{BirthDate, MalformedDate, MonthDay};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayName {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
}

impl DisplayName {
    /// Name used in notifications: first name plus last name when present.
    pub fn full(&self) -> String {
        if self.last_name.is_empty() {
            self.first_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }

    /// Name used in group listings: falls back to the @username when
    /// there is no last name.
    pub fn listing(&self) -> String {
        if !self.last_name.is_empty() {
            format!("{} {}", self.first_name, self.last_name)
        } else if !self.username.is_empty() {
            format!("{} (@{})", self.first_name, self.username)
        } else {
            self.first_name.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BirthdayRecord {
    pub subject: SubjectId,
    pub group: GroupId,
    pub date: BirthDate,
    pub name: DisplayName,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub birthdays: u64,
    pub groups: u64,
    pub subjects: u64,
}

pub trait BirthdayStore: Send + Sync {
    /// Insert or replace the record for (subject, group).
    fn upsert(
        &self,
        subject: SubjectId,
        group: GroupId,
        date: BirthDate,
        name: &DisplayName,
    ) -> Result<()>;

    fn get(&self, subject: SubjectId, group: GroupId) -> Result<Option<BirthdayRecord>>;

    /// Records of one group in calendar order (month-day, not full date).
    fn list_by_group(&self, group: GroupId) -> Result<Vec<BirthdayRecord>>;

    /// Distinct subjects with a record in the group.
    fn list_subjects_by_group(&self, group: GroupId) -> Result<Vec<SubjectId>>;

    /// Records in every group whose month-day equals `month_day`, whatever
    /// their year.
    fn match_month_day(&self, month_day: MonthDay) -> Result<Vec<BirthdayRecord>>;

    /// Returns whether a record was deleted.
    fn remove(&self, subject: SubjectId, group: GroupId) -> Result<bool>;
}

const SELECT_RECORD: &str =
    "SELECT user_id, chat_id, birthday_date, username, first_name, last_name FROM birthdays";

/// A row as stored, before its date has been validated.
struct StoredRow {
    subject: SubjectId,
    group: GroupId,
    date: String,
    name: DisplayName,
}

impl StoredRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            subject: row.get(0)?,
            group: row.get(1)?,
            date: row.get(2)?,
            name: DisplayName {
                username: row.get(3)?,
                first_name: row.get(4)?,
                last_name: row.get(5)?,
            },
        })
    }

    fn decode(self) -> Result<BirthdayRecord, MalformedDate> {
        Ok(BirthdayRecord {
            subject: self.subject,
            group: self.group,
            date: BirthDate::parse_storage(&self.date)?,
            name: self.name,
        })
    }
}

/// Decode a batch, skipping rows whose stored date cannot be read so one
/// bad row does not hide the rest.
fn decode_batch(rows: Vec<StoredRow>) -> Vec<BirthdayRecord> {
    rows.into_iter()
        .filter_map(|row| {
            let (subject, group) = (row.subject, row.group);
            match row.decode() {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Skipping birthday of {subject} in {group}: {e}");
                    None
                }
            }
        })
        .collect()
}

impl Database {
    fn query_rows(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<StoredRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, StoredRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn();
        let (birthdays, groups, subjects) = conn
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT chat_id), COUNT(DISTINCT user_id) FROM birthdays",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
            )
            .context("Failed to read database stats")?;
        Ok(StoreStats {
            birthdays: birthdays as u64,
            groups: groups as u64,
            subjects: subjects as u64,
        })
    }
}

impl BirthdayStore for Database {
    fn upsert(
        &self,
        subject: SubjectId,
        group: GroupId,
        date: BirthDate,
        name: &DisplayName,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO birthdays \
                 (user_id, chat_id, birthday_date, username, first_name, last_name) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    subject,
                    group,
                    date.to_storage(),
                    name.username,
                    name.first_name,
                    name.last_name
                ],
            )
            .with_context(|| format!("Failed to save birthday of {subject} in {group}"))?;
        tracing::info!("Birthday saved for {subject} in {group}");
        Ok(())
    }

    fn get(&self, subject: SubjectId, group: GroupId) -> Result<Option<BirthdayRecord>> {
        let row = self
            .conn()
            .query_row(
                &format!("{SELECT_RECORD} WHERE user_id = ?1 AND chat_id = ?2"),
                params![subject, group],
                StoredRow::read,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(row.decode()?)),
            None => Ok(None),
        }
    }

    fn list_by_group(&self, group: GroupId) -> Result<Vec<BirthdayRecord>> {
        let rows = self.query_rows(
            &format!(
                "{SELECT_RECORD} WHERE chat_id = ?1 \
                 ORDER BY substr(birthday_date, 6, 5), first_name"
            ),
            params![group],
        )?;
        Ok(decode_batch(rows))
    }

    fn list_subjects_by_group(&self, group: GroupId) -> Result<Vec<SubjectId>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT user_id FROM birthdays WHERE chat_id = ?1 ORDER BY user_id")?;
        let subjects = stmt
            .query_map(params![group], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<SubjectId>>>()?;
        Ok(subjects)
    }

    fn match_month_day(&self, month_day: MonthDay) -> Result<Vec<BirthdayRecord>> {
        let rows = self.query_rows(
            &format!("{SELECT_RECORD} WHERE substr(birthday_date, 6, 5) = ?1 ORDER BY chat_id, user_id"),
            params![month_day.to_string()],
        )?;
        Ok(decode_batch(rows))
    }

    fn remove(&self, subject: SubjectId, group: GroupId) -> Result<bool> {
        let deleted = self.conn().execute(
            "DELETE FROM birthdays WHERE user_id = ?1 AND chat_id = ?2",
            params![subject, group],
        )?;
        if deleted > 0 {
            tracing::info!("Birthday removed for {subject} in {group}");
        }
        Ok(deleted > 0)
    }
}
