pub mod birthdays;
pub mod ledger;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::Connection;

pub use birthdays::{BirthdayRecord, BirthdayStore, DisplayName};
pub use ledger::{EventKind, ReminderLedger};

/// Telegram user id of the person whose birthday is tracked.
pub type SubjectId = i64;
/// Telegram chat id of the group the birthday was registered in.
pub type GroupId = i64;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS birthdays (
    user_id       INTEGER NOT NULL,
    chat_id       INTEGER NOT NULL,
    birthday_date TEXT    NOT NULL,   -- YYYY-MM-DD, year 0000 when unknown
    username      TEXT    NOT NULL DEFAULT '',
    first_name    TEXT    NOT NULL DEFAULT '',
    last_name     TEXT    NOT NULL DEFAULT '',
    PRIMARY KEY (user_id, chat_id)
);

CREATE INDEX IF NOT EXISTS idx_birthdays_month_day ON birthdays(substr(birthday_date, 6, 5));

CREATE TABLE IF NOT EXISTS sent_reminders (
    user_id       INTEGER NOT NULL,
    chat_id       INTEGER NOT NULL,
    reminder_date TEXT    NOT NULL,   -- YYYY-MM-DD event day
    reminder_type TEXT    NOT NULL,
    PRIMARY KEY (user_id, chat_id, reminder_date, reminder_type)
);
"#;

/// SQLite handle shared by the command handler and the scheduler.
///
/// Every operation is a single statement, so the connection mutex is the
/// only coordination needed between the two.
pub struct Database {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply database schema")?;
        tracing::info!("Database ready at {}", path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply database schema")?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write a consistent copy of the database next to the live file.
    pub fn backup(&self, now: NaiveDateTime) -> Result<PathBuf> {
        let path = self
            .path
            .as_ref()
            .context("In-memory database cannot be backed up")?;
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".backup_{}", now.format("%Y%m%d_%H%M%S")));
        let target = PathBuf::from(name);

        // the target path is built here, never taken from user input
        let escaped = target.display().to_string().replace('\'', "''");
        self.conn()
            .execute_batch(&format!("VACUUM INTO '{escaped}'"))
            .with_context(|| format!("Failed to write backup: {}", target.display()))?;
        tracing::info!("Backup written to {}", target.display());
        Ok(target)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed::datetime;
    use crate::dates::BirthDate;

    #[test]
    fn test_open_creates_file_and_reopens() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/birthdays.db");
        let name = DisplayName {
            first_name: "Anna".into(),
            ..Default::default()
        };
        {
            let db = Database::open(&path).unwrap();
            db.upsert(1, -100, BirthDate::new(Some(1990), 5, 15).unwrap(), &name)
                .unwrap();
        }
        assert!(path.exists());
        let db = Database::open(&path).unwrap();
        assert!(db.get(1, -100).unwrap().is_some());
    }

    #[test]
    fn test_backup_copies_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("birthdays.db")).unwrap();
        db.upsert(
            7,
            -5,
            BirthDate::new(Some(1985), 12, 3).unwrap(),
            &DisplayName::default(),
        )
        .unwrap();

        let target = db.backup(datetime(2024, 5, 14, 12, 30)).unwrap();
        assert!(target.to_string_lossy().ends_with("birthdays.db.backup_20240514_123000"));

        let copy = Database::open(&target).unwrap();
        assert_eq!(copy.stats().unwrap().birthdays, 1);
    }

    #[test]
    fn test_backup_in_memory_fails() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.backup(datetime(2024, 5, 14, 0, 0)).is_err());
    }
}
