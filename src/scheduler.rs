use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::config::ReminderConfig;
use crate::dispatcher::NotificationDispatcher;
use crate::matcher;
use crate::store::{BirthdayRecord, BirthdayStore, EventKind, GroupId, ReminderLedger, SubjectId};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Subjects whose day-before reminder was delivered to at least one member.
    pub reminders: usize,
    pub reminder_recipients: usize,
    pub reminder_failures: usize,
    pub congratulations: usize,
    pub congratulation_failures: usize,
    /// Matches skipped because the ledger already had them.
    pub already_sent: usize,
    /// Ledger entries removed, when cleanup ran on this tick.
    pub purged: Option<usize>,
}

/// Periodic birthday check: match, dedup against the ledger, dispatch,
/// record, and once a day trim the ledger.
pub struct ReminderScheduler {
    store: Arc<dyn BirthdayStore>,
    ledger: Arc<dyn ReminderLedger>,
    dispatcher: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    config: ReminderConfig,
    in_flight: tokio::sync::Mutex<()>,
    last_purge: Mutex<Option<NaiveDate>>,
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<dyn BirthdayStore>,
        ledger: Arc<dyn ReminderLedger>,
        dispatcher: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        config: ReminderConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            dispatcher,
            clock,
            config,
            in_flight: tokio::sync::Mutex::new(()),
            last_purge: Mutex::new(None),
        }
    }

    /// Run one check now. Returns `None` without doing anything when another
    /// tick is still in flight.
    pub async fn tick(&self) -> Result<Option<TickReport>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::debug!("Birthday check already running, skipping");
            return Ok(None);
        };
        self.run_tick().await.map(Some)
    }

    async fn run_tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let today = now.date();
        let store = self.store.clone();
        let matches = blocking(move || matcher::find(store.as_ref(), now)).await?;

        let mut report = TickReport::default();
        for record in &matches.tomorrow {
            self.remind(record, today, &mut report).await?;
        }
        for record in &matches.today {
            self.congratulate(record, today, &mut report).await?;
        }
        report.purged = self.maybe_purge(now).await?;
        Ok(report)
    }

    async fn remind(
        &self,
        record: &BirthdayRecord,
        today: NaiveDate,
        report: &mut TickReport,
    ) -> Result<()> {
        let (subject, group) = (record.subject, record.group);
        if self.was_sent(subject, group, today, EventKind::Reminder).await? {
            report.already_sent += 1;
            return Ok(());
        }

        let store = self.store.clone();
        let audience: Vec<_> = blocking(move || store.list_subjects_by_group(group))
            .await?
            .into_iter()
            .filter(|&member| member != subject)
            .collect();
        if audience.is_empty() {
            tracing::debug!("Nobody else in {group} to remind about {subject}");
            return Ok(());
        }

        let name = record.name.full();
        let delivery = self
            .dispatcher
            .fan_out_reminder(&audience, &name, &record.date.to_string())
            .await;
        report.reminder_recipients += delivery.delivered.len();
        report.reminder_failures += delivery.failed.len();

        // Reaching part of the audience counts as sent so the rest are never
        // messaged twice.
        if delivery.any_delivered() {
            self.record_sent(subject, group, today, EventKind::Reminder)
                .await?;
            report.reminders += 1;
            tracing::info!(
                "Reminded {}/{} members of {group} about {name}",
                delivery.delivered.len(),
                audience.len()
            );
        } else {
            tracing::warn!("No member of {group} reached about {name}, retrying next tick");
        }
        Ok(())
    }

    async fn congratulate(
        &self,
        record: &BirthdayRecord,
        today: NaiveDate,
        report: &mut TickReport,
    ) -> Result<()> {
        let (subject, group) = (record.subject, record.group);
        if self
            .was_sent(subject, group, today, EventKind::Congratulation)
            .await?
        {
            report.already_sent += 1;
            return Ok(());
        }

        let name = record.name.full();
        match self
            .dispatcher
            .send_congratulation(group, &name, record.date.age_on(today))
            .await
        {
            Ok(()) => {
                self.record_sent(subject, group, today, EventKind::Congratulation)
                    .await?;
                report.congratulations += 1;
                tracing::info!("Congratulated {name} in {group}");
            }
            Err(e) => {
                report.congratulation_failures += 1;
                tracing::warn!("Congratulating {name} in {group} failed: {e:#}");
            }
        }
        Ok(())
    }

    /// Trim the ledger on the first tick inside the after-midnight window.
    async fn maybe_purge(&self, now: NaiveDateTime) -> Result<Option<usize>> {
        let window_secs = self.config.cleanup_window_minutes * 60;
        if now.time().num_seconds_from_midnight() >= window_secs {
            return Ok(None);
        }
        let today = now.date();
        let purged_today = *self.last_purge.lock().expect("purge lock poisoned") == Some(today);
        if purged_today {
            return Ok(None);
        }

        let cutoff = today
            .checked_sub_days(Days::new(self.config.retention_days()))
            .context("Calendar underflow computing ledger cutoff")?;
        let ledger = self.ledger.clone();
        let purged = blocking(move || ledger.purge_older_than(cutoff)).await?;
        *self.last_purge.lock().expect("purge lock poisoned") = Some(today);
        Ok(Some(purged))
    }

    async fn was_sent(
        &self,
        subject: SubjectId,
        group: GroupId,
        day: NaiveDate,
        kind: EventKind,
    ) -> Result<bool> {
        let ledger = self.ledger.clone();
        blocking(move || ledger.was_sent(subject, group, day, kind)).await
    }

    async fn record_sent(
        &self,
        subject: SubjectId,
        group: GroupId,
        day: NaiveDate,
        kind: EventKind,
    ) -> Result<()> {
        let ledger = self.ledger.clone();
        blocking(move || ledger.record_sent(subject, group, day, kind)).await
    }

    /// Run checks every interval after the warm-up delay until `shutdown`
    /// flips. A check in progress at shutdown is abandoned.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.config.warmup()) => {}
            }

            let period = self.config.check_interval();
            tracing::info!("Birthday checks every {}s", period.as_secs());
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    result = self.tick() => match result {
                        Ok(Some(report)) if report != TickReport::default() => {
                            tracing::info!("Birthday check: {report:?}");
                        }
                        Ok(_) => tracing::debug!("Birthday check: nothing to do"),
                        Err(e) => tracing::error!("Birthday check failed: {e:#}"),
                    },
                }
            }
            tracing::info!("Birthday scheduler stopped");
        })
    }
}

/// Run a storage call on the blocking pool; rusqlite is synchronous.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Storage task panicked")?
}
