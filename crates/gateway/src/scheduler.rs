//! Time scheduler: once per wall-clock minute, fire every active schedule
//! entry whose `HH:MM` equals the current local minute and whose repeat
//! rule matches today.
//!
//! Entries only take effect while their device sits in `schedule` mode; in
//! any other mode they stay armed but inert.
//!
//! ```text
//! minute boundary ──▶ list_active_at_time(HH:MM) ──▶ should_run_today?
//!                                                        │
//!                       device mode == schedule? ◀───────┘
//!                               │
//!              publish ─▶ lastRun/nextRun (once ⇒ inactive) ─▶ save ─▶ fan-out
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use time::{Date, OffsetDateTime, Time, UtcOffset};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::fanout::{Fanout, FanoutEvent};
use crate::model::{ClockTime, Day, Mode, Repeat, RepeatKind, ScheduleEntry};
use crate::publisher::{CommandPublisher, CommandTransport};
use crate::store::{DeviceModeStore, ScheduleStore};

// ---------------------------------------------------------------------------
// Recurrence
// ---------------------------------------------------------------------------

/// Whether `entry`'s repeat rule admits `today`.
pub fn should_run_today(entry: &ScheduleEntry, today: Day) -> bool {
    match entry.repeat.kind {
        RepeatKind::Daily => true,
        RepeatKind::Weekdays => !today.is_weekend(),
        RepeatKind::Custom => entry.repeat.days.contains(&today),
        RepeatKind::Once => entry.last_run.is_none(),
    }
}

/// Next instant an entry with this `time`/`repeat` would fire, evaluated in
/// `now`'s offset. `None` when it never fires again: a `once` entry that
/// already ran, or a `custom` rule without days.
pub fn next_run(
    time: ClockTime,
    repeat: &Repeat,
    last_run: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    if repeat.kind == RepeatKind::Once && last_run.is_some() {
        return None;
    }
    let at = Time::from_hms(time.hour(), time.minute(), 0).ok()?;
    let mut candidate = now.replace_time(at);
    if candidate <= now {
        candidate += time::Duration::days(1);
    }

    match repeat.kind {
        RepeatKind::Daily | RepeatKind::Once => Some(candidate),
        RepeatKind::Weekdays => {
            while Day::from(candidate.weekday()).is_weekend() {
                candidate += time::Duration::days(1);
            }
            Some(candidate)
        }
        RepeatKind::Custom => {
            for _ in 0..7 {
                if repeat.days.contains(&Day::from(candidate.weekday())) {
                    return Some(candidate);
                }
                candidate += time::Duration::days(1);
            }
            None
        }
    }
}

/// Active entries whose next run falls on `now`'s local date, soonest first.
pub fn runs_on_day(entries: Vec<ScheduleEntry>, now: OffsetDateTime) -> Vec<ScheduleEntry> {
    let today: Date = now.date();
    let mut due: Vec<_> = entries
        .into_iter()
        .filter(|e| e.is_active)
        .filter(|e| {
            e.next_run
                .map(|n| n.to_offset(now.offset()).date() == today)
                .unwrap_or(false)
        })
        .collect();
    due.sort_by_key(|e| e.next_run);
    due
}

fn same_minute(a: OffsetDateTime, b: OffsetDateTime) -> bool {
    let b = b.to_offset(a.offset());
    a.date() == b.date() && a.hour() == b.hour() && a.minute() == b.minute()
}

fn floor_minute(t: OffsetDateTime) -> OffsetDateTime {
    t - time::Duration::seconds(i64::from(t.second())) - time::Duration::nanoseconds(i64::from(t.nanosecond()))
}

/// Whole minutes strictly between the minute of `prev` and the minute of
/// `now` that the loop never evaluated.
fn minutes_skipped(prev: OffsetDateTime, now: OffsetDateTime) -> i64 {
    ((floor_minute(now) - floor_minute(prev)).whole_minutes() - 1).max(0)
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The device is not in schedule mode; nothing was published.
    Skipped { mode: Mode },
    Executed(ScheduleEntry),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub matched: usize,
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct Inner<S, T> {
    store: Arc<S>,
    publisher: Arc<CommandPublisher<T>>,
    fanout: Fanout,
    offset: UtcOffset,
    running: StdMutex<Option<oneshot::Sender<()>>>,
}

pub struct Scheduler<S, T> {
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for Scheduler<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, T> Scheduler<S, T>
where
    S: DeviceModeStore + ScheduleStore,
    T: CommandTransport,
{
    pub fn new(
        store: Arc<S>,
        publisher: Arc<CommandPublisher<T>>,
        fanout: Fanout,
        offset: UtcOffset,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                publisher,
                fanout,
                offset,
                running: StdMutex::new(None),
            }),
        }
    }

    /// Current wall-clock time in the farm's offset.
    pub fn local_now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.inner.offset)
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Spawn the minute loop. Returns false (and only logs) when it is
    /// already running.
    pub fn start(&self) -> bool {
        let mut running = self.running();
        if running.is_some() {
            info!("scheduler: already running");
            return false;
        }
        let (tx, mut cancel) = oneshot::channel::<()>();
        *running = Some(tx);
        drop(running);

        let sched = self.clone();
        tokio::spawn(async move {
            info!(offset = %sched.inner.offset, "scheduler started");
            let mut last_minute: Option<OffsetDateTime> = None;
            loop {
                let now = sched.local_now();
                if !last_minute.is_some_and(|prev| same_minute(prev, now)) {
                    if let Some(prev) = last_minute {
                        let skipped = minutes_skipped(prev, now);
                        if skipped > 0 {
                            warn!(
                                from = %ClockTime::of(prev),
                                to = %ClockTime::of(now),
                                skipped,
                                "scheduler: minutes skipped, entries due in between did not fire"
                            );
                        }
                    }
                    last_minute = Some(now);
                    let report = sched.tick(now).await;
                    if report.matched > 0 {
                        info!(
                            time = %ClockTime::of(now),
                            matched = report.matched,
                            executed = report.executed,
                            skipped = report.skipped,
                            failed = report.failed,
                            "scheduler: tick"
                        );
                    }
                }

                let into_minute = Duration::new(u64::from(now.second()), now.nanosecond());
                let wait = Duration::from_secs(60)
                    .saturating_sub(into_minute)
                    .max(Duration::from_millis(200));
                tokio::select! {
                    biased;
                    _ = &mut cancel => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            info!("scheduler stopped");
        });
        true
    }

    /// Stop the minute loop. Returns false when it was not running.
    pub fn stop(&self) -> bool {
        self.running().take().is_some()
    }

    /// Evaluate one minute. Failures of one entry never stop the others.
    pub async fn tick(&self, now: OffsetDateTime) -> TickReport {
        let now = now.to_offset(self.inner.offset);
        let clock = ClockTime::of(now);
        let today = Day::from(now.weekday());
        let mut report = TickReport::default();

        let entries = match self.inner.store.list_active_at_time(clock).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(time = %clock, error = %format!("{e:#}"), "scheduler: loading schedules failed");
                report.failed += 1;
                return report;
            }
        };

        for entry in entries {
            if !should_run_today(&entry, today) {
                continue;
            }
            if entry.last_run.is_some_and(|last| same_minute(now, last)) {
                debug!(id = entry.id, "scheduler: already fired this minute");
                continue;
            }
            report.matched += 1;
            let id = entry.id;
            match self.execute_schedule(entry, now).await {
                Ok(Execution::Executed(_)) => report.executed += 1,
                Ok(Execution::Skipped { .. }) => report.skipped += 1,
                Err(e) => {
                    error!(id, error = %e, "scheduler: execution failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Fire one entry now, provided its device is in schedule mode.
    pub async fn execute_schedule(
        &self,
        mut entry: ScheduleEntry,
        now: OffsetDateTime,
    ) -> GatewayResult<Execution> {
        let device = entry.device_type;
        let mode = self.inner.store.get_mode(device).await?;
        if mode.mode != Mode::Schedule {
            info!(id = entry.id, device = %device, mode = %mode.mode, "scheduler: skip, device not in schedule mode");
            return Ok(Execution::Skipped { mode: mode.mode });
        }

        self.inner
            .publisher
            .send(device, entry.action)
            .await
            .map_err(|e| GatewayError::Transport(format!("{e:#}")))?;

        entry.last_run = Some(now);
        entry.next_run = next_run(entry.time, &entry.repeat, entry.last_run, now);
        if entry.repeat.kind == RepeatKind::Once {
            entry.is_active = false;
        }
        if let Err(e) = self.inner.store.save_schedule(&entry).await {
            // The command already went out; report but keep the broadcast.
            warn!(id = entry.id, error = %format!("{e:#}"), "scheduler: saving run bookkeeping failed");
            self.broadcast(&entry, now);
            return Err(e.into());
        }

        info!(
            id = entry.id,
            device = %device,
            action = %entry.action,
            time = %entry.time,
            "scheduler: executed"
        );
        self.broadcast(&entry, now);
        Ok(Execution::Executed(entry))
    }

    /// Execute an entry immediately, bypassing the minute and day checks.
    pub async fn test_run(&self, id: i64) -> GatewayResult<Execution> {
        let entry = self
            .inner
            .store
            .get_schedule(id)
            .await?
            .ok_or_else(|| GatewayError::not_found("schedule", id))?;
        self.execute_schedule(entry, self.local_now()).await
    }

    fn broadcast(&self, entry: &ScheduleEntry, now: OffsetDateTime) {
        self.inner.fanout.publish(FanoutEvent::ScheduleExecuted {
            schedule_id: entry.id,
            device_type: entry.device_type,
            action: entry.action,
            time: entry.time,
            description: entry.description.clone(),
            executed_at: now,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
