use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::str::FromStr;
use time::{Duration, OffsetDateTime};

use crate::model::{
    ClockTime, Day, DeviceModeConfig, DeviceType, Mode, ModePatch, NewSchedule, Repeat,
    RepeatKind, ScheduleEntry, ScheduleFilter, SensorConfig, ValidationError,
    DEFAULT_CHECK_INTERVAL, DEFAULT_MAX_THRESHOLD, DEFAULT_MIN_THRESHOLD,
};
use crate::store::{DeviceModeStore, ScheduleStore};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One accepted telemetry message as persisted in the `telemetry` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub device_id: String,
    pub topic: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub ctr_pump: Option<i64>,
    pub ctr_lamp: Option<i64>,
    pub ctr_fan: Option<i64>,
    /// The payload as received (JSON text).
    pub raw: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSample {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub light: Option<f64>,
}

/// Look-back window of the sensor history endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryRange {
    OneHour,
    SixHours,
    #[default]
    OneDay,
    SevenDays,
}

impl HistoryRange {
    pub fn window(self) -> Duration {
        match self {
            Self::OneHour => Duration::hours(1),
            Self::SixHours => Duration::hours(6),
            Self::OneDay => Duration::hours(24),
            Self::SevenDays => Duration::days(7),
        }
    }
}

impl FromStr for HistoryRange {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Self::OneHour),
            "6h" => Ok(Self::SixHours),
            "24h" => Ok(Self::OneDay),
            "7d" => Ok(Self::SevenDays),
            _ => Err(ValidationError::Unknown {
                kind: "range",
                value: s.to_string(),
            }),
        }
    }
}

/// Rows fetched per history query before thinning.
pub const HISTORY_FETCH_LIMIT: i64 = 1000;
/// Upper bound on points returned by the history endpoint.
pub const HISTORY_MAX_POINTS: usize = 200;

/// Keep every n-th sample so that at most `max` remain.
pub fn downsample<T>(samples: Vec<T>, max: usize) -> Vec<T> {
    if max == 0 || samples.len() <= max {
        return samples;
    }
    let step = samples.len().div_ceil(max);
    samples.into_iter().step_by(step).collect()
}

fn to_unix(ts: OffsetDateTime) -> i64 {
    ts.unix_timestamp()
}

fn from_unix(secs: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).with_context(|| format!("bad timestamp {secs}"))
}

// ----------------------------
// Row types
// ----------------------------

#[derive(sqlx::FromRow)]
struct ModeRow {
    device_type: String,
    mode: String,
    sync_mode: bool,
    sensor_type: Option<String>,
    min_threshold: Option<f64>,
    max_threshold: Option<f64>,
    check_interval: Option<i64>,
    is_active: bool,
    last_updated: i64,
    updated_by: Option<String>,
}

impl TryFrom<ModeRow> for DeviceModeConfig {
    type Error = anyhow::Error;

    fn try_from(r: ModeRow) -> Result<Self> {
        let device_type: DeviceType = r.device_type.parse()?;
        let sensor_config = match r.sensor_type {
            Some(kind) => Some(SensorConfig {
                sensor_type: kind
                    .parse()
                    .with_context(|| format!("malformed sensor config for {device_type}"))?,
                min_threshold: r.min_threshold.unwrap_or(DEFAULT_MIN_THRESHOLD),
                max_threshold: r.max_threshold.unwrap_or(DEFAULT_MAX_THRESHOLD),
                check_interval: r
                    .check_interval
                    .and_then(|s| u32::try_from(s).ok())
                    .unwrap_or(DEFAULT_CHECK_INTERVAL),
            }),
            None => None,
        };
        Ok(Self {
            device_type,
            mode: r.mode.parse()?,
            sync_mode: r.sync_mode,
            sensor_config,
            is_active: r.is_active,
            last_updated: from_unix(r.last_updated)?,
            updated_by: r.updated_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: i64,
    device_type: String,
    action: String,
    time: String,
    repeat_type: String,
    repeat_days: String,
    is_active: bool,
    description: Option<String>,
    next_run: Option<i64>,
    last_run: Option<i64>,
}

impl TryFrom<ScheduleRow> for ScheduleEntry {
    type Error = anyhow::Error;

    fn try_from(r: ScheduleRow) -> Result<Self> {
        let days = r
            .repeat_days
            .split(',')
            .filter(|d| !d.is_empty())
            .map(Day::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id: r.id,
            device_type: r.device_type.parse()?,
            action: r.action.parse()?,
            time: r.time.parse()?,
            repeat: Repeat {
                kind: r.repeat_type.parse()?,
                days,
            },
            is_active: r.is_active,
            description: r.description,
            next_run: r.next_run.map(from_unix).transpose()?,
            last_run: r.last_run.map(from_unix).transpose()?,
        })
    }
}

fn join_days(days: &[Day]) -> String {
    days.iter().map(|d| d.as_str()).collect::<Vec<_>>().join(",")
}

#[derive(sqlx::FromRow)]
struct TelemetryRow {
    ts: i64,
    device_id: String,
    topic: String,
    temperature: Option<f64>,
    humidity: Option<f64>,
    soil_moisture: Option<f64>,
    ctr_pump: Option<i64>,
    ctr_lamp: Option<i64>,
    ctr_fan: Option<i64>,
    raw: String,
}

#[derive(sqlx::FromRow)]
struct SampleRow {
    ts: i64,
    temperature: Option<f64>,
    humidity: Option<f64>,
    soil_moisture: Option<f64>,
    light: Option<f64>,
}

const MODE_COLUMNS: &str = "device_type, mode, sync_mode, sensor_type, min_threshold, \
     max_threshold, check_interval, is_active, last_updated, updated_by";

const SCHEDULE_COLUMNS: &str = "id, device_type, action, time, repeat_type, repeat_days, \
     is_active, description, next_run, last_run";

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/farm/farm.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to an in-memory database is its own database.
        let in_memory = db_url.contains(":memory:");
        let mut pool = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool = pool.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Device modes
    // ----------------------------

    async fn fetch_mode(
        conn: &mut SqliteConnection,
        device: DeviceType,
    ) -> Result<Option<DeviceModeConfig>> {
        let row: Option<ModeRow> = sqlx::query_as(&format!(
            "SELECT {MODE_COLUMNS} FROM device_modes WHERE device_type = ?"
        ))
        .bind(device.as_str())
        .fetch_optional(&mut *conn)
        .await
        .context("fetch_mode failed")?;
        row.map(DeviceModeConfig::try_from).transpose()
    }

    async fn write_mode(conn: &mut SqliteConnection, m: &DeviceModeConfig) -> Result<()> {
        let sc = m.sensor_config.as_ref();
        sqlx::query(
            r#"
            INSERT INTO device_modes (
              device_type, mode, sync_mode,
              sensor_type, min_threshold, max_threshold, check_interval,
              is_active, last_updated, updated_by
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_type) DO UPDATE SET
              mode=excluded.mode,
              sync_mode=excluded.sync_mode,
              sensor_type=excluded.sensor_type,
              min_threshold=excluded.min_threshold,
              max_threshold=excluded.max_threshold,
              check_interval=excluded.check_interval,
              is_active=excluded.is_active,
              last_updated=excluded.last_updated,
              updated_by=excluded.updated_by
            "#,
        )
        .bind(m.device_type.as_str())
        .bind(m.mode.as_str())
        .bind(m.sync_mode)
        .bind(sc.map(|s| s.sensor_type.as_str()))
        .bind(sc.map(|s| s.min_threshold))
        .bind(sc.map(|s| s.max_threshold))
        .bind(sc.map(|s| i64::from(s.check_interval)))
        .bind(m.is_active)
        .bind(to_unix(m.last_updated))
        .bind(m.updated_by.as_deref())
        .execute(&mut *conn)
        .await
        .context("write_mode failed")?;
        Ok(())
    }

    /// Insert `cfg` unless a record for that device type already exists.
    /// Returns true when the row was created.
    pub async fn seed_mode(&self, cfg: &DeviceModeConfig) -> Result<bool> {
        cfg.validate()?;
        let mut conn = self.pool.acquire().await?;
        if Self::fetch_mode(&mut conn, cfg.device_type).await?.is_some() {
            return Ok(false);
        }
        Self::write_mode(&mut conn, cfg).await?;
        Ok(true)
    }

    // ----------------------------
    // Telemetry + history
    // ----------------------------

    pub async fn insert_telemetry(&self, t: &TelemetryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO telemetry (
              ts, device_id, topic,
              temperature, humidity, soil_moisture,
              ctr_pump, ctr_lamp, ctr_fan, raw
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_unix(t.ts))
        .bind(&t.device_id)
        .bind(&t.topic)
        .bind(t.temperature)
        .bind(t.humidity)
        .bind(t.soil_moisture)
        .bind(t.ctr_pump)
        .bind(t.ctr_lamp)
        .bind(t.ctr_fan)
        .bind(&t.raw)
        .execute(&self.pool)
        .await
        .context("insert_telemetry failed")?;
        Ok(())
    }

    /// Newest-first page of telemetry, optionally for a single device.
    pub async fn recent_telemetry(
        &self,
        device_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TelemetryRecord>> {
        let rows: Vec<TelemetryRow> = sqlx::query_as(
            r#"
            SELECT ts, device_id, topic, temperature, humidity, soil_moisture,
                   ctr_pump, ctr_lamp, ctr_fan, raw
            FROM telemetry
            WHERE (?1 IS NULL OR device_id = ?1)
            ORDER BY ts DESC, id DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("recent_telemetry failed")?;

        rows.into_iter()
            .map(|r| {
                Ok(TelemetryRecord {
                    ts: from_unix(r.ts)?,
                    device_id: r.device_id,
                    topic: r.topic,
                    temperature: r.temperature,
                    humidity: r.humidity,
                    soil_moisture: r.soil_moisture,
                    ctr_pump: r.ctr_pump,
                    ctr_lamp: r.ctr_lamp,
                    ctr_fan: r.ctr_fan,
                    raw: r.raw,
                })
            })
            .collect()
    }

    pub async fn insert_sensor_sample(&self, s: &SensorSample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_history (ts, temperature, humidity, soil_moisture, light)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_unix(s.ts))
        .bind(s.temperature)
        .bind(s.humidity)
        .bind(s.soil_moisture)
        .bind(s.light)
        .execute(&self.pool)
        .await
        .context("insert_sensor_sample failed")?;
        Ok(())
    }

    /// Oldest-first samples inside `range`, thinned to at most
    /// [`HISTORY_MAX_POINTS`].
    pub async fn sensor_history(
        &self,
        range: HistoryRange,
        now: OffsetDateTime,
    ) -> Result<Vec<SensorSample>> {
        let since = to_unix(now - range.window());
        let mut rows: Vec<SampleRow> = sqlx::query_as(
            r#"
            SELECT ts, temperature, humidity, soil_moisture, light
            FROM sensor_history
            WHERE ts >= ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(since)
        .bind(HISTORY_FETCH_LIMIT)
        .fetch_all(&self.pool)
        .await
        .context("sensor_history failed")?;
        rows.reverse();

        let samples = rows
            .into_iter()
            .map(|r| {
                Ok(SensorSample {
                    ts: from_unix(r.ts)?,
                    temperature: r.temperature,
                    humidity: r.humidity,
                    soil_moisture: r.soil_moisture,
                    light: r.light,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(downsample(samples, HISTORY_MAX_POINTS))
    }
}

// ----------------------------
// Store ports
// ----------------------------

impl DeviceModeStore for Db {
    async fn get_mode(&self, device: DeviceType) -> Result<DeviceModeConfig> {
        let mut tx = self.pool.begin().await.context("begin failed")?;
        if let Some(m) = Self::fetch_mode(&mut tx, device).await? {
            return Ok(m);
        }
        let fresh = DeviceModeConfig::new_default(device, OffsetDateTime::now_utc());
        Self::write_mode(&mut tx, &fresh).await?;
        let stored = Self::fetch_mode(&mut tx, device)
            .await?
            .ok_or_else(|| anyhow!("device mode {device} vanished after insert"))?;
        tx.commit().await.context("commit failed")?;
        Ok(stored)
    }

    async fn upsert_mode(
        &self,
        device: DeviceType,
        patch: &ModePatch,
        now: OffsetDateTime,
    ) -> Result<DeviceModeConfig> {
        let mut tx = self.pool.begin().await.context("begin failed")?;
        let mut cfg = match Self::fetch_mode(&mut tx, device).await? {
            Some(m) => m,
            None => DeviceModeConfig::new_default(device, now),
        };
        cfg.apply(patch, now)?;
        Self::write_mode(&mut tx, &cfg).await?;
        tx.commit().await.context("commit failed")?;
        Ok(cfg)
    }

    async fn list_modes(&self) -> Result<Vec<DeviceModeConfig>> {
        let rows: Vec<ModeRow> = sqlx::query_as(&format!(
            "SELECT {MODE_COLUMNS} FROM device_modes ORDER BY device_type"
        ))
        .fetch_all(&self.pool)
        .await
        .context("list_modes failed")?;
        rows.into_iter().map(DeviceModeConfig::try_from).collect()
    }

    async fn list_by_mode(&self, mode: Mode) -> Result<Vec<DeviceModeConfig>> {
        let rows: Vec<ModeRow> = sqlx::query_as(&format!(
            "SELECT {MODE_COLUMNS} FROM device_modes \
             WHERE mode = ? AND is_active = 1 AND device_type != 'global' \
             ORDER BY device_type"
        ))
        .bind(mode.as_str())
        .fetch_all(&self.pool)
        .await
        .context("list_by_mode failed")?;
        rows.into_iter().map(DeviceModeConfig::try_from).collect()
    }
}

impl ScheduleStore for Db {
    async fn list_active_at_time(&self, time: ClockTime) -> Result<Vec<ScheduleEntry>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE is_active = 1 AND time = ? ORDER BY id"
        ))
        .bind(time.to_string())
        .fetch_all(&self.pool)
        .await
        .context("list_active_at_time failed")?;
        rows.into_iter().map(ScheduleEntry::try_from).collect()
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleEntry>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE (?1 IS NULL OR device_type = ?1) \
               AND (?2 IS NULL OR action = ?2) \
               AND (?3 IS NULL OR is_active = ?3) \
             ORDER BY time, id"
        ))
        .bind(filter.device_type.map(|d| d.as_str()))
        .bind(filter.action.map(|a| a.as_str()))
        .bind(filter.is_active)
        .fetch_all(&self.pool)
        .await
        .context("list_schedules failed")?;
        rows.into_iter().map(ScheduleEntry::try_from).collect()
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<ScheduleEntry>> {
        let row: Option<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_schedule failed")?;
        row.map(ScheduleEntry::try_from).transpose()
    }

    async fn insert_schedule(&self, new: &NewSchedule) -> Result<ScheduleEntry> {
        new.repeat.validate()?;
        let now = to_unix(OffsetDateTime::now_utc());
        let result = sqlx::query(
            r#"
            INSERT INTO schedules (
              device_type, action, time, repeat_type, repeat_days,
              is_active, description, next_run, last_run, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(new.device_type.as_str())
        .bind(new.action.as_str())
        .bind(new.time.to_string())
        .bind(new.repeat.kind.as_str())
        .bind(join_days(&new.repeat.days))
        .bind(new.is_active)
        .bind(new.description.as_deref())
        .bind(new.next_run.map(to_unix))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("insert_schedule failed")?;

        Ok(ScheduleEntry {
            id: result.last_insert_rowid(),
            device_type: new.device_type,
            action: new.action,
            time: new.time,
            repeat: new.repeat.clone(),
            is_active: new.is_active,
            description: new.description.clone(),
            next_run: new.next_run,
            last_run: None,
        })
    }

    async fn save_schedule(&self, e: &ScheduleEntry) -> Result<()> {
        e.repeat.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE schedules SET
              device_type = ?, action = ?, time = ?,
              repeat_type = ?, repeat_days = ?,
              is_active = ?, description = ?,
              next_run = ?, last_run = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(e.device_type.as_str())
        .bind(e.action.as_str())
        .bind(e.time.to_string())
        .bind(e.repeat.kind.as_str())
        .bind(join_days(&e.repeat.days))
        .bind(e.is_active)
        .bind(e.description.as_deref())
        .bind(e.next_run.map(to_unix))
        .bind(e.last_run.map(to_unix))
        .bind(to_unix(OffsetDateTime::now_utc()))
        .bind(e.id)
        .execute(&self.pool)
        .await
        .context("save_schedule failed")?;
        if result.rows_affected() == 0 {
            anyhow::bail!("schedule {} does not exist", e.id);
        }
        Ok(())
    }

    async fn delete_schedule(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_schedule failed")?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Tests
// ============================================================================
