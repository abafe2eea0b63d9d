//! Persistence ports used by the controllers. [`crate::db::Db`] is the
//! production implementation; tests use an in-memory fake.

use std::future::Future;

use anyhow::Result;
use time::OffsetDateTime;

use crate::model::{
    ClockTime, DeviceModeConfig, DeviceType, Mode, ModePatch, NewSchedule, ScheduleEntry,
    ScheduleFilter,
};

pub trait DeviceModeStore: Send + Sync + 'static {
    /// Fetch the record for `device`, creating the default one if absent.
    fn get_mode(&self, device: DeviceType) -> impl Future<Output = Result<DeviceModeConfig>> + Send;

    /// Merge `patch` into the record (creating it first if needed), validate
    /// and persist. Validation failures come back as
    /// [`crate::model::ValidationError`] inside the `anyhow::Error`.
    fn upsert_mode(
        &self,
        device: DeviceType,
        patch: &ModePatch,
        now: OffsetDateTime,
    ) -> impl Future<Output = Result<DeviceModeConfig>> + Send;

    fn list_modes(&self) -> impl Future<Output = Result<Vec<DeviceModeConfig>>> + Send;

    /// Active actuator records currently in `mode`.
    fn list_by_mode(&self, mode: Mode) -> impl Future<Output = Result<Vec<DeviceModeConfig>>> + Send;
}

pub trait ScheduleStore: Send + Sync + 'static {
    /// Active entries whose time of day equals `time`.
    fn list_active_at_time(
        &self,
        time: ClockTime,
    ) -> impl Future<Output = Result<Vec<ScheduleEntry>>> + Send;

    fn list_schedules(
        &self,
        filter: &ScheduleFilter,
    ) -> impl Future<Output = Result<Vec<ScheduleEntry>>> + Send;

    fn get_schedule(&self, id: i64) -> impl Future<Output = Result<Option<ScheduleEntry>>> + Send;

    fn insert_schedule(
        &self,
        new: &NewSchedule,
    ) -> impl Future<Output = Result<ScheduleEntry>> + Send;

    /// Overwrite every mutable field of an existing entry.
    fn save_schedule(&self, entry: &ScheduleEntry) -> impl Future<Output = Result<()>> + Send;

    /// Returns false when no entry had that id.
    fn delete_schedule(&self, id: i64) -> impl Future<Output = Result<bool>> + Send;
}
