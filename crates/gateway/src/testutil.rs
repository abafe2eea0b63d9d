//! In-memory fakes shared by the controller and control-plane tests.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use serde_json::Value;
use time::OffsetDateTime;

use crate::model::{
    ClockTime, DeviceModeConfig, DeviceType, Mode, ModePatch, NewSchedule, ScheduleEntry,
    ScheduleFilter,
};
use crate::publisher::CommandTransport;
use crate::store::{DeviceModeStore, ScheduleStore};

// ----------------------------
// Transport
// ----------------------------

#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    failing: Arc<AtomicBool>,
    yielding: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl RecordingTransport {
    pub fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    /// Give other tasks a chance to run in the middle of every publish.
    pub fn yield_inside_publish(&self, on: bool) {
        self.yielding.store(on, Ordering::SeqCst);
    }

    /// Highest number of publishes that were in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    /// Payloads decoded as JSON, in publish order.
    pub fn commands(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .map(|(_, p)| serde_json::from_slice(p).unwrap())
            .collect()
    }
}

impl CommandTransport for RecordingTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send {
        let topic = topic.to_string();
        let this = self.clone();
        async move {
            let now = this.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            this.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if this.yielding.load(Ordering::SeqCst) {
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }
            }
            let result = if this.failing.load(Ordering::SeqCst) {
                Err(anyhow::anyhow!("broker unreachable"))
            } else {
                this.sent.lock().unwrap().push((topic, payload));
                Ok(())
            };
            this.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }
}

// ----------------------------
// Store
// ----------------------------

#[derive(Default)]
pub struct MemoryStore {
    modes: Mutex<HashMap<DeviceType, DeviceModeConfig>>,
    schedules: Mutex<BTreeMap<i64, ScheduleEntry>>,
    next_id: AtomicI64,
    failing: AtomicBool,
    mode_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub fn put_mode(&self, cfg: DeviceModeConfig) {
        self.modes.lock().unwrap().insert(cfg.device_type, cfg);
    }

    pub fn put_schedule(&self, entry: ScheduleEntry) {
        self.schedules.lock().unwrap().insert(entry.id, entry);
    }

    pub fn schedule(&self, id: i64) -> Option<ScheduleEntry> {
        self.schedules.lock().unwrap().get(&id).cloned()
    }

    /// Number of `get_mode` calls served so far.
    pub fn mode_reads(&self) -> usize {
        self.mode_reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }
        Ok(())
    }

    fn mode_or_default(&self, device: DeviceType) -> DeviceModeConfig {
        self.modes
            .lock()
            .unwrap()
            .entry(device)
            .or_insert_with(|| DeviceModeConfig::new_default(device, OffsetDateTime::now_utc()))
            .clone()
    }
}

impl DeviceModeStore for MemoryStore {
    fn get_mode(&self, device: DeviceType) -> impl Future<Output = Result<DeviceModeConfig>> + Send {
        self.mode_reads.fetch_add(1, Ordering::SeqCst);
        let result = self.check().map(|()| self.mode_or_default(device));
        async { result }
    }

    fn upsert_mode(
        &self,
        device: DeviceType,
        patch: &ModePatch,
        now: OffsetDateTime,
    ) -> impl Future<Output = Result<DeviceModeConfig>> + Send {
        let result = self.check().and_then(|()| {
            let mut cfg = self.mode_or_default(device);
            cfg.apply(patch, now)?;
            self.put_mode(cfg.clone());
            Ok(cfg)
        });
        async { result }
    }

    fn list_modes(&self) -> impl Future<Output = Result<Vec<DeviceModeConfig>>> + Send {
        let result = self
            .check()
            .map(|()| self.modes.lock().unwrap().values().cloned().collect());
        async { result }
    }

    fn list_by_mode(&self, mode: Mode) -> impl Future<Output = Result<Vec<DeviceModeConfig>>> + Send {
        let result = self.check().map(|()| {
            self.modes
                .lock()
                .unwrap()
                .values()
                .filter(|m| m.mode == mode && m.is_active && m.device_type.is_actuator())
                .cloned()
                .collect()
        });
        async { result }
    }
}

impl ScheduleStore for MemoryStore {
    fn list_active_at_time(
        &self,
        time: ClockTime,
    ) -> impl Future<Output = Result<Vec<ScheduleEntry>>> + Send {
        let result = self.check().map(|()| {
            self.schedules
                .lock()
                .unwrap()
                .values()
                .filter(|e| e.is_active && e.time == time)
                .cloned()
                .collect()
        });
        async { result }
    }

    fn list_schedules(
        &self,
        filter: &ScheduleFilter,
    ) -> impl Future<Output = Result<Vec<ScheduleEntry>>> + Send {
        let result = self.check().map(|()| {
            self.schedules
                .lock()
                .unwrap()
                .values()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect()
        });
        async { result }
    }

    fn get_schedule(&self, id: i64) -> impl Future<Output = Result<Option<ScheduleEntry>>> + Send {
        let result = self.check().map(|()| self.schedule(id));
        async { result }
    }

    fn insert_schedule(&self, new: &NewSchedule) -> impl Future<Output = Result<ScheduleEntry>> + Send {
        let result = self.check().and_then(|()| {
            new.repeat.validate()?;
            let entry = ScheduleEntry {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                device_type: new.device_type,
                action: new.action,
                time: new.time,
                repeat: new.repeat.clone(),
                is_active: new.is_active,
                description: new.description.clone(),
                next_run: new.next_run,
                last_run: None,
            };
            self.put_schedule(entry.clone());
            Ok(entry)
        });
        async { result }
    }

    fn save_schedule(&self, entry: &ScheduleEntry) -> impl Future<Output = Result<()>> + Send {
        let result = self.check().and_then(|()| {
            let mut all = self.schedules.lock().unwrap();
            match all.get_mut(&entry.id) {
                Some(slot) => {
                    *slot = entry.clone();
                    Ok(())
                }
                None => bail!("schedule {} does not exist", entry.id),
            }
        });
        async { result }
    }

    fn delete_schedule(&self, id: i64) -> impl Future<Output = Result<bool>> + Send {
        let result = self
            .check()
            .map(|()| self.schedules.lock().unwrap().remove(&id).is_some());
        async { result }
    }
}
