use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::models::{Schedule, TimeSlot};

/// Persistence port for schedule documents. One document per (doctor, date);
/// implementations must enforce that uniqueness on insert.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn get(&self, schedule_id: Uuid) -> Result<Option<Schedule>, ScheduleError>;

    async fn find_by_doctor_and_date(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<Schedule>, ScheduleError>;

    /// Every schedule on a calendar date, any doctor, any hospital.
    async fn find_by_date(&self, date: NaiveDate) -> Result<Vec<Schedule>, ScheduleError>;

    /// Fails with `DuplicateSchedule` when the doctor already has a schedule
    /// on that date.
    async fn insert(&self, schedule: Schedule) -> Result<Schedule, ScheduleError>;

    /// Conditional write: replaces the slot array only if the stored version
    /// still equals `expected_version`, bumping the version. `Ok(None)` means
    /// another writer got there first and the caller must re-read.
    async fn replace_slots_if_version(
        &self,
        schedule_id: Uuid,
        expected_version: u64,
        time_slots: Vec<TimeSlot>,
    ) -> Result<Option<Schedule>, ScheduleError>;

    /// Conditional delete with the same version semantics.
    async fn delete_if_version(
        &self,
        schedule_id: Uuid,
        expected_version: u64,
    ) -> Result<bool, ScheduleError>;
}

#[derive(Default)]
pub struct InMemoryScheduleRepository {
    schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn get(&self, schedule_id: Uuid) -> Result<Option<Schedule>, ScheduleError> {
        Ok(self.schedules.read().await.get(&schedule_id).cloned())
    }

    async fn find_by_doctor_and_date(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<Schedule>, ScheduleError> {
        let schedules = self.schedules.read().await;
        Ok(schedules
            .values()
            .find(|s| s.doctor_id == doctor_id && s.date == date)
            .cloned())
    }

    async fn find_by_date(&self, date: NaiveDate) -> Result<Vec<Schedule>, ScheduleError> {
        let schedules = self.schedules.read().await;
        Ok(schedules.values().filter(|s| s.date == date).cloned().collect())
    }

    async fn insert(&self, schedule: Schedule) -> Result<Schedule, ScheduleError> {
        let mut schedules = self.schedules.write().await;

        if schedules
            .values()
            .any(|s| s.doctor_id == schedule.doctor_id && s.date == schedule.date)
        {
            return Err(ScheduleError::DuplicateSchedule {
                doctor_id: schedule.doctor_id,
                date: schedule.date,
            });
        }

        schedules.insert(schedule.id, schedule.clone());
        debug!("Stored schedule {} for doctor {} on {}", schedule.id, schedule.doctor_id, schedule.date);
        Ok(schedule)
    }

    async fn replace_slots_if_version(
        &self,
        schedule_id: Uuid,
        expected_version: u64,
        time_slots: Vec<TimeSlot>,
    ) -> Result<Option<Schedule>, ScheduleError> {
        let mut schedules = self.schedules.write().await;
        let stored = schedules
            .get_mut(&schedule_id)
            .ok_or(ScheduleError::NotFound(schedule_id))?;

        if stored.version != expected_version {
            return Ok(None);
        }

        stored.time_slots = time_slots;
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(Some(stored.clone()))
    }

    async fn delete_if_version(
        &self,
        schedule_id: Uuid,
        expected_version: u64,
    ) -> Result<bool, ScheduleError> {
        let mut schedules = self.schedules.write().await;
        match schedules.get(&schedule_id) {
            Some(stored) if stored.version == expected_version => {
                schedules.remove(&schedule_id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(ScheduleError::NotFound(schedule_id)),
        }
    }
}
