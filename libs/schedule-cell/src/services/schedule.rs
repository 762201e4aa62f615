use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::models::{CreateScheduleRequest, Schedule, SlotDefinition, SlotSnapshot, TimeSlot, TimeWindow};
use crate::services::conflict::ConflictChecker;
use crate::services::directory::Directory;
use crate::services::repository::ScheduleRepository;
use crate::services::slot_store::SlotStore;

pub struct ScheduleService {
    repository: Arc<dyn ScheduleRepository>,
    directory: Arc<dyn Directory>,
    conflict_checker: ConflictChecker,
    slot_store: Arc<SlotStore>,
    default_max_bookings: u32,
}

impl ScheduleService {
    pub fn new(
        slot_store: Arc<SlotStore>,
        directory: Arc<dyn Directory>,
        default_max_bookings: u32,
    ) -> Self {
        let repository = slot_store.repository();
        Self {
            conflict_checker: ConflictChecker::new(Arc::clone(&repository), Arc::clone(&directory)),
            repository,
            directory,
            slot_store,
            default_max_bookings: default_max_bookings.max(1),
        }
    }

    /// Validate, check for room/doctor overlaps, then persist. Nothing is
    /// written unless every check passes.
    pub async fn create_schedule(&self, request: CreateScheduleRequest) -> Result<Schedule, ScheduleError> {
        info!(
            "Creating schedule for doctor {} at hospital {} on {} with {} slots",
            request.doctor_id, request.hospital_id, request.date, request.time_slots.len()
        );

        self.validate_slot_definitions(&request.time_slots)?;
        self.verify_references(&request).await?;

        if self
            .repository
            .find_by_doctor_and_date(request.doctor_id, request.date)
            .await?
            .is_some()
        {
            return Err(ScheduleError::DuplicateSchedule {
                doctor_id: request.doctor_id,
                date: request.date,
            });
        }

        let conflicts = self
            .conflict_checker
            .check_conflicts(request.doctor_id, request.date, &request.time_slots)
            .await?;
        if !conflicts.is_empty() {
            warn!(
                "Rejecting schedule for doctor {} on {}: {} conflict(s)",
                request.doctor_id, request.date, conflicts.len()
            );
            return Err(ScheduleError::Conflicts(conflicts));
        }

        let now = Utc::now();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            doctor_id: request.doctor_id,
            hospital_id: request.hospital_id,
            date: request.date,
            time_slots: request
                .time_slots
                .iter()
                .map(|def| TimeSlot::new(
                    &def.start_time,
                    &def.end_time,
                    def.max_bookings.unwrap_or(self.default_max_bookings),
                    def.room_id,
                ))
                .collect(),
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let stored = self.repository.insert(schedule).await?;
        info!("Schedule {} created", stored.id);
        Ok(stored)
    }

    pub async fn get_schedule(&self, schedule_id: Uuid) -> Result<Schedule, ScheduleError> {
        self.slot_store.schedule(schedule_id).await
    }

    pub async fn get_doctor_schedule(&self, doctor_id: Uuid, date: NaiveDate) -> Result<Option<Schedule>, ScheduleError> {
        self.repository.find_by_doctor_and_date(doctor_id, date).await
    }

    /// Occupancy for a doctor's day, empty when there is no schedule.
    pub async fn slot_snapshots(&self, doctor_id: Uuid, date: NaiveDate) -> Result<Vec<SlotSnapshot>, ScheduleError> {
        Ok(self
            .get_doctor_schedule(doctor_id, date)
            .await?
            .map(|schedule| schedule.snapshots())
            .unwrap_or_default())
    }

    pub async fn update_slot_capacity(
        &self,
        schedule_id: Uuid,
        slot_start: &str,
        max_bookings: u32,
    ) -> Result<SlotSnapshot, ScheduleError> {
        self.slot_store.set_capacity(schedule_id, slot_start, max_bookings).await
    }

    /// Only schedules with no bookings can go; a booked slot would otherwise
    /// leave appointments pointing at nothing.
    pub async fn delete_schedule(&self, schedule_id: Uuid) -> Result<(), ScheduleError> {
        let schedule = self.slot_store.schedule(schedule_id).await?;
        if schedule.has_bookings() {
            return Err(ScheduleError::HasBookings(schedule_id));
        }

        if !self.repository.delete_if_version(schedule_id, schedule.version).await? {
            // Someone booked or edited in between.
            return Err(ScheduleError::HasBookings(schedule_id));
        }

        info!("Schedule {} deleted", schedule_id);
        Ok(())
    }

    fn validate_slot_definitions(&self, slots: &[SlotDefinition]) -> Result<(), ScheduleError> {
        if slots.is_empty() {
            return Err(ScheduleError::Validation("A schedule needs at least one time slot".to_string()));
        }

        let mut windows: Vec<TimeWindow> = Vec::with_capacity(slots.len());
        for def in slots {
            let window = TimeWindow::parse(&def.start_time, &def.end_time)?;

            if def.max_bookings == Some(0) {
                return Err(ScheduleError::Validation(format!(
                    "Slot {} must allow at least one booking", window
                )));
            }

            if let Some(clash) = windows.iter().find(|w| w.overlaps(&window)) {
                return Err(ScheduleError::Validation(format!(
                    "Slot {} overlaps slot {} in the same schedule", window, clash
                )));
            }
            windows.push(window);
        }

        Ok(())
    }

    async fn verify_references(&self, request: &CreateScheduleRequest) -> Result<(), ScheduleError> {
        if self.directory.doctor_name(request.doctor_id).await?.is_none() {
            return Err(ScheduleError::Validation(format!("Doctor {} does not exist", request.doctor_id)));
        }
        if self.directory.hospital_name(request.hospital_id).await?.is_none() {
            return Err(ScheduleError::Validation(format!("Hospital {} does not exist", request.hospital_id)));
        }

        for room_id in request.time_slots.iter().filter_map(|def| def.room_id) {
            let room = self
                .directory
                .room(room_id)
                .await?
                .ok_or_else(|| ScheduleError::Validation(format!("Room {} does not exist", room_id)))?;

            if let Some(hospital_id) = room.hospital_id {
                if hospital_id != request.hospital_id {
                    return Err(ScheduleError::Validation(format!(
                        "Room {} belongs to a different hospital", room_id
                    )));
                }
            }
        }

        Ok(())
    }
}
