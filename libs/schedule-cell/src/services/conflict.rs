use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::models::{format_minutes, ConflictRecord, ConflictType, Schedule, SlotDefinition, TimeWindow};
use crate::services::directory::Directory;
use crate::services::repository::ScheduleRepository;

/// One overlapping pair before names are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedOverlap {
    pub conflict_type: ConflictType,
    pub proposed: TimeWindow,
    pub existing: TimeWindow,
    pub existing_schedule_id: Uuid,
    pub room_id: Option<Uuid>,
}

/// Pure overlap scan. Only proposed slots with a room take part; for each
/// overlapping pair a room conflict is raised when both use the same room and
/// a doctor conflict when both schedules belong to the same doctor.
pub fn find_overlaps(
    doctor_id: Uuid,
    proposed_slots: &[SlotDefinition],
    existing_schedules: &[Schedule],
) -> Result<Vec<DetectedOverlap>, ScheduleError> {
    let mut overlaps = Vec::new();

    for proposed in proposed_slots {
        let Some(room_id) = proposed.room_id else {
            continue;
        };
        let proposed_window = TimeWindow::parse(&proposed.start_time, &proposed.end_time)?;

        for schedule in existing_schedules {
            for existing in &schedule.time_slots {
                let existing_window = match existing.window() {
                    Ok(window) => window,
                    Err(e) => {
                        warn!("Skipping unreadable slot on schedule {}: {}", schedule.id, e);
                        continue;
                    }
                };

                if !proposed_window.overlaps(&existing_window) {
                    continue;
                }

                if existing.room_id == Some(room_id) {
                    overlaps.push(DetectedOverlap {
                        conflict_type: ConflictType::Room,
                        proposed: proposed_window,
                        existing: existing_window,
                        existing_schedule_id: schedule.id,
                        room_id: Some(room_id),
                    });
                }

                if schedule.doctor_id == doctor_id {
                    overlaps.push(DetectedOverlap {
                        conflict_type: ConflictType::Doctor,
                        proposed: proposed_window,
                        existing: existing_window,
                        existing_schedule_id: schedule.id,
                        room_id: existing.room_id,
                    });
                }
            }
        }
    }

    Ok(overlaps)
}

pub struct ConflictChecker {
    repository: Arc<dyn ScheduleRepository>,
    directory: Arc<dyn Directory>,
}

impl ConflictChecker {
    pub fn new(repository: Arc<dyn ScheduleRepository>, directory: Arc<dyn Directory>) -> Self {
        Self { repository, directory }
    }

    /// Check proposed slots for `doctor_id` on `date` against every other
    /// schedule on that date, across all doctors and hospitals.
    pub async fn check_conflicts(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        proposed_slots: &[SlotDefinition],
    ) -> Result<Vec<ConflictRecord>, ScheduleError> {
        if proposed_slots.iter().all(|slot| slot.room_id.is_none()) {
            return Ok(Vec::new());
        }

        let existing: Vec<Schedule> = self.repository.find_by_date(date).await?;

        debug!(
            "Checking {} proposed slots for doctor {} on {} against {} schedules",
            proposed_slots.len(), doctor_id, date, existing.len()
        );

        let overlaps = find_overlaps(doctor_id, proposed_slots, &existing)?;
        if overlaps.is_empty() {
            return Ok(Vec::new());
        }

        let by_id: HashMap<Uuid, &Schedule> = existing.iter().map(|s| (s.id, s)).collect();
        let mut doctor_names: HashMap<Uuid, Option<String>> = HashMap::new();
        let mut hospital_names: HashMap<Uuid, Option<String>> = HashMap::new();
        let mut records = Vec::with_capacity(overlaps.len());

        for overlap in overlaps {
            let Some(schedule) = by_id.get(&overlap.existing_schedule_id) else {
                continue;
            };

            if !doctor_names.contains_key(&schedule.doctor_id) {
                let name = self.directory.doctor_name(schedule.doctor_id).await?;
                doctor_names.insert(schedule.doctor_id, name);
            }
            if !hospital_names.contains_key(&schedule.hospital_id) {
                let name = self.directory.hospital_name(schedule.hospital_id).await?;
                hospital_names.insert(schedule.hospital_id, name);
            }

            let doctor_name = non_empty(doctor_names.get(&schedule.doctor_id));
            let hospital_name = non_empty(hospital_names.get(&schedule.hospital_id));
            records.push(build_record(&overlap, schedule, doctor_name, hospital_name));
        }

        warn!(
            "Detected {} schedule conflict(s) for doctor {} on {}",
            records.len(), doctor_id, date
        );
        Ok(records)
    }
}

fn non_empty(name: Option<&Option<String>>) -> Option<String> {
    name.cloned().flatten().filter(|n| !n.is_empty())
}

fn build_record(
    overlap: &DetectedOverlap,
    schedule: &Schedule,
    doctor_name: Option<String>,
    hospital_name: Option<String>,
) -> ConflictRecord {
    let window = overlap
        .proposed
        .intersection(&overlap.existing)
        .unwrap_or(overlap.proposed);

    let who = doctor_name
        .clone()
        .map(|name| format!("Dr. {}", name))
        .unwrap_or_else(|| format!("doctor {}", schedule.doctor_id));
    let where_ = hospital_name
        .clone()
        .unwrap_or_else(|| format!("hospital {}", schedule.hospital_id));

    let message = match overlap.conflict_type {
        ConflictType::Room => format!(
            "Room {} is already used by {} at {} from {} to {}",
            overlap.room_id.map(|r| r.to_string()).unwrap_or_default(),
            who,
            where_,
            format_minutes(window.start),
            format_minutes(window.end),
        ),
        ConflictType::Doctor => format!(
            "{} is already scheduled at {} from {} to {}",
            who,
            where_,
            format_minutes(window.start),
            format_minutes(window.end),
        ),
    };

    ConflictRecord {
        conflict_type: overlap.conflict_type,
        proposed_start_time: format_minutes(overlap.proposed.start),
        proposed_end_time: format_minutes(overlap.proposed.end),
        existing_schedule_id: schedule.id,
        existing_doctor_id: schedule.doctor_id,
        existing_doctor_name: doctor_name,
        existing_hospital_id: schedule.hospital_id,
        existing_hospital_name: hospital_name,
        existing_start_time: format_minutes(overlap.existing.start),
        existing_end_time: format_minutes(overlap.existing.end),
        room_id: overlap.room_id,
        overlap_start: format_minutes(window.start),
        overlap_end: format_minutes(window.end),
        message,
    }
}
