use chrono::NaiveDate;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use shared_models::error::AppError;

use crate::models::ConflictRecord;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Schedule not found: {0}")]
    NotFound(Uuid),

    #[error("Time slot {slot_start} not found on schedule {schedule_id}")]
    SlotNotFound { schedule_id: Uuid, slot_start: String },

    #[error("Doctor {doctor_id} already has a schedule on {date}")]
    DuplicateSchedule { doctor_id: Uuid, date: NaiveDate },

    #[error("Schedule conflicts with {} existing booking window(s)", .0.len())]
    Conflicts(Vec<ConflictRecord>),

    #[error("Capacity {requested} is below the {booked} bookings already in the slot")]
    CapacityBelowBookings { requested: u32, booked: u32 },

    #[error("Schedule {0} still has booked slots")]
    HasBookings(Uuid),

    #[error("Gave up on schedule {schedule_id} after {attempts} concurrent write conflicts")]
    ContentionExhausted { schedule_id: Uuid, attempts: u32 },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<anyhow::Error> for ScheduleError {
    fn from(err: anyhow::Error) -> Self {
        ScheduleError::Persistence(err.to_string())
    }
}

impl From<ScheduleError> for AppError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Validation(msg) => AppError::ValidationError(msg),
            ScheduleError::NotFound(_) | ScheduleError::SlotNotFound { .. } => {
                AppError::NotFound(err.to_string())
            }
            ScheduleError::DuplicateSchedule { doctor_id, date } => AppError::ConflictWithDetails {
                message: err.to_string(),
                code: "DUPLICATE_SCHEDULE".to_string(),
                details: json!({ "doctor_id": doctor_id, "date": date }),
            },
            ScheduleError::Conflicts(ref conflicts) => AppError::ConflictWithDetails {
                message: err.to_string(),
                code: "SCHEDULE_CONFLICT".to_string(),
                details: json!({ "conflicts": conflicts }),
            },
            ScheduleError::CapacityBelowBookings { .. } | ScheduleError::HasBookings(_) => {
                AppError::Conflict(err.to_string())
            }
            ScheduleError::ContentionExhausted { .. } => AppError::Conflict(err.to_string()),
            ScheduleError::Persistence(msg) => AppError::Database(msg),
        }
    }
}
