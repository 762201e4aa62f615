use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use schedule_cell::ScheduleError;
use shared_models::error::AppError;

#[derive(Error, Debug)]
pub enum BookingError {
    #[error("Time slot is being booked by another user")]
    LockDenied { held_by: Option<String> },

    #[error("Time slot {slot_start} on schedule {schedule_id} is fully booked")]
    SlotFull { schedule_id: Uuid, slot_start: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Appointment {0} was changed by another request")]
    Concurrent(Uuid),

    #[error("Lock backend error: {0}")]
    LockBackend(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Schedule(ScheduleError),
}

impl From<ScheduleError> for BookingError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Validation(msg) => BookingError::Validation(msg),
            ScheduleError::NotFound(id) => BookingError::NotFound(format!("Schedule {}", id)),
            ScheduleError::SlotNotFound { schedule_id, slot_start } => {
                BookingError::NotFound(format!("Time slot {} on schedule {}", slot_start, schedule_id))
            }
            ScheduleError::Persistence(msg) => BookingError::Persistence(msg),
            ScheduleError::ContentionExhausted { .. } => BookingError::Persistence(err.to_string()),
            other => BookingError::Schedule(other),
        }
    }
}

impl From<anyhow::Error> for BookingError {
    fn from(err: anyhow::Error) -> Self {
        BookingError::Persistence(err.to_string())
    }
}

impl From<redis::RedisError> for BookingError {
    fn from(err: redis::RedisError) -> Self {
        BookingError::LockBackend(err.to_string())
    }
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::LockDenied { .. } => AppError::ConflictWithDetails {
                message: err.to_string(),
                code: "LOCK_DENIED".to_string(),
                details: json!({ "retry": "wait" }),
            },
            BookingError::SlotFull { ref schedule_id, ref slot_start } => AppError::ConflictWithDetails {
                message: err.to_string(),
                details: json!({
                    "retry": "choose_another_slot",
                    "schedule_id": schedule_id,
                    "slot_start": slot_start
                }),
                code: "SLOT_FULL".to_string(),
            },
            BookingError::Validation(msg) => AppError::ValidationError(msg),
            BookingError::NotFound(msg) => AppError::NotFound(msg),
            BookingError::Concurrent(_) => AppError::Conflict(err.to_string()),
            BookingError::LockBackend(msg) => AppError::Internal(msg),
            BookingError::Persistence(msg) => AppError::Database(msg),
            BookingError::Schedule(inner) => inner.into(),
        }
    }
}
