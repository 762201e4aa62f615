use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::{auth::User, error::AppError};
use shared_utils::extractor::is_admin;

use crate::models::{Appointment, BookSlotRequest, RescheduleRequest};
use crate::services::coordinator::BookingCoordinator;
use crate::services::realtime::RealtimeHub;

pub struct BookingCellState {
    pub config: Arc<AppConfig>,
    pub coordinator: Arc<BookingCoordinator>,
    pub hub: Arc<RealtimeHub>,
}

fn user_uuid(user: &User) -> Result<Uuid, AppError> {
    Uuid::parse_str(&user.id).map_err(|_| AppError::BadRequest("Invalid user ID format".to_string()))
}

/// Patient, treating doctor, or admin.
fn can_access(user: &User, appointment: &Appointment) -> bool {
    is_admin(user)
        || user.id == appointment.patient_id.to_string()
        || user.id == appointment.doctor_id.to_string()
}

pub async fn book_appointment(
    State(state): State<Arc<BookingCellState>>,
    Extension(user): Extension<User>,
    Json(request): Json<BookSlotRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let patient_id = user_uuid(&user)?;
    info!("Booking request from {} for {} {}", user.id, request.schedule_id, request.slot_start);

    let receipt = state.coordinator.book(patient_id, &user.id, request).await?;

    Ok((StatusCode::CREATED, Json(json!({
        "success": true,
        "appointment": receipt.appointment,
        "room_id": receipt.room_id,
        "slot": receipt.slot
    }))))
}

pub async fn get_appointment(
    State(state): State<Arc<BookingCellState>>,
    Extension(user): Extension<User>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.coordinator.appointment(appointment_id).await?;
    if !can_access(&user, &appointment) {
        return Err(AppError::Forbidden("Not authorized to view this appointment".to_string()));
    }

    Ok(Json(json!({ "appointment": appointment })))
}

pub async fn cancel_appointment(
    State(state): State<Arc<BookingCellState>>,
    Extension(user): Extension<User>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.coordinator.appointment(appointment_id).await?;
    if !can_access(&user, &appointment) {
        return Err(AppError::Forbidden("Not authorized to cancel this appointment".to_string()));
    }

    let cancelled = state.coordinator.cancel(appointment_id).await?;
    Ok(Json(json!({
        "success": true,
        "appointment": cancelled
    })))
}

pub async fn reschedule_appointment(
    State(state): State<Arc<BookingCellState>>,
    Extension(user): Extension<User>,
    Path(appointment_id): Path<Uuid>,
    Json(request): Json<RescheduleRequest>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.coordinator.appointment(appointment_id).await?;
    if !(is_admin(&user) || user.id == appointment.patient_id.to_string()) {
        return Err(AppError::Forbidden("Not authorized to reschedule this appointment".to_string()));
    }

    let receipt = state.coordinator.reschedule(appointment_id, &user.id, request).await?;
    Ok(Json(json!({
        "success": true,
        "appointment": receipt.appointment,
        "room_id": receipt.room_id,
        "slot": receipt.slot
    })))
}

pub async fn get_schedule_locks(
    State(state): State<Arc<BookingCellState>>,
    Extension(_user): Extension<User>,
    Path(schedule_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let locks = state.coordinator.locks().locks_for_schedule(schedule_id).await?;
    Ok(Json(json!({
        "schedule_id": schedule_id,
        "locked_slots": locks
    })))
}
