// libs/schedule-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, State, Extension},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;
use shared_utils::extractor::is_admin;

use crate::models::{CreateScheduleRequest, UpdateCapacityRequest};
use crate::services::schedule::ScheduleService;

pub struct ScheduleCellState {
    pub config: Arc<AppConfig>,
    pub schedules: Arc<ScheduleService>,
}

/// Admins create schedules for anyone; a doctor only for themselves.
fn can_manage_doctor(user: &User, doctor_id: Uuid) -> bool {
    is_admin(user) || (user.role.as_deref() == Some("doctor") && user.id == doctor_id.to_string())
}

// ==============================================================================
// SCHEDULE HANDLERS
// ==============================================================================

pub async fn create_schedule(
    State(state): State<Arc<ScheduleCellState>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if !can_manage_doctor(&user, request.doctor_id) {
        return Err(AppError::Forbidden("Not authorized to manage this doctor's schedule".to_string()));
    }

    info!("Schedule creation by {} for doctor {} on {}", user.id, request.doctor_id, request.date);
    let schedule = state.schedules.create_schedule(request).await?;

    Ok((StatusCode::CREATED, Json(json!({
        "success": true,
        "schedule": schedule
    }))))
}

pub async fn get_schedule(
    State(state): State<Arc<ScheduleCellState>>,
    Extension(_user): Extension<User>,
    Path(schedule_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let schedule = state.schedules.get_schedule(schedule_id).await?;
    Ok(Json(json!({ "schedule": schedule })))
}

pub async fn get_doctor_schedule(
    State(state): State<Arc<ScheduleCellState>>,
    Extension(_user): Extension<User>,
    Path((doctor_id, date)): Path<(Uuid, NaiveDate)>,
) -> Result<Json<Value>, AppError> {
    let schedule = state
        .schedules
        .get_doctor_schedule(doctor_id, date)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No schedule for doctor {} on {}", doctor_id, date)))?;

    Ok(Json(json!({ "schedule": schedule })))
}

/// Occupancy only, no appointment ids: this is what patients browse.
pub async fn get_slot_snapshots(
    State(state): State<Arc<ScheduleCellState>>,
    Extension(_user): Extension<User>,
    Path((doctor_id, date)): Path<(Uuid, NaiveDate)>,
) -> Result<Json<Value>, AppError> {
    let slots = state.schedules.slot_snapshots(doctor_id, date).await?;
    Ok(Json(json!({
        "doctor_id": doctor_id,
        "date": date,
        "slots": slots
    })))
}

pub async fn update_slot_capacity(
    State(state): State<Arc<ScheduleCellState>>,
    Extension(user): Extension<User>,
    Path((schedule_id, slot_start)): Path<(Uuid, String)>,
    Json(request): Json<UpdateCapacityRequest>,
) -> Result<Json<Value>, AppError> {
    if !is_admin(&user) {
        return Err(AppError::Forbidden("Only administrators can change slot capacity".to_string()));
    }

    let snapshot = state
        .schedules
        .update_slot_capacity(schedule_id, &slot_start, request.max_bookings)
        .await?;

    Ok(Json(json!({
        "success": true,
        "slot": snapshot
    })))
}

pub async fn delete_schedule(
    State(state): State<Arc<ScheduleCellState>>,
    Extension(user): Extension<User>,
    Path(schedule_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let schedule = state.schedules.get_schedule(schedule_id).await?;
    if !can_manage_doctor(&user, schedule.doctor_id) {
        return Err(AppError::Forbidden("Not authorized to manage this doctor's schedule".to_string()));
    }

    state.schedules.delete_schedule(schedule_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Schedule deleted"
    })))
}
