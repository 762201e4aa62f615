// libs/schedule-cell/src/router.rs
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, patch, post},
    middleware,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers::{self, ScheduleCellState};

pub fn schedule_routes(state: Arc<ScheduleCellState>) -> Router {
    let protected_routes = Router::new()
        .route("/", post(handlers::create_schedule))
        .route("/{schedule_id}", get(handlers::get_schedule).delete(handlers::delete_schedule))
        .route("/{schedule_id}/slots/{slot_start}/capacity", patch(handlers::update_slot_capacity))
        .route("/doctors/{doctor_id}/{date}", get(handlers::get_doctor_schedule))
        .route("/doctors/{doctor_id}/{date}/slots", get(handlers::get_slot_snapshots))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(state)
}
