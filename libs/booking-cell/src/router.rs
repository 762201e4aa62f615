use std::sync::Arc;

use axum::{
    Router,
    routing::{get, patch, post},
    middleware,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers::{self, BookingCellState};
use crate::socket::realtime_socket;

pub fn booking_routes(state: Arc<BookingCellState>) -> Router {
    let protected_routes = Router::new()
        .route("/", post(handlers::book_appointment))
        .route("/{appointment_id}", get(handlers::get_appointment))
        .route("/{appointment_id}/cancel", post(handlers::cancel_appointment))
        .route("/{appointment_id}/reschedule", patch(handlers::reschedule_appointment))
        .route("/locks/{schedule_id}", get(handlers::get_schedule_locks))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(state)
}

/// Token is checked by the upgrade handler itself, not the header middleware.
pub fn realtime_routes(state: Arc<BookingCellState>) -> Router {
    Router::new()
        .route("/ws", get(realtime_socket))
        .with_state(state)
}
