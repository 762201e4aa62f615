use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use booking_cell::{booking_routes, realtime_routes, BookingCellState};
use schedule_cell::{schedule_routes, ScheduleCellState};

pub fn create_router(schedules: Arc<ScheduleCellState>, bookings: Arc<BookingCellState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Hospital booking API is running!" }))
        .nest("/schedules", schedule_routes(schedules))
        .nest("/appointments", booking_routes(bookings.clone()))
        .nest("/realtime", realtime_routes(bookings))
}
