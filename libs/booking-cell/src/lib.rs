pub mod models;
pub mod services;
pub mod error;
pub mod handlers;
pub mod socket;
pub mod router;

pub use models::*;
pub use error::*;
pub use services::*;
pub use handlers::BookingCellState;
pub use router::{booking_routes, realtime_routes};
