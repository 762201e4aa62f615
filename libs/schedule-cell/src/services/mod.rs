pub mod conflict;
pub mod directory;
pub mod repository;
pub mod schedule;
pub mod slot_store;
pub mod supabase;

pub use conflict::*;
pub use directory::*;
pub use repository::*;
pub use schedule::*;
pub use slot_store::*;
pub use supabase::*;
