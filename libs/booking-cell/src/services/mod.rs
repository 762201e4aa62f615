pub mod appointments;
pub mod coordinator;
pub mod lock;
pub mod realtime;
pub mod redis_lock;

pub use appointments::*;
pub use coordinator::*;
pub use lock::*;
pub use realtime::*;
pub use redis_lock::RedisLockTable;
