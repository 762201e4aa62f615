use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Supabase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub redis_url: Option<String>,
    pub storage_backend: StorageBackend,
    pub lock_backend: LockBackend,
    pub slot_lock_ttl_seconds: u64,
    pub default_max_bookings: u32,
    pub admit_max_retries: u32,
    pub max_reschedules: u32,
    pub server_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_jwt_secret: String::new(),
            redis_url: None,
            storage_backend: StorageBackend::Memory,
            lock_backend: LockBackend::Memory,
            slot_lock_ttl_seconds: 300,
            default_max_bookings: 3,
            admit_max_retries: 8,
            max_reschedules: 2,
            server_port: 3000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok(),
            storage_backend: match env::var("STORAGE_BACKEND").as_deref() {
                Ok("supabase") => StorageBackend::Supabase,
                Ok("memory") | Err(_) => StorageBackend::Memory,
                Ok(other) => {
                    warn!("Unknown STORAGE_BACKEND '{}', using in-memory storage", other);
                    StorageBackend::Memory
                }
            },
            lock_backend: match env::var("LOCK_BACKEND").as_deref() {
                Ok("redis") => LockBackend::Redis,
                Ok("memory") | Err(_) => LockBackend::Memory,
                Ok(other) => {
                    warn!("Unknown LOCK_BACKEND '{}', using in-process lock table", other);
                    LockBackend::Memory
                }
            },
            slot_lock_ttl_seconds: parse_or("SLOT_LOCK_TTL_SECONDS", defaults.slot_lock_ttl_seconds),
            default_max_bookings: parse_or("DEFAULT_MAX_BOOKINGS", defaults.default_max_bookings),
            admit_max_retries: parse_or("ADMIT_MAX_RETRIES", defaults.admit_max_retries),
            max_reschedules: parse_or("MAX_RESCHEDULES", defaults.max_reschedules),
            server_port: parse_or("SERVER_PORT", defaults.server_port),
        };

        if config.storage_backend == StorageBackend::Supabase && !config.is_configured() {
            warn!("STORAGE_BACKEND=supabase but Supabase is not fully configured");
        }

        if config.lock_backend == LockBackend::Redis && config.redis_url.is_none() {
            warn!("LOCK_BACKEND=redis but REDIS_URL is not set");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
