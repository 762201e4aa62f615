use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::error::ScheduleError;
use crate::models::RoomInfo;

/// Read-only lookups into the hospital/doctor/room CRUD collections that this
/// cell does not own.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn doctor_name(&self, doctor_id: Uuid) -> Result<Option<String>, ScheduleError>;
    async fn hospital_name(&self, hospital_id: Uuid) -> Result<Option<String>, ScheduleError>;
    async fn room(&self, room_id: Uuid) -> Result<Option<RoomInfo>, ScheduleError>;
}

/// Directory backed by maps. With `accept_unknown` set, ids that were never
/// registered are treated as existing entities without a display name, which
/// is what a deployment without a directory source wants.
#[derive(Default)]
pub struct InMemoryDirectory {
    doctors: HashMap<Uuid, String>,
    hospitals: HashMap<Uuid, String>,
    rooms: HashMap<Uuid, RoomInfo>,
    accept_unknown: bool,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissive() -> Self {
        Self {
            accept_unknown: true,
            ..Self::default()
        }
    }

    pub fn with_doctor(mut self, id: Uuid, name: &str) -> Self {
        self.doctors.insert(id, name.to_string());
        self
    }

    pub fn with_hospital(mut self, id: Uuid, name: &str) -> Self {
        self.hospitals.insert(id, name.to_string());
        self
    }

    pub fn with_room(mut self, id: Uuid, hospital_id: Uuid, name: &str) -> Self {
        self.rooms.insert(id, RoomInfo { id, hospital_id: Some(hospital_id), name: Some(name.to_string()) });
        self
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn doctor_name(&self, doctor_id: Uuid) -> Result<Option<String>, ScheduleError> {
        Ok(match self.doctors.get(&doctor_id) {
            Some(name) => Some(name.clone()),
            None if self.accept_unknown => Some(String::new()),
            None => None,
        })
    }

    async fn hospital_name(&self, hospital_id: Uuid) -> Result<Option<String>, ScheduleError> {
        Ok(match self.hospitals.get(&hospital_id) {
            Some(name) => Some(name.clone()),
            None if self.accept_unknown => Some(String::new()),
            None => None,
        })
    }

    async fn room(&self, room_id: Uuid) -> Result<Option<RoomInfo>, ScheduleError> {
        Ok(match self.rooms.get(&room_id) {
            Some(room) => Some(room.clone()),
            None if self.accept_unknown => Some(RoomInfo { id: room_id, hospital_id: None, name: None }),
            None => None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct NamedRow {
    full_name: Option<String>,
    name: Option<String>,
}

pub struct SupabaseDirectory {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseDirectory {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    async fn named(&self, path: String) -> Result<Option<String>, ScheduleError> {
        let rows: Vec<NamedRow> = self.supabase.request(Method::GET, &path, None, None).await?;
        Ok(rows
            .into_iter()
            .next()
            .map(|row| row.full_name.or(row.name).unwrap_or_default()))
    }
}

#[async_trait]
impl Directory for SupabaseDirectory {
    async fn doctor_name(&self, doctor_id: Uuid) -> Result<Option<String>, ScheduleError> {
        self.named(format!("/rest/v1/doctors?id=eq.{}&select=full_name", doctor_id)).await
    }

    async fn hospital_name(&self, hospital_id: Uuid) -> Result<Option<String>, ScheduleError> {
        self.named(format!("/rest/v1/hospitals?id=eq.{}&select=name", hospital_id)).await
    }

    async fn room(&self, room_id: Uuid) -> Result<Option<RoomInfo>, ScheduleError> {
        let path = format!("/rest/v1/rooms?id=eq.{}&select=id,hospital_id,name", room_id);
        let rows: Vec<RoomInfo> = self.supabase.request(Method::GET, &path, None, None).await?;
        Ok(rows.into_iter().next())
    }
}
