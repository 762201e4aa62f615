use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use tokio::sync::RwLock;
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::error::BookingError;
use crate::models::Appointment;

/// Appointment records live outside the admission core; the coordinator only
/// needs to create, read and replace them.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn create(&self, appointment: Appointment) -> Result<Appointment, BookingError>;
    async fn get(&self, appointment_id: Uuid) -> Result<Option<Appointment>, BookingError>;

    /// Conditional write: stores `appointment` only if the stored version
    /// still equals `expected_version`, bumping the version. `Ok(None)` means
    /// another writer got there first and the caller must re-read.
    async fn update_if_version(
        &self,
        appointment: Appointment,
        expected_version: u64,
    ) -> Result<Option<Appointment>, BookingError>;
}

#[derive(Default)]
pub struct InMemoryAppointmentStore {
    appointments: RwLock<HashMap<Uuid, Appointment>>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppointmentStore for InMemoryAppointmentStore {
    async fn create(&self, appointment: Appointment) -> Result<Appointment, BookingError> {
        let mut appointments = self.appointments.write().await;
        if appointments.contains_key(&appointment.id) {
            return Err(BookingError::Persistence(format!("Appointment {} already exists", appointment.id)));
        }
        appointments.insert(appointment.id, appointment.clone());
        Ok(appointment)
    }

    async fn get(&self, appointment_id: Uuid) -> Result<Option<Appointment>, BookingError> {
        Ok(self.appointments.read().await.get(&appointment_id).cloned())
    }

    async fn update_if_version(
        &self,
        mut appointment: Appointment,
        expected_version: u64,
    ) -> Result<Option<Appointment>, BookingError> {
        let mut appointments = self.appointments.write().await;
        let Some(existing) = appointments.get_mut(&appointment.id) else {
            return Err(BookingError::NotFound(format!("Appointment {}", appointment.id)));
        };
        if existing.version != expected_version {
            return Ok(None);
        }

        appointment.version = expected_version + 1;
        *existing = appointment.clone();
        Ok(Some(appointment))
    }
}

pub struct SupabaseAppointmentStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseAppointmentStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

const RETURN_REPRESENTATION: (&str, &str) = ("prefer", "return=representation");

#[async_trait]
impl AppointmentStore for SupabaseAppointmentStore {
    async fn create(&self, appointment: Appointment) -> Result<Appointment, BookingError> {
        let body = serde_json::to_value(&appointment)
            .map_err(|e| BookingError::Persistence(format!("Failed to encode appointment: {}", e)))?;

        let rows: Vec<Appointment> = self
            .supabase
            .request_with_headers(Method::POST, "/rest/v1/appointments", None, Some(body), &[RETURN_REPRESENTATION])
            .await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| BookingError::Persistence("Insert returned no appointment row".to_string()))
    }

    async fn get(&self, appointment_id: Uuid) -> Result<Option<Appointment>, BookingError> {
        let path = format!("/rest/v1/appointments?id=eq.{}&select=*", appointment_id);
        let rows: Vec<Appointment> = self.supabase.request(Method::GET, &path, None, None).await?;
        Ok(rows.into_iter().next())
    }

    /// `PATCH ?id=eq.<id>&version=eq.<n>`; an empty representation means the
    /// row moved on (or is gone) since it was read.
    async fn update_if_version(
        &self,
        mut appointment: Appointment,
        expected_version: u64,
    ) -> Result<Option<Appointment>, BookingError> {
        let path = format!(
            "/rest/v1/appointments?id=eq.{}&version=eq.{}",
            appointment.id, expected_version
        );
        appointment.version = expected_version + 1;
        let body = serde_json::to_value(&appointment)
            .map_err(|e| BookingError::Persistence(format!("Failed to encode appointment: {}", e)))?;

        let rows: Vec<Appointment> = self
            .supabase
            .request_with_headers(Method::PATCH, &path, None, Some(body), &[RETURN_REPRESENTATION])
            .await?;

        Ok(rows.into_iter().next())
    }
}
