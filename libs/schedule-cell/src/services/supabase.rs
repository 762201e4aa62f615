use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Method;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use shared_database::supabase::{is_conflict, SupabaseClient};

use crate::error::ScheduleError;
use crate::models::{Schedule, TimeSlot};
use crate::services::repository::ScheduleRepository;

const RETURN_REPRESENTATION: (&str, &str) = ("prefer", "return=representation");

/// `schedules` table: one row per (doctor_id, date) with the slot array in a
/// `time_slots` jsonb column and an integer `version`. The table is expected
/// to carry a unique constraint on (doctor_id, date).
pub struct SupabaseScheduleRepository {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseScheduleRepository {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    async fn select(&self, filter: String) -> Result<Vec<Schedule>, ScheduleError> {
        let path = format!("/rest/v1/schedules?{}&select=*", filter);
        let rows: Vec<Schedule> = self.supabase.request(Method::GET, &path, None, None).await?;
        Ok(rows)
    }
}

#[async_trait]
impl ScheduleRepository for SupabaseScheduleRepository {
    async fn get(&self, schedule_id: Uuid) -> Result<Option<Schedule>, ScheduleError> {
        Ok(self.select(format!("id=eq.{}", schedule_id)).await?.into_iter().next())
    }

    async fn find_by_doctor_and_date(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<Schedule>, ScheduleError> {
        Ok(self
            .select(format!("doctor_id=eq.{}&date=eq.{}", doctor_id, date))
            .await?
            .into_iter()
            .next())
    }

    async fn find_by_date(&self, date: NaiveDate) -> Result<Vec<Schedule>, ScheduleError> {
        self.select(format!("date=eq.{}", date)).await
    }

    async fn insert(&self, schedule: Schedule) -> Result<Schedule, ScheduleError> {
        let body = serde_json::to_value(&schedule)
            .map_err(|e| ScheduleError::Persistence(format!("Failed to encode schedule: {}", e)))?;

        let result: Result<Vec<Schedule>, anyhow::Error> = self
            .supabase
            .request_with_headers(
                Method::POST,
                "/rest/v1/schedules",
                None,
                Some(body),
                &[RETURN_REPRESENTATION],
            )
            .await;

        match result {
            Ok(rows) => rows.into_iter().next().ok_or_else(|| {
                ScheduleError::Persistence("Insert returned no schedule row".to_string())
            }),
            Err(e) if is_conflict(&e) => Err(ScheduleError::DuplicateSchedule {
                doctor_id: schedule.doctor_id,
                date: schedule.date,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_slots_if_version(
        &self,
        schedule_id: Uuid,
        expected_version: u64,
        time_slots: Vec<TimeSlot>,
    ) -> Result<Option<Schedule>, ScheduleError> {
        let path = format!(
            "/rest/v1/schedules?id=eq.{}&version=eq.{}",
            schedule_id, expected_version
        );
        let body = json!({
            "time_slots": time_slots,
            "version": expected_version + 1,
            "updated_at": Utc::now(),
        });

        let rows: Vec<Schedule> = self
            .supabase
            .request_with_headers(Method::PATCH, &path, None, Some(body), &[RETURN_REPRESENTATION])
            .await?;

        if rows.is_empty() {
            debug!("Conditional update on schedule {} matched no row at version {}", schedule_id, expected_version);
        }
        Ok(rows.into_iter().next())
    }

    async fn delete_if_version(
        &self,
        schedule_id: Uuid,
        expected_version: u64,
    ) -> Result<bool, ScheduleError> {
        let path = format!(
            "/rest/v1/schedules?id=eq.{}&version=eq.{}",
            schedule_id, expected_version
        );
        let rows: Vec<Schedule> = self
            .supabase
            .request_with_headers(Method::DELETE, &path, None, None, &[RETURN_REPRESENTATION])
            .await?;
        Ok(!rows.is_empty())
    }
}
