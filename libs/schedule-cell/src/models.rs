// libs/schedule-cell/src/models.rs
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScheduleError;

// ==============================================================================
// TIME HANDLING
// ==============================================================================

/// Parse a local "HH:MM" (or "HH:MM:SS" as stored by Postgres `time`) into a
/// minute-of-day offset. Dates never enter the comparison.
pub fn parse_minutes(value: &str) -> Result<u16, ScheduleError> {
    let trimmed = value.trim();
    let time = NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| ScheduleError::Validation(format!("Invalid time '{}', expected HH:MM", value)))?;

    Ok((time.hour() * 60 + time.minute()) as u16)
}

pub fn format_minutes(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Half-open `[start, end)` window in minutes from local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub start: u16,
    pub end: u16,
}

impl TimeWindow {
    pub fn parse(start: &str, end: &str) -> Result<Self, ScheduleError> {
        let window = Self {
            start: parse_minutes(start)?,
            end: parse_minutes(end)?,
        };

        if window.end <= window.start {
            return Err(ScheduleError::Validation(format!(
                "Slot end {} must be after start {}",
                end, start
            )));
        }

        Ok(window)
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn intersection(&self, other: &TimeWindow) -> Option<TimeWindow> {
        if !self.overlaps(other) {
            return None;
        }
        Some(TimeWindow {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_minutes(self.start), format_minutes(self.end))
    }
}

// ==============================================================================
// SCHEDULE DOCUMENT
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start_time: String,
    pub end_time: String,
    pub max_bookings: u32,
    #[serde(default)]
    pub booked_count: u32,
    #[serde(default)]
    pub is_booked: bool,
    #[serde(default)]
    pub appointment_ids: Vec<Uuid>,
    pub room_id: Option<Uuid>,
}

impl TimeSlot {
    pub fn new(start_time: &str, end_time: &str, max_bookings: u32, room_id: Option<Uuid>) -> Self {
        Self {
            start_time: start_time.to_string(),
            end_time: end_time.to_string(),
            max_bookings,
            booked_count: 0,
            is_booked: false,
            appointment_ids: Vec::new(),
            room_id,
        }
    }

    pub fn window(&self) -> Result<TimeWindow, ScheduleError> {
        TimeWindow::parse(&self.start_time, &self.end_time)
    }

    pub fn holds(&self, appointment_id: &Uuid) -> bool {
        self.appointment_ids.contains(appointment_id)
    }

    pub(crate) fn refresh_is_booked(&mut self) {
        self.is_booked = self.booked_count >= self.max_bookings;
    }
}

/// One doctor's bookable day at one hospital. `version` is bumped by every
/// write and is what the optimistic slot updates are conditioned on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub hospital_id: Uuid,
    pub date: NaiveDate,
    pub time_slots: Vec<TimeSlot>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Find a slot by its start time. Keys are compared as minute offsets so
    /// "9:00" and "09:00" address the same slot.
    pub fn slot_index(&self, slot_start: &str) -> Result<Option<usize>, ScheduleError> {
        let wanted = parse_minutes(slot_start)?;
        Ok(self
            .time_slots
            .iter()
            .position(|slot| parse_minutes(&slot.start_time).map(|m| m == wanted).unwrap_or(false)))
    }

    pub fn slot(&self, slot_start: &str) -> Result<Option<&TimeSlot>, ScheduleError> {
        Ok(self.slot_index(slot_start)?.map(|idx| &self.time_slots[idx]))
    }

    pub fn snapshot(&self, index: usize) -> Option<SlotSnapshot> {
        self.time_slots.get(index).map(|slot| SlotSnapshot {
            schedule_id: self.id,
            doctor_id: self.doctor_id,
            date: self.date,
            start_time: slot.start_time.clone(),
            end_time: slot.end_time.clone(),
            is_booked: slot.is_booked,
            booked_count: slot.booked_count,
            max_bookings: slot.max_bookings,
        })
    }

    pub fn snapshots(&self) -> Vec<SlotSnapshot> {
        (0..self.time_slots.len()).filter_map(|idx| self.snapshot(idx)).collect()
    }

    pub fn has_bookings(&self) -> bool {
        self.time_slots.iter().any(|slot| slot.booked_count > 0)
    }
}

/// Occupancy view of one slot that is safe to show to every viewer of a
/// doctor's calendar: it never carries appointment ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub schedule_id: Uuid,
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub is_booked: bool,
    pub booked_count: u32,
    pub max_bookings: u32,
}

// ==============================================================================
// ADMISSION OUTCOMES
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Capacity taken. Also returned when the appointment already held a place
    /// in the slot, which keeps `appointment_ids` free of duplicates.
    Admitted {
        snapshot: SlotSnapshot,
        room_id: Option<Uuid>,
    },
    Full(SlotSnapshot),
    SlotNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(SlotSnapshot),
    /// The appointment held no place in the slot. Nothing was written.
    NotHeld(SlotSnapshot),
    SlotNotFound,
}

impl ReleaseOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, ReleaseOutcome::SlotNotFound)
    }
}

/// Emitted by the slot store after every committed occupancy or capacity change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    Changed(SlotSnapshot),
}

// ==============================================================================
// CONFLICTS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Room,
    Doctor,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::Room => write!(f, "room"),
            ConflictType::Doctor => write!(f, "doctor"),
        }
    }
}

/// A detected overlap between a proposed slot and an existing schedule's slot.
/// Computed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_type: ConflictType,
    pub proposed_start_time: String,
    pub proposed_end_time: String,
    pub existing_schedule_id: Uuid,
    pub existing_doctor_id: Uuid,
    pub existing_doctor_name: Option<String>,
    pub existing_hospital_id: Uuid,
    pub existing_hospital_name: Option<String>,
    pub existing_start_time: String,
    pub existing_end_time: String,
    pub room_id: Option<Uuid>,
    pub overlap_start: String,
    pub overlap_end: String,
    pub message: String,
}

// ==============================================================================
// REQUESTS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDefinition {
    pub start_time: String,
    pub end_time: String,
    pub max_bookings: Option<u32>,
    pub room_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScheduleRequest {
    pub doctor_id: Uuid,
    pub hospital_id: Uuid,
    pub date: NaiveDate,
    pub time_slots: Vec<SlotDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCapacityRequest {
    pub max_bookings: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: Uuid,
    pub hospital_id: Option<Uuid>,
    pub name: Option<String>,
}
