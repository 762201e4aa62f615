use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use schedule_cell::{format_minutes, parse_minutes, SlotSnapshot};

use crate::error::BookingError;

// ==============================================================================
// SLOT LOCKS
// ==============================================================================

/// Holder allowed to release any lock, used by automated rollback.
pub const SYSTEM_HOLDER: &str = "system";

/// Address of one advisory lock. The slot start is kept normalized to
/// "HH:MM" so "9:00" and "09:00" are the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub schedule_id: Uuid,
    pub slot_start: String,
}

impl LockKey {
    pub fn new(schedule_id: Uuid, slot_start: &str) -> Result<Self, BookingError> {
        let minutes = parse_minutes(slot_start)?;
        Ok(Self {
            schedule_id,
            slot_start: format_minutes(minutes),
        })
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.schedule_id, self.slot_start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAcquisition {
    pub granted: bool,
    /// Current holder after the call: the caller when granted, the other
    /// holder when denied.
    pub held_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub locked: bool,
    pub held_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldLock {
    pub slot_start: String,
    pub held_by: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Granted { key: LockKey, holder: String, expires_at: DateTime<Utc> },
    Released { key: LockKey, holder: String },
    Expired { key: LockKey, holder: String },
}

impl LockEvent {
    pub fn key(&self) -> &LockKey {
        match self {
            LockEvent::Granted { key, .. } | LockEvent::Released { key, .. } | LockEvent::Expired { key, .. } => key,
        }
    }
}

// ==============================================================================
// BOOKING ATTEMPT
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStage {
    LockRequested,
    LockGranted,
    Admitting,
    Admitted,
    AppointmentCreated,
    LockReleased,
    Failed,
}

impl BookingStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStage::LockReleased | BookingStage::Failed)
    }

    pub fn can_transition_to(&self, target: &BookingStage) -> bool {
        use BookingStage::*;
        match (self, target) {
            (LockRequested, LockGranted) => true,
            (LockGranted, Admitting) => true,
            (Admitting, Admitted) => true,
            (Admitted, AppointmentCreated) => true,
            (AppointmentCreated, LockReleased) => true,
            (_, Failed) => !self.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSlotRequest {
    pub schedule_id: Uuid,
    pub slot_start: String,
    pub slot_end: String,
    pub room_id: Option<Uuid>,
    /// When given, must match the schedule's date.
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleRequest {
    pub schedule_id: Uuid,
    pub slot_start: String,
    pub slot_end: String,
    pub room_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingReceipt {
    pub appointment: Appointment,
    pub room_id: Option<Uuid>,
    pub slot: SlotSnapshot,
}

// ==============================================================================
// APPOINTMENTS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    Rejected,
    Rescheduled,
    #[serde(rename = "no-show")]
    NoShow,
}

impl AppointmentStatus {
    /// Statuses that still hold a unit of slot capacity.
    pub fn is_active(&self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Rejected => "rejected",
            AppointmentStatus::Rescheduled => "rescheduled",
            AppointmentStatus::NoShow => "no-show",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub hospital_id: Uuid,
    pub schedule_id: Uuid,
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub room_id: Option<Uuid>,
    pub status: AppointmentStatus,
    #[serde(default)]
    pub reschedule_count: u32,
    /// Bumped by every stored write; status changes are conditioned on it.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ==============================================================================
// REALTIME CHANNEL
// ==============================================================================

/// (doctor, date) pair whose calendar a client is viewing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalendarKey {
    pub doctor_id: Uuid,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinAppointmentRoom { doctor_id: Uuid, date: NaiveDate },
    LockTimeSlot { schedule_id: Uuid, slot_start: String },
    UnlockTimeSlot { schedule_id: Uuid, slot_start: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockReason {
    Released,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TimeSlotLocked {
        schedule_id: Uuid,
        slot_start: String,
        locked_by: String,
    },
    TimeSlotLockRejected {
        schedule_id: Uuid,
        slot_start: String,
        message: String,
    },
    TimeSlotLockConfirmed {
        schedule_id: Uuid,
        slot_start: String,
        expires_at: Option<DateTime<Utc>>,
    },
    TimeSlotUnlocked {
        schedule_id: Uuid,
        slot_start: String,
        reason: UnlockReason,
    },
    CurrentLockedSlots {
        schedule_id: Option<Uuid>,
        slots: Vec<HeldLock>,
    },
    SlotUpdated {
        slot: SlotSnapshot,
    },
    Error {
        message: String,
    },
}
