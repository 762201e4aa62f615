use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use schedule_cell::{
    parse_minutes, AdmitOutcome, ReleaseOutcome, Schedule, ScheduleError, SlotSnapshot, SlotStore, TimeSlot,
    TimeWindow,
};

use crate::error::BookingError;
use crate::models::{
    Appointment, AppointmentStatus, BookSlotRequest, BookingReceipt, BookingStage, LockKey,
    RescheduleRequest,
};
use crate::services::appointments::AppointmentStore;
use crate::services::lock::SlotLocks;

/// Re-reads a cancel makes after losing a write race before giving up.
const CANCEL_ATTEMPTS: u32 = 3;

/// Tracks one booking attempt through its stages.
struct BookingAttempt {
    appointment_id: Uuid,
    stage: BookingStage,
}

impl BookingAttempt {
    fn new(appointment_id: Uuid) -> Self {
        Self {
            appointment_id,
            stage: BookingStage::LockRequested,
        }
    }

    fn advance(&mut self, next: BookingStage) {
        if !self.stage.can_transition_to(&next) {
            warn!(
                "Booking {} moved from {:?} to {:?} out of order",
                self.appointment_id, self.stage, next
            );
        }
        debug!("Booking {}: {:?} -> {:?}", self.appointment_id, self.stage, next);
        self.stage = next;
    }
}

/// Runs a booking from lock to appointment record, unwinding on failure.
///
/// The slot lock only keeps two clients from racing to the same slot; the
/// capacity decision is always `SlotStore::admit`. Failures before admission
/// are returned to the caller and never retried here.
pub struct BookingCoordinator {
    slots: Arc<SlotStore>,
    locks: Arc<dyn SlotLocks>,
    appointments: Arc<dyn AppointmentStore>,
    max_reschedules: u32,
}

impl BookingCoordinator {
    pub fn new(
        slots: Arc<SlotStore>,
        locks: Arc<dyn SlotLocks>,
        appointments: Arc<dyn AppointmentStore>,
        max_reschedules: u32,
    ) -> Self {
        Self {
            slots,
            locks,
            appointments,
            max_reschedules,
        }
    }

    pub fn locks(&self) -> Arc<dyn SlotLocks> {
        Arc::clone(&self.locks)
    }

    pub async fn appointment(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        self.appointments
            .get(appointment_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("Appointment {}", appointment_id)))
    }

    // ==========================================================================
    // BOOK
    // ==========================================================================

    #[instrument(skip(self, request), fields(schedule_id = %request.schedule_id, slot = %request.slot_start))]
    pub async fn book(
        &self,
        patient_id: Uuid,
        holder: &str,
        request: BookSlotRequest,
    ) -> Result<BookingReceipt, BookingError> {
        let window = TimeWindow::parse(&request.slot_start, &request.slot_end)?;
        let key = LockKey::new(request.schedule_id, &request.slot_start)?;
        let mut attempt = BookingAttempt::new(Uuid::new_v4());

        let lock = self.locks.acquire(&key, holder).await?;
        if !lock.granted {
            attempt.advance(BookingStage::Failed);
            return Err(BookingError::LockDenied { held_by: lock.held_by });
        }
        attempt.advance(BookingStage::LockGranted);

        let result = self.admit_new(&mut attempt, patient_id, &key, window, &request).await;
        self.release_lock(&key, holder).await;

        match result {
            Ok(receipt) => {
                attempt.advance(BookingStage::LockReleased);
                info!(
                    "Booked appointment {} for patient {} at {}",
                    receipt.appointment.id, patient_id, key
                );
                Ok(receipt)
            }
            Err(e) => {
                attempt.advance(BookingStage::Failed);
                if matches!(e, BookingError::SlotFull { .. }) {
                    warn!("Booking at {} rejected: {}", key, e);
                }
                Err(e)
            }
        }
    }

    async fn admit_new(
        &self,
        attempt: &mut BookingAttempt,
        patient_id: Uuid,
        key: &LockKey,
        window: TimeWindow,
        request: &BookSlotRequest,
    ) -> Result<BookingReceipt, BookingError> {
        let schedule = self.slots.schedule(key.schedule_id).await?;
        if let Some(date) = request.date {
            if date != schedule.date {
                return Err(BookingError::Validation(format!(
                    "Schedule {} is for {}, not {}",
                    schedule.id, schedule.date, date
                )));
            }
        }
        let slot = precheck_slot(&schedule, key, window)?;

        attempt.advance(BookingStage::Admitting);
        let appointment_id = attempt.appointment_id;
        let (snapshot, room_id) = self.admit(key, appointment_id, request.room_id).await?;
        attempt.advance(BookingStage::Admitted);

        let now = Utc::now();
        let appointment = Appointment {
            id: appointment_id,
            patient_id,
            doctor_id: schedule.doctor_id,
            hospital_id: schedule.hospital_id,
            schedule_id: schedule.id,
            date: schedule.date,
            start_time: slot.start_time.clone(),
            end_time: slot.end_time.clone(),
            room_id,
            status: AppointmentStatus::Pending,
            reschedule_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        match self.appointments.create(appointment).await {
            Ok(created) => {
                attempt.advance(BookingStage::AppointmentCreated);
                Ok(BookingReceipt { appointment: created, room_id, slot: snapshot })
            }
            Err(e) => {
                self.compensate(key, appointment_id).await;
                Err(into_persistence(e))
            }
        }
    }

    /// Admission with compensation when the store itself fails: the write
    /// may have landed before the error surfaced.
    async fn admit(
        &self,
        key: &LockKey,
        appointment_id: Uuid,
        room_id: Option<Uuid>,
    ) -> Result<(SlotSnapshot, Option<Uuid>), BookingError> {
        let outcome = match self.slots.admit(key.schedule_id, &key.slot_start, appointment_id, room_id).await {
            Ok(outcome) => outcome,
            Err(e @ (ScheduleError::Persistence(_) | ScheduleError::ContentionExhausted { .. })) => {
                self.compensate(key, appointment_id).await;
                return Err(into_persistence(e.into()));
            }
            // Nothing was written, e.g. the schedule was deleted after the precheck.
            Err(e) => return Err(e.into()),
        };

        match outcome {
            AdmitOutcome::Admitted { snapshot, room_id } => Ok((snapshot, room_id)),
            AdmitOutcome::Full(_) => Err(BookingError::SlotFull {
                schedule_id: key.schedule_id,
                slot_start: key.slot_start.clone(),
            }),
            AdmitOutcome::SlotNotFound => Err(slot_not_found(key)),
        }
    }

    // ==========================================================================
    // CANCEL
    // ==========================================================================

    /// Cancel and give the slot's capacity back. Cancelling an already
    /// cancelled appointment repeats the release, so a failed release can be
    /// retried by calling this again.
    ///
    /// The status write is conditioned on the version that was read, so the
    /// slot released is always the one the stored record points at, even
    /// when a reschedule runs at the same time.
    #[instrument(skip(self))]
    pub async fn cancel(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        for attempt in 1..=CANCEL_ATTEMPTS {
            let appointment = self.appointment(appointment_id).await?;

            match appointment.status {
                AppointmentStatus::Cancelled => {
                    self.release_capacity(&appointment).await?;
                    return Ok(appointment);
                }
                status if status.is_active() => {}
                status => {
                    return Err(BookingError::Validation(format!(
                        "Cannot cancel an appointment that is {}",
                        status
                    )));
                }
            }

            let expected_version = appointment.version;
            let cancelled = Appointment {
                status: AppointmentStatus::Cancelled,
                updated_at: Utc::now(),
                ..appointment
            };

            match self.appointments.update_if_version(cancelled, expected_version).await? {
                Some(cancelled) => {
                    self.release_capacity(&cancelled).await?;
                    info!("Cancelled appointment {}", appointment_id);
                    return Ok(cancelled);
                }
                None => debug!(
                    "Cancel of {} lost a write race on attempt {}, re-reading",
                    appointment_id, attempt
                ),
            }
        }

        Err(BookingError::Concurrent(appointment_id))
    }

    async fn release_capacity(&self, appointment: &Appointment) -> Result<(), BookingError> {
        match self
            .slots
            .release(appointment.schedule_id, &appointment.start_time, appointment.id)
            .await
        {
            Ok(ReleaseOutcome::SlotNotFound) => {
                warn!(
                    "Slot {} of appointment {} no longer exists on schedule {}",
                    appointment.start_time, appointment.id, appointment.schedule_id
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                error!(
                    schedule_id = %appointment.schedule_id,
                    slot = %appointment.start_time,
                    appointment_id = %appointment.id,
                    "PHANTOM_RESERVATION: release after cancel failed: {}", e
                );
                Err(into_persistence(e.into()))
            }
        }
    }

    // ==========================================================================
    // RESCHEDULE
    // ==========================================================================

    #[instrument(skip(self, request), fields(schedule_id = %request.schedule_id, slot = %request.slot_start))]
    pub async fn reschedule(
        &self,
        appointment_id: Uuid,
        holder: &str,
        request: RescheduleRequest,
    ) -> Result<BookingReceipt, BookingError> {
        let current = self.appointment(appointment_id).await?;
        if !current.status.is_active() {
            return Err(BookingError::Validation(format!(
                "Cannot reschedule an appointment that is {}",
                current.status
            )));
        }
        if current.reschedule_count >= self.max_reschedules {
            return Err(BookingError::Validation(format!(
                "Appointment has already been rescheduled {} time(s)",
                current.reschedule_count
            )));
        }

        let window = TimeWindow::parse(&request.slot_start, &request.slot_end)?;
        let key = LockKey::new(request.schedule_id, &request.slot_start)?;
        let target = self.slots.schedule(request.schedule_id).await?;

        let same_slot = target.id == current.schedule_id
            && parse_minutes(&current.start_time).ok() == Some(window.start);
        if target.date == current.date && same_slot {
            return Err(BookingError::Validation(
                "Reschedule must pick a different time slot on the same date".to_string(),
            ));
        }

        let lock = self.locks.acquire(&key, holder).await?;
        if !lock.granted {
            return Err(BookingError::LockDenied { held_by: lock.held_by });
        }

        let result = self.move_appointment(&current, &target, &key, window, request.room_id).await;
        self.release_lock(&key, holder).await;
        result
    }

    async fn move_appointment(
        &self,
        current: &Appointment,
        target: &Schedule,
        key: &LockKey,
        window: TimeWindow,
        room_id: Option<Uuid>,
    ) -> Result<BookingReceipt, BookingError> {
        let slot = precheck_slot(target, key, window)?;
        let (snapshot, room_id) = self.admit(key, current.id, room_id).await?;

        let moved = Appointment {
            schedule_id: target.id,
            doctor_id: target.doctor_id,
            hospital_id: target.hospital_id,
            date: target.date,
            start_time: slot.start_time.clone(),
            end_time: slot.end_time.clone(),
            room_id,
            reschedule_count: current.reschedule_count + 1,
            updated_at: Utc::now(),
            ..current.clone()
        };

        let updated = match self.appointments.update_if_version(moved, current.version).await {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                // A cancel or another reschedule wrote first.
                self.abandon_admission(key, current.id).await;
                return Err(BookingError::Concurrent(current.id));
            }
            Err(e) => {
                self.compensate(key, current.id).await;
                return Err(into_persistence(e));
            }
        };

        // The new place is already committed, so a failed release of the
        // old one leaves a stuck unit rather than failing the reschedule.
        if let Err(e) = self.release_capacity(current).await {
            warn!("Reschedule of {} kept its old slot occupied: {}", current.id, e);
        }

        info!(
            "Rescheduled appointment {} from {} {} to {}",
            current.id, current.schedule_id, current.start_time, key
        );
        Ok(BookingReceipt { appointment: updated, room_id, slot: snapshot })
    }

    // ==========================================================================
    // CLEANUP
    // ==========================================================================

    async fn compensate(&self, key: &LockKey, appointment_id: Uuid) {
        match self.slots.release(key.schedule_id, &key.slot_start, appointment_id).await {
            Ok(_) => info!("Compensating release of appointment {} at {}", appointment_id, key),
            Err(e) => error!(
                schedule_id = %key.schedule_id,
                slot = %key.slot_start,
                appointment_id = %appointment_id,
                "PHANTOM_RESERVATION: compensating release failed: {}", e
            ),
        }
    }

    /// Undo an admission whose appointment write lost, unless the winning
    /// write left the appointment on this very slot.
    async fn abandon_admission(&self, key: &LockKey, appointment_id: Uuid) {
        match self.appointments.get(appointment_id).await {
            Ok(Some(latest)) if latest.schedule_id == key.schedule_id
                && parse_minutes(&latest.start_time).ok() == parse_minutes(&key.slot_start).ok() =>
            {
                debug!("Appointment {} already sits at {}, keeping its place", appointment_id, key);
            }
            _ => self.compensate(key, appointment_id).await,
        }
    }

    async fn release_lock(&self, key: &LockKey, holder: &str) {
        if let Err(e) = self.locks.release(key, holder).await {
            warn!("Failed to release lock {} for {}: {}", key, holder, e);
        }
    }
}

/// Advisory checks against the schedule as read before admission.
fn precheck_slot<'a>(schedule: &'a Schedule, key: &LockKey, window: TimeWindow) -> Result<&'a TimeSlot, BookingError> {
    let slot = schedule.slot(&key.slot_start)?.ok_or_else(|| slot_not_found(key))?;

    if slot.window()? != window {
        return Err(BookingError::Validation(format!(
            "Slot {} ends at {}, not at the requested time",
            slot.start_time, slot.end_time
        )));
    }
    if slot.booked_count >= slot.max_bookings {
        return Err(BookingError::SlotFull {
            schedule_id: key.schedule_id,
            slot_start: key.slot_start.clone(),
        });
    }
    Ok(slot)
}

fn slot_not_found(key: &LockKey) -> BookingError {
    BookingError::NotFound(format!("Time slot {} on schedule {}", key.slot_start, key.schedule_id))
}

fn into_persistence(err: BookingError) -> BookingError {
    match err {
        BookingError::Persistence(_) => err,
        other => BookingError::Persistence(other.to_string()),
    }
}
