// libs/booking-cell/tests/coordinator_test.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use booking_cell::{
    Appointment, AppointmentStatus, AppointmentStore, BookSlotRequest, BookingCoordinator,
    BookingError, InMemoryAppointmentStore, LockKey, LockTable, RescheduleRequest, SlotLocks,
};
use schedule_cell::{
    InMemoryScheduleRepository, Schedule, ScheduleError, ScheduleRepository, SlotStore, TimeSlot,
};

// ==============================================================================
// TEST FIXTURES
// ==============================================================================

/// Store whose writes always fail, standing in for an unreachable database.
struct FailingAppointmentStore;

#[async_trait]
impl AppointmentStore for FailingAppointmentStore {
    async fn create(&self, _appointment: Appointment) -> Result<Appointment, BookingError> {
        Err(BookingError::Persistence("connection reset".to_string()))
    }

    async fn get(&self, _appointment_id: Uuid) -> Result<Option<Appointment>, BookingError> {
        Ok(None)
    }

    async fn update_if_version(
        &self,
        _appointment: Appointment,
        _expected_version: u64,
    ) -> Result<Option<Appointment>, BookingError> {
        Err(BookingError::Persistence("connection reset".to_string()))
    }
}

/// In-memory store whose reads take a while, so concurrent operations all
/// see the same version before any of them writes.
struct SlowReadStore {
    inner: InMemoryAppointmentStore,
}

impl SlowReadStore {
    fn new() -> Self {
        Self { inner: InMemoryAppointmentStore::new() }
    }
}

#[async_trait]
impl AppointmentStore for SlowReadStore {
    async fn create(&self, appointment: Appointment) -> Result<Appointment, BookingError> {
        self.inner.create(appointment).await
    }

    async fn get(&self, appointment_id: Uuid) -> Result<Option<Appointment>, BookingError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.get(appointment_id).await
    }

    async fn update_if_version(
        &self,
        appointment: Appointment,
        expected_version: u64,
    ) -> Result<Option<Appointment>, BookingError> {
        self.inner.update_if_version(appointment, expected_version).await
    }
}

/// Repository whose schedules disappear after the first read, as if an
/// admin deleted them between the precheck and the admission.
struct VanishingRepository {
    inner: InMemoryScheduleRepository,
    reads: AtomicUsize,
}

#[async_trait]
impl ScheduleRepository for VanishingRepository {
    async fn get(&self, schedule_id: Uuid) -> Result<Option<Schedule>, ScheduleError> {
        if self.reads.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(None);
        }
        self.inner.get(schedule_id).await
    }

    async fn find_by_doctor_and_date(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<Schedule>, ScheduleError> {
        self.inner.find_by_doctor_and_date(doctor_id, date).await
    }

    async fn find_by_date(&self, date: NaiveDate) -> Result<Vec<Schedule>, ScheduleError> {
        self.inner.find_by_date(date).await
    }

    async fn insert(&self, schedule: Schedule) -> Result<Schedule, ScheduleError> {
        self.inner.insert(schedule).await
    }

    async fn replace_slots_if_version(
        &self,
        schedule_id: Uuid,
        expected_version: u64,
        time_slots: Vec<TimeSlot>,
    ) -> Result<Option<Schedule>, ScheduleError> {
        self.inner.replace_slots_if_version(schedule_id, expected_version, time_slots).await
    }

    async fn delete_if_version(&self, schedule_id: Uuid, expected_version: u64) -> Result<bool, ScheduleError> {
        self.inner.delete_if_version(schedule_id, expected_version).await
    }
}

struct Harness {
    coordinator: BookingCoordinator,
    slots: Arc<SlotStore>,
    locks: Arc<LockTable>,
    schedule_id: Uuid,
    second_schedule_id: Uuid,
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 17).unwrap()
}

fn schedule(doctor_id: Uuid, date: NaiveDate, capacity: u32) -> Schedule {
    let now = Utc::now();
    Schedule {
        id: Uuid::new_v4(),
        doctor_id,
        hospital_id: Uuid::new_v4(),
        date,
        time_slots: vec![
            TimeSlot::new("08:00", "08:30", capacity, None),
            TimeSlot::new("08:30", "09:00", capacity, None),
        ],
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

async fn harness_with(capacity: u32, appointments: Arc<dyn AppointmentStore>) -> Harness {
    let repository = Arc::new(InMemoryScheduleRepository::new());
    let first = schedule(Uuid::new_v4(), date(), capacity);
    let second = schedule(Uuid::new_v4(), date().succ_opt().unwrap(), capacity);
    let (schedule_id, second_schedule_id) = (first.id, second.id);
    repository.insert(first).await.unwrap();
    repository.insert(second).await.unwrap();

    let slots = Arc::new(SlotStore::new(repository, 8));
    let locks = Arc::new(LockTable::new(Duration::from_secs(300)));
    let coordinator = BookingCoordinator::new(slots.clone(), locks.clone(), appointments, 2);

    Harness { coordinator, slots, locks, schedule_id, second_schedule_id }
}

async fn harness(capacity: u32) -> Harness {
    harness_with(capacity, Arc::new(InMemoryAppointmentStore::new())).await
}

fn request(schedule_id: Uuid, start: &str, end: &str) -> BookSlotRequest {
    BookSlotRequest {
        schedule_id,
        slot_start: start.to_string(),
        slot_end: end.to_string(),
        room_id: None,
        date: None,
    }
}

async fn booked_count(h: &Harness, schedule_id: Uuid, start: &str) -> u32 {
    h.slots.snapshot(schedule_id, start).await.unwrap().booked_count
}

// ==============================================================================
// BOOKING
// ==============================================================================

#[tokio::test]
async fn test_successful_booking_admits_and_releases_lock() {
    let h = harness(3).await;
    let patient = Uuid::new_v4();
    let room = Uuid::new_v4();

    let receipt = h
        .coordinator
        .book(patient, &patient.to_string(), BookSlotRequest {
            room_id: Some(room),
            date: Some(date()),
            ..request(h.schedule_id, "08:00", "08:30")
        })
        .await
        .unwrap();

    assert_eq!(receipt.appointment.patient_id, patient);
    assert_eq!(receipt.appointment.status, AppointmentStatus::Pending);
    assert_eq!(receipt.appointment.start_time, "08:00");
    assert_eq!(receipt.room_id, Some(room));
    assert_eq!(receipt.slot.booked_count, 1);
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 1);

    let key = LockKey::new(h.schedule_id, "08:00").unwrap();
    assert!(!h.locks.is_locked(&key).await.unwrap().locked);

    let stored = h.coordinator.appointment(receipt.appointment.id).await.unwrap();
    assert_eq!(stored, receipt.appointment);
}

#[tokio::test]
async fn test_booking_denied_while_another_user_holds_lock() {
    let h = harness(3).await;
    let key = LockKey::new(h.schedule_id, "08:00").unwrap();
    h.locks.acquire(&key, "someone-else").await.unwrap();

    let result = h
        .coordinator
        .book(Uuid::new_v4(), "me", request(h.schedule_id, "08:00", "08:30"))
        .await;

    assert_matches!(result, Err(BookingError::LockDenied { held_by: Some(holder) }) if holder == "someone-else");
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 0);
    // The other user's lock is untouched.
    assert!(h.locks.is_locked(&key).await.unwrap().locked);
}

#[tokio::test]
async fn test_holder_of_the_lock_can_book() {
    let h = harness(3).await;
    let key = LockKey::new(h.schedule_id, "08:30").unwrap();
    h.locks.acquire(&key, "me").await.unwrap();

    let receipt = h
        .coordinator
        .book(Uuid::new_v4(), "me", request(h.schedule_id, "8:30", "9:00"))
        .await;
    assert!(receipt.is_ok());
    assert!(!h.locks.is_locked(&key).await.unwrap().locked);
}

#[tokio::test]
async fn test_full_slot_fails_and_releases_lock() {
    let h = harness(1).await;
    h.coordinator
        .book(Uuid::new_v4(), "first", request(h.schedule_id, "08:00", "08:30"))
        .await
        .unwrap();

    let result = h
        .coordinator
        .book(Uuid::new_v4(), "second", request(h.schedule_id, "08:00", "08:30"))
        .await;

    assert_matches!(result, Err(BookingError::SlotFull { .. }));
    let key = LockKey::new(h.schedule_id, "08:00").unwrap();
    assert!(!h.locks.is_locked(&key).await.unwrap().locked);
}

#[tokio::test]
async fn test_store_failure_compensates_admission() {
    let h = harness_with(3, Arc::new(FailingAppointmentStore)).await;

    let result = h
        .coordinator
        .book(Uuid::new_v4(), "me", request(h.schedule_id, "08:00", "08:30"))
        .await;

    assert_matches!(result, Err(BookingError::Persistence(_)));

    let schedule = h.slots.schedule(h.schedule_id).await.unwrap();
    let slot = schedule.slot("08:00").unwrap().unwrap();
    assert_eq!(slot.booked_count, 0);
    assert!(slot.appointment_ids.is_empty());

    let key = LockKey::new(h.schedule_id, "08:00").unwrap();
    assert!(!h.locks.is_locked(&key).await.unwrap().locked);
}

#[tokio::test]
async fn test_schedule_deleted_mid_booking_is_not_found() {
    let inner = InMemoryScheduleRepository::new();
    let existing = inner.insert(schedule(Uuid::new_v4(), date(), 3)).await.unwrap();
    let repository = Arc::new(VanishingRepository { inner, reads: AtomicUsize::new(0) });
    let slots = Arc::new(SlotStore::new(repository, 8));
    let locks = Arc::new(LockTable::new(Duration::from_secs(300)));
    let coordinator =
        BookingCoordinator::new(slots, locks.clone(), Arc::new(InMemoryAppointmentStore::new()), 2);

    let result = coordinator
        .book(Uuid::new_v4(), "me", request(existing.id, "08:00", "08:30"))
        .await;

    assert_matches!(result, Err(BookingError::NotFound(msg)) if msg.contains(&existing.id.to_string()));
    assert!(locks.locks_for_schedule(existing.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_validation_before_locking() {
    let h = harness(3).await;

    let reversed = h.coordinator.book(Uuid::new_v4(), "me", request(h.schedule_id, "08:30", "08:00")).await;
    assert_matches!(reversed, Err(BookingError::Validation(_)));

    let malformed = h.coordinator.book(Uuid::new_v4(), "me", request(h.schedule_id, "8h", "9h")).await;
    assert_matches!(malformed, Err(BookingError::Validation(_)));

    let wrong_end = h.coordinator.book(Uuid::new_v4(), "me", request(h.schedule_id, "08:00", "08:45")).await;
    assert_matches!(wrong_end, Err(BookingError::Validation(_)));

    let wrong_date = h
        .coordinator
        .book(Uuid::new_v4(), "me", BookSlotRequest {
            date: Some(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()),
            ..request(h.schedule_id, "08:00", "08:30")
        })
        .await;
    assert_matches!(wrong_date, Err(BookingError::Validation(_)));

    let missing_slot = h.coordinator.book(Uuid::new_v4(), "me", request(h.schedule_id, "12:00", "12:30")).await;
    assert_matches!(missing_slot, Err(BookingError::NotFound(_)));

    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 0);
    assert!(h.locks.locks_for_schedule(h.schedule_id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bookings_never_overbook() {
    let h = Arc::new(harness(2).await);

    let attempts = (0..8).map(|i| {
        let h = h.clone();
        tokio::spawn(async move {
            h.coordinator
                .book(Uuid::new_v4(), &format!("user-{}", i), request(h.schedule_id, "08:00", "08:30"))
                .await
        })
    });

    let mut admitted = 0;
    for attempt in futures::future::join_all(attempts).await {
        match attempt.unwrap() {
            Ok(_) => admitted += 1,
            Err(BookingError::LockDenied { .. }) | Err(BookingError::SlotFull { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert!(admitted >= 1 && admitted <= 2);
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, admitted);
}

// ==============================================================================
// CANCEL
// ==============================================================================

#[tokio::test]
async fn test_cancel_releases_capacity_and_is_repeatable() {
    let h = harness(1).await;
    let receipt = h
        .coordinator
        .book(Uuid::new_v4(), "me", request(h.schedule_id, "08:00", "08:30"))
        .await
        .unwrap();

    let cancelled = h.coordinator.cancel(receipt.appointment.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 0);

    let again = h.coordinator.cancel(receipt.appointment.id).await.unwrap();
    assert_eq!(again.status, AppointmentStatus::Cancelled);
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 0);

    // The freed place can be booked again.
    assert!(h
        .coordinator
        .book(Uuid::new_v4(), "other", request(h.schedule_id, "08:00", "08:30"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_cancel_rejected_for_finished_appointments() {
    let appointments = Arc::new(InMemoryAppointmentStore::new());
    let h = harness_with(3, appointments.clone()).await;
    let receipt = h
        .coordinator
        .book(Uuid::new_v4(), "me", request(h.schedule_id, "08:00", "08:30"))
        .await
        .unwrap();

    let mut completed = receipt.appointment.clone();
    completed.status = AppointmentStatus::Completed;
    appointments
        .update_if_version(completed, receipt.appointment.version)
        .await
        .unwrap()
        .unwrap();

    let result = h.coordinator.cancel(receipt.appointment.id).await;
    assert_matches!(result, Err(BookingError::Validation(msg)) if msg.contains("completed"));
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 1);

    assert_matches!(h.coordinator.cancel(Uuid::new_v4()).await, Err(BookingError::NotFound(_)));
}

// ==============================================================================
// RESCHEDULE
// ==============================================================================

fn move_to(schedule_id: Uuid, start: &str, end: &str) -> RescheduleRequest {
    RescheduleRequest {
        schedule_id,
        slot_start: start.to_string(),
        slot_end: end.to_string(),
        room_id: None,
    }
}

#[tokio::test]
async fn test_reschedule_moves_capacity_between_slots() {
    let h = harness(3).await;
    let receipt = h
        .coordinator
        .book(Uuid::new_v4(), "me", request(h.schedule_id, "08:00", "08:30"))
        .await
        .unwrap();
    let id = receipt.appointment.id;

    let moved = h
        .coordinator
        .reschedule(id, "me", move_to(h.schedule_id, "08:30", "09:00"))
        .await
        .unwrap();

    assert_eq!(moved.appointment.id, id);
    assert_eq!(moved.appointment.start_time, "08:30");
    assert_eq!(moved.appointment.reschedule_count, 1);
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 0);
    assert_eq!(booked_count(&h, h.schedule_id, "08:30").await, 1);

    let to_other_day = h
        .coordinator
        .reschedule(id, "me", move_to(h.second_schedule_id, "08:30", "09:00"))
        .await
        .unwrap();
    assert_eq!(to_other_day.appointment.date, date().succ_opt().unwrap());
    assert_eq!(booked_count(&h, h.schedule_id, "08:30").await, 0);
    assert_eq!(booked_count(&h, h.second_schedule_id, "08:30").await, 1);

    // Two reschedules is the configured limit.
    let third = h
        .coordinator
        .reschedule(id, "me", move_to(h.second_schedule_id, "08:00", "08:30"))
        .await;
    assert_matches!(third, Err(BookingError::Validation(msg)) if msg.contains("rescheduled"));
}

#[tokio::test]
async fn test_reschedule_to_same_slot_is_rejected() {
    let h = harness(3).await;
    let receipt = h
        .coordinator
        .book(Uuid::new_v4(), "me", request(h.schedule_id, "08:00", "08:30"))
        .await
        .unwrap();

    let result = h
        .coordinator
        .reschedule(receipt.appointment.id, "me", move_to(h.schedule_id, "8:00", "8:30"))
        .await;

    assert_matches!(result, Err(BookingError::Validation(_)));
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 1);
}

#[tokio::test]
async fn test_reschedule_into_full_slot_keeps_original() {
    let h = harness(1).await;
    let mine = h
        .coordinator
        .book(Uuid::new_v4(), "me", request(h.schedule_id, "08:00", "08:30"))
        .await
        .unwrap();
    h.coordinator
        .book(Uuid::new_v4(), "other", request(h.schedule_id, "08:30", "09:00"))
        .await
        .unwrap();

    let result = h
        .coordinator
        .reschedule(mine.appointment.id, "me", move_to(h.schedule_id, "08:30", "09:00"))
        .await;

    assert_matches!(result, Err(BookingError::SlotFull { .. }));
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 1);
    let unchanged = h.coordinator.appointment(mine.appointment.id).await.unwrap();
    assert_eq!(unchanged.start_time, "08:00");
    assert_eq!(unchanged.reschedule_count, 0);
}

// ==============================================================================
// RACES BETWEEN CANCEL AND RESCHEDULE
// ==============================================================================

async fn slow_harness() -> Harness {
    harness_with(8, Arc::new(SlowReadStore::new())).await
}

async fn book_eight_o_clock(h: &Harness) -> Appointment {
    h.coordinator
        .book(Uuid::new_v4(), "me", request(h.schedule_id, "08:00", "08:30"))
        .await
        .unwrap()
        .appointment
}

#[tokio::test]
async fn test_cancel_racing_reschedule_leaves_no_capacity_held() {
    let h = slow_harness().await;
    let id = book_eight_o_clock(&h).await.id;

    let (cancelled, moved) = tokio::join!(
        h.coordinator.cancel(id),
        h.coordinator.reschedule(id, "me", move_to(h.schedule_id, "08:30", "09:00")),
    );

    assert_eq!(cancelled.unwrap().status, AppointmentStatus::Cancelled);
    assert_matches!(moved, Ok(_) | Err(BookingError::Concurrent(_)));

    let stored = h.coordinator.appointment(id).await.unwrap();
    assert_eq!(stored.status, AppointmentStatus::Cancelled);
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 0);
    assert_eq!(booked_count(&h, h.schedule_id, "08:30").await, 0);
}

#[tokio::test]
async fn test_competing_reschedules_hold_exactly_one_place() {
    let h = slow_harness().await;
    let id = book_eight_o_clock(&h).await.id;

    let (same_day, next_day) = tokio::join!(
        h.coordinator.reschedule(id, "tab-1", move_to(h.schedule_id, "08:30", "09:00")),
        h.coordinator.reschedule(id, "tab-2", move_to(h.second_schedule_id, "08:00", "08:30")),
    );

    let outcomes = [same_day.is_ok(), next_day.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    assert!(matches!(same_day, Err(BookingError::Concurrent(_))) || matches!(next_day, Err(BookingError::Concurrent(_))));

    let stored = h.coordinator.appointment(id).await.unwrap();
    assert_eq!(stored.reschedule_count, 1);
    assert_eq!(booked_count(&h, stored.schedule_id, &stored.start_time).await, 1);

    let total = booked_count(&h, h.schedule_id, "08:00").await
        + booked_count(&h, h.schedule_id, "08:30").await
        + booked_count(&h, h.second_schedule_id, "08:00").await
        + booked_count(&h, h.second_schedule_id, "08:30").await;
    assert_eq!(total, 1);
}

#[tokio::test]
async fn test_losing_reschedule_to_the_same_slot_keeps_the_winners_place() {
    let h = slow_harness().await;
    let id = book_eight_o_clock(&h).await.id;

    let (first, second) = tokio::join!(
        h.coordinator.reschedule(id, "tab-1", move_to(h.schedule_id, "08:30", "09:00")),
        h.coordinator.reschedule(id, "tab-2", move_to(h.schedule_id, "08:30", "09:00")),
    );
    assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);

    let stored = h.coordinator.appointment(id).await.unwrap();
    assert_eq!(stored.start_time, "08:30");
    assert_eq!(booked_count(&h, h.schedule_id, "08:00").await, 0);
    assert_eq!(booked_count(&h, h.schedule_id, "08:30").await, 1);
}
