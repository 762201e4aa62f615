// libs/schedule-cell/tests/slot_store_test.rs
use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use uuid::Uuid;

use schedule_cell::{
    AdmitOutcome, InMemoryScheduleRepository, ReleaseOutcome, Schedule, ScheduleError,
    ScheduleRepository, SlotEvent, SlotStore, TimeSlot,
};

// ==============================================================================
// TEST FIXTURES
// ==============================================================================

struct Fixture {
    store: Arc<SlotStore>,
    repository: Arc<InMemoryScheduleRepository>,
    schedule_id: Uuid,
}

async fn fixture_with_capacity(max_bookings: u32) -> Fixture {
    let repository = Arc::new(InMemoryScheduleRepository::new());
    let now = Utc::now();
    let schedule = Schedule {
        id: Uuid::new_v4(),
        doctor_id: Uuid::new_v4(),
        hospital_id: Uuid::new_v4(),
        date: NaiveDate::from_ymd_opt(2025, 4, 7).unwrap(),
        time_slots: vec![
            TimeSlot::new("08:00", "08:30", max_bookings, None),
            TimeSlot::new("08:30", "09:00", max_bookings, None),
        ],
        version: 0,
        created_at: now,
        updated_at: now,
    };
    let schedule_id = schedule.id;
    repository.insert(schedule).await.unwrap();

    let store = Arc::new(SlotStore::new(repository.clone(), 8));
    Fixture { store, repository, schedule_id }
}

async fn slot(fixture: &Fixture, start: &str) -> TimeSlot {
    let schedule = fixture.repository.get(fixture.schedule_id).await.unwrap().unwrap();
    schedule.slot(start).unwrap().unwrap().clone()
}

// ==============================================================================
// CAPACITY
// ==============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_concurrent_admits_fill_slot_and_fourth_is_full() {
    let fixture = fixture_with_capacity(3).await;

    let admits = (0..3).map(|_| {
        let store = fixture.store.clone();
        let schedule_id = fixture.schedule_id;
        tokio::spawn(async move { store.admit(schedule_id, "08:00", Uuid::new_v4(), None).await })
    });
    for result in join_all(admits).await {
        assert_matches!(result.unwrap().unwrap(), AdmitOutcome::Admitted { .. });
    }

    let fourth = fixture
        .store
        .admit(fixture.schedule_id, "08:00", Uuid::new_v4(), None)
        .await
        .unwrap();
    assert_matches!(fourth, AdmitOutcome::Full(snapshot) if snapshot.booked_count == 3);

    let slot = slot(&fixture, "08:00").await;
    assert_eq!(slot.booked_count, 3);
    assert!(slot.is_booked);
    assert_eq!(slot.appointment_ids.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_admits_never_exceed_capacity() {
    let fixture = fixture_with_capacity(3).await;

    let admits = (0..12).map(|_| {
        let store = fixture.store.clone();
        let schedule_id = fixture.schedule_id;
        tokio::spawn(async move { store.admit(schedule_id, "08:30", Uuid::new_v4(), None).await })
    });

    let outcomes: Vec<AdmitOutcome> = join_all(admits)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let admitted = outcomes.iter().filter(|o| matches!(o, AdmitOutcome::Admitted { .. })).count();
    let full = outcomes.iter().filter(|o| matches!(o, AdmitOutcome::Full(_))).count();
    assert_eq!(admitted, 3);
    assert_eq!(full, 9);

    let slot = slot(&fixture, "08:30").await;
    assert_eq!(slot.booked_count, 3);
    assert_eq!(slot.appointment_ids.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_unit_race_has_exactly_one_winner() {
    let fixture = fixture_with_capacity(2).await;
    fixture.store.admit(fixture.schedule_id, "08:00", Uuid::new_v4(), None).await.unwrap();

    let (a, b) = tokio::join!(
        fixture.store.admit(fixture.schedule_id, "08:00", Uuid::new_v4(), None),
        fixture.store.admit(fixture.schedule_id, "08:00", Uuid::new_v4(), None),
    );

    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| matches!(o, AdmitOutcome::Admitted { .. })).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| matches!(o, AdmitOutcome::Full(_))).count(), 1);
}

#[tokio::test]
async fn test_admit_is_idempotent_per_appointment() {
    let fixture = fixture_with_capacity(3).await;
    let appointment_id = Uuid::new_v4();

    fixture.store.admit(fixture.schedule_id, "08:00", appointment_id, None).await.unwrap();
    let again = fixture.store.admit(fixture.schedule_id, "08:00", appointment_id, None).await.unwrap();

    assert_matches!(again, AdmitOutcome::Admitted { snapshot, .. } if snapshot.booked_count == 1);
    assert_eq!(slot(&fixture, "08:00").await.appointment_ids, vec![appointment_id]);
}

#[tokio::test]
async fn test_admit_assigns_room_only_when_empty() {
    let fixture = fixture_with_capacity(3).await;
    let first_room = Uuid::new_v4();

    let first = fixture
        .store
        .admit(fixture.schedule_id, "08:00", Uuid::new_v4(), Some(first_room))
        .await
        .unwrap();
    assert_matches!(first, AdmitOutcome::Admitted { room_id: Some(r), .. } if r == first_room);

    let second = fixture
        .store
        .admit(fixture.schedule_id, "08:00", Uuid::new_v4(), Some(Uuid::new_v4()))
        .await
        .unwrap();
    assert_matches!(second, AdmitOutcome::Admitted { room_id: Some(r), .. } if r == first_room);
}

#[tokio::test]
async fn test_unknown_slot_and_schedule() {
    let fixture = fixture_with_capacity(3).await;

    let outcome = fixture.store.admit(fixture.schedule_id, "13:00", Uuid::new_v4(), None).await.unwrap();
    assert_eq!(outcome, AdmitOutcome::SlotNotFound);

    let missing = fixture.store.admit(Uuid::new_v4(), "08:00", Uuid::new_v4(), None).await;
    assert_matches!(missing, Err(ScheduleError::NotFound(_)));

    let malformed = fixture.store.admit(fixture.schedule_id, "8 o'clock", Uuid::new_v4(), None).await;
    assert_matches!(malformed, Err(ScheduleError::Validation(_)));
}

// ==============================================================================
// RELEASE
// ==============================================================================

#[tokio::test]
async fn test_admit_then_release_restores_slot_exactly() {
    let fixture = fixture_with_capacity(3).await;
    let existing = Uuid::new_v4();
    fixture.store.admit(fixture.schedule_id, "08:00", existing, Some(Uuid::new_v4())).await.unwrap();
    let before = slot(&fixture, "08:00").await;

    let appointment_id = Uuid::new_v4();
    fixture.store.admit(fixture.schedule_id, "08:00", appointment_id, None).await.unwrap();
    let released = fixture.store.release(fixture.schedule_id, "08:00", appointment_id).await.unwrap();
    assert_matches!(released, ReleaseOutcome::Released(_));

    let after = slot(&fixture, "08:00").await;
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_release_twice_is_safe() {
    let fixture = fixture_with_capacity(3).await;
    let appointment_id = Uuid::new_v4();
    fixture.store.admit(fixture.schedule_id, "08:00", appointment_id, None).await.unwrap();

    let first = fixture.store.release(fixture.schedule_id, "08:00", appointment_id).await.unwrap();
    let second = fixture.store.release(fixture.schedule_id, "08:00", appointment_id).await.unwrap();

    assert_matches!(first, ReleaseOutcome::Released(s) if s.booked_count == 0);
    assert_matches!(second, ReleaseOutcome::NotHeld(ref s) if s.booked_count == 0);
    assert!(second.is_ok());

    let slot = slot(&fixture, "08:00").await;
    assert_eq!(slot.booked_count, 0);
    assert!(slot.appointment_ids.is_empty());
    assert_eq!(slot.room_id, None);
}

#[tokio::test]
async fn test_release_reopens_full_slot() {
    let fixture = fixture_with_capacity(1).await;
    let appointment_id = Uuid::new_v4();
    fixture.store.admit(fixture.schedule_id, "08:00", appointment_id, None).await.unwrap();
    assert!(slot(&fixture, "08:00").await.is_booked);

    fixture.store.release(fixture.schedule_id, "08:00", appointment_id).await.unwrap();
    assert!(!slot(&fixture, "08:00").await.is_booked);

    let next = fixture.store.admit(fixture.schedule_id, "08:00", Uuid::new_v4(), None).await.unwrap();
    assert_matches!(next, AdmitOutcome::Admitted { .. });
}

#[tokio::test]
async fn test_room_survives_partial_release() {
    let fixture = fixture_with_capacity(3).await;
    let room = Uuid::new_v4();
    let first = Uuid::new_v4();
    fixture.store.admit(fixture.schedule_id, "08:00", first, Some(room)).await.unwrap();
    fixture.store.admit(fixture.schedule_id, "08:00", Uuid::new_v4(), None).await.unwrap();

    fixture.store.release(fixture.schedule_id, "08:00", first).await.unwrap();
    assert_eq!(slot(&fixture, "08:00").await.room_id, Some(room));
}

// ==============================================================================
// CAPACITY EDITS AND EVENTS
// ==============================================================================

#[tokio::test]
async fn test_capacity_cannot_drop_below_bookings() {
    let fixture = fixture_with_capacity(3).await;
    fixture.store.admit(fixture.schedule_id, "08:00", Uuid::new_v4(), None).await.unwrap();
    fixture.store.admit(fixture.schedule_id, "08:00", Uuid::new_v4(), None).await.unwrap();

    let too_low = fixture.store.set_capacity(fixture.schedule_id, "08:00", 1).await;
    assert_matches!(too_low, Err(ScheduleError::CapacityBelowBookings { requested: 1, booked: 2 }));

    let shrunk = fixture.store.set_capacity(fixture.schedule_id, "08:00", 2).await.unwrap();
    assert!(shrunk.is_booked);

    let outcome = fixture.store.admit(fixture.schedule_id, "08:00", Uuid::new_v4(), None).await.unwrap();
    assert_matches!(outcome, AdmitOutcome::Full(_));
}

#[tokio::test]
async fn test_committed_changes_are_published() {
    let fixture = fixture_with_capacity(3).await;
    let mut events = fixture.store.subscribe();
    let appointment_id = Uuid::new_v4();

    fixture.store.admit(fixture.schedule_id, "08:30", appointment_id, None).await.unwrap();
    let SlotEvent::Changed(snapshot) = events.recv().await.unwrap();
    assert_eq!(snapshot.start_time, "08:30");
    assert_eq!(snapshot.booked_count, 1);

    // A no-op release writes nothing and publishes nothing.
    fixture.store.release(fixture.schedule_id, "08:30", Uuid::new_v4()).await.unwrap();
    assert!(events.try_recv().is_err());
}
