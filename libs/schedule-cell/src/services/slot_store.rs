use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::models::{AdmitOutcome, ReleaseOutcome, Schedule, SlotEvent, SlotSnapshot, TimeSlot};
use crate::services::repository::ScheduleRepository;

/// What a slot mutation decided after looking at the freshly read slot.
enum Decision<T> {
    /// Nothing to write; report `T` as-is.
    Keep(T),
    /// The slot was modified in place and must be committed.
    Write(T),
}

/// Sole owner of slot occupancy. Every change to `booked_count`,
/// `appointment_ids` or `max_bookings` goes through a read, modify, and
/// version-conditioned write, retried on lost races.
pub struct SlotStore {
    repository: Arc<dyn ScheduleRepository>,
    max_retries: u32,
    events: broadcast::Sender<SlotEvent>,
}

impl SlotStore {
    pub fn new(repository: Arc<dyn ScheduleRepository>, max_retries: u32) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            repository,
            max_retries: max_retries.max(1),
            events,
        }
    }

    pub fn repository(&self) -> Arc<dyn ScheduleRepository> {
        Arc::clone(&self.repository)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SlotEvent> {
        self.events.subscribe()
    }

    pub async fn schedule(&self, schedule_id: Uuid) -> Result<Schedule, ScheduleError> {
        self.repository
            .get(schedule_id)
            .await?
            .ok_or(ScheduleError::NotFound(schedule_id))
    }

    pub async fn snapshot(&self, schedule_id: Uuid, slot_start: &str) -> Result<SlotSnapshot, ScheduleError> {
        let schedule = self.schedule(schedule_id).await?;
        schedule
            .slot_index(slot_start)?
            .and_then(|idx| schedule.snapshot(idx))
            .ok_or_else(|| ScheduleError::SlotNotFound {
                schedule_id,
                slot_start: slot_start.to_string(),
            })
    }

    /// Take one unit of the slot's capacity for `appointment_id`.
    ///
    /// Two concurrent admits against a slot with one unit left produce exactly
    /// one `Admitted` and one `Full`: the loser's conditional write fails, it
    /// re-reads, and then observes the slot at capacity.
    pub async fn admit(
        &self,
        schedule_id: Uuid,
        slot_start: &str,
        appointment_id: Uuid,
        room_id: Option<Uuid>,
    ) -> Result<AdmitOutcome, ScheduleError> {
        let result = self
            .mutate_slot(schedule_id, slot_start, |slot| {
                if slot.holds(&appointment_id) {
                    return Decision::Keep(true);
                }
                if slot.booked_count >= slot.max_bookings {
                    return Decision::Keep(false);
                }

                slot.booked_count += 1;
                slot.appointment_ids.push(appointment_id);
                slot.refresh_is_booked();
                if slot.room_id.is_none() {
                    slot.room_id = room_id;
                }
                Decision::Write(true)
            })
            .await?;

        Ok(match result {
            None => AdmitOutcome::SlotNotFound,
            Some((snapshot, slot, true)) => {
                debug!(
                    "Admitted appointment {} into {} {} ({}/{})",
                    appointment_id, schedule_id, snapshot.start_time, snapshot.booked_count, snapshot.max_bookings
                );
                AdmitOutcome::Admitted { snapshot, room_id: slot.room_id }
            }
            Some((snapshot, _, false)) => {
                debug!("Slot {} {} is full", schedule_id, snapshot.start_time);
                AdmitOutcome::Full(snapshot)
            }
        })
    }

    /// Give back the unit held by `appointment_id`. Releasing an appointment
    /// that holds no place is a successful no-op.
    pub async fn release(
        &self,
        schedule_id: Uuid,
        slot_start: &str,
        appointment_id: Uuid,
    ) -> Result<ReleaseOutcome, ScheduleError> {
        let result = self
            .mutate_slot(schedule_id, slot_start, |slot| {
                if !slot.holds(&appointment_id) {
                    return Decision::Keep(false);
                }

                slot.appointment_ids.retain(|id| *id != appointment_id);
                slot.booked_count = slot.booked_count.saturating_sub(1);
                slot.refresh_is_booked();
                if slot.booked_count == 0 {
                    slot.room_id = None;
                }
                Decision::Write(true)
            })
            .await?;

        Ok(match result {
            None => ReleaseOutcome::SlotNotFound,
            Some((snapshot, _, true)) => {
                debug!("Released appointment {} from {} {}", appointment_id, schedule_id, snapshot.start_time);
                ReleaseOutcome::Released(snapshot)
            }
            Some((snapshot, _, false)) => ReleaseOutcome::NotHeld(snapshot),
        })
    }

    /// Administrative capacity change. Takes no slot lock, which is exactly
    /// why admission cannot rely on the lock alone.
    pub async fn set_capacity(
        &self,
        schedule_id: Uuid,
        slot_start: &str,
        max_bookings: u32,
    ) -> Result<SlotSnapshot, ScheduleError> {
        if max_bookings == 0 {
            return Err(ScheduleError::Validation("max_bookings must be at least 1".to_string()));
        }

        let result = self
            .mutate_slot(schedule_id, slot_start, |slot| {
                if max_bookings < slot.booked_count {
                    return Decision::Keep(Err(slot.booked_count));
                }
                if slot.max_bookings == max_bookings {
                    return Decision::Keep(Ok(()));
                }
                slot.max_bookings = max_bookings;
                slot.refresh_is_booked();
                Decision::Write(Ok(()))
            })
            .await?;

        match result {
            None => Err(ScheduleError::SlotNotFound {
                schedule_id,
                slot_start: slot_start.to_string(),
            }),
            Some((_, _, Err(booked))) => Err(ScheduleError::CapacityBelowBookings {
                requested: max_bookings,
                booked,
            }),
            Some((snapshot, _, Ok(()))) => {
                info!("Capacity of {} {} set to {}", schedule_id, snapshot.start_time, max_bookings);
                Ok(snapshot)
            }
        }
    }

    /// Read, apply `decide` to a copy of the slot, and commit with a write
    /// conditioned on the version that was read. Returns `None` when the slot
    /// does not exist on the schedule.
    async fn mutate_slot<T, F>(
        &self,
        schedule_id: Uuid,
        slot_start: &str,
        mut decide: F,
    ) -> Result<Option<(SlotSnapshot, TimeSlot, T)>, ScheduleError>
    where
        F: FnMut(&mut TimeSlot) -> Decision<T>,
    {
        for attempt in 1..=self.max_retries {
            let schedule = self.schedule(schedule_id).await?;
            let Some(index) = schedule.slot_index(slot_start)? else {
                return Ok(None);
            };

            let mut slots = schedule.time_slots.clone();
            match decide(&mut slots[index]) {
                Decision::Keep(value) => {
                    return Ok(schedule
                        .snapshot(index)
                        .map(|snapshot| (snapshot, schedule.time_slots[index].clone(), value)));
                }
                Decision::Write(value) => {
                    let written = self
                        .repository
                        .replace_slots_if_version(schedule_id, schedule.version, slots)
                        .await?;

                    match written {
                        Some(updated) => {
                            let Some(snapshot) = updated.snapshot(index) else {
                                return Ok(None);
                            };
                            // Nobody listening is fine.
                            let _ = self.events.send(SlotEvent::Changed(snapshot.clone()));
                            return Ok(Some((snapshot, updated.time_slots[index].clone(), value)));
                        }
                        None => {
                            debug!(
                                "Lost write race on schedule {} (version {}), attempt {}/{}",
                                schedule_id, schedule.version, attempt, self.max_retries
                            );
                            tokio::task::yield_now().await;
                        }
                    }
                }
            }
        }

        warn!("Write contention exhausted for schedule {}", schedule_id);
        Err(ScheduleError::ContentionExhausted {
            schedule_id,
            attempts: self.max_retries,
        })
    }
}
