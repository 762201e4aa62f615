use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use schedule_cell::{ScheduleRepository, SlotEvent, SlotSnapshot, SlotStore};

use crate::error::BookingError;
use crate::models::{CalendarKey, ClientMessage, LockEvent, LockKey, ServerMessage, UnlockReason};
use crate::services::lock::SlotLocks;

pub type ConnectionSender = broadcast::Sender<String>;
pub type ConnectionReceiver = broadcast::Receiver<String>;

struct Connection {
    holder: String,
    sender: ConnectionSender,
    rooms: HashSet<CalendarKey>,
}

/// Live calendar viewers grouped by (doctor, date).
///
/// Each connection owns a broadcast channel; pushing to it never waits, so a
/// slow socket only loses its own messages. Payloads carry slot occupancy and
/// lock holders, never appointment ids.
pub struct RealtimeHub {
    connections: Arc<RwLock<HashMap<Uuid, Connection>>>,
    rooms: Arc<RwLock<HashMap<CalendarKey, HashSet<Uuid>>>>,
    /// schedule id -> calendar. A schedule's doctor and date never change.
    calendars: Arc<RwLock<HashMap<Uuid, CalendarKey>>>,
    locks: Arc<dyn SlotLocks>,
    slots: Arc<SlotStore>,
}

impl RealtimeHub {
    pub fn new(locks: Arc<dyn SlotLocks>, slots: Arc<SlotStore>) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            calendars: Arc::new(RwLock::new(HashMap::new())),
            locks,
            slots,
        }
    }

    pub async fn connect(&self, holder: &str) -> (Uuid, ConnectionReceiver) {
        let (sender, receiver) = broadcast::channel(100);
        let connection_id = Uuid::new_v4();

        let mut connections = self.connections.write().await;
        connections.insert(connection_id, Connection {
            holder: holder.to_string(),
            sender,
            rooms: HashSet::new(),
        });

        debug!("Realtime connection {} opened for {}", connection_id, holder);
        (connection_id, receiver)
    }

    pub async fn subscribe(&self, connection_id: Uuid, doctor_id: Uuid, date: NaiveDate) -> bool {
        let calendar = CalendarKey { doctor_id, date };
        {
            let mut connections = self.connections.write().await;
            let Some(connection) = connections.get_mut(&connection_id) else {
                return false;
            };
            connection.rooms.insert(calendar);
        }

        let mut rooms = self.rooms.write().await;
        rooms.entry(calendar).or_default().insert(connection_id);
        debug!("Connection {} joined {} {}", connection_id, doctor_id, date);
        true
    }

    /// Drop the connection and, when it was the holder's last one, release
    /// every lock the holder still has.
    pub async fn disconnect(&self, connection_id: Uuid) -> Vec<LockKey> {
        let removed = {
            let mut connections = self.connections.write().await;
            let removed = connections.remove(&connection_id);
            removed.map(|connection| {
                let still_connected = connections.values().any(|other| other.holder == connection.holder);
                (connection, still_connected)
            })
        };

        let Some((connection, still_connected)) = removed else {
            return Vec::new();
        };

        {
            let mut rooms = self.rooms.write().await;
            for calendar in &connection.rooms {
                if let Some(members) = rooms.get_mut(calendar) {
                    members.remove(&connection_id);
                    if members.is_empty() {
                        rooms.remove(calendar);
                    }
                }
            }
        }
        debug!("Realtime connection {} closed", connection_id);

        if still_connected {
            return Vec::new();
        }
        match self.locks.release_all_held_by(&connection.holder).await {
            Ok(released) => released,
            Err(e) => {
                warn!("Lock cleanup for {} failed: {}", connection.holder, e);
                Vec::new()
            }
        }
    }

    pub async fn broadcast(&self, doctor_id: Uuid, date: NaiveDate, message: &ServerMessage) -> usize {
        let calendar = CalendarKey { doctor_id, date };
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode realtime message: {}", e);
                return 0;
            }
        };

        let members: Vec<Uuid> = {
            let rooms = self.rooms.read().await;
            match rooms.get(&calendar) {
                Some(members) => members.iter().copied().collect(),
                None => return 0,
            }
        };

        let connections = self.connections.read().await;
        let mut delivered = 0;
        for connection_id in members {
            if let Some(connection) = connections.get(&connection_id) {
                if connection.sender.send(payload.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub async fn broadcast_slot(&self, snapshot: SlotSnapshot) -> usize {
        let (doctor_id, date) = (snapshot.doctor_id, snapshot.date);
        self.broadcast(doctor_id, date, &ServerMessage::SlotUpdated { slot: snapshot }).await
    }

    pub async fn active_connections(&self) -> usize {
        self.connections.read().await.len()
    }

    // ==========================================================================
    // CLIENT MESSAGES
    // ==========================================================================

    /// Apply one inbound message and return the direct replies for the sender.
    /// Lock changes reach the rest of the room through the lock event stream.
    pub async fn handle_client_message(
        &self,
        connection_id: Uuid,
        holder: &str,
        message: ClientMessage,
    ) -> Vec<ServerMessage> {
        match self.apply(connection_id, holder, message).await {
            Ok(replies) => replies,
            Err(e) => vec![ServerMessage::Error { message: e.to_string() }],
        }
    }

    async fn apply(
        &self,
        connection_id: Uuid,
        holder: &str,
        message: ClientMessage,
    ) -> Result<Vec<ServerMessage>, BookingError> {
        match message {
            ClientMessage::JoinAppointmentRoom { doctor_id, date } => {
                if !self.subscribe(connection_id, doctor_id, date).await {
                    return Err(BookingError::NotFound(format!("Connection {}", connection_id)));
                }

                let schedule = self
                    .slots
                    .repository()
                    .find_by_doctor_and_date(doctor_id, date)
                    .await?;

                let reply = match schedule {
                    Some(schedule) => {
                        self.remember(schedule.id, CalendarKey { doctor_id, date }).await;
                        ServerMessage::CurrentLockedSlots {
                            schedule_id: Some(schedule.id),
                            slots: self.locks.locks_for_schedule(schedule.id).await?,
                        }
                    }
                    None => ServerMessage::CurrentLockedSlots { schedule_id: None, slots: Vec::new() },
                };
                Ok(vec![reply])
            }
            ClientMessage::LockTimeSlot { schedule_id, slot_start } => {
                let key = LockKey::new(schedule_id, &slot_start)?;
                let acquisition = self.locks.acquire(&key, holder).await?;

                if acquisition.granted {
                    Ok(vec![ServerMessage::TimeSlotLockConfirmed {
                        schedule_id,
                        slot_start: key.slot_start,
                        expires_at: acquisition.expires_at,
                    }])
                } else {
                    Ok(vec![ServerMessage::TimeSlotLockRejected {
                        schedule_id,
                        slot_start: key.slot_start,
                        message: "This time slot is being booked by another user".to_string(),
                    }])
                }
            }
            ClientMessage::UnlockTimeSlot { schedule_id, slot_start } => {
                let key = LockKey::new(schedule_id, &slot_start)?;
                self.locks.release(&key, holder).await?;
                Ok(Vec::new())
            }
        }
    }

    // ==========================================================================
    // EVENT FORWARDING
    // ==========================================================================

    async fn remember(&self, schedule_id: Uuid, calendar: CalendarKey) {
        self.calendars.write().await.insert(schedule_id, calendar);
    }

    async fn calendar_for(&self, schedule_id: Uuid) -> Option<CalendarKey> {
        if let Some(calendar) = self.calendars.read().await.get(&schedule_id) {
            return Some(*calendar);
        }

        match self.slots.schedule(schedule_id).await {
            Ok(schedule) => {
                let calendar = CalendarKey { doctor_id: schedule.doctor_id, date: schedule.date };
                self.remember(schedule_id, calendar).await;
                Some(calendar)
            }
            Err(e) => {
                debug!("No calendar for schedule {}: {}", schedule_id, e);
                None
            }
        }
    }

    pub async fn forward_lock_event(&self, event: LockEvent) -> usize {
        let Some(calendar) = self.calendar_for(event.key().schedule_id).await else {
            return 0;
        };

        let message = match event {
            LockEvent::Granted { key, holder, .. } => ServerMessage::TimeSlotLocked {
                schedule_id: key.schedule_id,
                slot_start: key.slot_start,
                locked_by: holder,
            },
            LockEvent::Released { key, .. } => ServerMessage::TimeSlotUnlocked {
                schedule_id: key.schedule_id,
                slot_start: key.slot_start,
                reason: UnlockReason::Released,
            },
            LockEvent::Expired { key, .. } => ServerMessage::TimeSlotUnlocked {
                schedule_id: key.schedule_id,
                slot_start: key.slot_start,
                reason: UnlockReason::Expired,
            },
        };
        self.broadcast(calendar.doctor_id, calendar.date, &message).await
    }

    /// Fan committed slot changes and lock transitions out to the rooms until
    /// shutdown. Runs off the booking path.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut slot_events = self.slots.subscribe();
        let mut lock_events = self.locks.subscribe();
        info!("Realtime event forwarder started");

        loop {
            tokio::select! {
                event = slot_events.recv() => match event {
                    Ok(SlotEvent::Changed(snapshot)) => {
                        self.broadcast_slot(snapshot).await;
                    }
                    Err(RecvError::Lagged(skipped)) => warn!("Realtime forwarder skipped {} slot events", skipped),
                    Err(RecvError::Closed) => break,
                },
                event = lock_events.recv() => match event {
                    Ok(event) => {
                        self.forward_lock_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => warn!("Realtime forwarder skipped {} lock events", skipped),
                    Err(RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Realtime event forwarder stopped");
    }
}
