use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::BookingError;
use crate::models::{HeldLock, LockAcquisition, LockEvent, LockKey, LockStatus, SYSTEM_HOLDER};

/// Advisory per-slot locks. Implementations must make `acquire` and
/// `release` linearizable per key; nothing here gates slot admission.
#[async_trait]
pub trait SlotLocks: Send + Sync {
    async fn acquire(&self, key: &LockKey, holder: &str) -> Result<LockAcquisition, BookingError>;

    /// Deletes the lock only when `holder` owns it or is `SYSTEM_HOLDER`.
    /// Returns whether a lock was removed.
    async fn release(&self, key: &LockKey, holder: &str) -> Result<bool, BookingError>;

    async fn is_locked(&self, key: &LockKey) -> Result<LockStatus, BookingError>;

    async fn locks_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<HeldLock>, BookingError>;

    async fn release_all_held_by(&self, holder: &str) -> Result<Vec<LockKey>, BookingError>;

    fn subscribe(&self) -> broadcast::Receiver<LockEvent>;
}

struct LockEntry {
    holder: String,
    deadline: Instant,
    generation: u64,
}

#[derive(Default)]
struct LockState {
    entries: HashMap<LockKey, LockEntry>,
    /// Pending deadlines. An item is stale once its generation no longer
    /// matches the entry for its key.
    deadlines: BinaryHeap<Reverse<(Instant, u64, LockKey)>>,
    next_generation: u64,
}

impl LockState {
    fn live_entry(&self, key: &LockKey, now: Instant) -> Option<&LockEntry> {
        self.entries.get(key).filter(|entry| entry.deadline > now)
    }
}

/// In-process lock table with TTL expiry driven by a single deadline heap.
///
/// Every operation is a short critical section on one mutex and never
/// awaits. Expired entries are treated as free the moment their deadline
/// passes, whether or not `run_expiry` has swept them yet.
pub struct LockTable {
    state: Mutex<LockState>,
    ttl: Duration,
    events: broadcast::Sender<LockEvent>,
    wakeup: Notify,
}

impl LockTable {
    pub fn new(ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(LockState::default()),
            ttl,
            events,
            wakeup: Notify::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        // No critical section can panic halfway through a map update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: LockEvent) {
        let _ = self.events.send(event);
    }

    pub fn try_acquire(&self, key: &LockKey, holder: &str) -> LockAcquisition {
        let now = Instant::now();
        let mut expired_holder = None;

        let acquisition = {
            let mut state = self.state();

            match state.live_entry(key, now).map(|entry| entry.holder.clone()) {
                Some(current) if current != holder => {
                    debug!("Lock {} denied to {}, held by {}", key, holder, current);
                    return LockAcquisition {
                        granted: false,
                        held_by: Some(current),
                        expires_at: None,
                    };
                }
                Some(_) => {}
                None => {
                    if let Some(stale) = state.entries.remove(key) {
                        expired_holder = Some(stale.holder);
                    }
                }
            }

            state.next_generation += 1;
            let generation = state.next_generation;
            let deadline = now + self.ttl;
            state.entries.insert(
                key.clone(),
                LockEntry { holder: holder.to_string(), deadline, generation },
            );
            state.deadlines.push(Reverse((deadline, generation, key.clone())));

            LockAcquisition {
                granted: true,
                held_by: Some(holder.to_string()),
                expires_at: Some(wall_clock(deadline, now)),
            }
        };

        if let Some(previous) = expired_holder {
            self.emit(LockEvent::Expired { key: key.clone(), holder: previous });
        }
        if let Some(expires_at) = acquisition.expires_at {
            self.emit(LockEvent::Granted {
                key: key.clone(),
                holder: holder.to_string(),
                expires_at,
            });
        }
        self.wakeup.notify_one();

        debug!("Lock {} granted to {}", key, holder);
        acquisition
    }

    pub fn try_release(&self, key: &LockKey, holder: &str) -> bool {
        let now = Instant::now();
        let removed = {
            let mut state = self.state();
            let owned = match state.live_entry(key, now) {
                Some(entry) => entry.holder == holder || holder == SYSTEM_HOLDER,
                None => false,
            };
            if owned {
                state.entries.remove(key)
            } else {
                None
            }
        };

        match removed {
            Some(entry) => {
                debug!("Lock {} released by {}", key, holder);
                self.emit(LockEvent::Released { key: key.clone(), holder: entry.holder });
                true
            }
            None => false,
        }
    }

    pub fn status(&self, key: &LockKey) -> LockStatus {
        let state = self.state();
        match state.live_entry(key, Instant::now()) {
            Some(entry) => LockStatus { locked: true, held_by: Some(entry.holder.clone()) },
            None => LockStatus { locked: false, held_by: None },
        }
    }

    pub fn held_for_schedule(&self, schedule_id: Uuid) -> Vec<HeldLock> {
        let now = Instant::now();
        let state = self.state();
        let mut held: Vec<HeldLock> = state
            .entries
            .iter()
            .filter(|(key, entry)| key.schedule_id == schedule_id && entry.deadline > now)
            .map(|(key, entry)| HeldLock {
                slot_start: key.slot_start.clone(),
                held_by: entry.holder.clone(),
                expires_at: wall_clock(entry.deadline, now),
            })
            .collect();
        held.sort_by(|a, b| a.slot_start.cmp(&b.slot_start));
        held
    }

    pub fn release_holder(&self, holder: &str) -> Vec<LockKey> {
        let now = Instant::now();
        let released: Vec<LockKey> = {
            let mut state = self.state();
            let keys: Vec<LockKey> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.holder == holder && entry.deadline > now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                state.entries.remove(key);
            }
            keys
        };

        for key in &released {
            self.emit(LockEvent::Released { key: key.clone(), holder: holder.to_string() });
        }
        if !released.is_empty() {
            debug!("Released {} lock(s) held by {}", released.len(), holder);
        }
        released
    }

    /// Remove every entry whose deadline has passed and emit `Expired` for
    /// each. Returns the earliest deadline still pending.
    pub fn purge_expired(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut expired = Vec::new();

        let next = {
            let mut state = self.state();
            loop {
                let Some(Reverse((deadline, generation, key))) = state.deadlines.peek().cloned() else {
                    break None;
                };
                if deadline > now {
                    break Some(deadline);
                }
                state.deadlines.pop();

                let current = state.entries.get(&key).map(|entry| entry.generation);
                if current == Some(generation) {
                    if let Some(entry) = state.entries.remove(&key) {
                        expired.push((key, entry.holder));
                    }
                }
            }
        };

        for (key, holder) in expired {
            debug!("Lock {} held by {} expired", key, holder);
            self.emit(LockEvent::Expired { key, holder });
        }
        next
    }

    /// Expiry loop: sleeps until the earliest deadline, sweeps, and repeats.
    /// New grants wake it so a shorter deadline is never missed.
    pub async fn run_expiry(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Slot lock expiry task started (ttl {:?})", self.ttl);
        loop {
            let next = self.purge_expired();
            let sleep_until = next.unwrap_or_else(|| Instant::now() + self.ttl);

            tokio::select! {
                _ = tokio::time::sleep_until(sleep_until) => {}
                _ = self.wakeup.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Slot lock expiry task stopped");
    }
}

fn wall_clock(deadline: Instant, now: Instant) -> chrono::DateTime<Utc> {
    let remaining = deadline.saturating_duration_since(now);
    Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

#[async_trait]
impl SlotLocks for LockTable {
    async fn acquire(&self, key: &LockKey, holder: &str) -> Result<LockAcquisition, BookingError> {
        Ok(self.try_acquire(key, holder))
    }

    async fn release(&self, key: &LockKey, holder: &str) -> Result<bool, BookingError> {
        Ok(self.try_release(key, holder))
    }

    async fn is_locked(&self, key: &LockKey) -> Result<LockStatus, BookingError> {
        Ok(self.status(key))
    }

    async fn locks_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<HeldLock>, BookingError> {
        Ok(self.held_for_schedule(schedule_id))
    }

    async fn release_all_held_by(&self, holder: &str) -> Result<Vec<LockKey>, BookingError> {
        Ok(self.release_holder(holder))
    }

    fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }
}
