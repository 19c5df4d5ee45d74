//! Inference slot allocation.
//!
//! The backend offers a fixed number of slots; each in-flight request owns
//! exactly one from assignment to release, so per-slot backend calls are
//! serialized by construction. Waiters queue FIFO on a semaphore whose
//! permit count always equals the number of idle slots; holding a permit
//! guarantees an idle slot exists, and the table lock only decides which
//! one. Each slot remembers the save id whose KV state it last held,
//! which lets `assign` steer a request toward a slot that already has its
//! candidate prefix loaded.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::{Error, Result};

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    /// Assigned, no backend call issued yet.
    Reserved(RequestId),
    Busy(RequestId),
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    /// Save id of the KV state last loaded into this slot, if any.
    resident: Option<String>,
    permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
pub struct SlotManager {
    slots: Mutex<Vec<Slot>>,
    free: Arc<Semaphore>,
}

impl SlotManager {
    pub fn new(n_slots: usize) -> Self {
        let slots = (0..n_slots)
            .map(|_| Slot {
                state: SlotState::Idle,
                resident: None,
                permit: None,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            free: Arc::new(Semaphore::new(n_slots)),
        }
    }

    pub fn n_slots(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.state != SlotState::Idle)
            .count()
    }

    /// Assign a slot, blocking FIFO behind earlier waiters until one frees
    /// or the deadline passes. Among currently idle slots, one already
    /// holding `preferred` wins; the preference never jumps the queue.
    pub async fn assign(
        &self,
        request: RequestId,
        preferred: Option<&str>,
        deadline: Instant,
    ) -> Result<usize> {
        let permit = match timeout_at(deadline, self.free.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Internal("slot semaphore closed".to_string())),
            Err(_) => {
                return Err(Error::ServiceUnavailable(
                    "no inference slot became available before the deadline".to_string(),
                ))
            }
        };

        let mut slots = self.slots.lock();
        let slot_id = Self::pick_idle(&slots, preferred).ok_or_else(|| {
            // A permit implies an idle slot; this is a table bug.
            Error::Internal("slot table out of sync with semaphore".to_string())
        })?;
        let slot = &mut slots[slot_id];
        slot.state = SlotState::Reserved(request);
        slot.permit = Some(permit);
        debug!(request, slot = slot_id, resident = ?slot.resident, "slot assigned");
        Ok(slot_id)
    }

    fn pick_idle(slots: &[Slot], preferred: Option<&str>) -> Option<usize> {
        if let Some(want) = preferred {
            let hit = slots
                .iter()
                .position(|s| s.state == SlotState::Idle && s.resident.as_deref() == Some(want));
            if hit.is_some() {
                return hit;
            }
        }
        slots.iter().position(|s| s.state == SlotState::Idle)
    }

    /// Record the first backend call on the slot.
    pub fn mark_busy(&self, slot_id: usize) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(slot_id) {
            if let SlotState::Reserved(request) = slot.state {
                slot.state = SlotState::Busy(request);
            }
        }
    }

    /// Return a slot to the pool. `final_entry` records which save id's KV
    /// state the slot now holds; `None` clears the hint because the slot's
    /// contents no longer correspond to any saved entry.
    ///
    /// Synchronous so drop guards can call it on every exit path.
    pub fn release(&self, slot_id: usize, final_entry: Option<&str>) {
        let permit = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(slot_id) else {
                warn!(slot = slot_id, "release of unknown slot");
                return;
            };
            slot.state = SlotState::Idle;
            slot.resident = final_entry.map(str::to_string);
            slot.permit.take()
        };
        // Dropping the permit readmits the next waiter, after the table
        // already shows the slot idle.
        drop(permit);
    }

    #[cfg(test)]
    fn resident(&self, slot_id: usize) -> Option<String> {
        self.slots.lock()[slot_id].resident.clone()
    }
}
