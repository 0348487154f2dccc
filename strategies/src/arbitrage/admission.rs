use spreadarb_core::store::PairId;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Slots {
    /// `None` means unbounded.
    limit: Option<u32>,
    admitted: HashSet<PairId>,
}

/// Process-wide gate on how many pairs may hold a position at once.
///
/// Check and insert happen under one lock, so concurrent entries from
/// different pair tasks can never over-admit.
#[derive(Debug, Default)]
pub struct AdmissionController {
    slots: Mutex<Slots>,
}

impl AdmissionController {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            slots: Mutex::new(Slots {
                limit,
                admitted: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // Slots stays consistent even if a holder panicked mid-call.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a slot for `pair_id`. Already-admitted pairs keep theirs.
    pub fn try_admit(&self, pair_id: PairId) -> bool {
        let mut slots = self.lock();
        if slots.admitted.contains(&pair_id) {
            return true;
        }
        if let Some(limit) = slots.limit
            && slots.admitted.len() >= limit as usize
        {
            debug!(pair_id, limit, "Admission refused");
            return false;
        }
        slots.admitted.insert(pair_id);
        debug!(pair_id, active = slots.admitted.len(), "Admitted");
        true
    }

    /// Returns `false` if the pair held no slot.
    pub fn release(&self, pair_id: PairId) -> bool {
        let mut slots = self.lock();
        let released = slots.admitted.remove(&pair_id);
        if released {
            debug!(pair_id, active = slots.admitted.len(), "Released");
        }
        released
    }

    /// Lowering the limit never evicts; it only blocks new admissions.
    pub fn set_limit(&self, limit: Option<u32>) {
        let mut slots = self.lock();
        info!(old = ?slots.limit, new = ?limit, "max_concurrent_trades updated");
        slots.limit = limit;
    }

    pub fn active(&self) -> usize {
        self.lock().admitted.len()
    }
}
