use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    AlreadyRunning,
    AtCapacity,
}

/// Bounds how many jobs this process works on at once.
///
/// Process-local only; cross-replica exclusion comes from the store's
/// conditional claim, not from here.
#[derive(Clone)]
pub struct ConcurrencyGate {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    capacity: usize,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        // the set stays consistent even if a holder panicked
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn admit(&self, id: Uuid) -> Admission {
        let mut guard = self.lock();
        if guard.contains(&id) {
            Admission::AlreadyRunning
        } else if guard.len() >= self.capacity {
            Admission::AtCapacity
        } else {
            guard.insert(id);
            Admission::Admitted
        }
    }

    pub fn release(&self, id: Uuid) -> bool {
        self.lock().remove(&id)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_flight())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Releases its gate slot when dropped.
pub struct SlotGuard {
    gate: ConcurrencyGate,
    id: Uuid,
}

impl SlotGuard {
    pub fn new(gate: ConcurrencyGate, id: Uuid) -> Self {
        Self { gate, id }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.gate.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity() {
        let gate = ConcurrencyGate::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(gate.admit(a), Admission::Admitted);
        assert_eq!(gate.admit(a), Admission::AlreadyRunning);
        assert_eq!(gate.admit(b), Admission::Admitted);
        assert_eq!(gate.admit(c), Admission::AtCapacity);
        assert_eq!(gate.available(), 0);

        assert!(gate.release(a));
        assert!(!gate.release(a));
        assert_eq!(gate.admit(c), Admission::Admitted);
    }

    #[test]
    fn slot_guard_releases_on_drop() {
        let gate = ConcurrencyGate::new(1);
        let id = Uuid::new_v4();
        assert_eq!(gate.admit(id), Admission::Admitted);
        {
            let _slot = SlotGuard::new(gate.clone(), id);
        }
        assert_eq!(gate.in_flight(), 0);
    }
}
