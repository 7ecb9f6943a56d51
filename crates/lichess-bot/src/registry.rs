//! Shared table of game sessions, the single source of truth for the slot count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Admitted, stream not yet opened.
    Pending,
    Active,
    /// Game over, finishing PGN and engine shutdown.
    Ending,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SessionStatus>>>,
    max: usize,
}

impl SessionRegistry {
    pub fn new(max: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            max,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionStatus>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Claims a slot for `game_id`. Fails when the game already has a session
    /// or every slot is taken; check and insert happen under one lock.
    pub fn try_admit(&self, game_id: &str) -> bool {
        let mut sessions = self.lock();
        if sessions.contains_key(game_id) || sessions.len() >= self.max {
            return false;
        }
        sessions.insert(game_id.to_string(), SessionStatus::Pending);
        true
    }

    pub fn set_status(&self, game_id: &str, status: SessionStatus) {
        if let Some(entry) = self.lock().get_mut(game_id) {
            *entry = status;
        }
    }

    pub fn status(&self, game_id: &str) -> Option<SessionStatus> {
        self.lock().get(game_id).copied()
    }

    /// Frees the slot.
    pub fn remove(&self, game_id: &str) -> bool {
        self.lock().remove(game_id).is_some()
    }

    pub fn contains(&self, game_id: &str) -> bool {
        self.lock().contains_key(game_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn has_free_slot(&self) -> bool {
        self.len() < self.max
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| matches!(s, SessionStatus::Pending | SessionStatus::Active))
            .count()
    }

    pub fn game_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_respects_capacity_and_duplicates() {
        let registry = SessionRegistry::new(2);
        assert!(registry.try_admit("a"));
        assert!(!registry.try_admit("a"));
        assert!(registry.try_admit("b"));
        assert!(!registry.try_admit("c"));
        assert!(!registry.has_free_slot());

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.try_admit("c"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_status_transitions() {
        let registry = SessionRegistry::new(3);
        registry.try_admit("a");
        registry.try_admit("b");
        assert_eq!(registry.status("a"), Some(SessionStatus::Pending));
        registry.set_status("a", SessionStatus::Active);
        registry.set_status("b", SessionStatus::Ending);
        registry.set_status("zzz", SessionStatus::Active);
        assert_eq!(registry.active_count(), 1);
        assert!(!registry.contains("zzz"));
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_max() {
        let registry = SessionRegistry::new(3);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.try_admit(&format!("g{i}")))
            })
            .collect();
        let admitted = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(admitted, 3);
        assert_eq!(registry.len(), 3);
    }
}
