//! Explicit coordinator registry.
//!
//! One coordinator per (document, user, client) key. The application owns
//! the registry and passes it where it is needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub doc_id: String,
    pub user_id: String,
    pub client_id: String,
}

impl SessionKey {
    pub fn of(config: &CoordinatorConfig) -> Self {
        Self {
            doc_id: config.doc_id.clone(),
            user_id: config.user_id.clone(),
            client_id: config.client_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorRegistry {
    coordinators: Arc<Mutex<HashMap<SessionKey, Coordinator>>>,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Coordinator>> {
        self.coordinators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the live coordinator for `config`'s key or opens one with `open`.
    ///
    /// A coordinator that was shut down is replaced.
    pub fn get_or_open<F>(&self, config: CoordinatorConfig, open: F) -> Result<Coordinator, SyncError>
    where
        F: FnOnce(CoordinatorConfig) -> Result<Coordinator, SyncError>,
    {
        let key = SessionKey::of(&config);
        let mut coordinators = self.lock();
        if let Some(existing) = coordinators.get(&key) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let coordinator = open(config)?;
        coordinators.insert(key, coordinator.clone());
        Ok(coordinator)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Coordinator> {
        self.lock().get(key).filter(|c| !c.is_closed()).cloned()
    }

    /// Shuts down and forgets one coordinator.
    pub fn shutdown(&self, key: &SessionKey) -> Result<bool, SyncError> {
        let removed = self.lock().remove(key);
        match removed {
            Some(coordinator) => coordinator.shutdown().map(|_| true),
            None => Ok(false),
        }
    }

    /// Shuts down every coordinator; the first error is returned after all ran.
    pub fn shutdown_all(&self) -> Result<(), SyncError> {
        let drained: Vec<Coordinator> = self.lock().drain().map(|(_, c)| c).collect();
        let mut first_error = None;
        for coordinator in drained {
            if let Err(e) = coordinator.shutdown() {
                log::warn!("shutdown of {:?} failed: {e}", coordinator);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::KeyWiseMerge;
    use crate::repository::MemoryRepository;

    fn opener(config: CoordinatorConfig) -> Result<Coordinator, SyncError> {
        Coordinator::open(
            config,
            Arc::new(KeyWiseMerge),
            Box::new(MemoryRepository::new()),
            None,
        )
    }

    #[tokio::test]
    async fn test_same_key_returns_same_coordinator() {
        let registry = CoordinatorRegistry::new();
        let a = registry
            .get_or_open(CoordinatorConfig::for_testing("d", "u", "c"), opener)
            .unwrap();
        a.edit_document(serde_json::json!({"x": 1}), serde_json::Value::Null)
            .unwrap();
        let b = registry
            .get_or_open(CoordinatorConfig::for_testing("d", "u", "c"), opener)
            .unwrap();
        assert_eq!(b.doc(), serde_json::json!({"x": 1}));
        assert_eq!(registry.len(), 1);

        registry
            .get_or_open(CoordinatorConfig::for_testing("d", "u", "other"), opener)
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_removes_and_closes() {
        let registry = CoordinatorRegistry::new();
        let config = CoordinatorConfig::for_testing("d", "u", "c");
        let key = SessionKey::of(&config);
        let coordinator = registry.get_or_open(config, opener).unwrap();

        assert!(registry.shutdown(&key).unwrap());
        assert!(coordinator.is_closed());
        assert!(registry.get(&key).is_none());
        assert!(!registry.shutdown(&key).unwrap());
    }

    #[tokio::test]
    async fn test_closed_coordinator_is_replaced() {
        let registry = CoordinatorRegistry::new();
        let config = CoordinatorConfig::for_testing("d", "u", "c");
        let first = registry.get_or_open(config.clone(), opener).unwrap();
        first.shutdown().unwrap();
        let second = registry.get_or_open(config, opener).unwrap();
        assert!(!second.is_closed());

        registry.shutdown_all().unwrap();
        assert!(registry.is_empty());
        assert!(second.is_closed());
    }
}
