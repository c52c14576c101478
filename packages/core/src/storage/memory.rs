// In-memory хранилище счётчиков для тестов и non-WASM платформ

use crate::storage::{notify, unread_key, UnreadChange, UnreadStore};
use crate::utils::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    counts: HashMap<String, u32>,
    subscribers: Vec<flume::Sender<UnreadChange>>,
}

/// In-memory хранилище. Клоны разделяют состояние и подписчиков,
/// как две вкладки браузера разделяют localStorage
#[derive(Debug, Clone)]
pub struct MemoryUnreadStore {
    namespace: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryUnreadStore {
    pub fn new() -> Self {
        Self::with_namespace(crate::config::Config::global().unread_key_namespace.clone())
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Сумма по всем комнатам зрителя (для бейджа в шапке)
    pub fn total_for(&self, viewer_id: &str) -> u32 {
        let prefix = format!("{}:{}:", self.namespace, viewer_id);
        self.lock()
            .counts
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, count)| *count)
            .sum()
    }
}

impl Default for MemoryUnreadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UnreadStore for MemoryUnreadStore {
    fn get(&self, viewer_id: &str, room_id: &str) -> u32 {
        let key = unread_key(&self.namespace, viewer_id, room_id);
        self.lock().counts.get(&key).copied().unwrap_or(0)
    }

    fn set(&mut self, viewer_id: &str, room_id: &str, count: u32) -> Result<()> {
        let key = unread_key(&self.namespace, viewer_id, room_id);
        let mut inner = self.lock();
        let previous = inner.counts.insert(key, count).unwrap_or(0);
        if previous != count {
            let change = UnreadChange {
                viewer_id: viewer_id.to_string(),
                room_id: room_id.to_string(),
                count,
            };
            notify(&mut inner.subscribers, &change);
        }
        Ok(())
    }

    fn subscribe(&mut self) -> flume::Receiver<UnreadChange> {
        let (tx, rx) = flume::unbounded();
        self.lock().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_clear() {
        let mut store = MemoryUnreadStore::with_namespace("t");
        assert_eq!(store.increment("v1", "r1").unwrap(), 1);
        assert_eq!(store.increment("v1", "r1").unwrap(), 2);
        assert_eq!(store.get("v1", "r1"), 2);
        assert_eq!(store.get("v2", "r1"), 0);

        store.clear("v1", "r1").unwrap();
        assert_eq!(store.get("v1", "r1"), 0);
    }

    #[test]
    fn test_clones_share_state_and_notify() {
        let mut tab_a = MemoryUnreadStore::with_namespace("t");
        let mut tab_b = tab_a.clone();
        let rx = tab_b.subscribe();

        tab_a.increment("v1", "r1").unwrap();
        assert_eq!(tab_b.get("v1", "r1"), 1);

        let change = rx.try_recv().unwrap();
        assert_eq!(change.room_id, "r1");
        assert_eq!(change.count, 1);

        // Запись того же значения не рассылается
        tab_a.set("v1", "r1", 1).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_total_for_viewer() {
        let mut store = MemoryUnreadStore::with_namespace("t");
        store.set("v1", "r1", 2).unwrap();
        store.set("v1", "r2", 3).unwrap();
        store.set("v2", "r1", 7).unwrap();
        assert_eq!(store.total_for("v1"), 5);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut store = MemoryUnreadStore::with_namespace("t");
        let rx = store.subscribe();
        drop(rx);
        store.set("v1", "r1", 1).unwrap();
        assert!(store.lock().subscribers.is_empty());
    }
}
