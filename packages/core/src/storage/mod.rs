// Модуль хранилища: счётчики непрочитанных, общие для вкладок и комнат

#[cfg(target_arch = "wasm32")]
pub mod browser;
pub mod memory;
pub mod models;

use crate::utils::error::Result;
use serde::{Deserialize, Serialize};

#[cfg(target_arch = "wasm32")]
pub use browser::BrowserUnreadStore;
pub use memory::MemoryUnreadStore;

/// Изменение счётчика непрочитанных, рассылается подписчикам
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadChange {
    pub viewer_id: String,
    pub room_id: String,
    pub count: u32,
}

/// Постоянное key-value хранилище счётчиков (viewer, room) -> count.
///
/// Писатель обязан уведомить подписчиков после каждого изменения значения;
/// читатели не предполагают единственного владельца в памяти.
pub trait UnreadStore {
    fn get(&self, viewer_id: &str, room_id: &str) -> u32;

    fn set(&mut self, viewer_id: &str, room_id: &str, count: u32) -> Result<()>;

    /// Новый канал уведомлений об изменениях
    fn subscribe(&mut self) -> flume::Receiver<UnreadChange>;

    fn increment(&mut self, viewer_id: &str, room_id: &str) -> Result<u32> {
        let next = self.get(viewer_id, room_id).saturating_add(1);
        self.set(viewer_id, room_id, next)?;
        Ok(next)
    }

    fn clear(&mut self, viewer_id: &str, room_id: &str) -> Result<()> {
        self.set(viewer_id, room_id, 0)
    }
}

/// Ключ счётчика: `<namespace>:<viewer>:<room>`
pub fn unread_key(namespace: &str, viewer_id: &str, room_id: &str) -> String {
    format!("{}:{}:{}", namespace, viewer_id, room_id)
}

/// Обратно к (viewer, room). Чужие ключи дают None
pub fn parse_unread_key(namespace: &str, key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix(namespace)?.strip_prefix(':')?;
    let (viewer_id, room_id) = rest.split_once(':')?;
    if viewer_id.is_empty() || room_id.is_empty() {
        return None;
    }
    Some((viewer_id.to_string(), room_id.to_string()))
}

impl UnreadChange {
    /// Изменение по записи хранилища, сделанной другой вкладкой.
    /// Удалённый ключ или мусор в значении дают 0
    pub fn from_storage_entry(namespace: &str, key: &str, new_value: Option<&str>) -> Option<Self> {
        let (viewer_id, room_id) = parse_unread_key(namespace, key)?;
        let count = new_value.and_then(|v| v.trim().parse().ok()).unwrap_or(0);
        Some(Self {
            viewer_id,
            room_id,
            count,
        })
    }
}

/// Разослать изменение, отбрасывая закрытые каналы
pub(crate) fn notify(subscribers: &mut Vec<flume::Sender<UnreadChange>>, change: &UnreadChange) {
    subscribers.retain(|tx| tx.send(change.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unread_key_parses_back() {
        let key = unread_key("chat-unread", "me", "room:42");
        assert_eq!(
            parse_unread_key("chat-unread", &key),
            Some(("me".to_string(), "room:42".to_string()))
        );
        assert_eq!(parse_unread_key("chat-unread", "chat-unreadx:me:r1"), None);
        assert_eq!(parse_unread_key("chat-unread", "theme"), None);
        assert_eq!(parse_unread_key("chat-unread", "chat-unread:me:"), None);
    }

    #[test]
    fn test_change_from_storage_entry() {
        let change = UnreadChange::from_storage_entry("chat-unread", "chat-unread:me:r3", Some("4")).unwrap();
        assert_eq!(change.room_id, "r3");
        assert_eq!(change.count, 4);

        let removed = UnreadChange::from_storage_entry("chat-unread", "chat-unread:me:r3", None).unwrap();
        assert_eq!(removed.count, 0);
        assert!(UnreadChange::from_storage_entry("chat-unread", "other:me:r3", Some("1")).is_none());
    }
}
