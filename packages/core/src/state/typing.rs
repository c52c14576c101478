// Индикатор "печатает": кто печатает в каждой комнате, с истечением по времени

use crate::storage::models::{Role, TypingEntry};
use std::collections::HashMap;

/// Эфемерная карта комната -> печатающие. Не сохраняется
#[derive(Debug, Clone)]
pub struct TypingTracker {
    ttl_ms: i64,
    rooms: HashMap<String, Vec<TypingEntry>>,
}

impl TypingTracker {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            rooms: HashMap::new(),
        }
    }

    /// `true` продлевает запись до `now + ttl`, `false` удаляет её сразу.
    /// Возвращает `true`, если видимое состояние комнаты изменилось
    pub fn set_typing(&mut self, room_id: &str, actor_key: &str, role: Role, is_typing: bool, now_ms: i64) -> bool {
        if !is_typing {
            let Some(entries) = self.rooms.get_mut(room_id) else {
                return false;
            };
            let before = entries.len();
            entries.retain(|e| e.actor_key != actor_key);
            let changed = entries.len() != before;
            if entries.is_empty() {
                self.rooms.remove(room_id);
            }
            return changed;
        }

        let expires_at_epoch_ms = now_ms + self.ttl_ms;
        let entries = self.rooms.entry(room_id.to_string()).or_default();
        match entries.iter_mut().find(|e| e.actor_key == actor_key) {
            Some(entry) => {
                let changed = entry.role != role;
                entry.role = role;
                entry.expires_at_epoch_ms = expires_at_epoch_ms;
                changed
            }
            None => {
                entries.push(TypingEntry {
                    room_id: room_id.to_string(),
                    actor_key: actor_key.to_string(),
                    role,
                    expires_at_epoch_ms,
                });
                true
            }
        }
    }

    /// Удалить истёкшие записи. Возвращает комнаты, где что-то исчезло
    pub fn sweep(&mut self, now_ms: i64) -> Vec<String> {
        let mut changed = Vec::new();
        self.rooms.retain(|room_id, entries| {
            let before = entries.len();
            entries.retain(|e| now_ms <= e.expires_at_epoch_ms);
            if entries.len() != before {
                changed.push(room_id.clone());
            }
            !entries.is_empty()
        });
        if !changed.is_empty() {
            tracing::trace!(target: "chat::typing", rooms = ?changed, "expired typing entries swept");
        }
        changed
    }

    pub fn entries(&self, room_id: &str) -> &[TypingEntry] {
        self.rooms.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_anyone_typing(&self, room_id: &str) -> bool {
        !self.entries(room_id).is_empty()
    }

    /// "PM is typing…" / "PM and 2 others are typing…"; пусто, если никто
    pub fn label(&self, room_id: &str) -> String {
        typing_label(self.entries(room_id))
    }

    pub fn clear_room(&mut self, room_id: &str) -> bool {
        self.rooms.remove(room_id).is_some()
    }
}

pub fn typing_label(entries: &[TypingEntry]) -> String {
    let Some(first) = entries.first() else {
        return String::new();
    };
    let name = first.role.label();
    match entries.len() - 1 {
        0 => format!("{} is typing…", name),
        1 => format!("{} and 1 other are typing…", name),
        others => format!("{} and {} others are typing…", name, others),
    }
}

/// Сигнал о собственном наборе текста
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Started,
    Stopped,
}

impl TypingSignal {
    pub fn is_typing(&self) -> bool {
        matches!(self, TypingSignal::Started)
    }
}

/// Дебаунс локального набора: серия нажатий даёт один Started
/// и один Stopped после паузы
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    idle_ms: i64,
    active: bool,
    last_keystroke_ms: i64,
}

impl TypingDebouncer {
    pub fn new(idle_ms: i64) -> Self {
        Self {
            idle_ms,
            active: false,
            last_keystroke_ms: 0,
        }
    }

    pub fn keystroke(&mut self, now_ms: i64) -> Option<TypingSignal> {
        self.last_keystroke_ms = now_ms;
        if self.active {
            return None;
        }
        self.active = true;
        Some(TypingSignal::Started)
    }

    /// Вызывается периодически; после паузы выдаёт Stopped
    pub fn tick(&mut self, now_ms: i64) -> Option<TypingSignal> {
        if self.active && now_ms - self.last_keystroke_ms >= self.idle_ms {
            self.active = false;
            return Some(TypingSignal::Stopped);
        }
        None
    }

    /// Немедленная остановка (отправка сообщения, смена комнаты)
    pub fn stop(&mut self) -> Option<TypingSignal> {
        if !self.active {
            return None;
        }
        self.active = false;
        Some(TypingSignal::Stopped)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expires_without_stop_event() {
        let mut tracker = TypingTracker::new(2500);
        assert!(tracker.set_typing("r1", "u1", Role::Pm, true, 0));
        assert_eq!(tracker.label("r1"), "PM is typing…");

        assert!(tracker.sweep(2000).is_empty());
        assert_eq!(tracker.sweep(3000), vec!["r1".to_string()]);
        assert_eq!(tracker.label("r1"), "");
        assert!(!tracker.is_anyone_typing("r1"));
    }

    #[test]
    fn test_renewal_extends_expiry() {
        let mut tracker = TypingTracker::new(2500);
        tracker.set_typing("r1", "u1", Role::Client, true, 0);
        assert!(!tracker.set_typing("r1", "u1", Role::Client, true, 2000));
        assert!(tracker.sweep(4000).is_empty());
        assert_eq!(tracker.entries("r1")[0].expires_at_epoch_ms, 4500);
    }

    #[test]
    fn test_explicit_stop_and_label_counts() {
        let mut tracker = TypingTracker::new(2500);
        tracker.set_typing("r1", "u1", Role::Engineer, true, 0);
        tracker.set_typing("r1", "u2", Role::Client, true, 0);
        assert_eq!(tracker.label("r1"), "Engineer and 1 other are typing…");
        tracker.set_typing("r1", "u3", Role::Admin, true, 0);
        assert_eq!(tracker.label("r1"), "Engineer and 2 others are typing…");

        assert!(tracker.set_typing("r1", "u1", Role::Engineer, false, 10));
        assert!(!tracker.set_typing("r1", "u1", Role::Engineer, false, 10));
        assert_eq!(tracker.entries("r1").len(), 2);
        assert!(tracker.entries("r2").is_empty());
    }

    #[test]
    fn test_debouncer_emits_one_start_and_one_stop() {
        let mut debouncer = TypingDebouncer::new(1000);
        assert_eq!(debouncer.keystroke(0), Some(TypingSignal::Started));
        assert_eq!(debouncer.keystroke(200), None);
        assert_eq!(debouncer.keystroke(400), None);
        assert_eq!(debouncer.tick(900), None);
        assert_eq!(debouncer.tick(1400), Some(TypingSignal::Stopped));
        assert_eq!(debouncer.tick(5000), None);

        assert_eq!(debouncer.keystroke(6000), Some(TypingSignal::Started));
        assert_eq!(debouncer.stop(), Some(TypingSignal::Stopped));
        assert_eq!(debouncer.stop(), None);
    }
}
