// Outbox: исходные payload'ы неподтверждённых отправок
// Ключ: correlation id; запись живёт до доставки и переживает ошибку,
// чтобы повтор ушёл с тем же текстом, вложениями и correlation id

use crate::config::Config;
use crate::protocol::messages::{OutgoingAttachment, SendRequest};
use crate::storage::models::{Attachment, Message, MessageStatus, ViewerIdentity};
use crate::utils::b64::data_url;
use crate::utils::time::time_label;
use crate::utils::uuid::{correlation_id, temp_message_id};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Схема локальных превью для вложений без байтов
pub const LOCAL_PREVIEW_SCHEME: &str = "local-preview://";

/// Исходный payload одной отправки
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub correlation_id: String,
    pub room_id: String,
    pub temp_id: String,
    pub text: String,
    pub attachments: Vec<OutgoingAttachment>,
    /// Сколько раз запрос уходил на сервер
    pub attempts: u32,
}

impl OutboxEntry {
    pub fn to_request(&self) -> SendRequest {
        SendRequest {
            room_id: self.room_id.clone(),
            content: self.text.clone(),
            attachments: self.attachments.clone(),
            client_correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Превью, которое отправитель видит до загрузки файла
pub fn local_preview_url(correlation_id: &str, index: usize, attachment: &OutgoingAttachment) -> String {
    match &attachment.bytes {
        Some(bytes) => data_url(&attachment.content_type, bytes),
        None => format!("{}{}/{}", LOCAL_PREVIEW_SCHEME, correlation_id, index),
    }
}

/// Оптимистичная запись со статусом `pending`
pub fn optimistic_message(entry: &OutboxEntry, viewer: &ViewerIdentity, now: DateTime<Utc>) -> Message {
    let attachments = entry
        .attachments
        .iter()
        .enumerate()
        .map(|(index, a)| Attachment {
            file_id: a.file_id.clone().unwrap_or_default(),
            name: a.name.clone(),
            content_type: a.content_type.clone(),
            size: a.size,
            preview_url: Some(local_preview_url(&entry.correlation_id, index, a)),
        })
        .collect();

    Message {
        id: entry.temp_id.clone(),
        room_id: entry.room_id.clone(),
        content: entry.text.clone(),
        attachments,
        created_at: now,
        time_label: time_label(&now),
        sender: viewer.as_sender(),
        is_mine: true,
        client_correlation_id: Some(entry.correlation_id.clone()),
        status: MessageStatus::Pending,
        error_text: None,
    }
}

/// Неподтверждённые отправки
#[derive(Debug, Default)]
pub struct Outbox {
    entries: HashMap<String, OutboxEntry>,
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Зарегистрировать новую отправку со свежим correlation id
    pub fn stage(
        &mut self,
        room_id: &str,
        text: &str,
        attachments: Vec<OutgoingAttachment>,
        cfg: &Config,
    ) -> OutboxEntry {
        let entry = OutboxEntry {
            correlation_id: correlation_id(),
            room_id: room_id.to_string(),
            temp_id: temp_message_id(&cfg.temp_id_prefix),
            text: text.to_string(),
            attachments,
            attempts: 0,
        };
        tracing::debug!(target: "chat::outbox", correlation_id = %entry.correlation_id, room_id, "staged send");
        self.entries.insert(entry.correlation_id.clone(), entry.clone());
        entry
    }

    /// Запрос для очередной попытки; увеличивает счётчик попыток
    pub fn begin_attempt(&mut self, correlation_id: &str) -> Option<SendRequest> {
        let entry = self.entries.get_mut(correlation_id)?;
        entry.attempts += 1;
        Some(entry.to_request())
    }

    pub fn get(&self, correlation_id: &str) -> Option<&OutboxEntry> {
        self.entries.get(correlation_id)
    }

    /// Отправка доставлена: запись больше не нужна
    pub fn complete(&mut self, correlation_id: &str) -> Option<OutboxEntry> {
        let removed = self.entries.remove(correlation_id);
        if removed.is_some() {
            tracing::trace!(target: "chat::outbox", correlation_id, "outbox entry completed");
        }
        removed
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    /// Выбросить записи, которые уже нельзя повторить; возвращает их число
    pub fn evict<F>(&mut self, mut evict: F) -> usize
    where
        F: FnMut(&OutboxEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !evict(entry));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::Role;

    fn viewer() -> ViewerIdentity {
        ViewerIdentity::new("me", Role::Pm, "Pat")
    }

    #[test]
    fn test_stage_builds_pending_message() {
        let cfg = Config::default();
        let mut outbox = Outbox::new();
        let files = vec![
            OutgoingAttachment {
                name: "a.png".into(),
                content_type: "image/png".into(),
                size: 3,
                file_id: None,
                bytes: Some(vec![1, 2, 3]),
            },
            OutgoingAttachment {
                name: "b.pdf".into(),
                content_type: "application/pdf".into(),
                size: 9,
                file_id: None,
                bytes: None,
            },
        ];
        let entry = outbox.stage("r1", "hello", files, &cfg);
        let msg = optimistic_message(&entry, &viewer(), Utc::now());

        assert!(msg.has_temp_id(&cfg.temp_id_prefix));
        assert!(msg.is_mine);
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.client_correlation_id.as_deref(), Some(entry.correlation_id.as_str()));
        assert_eq!(msg.attachments[0].preview_url.as_deref(), Some("data:image/png;base64,AQID"));
        assert_eq!(
            msg.attachments[1].preview_url,
            Some(format!("local-preview://{}/1", entry.correlation_id))
        );
    }

    #[test]
    fn test_attempts_reuse_original_payload() {
        let cfg = Config::default();
        let mut outbox = Outbox::new();
        let entry = outbox.stage("r1", "hello", vec![], &cfg);

        let first = outbox.begin_attempt(&entry.correlation_id).unwrap();
        let second = outbox.begin_attempt(&entry.correlation_id).unwrap();
        assert_eq!(first, second);
        assert_eq!(outbox.get(&entry.correlation_id).unwrap().attempts, 2);

        assert!(outbox.complete(&entry.correlation_id).is_some());
        assert!(outbox.begin_attempt(&entry.correlation_id).is_none());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_fresh_correlation_per_send() {
        let cfg = Config::default();
        let mut outbox = Outbox::new();
        let a = outbox.stage("r1", "same", vec![], &cfg);
        let b = outbox.stage("r1", "same", vec![], &cfg);
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_evict_by_room() {
        let cfg = Config::default();
        let mut outbox = Outbox::new();
        let kept = outbox.stage("r1", "stay", vec![], &cfg);
        outbox.stage("r2", "gone", vec![], &cfg);
        outbox.stage("r2", "gone too", vec![], &cfg);

        assert_eq!(outbox.evict(|e| e.room_id == "r2"), 2);
        assert_eq!(outbox.len(), 1);
        assert!(outbox.contains(&kept.correlation_id));
    }
}
