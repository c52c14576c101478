// Состояние бесед: движок сверки сообщений и сводки комнат
//
// Список сообщений комнаты меняется только через `ConversationState::apply`.
// Любое входящее сообщение (история или сокет) проходит один и тот же путь:
// тот же id -> сопоставление (correlation, fuzzy, подпись) -> добавление в конец.

use crate::config::Config;
use crate::protocol::signature::{self, MatchKind, SYNTHETIC_ID_PREFIX};
use crate::storage::models::{Message, MessageStatus, RoomSummary};
use std::collections::HashMap;

/// Вид квитанции
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

/// События, которыми управляется список сообщений
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// Оптимистичная запись, созданная при нажатии "отправить"
    LocalSendRequested(Message),
    /// HTTP подтвердил отправку; сервер мог вернуть созданное сообщение
    SendAcked {
        correlation_id: String,
        server: Option<Message>,
    },
    SendFailed {
        correlation_id: String,
        reason: String,
    },
    /// Авторитетное сообщение из сокета
    RemoteMessageReceived(Message),
    RetryRequested {
        correlation_id: String,
    },
    /// Полная замена списка историей с сервера
    HistoryLoaded(Vec<Message>),
    ReceiptReceived {
        message_id: String,
        kind: ReceiptKind,
    },
}

/// Результат применения события
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Новая запись в конце списка
    Appended { index: usize },
    /// Существующая запись обновлена на месте (id, время, вложения, статус)
    Upgraded {
        index: usize,
        matched_by: Option<MatchKind>,
    },
    /// Поменялся только статус
    StatusChanged { index: usize, status: MessageStatus },
    /// Список заменён историей
    Replaced { count: usize },
    /// Повтор уже известного сообщения
    Duplicate,
    /// Событие не относится к списку или переход запрещён
    Ignored,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, ApplyOutcome::Duplicate | ApplyOutcome::Ignored)
    }

    /// Индекс затронутой записи, если она одна
    pub fn index(&self) -> Option<usize> {
        match self {
            ApplyOutcome::Appended { index }
            | ApplyOutcome::Upgraded { index, .. }
            | ApplyOutcome::StatusChanged { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Упорядоченный список сообщений одной комнаты
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub room_id: String,
    messages: Vec<Message>,
    config: Config,
}

impl ConversationState {
    pub fn new(room_id: impl Into<String>, config: Config) -> Self {
        Self {
            room_id: room_id.into(),
            messages: Vec::new(),
            config,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn find_by_correlation(&self, correlation_id: &str) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.client_correlation_id.as_deref() == Some(correlation_id))
    }

    /// Получить последнее сообщение
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Применить событие к списку
    pub fn apply(&mut self, event: ConversationEvent) -> ApplyOutcome {
        let outcome = match event {
            ConversationEvent::LocalSendRequested(message) => self.append_local(message),
            ConversationEvent::SendAcked {
                correlation_id,
                server,
            } => self.acknowledge(&correlation_id, server),
            ConversationEvent::SendFailed {
                correlation_id,
                reason,
            } => self.fail(&correlation_id, reason),
            ConversationEvent::RemoteMessageReceived(message) => self.receive(message),
            ConversationEvent::RetryRequested { correlation_id } => self.retry(&correlation_id),
            ConversationEvent::HistoryLoaded(history) => self.replace_with_history(history),
            ConversationEvent::ReceiptReceived { message_id, kind } => self.receipt(&message_id, kind),
        };
        tracing::trace!(target: "chat::reconcile", room_id = %self.room_id, ?outcome, "event applied");
        outcome
    }

    fn position_by_correlation(&self, correlation_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.client_correlation_id.as_deref() == Some(correlation_id))
    }

    fn append_local(&mut self, message: Message) -> ApplyOutcome {
        if message.room_id != self.room_id {
            tracing::warn!(target: "chat::reconcile", room_id = %self.room_id, other = %message.room_id, "optimistic message for another room");
            return ApplyOutcome::Ignored;
        }
        let known = message
            .client_correlation_id
            .as_deref()
            .and_then(|c| self.position_by_correlation(c))
            .is_some()
            || signature::find_by_id(&self.messages, &message.id).is_some();
        if known {
            return ApplyOutcome::Duplicate;
        }
        self.messages.push(message);
        ApplyOutcome::Appended {
            index: self.messages.len() - 1,
        }
    }

    fn acknowledge(&mut self, correlation_id: &str, server: Option<Message>) -> ApplyOutcome {
        let Some(index) = self.position_by_correlation(correlation_id) else {
            // Подтверждение для записи, которой нет (например, после перезагрузки истории)
            return match server {
                Some(mut message) => {
                    message.client_correlation_id.get_or_insert_with(|| correlation_id.to_string());
                    self.receive(message)
                }
                None => ApplyOutcome::Ignored,
            };
        };

        let current = self.messages[index].status;
        if current.is_final() {
            return ApplyOutcome::Duplicate;
        }
        if current == MessageStatus::Failed {
            tracing::debug!(target: "chat::reconcile", correlation_id, "late ack for a failed send, waiting for retry");
            return ApplyOutcome::Ignored;
        }

        match server {
            Some(server) => {
                let (index, copy_status) = self.drop_separate_copy(index, &server.id);
                let status = copy_status.filter(MessageStatus::is_final).unwrap_or(MessageStatus::Sent);
                upgrade_entry(&mut self.messages[index], server, status);
                tracing::debug!(target: "chat::reconcile", correlation_id, id = %self.messages[index].id, "pending -> sent (server shape)");
                ApplyOutcome::Upgraded {
                    index,
                    matched_by: Some(MatchKind::Correlation),
                }
            }
            None if current == MessageStatus::Pending => {
                self.messages[index].status = MessageStatus::Sent;
                tracing::debug!(target: "chat::reconcile", correlation_id, "pending -> sent");
                ApplyOutcome::StatusChanged {
                    index,
                    status: MessageStatus::Sent,
                }
            }
            None => ApplyOutcome::Duplicate,
        }
    }

    /// Если сервер уже прислал это сообщение отдельной записью, убрать её,
    /// сохранив позицию оптимистичной. Возвращает актуальный индекс записи
    /// и статус удалённой копии
    fn drop_separate_copy(&mut self, index: usize, server_id: &str) -> (usize, Option<MessageStatus>) {
        let copy = self
            .messages
            .iter()
            .enumerate()
            .position(|(i, m)| i != index && m.id == server_id);
        match copy {
            Some(copy) => {
                let removed = self.messages.remove(copy);
                tracing::debug!(target: "chat::reconcile", id = %removed.id, "collapsed duplicate entry");
                let index = if copy < index { index - 1 } else { index };
                (index, Some(removed.status))
            }
            None => (index, None),
        }
    }

    fn fail(&mut self, correlation_id: &str, reason: String) -> ApplyOutcome {
        let Some(index) = self.position_by_correlation(correlation_id) else {
            return ApplyOutcome::Ignored;
        };
        let entry = &mut self.messages[index];
        if !entry.status.is_unconfirmed() {
            return ApplyOutcome::Ignored;
        }
        tracing::warn!(target: "chat::reconcile", correlation_id, %reason, "send failed");
        entry.status = MessageStatus::Failed;
        entry.error_text = Some(reason);
        ApplyOutcome::StatusChanged {
            index,
            status: MessageStatus::Failed,
        }
    }

    fn retry(&mut self, correlation_id: &str) -> ApplyOutcome {
        let Some(index) = self.position_by_correlation(correlation_id) else {
            return ApplyOutcome::Ignored;
        };
        let entry = &mut self.messages[index];
        if entry.status != MessageStatus::Failed {
            return ApplyOutcome::Ignored;
        }
        entry.status = MessageStatus::Pending;
        entry.error_text = None;
        ApplyOutcome::StatusChanged {
            index,
            status: MessageStatus::Pending,
        }
    }

    fn receive(&mut self, incoming: Message) -> ApplyOutcome {
        if incoming.room_id != self.room_id {
            return ApplyOutcome::Ignored;
        }

        if let Some(index) = signature::find_by_id(&self.messages, &incoming.id) {
            let entry = &mut self.messages[index];
            if entry.status.is_unconfirmed() {
                entry.status = MessageStatus::Delivered;
                tracing::debug!(target: "chat::reconcile", id = %entry.id, "echo promoted entry to delivered");
                return ApplyOutcome::StatusChanged {
                    index,
                    status: MessageStatus::Delivered,
                };
            }
            tracing::debug!(target: "chat::reconcile", id = %incoming.id, "duplicate message");
            return ApplyOutcome::Duplicate;
        }

        if let Some((index, kind)) = signature::find_match(&self.messages, &incoming, &self.config) {
            let entry = &mut self.messages[index];
            if entry.status.is_final() {
                if is_synthetic(&entry.id) && !is_synthetic(&incoming.id) {
                    entry.id = incoming.id;
                    return ApplyOutcome::Upgraded {
                        index,
                        matched_by: Some(kind),
                    };
                }
                tracing::debug!(target: "chat::reconcile", id = %incoming.id, ?kind, "duplicate by match");
                return ApplyOutcome::Duplicate;
            }
            tracing::debug!(target: "chat::reconcile", from = %entry.id, to = %incoming.id, ?kind, "reconciled onto local entry");
            upgrade_entry(entry, incoming, MessageStatus::Delivered);
            return ApplyOutcome::Upgraded {
                index,
                matched_by: Some(kind),
            };
        }

        self.messages.push(incoming);
        ApplyOutcome::Appended {
            index: self.messages.len() - 1,
        }
    }

    fn receipt(&mut self, message_id: &str, kind: ReceiptKind) -> ApplyOutcome {
        let Some(index) = signature::find_by_id(&self.messages, message_id) else {
            return ApplyOutcome::Ignored;
        };
        let entry = &mut self.messages[index];
        let next = match (kind, entry.status) {
            (ReceiptKind::Delivered, MessageStatus::Pending | MessageStatus::Sent) => MessageStatus::Delivered,
            (ReceiptKind::Read, MessageStatus::Sent | MessageStatus::Delivered) => MessageStatus::Read,
            _ => return ApplyOutcome::Duplicate,
        };
        entry.status = next;
        ApplyOutcome::StatusChanged { index, status: next }
    }

    /// Заменить список историей: дубликаты внутри истории схлопываются,
    /// список сортируется по времени, неподтверждённые локальные записи
    /// сопоставляются с историей или остаются в конце
    fn replace_with_history(&mut self, history: Vec<Message>) -> ApplyOutcome {
        let previous = std::mem::take(&mut self.messages);
        let read_ids: Vec<&str> = previous
            .iter()
            .filter(|m| m.status == MessageStatus::Read)
            .map(|m| m.id.as_str())
            .collect();

        let mut fresh: Vec<Message> = Vec::with_capacity(history.len());
        for mut message in history.into_iter().filter(|m| m.room_id == self.room_id) {
            if signature::find_by_id(&fresh, &message.id).is_some()
                || signature::find_by_signature(&fresh, &message, &self.config).is_some()
            {
                continue;
            }
            if read_ids.contains(&message.id.as_str()) {
                message.status = MessageStatus::Read;
            }
            fresh.push(message);
        }
        fresh.sort_by_key(|m| m.created_at);

        let mut locals: Vec<Message> = previous
            .into_iter()
            .filter(|m| m.has_temp_id(&self.config.temp_id_prefix) && !m.status.is_final())
            .collect();
        for message in fresh.iter_mut() {
            if locals.is_empty() {
                break;
            }
            if let Some((index, _)) = signature::find_match(&locals, message, &self.config) {
                let local = locals.remove(index);
                let server = std::mem::replace(message, local);
                upgrade_entry(message, server, MessageStatus::Delivered);
            }
        }
        fresh.extend(locals);

        self.messages = fresh;
        tracing::debug!(target: "chat::reconcile", room_id = %self.room_id, count = self.messages.len(), "history replaced");
        ApplyOutcome::Replaced {
            count: self.messages.len(),
        }
    }
}

fn is_synthetic(id: &str) -> bool {
    id.starts_with(SYNTHETIC_ID_PREFIX)
}

/// Перенести авторитетные поля на существующую запись, не меняя её позиции.
/// Локальное превью вложения сохраняется, если у сервера его нет
fn upgrade_entry(entry: &mut Message, server: Message, status: MessageStatus) {
    let mut attachments = server.attachments;
    if attachments.is_empty() {
        attachments = std::mem::take(&mut entry.attachments);
    } else {
        for (incoming, local) in attachments.iter_mut().zip(entry.attachments.iter()) {
            if incoming.preview_url.is_none() {
                incoming.preview_url = local.preview_url.clone();
            }
        }
    }

    entry.id = server.id;
    entry.created_at = server.created_at;
    entry.time_label = server.time_label;
    entry.attachments = attachments;
    if !server.content.trim().is_empty() {
        entry.content = server.content;
    }
    entry.sender = server.sender;
    entry.is_mine = entry.is_mine || server.is_mine;
    if server.client_correlation_id.is_some() {
        entry.client_correlation_id = server.client_correlation_id;
    }
    entry.status = status;
    entry.error_text = None;
}

/// Менеджер сводок комнат для бокового списка
#[derive(Debug, Default)]
pub struct ConversationsManager {
    rooms: HashMap<String, RoomSummary>,
}

impl ConversationsManager {
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
        }
    }

    /// Добавить или заменить сводку; счётчик непрочитанных сохраняется
    pub fn upsert(&mut self, mut summary: RoomSummary) {
        if let Some(existing) = self.rooms.get(&summary.id) {
            summary.unread_count = summary.unread_count.max(existing.unread_count);
            summary.reopen_requested |= existing.reopen_requested;
        }
        self.rooms.insert(summary.id.clone(), summary);
    }

    /// Получить или создать сводку
    pub fn get_or_create(&mut self, room_id: &str) -> &mut RoomSummary {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RoomSummary::new(room_id, room_id))
    }

    pub fn get(&self, room_id: &str) -> Option<&RoomSummary> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut RoomSummary> {
        self.rooms.get_mut(room_id)
    }

    /// Обновить превью и время по сообщению. Более старое сообщение
    /// (например, из истории) не перетирает более свежее превью
    pub fn touch(&mut self, message: &Message, preview_chars: usize) -> bool {
        let summary = self.get_or_create(&message.room_id);
        if summary.updated_at.map_or(false, |at| at > message.created_at) {
            return false;
        }
        summary.last_message_preview = message.preview(preview_chars);
        summary.updated_at = Some(message.created_at);
        true
    }

    pub fn set_unread(&mut self, room_id: &str, count: u32) -> bool {
        let summary = self.get_or_create(room_id);
        let changed = summary.unread_count != count;
        summary.unread_count = count;
        changed
    }

    pub fn set_closed(&mut self, room_id: &str, closed: bool) {
        let summary = self.get_or_create(room_id);
        summary.is_closed = closed;
        if !closed {
            summary.reopen_requested = false;
        }
    }

    pub fn mark_reopen_requested(&mut self, room_id: &str) {
        self.get_or_create(room_id).reopen_requested = true;
    }

    /// Сводки: сначала самые свежие, комнаты без активности в конце по названию
    pub fn sorted(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.title.cmp(&b.title))
        });
        rooms
    }

    /// Получить общее количество непрочитанных сообщений
    pub fn total_unread_count(&self) -> u32 {
        self.rooms.values().map(|r| r.unread_count).sum()
    }
}
