// Валидация входящих и исходящих данных

use crate::config::Config;
use crate::protocol::messages::{OutgoingAttachment, RawId, RawMessage};
use crate::utils::error::{ChatError, Result};

/// Валидация исходящего сообщения до создания оптимистичной записи
pub fn validate_outgoing(text: &str, attachments: &[OutgoingAttachment], cfg: &Config) -> Result<()> {
    if text.chars().count() > cfg.max_message_length {
        return Err(ChatError::ValidationError(format!(
            "Message must be at most {} characters",
            cfg.max_message_length
        )));
    }

    if attachments.len() > cfg.max_attachments {
        return Err(ChatError::ValidationError(format!(
            "At most {} attachments per message",
            cfg.max_attachments
        )));
    }

    if attachments.iter().any(|a| a.name.trim().is_empty()) {
        return Err(ChatError::ValidationError(
            "Attachment name cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Пустое исходящее сообщение: ни текста, ни вложений
pub fn is_empty_outgoing(text: &str, attachments: &[OutgoingAttachment]) -> bool {
    text.trim().is_empty() && attachments.is_empty()
}

/// Сообщение от системы: явный флаг или маркер типа отправителя
pub fn is_system_payload(raw: &RawMessage) -> bool {
    raw.is_system.unwrap_or(false)
        || raw
            .sender_type
            .as_deref()
            .map_or(false, |kind| kind.trim().eq_ignore_ascii_case("system"))
}

/// Проверить обязательные поля сырого сообщения.
/// `fallback_room_id` используется для истории, где room id часто опущен
pub fn validate_raw_message(raw: &RawMessage, fallback_room_id: Option<&str>) -> Result<()> {
    let has_room = raw.room_id.as_ref().and_then(RawId::to_id_string).is_some()
        || fallback_room_id.map_or(false, |room| !room.trim().is_empty());
    if !has_room {
        return Err(ChatError::MalformedPayload("missing room id".to_string()));
    }

    let has_sender = raw.sender_id.as_ref().and_then(RawId::to_id_string).is_some()
        || raw.sender.as_ref().and_then(|s| s.id()).is_some();
    if !has_sender && !is_system_payload(raw) {
        return Err(ChatError::MalformedPayload("missing sender".to_string()));
    }

    let has_text = raw.content.as_deref().map_or(false, |c| !c.trim().is_empty());
    if !has_text && raw.attachments.is_empty() {
        return Err(ChatError::MalformedPayload(
            "message has neither content nor attachments".to_string(),
        ));
    }

    Ok(())
}

/// Оценка проекта: целое от 1 до 5
pub fn validate_rating(rating: i64) -> Result<u8> {
    if (1..=5).contains(&rating) {
        Ok(rating as u8)
    } else {
        Err(ChatError::ValidationError(
            "Rating must be between 1 and 5".to_string(),
        ))
    }
}
