// Нормализатор: сырой payload -> каноническое Message
// Чистая функция от (payload, зритель, справочник); вход не мутируется

use crate::api::contacts::Directory;
use crate::config::Config;
use crate::protocol::messages::{RawAttachment, RawId, RawMessage, RawSenderProfile, RawTimestamp};
use crate::protocol::signature::{fallback_signature, untimed_signature, SYNTHETIC_ID_PREFIX};
use crate::protocol::transport::FileResolver;
use crate::protocol::validation::{is_system_payload, validate_raw_message};
use crate::storage::models::{Attachment, Message, MessageStatus, Role, SenderIdentity, ViewerIdentity};
use crate::utils::digest::short_digest;
use crate::utils::error::Result;
use crate::utils::time::{from_epoch_number, parse_timestamp, time_label};
use chrono::{DateTime, Utc};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Всё, что нормализатору нужно кроме самого payload
#[derive(Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub viewer: &'a ViewerIdentity,
    pub directory: Option<&'a Directory>,
    pub files: Option<&'a dyn FileResolver>,
    /// Комната по умолчанию (история часто не повторяет room id)
    pub fallback_room_id: Option<&'a str>,
    /// Роль для нераспознанных строк: зависит от того, какой чат открыт
    pub fallback_role: Role,
    pub now: DateTime<Utc>,
    pub signature_prefix_chars: usize,
}

impl<'a> NormalizeContext<'a> {
    pub fn new(viewer: &'a ViewerIdentity, now: DateTime<Utc>) -> Self {
        Self {
            viewer,
            directory: None,
            files: None,
            fallback_room_id: None,
            fallback_role: Role::Unknown,
            now,
            signature_prefix_chars: Config::default().signature_prefix_chars,
        }
    }

    pub fn with_directory(mut self, directory: &'a Directory) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_files(mut self, files: &'a dyn FileResolver) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_room(mut self, room_id: &'a str) -> Self {
        self.fallback_room_id = Some(room_id);
        self
    }

    pub fn with_fallback_role(mut self, role: Role) -> Self {
        self.fallback_role = role;
        self
    }

    pub fn with_signature_prefix(mut self, chars: usize) -> Self {
        self.signature_prefix_chars = chars;
        self
    }
}

/// Свободная строка роли -> закрытое множество. `None` для нераспознанных.
///
/// Единственное место в крейте, где ветвятся по сырой строке роли.
pub fn normalize_role(raw: &str) -> Option<Role> {
    let lower = raw.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let has_token = |needle: &str| tokens.iter().any(|t| *t == needle);

    if lower.contains("system") || has_token("bot") {
        return Some(Role::System);
    }
    if lower.contains("admin") {
        return Some(if lower.contains("super") {
            Role::SuperAdmin
        } else {
            Role::Admin
        });
    }
    // "pm" ищется как отдельное слово: подстрока встречается в "development"
    if has_token("pm")
        || has_token("manager")
        || lower.contains("projectmanager")
        || lower.contains("project manager")
    {
        return Some(Role::Pm);
    }
    if lower.contains("engineer") || lower.contains("developer") || has_token("dev") {
        return Some(Role::Engineer);
    }
    if lower.contains("client") || lower.contains("customer") {
        return Some(Role::Client);
    }
    None
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn sender_id(raw: &RawMessage) -> Option<String> {
    raw.sender_id
        .as_ref()
        .and_then(RawId::to_id_string)
        .or_else(|| raw.sender.as_ref().and_then(|s| s.id()))
}

fn sender_profile(raw: &RawMessage) -> Option<&RawSenderProfile> {
    raw.sender.as_ref().and_then(|s| s.profile())
}

/// Роль отправителя: явные поля payload, затем справочник, затем контекст
pub fn resolve_role(raw: &RawMessage, sender_id: Option<&str>, ctx: &NormalizeContext<'_>) -> Role {
    if is_system_payload(raw) {
        return Role::System;
    }

    let from_payload = [
        raw.role.as_deref(),
        raw.sender_role.as_deref(),
        sender_profile(raw).and_then(|p| p.role.as_deref()),
        raw.sender_type.as_deref(),
    ]
    .into_iter()
    .flatten()
    .find_map(normalize_role);
    if let Some(role) = from_payload {
        return role;
    }

    if let Some(id) = sender_id {
        if let Some(role) = ctx.directory.and_then(|d| d.role(id)) {
            return role;
        }
        if id == ctx.viewer.user_id {
            return ctx.viewer.role;
        }
    }
    ctx.fallback_role
}

/// Имя для отображения; никогда не бывает пустым
pub fn resolve_display_name(
    raw: &RawMessage,
    sender_id: Option<&str>,
    role: Role,
    is_mine: bool,
    ctx: &NormalizeContext<'_>,
) -> String {
    if role == Role::System {
        return non_empty(raw.sender_name.as_deref())
            .unwrap_or(Role::System.label())
            .to_string();
    }

    let profile = sender_profile(raw);
    if let Some(name) = non_empty(raw.sender_name.as_deref()).or_else(|| non_empty(profile.and_then(|p| p.name.as_deref()))) {
        return name.to_string();
    }

    if let Some(profile) = profile {
        let full = [profile.first_name.as_deref(), profile.last_name.as_deref()]
            .into_iter()
            .filter_map(non_empty)
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            return full;
        }
        if let Some(local) = non_empty(profile.email.as_deref())
            .and_then(|email| email.split('@').next())
            .and_then(|local| non_empty(Some(local)))
        {
            return local.to_string();
        }
    }

    if let Some(name) = sender_id.and_then(|id| ctx.directory.and_then(|d| d.display_name(id))) {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }

    if is_mine && !ctx.viewer.display_name.trim().is_empty() {
        return ctx.viewer.display_name.trim().to_string();
    }

    role.label().to_string()
}

/// Метка времени из строки или числа epoch
pub fn parse_raw_timestamp(ts: &RawTimestamp) -> Option<DateTime<Utc>> {
    match ts {
        RawTimestamp::Text(text) => parse_timestamp(text),
        RawTimestamp::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64))
            .and_then(from_epoch_number),
    }
}

/// Первая разбираемая метка из известных полей
pub fn payload_timestamp(raw: &RawMessage) -> Option<DateTime<Utc>> {
    [&raw.created_at, &raw.timestamp, &raw.sent_at]
        .into_iter()
        .flatten()
        .find_map(parse_raw_timestamp)
}

/// Метка payload'а или "сейчас", если нет ни одной
pub fn resolve_timestamp(raw: &RawMessage, now: DateTime<Utc>) -> DateTime<Utc> {
    payload_timestamp(raw).unwrap_or(now)
}

fn normalize_attachment(raw: &RawAttachment, files: Option<&dyn FileResolver>) -> Option<Attachment> {
    let file_id = raw.file_id.as_ref().and_then(RawId::to_id_string);
    let name = non_empty(raw.name.as_deref()).map(str::to_string);
    if file_id.is_none() && name.is_none() {
        return None;
    }
    let file_id = file_id.unwrap_or_default();
    let preview_url = non_empty(raw.preview_url.as_deref())
        .map(str::to_string)
        .or_else(|| {
            if file_id.is_empty() {
                None
            } else {
                files.and_then(|f| f.preview_url(&file_id))
            }
        });

    Some(Attachment {
        name: name.unwrap_or_else(|| file_id.clone()),
        content_type: non_empty(raw.content_type.as_deref())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string(),
        size: raw.size.unwrap_or(0),
        preview_url,
        file_id,
    })
}

/// Авторитетный payload -> Message со статусом `delivered`.
///
/// Ошибка `MalformedPayload`, если нет комнаты, отправителя (кроме системных)
/// или содержимого. Payload без id получает синтетический `sig-<hex>`.
pub fn normalize_message(raw: &RawMessage, ctx: &NormalizeContext<'_>) -> Result<Message> {
    validate_raw_message(raw, ctx.fallback_room_id)?;

    let room_id = raw
        .room_id
        .as_ref()
        .and_then(RawId::to_id_string)
        .or_else(|| non_empty(ctx.fallback_room_id).map(str::to_string))
        .unwrap_or_default();
    let sender_id = sender_id(raw);
    let role = resolve_role(raw, sender_id.as_deref(), ctx);
    let is_mine = role != Role::System && sender_id.as_deref() == Some(ctx.viewer.user_id.as_str());
    let display_name = resolve_display_name(raw, sender_id.as_deref(), role, is_mine, ctx);
    let sent_time = payload_timestamp(raw);
    let created_at = sent_time.unwrap_or(ctx.now);

    let mut message = Message {
        id: raw.id.as_ref().and_then(RawId::to_id_string).unwrap_or_default(),
        room_id,
        content: raw.content.clone().unwrap_or_default(),
        attachments: raw
            .attachments
            .iter()
            .filter_map(|a| normalize_attachment(a, ctx.files))
            .collect(),
        created_at,
        time_label: time_label(&created_at),
        sender: SenderIdentity {
            sender_id: sender_id.unwrap_or_else(|| Role::System.key().to_string()),
            role,
            display_name,
        },
        is_mine,
        client_correlation_id: non_empty(raw.client_correlation_id.as_deref()).map(str::to_string),
        status: MessageStatus::Delivered,
        error_text: None,
    };

    if message.id.is_empty() {
        // Время прихода не входит в id: повтор в другую секунду должен совпасть
        let signature = match sent_time {
            Some(_) => fallback_signature(&message, ctx.signature_prefix_chars),
            None => untimed_signature(&message, ctx.signature_prefix_chars),
        };
        message.id = format!("{}{}", SYNTHETIC_ID_PREFIX, short_digest(&signature));
        tracing::debug!(target: "chat::normalize", id = %message.id, "synthesised id for id-less payload");
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::contacts::KnownUser;
    use crate::protocol::transport::UrlFileResolver;
    use crate::utils::error::ChatError;
    use serde_json::json;

    fn viewer() -> ViewerIdentity {
        ViewerIdentity::new("me", Role::Client, "Me Myself")
    }

    fn now() -> DateTime<Utc> {
        parse_timestamp("2024-03-01T12:00:00Z").unwrap()
    }

    fn raw(value: serde_json::Value) -> RawMessage {
        RawMessage::from_value(value).unwrap()
    }

    #[test]
    fn test_role_normalization() {
        assert_eq!(normalize_role("SUPER_ADMIN"), Some(Role::SuperAdmin));
        assert_eq!(normalize_role("Super Admin"), Some(Role::SuperAdmin));
        assert_eq!(normalize_role("admin"), Some(Role::Admin));
        assert_eq!(normalize_role("PM"), Some(Role::Pm));
        assert_eq!(normalize_role("Project Manager"), Some(Role::Pm));
        assert_eq!(normalize_role("project_manager"), Some(Role::Pm));
        assert_eq!(normalize_role("Software Engineer"), Some(Role::Engineer));
        assert_eq!(normalize_role("customer"), Some(Role::Client));
        assert_eq!(normalize_role("system"), Some(Role::System));
        assert_eq!(normalize_role("development lead"), None);
        assert_eq!(normalize_role(""), None);
        assert_eq!(normalize_role("guest"), None);
    }

    #[test]
    fn test_unrecognized_role_uses_context_fallback() {
        let viewer = viewer();
        let ctx = NormalizeContext::new(&viewer, now()).with_fallback_role(Role::Client);
        let msg = normalize_message(
            &raw(json!({ "id": "m1", "roomId": "r1", "senderId": "u2", "role": "guest", "content": "hi" })),
            &ctx,
        )
        .unwrap();
        assert_eq!(msg.sender.role, Role::Client);
        assert_eq!(msg.sender.display_name, "Client");
    }

    #[test]
    fn test_is_mine_is_recomputed() {
        let viewer = viewer();
        let ctx = NormalizeContext::new(&viewer, now());

        let mine = normalize_message(
            &raw(json!({ "id": "m1", "roomId": "r1", "sender": { "_id": "me" }, "content": "hi", "isMine": false })),
            &ctx,
        )
        .unwrap();
        assert!(mine.is_mine);
        assert_eq!(mine.sender.display_name, "Me Myself");

        let numeric = ViewerIdentity::new("42", Role::Pm, "Pat");
        let ctx = NormalizeContext::new(&numeric, now());
        let also_mine = normalize_message(&raw(json!({ "id": "m2", "roomId": "r1", "senderId": 42, "content": "x" })), &ctx).unwrap();
        assert!(also_mine.is_mine);
    }

    #[test]
    fn test_system_message_is_never_mine() {
        let viewer = viewer();
        let ctx = NormalizeContext::new(&viewer, now());
        let msg = normalize_message(
            &raw(json!({ "id": "s1", "roomId": "r1", "senderId": "me", "senderType": "system", "content": "Room closed" })),
            &ctx,
        )
        .unwrap();
        assert_eq!(msg.sender.role, Role::System);
        assert!(!msg.is_mine);
        assert_eq!(msg.sender.display_name, "System");
    }

    #[test]
    fn test_display_name_fallback_chain() {
        let viewer = viewer();
        let ctx = NormalizeContext::new(&viewer, now());

        let named = normalize_message(
            &raw(json!({ "id": "1", "roomId": "r1", "sender": { "_id": "u2", "firstName": "Ana", "lastName": "Ruiz" }, "content": "a" })),
            &ctx,
        )
        .unwrap();
        assert_eq!(named.sender.display_name, "Ana Ruiz");

        let email = normalize_message(
            &raw(json!({ "id": "2", "roomId": "r1", "sender": { "_id": "u2", "email": "kim@example.com", "role": "engineer" }, "content": "a" })),
            &ctx,
        )
        .unwrap();
        assert_eq!(email.sender.display_name, "kim");

        let bare = normalize_message(&raw(json!({ "id": "3", "roomId": "r1", "senderId": "u2", "role": "pm", "content": "a" })), &ctx).unwrap();
        assert_eq!(bare.sender.display_name, "PM");
    }

    #[test]
    fn test_directory_lookup() {
        let viewer = viewer();
        let mut directory = Directory::new();
        directory.upsert(KnownUser {
            id: "u7".to_string(),
            display_name: Some("Lee".to_string()),
            email: None,
            role: Some(Role::Engineer),
        });
        let ctx = NormalizeContext::new(&viewer, now()).with_directory(&directory);
        let msg = normalize_message(&raw(json!({ "id": "1", "roomId": "r1", "senderId": "u7", "content": "a" })), &ctx).unwrap();
        assert_eq!(msg.sender.display_name, "Lee");
        assert_eq!(msg.sender.role, Role::Engineer);
    }

    #[test]
    fn test_timestamp_resolution() {
        let viewer = viewer();
        let ctx = NormalizeContext::new(&viewer, now());

        let iso = normalize_message(
            &raw(json!({ "id": "1", "roomId": "r1", "senderId": "u2", "content": "a", "timestamp": "2024-02-28T09:30:00Z" })),
            &ctx,
        )
        .unwrap();
        assert_eq!(iso.created_at, parse_timestamp("2024-02-28T09:30:00Z").unwrap());
        assert!(!iso.time_label.is_empty());

        let epoch = normalize_message(
            &raw(json!({ "id": "2", "roomId": "r1", "senderId": "u2", "content": "a", "sentAt": 1709287200 })),
            &ctx,
        )
        .unwrap();
        assert_eq!(epoch.created_at.timestamp(), 1_709_287_200);

        let missing = normalize_message(&raw(json!({ "id": "3", "roomId": "r1", "senderId": "u2", "content": "a" })), &ctx).unwrap();
        assert_eq!(missing.created_at, now());
    }

    #[test]
    fn test_attachments_and_resolver() {
        let viewer = viewer();
        let files = UrlFileResolver::new("https://files.test");
        let ctx = NormalizeContext::new(&viewer, now()).with_files(&files);
        let msg = normalize_message(
            &raw(json!({
                "id": "1", "roomId": "r1", "senderId": "u2",
                "files": [{ "_id": "f1", "filename": "a.png", "mimetype": "image/png", "size": 10 }, {}]
            })),
            &ctx,
        )
        .unwrap();
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].name, "a.png");
        assert_eq!(msg.attachments[0].preview_url.as_deref(), Some("https://files.test/files/f1/preview"));
        assert_eq!(msg.status, MessageStatus::Delivered);
    }

    #[test]
    fn test_malformed_payloads() {
        let viewer = viewer();
        let ctx = NormalizeContext::new(&viewer, now());
        let no_room = normalize_message(&raw(json!({ "senderId": "u2", "content": "a" })), &ctx);
        assert!(matches!(no_room, Err(ChatError::MalformedPayload(_))));

        let ctx = ctx.with_room("r9");
        let history = normalize_message(&raw(json!({ "id": "1", "senderId": "u2", "content": "a" })), &ctx).unwrap();
        assert_eq!(history.room_id, "r9");
    }

    #[test]
    fn test_synthetic_id_is_stable() {
        let viewer = viewer();
        let ctx = NormalizeContext::new(&viewer, now());
        let payload = raw(json!({ "roomId": "r1", "senderId": "u2", "content": "no id", "createdAt": "2024-03-01T10:00:00Z" }));
        let a = normalize_message(&payload, &ctx).unwrap();
        let b = normalize_message(&payload, &ctx).unwrap();
        assert!(a.id.starts_with(SYNTHETIC_ID_PREFIX));
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_synthetic_id_ignores_arrival_time() {
        let viewer = viewer();
        let payload = raw(json!({ "roomId": "r1", "senderId": "u2", "content": "no id, no ts" }));
        let early = NormalizeContext::new(&viewer, parse_timestamp("2024-03-01T10:00:00.900Z").unwrap());
        let late = NormalizeContext::new(&viewer, parse_timestamp("2024-03-01T10:00:01.100Z").unwrap());

        let a = normalize_message(&payload, &early).unwrap();
        let b = normalize_message(&payload, &late).unwrap();
        assert_ne!(a.created_at, b.created_at);
        assert_eq!(a.id, b.id);

        // Время из payload по-прежнему различает сообщения
        let timed = raw(json!({ "roomId": "r1", "senderId": "u2", "content": "no id, no ts", "createdAt": "2024-03-01T09:00:00Z" }));
        assert_ne!(normalize_message(&timed, &early).unwrap().id, a.id);
    }
}
