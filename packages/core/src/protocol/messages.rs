// Сырые формы payload'ов
// История (HTTP) и broadcast (сокет) присылают немного разные поля,
// поэтому здесь всё Option, а написания одного поля сводятся к одному ключу;
// каноническую форму строит normalize.rs

use crate::utils::b64;
use crate::utils::error::{ChatError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// (каноническое имя, написания в порядке приоритета)
type FieldSpellings = &'static [(&'static str, &'static [&'static str])];

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

/// Свести написания каждого поля к каноническому ключу.
///
/// Бэкенды с виртуальными полями присылают `_id` и `id` одновременно;
/// выигрывает первое непустое написание, остальные отбрасываются.
pub fn fold_spellings(value: Value, spellings: FieldSpellings) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };
    for (canonical, variants) in spellings {
        let mut chosen: Option<Value> = None;
        let mut fallback: Option<Value> = None;
        for variant in variants.iter() {
            let Some(found) = map.remove(*variant) else {
                continue;
            };
            if chosen.is_none() && !is_blank(&found) {
                chosen = Some(found);
            } else if fallback.is_none() {
                fallback = Some(found);
            }
        }
        if let Some(found) = chosen.or(fallback) {
            map.insert(canonical.to_string(), found);
        }
    }
    Value::Object(map)
}

// Derive с `remote = "Self"` даёт inherent serialize/deserialize;
// трейты реализуются поверх них с предварительной свёрткой написаний
macro_rules! folded_serde {
    ($ty:ident, $spellings:expr) => {
        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let value = fold_spellings(Value::deserialize(deserializer)?, $spellings);
                $ty::deserialize(value).map_err(serde::de::Error::custom)
            }
        }

        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                $ty::serialize(self, serializer)
            }
        }
    };
}

/// Идентификатор, который бэкенд присылает то строкой, то числом
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl RawId {
    /// Строковая форма; пустая строка считается отсутствием id
    pub fn to_id_string(&self) -> Option<String> {
        let text = match self {
            RawId::Text(text) => text.trim().to_string(),
            RawId::Number(number) => number.to_string(),
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

impl From<&str> for RawId {
    fn from(value: &str) -> Self {
        RawId::Text(value.to_string())
    }
}

/// Метка времени: ISO-строка или epoch (секунды или миллисекунды)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Text(String),
    Number(serde_json::Number),
}

/// Отправитель, встроенный в сообщение
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase", default)]
pub struct RawSenderProfile {
    pub id: Option<RawId>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
}

folded_serde!(
    RawSenderProfile,
    &[
        ("id", &["id", "_id"]),
        ("firstName", &["firstName", "first_name"]),
        ("lastName", &["lastName", "last_name"]),
    ]
);

/// `sender` бывает и голым id, и объектом профиля
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawSender {
    Ref(RawId),
    Profile(RawSenderProfile),
}

impl RawSender {
    pub fn id(&self) -> Option<String> {
        match self {
            RawSender::Ref(id) => id.to_id_string(),
            RawSender::Profile(profile) => profile.id.as_ref().and_then(RawId::to_id_string),
        }
    }

    pub fn profile(&self) -> Option<&RawSenderProfile> {
        match self {
            RawSender::Profile(profile) => Some(profile),
            RawSender::Ref(_) => None,
        }
    }
}

/// Вложение в сыром виде
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase", default)]
pub struct RawAttachment {
    pub file_id: Option<RawId>,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub preview_url: Option<String>,
}

folded_serde!(
    RawAttachment,
    &[
        ("fileId", &["fileId", "_id", "id"]),
        ("name", &["name", "filename", "originalName"]),
        ("contentType", &["contentType", "mimeType", "mimetype"]),
        ("previewUrl", &["previewUrl", "url", "thumbnailUrl"]),
    ]
);

/// Сообщение из истории или из сокета
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase", default)]
pub struct RawMessage {
    pub id: Option<RawId>,
    pub room_id: Option<RawId>,
    pub content: Option<String>,
    pub attachments: Vec<RawAttachment>,
    pub created_at: Option<RawTimestamp>,
    pub timestamp: Option<RawTimestamp>,
    pub sent_at: Option<RawTimestamp>,
    pub role: Option<String>,
    pub sender_role: Option<String>,
    pub sender_type: Option<String>,
    pub sender: Option<RawSender>,
    pub sender_id: Option<RawId>,
    pub sender_name: Option<String>,
    pub client_correlation_id: Option<String>,
    pub is_system: Option<bool>,
}

folded_serde!(
    RawMessage,
    &[
        ("id", &["id", "_id", "messageId"]),
        ("roomId", &["roomId", "room", "chatId", "room_id"]),
        ("content", &["content", "text"]),
        ("attachments", &["attachments", "files"]),
        ("createdAt", &["createdAt", "created_at"]),
        ("sentAt", &["sentAt", "sent_at"]),
        ("senderRole", &["senderRole", "sender_role"]),
        ("senderType", &["senderType", "sender_type"]),
        ("senderId", &["senderId", "sender_id", "userId", "user_id"]),
        ("senderName", &["senderName", "sender_name"]),
        (
            "clientCorrelationId",
            &[
                "clientCorrelationId",
                "client_correlation_id",
                "clientMessageId",
                "clientId",
                "tempId",
            ],
        ),
        ("isSystem", &["isSystem", "system"]),
    ]
);

impl RawMessage {
    pub fn from_value(value: Value) -> Result<Self> {
        // Некоторые события оборачивают сообщение в { "message": {...} }
        let value = match value {
            Value::Object(mut map) if map.get("message").map_or(false, Value::is_object) => {
                map.remove("message").unwrap_or(Value::Null)
            }
            other => other,
        };
        serde_json::from_value(value).map_err(|e| ChatError::MalformedPayload(e.to_string()))
    }
}

/// Событие "печатает"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase", default)]
pub struct TypingPayload {
    pub room_id: Option<RawId>,
    pub actor_key: Option<RawId>,
    pub role: Option<String>,
    pub is_typing: Option<bool>,
}

folded_serde!(
    TypingPayload,
    &[
        ("roomId", &["roomId", "room", "room_id"]),
        ("actorKey", &["actorKey", "userId", "senderId", "user_id"]),
        ("isTyping", &["isTyping", "typing", "is_typing"]),
    ]
);

/// События жизненного цикла комнаты
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase", default)]
pub struct RoomEventPayload {
    pub room_id: Option<RawId>,
    pub requested_by: Option<RawId>,
}

folded_serde!(
    RoomEventPayload,
    &[
        ("roomId", &["roomId", "room", "room_id", "_id", "id"]),
        ("requestedBy", &["requestedBy", "requested_by", "by"]),
    ]
);

/// Квитанция о доставке/прочтении
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase", default)]
pub struct ReceiptPayload {
    pub message_id: Option<RawId>,
    pub room_id: Option<RawId>,
}

folded_serde!(
    ReceiptPayload,
    &[
        ("messageId", &["messageId", "_id", "id", "message_id"]),
        ("roomId", &["roomId", "room", "room_id"]),
    ]
);

/// Именованные события сокета, которые слушает движок
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Message(RawMessage),
    Typing(TypingPayload),
    RoomClosed(RoomEventPayload),
    RoomReopened(RoomEventPayload),
    ReopenRequested(RoomEventPayload),
    Delivered(ReceiptPayload),
    Read(ReceiptPayload),
}

impl SocketEvent {
    pub const MESSAGE: &'static str = "message";
    pub const TYPING: &'static str = "typing";
    pub const ROOM_CLOSED: &'static str = "room:closed";
    pub const ROOM_REOPENED: &'static str = "room:reopened";
    pub const REOPEN_REQUESTED: &'static str = "reopen:requested";
    pub const DELIVERED: &'static str = "delivered";
    pub const READ: &'static str = "read";

    /// Разобрать событие по имени. Неизвестные имена дают Ok(None)
    pub fn parse(name: &str, payload: Value) -> Result<Option<Self>> {
        fn decode<T: for<'de> Deserialize<'de>>(payload: Value) -> Result<T> {
            serde_json::from_value(payload).map_err(|e| ChatError::MalformedPayload(e.to_string()))
        }

        let event = match name {
            Self::MESSAGE => SocketEvent::Message(RawMessage::from_value(payload)?),
            Self::TYPING => SocketEvent::Typing(decode(payload)?),
            Self::ROOM_CLOSED => SocketEvent::RoomClosed(decode(payload)?),
            Self::ROOM_REOPENED => SocketEvent::RoomReopened(decode(payload)?),
            Self::REOPEN_REQUESTED => SocketEvent::ReopenRequested(decode(payload)?),
            Self::DELIVERED => SocketEvent::Delivered(decode(payload)?),
            Self::READ => SocketEvent::Read(decode(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SocketEvent::Message(_) => Self::MESSAGE,
            SocketEvent::Typing(_) => Self::TYPING,
            SocketEvent::RoomClosed(_) => Self::ROOM_CLOSED,
            SocketEvent::RoomReopened(_) => Self::ROOM_REOPENED,
            SocketEvent::ReopenRequested(_) => Self::REOPEN_REQUESTED,
            SocketEvent::Delivered(_) => Self::DELIVERED,
            SocketEvent::Read(_) => Self::READ,
        }
    }
}

// ============================================================================
// HTTP Data Structures
// ============================================================================

/// Исходящее вложение (ещё не загружено)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingAttachment {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    /// Уже загруженный файл, если есть
    #[serde(default)]
    pub file_id: Option<String>,
    /// Содержимое файла для локального превью. Принимается base64-строкой
    /// в поле `base64`, наружу не сериализуется
    #[serde(
        default,
        rename = "base64",
        skip_serializing,
        deserialize_with = "b64::deserialize_optional"
    )]
    pub bytes: Option<Vec<u8>>,
}

/// Запрос на отправку сообщения
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub room_id: String,
    pub content: String,
    pub attachments: Vec<OutgoingAttachment>,
    pub client_correlation_id: String,
}

/// Участник комнаты
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase", default)]
pub struct Participant {
    pub id: Option<RawId>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
}

folded_serde!(
    Participant,
    &[
        ("id", &["id", "_id", "userId"]),
        ("firstName", &["firstName", "first_name"]),
        ("lastName", &["lastName", "last_name"]),
    ]
);

/// Метаданные комнаты
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase", default)]
pub struct RoomMeta {
    pub id: Option<RawId>,
    pub title: Option<String>,
    pub is_closed: bool,
    pub project_id: Option<RawId>,
    pub project_status: Option<String>,
    pub participants: Vec<Participant>,
}

folded_serde!(
    RoomMeta,
    &[
        ("id", &["id", "_id"]),
        ("title", &["title", "name"]),
        ("isClosed", &["isClosed", "closed"]),
        ("projectId", &["projectId", "project"]),
    ]
);

/// Комната из списка
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase", default)]
pub struct RawRoom {
    pub id: Option<RawId>,
    pub title: Option<String>,
    pub last_message: Option<String>,
    pub updated_at: Option<RawTimestamp>,
    pub is_closed: bool,
}

folded_serde!(
    RawRoom,
    &[
        ("id", &["id", "_id"]),
        ("title", &["title", "name"]),
        ("lastMessage", &["lastMessage", "lastMessagePreview"]),
        ("updatedAt", &["updatedAt", "updated_at", "lastMessageAt"]),
        ("isClosed", &["isClosed", "closed"]),
    ]
);

/// Действия жизненного цикла комнаты
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomAction {
    Close,
    Reopen,
    RequestReopen,
}

/// Оценка проекта
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingRequest {
    pub room_id: String,
    pub project_id: Option<String>,
    pub rating: u8,
}
