// Модели данных чата (каноническая форма)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Роль отправителя. Закрытое множество: сырые строки ролей превращаются
/// в него один раз, в нормализаторе
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    System,
    SuperAdmin,
    Admin,
    Pm,
    Engineer,
    Client,
    Unknown,
}

impl Role {
    /// Подпись роли для UI
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::SuperAdmin => "Super Admin",
            Role::Admin => "Admin",
            Role::Pm => "PM",
            Role::Engineer => "Engineer",
            Role::Client => "Client",
            Role::Unknown => "User",
        }
    }

    /// Ключ роли для fallback-подписи
    pub fn key(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::SuperAdmin => "superadmin",
            Role::Admin => "admin",
            Role::Pm => "pm",
            Role::Engineer => "engineer",
            Role::Client => "client",
            Role::Unknown => "unknown",
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self, Role::SuperAdmin | Role::Admin | Role::Pm | Role::Engineer)
    }
}

/// Статус доставки сообщения (с точки зрения отправителя)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,   // Создано локально, ответа сервера ещё нет
    Sent,      // HTTP подтвердил отправку, эхо из сокета ещё не пришло
    Delivered, // Сопоставлено с авторитетным эхо/broadcast
    Read,      // Пришла квитанция о прочтении
    Failed,    // Ошибка отправки, доступен повтор
}

impl MessageStatus {
    /// Запись ещё ждёт подтверждения и может быть сопоставлена с эхо
    pub fn is_unconfirmed(&self) -> bool {
        matches!(self, MessageStatus::Pending | MessageStatus::Sent)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Read)
    }
}

/// Вложение: хранятся только идентификатор и метаданные
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_id: String,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub preview_url: Option<String>,
}

/// Кто отправил сообщение
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderIdentity {
    pub sender_id: String,
    pub role: Role,
    pub display_name: String,
}

/// Сообщение в канонической форме
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Серверный id или временный id с префиксом (см. Config::temp_id_prefix)
    pub id: String,
    pub room_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    /// Короткая метка времени для отображения
    pub time_label: String,
    pub sender: SenderIdentity,
    /// Никогда не берётся из payload, всегда вычисляется локально
    pub is_mine: bool,
    pub client_correlation_id: Option<String>,
    pub status: MessageStatus,
    /// Есть только при status == Failed
    pub error_text: Option<String>,
}

impl Message {
    pub fn has_temp_id(&self, prefix: &str) -> bool {
        self.id.starts_with(prefix)
    }

    pub fn trimmed_content(&self) -> &str {
        self.content.trim()
    }

    /// Текст для превью в списке комнат
    pub fn preview(&self, max_chars: usize) -> String {
        let text = self.trimmed_content();
        if text.is_empty() {
            return match self.attachments.len() {
                0 => String::new(),
                1 => format!("📎 {}", self.attachments[0].name),
                n => format!("📎 {} files", n),
            };
        }
        if text.chars().count() <= max_chars {
            return text.to_string();
        }
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push('…');
        cut
    }
}

/// Комната в боковом списке
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub title: String,
    pub last_message_preview: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_closed: bool,
    pub reopen_requested: bool,
    pub unread_count: u32,
}

impl RoomSummary {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            last_message_preview: String::new(),
            updated_at: None,
            is_closed: false,
            reopen_requested: false,
            unread_count: 0,
        }
    }
}

/// Локальный зритель: с ним сравнивается отправитель для is_mine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerIdentity {
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
}

impl ViewerIdentity {
    pub fn new(user_id: impl Into<String>, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            display_name: display_name.into(),
        }
    }

    pub fn as_sender(&self) -> SenderIdentity {
        SenderIdentity {
            sender_id: self.user_id.clone(),
            role: self.role,
            display_name: self.display_name.clone(),
        }
    }
}

/// Запись индикатора "печатает"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEntry {
    pub room_id: String,
    pub actor_key: String,
    pub role: Role,
    pub expires_at_epoch_ms: i64,
}
