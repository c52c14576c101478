// Контракты внешних сервисов: сокет, HTTP, ссылки на файлы, таймер
// Реализации живут у хоста (браузер, десктоп, тестовые фейки)

#![allow(async_fn_in_trait)]

use crate::protocol::messages::{RatingRequest, RawMessage, RawRoom, RoomAction, RoomMeta, SendRequest};
use crate::storage::models::ViewerIdentity;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Состояние соединения с сокетом
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Идентификатор подписки на события комнаты
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(pub u64);

/// Подписка, привязанная к конкретной комнате. Создаётся при каждом входе
/// в комнату и освобождается до создания следующей
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSubscription {
    pub room_id: String,
    pub id: SubscriptionId,
}

/// Откуда пришло событие
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Слушатель уровня соединения; комната берётся из payload
    Connection,
    /// Слушатель конкретной подписки на комнату
    Room(SubscriptionId),
}

/// Двунаправленный канал событий.
///
/// Вызовы могут пересекаться с незавершённым connect/join, поэтому всё
/// через `&self`; изменяемое состояние реализация держит сама
pub trait SocketService {
    fn is_connected(&self) -> bool;

    async fn connect(&self, viewer: &ViewerIdentity) -> anyhow::Result<()>;

    async fn join(&self, room_id: &str) -> anyhow::Result<()>;

    fn emit(&self, event: &str, payload: Value) -> anyhow::Result<()>;

    fn subscribe(&self, room_id: &str) -> RoomSubscription;

    fn unsubscribe(&self, subscription: &RoomSubscription);
}

/// Запрос/ответ к бэкенду
pub trait HttpService {
    async fn fetch_rooms(&self) -> anyhow::Result<Vec<RawRoom>>;

    async fn fetch_history(&self, room_id: &str, limit: usize) -> anyhow::Result<Vec<RawMessage>>;

    async fn fetch_room_meta(&self, room_id: &str) -> anyhow::Result<RoomMeta>;

    /// Созданное сообщение, если бэкенд его вернул
    async fn send_message(&self, request: &SendRequest) -> anyhow::Result<Option<RawMessage>>;

    async fn room_action(&self, room_id: &str, action: RoomAction) -> anyhow::Result<()>;

    async fn submit_rating(&self, request: &RatingRequest) -> anyhow::Result<()>;
}

/// Превращает идентификатор вложения в URL
pub trait FileResolver {
    fn preview_url(&self, file_id: &str) -> Option<String>;

    fn download_url(&self, file_id: &str) -> String;
}

/// Резолвер по базовому URL файлового API
#[derive(Debug, Clone)]
pub struct UrlFileResolver {
    base_url: String,
}

impl UrlFileResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl FileResolver for UrlFileResolver {
    fn preview_url(&self, file_id: &str) -> Option<String> {
        Some(format!("{}/files/{}/preview", self.base_url, file_id))
    }

    fn download_url(&self, file_id: &str) -> String {
        format!("{}/files/{}/download", self.base_url, file_id)
    }
}

/// Асинхронный сон; нужен для таймаута подключения
pub trait Timer {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()>;
}

#[cfg(feature = "desktop")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[cfg(feature = "desktop")]
impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> {
        tokio::time::sleep(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_file_resolver() {
        let files = UrlFileResolver::new("https://api.example.com/");
        assert_eq!(
            files.preview_url("f1").as_deref(),
            Some("https://api.example.com/files/f1/preview")
        );
        assert_eq!(files.download_url("f1"), "https://api.example.com/files/f1/download");
    }
}
