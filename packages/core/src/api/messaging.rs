// Отправка через внешние сервисы: HTTP-запросы и payload'ы сокета
// Ошибки коллабораторов (anyhow) переводятся в ChatError здесь

use crate::protocol::messages::{RatingRequest, RawMessage, RoomAction, SendRequest};
use crate::protocol::transport::HttpService;
use crate::state::typing::TypingSignal;
use crate::storage::models::ViewerIdentity;
use crate::utils::error::{ChatError, Result};
use serde_json::{json, Value};

/// Исход одной попытки отправки
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Бэкенд принял сообщение (и, возможно, вернул его)
    Accepted(Option<RawMessage>),
    /// Текст ошибки для `errorText`
    Rejected(String),
}

/// Отправить сообщение. Ошибка сети не пробрасывается: она становится
/// статусом конкретного сообщения
pub async fn deliver<H: HttpService>(http: &H, request: &SendRequest) -> SendOutcome {
    match http.send_message(request).await {
        Ok(created) => SendOutcome::Accepted(created),
        Err(e) => {
            tracing::warn!(
                target: "chat::outbox",
                correlation_id = %request.client_correlation_id,
                error = %e,
                "send request rejected"
            );
            SendOutcome::Rejected(failure_reason(&e))
        }
    }
}

/// Человекочитаемая причина ошибки
pub fn failure_reason(error: &anyhow::Error) -> String {
    let text = error.to_string();
    if text.trim().is_empty() {
        "Message could not be sent".to_string()
    } else {
        text
    }
}

pub async fn submit_rating<H: HttpService>(http: &H, request: &RatingRequest) -> Result<()> {
    http.submit_rating(request)
        .await
        .map_err(|e| ChatError::NetworkError(format!("rating was not submitted: {}", e)))
}

pub async fn room_action<H: HttpService>(http: &H, room_id: &str, action: RoomAction) -> Result<()> {
    http.room_action(room_id, action)
        .await
        .map_err(|e| ChatError::NetworkError(format!("room action {:?} failed: {}", action, e)))
}

/// Payload события `typing` для собственного набора текста
pub fn typing_payload(room_id: &str, viewer: &ViewerIdentity, signal: TypingSignal) -> Value {
    json!({
        "roomId": room_id,
        "userId": viewer.user_id,
        "role": viewer.role.key(),
        "isTyping": signal.is_typing(),
    })
}

/// Сериализовать запрос отправки в JSON
pub fn serialize_send_request(request: &SendRequest) -> Result<String> {
    serde_json::to_string(request).map_err(|e| ChatError::SerializationError(e.to_string()))
}

/// Десериализовать запрос отправки из JSON
pub fn deserialize_send_request(json: &str) -> Result<SendRequest> {
    serde_json::from_str(json).map_err(|e| ChatError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::OutgoingAttachment;
    use crate::storage::models::Role;

    #[test]
    fn test_typing_payload_shape() {
        let viewer = ViewerIdentity::new("u1", Role::Engineer, "Lee");
        let payload = typing_payload("r1", &viewer, TypingSignal::Started);
        assert_eq!(payload["roomId"], "r1");
        assert_eq!(payload["userId"], "u1");
        assert_eq!(payload["role"], "engineer");
        assert_eq!(payload["isTyping"], true);
    }

    #[test]
    fn test_send_request_json_skips_bytes() {
        let request = SendRequest {
            room_id: "r1".into(),
            content: "hi".into(),
            attachments: vec![OutgoingAttachment {
                name: "a.png".into(),
                content_type: "image/png".into(),
                size: 3,
                file_id: Some("f1".into()),
                bytes: Some(vec![1, 2, 3]),
            }],
            client_correlation_id: "c1".into(),
        };
        let json = serialize_send_request(&request).unwrap();
        assert!(json.contains("\"clientCorrelationId\":\"c1\""));
        assert!(!json.contains("bytes"));

        let back = deserialize_send_request(&json).unwrap();
        assert_eq!(back.attachments[0].bytes, None);
    }

    #[test]
    fn test_failure_reason_never_empty() {
        assert_eq!(failure_reason(&anyhow::anyhow!("")), "Message could not be sent");
        assert_eq!(failure_reason(&anyhow::anyhow!("HTTP 500")), "HTTP 500");
    }
}
