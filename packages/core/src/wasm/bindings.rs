// WASM bindings

use crate::api::messaging::typing_payload;
use crate::config::Config;
use crate::error::SessionError;
use crate::protocol::messages::{OutgoingAttachment, RawMessage, RawRoom, RoomMeta, SocketEvent};
use crate::protocol::normalize::normalize_role;
use crate::protocol::transport::{ConnectionState, EventSource, RoomSubscription, SubscriptionId, UrlFileResolver};
use crate::state::app::{AppState, ChatUpdate, JoinPhase};
use crate::state::typing::TypingSignal;
use crate::storage::models::{Role, ViewerIdentity};
use crate::storage::{BrowserUnreadStore, UnreadChange, UnreadStore};
use crate::utils::error::{ChatError, Result};
use crate::utils::time::SystemClock;
use crate::wasm::console;
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use wasm_bindgen::prelude::*;

/// Состояние одного чата в браузере вместе с каналом обновлений
struct BrowserChat {
    state: AppState<BrowserUnreadStore>,
    updates: flume::Receiver<ChatUpdate>,
    unread: flume::Receiver<UnreadChange>,
}

// Однопоточный контекст WASM: Rc<RefCell<T>> вместо Arc<Mutex<T>>
thread_local! {
    static CHATS: RefCell<HashMap<String, Rc<RefCell<BrowserChat>>>> = RefCell::new(HashMap::new());
}

type JsResult<T> = std::result::Result<T, JsValue>;

fn with_chat<F, T>(chat_id: &str, f: F) -> JsResult<T>
where
    F: FnOnce(&mut BrowserChat) -> Result<T>,
{
    let cell = CHATS
        .with(|chats| chats.borrow().get(chat_id).cloned())
        .ok_or_else(|| ChatError::NotFound(format!("chat {} not found", chat_id)))?;
    let result = f(&mut cell.borrow_mut());
    result.map_err(|e| {
        console::error(&e.to_string());
        e.into()
    })
}

fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue> {
    Ok(value.serialize(&serde_wasm_bindgen::Serializer::json_compatible())?)
}

fn from_js<T: serde::de::DeserializeOwned>(value: JsValue) -> Result<T> {
    Ok(serde_wasm_bindgen::from_value(value)?)
}

fn typing_to_js(chat: &BrowserChat, signal: Option<TypingSignal>) -> Result<JsValue> {
    match (signal, chat.state.active_room_id()) {
        (Some(signal), Some(room_id)) => to_js(&typing_payload(room_id, chat.state.viewer(), signal)),
        _ => Ok(JsValue::NULL),
    }
}

// ============================================================================
// Жизненный цикл
// ============================================================================

/// Создать состояние чата. `files_base_url` задаёт ссылки на превью вложений
#[wasm_bindgen]
pub fn create_chat(
    user_id: String,
    role: String,
    display_name: String,
    files_base_url: Option<String>,
) -> JsResult<String> {
    console::init_logging();

    let role = normalize_role(&role).unwrap_or(Role::Client);
    let viewer = ViewerIdentity::new(user_id, role, display_name);
    let mut state = AppState::new(
        viewer,
        Config::global().clone(),
        Arc::new(SystemClock),
        BrowserUnreadStore::new(),
    );
    if let Some(base) = files_base_url {
        state = state.with_files(Box::new(UrlFileResolver::new(base)));
    }
    let updates = state.subscribe();
    let unread = state.unread_store_mut().subscribe();

    let chat_id = crate::utils::uuid::generate_v4();
    CHATS.with(|chats| {
        chats.borrow_mut().insert(
            chat_id.clone(),
            Rc::new(RefCell::new(BrowserChat {
                state,
                updates,
                unread,
            })),
        );
    });
    Ok(chat_id)
}

#[wasm_bindgen]
pub fn destroy_chat(chat_id: String) {
    CHATS.with(|chats| {
        chats.borrow_mut().remove(&chat_id);
    });
}

/// Забрать накопленные обновления для UI (массив ChatUpdate)
#[wasm_bindgen]
pub fn chat_drain_updates(chat_id: String) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| {
        // Свои записи и записи других вкладок (событие `storage`)
        let changes: Vec<UnreadChange> = chat.unread.try_iter().collect();
        for change in changes {
            chat.state.sync_unread(change);
        }
        let updates: Vec<ChatUpdate> = chat.updates.try_iter().collect();
        to_js(&updates)
    })
}

/// Запись localStorage, замеченная хостом (например, в воркере без window).
/// Чужие ключи игнорируются
#[wasm_bindgen]
pub fn chat_sync_unread(chat_id: String, key: String, value: Option<String>) -> JsResult<bool> {
    with_chat(&chat_id, |chat| {
        let namespace = &Config::global().unread_key_namespace;
        match UnreadChange::from_storage_entry(namespace, &key, value.as_deref()) {
            Some(change) => {
                chat.state.sync_unread(change);
                Ok(true)
            }
            None => Ok(false),
        }
    })
}

// ============================================================================
// Сессия
// ============================================================================

#[wasm_bindgen]
pub fn chat_set_connected(chat_id: String, connected: bool) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        chat.state.set_connection_state(state);
        Ok(())
    })
}

/// Войти в комнату. Возвращает id прошлой подписки, которую JS
/// обязан снять до создания новой
#[wasm_bindgen]
pub fn chat_open_room(chat_id: String, room_id: String) -> JsResult<Option<u64>> {
    with_chat(&chat_id, |chat| Ok(chat.state.open_room(&room_id).map(|s| s.id.0)))
}

#[wasm_bindgen]
pub fn chat_leave_room(chat_id: String) -> JsResult<Option<u64>> {
    with_chat(&chat_id, |chat| Ok(chat.state.leave_room().map(|s| s.id.0)))
}

/// Сокет принял вход в комнату; начинается загрузка
#[wasm_bindgen]
pub fn chat_attach_subscription(chat_id: String, room_id: String, subscription_id: u64) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        chat.state.attach_subscription(RoomSubscription {
            room_id: room_id.clone(),
            id: SubscriptionId(subscription_id),
        })?;
        chat.state.set_phase(JoinPhase::Loading { room_id });
        Ok(())
    })
}

/// Фатальная ошибка подключения: `{ kind: "connectTimeout", timeoutMs }` и т.п.
#[wasm_bindgen]
pub fn chat_fail_session(chat_id: String, error: JsValue) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        let error: SessionError = from_js(error)?;
        chat.state.fail_session(error);
        Ok(())
    })
}

#[wasm_bindgen]
pub fn chat_load_rooms(chat_id: String, rooms: JsValue) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| {
        let rooms: Vec<RawRoom> = from_js(rooms)?;
        chat.state.load_rooms(rooms);
        to_js(&chat.state.rooms())
    })
}

#[wasm_bindgen]
pub fn chat_apply_room_meta(chat_id: String, meta: JsValue) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        let meta: RoomMeta = from_js(meta)?;
        chat.state.apply_room_meta(meta)
    })
}

/// Загрузить историю и завершить вход в комнату
#[wasm_bindgen]
pub fn chat_apply_history(chat_id: String, history: JsValue) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        let history: Vec<RawMessage> = from_js(history)?;
        chat.state.apply_history(history)?;
        chat.state.mark_ready();
        Ok(())
    })
}

// ============================================================================
// Отправка
// ============================================================================

/// Разобрать ввод: `{ kind: "send" | "rate" | "nothing", request }`
#[wasm_bindgen]
pub fn chat_compose(chat_id: String, text: String, attachments: JsValue) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| {
        let attachments: Vec<OutgoingAttachment> = if attachments.is_undefined() || attachments.is_null() {
            Vec::new()
        } else {
            from_js(attachments)?
        };
        let outgoing = chat.state.compose(&text, attachments)?;
        to_js(&outgoing)
    })
}

#[wasm_bindgen]
pub fn chat_send_acked(chat_id: String, correlation_id: String, server: JsValue) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        let server: Option<RawMessage> = if server.is_undefined() || server.is_null() {
            None
        } else {
            Some(RawMessage::from_value(from_js::<Value>(server)?)?)
        };
        chat.state.send_acked(&correlation_id, server);
        Ok(())
    })
}

#[wasm_bindgen]
pub fn chat_send_failed(chat_id: String, correlation_id: String, reason: String) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        chat.state.send_failed(&correlation_id, reason);
        Ok(())
    })
}

/// Повторная отправка: тот же SendRequest, что и в первый раз
#[wasm_bindgen]
pub fn chat_retry(chat_id: String, correlation_id: String) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| {
        let request = chat.state.retry(&correlation_id)?;
        to_js(&request)
    })
}

// ============================================================================
// События сокета
// ============================================================================

/// `subscription_id` отсутствует для слушателей уровня соединения
#[wasm_bindgen]
pub fn chat_handle_socket_event(
    chat_id: String,
    name: String,
    payload: JsValue,
    subscription_id: Option<u64>,
) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        let payload: Value = from_js(payload)?;
        let source = match subscription_id {
            Some(id) => EventSource::Room(SubscriptionId(id)),
            None => EventSource::Connection,
        };
        match SocketEvent::parse(&name, payload) {
            Ok(Some(event)) => chat.state.handle_socket_event(source, event),
            Ok(None) => {}
            Err(e) => tracing::warn!(target: "chat::wasm", event = %name, error = %e, "malformed socket event dropped"),
        }
        Ok(())
    })
}

#[wasm_bindgen]
pub fn chat_set_room_closed(chat_id: String, room_id: String, closed: bool) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        chat.state.set_room_closed(&room_id, closed);
        Ok(())
    })
}

#[wasm_bindgen]
pub fn chat_mark_reopen_requested(chat_id: String, room_id: String) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        chat.state.mark_reopen_requested(&room_id);
        Ok(())
    })
}

// ============================================================================
// Набор текста. Возвращают payload для `typing` или null
// ============================================================================

#[wasm_bindgen]
pub fn chat_keystroke(chat_id: String) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| {
        let signal = chat.state.keystroke();
        typing_to_js(chat, signal)
    })
}

#[wasm_bindgen]
pub fn chat_tick(chat_id: String) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| {
        let signal = chat.state.tick();
        typing_to_js(chat, signal)
    })
}

// ============================================================================
// Снимки для отрисовки
// ============================================================================

#[wasm_bindgen]
pub fn chat_messages(chat_id: String) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| to_js(chat.state.messages()))
}

#[wasm_bindgen]
pub fn chat_groups(chat_id: String) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| to_js(&chat.state.groups()))
}

#[wasm_bindgen]
pub fn chat_rooms(chat_id: String) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| to_js(&chat.state.rooms()))
}

#[wasm_bindgen]
pub fn chat_total_unread(chat_id: String) -> JsResult<u32> {
    with_chat(&chat_id, |chat| Ok(chat.state.total_unread()))
}

#[wasm_bindgen]
pub fn chat_typing_label(chat_id: String, room_id: String) -> JsResult<String> {
    with_chat(&chat_id, |chat| Ok(chat.state.typing_label(&room_id)))
}

#[wasm_bindgen]
pub fn chat_phase(chat_id: String) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| to_js(chat.state.phase()))
}

#[wasm_bindgen]
pub fn chat_ui_state(chat_id: String) -> JsResult<JsValue> {
    with_chat(&chat_id, |chat| to_js(chat.state.ui_state()))
}

#[wasm_bindgen]
pub fn chat_clear_notice(chat_id: String) -> JsResult<()> {
    with_chat(&chat_id, |chat| {
        chat.state.ui_state_mut().clear_notice();
        Ok(())
    })
}
