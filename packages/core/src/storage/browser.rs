// Хранилище счётчиков на localStorage (WASM)
//
// Другие вкладки узнают об изменениях через нативное событие `storage`,
// текущая вкладка через CustomEvent UNREAD_EVENT на window.

use crate::config::Config;
use crate::storage::{notify, unread_key, UnreadChange, UnreadStore};
use crate::utils::error::{ChatError, Result};
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::JsCast;
use web_sys::{CustomEvent, CustomEventInit, Storage, StorageEvent};

/// Имя DOM-события об изменении счётчика
pub const UNREAD_EVENT: &str = "chat-unread-changed";

/// Нативное событие записи в localStorage из другой вкладки
const STORAGE_EVENT: &str = "storage";

type Subscribers = Rc<RefCell<Vec<flume::Sender<UnreadChange>>>>;

pub struct BrowserUnreadStore {
    namespace: String,
    subscribers: Subscribers,
    on_storage: Option<Closure<dyn FnMut(StorageEvent)>>,
}

impl BrowserUnreadStore {
    pub fn new() -> Self {
        let namespace = Config::global().unread_key_namespace.clone();
        let subscribers: Subscribers = Rc::new(RefCell::new(Vec::new()));
        let on_storage = match Self::listen(&namespace, &subscribers) {
            Ok(closure) => Some(closure),
            Err(e) => {
                tracing::warn!(target: "chat::storage", error = %e, "cross-tab unread sync disabled");
                None
            }
        };
        Self {
            namespace,
            subscribers,
            on_storage,
        }
    }

    /// Записи других вкладок пересылаются подписчикам этой
    fn listen(namespace: &str, subscribers: &Subscribers) -> Result<Closure<dyn FnMut(StorageEvent)>> {
        let window = web_sys::window()
            .ok_or_else(|| ChatError::StorageError("window is not available".to_string()))?;
        let namespace = namespace.to_string();
        let subscribers = Rc::clone(subscribers);

        let closure = Closure::wrap(Box::new(move |event: StorageEvent| {
            // key == None означает localStorage.clear()
            let Some(key) = event.key() else {
                return;
            };
            let new_value = event.new_value();
            if let Some(change) = UnreadChange::from_storage_entry(&namespace, &key, new_value.as_deref()) {
                tracing::debug!(target: "chat::storage", room_id = %change.room_id, count = change.count, "unread changed in another tab");
                notify(&mut subscribers.borrow_mut(), &change);
            }
        }) as Box<dyn FnMut(StorageEvent)>);

        window
            .add_event_listener_with_callback(STORAGE_EVENT, closure.as_ref().unchecked_ref())
            .map_err(|e| ChatError::StorageError(format!("storage listener not registered: {:?}", e)))?;
        Ok(closure)
    }

    fn storage() -> Result<Storage> {
        let window = web_sys::window()
            .ok_or_else(|| ChatError::StorageError("window is not available".to_string()))?;
        window
            .local_storage()
            .map_err(|e| ChatError::StorageError(format!("localStorage access failed: {:?}", e)))?
            .ok_or_else(|| ChatError::StorageError("localStorage is disabled".to_string()))
    }

    fn dispatch(change: &UnreadChange) -> Result<()> {
        let window = web_sys::window()
            .ok_or_else(|| ChatError::StorageError("window is not available".to_string()))?;
        let detail = serde_wasm_bindgen::to_value(change)?;
        let init = CustomEventInit::new();
        init.set_detail(&detail);
        let event = CustomEvent::new_with_event_init_dict(UNREAD_EVENT, &init)
            .map_err(|e| ChatError::StorageError(format!("Failed to create event: {:?}", e)))?;
        window
            .dispatch_event(&event)
            .map_err(|e| ChatError::StorageError(format!("Failed to dispatch event: {:?}", e)))?;
        Ok(())
    }
}

impl Drop for BrowserUnreadStore {
    fn drop(&mut self) {
        if let (Some(window), Some(closure)) = (web_sys::window(), self.on_storage.take()) {
            let _ = window.remove_event_listener_with_callback(STORAGE_EVENT, closure.as_ref().unchecked_ref());
        }
    }
}

impl Default for BrowserUnreadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UnreadStore for BrowserUnreadStore {
    fn get(&self, viewer_id: &str, room_id: &str) -> u32 {
        let key = unread_key(&self.namespace, viewer_id, room_id);
        Self::storage()
            .ok()
            .and_then(|storage| storage.get_item(&key).ok().flatten())
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    fn set(&mut self, viewer_id: &str, room_id: &str, count: u32) -> Result<()> {
        if self.get(viewer_id, room_id) == count {
            return Ok(());
        }
        let key = unread_key(&self.namespace, viewer_id, room_id);
        Self::storage()?
            .set_item(&key, &count.to_string())
            .map_err(|e| ChatError::StorageError(format!("localStorage write failed: {:?}", e)))?;

        let change = UnreadChange {
            viewer_id: viewer_id.to_string(),
            room_id: room_id.to_string(),
            count,
        };
        notify(&mut self.subscribers.borrow_mut(), &change);
        if let Err(e) = Self::dispatch(&change) {
            tracing::warn!(target: "chat::storage", error = %e, "unread change event not dispatched");
        }
        Ok(())
    }

    fn subscribe(&mut self) -> flume::Receiver<UnreadChange> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.borrow_mut().push(tx);
        rx
    }
}
