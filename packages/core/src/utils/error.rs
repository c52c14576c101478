// Типы ошибок

use crate::error::SessionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Room {0} is closed")]
    RoomClosed(String),

    #[error("No active room")]
    NoActiveRoom,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("WASM serialization error: {0}")]
    SerdeWasmError(String),
}

impl From<serde_json::Error> for ChatError {
    fn from(error: serde_json::Error) -> Self {
        ChatError::SerializationError(error.to_string())
    }
}

#[cfg(target_arch = "wasm32")]
impl From<serde_wasm_bindgen::Error> for ChatError {
    fn from(error: serde_wasm_bindgen::Error) -> Self {
        ChatError::SerdeWasmError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

// Для WASM-биндингов
#[cfg(target_arch = "wasm32")]
impl From<ChatError> for wasm_bindgen::JsValue {
    fn from(error: ChatError) -> Self {
        wasm_bindgen::JsValue::from_str(&error.to_string())
    }
}
