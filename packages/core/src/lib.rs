// Chatsync Core
// Движок сверки сообщений и статусов доставки для чата проектного портала

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Модули
pub mod api;
pub mod config;
pub mod error;
pub mod protocol;
pub mod state;
pub mod storage;
pub mod utils;

// WASM-specific bindings
#[cfg(target_arch = "wasm32")]
pub mod wasm;

// Re-exports для удобства
pub use api::ChatClient;
pub use config::Config;
pub use error::{RecoveryAction, SessionError};
pub use protocol::messages::{OutgoingAttachment, RawMessage, SendRequest, SocketEvent};
pub use protocol::transport::{EventSource, FileResolver, HttpService, SocketService, Timer};
pub use state::app::{AppState, ChatUpdate, JoinPhase};
pub use state::conversations::{ApplyOutcome, ConversationEvent, ConversationState};
pub use storage::models::{Message, MessageStatus, Role, ViewerIdentity};
pub use storage::{MemoryUnreadStore, UnreadStore};
pub use utils::error::{ChatError, Result};
pub use utils::logging::init_logging;
