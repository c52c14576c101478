use crate::api::contacts::Directory;
use crate::config::Config;
use crate::error::{RecoveryAction, SessionError};
use crate::protocol::messages::{
    OutgoingAttachment, RatingRequest, RawId, RawMessage, RawRoom, ReceiptPayload, RoomEventPayload, RoomMeta,
    SendRequest, SocketEvent, TypingPayload,
};
use crate::protocol::normalize::{normalize_message, normalize_role, parse_raw_timestamp, NormalizeContext};
use crate::protocol::transport::{ConnectionState, EventSource, FileResolver, RoomSubscription};
use crate::protocol::validation::{is_empty_outgoing, validate_outgoing};
use crate::state::commands::{check_rating, parse_input, ComposerInput, SlashCommand};
use crate::state::conversations::{
    ApplyOutcome, ConversationEvent, ConversationState, ConversationsManager, ReceiptKind,
};
use crate::state::grouping::{group_by_date, MessageGroup};
use crate::state::outbox::{optimistic_message, Outbox};
use crate::state::typing::{TypingDebouncer, TypingSignal, TypingTracker};
use crate::storage::models::{Message, MessageStatus, Role, RoomSummary, ViewerIdentity};
use crate::storage::{UnreadChange, UnreadStore};
use crate::utils::error::{ChatError, Result};
use crate::utils::time::Clock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// Сколько id сообщений неактивных комнат помнить для защиты от повторов
const RECENT_FOREIGN_IDS: usize = 256;

/// Этап последовательности подключения и входа в комнату
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum JoinPhase {
    Idle,
    Connecting { room_id: String },
    Joining { room_id: String },
    Loading { room_id: String },
    Ready { room_id: String },
    /// Фатальная ошибка; всегда с действием для восстановления
    Failed {
        room_id: Option<String>,
        error: SessionError,
        recovery: RecoveryAction,
    },
}

impl JoinPhase {
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            JoinPhase::Connecting { .. } | JoinPhase::Joining { .. } | JoinPhase::Loading { .. }
        )
    }
}

/// Состояние UI
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub is_loading: bool,
    pub error_message: Option<String>,
    /// Временное уведомление (например, отказ слэш-команды)
    pub notice: Option<String>,
}

impl UiState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.is_loading = loading;
    }

    pub fn set_error(&mut self, error: String) {
        self.error_message = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.error_message = None;
    }

    pub fn set_notice(&mut self, notice: String) {
        self.notice = Some(notice);
    }

    pub fn clear_notice(&mut self) {
        self.notice = None;
    }
}

/// Изменения, на которые подписывается UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatUpdate {
    MessagesChanged { room_id: String },
    RoomsChanged,
    TypingChanged { room_id: String, label: String },
    UnreadChanged { room_id: String, count: u32, total: u32 },
    /// Сообщение в неактивной комнате (для бейджа в топбаре)
    Notification { room_id: String, preview: String },
    PhaseChanged { phase: JoinPhase },
    Notice { text: String },
}

/// Что клиент должен отправить после разбора ввода
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "request", rename_all = "camelCase")]
pub enum Outgoing {
    Nothing,
    Send(SendRequest),
    Rate(RatingRequest),
}

/// Сессия открытой комнаты: владеет списком сообщений
#[derive(Debug)]
pub struct RoomSession {
    pub conversation: ConversationState,
    pub subscription: Option<RoomSubscription>,
    pub directory: Directory,
    pub is_closed: bool,
    pub project_id: Option<String>,
    pub project_status: Option<String>,
}

impl RoomSession {
    fn new(room_id: &str, config: Config) -> Self {
        Self {
            conversation: ConversationState::new(room_id, config),
            subscription: None,
            directory: Directory::new(),
            is_closed: false,
            project_id: None,
            project_status: None,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.conversation.room_id
    }
}

/// Главное состояние чата одного зрителя
pub struct AppState<U: UnreadStore> {
    viewer: ViewerIdentity,
    config: Config,
    clock: Arc<dyn Clock>,
    files: Option<Box<dyn FileResolver>>,
    fallback_role: Role,

    // === Менеджеры ===
    rooms: ConversationsManager,
    outbox: Outbox,
    typing: TypingTracker,
    debouncer: TypingDebouncer,
    unread: U,

    // === Активная комната ===
    session: Option<RoomSession>,
    recent_foreign_ids: VecDeque<String>,

    // === Соединение и UI ===
    connection_state: ConnectionState,
    phase: JoinPhase,
    ui_state: UiState,
    subscribers: Vec<flume::Sender<ChatUpdate>>,
}

impl<U: UnreadStore> AppState<U> {
    pub fn new(viewer: ViewerIdentity, config: Config, clock: Arc<dyn Clock>, unread: U) -> Self {
        Self {
            typing: TypingTracker::new(config.typing_ttl_ms),
            debouncer: TypingDebouncer::new(config.typing_idle_ms),
            viewer,
            config,
            clock,
            files: None,
            fallback_role: Role::Unknown,
            rooms: ConversationsManager::new(),
            outbox: Outbox::new(),
            unread,
            session: None,
            recent_foreign_ids: VecDeque::new(),
            connection_state: ConnectionState::Disconnected,
            phase: JoinPhase::Idle,
            ui_state: UiState::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Box<dyn FileResolver>) -> Self {
        self.files = Some(files);
        self
    }

    /// Роль для нераспознанных строк ролей (в клиентском чате это Client)
    pub fn with_fallback_role(mut self, role: Role) -> Self {
        self.fallback_role = role;
        self
    }

    /// Новый канал обновлений
    pub fn subscribe(&mut self) -> flume::Receiver<ChatUpdate> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn publish(&mut self, update: ChatUpdate) {
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    // ========================================================================
    // Геттеры
    // ========================================================================

    pub fn viewer(&self) -> &ViewerIdentity {
        &self.viewer
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn phase(&self) -> &JoinPhase {
        &self.phase
    }

    pub fn ui_state(&self) -> &UiState {
        &self.ui_state
    }

    pub fn ui_state_mut(&mut self) -> &mut UiState {
        &mut self.ui_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn session(&self) -> Option<&RoomSession> {
        self.session.as_ref()
    }

    pub fn active_room_id(&self) -> Option<&str> {
        self.session.as_ref().map(RoomSession::room_id)
    }

    pub fn active_subscription(&self) -> Option<&RoomSubscription> {
        self.session.as_ref().and_then(|s| s.subscription.as_ref())
    }

    /// Сообщения активной комнаты
    pub fn messages(&self) -> &[Message] {
        self.session
            .as_ref()
            .map(|s| s.conversation.messages())
            .unwrap_or(&[])
    }

    /// Сообщения активной комнаты, разбитые по дням
    pub fn groups(&self) -> Vec<MessageGroup> {
        group_by_date(self.messages())
    }

    /// Сводки комнат, свежие сверху
    pub fn rooms(&self) -> Vec<RoomSummary> {
        self.rooms.sorted()
    }

    pub fn total_unread(&self) -> u32 {
        self.rooms.total_unread_count()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn typing_label(&self, room_id: &str) -> String {
        self.typing.label(room_id)
    }

    pub fn unread_store(&self) -> &U {
        &self.unread
    }

    pub fn unread_store_mut(&mut self) -> &mut U {
        &mut self.unread
    }

    // ========================================================================
    // Фаза подключения
    // ========================================================================

    pub fn set_phase(&mut self, phase: JoinPhase) {
        if self.phase == phase {
            return;
        }
        tracing::debug!(target: "chat::session", ?phase, "join phase changed");
        self.ui_state.set_loading(phase.is_busy());
        self.phase = phase.clone();
        self.publish(ChatUpdate::PhaseChanged { phase });
    }

    /// Фатальная ошибка подключения или входа
    pub fn fail_session(&mut self, error: SessionError) {
        tracing::error!(target: "chat::session", %error, "session failed");
        let room_id = self.active_room_id().map(str::to_string);
        self.ui_state.set_error(error.to_string());
        let recovery = error.recovery();
        self.set_phase(JoinPhase::Failed {
            room_id,
            error,
            recovery,
        });
    }

    pub fn mark_ready(&mut self) {
        if let Some(room_id) = self.active_room_id().map(str::to_string) {
            self.ui_state.clear_error();
            self.set_phase(JoinPhase::Ready { room_id });
        }
    }

    // ========================================================================
    // Комнаты
    // ========================================================================

    /// Загрузить список комнат; счётчики непрочитанных берутся из хранилища
    pub fn load_rooms(&mut self, raw_rooms: Vec<RawRoom>) {
        for raw in raw_rooms {
            let Some(id) = raw.id.as_ref().and_then(RawId::to_id_string) else {
                tracing::warn!(target: "chat::session", "room without id dropped");
                continue;
            };
            let mut summary = RoomSummary::new(id.as_str(), raw.title.clone().unwrap_or_else(|| id.clone()));
            summary.last_message_preview = raw.last_message.clone().unwrap_or_default();
            summary.updated_at = raw.updated_at.as_ref().and_then(parse_raw_timestamp);
            summary.is_closed = raw.is_closed;
            self.rooms.upsert(summary);

            // Хранилище авторитетно для счётчика
            let count = if self.active_room_id() == Some(id.as_str()) {
                0
            } else {
                self.unread.get(&self.viewer.user_id, &id)
            };
            self.rooms.set_unread(&id, count);
        }
        self.publish(ChatUpdate::RoomsChanged);
    }

    /// Открыть комнату. Возвращает подписку прошлой комнаты, которую
    /// вызывающий обязан освободить до создания новой
    pub fn open_room(&mut self, room_id: &str) -> Option<RoomSubscription> {
        let previous = self.leave_room();
        self.session = Some(RoomSession::new(room_id, self.config.clone()));
        self.recent_foreign_ids.clear();
        self.rooms.get_or_create(room_id);
        self.clear_unread(room_id);
        self.set_phase(JoinPhase::Connecting {
            room_id: room_id.to_string(),
        });
        tracing::info!(target: "chat::session", room_id, "room opened");
        previous
    }

    /// Закрыть активную сессию; возвращает её подписку
    pub fn leave_room(&mut self) -> Option<RoomSubscription> {
        self.debouncer.stop();
        let session = self.session.take()?;
        self.typing.clear_room(session.room_id());

        // Неудачные отправки живут только в списке сессии: без него повторять нечего
        let failed: Vec<&str> = session
            .conversation
            .messages()
            .iter()
            .filter(|m| m.status == MessageStatus::Failed)
            .filter_map(|m| m.client_correlation_id.as_deref())
            .collect();
        if !failed.is_empty() {
            let room_id = session.room_id();
            let evicted = self
                .outbox
                .evict(|e| e.room_id == room_id && failed.contains(&e.correlation_id.as_str()));
            tracing::debug!(target: "chat::outbox", room_id, evicted, "failed sends dropped with session");
        }

        self.set_phase(JoinPhase::Idle);
        session.subscription
    }

    /// Подписка на события комнаты создана
    pub fn attach_subscription(&mut self, subscription: RoomSubscription) -> Result<()> {
        let session = self.session.as_mut().ok_or(ChatError::NoActiveRoom)?;
        if session.room_id() != subscription.room_id {
            return Err(ChatError::InvalidState(format!(
                "subscription for {} does not belong to active room {}",
                subscription.room_id,
                session.room_id()
            )));
        }
        session.subscription = Some(subscription);
        Ok(())
    }

    pub fn apply_room_meta(&mut self, meta: RoomMeta) -> Result<()> {
        let session = self.session.as_mut().ok_or(ChatError::NoActiveRoom)?;
        session.directory = Directory::from_participants(&meta.participants);
        session.is_closed = meta.is_closed;
        session.project_id = meta.project_id.as_ref().and_then(RawId::to_id_string);
        session.project_status = meta.project_status.clone();
        let room_id = session.room_id().to_string();

        let summary = self.rooms.get_or_create(&room_id);
        if let Some(title) = meta.title.as_deref().filter(|t| !t.trim().is_empty()) {
            summary.title = title.trim().to_string();
        }
        self.rooms.set_closed(&room_id, meta.is_closed);
        self.publish(ChatUpdate::RoomsChanged);
        Ok(())
    }

    /// Заменить список сообщений историей. Битые записи пропускаются
    pub fn apply_history(&mut self, raw_history: Vec<RawMessage>) -> Result<()> {
        let room_id = self
            .active_room_id()
            .map(str::to_string)
            .ok_or(ChatError::NoActiveRoom)?;
        let history: Vec<Message> = raw_history
            .iter()
            .filter_map(|raw| match self.normalize(raw, Some(&room_id)) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(target: "chat::normalize", room_id = %room_id, error = %e, "history entry dropped");
                    None
                }
            })
            .collect();

        let session = self.session.as_mut().ok_or(ChatError::NoActiveRoom)?;
        session.conversation.apply(ConversationEvent::HistoryLoaded(history));
        let last = session.conversation.last_message().cloned();
        if let Some(last) = last {
            self.rooms.touch(&last, self.config.room_preview_chars);
        }
        self.publish(ChatUpdate::MessagesChanged { room_id });
        self.publish(ChatUpdate::RoomsChanged);
        Ok(())
    }

    fn normalize(&self, raw: &RawMessage, fallback_room: Option<&str>) -> Result<Message> {
        let mut ctx = NormalizeContext::new(&self.viewer, self.clock.now())
            .with_fallback_role(self.fallback_role)
            .with_signature_prefix(self.config.signature_prefix_chars);
        if let Some(room_id) = fallback_room {
            ctx = ctx.with_room(room_id);
        }
        if let Some(session) = &self.session {
            ctx = ctx.with_directory(&session.directory);
        }
        if let Some(files) = self.files.as_deref() {
            ctx = ctx.with_files(files);
        }
        normalize_message(raw, &ctx)
    }

    // ========================================================================
    // Отправка
    // ========================================================================

    /// Разобрать ввод: слэш-команда или обычное сообщение
    pub fn compose(&mut self, text: &str, attachments: Vec<OutgoingAttachment>) -> Result<Outgoing> {
        match parse_input(text) {
            ComposerInput::Command(SlashCommand::Rate { argument }) => {
                let session = self.session.as_ref().ok_or(ChatError::NoActiveRoom)?;
                match check_rating(argument.as_deref(), session.project_status.as_deref()) {
                    Ok(rating) => Ok(Outgoing::Rate(RatingRequest {
                        room_id: session.room_id().to_string(),
                        project_id: session.project_id.clone(),
                        rating,
                    })),
                    Err(e) => {
                        self.show_notice(e.to_string());
                        Ok(Outgoing::Nothing)
                    }
                }
            }
            ComposerInput::Message(text) => Ok(self
                .begin_send(&text, attachments)?
                .map_or(Outgoing::Nothing, Outgoing::Send)),
        }
    }

    /// Создать оптимистичную запись и вернуть запрос для HTTP.
    /// `None` для пустого ввода: ничего не делается
    pub fn begin_send(&mut self, text: &str, attachments: Vec<OutgoingAttachment>) -> Result<Option<SendRequest>> {
        let session = self.session.as_ref().ok_or(ChatError::NoActiveRoom)?;
        if session.is_closed {
            return Err(ChatError::RoomClosed(session.room_id().to_string()));
        }
        if is_empty_outgoing(text, &attachments) {
            return Ok(None);
        }
        validate_outgoing(text, &attachments, &self.config)?;

        let room_id = session.room_id().to_string();
        let entry = self.outbox.stage(&room_id, text, attachments, &self.config);
        let message = optimistic_message(&entry, &self.viewer, self.clock.now());
        self.apply_to_active(ConversationEvent::LocalSendRequested(message));

        tracing::debug!(target: "chat::outbox", correlation_id = %entry.correlation_id, "optimistic send");
        Ok(self.outbox.begin_attempt(&entry.correlation_id))
    }

    /// HTTP подтвердил отправку
    pub fn send_acked(&mut self, correlation_id: &str, server: Option<RawMessage>) {
        let room_id = self.outbox.get(correlation_id).map(|e| e.room_id.clone());
        let server = server.and_then(|raw| match self.normalize(&raw, room_id.as_deref()) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(target: "chat::outbox", correlation_id, error = %e, "ack payload ignored");
                None
            }
        });
        self.outbox.complete(correlation_id);

        let targets_active = match room_id.as_deref() {
            Some(room) => self.active_room_id() == Some(room),
            None => self.active_room_id().is_some(),
        };
        if targets_active {
            self.apply_to_active(ConversationEvent::SendAcked {
                correlation_id: correlation_id.to_string(),
                server,
            });
        } else if let Some(server) = server {
            self.rooms.touch(&server, self.config.room_preview_chars);
            self.publish(ChatUpdate::RoomsChanged);
        }
    }

    /// Отправка не удалась; запись outbox остаётся для повтора
    pub fn send_failed(&mut self, correlation_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        let Some(entry) = self.outbox.get(correlation_id) else {
            tracing::debug!(target: "chat::outbox", correlation_id, "failure for unknown send ignored");
            return;
        };
        tracing::warn!(target: "chat::outbox", correlation_id, attempts = entry.attempts, %reason, "send failed");

        // Комнату уже покинули: повторять будет нечего
        if self.active_room_id() != Some(entry.room_id.as_str()) {
            self.outbox.complete(correlation_id);
            return;
        }
        self.apply_to_active(ConversationEvent::SendFailed {
            correlation_id: correlation_id.to_string(),
            reason,
        });
    }

    /// Повтор неудачной отправки с исходным payload
    pub fn retry(&mut self, correlation_id: &str) -> Result<SendRequest> {
        let entry = self
            .outbox
            .get(correlation_id)
            .ok_or_else(|| ChatError::NotFound(format!("outbox entry {}", correlation_id)))?;
        let session = self.session.as_ref().ok_or(ChatError::NoActiveRoom)?;
        if session.room_id() != entry.room_id {
            return Err(ChatError::InvalidState("retry belongs to another room".to_string()));
        }
        if session.is_closed {
            return Err(ChatError::RoomClosed(entry.room_id.clone()));
        }

        let outcome = self.apply_to_active(ConversationEvent::RetryRequested {
            correlation_id: correlation_id.to_string(),
        });
        if !outcome.changed() {
            return Err(ChatError::InvalidState("only failed messages can be retried".to_string()));
        }
        self.outbox
            .begin_attempt(correlation_id)
            .ok_or_else(|| ChatError::NotFound(format!("outbox entry {}", correlation_id)))
    }

    pub fn show_notice(&mut self, text: String) {
        self.ui_state.set_notice(text.clone());
        self.publish(ChatUpdate::Notice { text });
    }

    /// Применить событие к активной комнате и обновить сводку
    fn apply_to_active(&mut self, event: ConversationEvent) -> ApplyOutcome {
        let Some(session) = self.session.as_mut() else {
            return ApplyOutcome::Ignored;
        };
        let outcome = session.conversation.apply(event);
        if !outcome.changed() {
            return outcome;
        }

        let room_id = session.room_id().to_string();
        let touched = outcome
            .index()
            .and_then(|i| session.conversation.messages().get(i))
            .cloned();
        if let Some(message) = touched {
            if message.status.is_final() {
                if let Some(correlation) = message.client_correlation_id.as_deref() {
                    self.outbox.complete(correlation);
                }
            }
            if self.rooms.touch(&message, self.config.room_preview_chars) {
                self.publish(ChatUpdate::RoomsChanged);
            }
        }
        self.publish(ChatUpdate::MessagesChanged { room_id });
        outcome
    }

    // ========================================================================
    // События сокета
    // ========================================================================

    /// Обработать событие сокета. Битые payload'ы и события устаревших
    /// подписок отбрасываются без ошибки
    pub fn handle_socket_event(&mut self, source: EventSource, event: SocketEvent) {
        if let EventSource::Room(id) = source {
            let current = self.active_subscription().map(|s| s.id);
            if current != Some(id) {
                tracing::debug!(target: "chat::session", ?id, event = event.name(), "event from stale subscription dropped");
                return;
            }
        }
        let source_room = match source {
            EventSource::Room(_) => self.active_room_id().map(str::to_string),
            EventSource::Connection => None,
        };

        match event {
            SocketEvent::Message(raw) => self.on_message(raw, source_room.as_deref()),
            SocketEvent::Typing(payload) => self.on_typing(payload, source_room.as_deref()),
            SocketEvent::RoomClosed(payload) => self.on_room_event(payload, source_room.as_deref(), RoomEventKind::Closed),
            SocketEvent::RoomReopened(payload) => {
                self.on_room_event(payload, source_room.as_deref(), RoomEventKind::Reopened)
            }
            SocketEvent::ReopenRequested(payload) => {
                self.on_room_event(payload, source_room.as_deref(), RoomEventKind::ReopenRequested)
            }
            SocketEvent::Delivered(payload) => self.on_receipt(payload, source_room.as_deref(), ReceiptKind::Delivered),
            SocketEvent::Read(payload) => self.on_receipt(payload, source_room.as_deref(), ReceiptKind::Read),
        }
    }

    fn on_message(&mut self, raw: RawMessage, source_room: Option<&str>) {
        let message = match self.normalize(&raw, source_room) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(target: "chat::normalize", error = %e, "malformed message dropped");
                return;
            }
        };

        if self.active_room_id() == Some(message.room_id.as_str()) {
            self.apply_to_active(ConversationEvent::RemoteMessageReceived(message));
            return;
        }

        // Неактивная комната: только сводка и счётчик
        if self.recent_foreign_ids.iter().any(|id| *id == message.id) {
            tracing::debug!(target: "chat::reconcile", id = %message.id, "duplicate for inactive room");
            return;
        }
        self.recent_foreign_ids.push_back(message.id.clone());
        if self.recent_foreign_ids.len() > RECENT_FOREIGN_IDS {
            self.recent_foreign_ids.pop_front();
        }

        self.rooms.touch(&message, self.config.room_preview_chars);
        self.publish(ChatUpdate::RoomsChanged);
        if message.is_mine {
            return;
        }

        let room_id = message.room_id.clone();
        match self.unread.increment(&self.viewer.user_id, &room_id) {
            Ok(count) => {
                self.rooms.set_unread(&room_id, count);
                let total = self.rooms.total_unread_count();
                self.publish(ChatUpdate::UnreadChanged {
                    room_id: room_id.clone(),
                    count,
                    total,
                });
            }
            Err(e) => tracing::warn!(target: "chat::storage", room_id = %room_id, error = %e, "unread increment failed"),
        }
        self.publish(ChatUpdate::Notification {
            room_id,
            preview: message.preview(self.config.room_preview_chars),
        });
    }

    fn on_typing(&mut self, payload: TypingPayload, source_room: Option<&str>) {
        let room_id = payload
            .room_id
            .as_ref()
            .and_then(RawId::to_id_string)
            .or_else(|| source_room.map(str::to_string));
        let actor = payload.actor_key.as_ref().and_then(RawId::to_id_string);
        let (Some(room_id), Some(actor)) = (room_id, actor) else {
            tracing::warn!(target: "chat::typing", "typing event without room or actor dropped");
            return;
        };
        if actor == self.viewer.user_id {
            return;
        }

        let role = payload
            .role
            .as_deref()
            .and_then(normalize_role)
            .or_else(|| self.session.as_ref().and_then(|s| s.directory.role(&actor)))
            .unwrap_or(self.fallback_role);
        let now = self.clock.now_millis();
        if self
            .typing
            .set_typing(&room_id, &actor, role, payload.is_typing.unwrap_or(true), now)
        {
            let label = self.typing.label(&room_id);
            self.publish(ChatUpdate::TypingChanged { room_id, label });
        }
    }

    fn on_room_event(&mut self, payload: RoomEventPayload, source_room: Option<&str>, kind: RoomEventKind) {
        let Some(room_id) = payload
            .room_id
            .as_ref()
            .and_then(RawId::to_id_string)
            .or_else(|| source_room.map(str::to_string))
        else {
            tracing::warn!(target: "chat::session", "room event without room id dropped");
            return;
        };

        match kind {
            RoomEventKind::Closed => self.set_room_closed(&room_id, true),
            RoomEventKind::Reopened => self.set_room_closed(&room_id, false),
            RoomEventKind::ReopenRequested => {
                self.rooms.mark_reopen_requested(&room_id);
                self.publish(ChatUpdate::RoomsChanged);
            }
        }
    }

    /// Локально отметить комнату закрытой/открытой
    pub fn set_room_closed(&mut self, room_id: &str, closed: bool) {
        self.rooms.set_closed(room_id, closed);
        if let Some(session) = self.session.as_mut().filter(|s| s.room_id() == room_id) {
            session.is_closed = closed;
        }
        tracing::info!(target: "chat::session", room_id, closed, "room lifecycle changed");
        self.publish(ChatUpdate::RoomsChanged);
    }

    pub fn mark_reopen_requested(&mut self, room_id: &str) {
        self.rooms.mark_reopen_requested(room_id);
        self.publish(ChatUpdate::RoomsChanged);
    }

    fn on_receipt(&mut self, payload: ReceiptPayload, source_room: Option<&str>, kind: ReceiptKind) {
        let Some(message_id) = payload.message_id.as_ref().and_then(RawId::to_id_string) else {
            tracing::warn!(target: "chat::reconcile", "receipt without message id dropped");
            return;
        };
        let room_id = payload
            .room_id
            .as_ref()
            .and_then(RawId::to_id_string)
            .or_else(|| source_room.map(str::to_string));
        if room_id.is_some() && room_id.as_deref() != self.active_room_id() {
            return;
        }
        self.apply_to_active(ConversationEvent::ReceiptReceived { message_id, kind });
    }

    // ========================================================================
    // Непрочитанные
    // ========================================================================

    fn clear_unread(&mut self, room_id: &str) {
        if let Err(e) = self.unread.clear(&self.viewer.user_id, room_id) {
            tracing::warn!(target: "chat::storage", room_id, error = %e, "unread clear failed");
        }
        if self.rooms.set_unread(room_id, 0) {
            let total = self.rooms.total_unread_count();
            self.publish(ChatUpdate::UnreadChanged {
                room_id: room_id.to_string(),
                count: 0,
                total,
            });
        }
    }

    /// Изменение счётчика из другой вкладки/вида
    pub fn sync_unread(&mut self, change: UnreadChange) {
        if change.viewer_id != self.viewer.user_id {
            return;
        }
        let count = if self.active_room_id() == Some(change.room_id.as_str()) {
            0
        } else {
            change.count
        };
        if self.rooms.set_unread(&change.room_id, count) {
            let total = self.rooms.total_unread_count();
            self.publish(ChatUpdate::UnreadChanged {
                room_id: change.room_id,
                count,
                total,
            });
        }
    }

    // ========================================================================
    // Набор текста
    // ========================================================================

    /// Нажатие клавиши в поле ввода
    pub fn keystroke(&mut self) -> Option<TypingSignal> {
        self.session.as_ref()?;
        let now = self.clock.now_millis();
        self.debouncer.keystroke(now)
    }

    pub fn stop_typing(&mut self) -> Option<TypingSignal> {
        self.debouncer.stop()
    }

    /// Периодический тик: чистка typing и пауза локального набора
    pub fn tick(&mut self) -> Option<TypingSignal> {
        let now = self.clock.now_millis();
        for room_id in self.typing.sweep(now) {
            let label = self.typing.label(&room_id);
            self.publish(ChatUpdate::TypingChanged { room_id, label });
        }
        self.debouncer.tick(now)
    }
}

#[derive(Debug, Clone, Copy)]
enum RoomEventKind {
    Closed,
    Reopened,
    ReopenRequested,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport::SubscriptionId;
    use crate::storage::memory::MemoryUnreadStore;
    use crate::utils::time::{parse_timestamp, ManualClock};
    use serde_json::json;

    fn clock() -> ManualClock {
        ManualClock::new(parse_timestamp("2024-03-01T10:00:00Z").unwrap())
    }

    fn app(clock: &ManualClock) -> AppState<MemoryUnreadStore> {
        AppState::new(
            ViewerIdentity::new("me", Role::Client, "Me"),
            Config::default(),
            Arc::new(clock.clone()),
            MemoryUnreadStore::new(),
        )
    }

    fn joined(app: &mut AppState<MemoryUnreadStore>, room_id: &str, sub: u64) {
        app.open_room(room_id);
        app.attach_subscription(RoomSubscription {
            room_id: room_id.to_string(),
            id: SubscriptionId(sub),
        })
        .unwrap();
        app.mark_ready();
    }

    fn message_event(value: serde_json::Value) -> SocketEvent {
        SocketEvent::Message(RawMessage::from_value(value).unwrap())
    }

    #[test]
    fn test_send_requires_open_room() {
        let clock = clock();
        let mut app = app(&clock);
        assert!(matches!(app.begin_send("hi", vec![]), Err(ChatError::NoActiveRoom)));
    }

    #[test]
    fn test_empty_send_is_noop() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);
        assert_eq!(app.begin_send("   ", vec![]).unwrap(), None);
        assert!(app.messages().is_empty());
    }

    #[test]
    fn test_closed_room_rejects_before_network() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);
        app.handle_socket_event(
            EventSource::Room(SubscriptionId(1)),
            SocketEvent::RoomClosed(RoomEventPayload::default()),
        );
        assert!(matches!(app.begin_send("hi", vec![]), Err(ChatError::RoomClosed(_))));
        assert!(app.messages().is_empty());
        assert!(app.outbox().is_empty());
    }

    #[test]
    fn test_stale_subscription_is_ignored() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);
        joined(&mut app, "r2", 2);

        app.handle_socket_event(
            EventSource::Room(SubscriptionId(1)),
            message_event(json!({ "id": "m1", "senderId": "u2", "content": "late" })),
        );
        assert!(app.messages().is_empty());
        assert_eq!(app.rooms.get("r1").map(|r| r.unread_count), Some(0));
    }

    #[test]
    fn test_inactive_room_only_counts_unread() {
        let clock = clock();
        let mut app = app(&clock);
        let updates = app.subscribe();
        joined(&mut app, "r1", 1);

        let event = json!({ "id": "m1", "roomId": "r2", "senderId": "u2", "content": "psst" });
        app.handle_socket_event(EventSource::Connection, message_event(event.clone()));
        app.handle_socket_event(EventSource::Connection, message_event(event));

        assert!(app.messages().is_empty());
        assert_eq!(app.unread_store().get("me", "r2"), 1);
        assert_eq!(app.total_unread(), 1);
        assert_eq!(app.rooms()[0].id, "r2");
        assert!(updates
            .try_iter()
            .any(|u| matches!(u, ChatUpdate::Notification { ref room_id, .. } if room_id == "r2")));

        joined(&mut app, "r2", 2);
        assert_eq!(app.unread_store().get("me", "r2"), 0);
        assert_eq!(app.total_unread(), 0);
    }

    #[test]
    fn test_own_message_elsewhere_does_not_count() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);
        app.handle_socket_event(
            EventSource::Connection,
            message_event(json!({ "id": "m1", "roomId": "r2", "senderId": "me", "content": "from my other tab" })),
        );
        assert_eq!(app.total_unread(), 0);
    }

    #[test]
    fn test_active_room_message_does_not_count() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);
        app.handle_socket_event(
            EventSource::Room(SubscriptionId(1)),
            message_event(json!({ "id": "m1", "senderId": "u2", "content": "hi" })),
        );
        assert_eq!(app.messages().len(), 1);
        assert_eq!(app.total_unread(), 0);
    }

    #[test]
    fn test_malformed_event_does_not_corrupt_list() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);
        app.handle_socket_event(
            EventSource::Room(SubscriptionId(1)),
            message_event(json!({ "id": "m1", "senderId": "u2", "content": "ok" })),
        );
        app.handle_socket_event(EventSource::Connection, message_event(json!({ "content": "no room" })));
        app.handle_socket_event(
            EventSource::Room(SubscriptionId(1)),
            message_event(json!({ "id": "m2", "content": "no sender" })),
        );
        assert_eq!(app.messages().len(), 1);
    }

    #[test]
    fn test_failed_send_keeps_outbox_for_retry() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);

        let request = app.begin_send("Hello", vec![]).unwrap().unwrap();
        let corr = request.client_correlation_id.clone();
        app.send_failed(&corr, "network down");
        assert_eq!(app.messages()[0].status, MessageStatus::Failed);
        assert!(app.outbox().contains(&corr));

        let again = app.retry(&corr).unwrap();
        assert_eq!(again, request);
        assert_eq!(app.messages()[0].status, MessageStatus::Pending);

        app.send_acked(&corr, None);
        assert_eq!(app.messages()[0].status, MessageStatus::Sent);
        assert!(!app.outbox().contains(&corr));
    }

    #[test]
    fn test_leaving_room_drops_dead_outbox_entries() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);

        let failed = app.begin_send("lost", vec![]).unwrap().unwrap();
        app.send_failed(&failed.client_correlation_id, "network down");
        let in_flight = app.begin_send("still going", vec![]).unwrap().unwrap();
        assert_eq!(app.outbox().len(), 2);

        app.open_room("r2");
        assert!(!app.outbox().contains(&failed.client_correlation_id));
        assert!(app.outbox().contains(&in_flight.client_correlation_id));

        // Запрос из покинутой комнаты всё же упал
        app.send_failed(&in_flight.client_correlation_id, "timeout");
        assert!(app.outbox().is_empty());
        assert!(app.messages().is_empty());
    }

    #[test]
    fn test_retry_rejected_unless_failed() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);
        let request = app.begin_send("Hello", vec![]).unwrap().unwrap();
        assert!(matches!(
            app.retry(&request.client_correlation_id),
            Err(ChatError::InvalidState(_))
        ));
    }

    #[test]
    fn test_typing_events() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);

        let typing = |actor: &str| {
            SocketEvent::Typing(TypingPayload {
                room_id: None,
                actor_key: Some(RawId::from(actor)),
                role: Some("PM".to_string()),
                is_typing: Some(true),
            })
        };
        app.handle_socket_event(EventSource::Room(SubscriptionId(1)), typing("me"));
        assert_eq!(app.typing_label("r1"), "");

        app.handle_socket_event(EventSource::Room(SubscriptionId(1)), typing("u2"));
        assert_eq!(app.typing_label("r1"), "PM is typing…");

        clock.advance_ms(3000);
        app.tick();
        assert_eq!(app.typing_label("r1"), "");
    }

    #[test]
    fn test_rating_command_gated_by_project_status() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);
        app.apply_room_meta(RoomMeta {
            project_id: Some(RawId::from("p1")),
            project_status: Some("active".to_string()),
            ..RoomMeta::default()
        })
        .unwrap();

        assert_eq!(app.compose("/rate 5", vec![]).unwrap(), Outgoing::Nothing);
        assert!(app.ui_state().notice.is_some());
        assert!(app.messages().is_empty());

        app.apply_room_meta(RoomMeta {
            project_id: Some(RawId::from("p1")),
            project_status: Some("completed".to_string()),
            ..RoomMeta::default()
        })
        .unwrap();
        assert_eq!(
            app.compose("/rate 5", vec![]).unwrap(),
            Outgoing::Rate(RatingRequest {
                room_id: "r1".into(),
                project_id: Some("p1".into()),
                rating: 5
            })
        );
        assert!(matches!(app.compose("/shrug", vec![]).unwrap(), Outgoing::Send(_)));
    }

    #[test]
    fn test_sync_unread_from_other_tab() {
        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);
        app.sync_unread(UnreadChange {
            viewer_id: "me".into(),
            room_id: "r3".into(),
            count: 4,
        });
        app.sync_unread(UnreadChange {
            viewer_id: "someone-else".into(),
            room_id: "r3".into(),
            count: 9,
        });
        assert_eq!(app.total_unread(), 4);
    }

    #[test]
    fn test_sync_unread_from_storage_entry() {
        use crate::storage::unread_key;

        let clock = clock();
        let mut app = app(&clock);
        joined(&mut app, "r1", 1);
        let updates = app.subscribe();
        let namespace = Config::default().unread_key_namespace;

        let key = unread_key(&namespace, "me", "r3");
        let change = UnreadChange::from_storage_entry(&namespace, &key, Some("2")).unwrap();
        app.sync_unread(change);
        assert_eq!(app.total_unread(), 2);
        assert!(updates.try_iter().any(|u| matches!(
            u,
            ChatUpdate::UnreadChanged { ref room_id, count: 2, total: 2 } if room_id == "r3"
        )));

        // Открытая комната остаётся прочитанной
        let key = unread_key(&namespace, "me", "r1");
        app.sync_unread(UnreadChange::from_storage_entry(&namespace, &key, Some("5")).unwrap());
        assert_eq!(app.total_unread(), 2);

        // Другая вкладка сбросила счётчик
        let key = unread_key(&namespace, "me", "r3");
        app.sync_unread(UnreadChange::from_storage_entry(&namespace, &key, None).unwrap());
        assert_eq!(app.total_unread(), 0);
    }

    #[test]
    fn test_session_failure_carries_recovery() {
        let clock = clock();
        let mut app = app(&clock);
        app.open_room("r1");
        app.fail_session(SessionError::ConnectTimeout { timeout_ms: 8000 });
        match app.phase() {
            JoinPhase::Failed { room_id, recovery, .. } => {
                assert_eq!(room_id.as_deref(), Some("r1"));
                assert_eq!(*recovery, RecoveryAction::Reconnect);
            }
            other => panic!("unexpected phase {:?}", other),
        }
        assert!(app.ui_state().error_message.is_some());
    }
}
