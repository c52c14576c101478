// Публичный API чата
// Асинхронный клиент поверх внешних сервисов; вся логика сверки в AppState

pub mod contacts;
pub mod messaging;

use crate::error::{RecoveryAction, SessionError};
use crate::protocol::messages::{OutgoingAttachment, RoomAction, SendRequest, SocketEvent};
use crate::protocol::transport::{ConnectionState, EventSource, HttpService, SocketService, Timer};
use crate::state::app::{AppState, JoinPhase, Outgoing};
use crate::state::typing::TypingSignal;
use crate::storage::models::RoomSummary;
use crate::storage::UnreadStore;
use crate::utils::error::{ChatError, Result};
use futures::future::{select, Either};
use messaging::SendOutcome;
use serde_json::Value;
use std::cell::{Ref, RefCell, RefMut};
use std::time::Duration;

/// Главный API чата.
///
/// Все методы берут `&self`: состояние лежит в `RefCell`, и заимствование
/// никогда не живёт через `.await`. Пока идёт отправка или вход в комнату,
/// события сокета и тики таймера обрабатываются сразу
pub struct ChatClient<S, H, T, U>
where
    S: SocketService,
    H: HttpService,
    T: Timer,
    U: UnreadStore,
{
    socket: S,
    http: H,
    timer: T,
    state: RefCell<AppState<U>>,
}

impl<S, H, T, U> ChatClient<S, H, T, U>
where
    S: SocketService,
    H: HttpService,
    T: Timer,
    U: UnreadStore,
{
    pub fn new(socket: S, http: H, timer: T, state: AppState<U>) -> Self {
        Self {
            socket,
            http,
            timer,
            state: RefCell::new(state),
        }
    }

    /// Снимок состояния. Не держать через `.await`
    pub fn state(&self) -> Ref<'_, AppState<U>> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, AppState<U>> {
        self.state.borrow_mut()
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn http(&self) -> &H {
        &self.http
    }

    /// Подключиться к сокету с ограничением по времени
    pub async fn connect(&self) -> Result<()> {
        if self.socket.is_connected() {
            self.state_mut().set_connection_state(ConnectionState::Connected);
            return Ok(());
        }

        let (timeout_ms, viewer) = {
            let mut state = self.state_mut();
            state.set_connection_state(ConnectionState::Connecting);
            (state.config().connect_timeout_ms, state.viewer().clone())
        };

        let result = {
            let connect = self.socket.connect(&viewer);
            let timeout = self.timer.sleep(Duration::from_millis(timeout_ms));
            futures::pin_mut!(connect);
            futures::pin_mut!(timeout);
            match select(connect, timeout).await {
                Either::Left((Ok(()), _)) => Ok(()),
                Either::Left((Err(e), _)) => Err(SessionError::ConnectFailed {
                    reason: e.to_string(),
                }),
                Either::Right(((), _)) => Err(SessionError::ConnectTimeout { timeout_ms }),
            }
        };

        match result {
            Ok(()) => {
                tracing::info!(target: "chat::client", user_id = %viewer.user_id, "socket connected");
                self.state_mut().set_connection_state(ConnectionState::Connected);
                Ok(())
            }
            Err(error) => {
                self.state_mut().set_connection_state(ConnectionState::Disconnected);
                Err(self.fail(error))
            }
        }
    }

    fn fail(&self, error: SessionError) -> ChatError {
        self.state_mut().fail_session(error.clone());
        ChatError::Session(error)
    }

    /// Загрузить список комнат
    pub async fn load_rooms(&self) -> Result<Vec<RoomSummary>> {
        let rooms = self
            .http
            .fetch_rooms()
            .await
            .map_err(|e| ChatError::NetworkError(format!("room list unavailable: {}", e)))?;
        let mut state = self.state_mut();
        state.load_rooms(rooms);
        Ok(state.rooms())
    }

    /// Подключение, вход в комнату, метаданные и история.
    /// Подписка прошлой комнаты освобождается до создания новой
    pub async fn open_room(&self, room_id: &str) -> Result<()> {
        self.emit_typing_stop();
        let previous = self.state_mut().open_room(room_id);
        if let Some(previous) = previous {
            self.socket.unsubscribe(&previous);
        }

        self.connect().await?;

        self.state_mut().set_phase(JoinPhase::Joining {
            room_id: room_id.to_string(),
        });
        let joined = self.socket.join(room_id).await;
        if self.superseded(room_id) {
            return Ok(());
        }
        if let Err(e) = joined {
            return Err(self.fail(SessionError::JoinRejected {
                room_id: room_id.to_string(),
                reason: e.to_string(),
            }));
        }
        let subscription = self.socket.subscribe(room_id);
        let attached = self.state_mut().attach_subscription(subscription.clone());
        if let Err(e) = attached {
            self.socket.unsubscribe(&subscription);
            return Err(e);
        }
        self.state_mut().set_phase(JoinPhase::Loading {
            room_id: room_id.to_string(),
        });

        let meta = self.http.fetch_room_meta(room_id).await;
        if self.superseded(room_id) {
            return Ok(());
        }
        let meta = meta.map_err(|e| self.fail(SessionError::Other { reason: e.to_string() }))?;
        self.state_mut().apply_room_meta(meta)?;

        let limit = self.state().config().history_limit;
        let history = self.http.fetch_history(room_id, limit).await;
        if self.superseded(room_id) {
            return Ok(());
        }
        let history = history.map_err(|e| self.fail(SessionError::Other { reason: e.to_string() }))?;
        {
            let mut state = self.state_mut();
            state.apply_history(history)?;
            state.mark_ready();
        }
        tracing::info!(target: "chat::client", room_id, "room ready");
        Ok(())
    }

    /// Пока шёл вход, открыли другую комнату: результаты этого входа не нужны
    fn superseded(&self, room_id: &str) -> bool {
        let superseded = self.state().active_room_id() != Some(room_id);
        if superseded {
            tracing::debug!(target: "chat::client", room_id, "room join superseded");
        }
        superseded
    }

    /// Выполнить действие восстановления из фатального состояния
    pub async fn recover(&self) -> Result<()> {
        let phase = self.state().phase().clone();
        let JoinPhase::Failed {
            room_id, recovery, ..
        } = phase
        else {
            return Ok(());
        };
        tracing::info!(target: "chat::client", ?recovery, "recovering session");

        if recovery == RecoveryAction::Reload {
            self.load_rooms().await?;
        }
        match room_id {
            Some(room_id) => self.open_room(&room_id).await,
            None => self.connect().await,
        }
    }

    pub fn leave_room(&self) {
        self.emit_typing_stop();
        let subscription = self.state_mut().leave_room();
        if let Some(subscription) = subscription {
            self.socket.unsubscribe(&subscription);
        }
    }

    /// Отправить ввод пользователя. Ошибка отправки не возвращается:
    /// она видна как статус `failed` у самого сообщения
    pub async fn send(&self, text: &str, attachments: Vec<OutgoingAttachment>) -> Result<()> {
        let outgoing = self.state_mut().compose(text, attachments)?;
        match outgoing {
            Outgoing::Nothing => Ok(()),
            Outgoing::Send(request) => {
                self.emit_typing_stop();
                self.deliver(request).await;
                Ok(())
            }
            Outgoing::Rate(request) => match messaging::submit_rating(&self.http, &request).await {
                Ok(()) => {
                    self.state_mut().show_notice("Thanks for rating the project".to_string());
                    Ok(())
                }
                Err(e) => {
                    self.state_mut().show_notice(e.to_string());
                    Err(e)
                }
            },
        }
    }

    /// Повторить неудачную отправку тем же payload'ом
    pub async fn retry(&self, correlation_id: &str) -> Result<()> {
        let request = self.state_mut().retry(correlation_id)?;
        self.deliver(request).await;
        Ok(())
    }

    async fn deliver(&self, request: SendRequest) {
        let correlation_id = request.client_correlation_id.clone();
        let outcome = messaging::deliver(&self.http, &request).await;
        let mut state = self.state_mut();
        match outcome {
            SendOutcome::Accepted(created) => state.send_acked(&correlation_id, created),
            SendOutcome::Rejected(reason) => state.send_failed(&correlation_id, reason),
        }
    }

    /// Событие сокета по имени. Неизвестные и битые события отбрасываются
    pub fn handle_event(&self, source: EventSource, name: &str, payload: Value) {
        match SocketEvent::parse(name, payload) {
            Ok(Some(event)) => self.state_mut().handle_socket_event(source, event),
            Ok(None) => tracing::trace!(target: "chat::client", event = name, "unhandled socket event"),
            Err(e) => tracing::warn!(target: "chat::client", event = name, error = %e, "malformed socket event dropped"),
        }
    }

    pub async fn close_room(&self, room_id: &str) -> Result<()> {
        messaging::room_action(&self.http, room_id, RoomAction::Close).await?;
        self.state_mut().set_room_closed(room_id, true);
        Ok(())
    }

    pub async fn reopen_room(&self, room_id: &str) -> Result<()> {
        messaging::room_action(&self.http, room_id, RoomAction::Reopen).await?;
        self.state_mut().set_room_closed(room_id, false);
        Ok(())
    }

    pub async fn request_reopen(&self, room_id: &str) -> Result<()> {
        messaging::room_action(&self.http, room_id, RoomAction::RequestReopen).await?;
        self.state_mut().mark_reopen_requested(room_id);
        Ok(())
    }

    /// Нажатие клавиши в поле ввода
    pub fn keystroke(&self) {
        let signal = self.state_mut().keystroke();
        if let Some(signal) = signal {
            self.emit_typing(signal);
        }
    }

    /// Периодический тик (порядка секунды)
    pub fn tick(&self) {
        let signal = self.state_mut().tick();
        if let Some(signal) = signal {
            self.emit_typing(signal);
        }
    }

    fn emit_typing_stop(&self) {
        let signal = self.state_mut().stop_typing();
        if let Some(signal) = signal {
            self.emit_typing(signal);
        }
    }

    fn emit_typing(&self, signal: TypingSignal) {
        let payload = {
            let state = self.state();
            let Some(room_id) = state.active_room_id() else {
                return;
            };
            messaging::typing_payload(room_id, state.viewer(), signal)
        };
        if let Err(e) = self.socket.emit(SocketEvent::TYPING, payload) {
            tracing::warn!(target: "chat::client", error = %e, "typing signal not emitted");
        }
    }
}
