//! Централизованная конфигурация движка чата
//!
//! Все окна сопоставления, таймауты и лимиты определены здесь,
//! чтобы не разбрасывать хардкод по модулям.

use std::sync::OnceLock;

/// Глобальная конфигурация (синглтон)
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

/// Основная структура конфигурации
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // ============================================
    // СОПОСТАВЛЕНИЕ СООБЩЕНИЙ
    // ============================================

    /// Окно (в секундах), в котором эхо "своего" сообщения без correlation id
    /// сопоставляется с pending/sent записью с тем же текстом
    pub match_window_secs: i64,

    /// Сколько символов обрезанного текста входит в fallback-подпись
    pub signature_prefix_chars: usize,

    /// Префикс временных id оптимистичных сообщений
    pub temp_id_prefix: String,

    // ============================================
    // ИНДИКАТОР "ПЕЧАТАЕТ"
    // ============================================

    /// Время жизни записи typing без обновления (мс)
    pub typing_ttl_ms: i64,

    /// Период фоновой очистки просроченных typing записей (мс)
    pub typing_sweep_interval_ms: u64,

    /// Пауза после последнего нажатия, после которой отправляется "stopped" (мс)
    pub typing_idle_ms: i64,

    // ============================================
    // СЕТЕВЫЕ ПАРАМЕТРЫ
    // ============================================

    /// Таймаут ожидания подключения сокета (мс)
    pub connect_timeout_ms: u64,

    /// Сколько сообщений истории запрашивать при входе в комнату
    pub history_limit: usize,

    // ============================================
    // ВАЛИДАЦИЯ И ОТОБРАЖЕНИЕ
    // ============================================

    /// Максимальная длина исходящего текста (в символах)
    pub max_message_length: usize,

    /// Максимальное количество вложений в одном сообщении
    pub max_attachments: usize,

    /// Длина превью последнего сообщения в списке комнат
    pub room_preview_chars: usize,

    /// Пространство имён ключей счётчиков непрочитанных
    pub unread_key_namespace: String,
}

impl Config {
    /// Создать конфигурацию с дефолтными значениями
    pub fn new() -> Self {
        Self {
            // Сопоставление
            match_window_secs: 15,
            signature_prefix_chars: 40,
            temp_id_prefix: "local-".to_string(),

            // Typing
            typing_ttl_ms: 2_500,
            typing_sweep_interval_ms: 1_000,
            typing_idle_ms: 1_000,

            // Сеть
            connect_timeout_ms: 8_000,
            history_limit: 100,

            // Валидация и отображение
            max_message_length: 5_000,
            max_attachments: 10,
            room_preview_chars: 80,
            unread_key_namespace: "chat-unread".to_string(),
        }
    }

    /// Создать конфигурацию из переменных окружения
    pub fn from_env() -> Self {
        let mut config = Self::new();

        // Переопределяем значения из env, если они заданы
        if let Ok(val) = std::env::var("CHAT_MATCH_WINDOW_SECS") {
            if let Ok(parsed) = val.parse() {
                config.match_window_secs = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_TYPING_TTL_MS") {
            if let Ok(parsed) = val.parse() {
                config.typing_ttl_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_CONNECT_TIMEOUT_MS") {
            if let Ok(parsed) = val.parse() {
                config.connect_timeout_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_HISTORY_LIMIT") {
            if let Ok(parsed) = val.parse() {
                config.history_limit = parsed;
            }
        }

        config
    }

    /// Окно сопоставления как chrono::Duration
    pub fn match_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.match_window_secs)
    }

    /// Получить глобальный экземпляр конфигурации
    ///
    /// Автоматически инициализирует конфигурацию значениями по умолчанию при первом вызове
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(Config::new)
    }

    /// Инициализировать глобальную конфигурацию из переменных окружения
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_from_env() -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(Self::from_env())
            .map_err(|_| "Config already initialized")
    }

    /// Инициализировать глобальную конфигурацию кастомным экземпляром
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_with(config: Config) -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(config)
            .map_err(|_| "Config already initialized")
    }

    /// Проверить, инициализирована ли глобальная конфигурация
    pub fn is_initialized() -> bool {
        GLOBAL_CONFIG.get().is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
