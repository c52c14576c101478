// Время: часы, разбор и форматирование временных меток

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Источник текущего времени. Движок никогда не зовёт `Utc::now()` напрямую,
/// чтобы окна сопоставления и истечение typing были детерминированы в тестах.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Системные часы
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Ручные часы: клоны разделяют одно и то же значение
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        from_epoch_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_else(Utc::now)
    }
}

pub fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Число из payload: значения меньше 10^11 считаются секундами, остальные миллисекундами
pub fn from_epoch_number(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() < 100_000_000_000 {
        Utc.timestamp_opt(value, 0).single()
    } else {
        from_epoch_millis(value)
    }
}

/// Разобрать строковую метку: RFC 3339, затем наивные форматы (считаются UTC),
/// затем число в строке
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    text.parse::<i64>().ok().and_then(from_epoch_number)
}

/// ISO-представление с миллисекундами и суффиксом Z
pub fn to_iso(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Короткая метка времени для пузыря сообщения, в локальной зоне
pub fn time_label(ts: &DateTime<Utc>) -> String {
    let display = ts.with_timezone(&chrono::Local).format("%l:%M %p").to_string();
    display.trim().to_string()
}
