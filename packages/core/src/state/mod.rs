// Состояние чата: сверка сообщений, outbox, набор текста, группировка

pub mod app;
pub mod commands;
pub mod conversations;
pub mod grouping;
pub mod outbox;
pub mod typing;
