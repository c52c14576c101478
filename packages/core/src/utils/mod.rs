// Вспомогательные модули

pub mod b64;
pub mod digest;
pub mod error;
pub mod logging;
pub mod time;
pub mod uuid;
