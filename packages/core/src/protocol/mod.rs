// Протокол: входящие payload'ы, нормализация, сопоставление и контракты сервисов

pub mod messages;
pub mod normalize;
pub mod signature;
pub mod transport;
pub mod validation;
