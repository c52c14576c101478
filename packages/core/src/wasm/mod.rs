// Привязки для браузера: сокет и HTTP остаются на стороне JS,
// движок получает результаты их работы через функции bindings

pub mod bindings;
pub mod console;
