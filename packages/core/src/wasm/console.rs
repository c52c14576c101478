// Вывод в консоль браузера

use std::sync::Once;

static INIT: Once = Once::new();

/// Панические сообщения в console.error; повторный вызов ничего не делает
pub fn init_logging() {
    INIT.call_once(|| {
        console_error_panic_hook::set_once();
        log("chatsync core initialized");
    });
}

pub fn log(message: &str) {
    web_sys::console::log_1(&message.into());
}

pub fn error(message: &str) {
    web_sys::console::error_1(&message.into());
}
