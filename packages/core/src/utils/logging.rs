// Логирование

/// Установить tracing subscriber с фильтром (например "chatsync_core=debug").
/// Повторный вызов ничего не делает.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging(filter: &str) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

#[cfg(target_arch = "wasm32")]
pub fn init_logging(_filter: &str) {
    crate::wasm::console::init_logging();
}
