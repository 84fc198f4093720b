/// Initializes the logger with the `env_logger` crate.
///
/// The filter comes from `RUST_LOG`; `e32_link=debug` shows every frame and
/// register reply.
pub fn init_logger() {
    env_logger::init();
}

/// Like [`init_logger`], but falls back to `default_filter` when `RUST_LOG`
/// is unset. Safe to call more than once.
pub fn init_logger_with_default(default_filter: &str) {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let _ = env_logger::Builder::from_env(env).try_init();
}
