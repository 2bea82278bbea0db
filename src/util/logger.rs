use log::SetLoggerError;

/// Attempt to install an `env_logger` for the collector.
/// Does nothing if the "builtin_env_logger" feature is disabled; a runtime that
/// brings its own logger disables the feature and registers it before building a heap.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::try_init_from_env(
                // By default, use info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            )
        } else {
            Ok(())
        }
    }
}
