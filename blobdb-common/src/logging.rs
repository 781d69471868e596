//! Logging bootstrap: build a `slog::Logger` and install it as the
//! `slog_scope` global so every crate can log via the
//! `info!`/`warn!`/`error!` macros without threading a logger handle
//! through every function signature.

use slog::{o, Drain};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    fn to_slog(self) -> slog::Level {
        match self {
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warn => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Render structured JSON (for machine ingestion) instead of
    /// human-readable terminal output.
    pub json: bool,
}

/// Build a logger for the given config. Does not install a global; callers
/// that want `slog_scope`-style ambient logging should pair this with
/// [`install_global`].
pub fn build_logger(config: &LoggingConfig) -> slog::Logger {
    let level = config.level.to_slog();
    if config.json {
        let drain = slog_json_drain();
        let drain = slog::LevelFilter::new(drain, level).fuse();
        slog::Logger::root(drain, o!("component" => "blobdb"))
    } else {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let drain = slog::LevelFilter::new(drain, level).fuse();
        slog::Logger::root(drain, o!("component" => "blobdb"))
    }
}

// A minimal JSON drain over stdout, used when LoggingConfig::json is set.
fn slog_json_drain() -> impl Drain<Ok = (), Err = slog::Never> {
    slog_async::Async::new(
        slog_json::Json::new(std::io::stdout())
            .add_default_keys()
            .build()
            .fuse(),
    )
    .build()
    .fuse()
}

/// Build a logger and install it as the `slog_scope` global, returning the
/// guard that keeps it installed; the caller must hold the guard for the
/// lifetime of the process.
pub fn init(config: &LoggingConfig) -> slog_scope::GlobalLoggerGuard {
    slog_scope::set_global_logger(build_logger(config))
}
