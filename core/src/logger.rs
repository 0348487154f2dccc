use std::env;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for logger initialization
pub struct LoggerConfig {
    /// Log level filter (e.g., "debug", "info", "warn", "error")
    pub level: String,
    pub log_dir: PathBuf,
    pub file_prefix: String,
    pub console_enabled: bool,
    pub file_enabled: bool,
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_dir: PathBuf::from(env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string())),
            file_prefix: env::var("LOG_FILE_PREFIX").unwrap_or_else(|_| "spreadarb".to_string()),
            console_enabled: env_flag("LOG_CONSOLE_ENABLED", true),
            file_enabled: env_flag("LOG_FILE_ENABLED", true),
        }
    }
}

/// Initialize the tracing logger with console and daily-rolling file output.
///
/// # Environment Variables
/// - `LOG_LEVEL`: Log level filter (default: "info"); `RUST_LOG` wins if set
/// - `LOG_DIR`: Directory for log files (default: "./logs")
/// - `LOG_FILE_PREFIX`: Prefix for log file names (default: "spreadarb")
/// - `LOG_CONSOLE_ENABLED`: Enable console logging (default: "true")
/// - `LOG_FILE_ENABLED`: Enable file logging (default: "true")
///
/// The returned `WorkerGuard` must be held for the life of the program;
/// dropping it flushes and closes the log file.
pub fn init_logger() -> WorkerGuard {
    init_logger_with_config(LoggerConfig::default())
}

pub fn init_logger_with_config(mut config: LoggerConfig) -> WorkerGuard {
    if config.file_enabled
        && let Err(e) = std::fs::create_dir_all(&config.log_dir)
    {
        eprintln!(
            "cannot create log dir {}: {e}; file logging disabled",
            config.log_dir.display()
        );
        config.file_enabled = false;
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers = Vec::new();

    if config.console_enabled {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(true)
            .boxed();
        layers.push(console_layer);
    }

    let mut guard = None;
    if config.file_enabled {
        let file_appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_ansi(false)
                .boxed(),
        );
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .init();

    guard.unwrap_or_else(|| {
        let (_, g) = tracing_appender::non_blocking(std::io::sink());
        g
    })
}
