use crate::config::{ensure_private_dir, get_logs_dir};
use crate::error::IngestResult;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex, Once};
use tracing_subscriber::{
    fmt::{self},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub const LOG_FILE_PREFIX: &str = "cloud-ingest.log";

/// How `init_logging` sets up the subscriber
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Filter directive used when `RUST_LOG` is unset, `info` otherwise
    pub level: Option<String>,
    /// Also write a daily-rolling log file
    pub file: bool,
    /// Overrides `~/.cloud-ingest/logs`
    pub logs_dir: Option<PathBuf>,
}

static LOGGER_INITIALIZED: Once = Once::new();

// Keep the guard alive for the lifetime of the program
static FILE_APPENDER_GUARD: LazyLock<Mutex<Option<tracing_appender::non_blocking::WorkerGuard>>> =
    LazyLock::new(|| Mutex::new(None));

fn env_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")))
}

/// Install the global subscriber. Later calls do nothing.
pub fn init_logging(options: LogOptions) -> IngestResult<()> {
    let logs_dir = if options.file {
        let dir = match options.logs_dir.clone() {
            Some(dir) => dir,
            None => get_logs_dir()?,
        };
        ensure_private_dir(&dir)?;
        Some(dir)
    } else {
        None
    };

    LOGGER_INITIALIZED.call_once(|| {
        let level = options.level.as_deref();

        // Console goes to stderr so stdout stays machine-readable
        let console_layer = fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_filter(env_filter(level));

        let file_layer = logs_dir.map(|dir| {
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            if let Ok(mut guard_mutex) = FILE_APPENDER_GUARD.lock() {
                *guard_mutex = Some(guard);
            }

            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter(level))
        });

        // A subscriber installed elsewhere (tests, embedding apps) wins
        let _ = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init();
    });

    Ok(())
}
