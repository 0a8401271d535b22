//! Structured logging for training runs.
//!
//! Each process writes one JSON-lines file under the log directory and
//! optionally mirrors it on stderr. Old log files beyond the retention
//! count are removed when a new logger starts.

use std::backtrace::BacktraceStatus;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use invoicify_core::InvoicifyError;
use tracing::{dispatcher, error, warn, Dispatch, Level};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

const LOG_PREFIX: &str = "log_";
const LOG_SUFFIX: &str = ".log";

/// Logger settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub dir: PathBuf,
    /// Number of log files kept, including the current one.
    pub retain: usize,
    pub level: Level,
    /// Mirror records on stderr.
    pub console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            retain: 5,
            level: Level::INFO,
            console: true,
        }
    }
}

impl LogConfig {
    /// Defaults, with the level taken from `APP_ENV`.
    pub fn from_env() -> Self {
        Self {
            level: level_for_env(std::env::var("APP_ENV").ok().as_deref()),
            ..Self::default()
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    pub fn with_retain(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }
}

/// Production deployments log at DEBUG, everything else at INFO.
fn level_for_env(app_env: Option<&str>) -> Level {
    match app_env {
        Some(env) if env.eq_ignore_ascii_case("production") => Level::DEBUG,
        _ => Level::INFO,
    }
}

/// Process-wide log sink.
pub struct Logger {
    dispatch: Dispatch,
    file: Arc<File>,
    path: PathBuf,
}

impl Logger {
    /// Open a fresh log file and build the subscriber stack.
    pub fn new(config: &LogConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.dir)
            .with_context(|| format!("failed to create log directory {}", config.dir.display()))?;

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        let path = config.dir.join(format!("{LOG_PREFIX}{stamp}{LOG_SUFFIX}"));
        let file = Arc::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?,
        );

        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(config.level).into())
            .from_env_lossy();
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(Arc::clone(&file));
        let console_layer = config
            .console
            .then(|| fmt::layer().json().with_writer(std::io::stderr));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(console_layer);

        prune(&config.dir, config.retain.max(1))?;

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
            file,
            path,
        })
    }

    /// Make this logger the global default. Only the first call in a
    /// process succeeds.
    pub fn install(&self) -> anyhow::Result<()> {
        dispatcher::set_global_default(self.dispatch.clone())
            .context("a global logger is already installed")
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Current log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a failure with its category and, when captured, a backtrace.
    pub fn report(&self, err: &anyhow::Error) {
        let (category, level) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<InvoicifyError>())
            .map(|e| (e.category().to_string(), e.level()))
            .unwrap_or_else(|| ("Unknown".to_string(), Level::ERROR));

        let backtrace = err.backtrace();
        let backtrace = (backtrace.status() == BacktraceStatus::Captured)
            .then(|| backtrace.to_string());
        let message = format!("{err:#}");

        dispatcher::with_default(&self.dispatch, || {
            if level == Level::WARN {
                warn!(category = %category, backtrace = ?backtrace, "{message}");
            } else {
                error!(category = %category, backtrace = ?backtrace, "{message}");
            }
        });
    }

    /// Push buffered records to disk.
    pub fn flush(&self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Delete the oldest log files so that at most `retain` remain.
fn prune(dir: &Path, retain: usize) -> anyhow::Result<()> {
    let mut logs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(LOG_PREFIX) && name.ends_with(LOG_SUFFIX))
        })
        .collect();

    // Timestamped names sort chronologically.
    logs.sort();
    let excess = logs.len().saturating_sub(retain);
    for old in &logs[..excess] {
        fs::remove_file(old)
            .with_context(|| format!("failed to remove old log {}", old.display()))?;
    }
    Ok(())
}
