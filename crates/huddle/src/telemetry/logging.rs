//! Process-wide `tracing` setup for applications that embed huddle. The library itself
//! only emits events; nothing in it installs a subscriber on its own.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const OWN_TARGETS: &[&str] = &["huddle", "huddle_core", "room_log"];

#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Verbosity of huddle's own targets.
    pub level: LevelFilter,
    /// Raw `EnvFilter` directives. When set they replace everything derived from
    /// `level`.
    pub filter: Option<String>,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
    /// Let `webrtc`, `redis` and friends log below `info` when `level` is debug or
    /// trace.
    pub trace_dependencies: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
            filter: None,
            file: None,
            trace_dependencies: false,
        }
    }
}

impl LogConfig {
    /// Reads `HUDDLE_LOG_LEVEL`, `HUDDLE_LOG_FILTER`, `HUDDLE_LOG_FILE` and
    /// `HUDDLE_TRACE_DEPS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let defaults = Self::default();
        Self {
            level: value("HUDDLE_LOG_LEVEL")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.level),
            filter: value("HUDDLE_LOG_FILTER"),
            file: value("HUDDLE_LOG_FILE").map(PathBuf::from),
            trace_dependencies: value("HUDDLE_TRACE_DEPS")
                .is_some_and(|raw| raw != "0" && !raw.eq_ignore_ascii_case("false")),
        }
    }

    /// The `EnvFilter` directives this config installs. Below `debug` a single level
    /// applies everywhere; at `debug` and `trace` dependencies stay at `info` unless
    /// `trace_dependencies` is set.
    pub fn directives(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        let level = self.level.to_string().to_ascii_lowercase();
        if self.level <= LevelFilter::INFO || self.trace_dependencies {
            return level;
        }
        let mut directives = vec!["info".to_string()];
        directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={level}")));
        directives.join(",")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("a global tracing subscriber is already installed")]
    SubscriberExists,
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Once it has succeeded, later calls return `Ok`
/// without changing anything.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let directives = config.directives();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&directives))
        .with_target(config.filter.is_some() || config.level >= LevelFilter::DEBUG)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|_| InitError::SubscriberExists)?;

    let _ = GUARD.set(guard);
    tracing::debug!(target: "huddle::telemetry", %directives, "logging initialised");
    Ok(())
}
