//! Logging setup plan for the `tilefuse` binary.
//!
//! Everything here is decided before a subscriber exists, so failures are
//! carried as values and reported once the console layer is up.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime logs every graph optimization pass at info level.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "tilefuse";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    /// Prepended to implicit filters; `None` or blank disables it.
    pub noise_filter: Option<String>,
    /// Rotated files kept on disk; 0 means the default.
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: Some(DEFAULT_NOISE_FILTER.to_string()),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

/// Where the user-facing part of the filter came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    CliFlag,
    Verbosity,
    RustLogEnv,
    Default,
}

impl FilterSource {
    /// Only filters the user typed out are installed verbatim.
    pub fn is_explicit(self) -> bool {
        matches!(self, Self::CliFlag | Self::Verbosity)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CliFlag => "--log-filter",
            Self::Verbosity => "--verbose",
            Self::RustLogEnv => "RUST_LOG",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub source: FilterSource,
    /// The filter the user asked for, before noise suppression.
    pub user_filter: String,
    /// What the subscriber installs on both sinks.
    pub effective_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    /// Console-only logging; `log_dir` is set when a directory was tried.
    Fallback {
        log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback { log_dir, .. } => log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Fallback { reason, .. } => Some(reason),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Daily-rotated log files under `<data_dir>/logs`, or the reason there are none.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            log_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            log_dir: Some(log_dir),
            reason: format!("cannot create log directory: {error}"),
        };
    }

    let retention_files = match options.retention_files {
        0 => DEFAULT_LOG_RETENTION_FILES,
        n => n,
    };
    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::Fallback {
            log_dir: Some(log_dir),
            reason: format!("cannot open rolling log file: {error}"),
        },
    }
}

/// Precedence: `--log-filter`, then `-vv`/`-v`, then `RUST_LOG`, then the default.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let (source, user_filter) = if let Some(filter) = options.cli_log_filter.as_deref() {
        (FilterSource::CliFlag, filter.to_string())
    } else if options.verbose > 0 {
        let level = if options.verbose >= 2 { "trace" } else { "debug" };
        (FilterSource::Verbosity, level.to_string())
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        (FilterSource::RustLogEnv, filter.to_string())
    } else {
        (FilterSource::Default, options.default_log_filter.clone())
    };

    let noise = options
        .noise_filter
        .as_deref()
        .map(str::trim)
        .filter(|noise| !noise.is_empty() && !source.is_explicit());
    let effective_filter = match noise {
        Some(noise) => format!("{noise},{user_filter}"),
        None => user_filter.clone(),
    };

    LoggingFilterPlan {
        source,
        user_filter,
        effective_filter,
    }
}
