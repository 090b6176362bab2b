//! Logging setup for the oracle node binaries.
//!
//! Output is configured from `ORAKL_LOG_*` environment variables (a `.env` file is honored).
//! Level filtering always follows `RUST_LOG`, defaulting to `info`.

use dotenvy::dotenv;
use std::{env, io::stdout, path::PathBuf, str::FromStr};
use strum::{Display, EnumString};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    filter::LevelFilter, fmt, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// A boxed layer for tracing
pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Line format of a log sink.
#[derive(EnumString, Display, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// How often the log file is rolled over.
#[derive(EnumString, Display, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum LogRotation {
    /// Single file.
    #[default]
    Never,
    /// New file every hour.
    Hourly,
    /// New file every day.
    Daily,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Never => Self::NEVER,
            LogRotation::Hourly => Self::HOURLY,
            LogRotation::Daily => Self::DAILY,
        }
    }
}

/// File sink settings. Only present when `ORAKL_LOG_FILE` names a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSink {
    /// Directory holding the log files.
    pub dir: PathBuf,
    /// File name, suffixed with a timestamp when rotating.
    pub name: String,
    /// Line format, `json` unless overridden.
    pub format: LogFormat,
    /// Rollover schedule.
    pub rotation: LogRotation,
}

/// Parsed logging options.
///
/// | variable                  | default | values             |
/// |---------------------------|---------|--------------------|
/// | `ORAKL_LOG_FORMAT_STDOUT` | text    | text, json         |
/// | `ORAKL_LOG_FILE`          | unset   | file name          |
/// | `ORAKL_LOG_DIR`           | `.`     | directory          |
/// | `ORAKL_LOG_FORMAT_FILE`   | json    | text, json         |
/// | `ORAKL_LOG_ROTATION`      | never   | never, hourly, daily |
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Format of the stdout sink, which is always enabled.
    pub stdout: LogFormat,
    /// Optional file sink.
    pub file: Option<FileSink>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { stdout: LogFormat::Text, file: None }
    }
}

impl LogConfig {
    /// Read the options from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }

        let file = lookup("ORAKL_LOG_FILE").filter(|name| !name.trim().is_empty()).map(|name| {
            FileSink {
                dir: lookup("ORAKL_LOG_DIR").map_or_else(|| PathBuf::from("."), PathBuf::from),
                name,
                format: parsed(lookup("ORAKL_LOG_FORMAT_FILE"), LogFormat::Json),
                rotation: parsed(lookup("ORAKL_LOG_ROTATION"), LogRotation::Never),
            }
        });

        Self { stdout: parsed(lookup("ORAKL_LOG_FORMAT_STDOUT"), LogFormat::Text), file }
    }

    /// Install the global subscriber. Every returned guard must outlive logging: dropping one
    /// flushes and stops its background writer.
    pub fn init(&self) -> eyre::Result<Vec<WorkerGuard>> {
        let (writer, guard) = tracing_appender::non_blocking(stdout());
        let mut guards = vec![guard];
        let mut layers = vec![self.stdout.layer(writer)];

        if let Some(sink) = &self.file {
            let appender = RollingFileAppender::new(sink.rotation.into(), &sink.dir, &sink.name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            layers.push(sink.format.layer(writer));
        }

        tracing_subscriber::registry().with(layers).try_init()?;

        tracing::info!(
            stdout = %self.stdout,
            file = ?self.file.as_ref().map(|sink| sink.dir.join(&sink.name)),
            file_format = ?self.file.as_ref().map(|sink| sink.format),
            rotation = ?self.file.as_ref().map(|sink| sink.rotation),
            rust_log = env::var("RUST_LOG").unwrap_or_default(),
            "logging initialized"
        );

        Ok(guards)
    }
}

impl LogFormat {
    fn layer(self, writer: NonBlocking) -> BoxedLayer<Registry> {
        let filter =
            EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();
        let layer = fmt::layer().with_span_events(FmtSpan::CLOSE).with_writer(writer);
        match self {
            Self::Json => layer.json().with_filter(filter).boxed(),
            Self::Text => layer.with_target(true).with_filter(filter).boxed(),
        }
    }
}

/// Load `.env`, then configure logging from the environment.
pub fn init_logging() -> eyre::Result<Vec<WorkerGuard>> {
    dotenv().ok();
    LogConfig::from_env().init()
}
