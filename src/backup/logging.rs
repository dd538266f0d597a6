use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use bon::Builder;
use chrono::{Local, NaiveDate};
use function_name::named;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use validator::Validate;

static LOG_FILE_PREFIX: &str = "db_backup";

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_directory")]
    #[builder(default = default_directory(), into)]
    #[getset(get = "pub")]
    directory: PathBuf,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_level")]
    #[builder(default = default_level())]
    #[getset(get_copy = "pub")]
    level: LevelFilter,
}

fn default_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_level() -> LevelFilter {
    LevelFilter::INFO
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LoggingConfig {
    /// `<directory>/db_backup_<YYYYMMDD>.log`
    pub fn log_file_for(&self, date: NaiveDate) -> PathBuf {
        log_file_path(&self.directory, date)
    }
}

pub fn log_file_path<P: AsRef<Path>>(directory: P, date: NaiveDate) -> PathBuf {
    directory
        .as_ref()
        .join(format!("{}_{}.log", LOG_FILE_PREFIX, date.format("%Y%m%d")))
}

/// Where the installed subscriber writes.
#[derive(Clone, Debug, Getters)]
#[getset(get = "pub")]
pub struct LogHandle {
    current_log_file: PathBuf,
}

/// Installs the global subscriber: human readable output on stdout plus the
/// same events, without colors, appended to today's log file.
#[named]
pub fn init_logging(config: &LoggingConfig) -> Result<LogHandle> {
    std::fs::create_dir_all(&config.directory)
        .map_err(|e| {
            Error::configuration(format!(
                "Cannot create log directory {:?}: {e}",
                config.directory
            ))
        })
        .add_fn_name(function_path!())?;

    let current_log_file = config.log_file_for(Local::now().date_naive());
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&current_log_file)
        .map_err(|e| {
            Error::configuration(format!("Cannot open log file {current_log_file:?}: {e}"))
        })
        .add_fn_name(function_path!())?;

    tracing_subscriber::registry()
        .with(config.level)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|e| Error::configuration(format!("Failed to install logger: {e}")))
        .add_fn_name(function_path!())?;

    tracing::info!("Logging to {:?}", current_log_file);
    Ok(LogHandle { current_log_file })
}
