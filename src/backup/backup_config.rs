use crate::backup::backup_class::BackupClass;
use crate::backup::compress::CompressorConfig;
use crate::backup::dump::DumpToolConfig;
use crate::backup::function_path;
use crate::backup::logging::LoggingConfig;
use crate::backup::notifications::NotificationSettings;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, WithMsg};
use crate::backup::retention::RetentionPolicy;
use crate::backup::schedule::ScheduleConfig;
use crate::backup::validate::{validate_file_name_component, validate_writable_dir};
use bon::Builder;
use function_name::named;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use validator::Validate;

static DEFAULT_MYSQL_PORT: u16 = 3306;

/// Root configuration, loaded once at startup and read-only afterwards.
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct BackupConfig {
    #[validate(nested)]
    database: DatabaseConfig,
    #[validate(nested)]
    backup: BackupSettings,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    notification: NotificationSettings,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    logging: LoggingConfig,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    schedule: ScheduleConfig,
}

/// Connection parameters handed to the dump tool.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    #[builder(into)]
    #[getset(get = "pub")]
    host: String,
    #[serde(default = "default_port")]
    #[builder(default = DEFAULT_MYSQL_PORT)]
    #[getset(get_copy = "pub")]
    port: u16,
    #[validate(length(min = 1))]
    #[builder(into)]
    #[getset(get = "pub")]
    user: String,
    #[validate(nested)]
    #[builder(into)]
    #[getset(get = "pub")]
    password: Option<RedactedString>,
    /// Database to dump, also the prefix of every artifact file name
    #[validate(custom(function = validate_file_name_component))]
    #[builder(into)]
    #[getset(get = "pub")]
    name: String,
}

fn default_port() -> u16 {
    DEFAULT_MYSQL_PORT
}

#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct BackupSettings {
    /// Artifacts live in `<destination_root>/<class>/`
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    destination_root: PathBuf,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    dump_tool: DumpToolConfig,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    compressor: CompressorConfig,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    retention: RetentionPolicy,
}

impl BackupSettings {
    pub fn class_dir(&self, class: BackupClass) -> PathBuf {
        self.destination_root.join(class.name())
    }
}

impl BackupConfig {
    /// Reads, parses and validates a YAML configuration file. Every failure
    /// is reported as a configuration error.
    #[named]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        File::open(path)
            .map_err(|e| Error::configuration(format!("Configuration file not found: {path:?}: {e}")))
            .and_then(|f| {
                serde_yml::from_reader::<_, BackupConfig>(f)
                    .map_err(Error::from)
                    .with_msg(format!("Parse YAML config failed: {path:?}"))
            })
            .and_then(|bc| {
                bc.validate()
                    .map_err(Error::from)
                    .map(|_| bc)
                    .with_msg(format!("Config validation failed: {path:?}"))
            })
            .add_fn_name(function_path!())
    }
}
