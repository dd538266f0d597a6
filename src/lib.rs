//! # db-backup
//!
//! Scheduled, integrity-verified MySQL backups with per-class retention and
//! email reporting.
//!
//! ## Features
//!
//! - **Backup Classes**: Daily, weekly, monthly and ad hoc artifacts, each in its own directory
//! - **Integrity**: SHA-256 sidecar written before publish and re-verified after
//! - **Atomic Publish**: Dumps land in a scratch directory and are renamed into place
//! - **Compression**: Gzip (default) or XZ with parallel processing
//! - **Retention Management**: Keep the N most recent artifacts per class
//! - **Notifications**: SMTP reports for every run, optionally with the log attached
//! - **Daemon Mode**: Cron-based scheduler with graceful shutdown on SIGINT/SIGTERM
//!
//! ## Quick Start
//!
//! ```no_run
//! use db_backup::backup::backup_config::BackupConfig;
//! use db_backup::backup::context::{Action, BackupContext};
//! use db_backup::backup::logging::init_logging;
//!
//! let config = BackupConfig::load("config.yml")?;
//! let log_handle = init_logging(config.logging())?;
//!
//! // Run the scheduler until interrupted
//! BackupContext::init(config, Some(&log_handle)).execute(Action::Daemon)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
