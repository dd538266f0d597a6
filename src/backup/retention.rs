use crate::backup::backup_class::BackupClass;
use crate::backup::compress::CompressorConfig;
use crate::backup::integrity::{IntegrityVerifier, SIDECAR_EXT};
use crate::backup::notifications::{Notifier, ReportTopic, RunOutcome};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::WithMsg;
use bon::Builder;
use chrono::{DateTime, Local, TimeZone};
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use validator::Validate;

/// Number of most recent artifacts kept per class.
///
/// Ad hoc artifacts are never purged unless `ad_hoc` is set.
#[skip_serializing_none]
#[derive(Clone, Debug, Validate, Serialize, Deserialize, PartialEq, Eq, Builder, CopyGetters)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct RetentionPolicy {
    #[serde(default = "default_daily")]
    #[builder(default = default_daily())]
    #[validate(range(min = 1))]
    daily: usize,
    #[serde(default = "default_weekly")]
    #[builder(default = default_weekly())]
    #[validate(range(min = 1))]
    weekly: usize,
    #[serde(default = "default_monthly")]
    #[builder(default = default_monthly())]
    #[validate(range(min = 1))]
    monthly: usize,
    #[validate(range(min = 1))]
    ad_hoc: Option<usize>,
}

fn default_daily() -> usize {
    7
}

fn default_weekly() -> usize {
    4
}

fn default_monthly() -> usize {
    12
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetentionPolicy {
    pub fn keep_count(&self, class: BackupClass) -> Option<usize> {
        match class {
            BackupClass::Daily => Some(self.daily),
            BackupClass::Weekly => Some(self.weekly),
            BackupClass::Monthly => Some(self.monthly),
            BackupClass::AdHoc => self.ad_hoc,
        }
    }
}

#[derive(Clone, Hash, Eq, PartialEq)]
pub struct ItemWithDateTime<R, T: TimeZone> {
    pub item: R,
    pub date_time: DateTime<T>,
}

impl<R, T: TimeZone> From<(R, DateTime<T>)> for ItemWithDateTime<R, T> {
    fn from(value: (R, DateTime<T>)) -> Self {
        Self {
            item: value.0,
            date_time: value.1,
        }
    }
}

impl<R: Debug, T: TimeZone> Debug for ItemWithDateTime<R, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}@{:?}", self.item, self.date_time)
    }
}

/// What a cleanup pass removed and what it failed to remove.
#[derive(Clone, Debug, Default, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct CleanupReport {
    deleted: Vec<PathBuf>,
    failed: Vec<PathBuf>,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

pub struct RetentionManager {
    destination_root: PathBuf,
    artifact_exts: Vec<String>,
    notifier: Arc<Notifier>,
}

impl RetentionManager {
    /// Files ending in any extension a compressor can produce count as
    /// artifacts, so switching compressors leaves older artifacts managed.
    pub fn new<P: Into<PathBuf>>(destination_root: P, notifier: Arc<Notifier>) -> Self {
        Self {
            destination_root: destination_root.into(),
            artifact_exts: CompressorConfig::all_artifact_exts(),
            notifier,
        }
    }

    fn is_artifact(&self, path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    !name.ends_with(&format!(".{SIDECAR_EXT}"))
                        && self
                            .artifact_exts
                            .iter()
                            .any(|ext| name.ends_with(&format!(".{ext}")))
                })
    }

    /// Artifacts of `class`, oldest first. A missing class directory means
    /// no artifacts.
    pub fn list_artifacts(
        &self,
        class: BackupClass,
    ) -> Result<Vec<ItemWithDateTime<PathBuf, Local>>> {
        let dir = self.destination_root.join(class.name());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::storage(format!("Failed to list {dir:?}: {e}")));
            }
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| Error::storage(format!("Failed to list {dir:?}: {e}")))?
                .path();
            if !self.is_artifact(&path) {
                continue;
            }
            let modified = std::fs::metadata(&path)
                .and_then(|md| md.modified())
                .map_err(|e| Error::storage(format!("Failed to stat {path:?}: {e}")))?;
            artifacts.push(ItemWithDateTime::from((path, DateTime::<Local>::from(modified))));
        }

        Ok(artifacts
            .into_iter()
            .sorted_by(|a, b| {
                a.date_time
                    .cmp(&b.date_time)
                    .then_with(|| a.item.cmp(&b.item))
            })
            .collect())
    }

    /// Applies `policy` to every class that has a keep count. Deletion
    /// failures of single artifacts are logged and reported; failing to list
    /// a class is an error, reported through the notifier and returned.
    pub fn cleanup(&self, policy: &RetentionPolicy) -> Result<CleanupReport> {
        info!("Starting backup cleanup...");
        let mut report = CleanupReport::default();
        let mut errors = Vec::new();

        for class in BackupClass::ALL {
            let Some(keep) = policy.keep_count(class) else {
                continue;
            };
            match self.cleanup_class(class, keep) {
                Ok(class_report) => report.merge(class_report),
                Err(e) => {
                    error!("Cleanup of {} backups failed: {}", class, e);
                    errors.push(e.with_msg(format!("Cleanup of {class} backups failed")));
                }
            }
        }

        match convert_error_vec(errors) {
            Ok(()) => {
                info!(
                    "Backup cleanup completed: {} deleted, {} failed",
                    report.deleted.len(),
                    report.failed.len()
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(notify_err) = self
                    .notifier
                    .send_outcome(ReportTopic::Cleanup, RunOutcome::failure(&e, None))
                {
                    error!("Failed to deliver cleanup failure notification: {notify_err}");
                }
                Err(e)
            }
        }
    }

    /// Keeps the `keep` most recent artifacts of `class` and deletes the
    /// rest, each sidecar before its artifact.
    pub fn cleanup_class(&self, class: BackupClass, keep: usize) -> Result<CleanupReport> {
        let artifacts = self.list_artifacts(class)?;
        info!(
            "Cleaning up {} backups: {} present, keeping {}",
            class,
            artifacts.len(),
            keep
        );

        let mut report = CleanupReport::default();
        let excess = artifacts.len().saturating_sub(keep);
        for candidate in artifacts.into_iter().take(excess) {
            match delete_artifact(&candidate.item) {
                Ok(()) => {
                    info!("Deleted old backup: {:?}", candidate.item);
                    report.deleted.push(candidate.item);
                }
                Err(e) => {
                    error!("Failed to delete old backup {:?}: {}", candidate.item, e);
                    report.failed.push(candidate.item);
                }
            }
        }
        Ok(report)
    }
}

fn delete_artifact(path: &Path) -> Result<()> {
    let sidecar = IntegrityVerifier::sidecar_path(path);
    match std::fs::remove_file(&sidecar) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("Deleting {:?} which has no checksum file", path);
        }
        Err(e) => {
            return Err(Error::storage(format!(
                "Failed to delete checksum file {sidecar:?}: {e}"
            )))
        }
    }
    std::fs::remove_file(path)
        .map_err(|e| Error::storage(format!("Failed to delete backup {path:?}: {e}")))
}
