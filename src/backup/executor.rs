//! One backup run, from dump to published and verified artifact.
//!
//! A run dumps into a hidden scratch directory under the destination root,
//! seals the dump with a checksum sidecar, then moves both into the class
//! directory. Artifacts in a class directory are therefore always complete.

use crate::backup::backup_class::BackupClass;
use crate::backup::backup_config::BackupConfig;
use crate::backup::function_path;
use crate::backup::integrity::{IntegrityVerifier, Verification};
use crate::backup::notifications::{Notifier, ReportTopic, RunOutcome};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, WithMsg};
use bon::Builder;
use chrono::{DateTime, Local};
use function_name::named;
use getset::{CopyGetters, Getters};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

static SCRATCH_DIR_PREFIX: &str = ".db_backup_tmp_";

/// A published backup file.
#[derive(Clone, Debug, PartialEq, Eq, Builder, Getters, CopyGetters)]
pub struct BackupArtifact {
    #[getset(get_copy = "pub")]
    class: BackupClass,
    #[builder(into)]
    #[getset(get = "pub")]
    path: PathBuf,
    #[getset(get = "pub")]
    created_at: DateTime<Local>,
    #[getset(get_copy = "pub")]
    size_bytes: u64,
    #[builder(into)]
    #[getset(get = "pub")]
    checksum: String,
}

/// Check applied to an artifact once it sits in its class directory.
type ConfirmFn = fn(&Path) -> Result<Verification>;

pub struct BackupExecutor {
    config: Arc<BackupConfig>,
    notifier: Arc<Notifier>,
    class_locks: HashMap<BackupClass, Mutex<()>>,
    confirm: ConfirmFn,
}

impl BackupExecutor {
    pub fn new(config: Arc<BackupConfig>, notifier: Arc<Notifier>) -> Self {
        Self {
            config,
            notifier,
            class_locks: BackupClass::ALL
                .iter()
                .map(|class| (*class, Mutex::new(())))
                .collect(),
            confirm: |path| IntegrityVerifier::verify(path),
        }
    }

    #[cfg(test)]
    fn with_confirm(mut self, confirm: ConfirmFn) -> Self {
        self.confirm = confirm;
        self
    }

    /// Runs one backup of `class` and reports the outcome.
    ///
    /// Runs of the same class are serialized. A failed notification never
    /// changes the result of the run.
    pub fn run(&self, class: BackupClass) -> Result<BackupArtifact> {
        let _guard = match self.class_locks.get(&class).map(Mutex::lock) {
            Some(Ok(guard)) => Some(guard),
            // A panicked run holds no state worth protecting.
            Some(Err(poisoned)) => Some(poisoned.into_inner()),
            None => None,
        };

        let started = Instant::now();
        let now = Local::now();
        let class_dir = self.config.backup().class_dir(class);
        let file_name = class.artifact_file_name(
            self.config.database().name(),
            &now,
            &self.config.backup().compressor().artifact_ext(),
        );
        let final_path = class_dir.join(&file_name);
        info!("Starting {} backup to {:?}", class, final_path);

        let res = self.produce(class, now, &class_dir, &file_name);
        let report = match &res {
            Ok(artifact) => {
                info!(
                    "{} backup completed: {:?} ({} bytes)",
                    class.label(),
                    artifact.path(),
                    artifact.size_bytes()
                );
                self.notifier.send_outcome(
                    ReportTopic::Backup(class),
                    RunOutcome::success(artifact, started.elapsed()),
                )
            }
            Err(e) => {
                error!("{} backup failed: {}", class.label(), e);
                self.notifier.send_outcome(
                    ReportTopic::Backup(class),
                    RunOutcome::failure(e, Some(&final_path)),
                )
            }
        };
        if let Err(e) = report {
            warn!("Could not report {} backup outcome: {}", class, e);
        }
        res
    }

    #[named]
    fn produce(
        &self,
        class: BackupClass,
        created_at: DateTime<Local>,
        class_dir: &Path,
        file_name: &str,
    ) -> Result<BackupArtifact> {
        let backup = self.config.backup();
        std::fs::create_dir_all(class_dir)
            .map_err(|e| Error::storage(format!("Failed to create {class_dir:?}: {e}")))
            .add_fn_name(function_path!())?;

        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_DIR_PREFIX)
            .tempdir_in(backup.destination_root())
            .map_err(|e| {
                Error::storage(format!(
                    "Failed to create scratch directory in {:?}: {e}",
                    backup.destination_root()
                ))
            })
            .add_fn_name(function_path!())?;
        let scratch_path = scratch.path().join(file_name);

        backup
            .dump_tool()
            .dump_to(self.config.database(), backup.compressor(), &scratch_path)
            .add_fn_name(function_path!())?;

        let checksum = IntegrityVerifier::compute_checksum(&scratch_path)
            .add_fn_name(function_path!())?;
        let scratch_sidecar = IntegrityVerifier::persist_checksum(&scratch_path, &checksum)
            .add_fn_name(function_path!())?;
        let size_bytes = std::fs::metadata(&scratch_path)
            .map(|m| m.len())
            .map_err(Error::from)
            .add_fn_name(function_path!())?;

        let final_path = class_dir.join(file_name);
        Self::publish(&scratch_path, &scratch_sidecar, &final_path)
            .add_fn_name(function_path!())?;

        let verification = (self.confirm)(&final_path).add_fn_name(function_path!())?;
        if !verification.valid {
            return Err(Error::integrity(format!(
                "Published backup {final_path:?} failed verification: {}",
                verification.reason
            )))
            .add_fn_name(function_path!());
        }

        Ok(BackupArtifact::builder()
            .class(class)
            .path(final_path)
            .created_at(created_at)
            .size_bytes(size_bytes)
            .checksum(checksum)
            .build())
    }

    /// Moves the artifact, then its sidecar, out of the scratch directory.
    #[named]
    fn publish(scratch_path: &Path, scratch_sidecar: &Path, final_path: &Path) -> Result<()> {
        std::fs::rename(scratch_path, final_path)
            .map_err(|e| {
                Error::storage(format!(
                    "Failed to move {scratch_path:?} to {final_path:?}: {e}"
                ))
            })
            .add_fn_name(function_path!())?;

        let final_sidecar = IntegrityVerifier::sidecar_path(final_path);
        std::fs::rename(scratch_sidecar, &final_sidecar)
            .map_err(|e| {
                Error::storage(format!(
                    "Failed to move {scratch_sidecar:?} to {final_sidecar:?}: {e}"
                ))
            })
            .with_msg(format!("Artifact {final_path:?} published without checksum"))
            .add_fn_name(function_path!())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backup::backup_config::{BackupSettings, DatabaseConfig};
    use crate::backup::compress::CompressorConfig;
    use crate::backup::dump::test_support::fake_dump_tool;
    use crate::backup::dump::DumpToolConfig;
    use crate::backup::notifications::test_support::{RecordingTransport, UnreachableTransport};
    use crate::backup::notifications::Outcome;
    use crate::backup::result_error::error::ErrorKind;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    fn config(dir: &TempDir, program: PathBuf, compressor: CompressorConfig) -> Arc<BackupConfig> {
        Arc::new(
            BackupConfig::builder()
                .database(
                    DatabaseConfig::builder()
                        .host("localhost")
                        .user("backup")
                        .name("shop")
                        .build(),
                )
                .backup(
                    BackupSettings::builder()
                        .destination_root(dir.path().join("backups"))
                        .dump_tool(DumpToolConfig::builder().program(program).build())
                        .compressor(compressor)
                        .build(),
                )
                .build(),
        )
    }

    fn leftover_entries(root: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(SCRATCH_DIR_PREFIX))
            })
            .collect()
    }

    #[test]
    fn test_successful_run_publishes_verified_artifact() {
        let dir = TempDir::new().unwrap();
        let tool = fake_dump_tool(dir.path(), "dump.sh", "echo 'CREATE TABLE t (id INT);'");
        let config = config(&dir, tool, CompressorConfig::default());
        let transport = RecordingTransport::default();
        let executor = BackupExecutor::new(
            config.clone(),
            Arc::new(Notifier::new(transport.clone(), false, None)),
        );

        let artifact = executor.run(BackupClass::Daily).unwrap();

        assert_eq!(artifact.class(), BackupClass::Daily);
        assert!(artifact.path().starts_with(dir.path().join("backups").join("daily")));
        let file_name = artifact.path().file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("shop_daily_"));
        assert!(file_name.ends_with(".sql.gz"));
        assert!(IntegrityVerifier::verify(artifact.path()).unwrap().valid);
        assert_eq!(
            std::fs::read_to_string(IntegrityVerifier::sidecar_path(artifact.path())).unwrap(),
            artifact.checksum().as_str()
        );
        assert_eq!(
            artifact.size_bytes(),
            std::fs::metadata(artifact.path()).unwrap().len()
        );

        let mut content = String::new();
        flate2::read::GzDecoder::new(std::fs::File::open(artifact.path()).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "CREATE TABLE t (id INT);\n");

        assert!(leftover_entries(&dir.path().join("backups")).is_empty());
        let sent = transport.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome(), Outcome::Success);
        assert!(sent[0].subject().contains("Daily Backup Successful"));
    }

    #[test]
    fn test_failed_dump_publishes_nothing() {
        let dir = TempDir::new().unwrap();
        let tool = fake_dump_tool(dir.path(), "dump.sh", "echo partial; exit 2");
        let config = config(&dir, tool, CompressorConfig::None);
        let transport = RecordingTransport::default();
        let executor = BackupExecutor::new(
            config,
            Arc::new(Notifier::new(transport.clone(), false, None)),
        );

        let err = executor.run(BackupClass::Weekly).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackupProcess);

        let weekly = dir.path().join("backups").join("weekly");
        assert_eq!(std::fs::read_dir(&weekly).unwrap().count(), 0);
        assert!(leftover_entries(&dir.path().join("backups")).is_empty());

        let sent = transport.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome(), Outcome::Failure);
        assert!(sent[0].subject().contains("Weekly Backup Failed"));
        assert!(sent[0].body().contains("Attempted backup file:"));
    }

    #[test]
    fn test_stderr_output_fails_run() {
        let dir = TempDir::new().unwrap();
        let tool = fake_dump_tool(
            dir.path(),
            "dump.sh",
            "echo data; echo \"mysqldump: Got error: 2003: Can't connect\" >&2",
        );
        let executor = BackupExecutor::new(
            config(&dir, tool, CompressorConfig::None),
            Arc::new(Notifier::disabled()),
        );

        let err = executor.run(BackupClass::Monthly).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(
            std::fs::read_dir(dir.path().join("backups").join("monthly"))
                .unwrap()
                .count(),
            0
        );
    }

    #[test]
    fn test_failed_confirmation_keeps_published_files() {
        let dir = TempDir::new().unwrap();
        let tool = fake_dump_tool(dir.path(), "dump.sh", "echo ok");
        let transport = RecordingTransport::default();
        let executor = BackupExecutor::new(
            config(&dir, tool, CompressorConfig::None),
            Arc::new(Notifier::new(transport.clone(), false, None)),
        )
        .with_confirm(|path| {
            // corrupted between publish and confirmation
            std::fs::OpenOptions::new()
                .append(true)
                .open(path)?
                .write_all(b"garbage")?;
            IntegrityVerifier::verify(path)
        });

        let err = executor.run(BackupClass::Daily).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);

        let daily = dir.path().join("backups").join("daily");
        let mut kept = std::fs::read_dir(&daily)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        kept.sort();
        assert_eq!(kept.len(), 2);
        assert!(kept[0].ends_with(".sql"));
        assert!(kept[1].ends_with(".sql.sha256"));

        let sent = transport.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome(), Outcome::Failure);
        assert!(sent[0].subject().contains("Daily Backup Failed"));
    }

    #[test]
    fn test_notification_failure_does_not_fail_run() {
        let dir = TempDir::new().unwrap();
        let tool = fake_dump_tool(dir.path(), "dump.sh", "echo ok");
        let executor = BackupExecutor::new(
            config(&dir, tool, CompressorConfig::None),
            Arc::new(Notifier::new(UnreachableTransport, false, None)),
        );

        let artifact = executor.run(BackupClass::AdHoc).unwrap();
        assert!(artifact.path().to_string_lossy().ends_with(".sql"));
        assert!(artifact.path().exists());
    }
}
