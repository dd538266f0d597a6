//! Process wide wiring, built once per invocation and handed to whichever
//! action the command line selected.

use crate::backup::backup_class::BackupClass;
use crate::backup::backup_config::BackupConfig;
use crate::backup::executor::BackupExecutor;
use crate::backup::function_path;
use crate::backup::logging::LogHandle;
use crate::backup::notifications::Notifier;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::{AddFunctionName, WithMsg};
use crate::backup::retention::RetentionManager;
use crate::backup::schedule::{JobRunner, Scheduler};
use clap::Subcommand;
use function_name::named;
use getset::Getters;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// What one invocation does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Subcommand)]
pub enum Action {
    /// Run a single backup of the given class
    Run {
        #[arg(value_enum)]
        class: BackupClass,
    },
    /// Run daily, weekly and monthly backups once
    RunAll,
    /// Apply the retention policy once
    Cleanup,
    /// Run the scheduler until interrupted
    Daemon,
    /// Send a test notification
    TestNotification,
}

#[derive(Getters)]
#[getset(get = "pub")]
pub struct BackupContext {
    config: Arc<BackupConfig>,
    notifier: Arc<Notifier>,
    executor: BackupExecutor,
    retention: RetentionManager,
    stop: Arc<AtomicBool>,
}

impl BackupContext {
    pub fn init(config: BackupConfig, log_handle: Option<&LogHandle>) -> Self {
        let config = Arc::new(config);
        let notifier = Arc::new(Notifier::from_settings(
            config.notification(),
            log_handle.map(|h| h.current_log_file().clone()),
        ));
        Self::with_notifier(config, notifier)
    }

    pub fn with_notifier(config: Arc<BackupConfig>, notifier: Arc<Notifier>) -> Self {
        let executor = BackupExecutor::new(config.clone(), notifier.clone());
        let retention =
            RetentionManager::new(config.backup().destination_root().clone(), notifier.clone());
        Self {
            config,
            notifier,
            executor,
            retention,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asks a running daemon to stop after its current job.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn execute(&self, action: Action) -> Result<()> {
        match action {
            Action::Run { class } => self.executor.run(class).map(|_| ()),
            Action::RunAll => self.run_all(),
            Action::Cleanup => self.cleanup(),
            Action::Daemon => self.daemon(),
            Action::TestNotification => self.notifier.send_test(),
        }
    }

    /// Every scheduled class once, in order. A failed class does not stop
    /// the following ones.
    fn run_all(&self) -> Result<()> {
        let errors = BackupClass::SCHEDULED
            .iter()
            .filter_map(|class| {
                self.executor
                    .run(*class)
                    .err()
                    .map(|e| e.with_msg(format!("{} backup failed", class.label())))
            })
            .collect::<Vec<_>>();
        convert_error_vec(errors)
    }

    #[named]
    fn daemon(&self) -> Result<()> {
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, self.stop.clone())
                .map_err(Error::from)
                .with_msg(format!("Failed to register handler for signal {signal}"))
                .add_fn_name(function_path!())?;
        }
        info!("Starting backup daemon");
        let res = Scheduler::new(self, self.config.schedule().clone(), self.stop.clone()).run();
        info!("Backup daemon stopped");
        res
    }
}

impl JobRunner for BackupContext {
    fn backup(&self, class: BackupClass) -> Result<()> {
        self.executor.run(class).map(|_| ())
    }

    fn cleanup(&self) -> Result<()> {
        let report = self.retention.cleanup(self.config.backup().retention())?;
        if !report.failed().is_empty() {
            error!(
                "Could not delete {} old backups: {:?}",
                report.failed().len(),
                report.failed()
            );
        }
        Ok(())
    }

    fn report_crash(&self, error: &Error) {
        if let Err(e) = self.notifier.send_scheduler_crash(error) {
            error!("Failed to deliver scheduler crash notification: {}", e);
        }
    }
}
