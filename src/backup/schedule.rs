//! The daemon loop.
//!
//! Four cron triggers (daily, weekly and monthly backups plus the retention
//! cleanup) are evaluated on a fixed polling interval. Due jobs run one at a
//! time on the calling thread, so no two backups ever overlap.

use crate::backup::backup_class::BackupClass;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::validate::validate_cron_str;
use bon::Builder;
use chrono::{DateTime, Local};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use validator::Validate;

static MAX_SLEEP_SLICE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    #[serde(default = "default_daily")]
    #[builder(default = default_daily(), into)]
    #[validate(custom(function = validate_cron_str))]
    #[getset(get = "pub")]
    daily: String,
    #[serde(default = "default_weekly")]
    #[builder(default = default_weekly(), into)]
    #[validate(custom(function = validate_cron_str))]
    #[getset(get = "pub")]
    weekly: String,
    #[serde(default = "default_monthly")]
    #[builder(default = default_monthly(), into)]
    #[validate(custom(function = validate_cron_str))]
    #[getset(get = "pub")]
    monthly: String,
    #[serde(default = "default_cleanup")]
    #[builder(default = default_cleanup(), into)]
    #[validate(custom(function = validate_cron_str))]
    #[getset(get = "pub")]
    cleanup: String,
    /// How often due triggers are evaluated
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    #[builder(default = default_poll_interval())]
    #[getset(get_copy = "pub")]
    poll_interval: Duration,
}

fn default_daily() -> String {
    "0 0 * * *".to_string()
}

fn default_weekly() -> String {
    "0 1 * * 0".to_string()
}

fn default_monthly() -> String {
    "0 2 1 * *".to_string()
}

fn default_cleanup() -> String {
    "0 3 * * *".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ScheduleConfig {
    fn cron_for(&self, job: Job) -> &str {
        match job {
            Job::Backup(BackupClass::Daily) => &self.daily,
            Job::Backup(BackupClass::Weekly) => &self.weekly,
            Job::Backup(BackupClass::Monthly) => &self.monthly,
            // Ad hoc backups are never scheduled.
            Job::Backup(BackupClass::AdHoc) | Job::Cleanup => &self.cleanup,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Job {
    Backup(BackupClass),
    Cleanup,
}

impl Job {
    pub const SCHEDULED: [Job; 4] = [
        Job::Backup(BackupClass::Daily),
        Job::Backup(BackupClass::Weekly),
        Job::Backup(BackupClass::Monthly),
        Job::Cleanup,
    ];
}

impl Display for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Backup(class) => write!(f, "{class} backup"),
            Job::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// What the scheduler drives. Errors returned here are logged and the
/// trigger stays registered.
pub trait JobRunner {
    fn backup(&self, class: BackupClass) -> Result<()>;
    fn cleanup(&self) -> Result<()>;
    fn report_crash(&self, error: &Error);
}

impl<T: JobRunner + ?Sized> JobRunner for &T {
    fn backup(&self, class: BackupClass) -> Result<()> {
        (**self).backup(class)
    }

    fn cleanup(&self) -> Result<()> {
        (**self).cleanup()
    }

    fn report_crash(&self, error: &Error) {
        (**self).report_crash(error)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug, Getters, CopyGetters)]
pub struct Trigger {
    #[getset(get_copy = "pub")]
    job: Job,
    #[getset(get = "pub")]
    cron: String,
    #[getset(get = "pub")]
    next_due: DateTime<Local>,
}

impl Trigger {
    fn new(job: Job, cron: &str, now: &DateTime<Local>) -> Result<Self> {
        Ok(Self {
            job,
            cron: cron.to_string(),
            next_due: next_occurrence(cron, now)?,
        })
    }
}

fn next_occurrence(cron: &str, after: &DateTime<Local>) -> Result<DateTime<Local>> {
    cron_parser::parse(cron, after)
        .map_err(|e| Error::configuration(format!("Invalid cron string {cron:?}: {e:?}")))
}

pub struct Scheduler<R: JobRunner> {
    runner: R,
    config: ScheduleConfig,
    stop: Arc<AtomicBool>,
    state: SchedulerState,
    triggers: Vec<Trigger>,
}

impl<R: JobRunner> Scheduler<R> {
    /// `stop` is polled between jobs and during the sleep between polls.
    pub fn new(runner: R, config: ScheduleConfig, stop: Arc<AtomicBool>) -> Self {
        Self {
            runner,
            config,
            stop,
            state: SchedulerState::Idle,
            triggers: Vec::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Registers the four triggers relative to `now`.
    pub fn start(&mut self, now: DateTime<Local>) -> Result<()> {
        if self.state != SchedulerState::Idle {
            return Err(Error::scheduler_crashed(format!(
                "Scheduler cannot start from state {:?}",
                self.state
            )));
        }
        self.triggers = Job::SCHEDULED
            .iter()
            .map(|job| Trigger::new(*job, self.config.cron_for(*job), &now))
            .collect::<Result<Vec<_>>>()?;
        for trigger in &self.triggers {
            info!("Scheduled {} at {}", trigger.job, trigger.next_due);
        }
        self.state = SchedulerState::Running;
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Runs every trigger due at `now`, earliest first, and reschedules it.
    /// Returns the jobs that ran.
    pub fn tick(&mut self, now: DateTime<Local>) -> Result<Vec<Job>> {
        let mut due = self
            .triggers
            .iter()
            .enumerate()
            .filter(|(_, trigger)| trigger.next_due <= now)
            .map(|(idx, trigger)| (idx, trigger.next_due))
            .collect::<Vec<_>>();
        due.sort_by_key(|(_, next_due)| *next_due);

        let mut ran = Vec::new();
        for (idx, _) in due {
            if self.stop_requested() {
                info!("Stop requested, skipping remaining due jobs");
                break;
            }
            let job = self.triggers[idx].job;
            ran.extend(self.run_job(job));
            let trigger = &mut self.triggers[idx];
            trigger.next_due = next_occurrence(&trigger.cron, &now)?;
            info!("Next {} at {}", trigger.job, trigger.next_due);
        }
        Ok(ran)
    }

    fn run_job(&self, job: Job) -> Vec<Job> {
        info!("Running scheduled {}", job);
        let res = match job {
            Job::Backup(class) => self.runner.backup(class),
            Job::Cleanup => self.runner.cleanup(),
        };
        match res {
            Ok(()) if job == Job::Backup(BackupClass::Daily) => {
                if self.stop_requested() {
                    return vec![job];
                }
                info!("Running cleanup after daily backup");
                if let Err(e) = self.runner.cleanup() {
                    error!("Post-backup cleanup failed: {}", e);
                }
                vec![job, Job::Cleanup]
            }
            Ok(()) => vec![job],
            Err(e) => {
                error!("Scheduled {} failed: {}", job, e);
                vec![job]
            }
        }
    }

    /// Polls until the stop flag is raised. A panic or an error escaping a
    /// tick is reported through [`JobRunner::report_crash`] and returned as
    /// a scheduler crash.
    pub fn run(&mut self) -> Result<()> {
        if self.state == SchedulerState::Idle {
            self.start(Local::now())?;
        }
        info!("Scheduler running");

        while !self.stop_requested() {
            let now = Local::now();
            let tick_res = match std::panic::catch_unwind(AssertUnwindSafe(|| self.tick(now))) {
                Ok(res) => res.map(|_| ()),
                Err(panic) => Err(Error::scheduler_crashed(panic_message(panic.as_ref()))),
            };
            if let Err(e) = tick_res {
                let e = match e {
                    e @ Error::SchedulerCrashed(_) => e,
                    e => Error::scheduler_crashed(e.to_string()),
                };
                error!("CRITICAL: {}", e);
                self.runner.report_crash(&e);
                self.state = SchedulerState::Stopped;
                return Err(e);
            }
            self.sleep(self.config.poll_interval);
        }

        self.state = SchedulerState::Stopping;
        info!("Scheduler stopping");
        self.state = SchedulerState::Stopped;
        info!("Scheduler stopped");
        Ok(())
    }

    fn sleep(&self, duration: Duration) {
        let mut remaining = duration;
        while !remaining.is_zero() && !self.stop_requested() {
            let slice = remaining.min(MAX_SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        warn!("Scheduler panicked with a non string payload");
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingRunner {
        calls: Arc<Mutex<Vec<Job>>>,
        failing: Arc<HashSet<Job>>,
        panicking: Arc<HashSet<Job>>,
        crashes: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingRunner {
        fn failing(jobs: &[Job]) -> Self {
            Self {
                failing: Arc::new(jobs.iter().copied().collect()),
                ..Default::default()
            }
        }

        fn panicking(jobs: &[Job]) -> Self {
            Self {
                panicking: Arc::new(jobs.iter().copied().collect()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Job> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, job: Job) -> Result<()> {
            self.calls.lock().unwrap().push(job);
            if self.panicking.contains(&job) {
                panic!("{job} exploded");
            }
            if self.failing.contains(&job) {
                return Err(Error::connection("database unreachable"));
            }
            Ok(())
        }
    }

    impl JobRunner for RecordingRunner {
        fn backup(&self, class: BackupClass) -> Result<()> {
            self.record(Job::Backup(class))
        }

        fn cleanup(&self) -> Result<()> {
            self.record(Job::Cleanup)
        }

        fn report_crash(&self, error: &Error) {
            self.crashes.lock().unwrap().push(error.to_string());
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn scheduler(runner: RecordingRunner) -> Scheduler<RecordingRunner> {
        Scheduler::new(
            runner,
            ScheduleConfig::default(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_start_registers_four_triggers() {
        let mut scheduler = scheduler(RecordingRunner::default());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        // Monday
        scheduler.start(at(2024, 6, 3, 23, 59, 0)).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        let due = scheduler
            .triggers()
            .iter()
            .map(|t| (t.job(), *t.next_due()))
            .collect::<Vec<_>>();
        assert_eq!(
            due,
            vec![
                (Job::Backup(BackupClass::Daily), at(2024, 6, 4, 0, 0, 0)),
                (Job::Backup(BackupClass::Weekly), at(2024, 6, 9, 1, 0, 0)),
                (Job::Backup(BackupClass::Monthly), at(2024, 7, 1, 2, 0, 0)),
                (Job::Cleanup, at(2024, 6, 4, 3, 0, 0)),
            ]
        );
        assert!(scheduler.start(at(2024, 6, 4, 0, 0, 0)).is_err());
    }

    #[test]
    fn test_tick_runs_nothing_before_due() {
        let runner = RecordingRunner::default();
        let mut scheduler = scheduler(runner.clone());
        scheduler.start(at(2024, 6, 3, 12, 0, 0)).unwrap();
        assert!(scheduler.tick(at(2024, 6, 3, 23, 59, 59)).unwrap().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_daily_success_runs_cleanup() {
        let runner = RecordingRunner::default();
        let mut scheduler = scheduler(runner.clone());
        scheduler.start(at(2024, 6, 3, 23, 59, 0)).unwrap();

        let ran = scheduler.tick(at(2024, 6, 4, 0, 0, 30)).unwrap();
        assert_eq!(ran, vec![Job::Backup(BackupClass::Daily), Job::Cleanup]);
        assert_eq!(
            *scheduler.triggers()[0].next_due(),
            at(2024, 6, 5, 0, 0, 0)
        );
        // the cleanup trigger keeps its own cadence
        assert_eq!(
            *scheduler.triggers()[3].next_due(),
            at(2024, 6, 4, 3, 0, 0)
        );
    }

    #[test]
    fn test_due_jobs_run_in_due_order() {
        let runner = RecordingRunner::default();
        let mut scheduler = scheduler(runner.clone());
        // Saturday evening; Sunday 2024-06-30 is followed by Monday 07-01
        scheduler.start(at(2024, 6, 29, 22, 0, 0)).unwrap();

        let ran = scheduler.tick(at(2024, 7, 1, 4, 0, 0)).unwrap();
        assert_eq!(
            ran,
            vec![
                Job::Backup(BackupClass::Daily),
                Job::Cleanup,
                Job::Backup(BackupClass::Weekly),
                Job::Cleanup,
                Job::Backup(BackupClass::Monthly),
            ]
        );
        assert!(scheduler
            .triggers()
            .iter()
            .all(|t| *t.next_due() > at(2024, 7, 1, 4, 0, 0)));
    }

    #[test]
    fn test_failed_job_stays_registered() {
        let daily = Job::Backup(BackupClass::Daily);
        let runner = RecordingRunner::failing(&[daily]);
        let mut scheduler = scheduler(runner.clone());
        scheduler.start(at(2024, 6, 3, 23, 59, 0)).unwrap();

        assert_eq!(scheduler.tick(at(2024, 6, 4, 0, 0, 30)).unwrap(), vec![daily]);
        // the cleanup trigger fell due in between and runs first
        assert_eq!(
            scheduler.tick(at(2024, 6, 5, 0, 0, 30)).unwrap(),
            vec![Job::Cleanup, daily]
        );
        assert_eq!(runner.calls(), vec![daily, Job::Cleanup, daily]);
        assert_eq!(*scheduler.triggers()[0].next_due(), at(2024, 6, 6, 0, 0, 0));
        assert_eq!(scheduler.state(), SchedulerState::Running);
    }

    #[test]
    fn test_stop_flag_skips_remaining_jobs() {
        let runner = RecordingRunner::default();
        let stop = Arc::new(AtomicBool::new(false));
        let mut scheduler = Scheduler::new(runner.clone(), ScheduleConfig::default(), stop.clone());
        scheduler.start(at(2024, 6, 3, 23, 59, 0)).unwrap();

        stop.store(true, Ordering::SeqCst);
        assert!(scheduler.tick(at(2024, 6, 4, 3, 30, 0)).unwrap().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_run_returns_when_stopped() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut scheduler = Scheduler::new(RecordingRunner::default(), ScheduleConfig::default(), stop);
        scheduler.run().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[test]
    fn test_panic_is_reported_as_crash() {
        let daily = Job::Backup(BackupClass::Daily);
        let runner = RecordingRunner::panicking(&[daily]);
        let mut scheduler = scheduler(runner.clone());
        scheduler
            .start(Local::now() - chrono::Duration::days(2))
            .unwrap();

        let err = scheduler.run().unwrap_err();
        assert_eq!(
            err.kind(),
            crate::backup::result_error::error::ErrorKind::SchedulerCrashed
        );
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        let crashes = runner.crashes.lock().unwrap().clone();
        assert_eq!(crashes.len(), 1);
        assert!(crashes[0].contains("daily backup exploded"));
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let config = ScheduleConfig::builder().daily("not a cron").build();
        assert!(config.validate().is_err());
        assert!(ScheduleConfig::default().validate().is_ok());
    }
}
