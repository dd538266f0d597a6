//! Outcome reporting.
//!
//! [`Notifier`] turns backup, cleanup and scheduler outcomes into
//! [`NotificationEvent`]s, renders them into an [`OutgoingMessage`] (subject
//! prefix, timestamp/host banner, attachment contents) and hands that to the
//! configured transport. Delivery failures surface as notification errors
//! which callers log and otherwise ignore.

use crate::backup::backup_class::BackupClass;
use crate::backup::executor::BackupArtifact;
use crate::backup::notifications::smtp::SmtpNotificationConfig;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::Local;
use derive_more::From;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use validator::{Validate, ValidationError, ValidationErrors};

pub mod smtp;

static SUBJECT_PREFIX: &str = "[DB Backup]";
static BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum NotificationConfig {
    Smtp(SmtpNotificationConfig),
}

impl Validate for NotificationConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            Self::Smtp(inner) => inner.validate(),
        }
    }
}

impl Notification for NotificationConfig {
    fn send(&self, message: &OutgoingMessage) -> Result<()> {
        match self {
            Self::Smtp(inner) => inner.send(message),
        }
    }
}

/// A transport able to deliver a rendered message.
pub trait Notification {
    fn send(&self, message: &OutgoingMessage) -> Result<()>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_transport_present))]
pub struct NotificationSettings {
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    enabled: bool,
    /// Attach the current log file to failure reports
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    attach_logs_on_failure: bool,
    #[validate(nested)]
    #[getset(get = "pub")]
    transport: Option<NotificationConfig>,
}

fn validate_transport_present(
    settings: &NotificationSettings,
) -> result::Result<(), ValidationError> {
    if settings.enabled && settings.transport.is_none() {
        return Err(ValidationError::new("MissingTransport")
            .with_message("notification is enabled but no transport is configured".into()));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Builder, Getters, CopyGetters)]
pub struct NotificationEvent {
    #[builder(into)]
    #[getset(get = "pub")]
    subject: String,
    #[builder(into)]
    #[getset(get = "pub")]
    body: String,
    #[builder(default, into)]
    #[getset(get = "pub")]
    attachments: Vec<PathBuf>,
    #[getset(get_copy = "pub")]
    outcome: Outcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct LoadedAttachment {
    file_name: String,
    content: Vec<u8>,
}

/// A rendered event, ready for a transport.
#[derive(Clone, Debug, Getters, CopyGetters)]
pub struct OutgoingMessage {
    #[getset(get = "pub")]
    subject: String,
    #[getset(get = "pub")]
    body: String,
    #[getset(get = "pub")]
    attachments: Vec<LoadedAttachment>,
    #[getset(get_copy = "pub")]
    outcome: Outcome,
}

/// What an outcome report is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportTopic {
    Backup(BackupClass),
    Cleanup,
    Scheduler,
}

impl Display for ReportTopic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportTopic::Backup(class) => write!(f, "{} Backup", class.label()),
            ReportTopic::Cleanup => f.write_str("Backup Cleanup"),
            ReportTopic::Scheduler => f.write_str("Backup Scheduler"),
        }
    }
}

pub enum RunOutcome<'a> {
    Success {
        artifact: &'a BackupArtifact,
        duration: Duration,
    },
    Failure {
        error: &'a Error,
        attempted: Option<&'a Path>,
    },
}

impl<'a> RunOutcome<'a> {
    pub fn success(artifact: &'a BackupArtifact, duration: Duration) -> Self {
        RunOutcome::Success { artifact, duration }
    }

    pub fn failure(error: &'a Error, attempted: Option<&'a Path>) -> Self {
        RunOutcome::Failure { error, attempted }
    }
}

pub struct Notifier {
    transport: Option<Arc<dyn Notification + Send + Sync>>,
    hostname: String,
    attach_logs_on_failure: bool,
    log_file: Option<PathBuf>,
}

impl Notifier {
    pub fn new<N: Notification + Send + Sync + 'static>(
        transport: N,
        attach_logs_on_failure: bool,
        log_file: Option<PathBuf>,
    ) -> Self {
        Self {
            transport: Some(Arc::new(transport)),
            hostname: local_hostname(),
            attach_logs_on_failure,
            log_file,
        }
    }

    /// A notifier that accepts every event and delivers none.
    pub fn disabled() -> Self {
        Self {
            transport: None,
            hostname: local_hostname(),
            attach_logs_on_failure: false,
            log_file: None,
        }
    }

    pub fn from_settings(settings: &NotificationSettings, log_file: Option<PathBuf>) -> Self {
        match (settings.enabled, &settings.transport) {
            (true, Some(transport)) => {
                Self::new(transport.clone(), settings.attach_logs_on_failure, log_file)
            }
            _ => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Adds the subject prefix and the timestamp/host banner, and loads the
    /// attachments. Unreadable attachments are logged and left out.
    pub fn render(&self, event: &NotificationEvent) -> OutgoingMessage {
        let body = format!(
            "Timestamp: {}\nHost: {}\n\n{}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.hostname,
            event.body
        );
        let attachments = event
            .attachments
            .iter()
            .filter_map(|path| match std::fs::read(path) {
                Ok(content) => {
                    let file_name = path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "attachment".to_string());
                    info!("Attached file {} to notification", file_name);
                    Some(LoadedAttachment { file_name, content })
                }
                Err(e) => {
                    warn!("Failed to attach file {:?}: {}", path, e);
                    None
                }
            })
            .collect();

        OutgoingMessage {
            subject: format!("{} {} - {}", SUBJECT_PREFIX, event.subject, self.hostname),
            body,
            attachments,
            outcome: event.outcome,
        }
    }

    pub fn send(&self, event: NotificationEvent) -> Result<()> {
        let Some(transport) = &self.transport else {
            debug!("Notifications disabled, not sending {:?}", event.subject);
            return Ok(());
        };

        let message = self.render(&event);
        match transport.send(&message) {
            Ok(()) => {
                info!("Notification sent: {}", event.subject);
                Ok(())
            }
            Err(e) => {
                let e = Error::notification(format!("Failed to send notification: {e}"));
                error!("{}", e);
                Err(e)
            }
        }
    }

    /// Reports the outcome of a backup or cleanup run.
    pub fn send_outcome(&self, topic: ReportTopic, outcome: RunOutcome<'_>) -> Result<()> {
        let event = match outcome {
            RunOutcome::Success { artifact, duration } => NotificationEvent::builder()
                .subject(format!("{topic} Successful"))
                .body(format!(
                    "{topic} completed successfully.\n\
                     Duration: {:.2} seconds\n\
                     Size: {:.2} MB\n\
                     File: {}\n\
                     Checksum: {}",
                    duration.as_secs_f64(),
                    artifact.size_bytes() as f64 / BYTES_PER_MB,
                    artifact.path().display(),
                    artifact.checksum()
                ))
                .outcome(Outcome::Success)
                .build(),
            RunOutcome::Failure { error, attempted } => {
                let mut body = format!("Error: {error}\n\n");
                if let Some(path) = attempted {
                    body.push_str(&format!("Attempted backup file: {}\n", path.display()));
                }
                NotificationEvent::builder()
                    .subject(format!("{topic} Failed"))
                    .body(body)
                    .attachments(self.failure_attachments())
                    .outcome(Outcome::Failure)
                    .build()
            }
        };
        self.send(event)
    }

    pub fn send_scheduler_crash(&self, error: &Error) -> Result<()> {
        self.send(
            NotificationEvent::builder()
                .subject(format!("{} Crashed", ReportTopic::Scheduler))
                .body(format!("Scheduler crashed: {error}\n"))
                .attachments(self.failure_attachments())
                .outcome(Outcome::Failure)
                .build(),
        )
    }

    /// Sends a test message with the current log file attached. Fails when
    /// notifications are disabled, since nothing could be delivered.
    pub fn send_test(&self) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::configuration("Notifications are not enabled in config"));
        }
        self.send(
            NotificationEvent::builder()
                .subject("Test Notification")
                .body("This is a test notification from the database backup system.")
                .attachments(self.log_file.iter().cloned().collect::<Vec<_>>())
                .outcome(Outcome::Success)
                .build(),
        )
    }

    fn failure_attachments(&self) -> Vec<PathBuf> {
        match &self.log_file {
            Some(log_file) if self.attach_logs_on_failure && log_file.exists() => {
                vec![log_file.clone()]
            }
            _ => Vec::new(),
        }
    }
}

fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every delivered message.
    #[derive(Clone, Default)]
    pub struct RecordingTransport {
        sent: Arc<Mutex<Vec<OutgoingMessage>>>,
    }

    impl RecordingTransport {
        pub fn messages(&self) -> Vec<OutgoingMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Notification for RecordingTransport {
        fn send(&self, message: &OutgoingMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    /// Behaves like an unreachable mail server.
    pub struct UnreachableTransport;

    impl Notification for UnreachableTransport {
        fn send(&self, _message: &OutgoingMessage) -> Result<()> {
            Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))
        }
    }
}
