use crate::backup::function_path;
use crate::backup::notifications::{Notification, OutgoingMessage};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, WithMsg};
use bon::Builder;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use validator::Validate;

static ATTACHMENT_CONTENT_TYPE: &str = "application/octet-stream";

/// Configuration for SMTP email notifications
///
/// Supports implicit TLS (`Ssl`), `StartTls` and unsecured connections.
/// Authentication is used only when both username and password are set.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct SmtpNotificationConfig {
    #[validate(length(min = 1))]
    #[builder(into)]
    host: String,
    /// Defaults to the standard port of `smtp_mode`
    port: Option<u16>,
    #[builder(into)]
    smtp_mode: SmtpMode,
    #[builder(into)]
    from: Mailbox,
    #[validate(length(min = 1))]
    #[builder(into)]
    to: Vec<Mailbox>,
    #[builder(into)]
    username: Option<String>,
    #[builder(into)]
    password: Option<RedactedString>,
}

/// SMTP connection security modes
///
/// - `Unsecured`: Plain text connection (not recommended for production)
/// - `Ssl`: SSL/TLS encrypted connection from start
/// - `StartTls`: Start with plain text, then upgrade to TLS
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SmtpMode {
    Unsecured,
    Ssl,
    StartTls,
}

impl SmtpNotificationConfig {
    #[named]
    fn build_email(&self, message: &OutgoingMessage) -> Result<Message> {
        let builder = self
            .to
            .iter()
            .fold(Message::builder(), |email, send_to| {
                email.to(send_to.clone())
            })
            .from(self.from.clone())
            .subject(message.subject());

        let email = if message.attachments().is_empty() {
            builder
                .header(ContentType::TEXT_PLAIN)
                .body(message.body().clone())
        } else {
            let content_type = ContentType::parse(ATTACHMENT_CONTENT_TYPE)
                .map_err(|e| Error::notification(format!("{e:?}")))?;
            let multipart = message.attachments().iter().fold(
                MultiPart::mixed().singlepart(SinglePart::plain(message.body().clone())),
                |multipart, attachment| {
                    multipart.singlepart(
                        Attachment::new(attachment.file_name().clone())
                            .body(attachment.content().clone(), content_type.clone()),
                    )
                },
            );
            builder.multipart(multipart)
        };

        email
            .map_err(Error::from)
            .with_msg(format!(
                "Fail to build notification email from {:?} to {:?}",
                self.from, self.to
            ))
            .add_fn_name(function_path!())
    }

    #[named]
    fn build_transport(&self) -> Result<SmtpTransport> {
        let builder = match self.smtp_mode {
            SmtpMode::Unsecured => Ok(SmtpTransport::builder_dangerous(self.host.as_str())),
            SmtpMode::Ssl => SmtpTransport::relay(self.host.as_str()),
            SmtpMode::StartTls => SmtpTransport::starttls_relay(self.host.as_str()),
        }
        .map_err(Error::from)
        .with_msg(format!(
            "Failed to build smtp client for host: {:?} with mode {:?}",
            self.host, self.smtp_mode
        ))
        .add_fn_name(function_path!())?;

        let builder = match self.port {
            Some(port) => builder.port(port),
            None => builder,
        };
        let builder = match (&self.username, &self.password) {
            (Some(username), Some(password)) => builder.credentials(Credentials::new(
                username.clone(),
                password.inner().to_string(),
            )),
            _ => builder,
        };
        Ok(builder.build())
    }
}

impl Notification for SmtpNotificationConfig {
    #[named]
    fn send(&self, message: &OutgoingMessage) -> Result<()> {
        tracing::info!(
            "Started smtp email notification from {:?} to {:?}",
            self.from,
            self.to
        );
        let email = self.build_email(message)?;
        let mailer = self.build_transport()?;

        tracing::info!("Sending email...");
        let response = mailer
            .send(&email)
            .map_err(Error::from)
            .add_fn_name(function_path!())?;
        if response.is_positive() {
            Ok(())
        } else {
            let error_vec = response
                .message()
                .map(|m| Error::notification(m.to_owned()))
                .collect_vec();
            if error_vec.is_empty() {
                Err(Error::notification(format!(
                    "SMTP server rejected message: {}",
                    response.code()
                )))
            } else {
                Err(Error::lots_of_error(error_vec))
            }
        }
    }
}
