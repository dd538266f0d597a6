use crate::backup::result_error::{AddFunctionName, WithMsg};
use derive_more::Display;
use itertools::Itertools;
use std::fmt::Debug;
use thiserror::Error;
use thiserror_ext::Construct;

/// Failure category, used by handlers that react to a whole class of errors
/// rather than to one concrete variant.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Connection,
    BackupProcess,
    Integrity,
    Storage,
    Notification,
    SchedulerCrashed,
}

#[derive(Error, Debug, Construct)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Backup process error: {0}")]
    BackupProcess(String),
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Notification error: {0}")]
    Notification(String),
    #[error("Scheduler crashed: {0}")]
    SchedulerCrashed(String),
    #[error(transparent)]
    #[construct(skip)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    #[construct(skip)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    #[construct(skip)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    #[construct(skip)]
    LettreEmail(#[from] lettre::error::Error),
    #[error(transparent)]
    #[construct(skip)]
    LettreSmtp(#[from] lettre::transport::smtp::Error),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    #[construct(skip)]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    #[construct(skip)]
    WithFnName { error: Box<Error>, fn_name: String },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Self::WithFnName {
            error: Box::new(self),
            fn_name: fn_name.into(),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    /// Category of this error. Context wrappers report the category of the
    /// error they wrap; a bundle reports the category of its first member.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::ValidationError(_) | Error::SerdeYml(_) => {
                ErrorKind::Configuration
            }
            Error::Connection(_) => ErrorKind::Connection,
            Error::BackupProcess(_) => ErrorKind::BackupProcess,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Storage(_) | Error::Io(_) => ErrorKind::Storage,
            Error::Notification(_) | Error::LettreEmail(_) | Error::LettreSmtp(_) => {
                ErrorKind::Notification
            }
            Error::SchedulerCrashed(_) => ErrorKind::SchedulerCrashed,
            Error::WithMsg { error, .. } | Error::WithFnName { error, .. } => error.kind(),
            Error::LotsOfError(errors) => errors
                .first()
                .map(Error::kind)
                .unwrap_or(ErrorKind::SchedulerCrashed),
        }
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_io_error_is_storage() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);

        match &error {
            Error::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
        assert_eq!(error.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_config_parse_and_validation_errors_are_configuration() {
        let yml_error = serde_yml::from_str::<u32>("not a number").unwrap_err();
        let error = Error::from(yml_error);
        assert!(matches!(error, Error::SerdeYml(_)));
        assert_eq!(error.kind(), ErrorKind::Configuration);

        let error = Error::from(validator::ValidationErrors::new());
        assert!(matches!(error, Error::ValidationError(_)));
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_constructors_carry_kind() {
        assert_eq!(Error::configuration("x").kind(), ErrorKind::Configuration);
        assert_eq!(Error::connection("x").kind(), ErrorKind::Connection);
        assert_eq!(Error::backup_process("x").kind(), ErrorKind::BackupProcess);
        assert_eq!(Error::integrity("x").kind(), ErrorKind::Integrity);
        assert_eq!(Error::storage("x").kind(), ErrorKind::Storage);
        assert_eq!(Error::notification("x").kind(), ErrorKind::Notification);
        assert_eq!(
            Error::scheduler_crashed("x").kind(),
            ErrorKind::SchedulerCrashed
        );
    }

    #[test]
    fn test_error_with_msg_keeps_kind() {
        let error = Error::integrity("digest mismatch").with_msg("Custom message");

        match &error {
            Error::WithMsg { msg, .. } => assert_eq!(msg, "Custom message"),
            _ => panic!("Expected WithMsg error"),
        }
        assert_eq!(error.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_error_with_fn_name() {
        let error = Error::backup_process("exit 2").add_fn_name("dump_to");

        match &error {
            Error::WithFnName { fn_name, .. } => assert_eq!(fn_name, "dump_to"),
            _ => panic!("Expected WithFnName error"),
        }
        assert_eq!(error.kind(), ErrorKind::BackupProcess);
        let error_str = error.to_string();
        assert!(error_str.contains("dump_to failed"));
        assert!(error_str.contains("exit 2"));
    }

    #[test]
    fn test_error_from_vec() {
        let errors = vec![
            Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "error1")),
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "error2",
            )),
        ];

        let combined_error = Error::from(errors);
        match combined_error {
            Error::LotsOfError(error_vec) => assert_eq!(error_vec.len(), 2),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    #[should_panic(expected = "Should not create lots of errors when error is empty")]
    fn test_error_from_empty_vec_panics() {
        let errors: Vec<Error> = vec![];
        let _error = Error::from(errors);
    }

    #[test]
    fn test_error_chain_flattens() {
        let error1 = Error::connection("error1");
        let error2 = Error::storage("error2").chain(Error::integrity("error3"));

        let chained = error1.chain(error2);
        assert_eq!(chained.kind(), ErrorKind::Connection);
        match chained {
            Error::LotsOfError(errors) => assert_eq!(errors.len(), 3),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    fn test_error_with_msg_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error).with_msg("Operation failed");
        let error_str = error.to_string();

        assert!(error_str.contains("Operation failed"));
        assert!(error_str.contains("  file not found"));
    }
}
