pub mod backup_class;
pub mod backup_config;
pub mod compress;
pub mod context;
pub mod dump;
pub mod executor;
pub mod finish;
pub mod integrity;
pub mod logging;
pub mod notifications;
pub mod redacted;
pub mod result_error;
pub mod retention;
pub mod schedule;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
