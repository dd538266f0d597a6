//! Invocation of the external dump tool.
//!
//! The tool is a black box: it receives connection parameters as arguments,
//! writes the dump to stdout and reports problems through its exit code and
//! stderr. Stdout is streamed through the configured compressor straight into
//! the scratch file.

use crate::backup::backup_config::DatabaseConfig;
use crate::backup::compress::{CompressorBuilder, CompressorConfig};
use crate::backup::finish::Finish;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use bon::Builder;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, IntoInnerError, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use validator::Validate;

/// Environment variable the MySQL client tools read the password from.
pub static PASSWORD_ENV: &str = "MYSQL_PWD";

static DEFAULT_DUMP_PROGRAM: &str = "mysqldump";

/// Diagnostics that mean the database could not be reached at all.
static CONNECTION_FAILURE_MARKERS: [&str; 8] = [
    "Can't connect",
    "Unknown MySQL server host",
    "Unknown server host",
    "Access denied",
    "Lost connection",
    "Connection refused",
    "Got error: 2002",
    "Got error: 2003",
];

/// How the password reaches the dump tool.
///
/// `environment` keeps it out of the process list and avoids the
/// "password on the command line" warning the MySQL tools print on stderr,
/// which would otherwise fail every run.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PasswordMode {
    #[default]
    Environment,
    Argument,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct DumpToolConfig {
    #[serde(default = "default_program")]
    #[builder(default = default_program(), into)]
    program: PathBuf,
    /// Extra arguments appended after the database name
    #[serde(default)]
    #[builder(default, into)]
    options: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    password_mode: PasswordMode,
}

fn default_program() -> PathBuf {
    DEFAULT_DUMP_PROGRAM.into()
}

impl Default for DumpToolConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            options: Vec::new(),
            password_mode: PasswordMode::default(),
        }
    }
}

impl DumpToolConfig {
    /// Arguments in invocation order: connection flags, database, extra options.
    pub fn args(&self, database: &DatabaseConfig) -> Vec<String> {
        let mut args = vec![
            format!("--host={}", database.host()),
            format!("--port={}", database.port()),
            format!("--user={}", database.user()),
        ];
        if let (PasswordMode::Argument, Some(password)) = (self.password_mode, database.password()) {
            args.push(format!("--password={}", password.inner()));
        }
        args.push(database.name().clone());
        args.extend(self.options.iter().cloned());
        args
    }

    /// The command line as it may appear in logs.
    pub fn display_command(&self, database: &DatabaseConfig) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args(database).into_iter().map(|arg| {
                if arg.starts_with("--password=") {
                    "--password=****".to_string()
                } else {
                    arg
                }
            }))
            .join(" ")
    }

    /// Runs the dump tool and writes its compressed output to `dest`.
    ///
    /// Succeeds only if the tool exits with status 0 and printed nothing on
    /// stderr. Returns the number of uncompressed bytes received.
    #[named]
    pub fn dump_to(
        &self,
        database: &DatabaseConfig,
        compressor: &CompressorConfig,
        dest: &Path,
    ) -> Result<u64> {
        let mut command = Command::new(&self.program);
        command
            .args(self.args(database))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let (PasswordMode::Environment, Some(password)) = (self.password_mode, database.password())
        {
            command.env(PASSWORD_ENV, password.inner());
        }
        // Keep terminal signals away from the tool; a stop request lets the
        // current dump finish.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        tracing::info!("Executing backup command: {}", self.display_command(database));
        let mut child = command
            .spawn()
            .map_err(|e| {
                Error::backup_process(format!(
                    "Failed to start dump tool {:?}: {e}",
                    self.program
                ))
            })
            .add_fn_name(function_path!())?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::backup_process("Dump tool stderr not captured"))?;
        let stderr_reader = std::thread::spawn(move || {
            let mut output = String::new();
            stderr.read_to_string(&mut output).map(|_| output)
        });

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::backup_process("Dump tool stdout not captured"))?;
        let copy_res = File::create(dest)
            .map(BufWriter::new)
            .map_err(Error::from)
            .and_then(|f| compressor.build_compressor(f))
            .and_then(|mut writer| {
                let copied = std::io::copy(&mut stdout, &mut writer)?;
                writer
                    .finish()?
                    .into_inner()
                    .map_err(IntoInnerError::into_error)?
                    .sync_all()?;
                Ok(copied)
            });
        drop(stdout);
        if copy_res.is_err() {
            // Nobody reads its stdout anymore, do not leave it blocked on a full pipe.
            let _ = child.kill();
        }

        let status = child
            .wait()
            .map_err(Error::from)
            .add_fn_name(function_path!())?;
        let stderr_output = stderr_reader
            .join()
            .map_err(|_| Error::backup_process("Dump tool stderr reader panicked"))??;

        let has_diagnostics = !stderr_output.trim().is_empty();
        let copied = match copy_res {
            Err(e) if !has_diagnostics => {
                return Err(Error::storage(format!("Failed to write dump to {dest:?}: {e}")))
                    .add_fn_name(function_path!());
            }
            res => res,
        };
        if !status.success() || has_diagnostics {
            return Err(classify_failure(status, &stderr_output)).add_fn_name(function_path!());
        }
        let copied = copied.add_fn_name(function_path!())?;
        tracing::debug!("Dump tool produced {} bytes", copied);
        Ok(copied)
    }
}

/// Connection problems and every other failure of the dump tool are reported
/// as different error kinds.
pub fn classify_failure(status: ExitStatus, stderr: &str) -> Error {
    let stderr = stderr.trim();
    let detail = if stderr.is_empty() {
        "no diagnostic output".to_string()
    } else {
        stderr.to_string()
    };

    if CONNECTION_FAILURE_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
    {
        Error::connection(format!("Cannot reach the database ({status}): {detail}"))
    } else {
        Error::backup_process(format!("Backup process failed ({status}): {detail}"))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    /// Writes an executable shell script standing in for the dump tool.
    #[cfg(unix)]
    pub fn fake_dump_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
