//! Blocking wrapper for the external `pg_dump` executable.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::ConnectConfig;
use crate::error::Error;

/// Handle to a `pg_dump` executable, found on the path by default.
#[derive(Debug, Clone)]
pub struct PgDump {
    exe: PathBuf,
}

impl Default for PgDump {
    fn default() -> Self {
        Self::new("pg_dump")
    }
}

impl PgDump {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    /// Capture a schema-only dump of `config`'s database, excluding the
    /// version table so the dump reflects only what the migrations built.
    /// Owner and privilege statements are dropped to keep the dump
    /// comparable across environments.
    pub fn schema_only(&self, config: &ConnectConfig, exclude_table: &str) -> Result<String, Error> {
        let mut args = vec![
            "--schema-only".to_string(),
            "--no-owner".to_string(),
            "--no-privileges".to_string(),
            format!("--exclude-table={exclude_table}"),
        ];
        args.extend(config.pg_dump_args());

        self.run(&args, config.password.as_deref())
    }

    /// Run `pg_dump` with the given arguments, returning its stdout.
    /// Its stderr passes through to ours.
    pub fn run(&self, args: &[String], password: Option<&str>) -> Result<String, Error> {
        let mut command = Command::new(&self.exe);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        if let Some(password) = password {
            command.env("PGPASSWORD", password);
        }

        let output = command.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::PgDump(format!(
                    "pg_dump could not be located: '{}'",
                    self.exe.display()
                ))
            } else {
                Error::Io(e)
            }
        })?;

        if !output.status.success() {
            return Err(Error::PgDump(format!(
                "pg_dump exited with {}",
                output.status
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| Error::PgDump(format!("pg_dump produced non-UTF-8 output: {e}")))
    }
}
