//! Backend modules dumping and restoring the individual datastores.
//!
//! Currently the following backends are implemented:
//!
//! - [MySql]: Compressed SQL dump of the relational database.
//! - [MongoDb]: Compressed archive of the document database.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use clap::ValueEnum;
use derive_more::{Display, Error, From};

use crate::util::process::{self, CommandError};

pub mod mongodb;
pub mod mysql;

pub use mongodb::MongoDb;
pub use mysql::MySql;

/// The datastores of the platform.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Display)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreKind {
    #[value(name = "mysql")]
    #[display("mysql")]
    MySql,
    #[value(name = "mongodb")]
    #[display("mongodb")]
    MongoDb,
}

impl DatastoreKind {
    /// Name of the datastore's payload inside a snapshot.
    ///
    /// Payloads are normalized to this name after extraction as well.
    pub fn payload_name(self) -> &'static str {
        match self {
            Self::MySql => "mysql.sql.gz",
            Self::MongoDb => "mongodb.archive.gz",
        }
    }
}

/// Step of a run that needs a datastore client.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Dump,
    Restore,
    /// Sanity check after a restore.
    Check,
}

/// Where the datastore clients are executed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Display)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Run the clients installed on the host.
    #[default]
    #[display("host")]
    Host,
    /// Run the clients inside the datastore's container using `docker exec`.
    #[display("container")]
    Container,
}

impl ImportMode {
    /// Builds the command invoking `program`.
    ///
    /// `secrets` are handed to the client through its environment and never
    /// appear on the command line.
    fn client(self, container: &str, program: &str, secrets: &[(&str, &str)]) -> Command {
        match self {
            Self::Host => {
                let mut command = Command::new(program);
                command.envs(secrets.iter().copied());
                command
            }
            Self::Container => {
                let mut command = Command::new("docker");
                command.arg("exec").arg("-i");
                for (name, value) in secrets {
                    // without a value docker forwards the variable of its own environment
                    command.arg("-e").arg(name).env(name, value);
                }
                command.arg(container).arg(program);
                command
            }
        }
    }

    fn required_tools(self, program: &str) -> Vec<&str> {
        match self {
            Self::Host => vec![program],
            Self::Container => vec!["docker"],
        }
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on dumping or restoring a datastore.
pub enum BackendError {
    /// A datastore client failed.
    #[from]
    Command(CommandError),
    /// Reading or writing a payload failed.
    #[display("Payload I/O on {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    /// The restored datastore doesn't look sane.
    #[display("Sanity check of {_0} failed: {_1}")]
    SanityCheck(DatastoreKind, String),
}

impl BackendError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Generic datastore backend.
pub trait Datastore {
    fn kind(&self) -> DatastoreKind;

    /// External commands needed by this backend to perform `operation`.
    fn required_tools(&self, operation: Operation) -> Vec<&str>;

    /// Dumps the datastore into `dest_dir` and returns the created payload.
    ///
    /// # Dry Run
    ///
    /// On a dry run (`dry_run=true`) no files are created, the command that
    /// would be executed is printed instead.
    fn dump(&self, dest_dir: &Path, dry_run: bool) -> Result<PathBuf, BackendError>;

    /// Restores the datastore from the normalized `payload`.
    fn restore(&self, payload: &Path, dry_run: bool) -> Result<(), BackendError>;

    /// Checks the datastore after a restore.
    fn sanity_check(&self, dry_run: bool) -> Result<(), BackendError>;
}

/// Configuration of all available backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// Configuration of the [MySql] backend.
    pub mysql: MySql,

    /// Configuration of the [MongoDb] backend.
    pub mongodb: MongoDb,
}

impl BackendsConfig {
    /// The backend of `kind`.
    pub fn datastore(&self, kind: DatastoreKind) -> &dyn Datastore {
        match kind {
            DatastoreKind::MySql => &self.mysql,
            DatastoreKind::MongoDb => &self.mongodb,
        }
    }
}

/// Runs `command` and streams its stdout into `writer`.
///
/// Succeeds only once the whole stream was consumed and the command exited
/// successfully.
fn stream_stdout(
    command: &mut Command,
    writer: &mut impl Write,
    target: &str,
) -> Result<(), BackendError> {
    log::trace!(target: target, "Running: {}", process::render(command));
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(CommandError::spawn(command))?;

    let copied = match child.stdout.take() {
        Some(mut stdout) => io::copy(&mut stdout, writer),
        None => Ok(0),
    };
    let status = child.wait().map_err(CommandError::spawn(command))?;
    process::check_status(command, status, &[])?;

    let bytes = copied.map_err(CommandError::spawn(command))?;
    log::debug!(target: target, "Received {bytes} bytes");
    Ok(())
}

/// Runs `command` with `reader` streamed into its stdin.
fn stream_stdin(
    command: &mut Command,
    reader: &mut impl Read,
    target: &str,
) -> Result<(), BackendError> {
    log::trace!(target: target, "Running: {}", process::render(command));
    let mut child = command
        .stdin(Stdio::piped())
        .spawn()
        .map_err(CommandError::spawn(command))?;

    let copied = match child.stdin.take() {
        // stdin is closed once dropped at the end of this arm
        Some(mut stdin) => io::copy(reader, &mut stdin),
        None => Ok(0),
    };
    let status = child.wait().map_err(CommandError::spawn(command))?;
    // an early exit of the client breaks the pipe; its status explains why
    process::check_status(command, status, &[])?;

    let bytes = copied.map_err(CommandError::spawn(command))?;
    log::debug!(target: target, "Sent {bytes} bytes");
    Ok(())
}

/// Parses the number printed last by a client.
fn parse_count(stdout: &[u8]) -> Option<u64> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())?
        .parse()
        .ok()
}
