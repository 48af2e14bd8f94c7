//! Implements backup of the document database using [MongoDb].

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{
    parse_count, stream_stdin, stream_stdout, BackendError, Datastore, DatastoreKind, ImportMode,
    Operation,
};
use crate::util::process;

const COUNT_USER_DATABASES: &str = "db.adminCommand({ listDatabases: 1 }).databases\
    .filter(d => !['admin', 'config', 'local'].includes(d.name)).length";

/// [MongoDb]: Dumps with `mongodump` and restores with `mongorestore`.
///
/// Both tools stream a gzip compressed archive, which is stored as is.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MongoDb {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,

    /// Password of `username`.
    ///
    /// The database tools only take it as `--password=` argument, so it's
    /// visible in the process list of the host (or container) while a client
    /// runs. It's masked in every logged or printed command line.
    pub password: Option<String>,

    /// Database holding the user's credentials.
    pub auth_database: String,

    /// Databases to restore from the archive. All are restored if empty.
    pub databases: Vec<String>,

    /// Where to execute the clients.
    pub import_mode: ImportMode,

    /// Container executing the clients in [ImportMode::Container].
    pub container: String,

    /// Drop collections before restoring them.
    pub drop: bool,
}

impl Default for MongoDb {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 27017,
            username: None,
            password: None,
            auth_database: "admin".into(),
            databases: Vec::new(),
            import_mode: ImportMode::Host,
            container: "mongodb".into(),
            drop: true,
        }
    }
}

impl MongoDb {
    fn client(&self, program: &str) -> Command {
        let mut command = self.import_mode.client(&self.container, program, &[]);
        command
            .arg(format!("--host={}", self.host))
            .arg(format!("--port={}", self.port));
        if let Some(username) = &self.username {
            command
                .arg(format!("--username={username}"))
                .arg(format!("--authenticationDatabase={}", self.auth_database));
        }
        if let Some(password) = &self.password {
            command.arg(format!("--password={password}"));
        }
        command
    }

    fn dump_command(&self) -> Command {
        let mut command = self.client("mongodump");
        command.arg("--archive").arg("--gzip");
        command
    }

    fn restore_command(&self) -> Command {
        let mut command = self.client("mongorestore");
        command.arg("--archive").arg("--gzip");
        if self.drop {
            command.arg("--drop");
        }
        for database in &self.databases {
            command.arg(format!("--nsInclude={database}.*"));
        }
        command
    }

    fn sanity_command(&self) -> Command {
        let mut command = self.client("mongosh");
        command.arg("--quiet").arg("--eval").arg(COUNT_USER_DATABASES);
        command
    }
}

impl Datastore for MongoDb {
    fn kind(&self) -> DatastoreKind {
        DatastoreKind::MongoDb
    }

    fn required_tools(&self, operation: Operation) -> Vec<&str> {
        let program = match operation {
            Operation::Dump => "mongodump",
            Operation::Restore => "mongorestore",
            Operation::Check => "mongosh",
        };
        self.import_mode.required_tools(program)
    }

    fn dump(&self, dest_dir: &Path, dry_run: bool) -> Result<PathBuf, BackendError> {
        let archive = dest_dir.join(self.kind().payload_name());
        log::info!(
            target: "backend::mongodb",
            "Create database dump of {}:{}",
            self.host,
            self.port
        );

        let mut command = self.dump_command();
        if dry_run {
            process::print_dry_run(&command);
            return Ok(archive);
        }

        fs::create_dir_all(dest_dir).map_err(BackendError::io(dest_dir))?;
        log::debug!(
            target: "backend::mongodb",
            "Save database dump at: {}",
            archive.display()
        );
        let file = File::create_new(&archive).map_err(BackendError::io(&archive))?;
        let mut writer = BufWriter::new(file);
        stream_stdout(&mut command, &mut writer, "backend::mongodb")?;
        writer
            .flush()
            .and_then(|_| writer.get_ref().sync_all())
            .map_err(BackendError::io(&archive))?;

        log::info!(target: "backend::mongodb", "Finished database dump");
        Ok(archive)
    }

    fn restore(&self, payload: &Path, dry_run: bool) -> Result<(), BackendError> {
        let mut command = self.restore_command();
        if dry_run {
            process::print_dry_run(&command);
            println!("[dry-run]   with stdin from {}", payload.display());
            return Ok(());
        }

        log::info!(
            target: "backend::mongodb",
            "Restoring {} into {}:{}",
            payload.display(),
            self.host,
            self.port
        );
        let file = File::open(payload).map_err(BackendError::io(payload))?;
        stream_stdin(&mut command, &mut BufReader::new(file), "backend::mongodb")?;

        log::info!(target: "backend::mongodb", "Finished restore");
        Ok(())
    }

    fn sanity_check(&self, dry_run: bool) -> Result<(), BackendError> {
        let mut command = self.sanity_command();
        if dry_run {
            process::print_dry_run(&command);
            return Ok(());
        }

        let output = process::output(&mut command, "backend::mongodb")?;
        match parse_count(&output.stdout) {
            Some(0) => Err(BackendError::SanityCheck(
                self.kind(),
                "no user databases present".into(),
            )),
            Some(databases) => {
                log::info!(
                    target: "backend::mongodb",
                    "Sanity check passed: {databases} databases"
                );
                Ok(())
            }
            None => Err(BackendError::SanityCheck(
                self.kind(),
                format!(
                    "unexpected output: {}",
                    String::from_utf8_lossy(&output.stdout).trim()
                ),
            )),
        }
    }
}
