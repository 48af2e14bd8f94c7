//! Implements backup of the relational database using [MySql].

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{
    parse_count, stream_stdin, stream_stdout, BackendError, Datastore, DatastoreKind, ImportMode,
    Operation,
};
use crate::util::process;

const SYSTEM_SCHEMAS: &str = "'mysql', 'information_schema', 'performance_schema', 'sys'";

/// [MySql]: Dumps with `mysqldump` and restores with the `mysql` client.
///
/// The password is handed to the clients through `MYSQL_PWD`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MySql {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,

    /// Databases to dump. All databases are dumped if empty.
    pub databases: Vec<String>,

    /// Where to execute the clients.
    pub import_mode: ImportMode,

    /// Container executing the clients in [ImportMode::Container].
    pub container: String,

    /// Let the `mysql` client prompt for the password on restore.
    ///
    /// Requires a terminal; the configured password is ignored then.
    pub prompt_password: bool,

    /// Pass `--column-statistics=0` to `mysqldump`.
    ///
    /// Needed when a MySQL 8 `mysqldump` dumps an older server.
    pub disable_column_statistics: bool,
}

impl Default for MySql {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3306,
            user: "root".into(),
            password: None,
            databases: Vec::new(),
            import_mode: ImportMode::Host,
            container: "mysql".into(),
            prompt_password: false,
            disable_column_statistics: false,
        }
    }
}

impl MySql {
    fn client(&self, program: &str, prompt: bool) -> Command {
        let secrets: Vec<(&str, &str)> = match &self.password {
            Some(password) if !prompt => vec![("MYSQL_PWD", password.as_str())],
            _ => Vec::new(),
        };

        let mut command = self.import_mode.client(&self.container, program, &secrets);
        command
            .arg(format!("--host={}", self.host))
            .arg(format!("--port={}", self.port))
            .arg(format!("--user={}", self.user));
        if prompt {
            command.arg("-p");
        }
        command
    }

    fn dump_command(&self) -> Command {
        let mut command = self.client("mysqldump", false);
        command
            .arg("--single-transaction") // consistent InnoDB snapshot without locking
            .arg("--routines")
            .arg("--triggers")
            .arg("--events");
        if self.disable_column_statistics {
            command.arg("--column-statistics=0");
        }

        if self.databases.is_empty() {
            command.arg("--all-databases");
        } else {
            command.arg("--databases").args(&self.databases);
        }
        command
    }

    fn restore_command(&self) -> Command {
        self.client("mysql", self.prompt_password)
    }

    fn sanity_command(&self) -> Command {
        let mut command = self.client("mysql", self.prompt_password);
        command
            .arg("--batch")
            .arg("--skip-column-names")
            .arg("--execute")
            .arg(format!(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema NOT IN ({SYSTEM_SCHEMAS})"
            ));
        command
    }
}

impl Datastore for MySql {
    fn kind(&self) -> DatastoreKind {
        DatastoreKind::MySql
    }

    fn required_tools(&self, operation: Operation) -> Vec<&str> {
        let program = match operation {
            Operation::Dump => "mysqldump",
            Operation::Restore | Operation::Check => "mysql",
        };
        self.import_mode.required_tools(program)
    }

    fn dump(&self, dest_dir: &Path, dry_run: bool) -> Result<PathBuf, BackendError> {
        let db_dump_file = dest_dir.join(self.kind().payload_name());
        log::info!(
            target: "backend::mysql",
            "Create database dump of {}:{}",
            self.host,
            self.port
        );
        log::trace!(target: "backend::mysql", "Using user '{}' for backup", self.user);

        let mut command = self.dump_command();
        if dry_run {
            process::print_dry_run(&command);
            return Ok(db_dump_file);
        }

        fs::create_dir_all(dest_dir).map_err(BackendError::io(dest_dir))?;
        log::debug!(
            target: "backend::mysql",
            "Save database dump at: {}",
            db_dump_file.display()
        );
        let file = File::create_new(&db_dump_file).map_err(BackendError::io(&db_dump_file))?;

        // compress stdout of mysqldump on the fly
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        stream_stdout(&mut command, &mut encoder, "backend::mysql")?;
        encoder
            .finish()
            .and_then(|writer| writer.into_inner().map_err(|e| e.into_error()))
            .and_then(|file| file.sync_all())
            .map_err(BackendError::io(&db_dump_file))?;

        log::info!(target: "backend::mysql", "Finished database dump");
        Ok(db_dump_file)
    }

    fn restore(&self, payload: &Path, dry_run: bool) -> Result<(), BackendError> {
        let mut command = self.restore_command();
        if dry_run {
            process::print_dry_run(&command);
            println!("[dry-run]   with stdin from gunzip {}", payload.display());
            return Ok(());
        }

        log::info!(
            target: "backend::mysql",
            "Restoring {} into {}:{}",
            payload.display(),
            self.host,
            self.port
        );
        let file = File::open(payload).map_err(BackendError::io(payload))?;
        let mut decoder = GzDecoder::new(BufReader::new(file));
        stream_stdin(&mut command, &mut decoder, "backend::mysql")?;

        log::info!(target: "backend::mysql", "Finished restore");
        Ok(())
    }

    fn sanity_check(&self, dry_run: bool) -> Result<(), BackendError> {
        let mut command = self.sanity_command();
        if dry_run {
            process::print_dry_run(&command);
            return Ok(());
        }

        let output = process::output(&mut command, "backend::mysql")?;
        match parse_count(&output.stdout) {
            Some(0) => Err(BackendError::SanityCheck(self.kind(), "no user tables present".into())),
            Some(tables) => {
                log::info!(target: "backend::mysql", "Sanity check passed: {tables} tables");
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
