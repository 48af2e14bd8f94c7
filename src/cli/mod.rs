use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::backends::{DatastoreKind, ImportMode};
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::snapshot::SnapshotId;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    /// Path of the config file. Created with defaults if missing.
    #[arg(
        long,
        short = 'c',
        env = "LMS_BACKUP_CONFIG",
        default_value = DEFAULT_CONFIG_PATH,
        global = true
    )]
    pub config: PathBuf,

    /// Print the commands instead of executing them.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Location of the snapshots, `s3://bucket[/prefix]` or a directory.
    #[arg(long, env = "LMS_BACKUP_BUCKET", global = true)]
    pub store_url: Option<String>,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub action: Action,
}

/// Overrides of the datastore connections.
#[derive(Args, Debug, Default)]
pub struct ConnectionArgs {
    /// Host of the MySQL server.
    #[arg(long, env = "MYSQL_HOST", global = true)]
    pub mysql_host: Option<String>,

    /// Port of the MySQL server.
    #[arg(long, env = "MYSQL_PORT", global = true)]
    pub mysql_port: Option<u16>,

    /// MySQL user.
    #[arg(long, env = "MYSQL_USER", global = true)]
    pub mysql_user: Option<String>,

    /// MySQL password. Only accepted from the environment.
    #[arg(long, env = "MYSQL_PASSWORD", hide = true, hide_env_values = true)]
    pub mysql_password: Option<String>,

    /// Host of the MongoDB server.
    #[arg(long, env = "MONGODB_HOST", global = true)]
    pub mongodb_host: Option<String>,

    /// Port of the MongoDB server.
    #[arg(long, env = "MONGODB_PORT", global = true)]
    pub mongodb_port: Option<u16>,

    /// MongoDB user.
    #[arg(long, env = "MONGODB_USER", global = true)]
    pub mongodb_user: Option<String>,

    /// MongoDB password. Only accepted from the environment.
    #[arg(long, env = "MONGODB_PASSWORD", hide = true, hide_env_values = true)]
    pub mongodb_password: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Dump all datastores and publish them as snapshot.
    Backup(BackupArgs),
    /// Restore a datastore from a published snapshot.
    Restore(RestoreArgs),
    /// List the published snapshots.
    List,
}

#[derive(Args, Debug, Default)]
pub struct BackupArgs {
    /// Only list the published snapshots.
    #[arg(long)]
    pub list: bool,

    /// Stop the platform services while dumping.
    #[arg(long)]
    pub stop_services: bool,

    /// Delete the local archive after a successful upload.
    #[arg(long)]
    pub delete_local: bool,

    /// Directory dumps are packaged in.
    #[arg(long, env = "LMS_BACKUP_DIR")]
    pub workdir: Option<PathBuf>,

    /// Datastores to back up. (Default: all)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<DatastoreKind>,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Datastore to restore.
    pub datastore: DatastoreKind,

    /// Snapshot to restore. (Default: latest)
    #[arg(long, conflicts_with = "list")]
    pub ts: Option<SnapshotId>,

    /// Only list the published snapshots.
    #[arg(long)]
    pub list: bool,

    /// Download and extract again even if cached.
    #[arg(long)]
    pub refresh: bool,

    /// Check the datastore after restoring it.
    #[arg(long)]
    pub check: bool,

    /// Stop the platform services while restoring.
    #[arg(long)]
    pub stop_services: bool,

    /// Directory downloaded snapshots are cached in.
    #[arg(long, env = "LMS_RESTORE_DIR")]
    pub workdir: Option<PathBuf>,

    /// Where to execute the datastore clients.
    #[arg(long, env = "LMS_IMPORT_MODE")]
    pub import_mode: Option<ImportMode>,

    /// Let the MySQL client prompt for the password.
    #[arg(long, env = "LMS_PROMPT_PASSWORD", value_parser = BoolishValueParser::new())]
    pub prompt_password: bool,
}

impl Cli {
    /// Applies environment variables and flags on top of `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(url) = &self.store_url {
            config.store.url = url.clone();
        }

        let ConnectionArgs {
            mysql_host,
            mysql_port,
            mysql_user,
            mysql_password,
            mongodb_host,
            mongodb_port,
            mongodb_user,
            mongodb_password,
        } = &self.connection;
        let mysql = &mut config.backends.mysql;
        override_with(&mut mysql.host, mysql_host);
        override_with(&mut mysql.port, mysql_port);
        override_with(&mut mysql.user, mysql_user);
        if mysql_password.is_some() {
            mysql.password = mysql_password.clone();
        }
        let mongodb = &mut config.backends.mongodb;
        override_with(&mut mongodb.host, mongodb_host);
        override_with(&mut mongodb.port, mongodb_port);
        if mongodb_user.is_some() {
            mongodb.username = mongodb_user.clone();
        }
        if mongodb_password.is_some() {
            mongodb.password = mongodb_password.clone();
        }

        match &self.action {
            Action::Backup(args) => {
                override_with(&mut config.backup_dir, &args.workdir);
                config.delete_local |= args.delete_local;
            }
            Action::Restore(args) => {
                override_with(&mut config.restore_dir, &args.workdir);
                if let Some(import_mode) = args.import_mode {
                    config.backends.mysql.import_mode = import_mode;
                    config.backends.mongodb.import_mode = import_mode;
                }
                config.backends.mysql.prompt_password |= args.prompt_password;
            }
            Action::List => {}
        }
    }
}

fn override_with<T: Clone>(value: &mut T, with: &Option<T>) {
    if let Some(with) = with {
        *value = with.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("lms_backup").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn restore_flags() {
        let cli = parse(&[
            "--dry-run",
            "restore",
            "mysql",
            "--ts",
            "20251108T184125Z",
            "--check",
        ]);
        let Action::Restore(args) = &cli.action else {
            panic!("expected restore: {cli:?}");
        };

        assert!(cli.dry_run);
        assert_eq!(args.datastore, DatastoreKind::MySql);
        assert_eq!(args.ts.as_ref().map(SnapshotId::as_str), Some("20251108T184125Z"));
        assert!(args.check);
        assert!(!args.refresh);
    }

    #[test]
    fn invalid_timestamp_is_rejected() {
        let result =
            Cli::try_parse_from(["lms_backup", "restore", "mongodb", "--ts", "yesterday"]);
        assert!(result.is_err());
    }

    #[test]
    fn list_conflicts_with_ts() {
        let result = Cli::try_parse_from([
            "lms_backup",
            "restore",
            "mysql",
            "--list",
            "--ts",
            "20251108T184125Z",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let cli = parse(&[
            "--store-url",
            "file:///mnt/backups",
            "--mysql-host",
            "db.internal",
            "restore",
            "mongodb",
            "--import-mode",
            "container",
            "--workdir",
            "/tmp/restore",
        ]);
        let mut config = Config::default();
        config.backends.mysql.port = 3307;

        cli.apply_overrides(&mut config);

        assert_eq!(config.store.url, "file:///mnt/backups");
        assert_eq!(config.backends.mysql.host, "db.internal");
        assert_eq!(config.backends.mysql.port, 3307);
        assert_eq!(config.restore_dir, PathBuf::from("/tmp/restore"));
        assert_eq!(config.backends.mongodb.import_mode, ImportMode::Container);
        assert_eq!(config.backup_dir, Config::default().backup_dir);
    }

    #[test]
    fn backup_selection() {
        let cli = parse(&["backup", "--only", "mongodb", "--stop-services"]);
        let Action::Backup(args) = &cli.action else {
            panic!("expected backup: {cli:?}");
        };

        assert_eq!(args.only, [DatastoreKind::MongoDb]);
        assert!(args.stop_services);
        assert!(!args.list);
    }

    #[test]
    fn prompt_password_accepts_conventional_values() {
        let prompt_password = |value: &str| {
            std::env::set_var("LMS_PROMPT_PASSWORD", value);
            let cli = Cli::try_parse_from(["lms_backup", "restore", "mysql"]);
            std::env::remove_var("LMS_PROMPT_PASSWORD");

            match cli.unwrap().action {
                Action::Restore(args) => args.prompt_password,
                action => panic!("expected restore: {action:?}"),
            }
        };

        for value in ["1", "yes", "on", "true"] {
            assert!(prompt_password(value), "{value} should enable prompting");
        }
        for value in ["0", "no", "off", "false"] {
            assert!(!prompt_password(value), "{value} should disable prompting");
        }
    }
}
