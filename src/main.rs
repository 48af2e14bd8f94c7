use std::process::ExitCode;

use lms_backup_lib::backends::{Datastore, DatastoreKind};
use lms_backup_lib::backup::{self, BackupOptions};
use lms_backup_lib::cli::{Action, BackupArgs, Cli, RestoreArgs};
use lms_backup_lib::config::Config;
use lms_backup_lib::platform::ServiceControl;
use lms_backup_lib::restore::{self, RestoreOptions, Selection};
use lms_backup_lib::store::{self, SnapshotStore};

use clap::{Parser, ValueEnum};
use log::LevelFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    env_logger.filter_level(LevelFilter::Info).parse_default_env();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    let dry_run = cli.dry_run;
    if dry_run {
        log::warn!("Running in dry-run mode");
    }

    let store = match store::open(&config.store) {
        Ok(store) => store,
        Err(e) => {
            log::error!(target: "store", "{e}");
            return ExitCode::FAILURE;
        }
    };

    match &cli.action {
        Action::List
        | Action::Backup(BackupArgs { list: true, .. })
        | Action::Restore(RestoreArgs { list: true, .. }) => list(store.as_ref()),
        Action::Backup(args) => run_backup(&config, store.as_ref(), args, dry_run),
        Action::Restore(args) => run_restore(&config, store.as_ref(), args, dry_run),
    }
}

fn list(store: &dyn SnapshotStore) -> ExitCode {
    match store.list() {
        Ok(snapshots) if snapshots.is_empty() => {
            log::warn!(target: "store", "No snapshots found");
            ExitCode::SUCCESS
        }
        Ok(snapshots) => {
            for ts in snapshots {
                println!("{ts}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!(target: "store", "Listing snapshots failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_backup(
    config: &Config,
    store: &dyn SnapshotStore,
    args: &BackupArgs,
    dry_run: bool,
) -> ExitCode {
    let kinds: Vec<DatastoreKind> = if args.only.is_empty() {
        DatastoreKind::value_variants().to_vec()
    } else {
        args.only.clone()
    };
    let datastores: Vec<&dyn Datastore> = kinds
        .iter()
        .map(|&kind| config.backends.datastore(kind))
        .collect();
    let services = args
        .stop_services
        .then_some(&config.services as &dyn ServiceControl);

    let options = BackupOptions {
        dry_run,
        delete_local: config.delete_local,
    };
    match backup::run(&config.backup_dir, store, &datastores, services, options) {
        Ok(report) => {
            log::info!(target: "backup", "Backup {} finished", report.ts);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!(target: "backup", "Backup resulted in a fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_restore(
    config: &Config,
    store: &dyn SnapshotStore,
    args: &RestoreArgs,
    dry_run: bool,
) -> ExitCode {
    let datastore = config.backends.datastore(args.datastore);
    let services = args
        .stop_services
        .then_some(&config.services as &dyn ServiceControl);
    let selection = Selection::from(args.ts.clone());

    let options = RestoreOptions {
        dry_run,
        refresh: args.refresh,
        check: args.check,
    };
    match restore::run(&config.restore_dir, store, datastore, services, &selection, options) {
        Ok(report) => {
            log::info!(
                target: "restore",
                "Restore of {} from {} finished",
                args.datastore,
                report.ts
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!(target: "restore", "Restore resulted in a fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}
