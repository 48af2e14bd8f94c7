//! Producing snapshots: dump, package, checksum, upload.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::backends::{BackendError, Datastore, DatastoreKind, Operation};
use crate::platform::{ServiceControl, ServiceGuard};
use crate::snapshot::archive::{self, ArchiveError};
use crate::snapshot::{checksum, SnapshotId};
use crate::store::SnapshotStore;
use crate::util::process::{self, MissingDependency};

/// Options of a backup run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackupOptions {
    /// Print the commands instead of executing them.
    pub dry_run: bool,
    /// Delete the local archive and checksum once both were uploaded.
    pub delete_local: bool,
}

#[derive(Debug, Display, Error, From)]
/// Errors of a backup run.
pub enum BackupError {
    #[from]
    MissingDependency(MissingDependency),
    /// Creating or cleaning the dump directory failed.
    #[display("Preparing {} failed: {source}", path.display())]
    Workdir { path: PathBuf, source: io::Error },
    /// Dumping a datastore failed.
    #[display("Dump of {kind} failed: {source}")]
    Dump {
        kind: DatastoreKind,
        source: BackendError,
    },
    /// Packaging the dumps failed.
    #[from]
    Archive(ArchiveError),
    /// Writing the checksum record failed.
    #[display("Writing the checksum of {} failed: {source}", archive.display())]
    Checksum { archive: PathBuf, source: io::Error },
    /// Publishing the snapshot failed; the local copies are kept.
    #[display(
        "Upload of snapshot {ts} failed for {failed} of 2 files, local copies kept at {}",
        archive.display()
    )]
    Upload {
        ts: SnapshotId,
        failed: usize,
        archive: PathBuf,
    },
}

/// Outcome of a backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub ts: SnapshotId,
    /// Local archive; deleted already if requested.
    pub archive: PathBuf,
    /// Local checksum record; deleted already if requested.
    pub checksum: PathBuf,
}

/// External commands a backup of `datastores` to `store` needs.
fn required_tools<'a>(
    store: &'a dyn SnapshotStore,
    datastores: &[&'a dyn Datastore],
    services: Option<&'a dyn ServiceControl>,
) -> Vec<&'a str> {
    let mut tools = store.required_tools();
    for &datastore in datastores {
        tools.extend(datastore.required_tools(Operation::Dump));
    }
    if let Some(services) = services {
        tools.extend(services.required_tools());
    }
    tools
}

/// Creates a snapshot of `datastores` in `backup_dir` and uploads it to `store`.
///
/// If `services` are given they're stopped during the dumps and started again
/// afterwards, even if a dump fails.
///
/// Upload failures don't abort the run: the local archive and checksum are
/// always kept and [BackupError::Upload] is returned at the end.
pub fn run(
    backup_dir: &Path,
    store: &dyn SnapshotStore,
    datastores: &[&dyn Datastore],
    services: Option<&dyn ServiceControl>,
    options: BackupOptions,
) -> Result<BackupReport, BackupError> {
    let BackupOptions { dry_run, delete_local } = options;

    process::require_tools(required_tools(store, datastores, services))?;

    let ts = SnapshotId::generate();
    let dump_dir = ts.workdir(backup_dir);
    let archive_path = backup_dir.join(ts.archive_name());
    let checksum_path = checksum::record_path(&archive_path);
    log::info!(target: "backup", "Creating snapshot {ts}");

    if !dry_run {
        fs::create_dir_all(&dump_dir).map_err(|source| BackupError::Workdir {
            path: dump_dir.clone(),
            source,
        })?;
    }

    {
        let _services = services.map(|services| ServiceGuard::stop(services, dry_run));
        for datastore in datastores {
            let kind = datastore.kind();
            let payload = datastore
                .dump(&dump_dir, dry_run)
                .map_err(|source| BackupError::Dump { kind, source })?;
            log::debug!(target: "backup", "Dumped {kind} to {}", payload.display());
        }
    }

    let report = BackupReport {
        ts: ts.clone(),
        archive: archive_path.clone(),
        checksum: checksum_path.clone(),
    };

    if dry_run {
        println!(
            "[dry-run] package {} into {}",
            dump_dir.display(),
            archive_path.display()
        );
        println!("[dry-run] write checksum {}", checksum_path.display());
        for (local, name) in [
            (&archive_path, ts.archive_name()),
            (&checksum_path, ts.checksum_name()),
        ] {
            println!(
                "[dry-run] upload {} to {}",
                local.display(),
                store.url(&ts, &name)
            );
        }
        return Ok(report);
    }

    let archive_path = archive::package(&dump_dir, &ts, backup_dir)?;
    if let Err(e) = fs::remove_dir_all(&dump_dir) {
        log::warn!(
            target: "backup",
            "Removing dump directory {} failed: {e}",
            dump_dir.display()
        );
    }
    let (checksum_path, record) =
        checksum::write(&archive_path).map_err(|source| BackupError::Checksum {
            archive: archive_path.clone(),
            source,
        })?;
    log::info!(target: "backup", "Snapshot {ts} packaged, sha256 {}", record.digest);

    // the archive goes first: a checksum always refers to an uploaded archive
    let mut failed = 0;
    for (local, name) in [
        (&archive_path, ts.archive_name()),
        (&checksum_path, ts.checksum_name()),
    ] {
        if let Err(e) = store.upload(local, &ts, &name) {
            log::warn!(target: "backup", "Upload of {name} failed: {e}");
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(BackupError::Upload {
            ts,
            failed,
            archive: archive_path,
        });
    }
    log::info!(target: "backup", "Snapshot {ts} published to {}", store.url(&ts, ""));

    if delete_local {
        for local in [&archive_path, &checksum_path] {
            fs::remove_file(local).map_err(|source| BackupError::Workdir {
                path: local.clone(),
                source,
            })?;
        }
        log::info!(target: "backup", "Deleted local copies of snapshot {ts}");
    }

    Ok(report)
}
