//! Consuming snapshots: select, download, verify, extract, restore.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::backends::{BackendError, Datastore, DatastoreKind, Operation};
use crate::platform::{ServiceControl, ServiceGuard};
use crate::snapshot::archive::{self, ArchiveError, Extraction};
use crate::snapshot::checksum::{self, ChecksumError};
use crate::snapshot::{self, NoSnapshots, SnapshotId};
use crate::store::{SnapshotStore, StoreError, Transfer};
use crate::util::process::{self, MissingDependency};

/// Snapshot to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The most recent snapshot of the store.
    Latest,
    Snapshot(SnapshotId),
}

impl From<Option<SnapshotId>> for Selection {
    fn from(value: Option<SnapshotId>) -> Self {
        value.map_or(Self::Latest, Self::Snapshot)
    }
}

/// Options of a restore run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Print the commands instead of executing them.
    ///
    /// The store is still listed to resolve the snapshot. If listing fails,
    /// an explicitly selected snapshot is used as is; the latest snapshot
    /// can't be resolved then.
    pub dry_run: bool,
    /// Download and extract again even if cached.
    pub refresh: bool,
    /// Check the datastore after restoring it.
    pub check: bool,
}

#[derive(Debug, Display, Error, From)]
/// Errors of a restore run.
pub enum RestoreError {
    #[from]
    MissingDependency(MissingDependency),
    /// The store doesn't contain any snapshot.
    #[from]
    NoSnapshots(NoSnapshots),
    /// The requested snapshot isn't published.
    #[display("Snapshot {_0} not found in the store")]
    UnknownSnapshot(#[error(ignore)] SnapshotId),
    /// Listing the snapshots failed.
    #[display("Listing snapshots failed: {_0}")]
    List(StoreError),
    /// Downloading a file of the snapshot failed.
    #[display("Download of {name} failed: {source}")]
    Download { name: String, source: StoreError },
    /// Preparing the local cache failed.
    #[display("Preparing {} failed: {source}", path.display())]
    Workdir { path: PathBuf, source: io::Error },
    /// The archive doesn't match its checksum.
    #[from]
    Verification(ChecksumError),
    /// Locating or extracting the payload failed.
    #[from]
    Archive(ArchiveError),
    /// The datastore client failed.
    #[display("Restore of {kind} failed: {source}")]
    Restore {
        kind: DatastoreKind,
        source: BackendError,
    },
    /// The restored datastore doesn't look sane.
    #[display("Post-restore check failed: {_0}")]
    SanityCheck(BackendError),
}

/// Outcome of a restore run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub ts: SnapshotId,
    /// Normalized payload the datastore was restored from.
    pub payload: PathBuf,
    /// Whether the archive was downloaded or taken from the cache.
    pub archive: Transfer,
    /// Whether the payload was extracted or taken from the cache.
    pub extraction: Extraction,
}

/// Picks the snapshot to restore.
pub fn select(
    store: &dyn SnapshotStore,
    selection: &Selection,
) -> Result<SnapshotId, RestoreError> {
    let available = store.list().map_err(RestoreError::List)?;
    match selection {
        Selection::Latest => Ok(snapshot::latest(available)?),
        Selection::Snapshot(ts) if available.contains(ts) => Ok(ts.clone()),
        Selection::Snapshot(ts) => Err(RestoreError::UnknownSnapshot(ts.clone())),
    }
}

/// External commands a restore of `datastore` from `store` needs.
fn required_tools<'a>(
    store: &'a dyn SnapshotStore,
    datastore: &'a dyn Datastore,
    services: Option<&'a dyn ServiceControl>,
    check: bool,
) -> Vec<&'a str> {
    let mut tools = store.required_tools();
    tools.extend(datastore.required_tools(Operation::Restore));
    if check {
        tools.extend(datastore.required_tools(Operation::Check));
    }
    if let Some(services) = services {
        tools.extend(services.required_tools());
    }
    tools
}

fn remove_cached(path: &Path) -> Result<(), RestoreError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(RestoreError::Workdir {
            path: path.to_path_buf(),
            source: e,
        }),
        _ => Ok(()),
    }
}

/// Restores `datastore` from a snapshot of `store`, cached below `restore_dir`.
///
/// Archive and checksum record are downloaded to `<restore_dir>/<TS>/` unless
/// present already. The archive is always verified before the payload is
/// extracted, and the payload is extracted only if it's not present already.
pub fn run(
    restore_dir: &Path,
    store: &dyn SnapshotStore,
    datastore: &dyn Datastore,
    services: Option<&dyn ServiceControl>,
    selection: &Selection,
    options: RestoreOptions,
) -> Result<RestoreReport, RestoreError> {
    let RestoreOptions { dry_run, refresh, check } = options;
    let kind = datastore.kind();

    process::require_tools(required_tools(store, datastore, services, check))?;

    let ts = match (select(store, selection), selection) {
        (Err(RestoreError::List(e)), Selection::Snapshot(ts)) if dry_run => {
            log::warn!(target: "restore", "Listing snapshots failed, assuming {ts} exists: {e}");
            ts.clone()
        }
        (result, _) => result?,
    };
    let workdir = ts.workdir(restore_dir);
    let archive_path = workdir.join(ts.archive_name());
    let checksum_path = workdir.join(ts.checksum_name());
    let payload = workdir.join(kind.payload_name());
    log::info!(target: "restore", "Restoring {kind} from snapshot {ts}");

    if dry_run {
        for (local, name) in [
            (&archive_path, ts.archive_name()),
            (&checksum_path, ts.checksum_name()),
        ] {
            println!(
                "[dry-run] download {} to {}",
                store.url(&ts, &name),
                local.display()
            );
        }
        println!(
            "[dry-run] verify {} against {}",
            archive_path.display(),
            checksum_path.display()
        );
        println!(
            "[dry-run] extract {} to {}",
            kind.payload_name(),
            payload.display()
        );
        {
            let _services = services.map(|services| ServiceGuard::stop(services, dry_run));
            datastore
                .restore(&payload, true)
                .map_err(|source| RestoreError::Restore { kind, source })?;
        }
        if check {
            datastore.sanity_check(true).map_err(RestoreError::SanityCheck)?;
        }

        return Ok(RestoreReport {
            ts,
            payload,
            archive: Transfer::Cached,
            extraction: Extraction::Cached,
        });
    }

    if refresh {
        log::info!(target: "restore", "Dropping cached files of snapshot {ts}");
        for path in [&archive_path, &checksum_path, &payload] {
            remove_cached(path)?;
        }
    }

    let mut transfers = Vec::with_capacity(2);
    for (local, name) in [
        (&archive_path, ts.archive_name()),
        (&checksum_path, ts.checksum_name()),
    ] {
        let transfer = store
            .download(&ts, &name, local, refresh)
            .map_err(|source| RestoreError::Download { name, source })?;
        transfers.push(transfer);
    }

    // nothing is extracted from an archive that fails verification
    checksum::verify(&archive_path, &checksum_path)?;

    let extraction = if payload.is_file() && !refresh {
        log::info!(target: "restore", "Using cached {}", payload.display());
        Extraction::Cached
    } else {
        let internal = archive::locate(&archive_path, kind.payload_name())?;
        archive::extract_and_normalize(
            &archive_path,
            &internal,
            &workdir,
            kind.payload_name(),
            refresh,
        )?
    };

    {
        let _services = services.map(|services| ServiceGuard::stop(services, false));
        datastore
            .restore(&payload, false)
            .map_err(|source| RestoreError::Restore { kind, source })?;
    }

    if check {
        datastore.sanity_check(false).map_err(RestoreError::SanityCheck)?;
    }

    log::info!(target: "restore", "Restored {kind} from snapshot {ts}");
    Ok(RestoreReport {
        ts,
        payload,
        archive: transfers[0],
        extraction,
    })
}
