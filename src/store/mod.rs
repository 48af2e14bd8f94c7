//! Object storage holding the published snapshots.
//!
//! Every snapshot lives under its own prefix: `<root>/<TS>/` contains the
//! archive `<TS>.tar.gz` and its checksum record `<TS>.tar.gz.sha256`.
//!
//! The transport itself is delegated, see [AwsCliStore] and [LocalStore].

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::snapshot::SnapshotId;
use crate::util::process::CommandError;

mod local;
mod s3;

pub use local::LocalStore;
pub use s3::AwsCliStore;

#[derive(Debug, Display, Error, From)]
/// Errors of the storage transport.
pub enum StoreError {
    /// The storage client failed.
    #[from]
    Command(CommandError),
    /// Transferring a file failed.
    #[display("Transfer of {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    /// The listing returned by the storage client can't be interpreted.
    #[display("Unexpected snapshot listing: {_0}")]
    Listing(#[error(ignore)] String),
    /// No transport is known for the store URL.
    #[display("Unsupported store URL: {_0}")]
    UnsupportedUrl(#[error(ignore)] String),
}

impl StoreError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of [SnapshotStore::download].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// The local file was present already; nothing was transferred.
    Cached,
    /// The file was transferred.
    Transferred,
}

/// Configuration of the snapshot store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Location of the snapshots.
    ///
    /// Either `s3://bucket[/prefix]` or `file:///path` (a bare path works as well).
    pub url: String,

    /// Custom endpoint for S3 compatible storage providers.
    pub endpoint_url: Option<String>,

    /// Profile of the `aws` CLI to use.
    pub profile: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "s3://lms-backups".into(),
            endpoint_url: None,
            profile: None,
        }
    }
}

/// Storage of published snapshots.
pub trait SnapshotStore {
    /// Human readable location of `name` below the prefix of `ts`.
    fn url(&self, ts: &SnapshotId, name: &str) -> String;

    /// External commands needed by the transport.
    fn required_tools(&self) -> Vec<&str>;

    /// Lists the snapshots present in the store, in ascending order.
    fn list(&self) -> Result<Vec<SnapshotId>, StoreError>;

    /// Uploads `local` as `name` below the prefix of `ts`.
    fn upload(&self, local: &Path, ts: &SnapshotId, name: &str) -> Result<(), StoreError>;

    /// Copies `name` below the prefix of `ts` to `local`, unconditionally.
    fn fetch(&self, ts: &SnapshotId, name: &str, local: &Path) -> Result<(), StoreError>;

    /// Downloads `name` below the prefix of `ts` to `local`.
    ///
    /// Nothing is transferred if `local` exists and no `refresh` is requested.
    /// The file only appears at `local` once it was transferred completely.
    fn download(
        &self,
        ts: &SnapshotId,
        name: &str,
        local: &Path,
        refresh: bool,
    ) -> Result<Transfer, StoreError> {
        if local.is_file() && !refresh {
            log::info!(target: "store", "Using cached {}", local.display());
            return Ok(Transfer::Cached);
        }

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(StoreError::io(parent))?;
        }
        let part = part_path(local);
        log::info!(
            target: "store",
            "Downloading {} to {}",
            self.url(ts, name),
            local.display()
        );
        if let Err(e) = self.fetch(ts, name, &part) {
            if let Err(cleanup) = fs::remove_file(&part) {
                log::debug!(target: "store", "Removing {} failed: {cleanup}", part.display());
            }
            return Err(e);
        }
        fs::rename(&part, local).map_err(StoreError::io(local))?;

        Ok(Transfer::Transferred)
    }
}

/// Temporary name of a file while it's being transferred.
pub(crate) fn part_path(path: &Path) -> PathBuf {
    let mut part = OsString::from(path.as_os_str());
    part.push(".part");
    PathBuf::from(part)
}

/// Sorts and deduplicates the snapshot ids of a listing.
///
/// Entries are stripped of trailing separators; blank entries and entries
/// that aren't snapshot ids are skipped.
pub(crate) fn snapshot_ids<'a>(
    entries: impl IntoIterator<Item = &'a str>,
) -> Vec<SnapshotId> {
    let mut ids: Vec<SnapshotId> = entries
        .into_iter()
        .map(|entry| entry.trim().trim_end_matches('/'))
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse() {
            Ok(id) => Some(id),
            Err(e) => {
                log::debug!(target: "store", "Skipping foreign entry: {e}");
                None
            }
        })
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Opens the store configured by `config`.
pub fn open(config: &StoreConfig) -> Result<Box<dyn SnapshotStore>, StoreError> {
    let url = config.url.trim();
    if let Some(location) = url.strip_prefix("s3://") {
        let (bucket, prefix) = match location.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
            None => (location, ""),
        };
        if bucket.is_empty() {
            return Err(StoreError::UnsupportedUrl(url.to_string()));
        }

        let store = AwsCliStore::new(bucket, prefix)
            .with_endpoint_url(config.endpoint_url.clone())
            .with_profile(config.profile.clone());
        Ok(Box::new(store))
    } else if let Some(path) = url.strip_prefix("file://") {
        Ok(Box::new(LocalStore::new(path)))
    } else if url.contains("://") || url.is_empty() {
        Err(StoreError::UnsupportedUrl(url.to_string()))
    } else {
        Ok(Box::new(LocalStore::new(url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_url(url: &str) -> StoreConfig {
        StoreConfig {
            url: url.into(),
            ..Default::default()
        }
    }

    #[test]
    fn listing_is_sorted_and_filtered() {
        let ids = snapshot_ids([
            "20251108T184125Z/",
            "",
            "   ",
            "lost+found/",
            "20240101T000000Z",
            "20251108T184125Z",
        ]);

        let ids: Vec<&str> = ids.iter().map(SnapshotId::as_str).collect();
        assert_eq!(ids, ["20240101T000000Z", "20251108T184125Z"]);
    }

    #[test]
    fn opens_store_by_scheme() {
        let s3 = open(&store_url("s3://bucket/some/prefix/")).unwrap();
        let ts: SnapshotId = "20251108T184125Z".parse().unwrap();
        assert_eq!(
            s3.url(&ts, &ts.archive_name()),
            "s3://bucket/some/prefix/20251108T184125Z/20251108T184125Z.tar.gz"
        );

        let local = open(&store_url("file:///srv/backups")).unwrap();
        assert_eq!(local.url(&ts, "x"), "/srv/backups/20251108T184125Z/x");

        assert!(open(&store_url("gs://bucket")).is_err());
        assert!(open(&store_url("s3://")).is_err());
    }

    /// Store whose transfers break off after writing a few bytes.
    struct BrokenTransfer;

    impl SnapshotStore for BrokenTransfer {
        fn url(&self, ts: &SnapshotId, name: &str) -> String {
            format!("broken://{ts}/{name}")
        }

        fn required_tools(&self) -> Vec<&str> {
            Vec::new()
        }

        fn list(&self) -> Result<Vec<SnapshotId>, StoreError> {
            Ok(Vec::new())
        }

        fn upload(&self, local: &Path, _ts: &SnapshotId, _name: &str) -> Result<(), StoreError> {
            Err(StoreError::Io {
                path: local.to_path_buf(),
                source: io::Error::other("connection reset"),
            })
        }

        fn fetch(&self, _ts: &SnapshotId, _name: &str, local: &Path) -> Result<(), StoreError> {
            fs::write(local, b"\x1f\x8b").map_err(StoreError::io(local))?;
            Err(StoreError::Io {
                path: local.to_path_buf(),
                source: io::Error::other("connection reset"),
            })
        }
    }

    #[test]
    fn interrupted_download_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let ts: SnapshotId = "20251108T184125Z".parse().unwrap();
        let local = dir.path().join(ts.archive_name());

        let result = BrokenTransfer.download(&ts, &ts.archive_name(), &local, false);

        let Err(StoreError::Io { source, .. }) = &result else {
            panic!("unexpected result: {result:?}");
        };
        assert_eq!(source.to_string(), "connection reset");
        assert!(!local.exists());
        assert!(!part_path(&local).exists());
    }
}
