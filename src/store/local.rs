use std::fs;
use std::path::{Path, PathBuf};

use crate::snapshot::SnapshotId;

use super::{part_path, snapshot_ids, SnapshotStore, StoreError};

/// Snapshot store in a local directory, e.g. a mounted network share.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, ts: &SnapshotId, name: &str) -> PathBuf {
        ts.workdir(&self.root).join(name)
    }
}

impl SnapshotStore for LocalStore {
    fn url(&self, ts: &SnapshotId, name: &str) -> String {
        self.path(ts, name).display().to_string()
    }

    fn required_tools(&self) -> Vec<&str> {
        Vec::new()
    }

    fn list(&self) -> Result<Vec<SnapshotId>, StoreError> {
        log::debug!(target: "store::local", "Listing snapshots in {}", self.root.display());

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(StoreError::io(&self.root))? {
            let entry = entry.map_err(StoreError::io(&self.root))?;
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        Ok(snapshot_ids(names.iter().map(String::as_str)))
    }

    fn upload(&self, local: &Path, ts: &SnapshotId, name: &str) -> Result<(), StoreError> {
        let remote = self.path(ts, name);
        log::info!(target: "store::local", "Copying {} to {}", local.display(), remote.display());

        let prefix = ts.workdir(&self.root);
        fs::create_dir_all(&prefix).map_err(StoreError::io(&prefix))?;
        let part = part_path(&remote);
        fs::copy(local, &part).map_err(StoreError::io(local))?;
        fs::rename(&part, &remote).map_err(StoreError::io(&remote))?;

        Ok(())
    }

    fn fetch(&self, ts: &SnapshotId, name: &str, local: &Path) -> Result<(), StoreError> {
        let remote = self.path(ts, name);
        fs::copy(&remote, local).map_err(StoreError::io(&remote))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Transfer;

    use super::*;

    fn ts() -> SnapshotId {
        "20251108T184125Z".parse().unwrap()
    }

    #[test]
    fn lists_only_snapshot_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("20251108T184125Z")).unwrap();
        fs::create_dir(dir.path().join("20240101T000000Z")).unwrap();
        fs::create_dir(dir.path().join("scratch")).unwrap();
        fs::write(dir.path().join("20230101T000000Z"), b"file, not a prefix").unwrap();

        let ids = LocalStore::new(dir.path()).list().unwrap();
        let ids: Vec<&str> = ids.iter().map(SnapshotId::as_str).collect();
        assert_eq!(ids, ["20240101T000000Z", "20251108T184125Z"]);
    }

    #[test]
    fn missing_root_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("unmounted"));

        assert!(matches!(store.list(), Err(StoreError::Io { .. })));
    }

    #[test]
    fn upload_then_download_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store"));
        let source = dir.path().join("source.tar.gz");
        fs::write(&source, b"\x1f\x8b\x08 archive").unwrap();

        store.upload(&source, &ts(), &ts().archive_name()).unwrap();
        let target = dir.path().join("cache").join(ts().archive_name());
        let transfer = store
            .download(&ts(), &ts().archive_name(), &target, false)
            .unwrap();

        assert_eq!(transfer, Transfer::Transferred);
        assert_eq!(fs::read(&target).unwrap(), fs::read(&source).unwrap());
        assert!(!part_path(&target).exists());
    }

    #[test]
    fn second_download_is_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store"));
        let source = dir.path().join("source");
        fs::write(&source, b"first").unwrap();
        store.upload(&source, &ts(), "payload").unwrap();

        let target = dir.path().join("cache/payload");
        store.download(&ts(), "payload", &target, false).unwrap();

        // the remote changes, the cache must not
        fs::write(&source, b"second").unwrap();
        store.upload(&source, &ts(), "payload").unwrap();

        let transfer = store.download(&ts(), "payload", &target, false).unwrap();
        assert_eq!(transfer, Transfer::Cached);
        assert_eq!(fs::read(&target).unwrap(), b"first");

        let transfer = store.download(&ts(), "payload", &target, true).unwrap();
        assert_eq!(transfer, Transfer::Transferred);
        assert_eq!(fs::read(&target).unwrap(), b"second");
    }

    #[test]
    fn failed_download_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store"));
        let target = dir.path().join("cache/missing");

        assert!(store.download(&ts(), "missing", &target, false).is_err());
        assert!(!target.exists());
        assert!(!part_path(&target).exists());
    }
}
