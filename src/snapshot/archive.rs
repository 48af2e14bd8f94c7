//! Packaging of dump directories into snapshot tarballs and extraction of
//! single payloads from them.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};

use derive_more::{Display, Error};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, HeaderMode};

use super::SnapshotId;

/// Number of archive entries reported when a payload can't be found.
pub const LISTING_LIMIT: usize = 50;

#[derive(Debug, Display, Error)]
/// Errors on packaging or reading a snapshot archive.
pub enum ArchiveError {
    /// Reading or writing the archive failed.
    #[display("Archive I/O on {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    /// No entry of the archive matches the payload.
    #[display(
        "Payload {payload} not found in {} ({total} entries), first entries:\n{}",
        archive.display(),
        listing.join("\n")
    )]
    PayloadNotFound {
        archive: PathBuf,
        payload: String,
        /// The first [LISTING_LIMIT] entries of the archive.
        listing: Vec<String>,
        total: usize,
    },
    /// The payload isn't present at its canonical path after extraction.
    #[display("Extraction of {internal} did not produce {}", expected.display())]
    Extraction { internal: String, expected: PathBuf },
}

impl ArchiveError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of [extract_and_normalize].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    /// The canonical file was already present.
    Cached,
    /// The payload was extracted from the archive.
    Extracted,
}

/// Packages `source_dir` into `<dest_dir>/<TS>.tar.gz` with `TS/` as root entry.
///
/// Headers are written in deterministic mode, so the same directory content
/// results in an equivalent archive.
pub fn package(
    source_dir: &Path,
    ts: &SnapshotId,
    dest_dir: &Path,
) -> Result<PathBuf, ArchiveError> {
    let archive_path = dest_dir.join(ts.archive_name());
    log::info!(
        target: "snapshot::archive",
        "Packaging {} into {}",
        source_dir.display(),
        archive_path.display()
    );

    let file = File::create(&archive_path).map_err(ArchiveError::io(&archive_path))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

    let mut builder = Builder::new(encoder);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(ts.as_str(), source_dir)
        .map_err(ArchiveError::io(source_dir))?;

    let encoder = builder
        .into_inner()
        .map_err(ArchiveError::io(&archive_path))?;
    let writer = encoder.finish().map_err(ArchiveError::io(&archive_path))?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .and_then(|file| file.sync_all())
        .map_err(ArchiveError::io(&archive_path))?;

    log::debug!(target: "snapshot::archive", "Packaged {}", archive_path.display());
    Ok(archive_path)
}

fn open(archive_path: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>, ArchiveError> {
    let file = File::open(archive_path).map_err(ArchiveError::io(archive_path))?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn matches_payload(entry_path: &str, payload: &str) -> bool {
    let entry_path = entry_path.trim_end_matches('/');
    entry_path == payload || entry_path.ends_with(&format!("/{payload}"))
}

/// Finds the first entry of the archive named `payload`, at any depth.
///
/// If the basename occurs more than once the first occurrence wins.
pub fn locate(archive_path: &Path, payload: &str) -> Result<String, ArchiveError> {
    let mut archive = open(archive_path)?;
    let mut listing = Vec::new();
    let mut total = 0;

    for entry in archive.entries().map_err(ArchiveError::io(archive_path))? {
        let entry = entry.map_err(ArchiveError::io(archive_path))?;
        let entry_path = entry
            .path()
            .map_err(ArchiveError::io(archive_path))?
            .to_string_lossy()
            .into_owned();

        if entry.header().entry_type().is_file() && matches_payload(&entry_path, payload) {
            log::debug!(target: "snapshot::archive", "Located {payload} at {entry_path}");
            return Ok(entry_path);
        }

        total += 1;
        if listing.len() < LISTING_LIMIT {
            listing.push(entry_path);
        }
    }

    Err(ArchiveError::PayloadNotFound {
        archive: archive_path.to_path_buf(),
        payload: payload.to_string(),
        listing,
        total,
    })
}

/// Extracts the entry `internal` of the archive to `<dest_dir>/<canonical>`.
///
/// Directories created by the extraction are removed again once empty.
/// If the canonical file is already present and `refresh` isn't set, the
/// archive isn't touched.
pub fn extract_and_normalize(
    archive_path: &Path,
    internal: &str,
    dest_dir: &Path,
    canonical: &str,
    refresh: bool,
) -> Result<Extraction, ArchiveError> {
    let target = dest_dir.join(canonical);
    if target.is_file() && !refresh {
        log::info!(target: "snapshot::archive", "Using cached {}", target.display());
        return Ok(Extraction::Cached);
    }

    fs::create_dir_all(dest_dir).map_err(ArchiveError::io(dest_dir))?;
    let mut archive = open(archive_path)?;
    let mut extracted = None;
    for entry in archive.entries().map_err(ArchiveError::io(archive_path))? {
        let mut entry = entry.map_err(ArchiveError::io(archive_path))?;
        let entry_path = entry
            .path()
            .map_err(ArchiveError::io(archive_path))?
            .into_owned();
        if entry_path.to_string_lossy() != internal {
            continue;
        }

        log::debug!(
            target: "snapshot::archive",
            "Extracting {internal} into {}",
            dest_dir.display()
        );
        let unpacked = entry
            .unpack_in(dest_dir)
            .map_err(ArchiveError::io(archive_path))?;
        // entries escaping dest_dir are skipped by unpack_in
        if unpacked {
            extracted = Some(normalized_relative(&entry_path));
        }
        break;
    }

    let missing = || ArchiveError::Extraction {
        internal: internal.to_string(),
        expected: target.clone(),
    };
    let relative = extracted.ok_or_else(missing)?;
    let unpacked = dest_dir.join(&relative);

    if unpacked != target {
        if fs::rename(&unpacked, &target).is_err() {
            fs::copy(&unpacked, &target).map_err(ArchiveError::io(&target))?;
            fs::remove_file(&unpacked).map_err(ArchiveError::io(&unpacked))?;
        }
        remove_empty_parents(&relative, dest_dir);
    }

    if !target.is_file() {
        return Err(missing());
    }

    log::info!(target: "snapshot::archive", "Extracted {internal} to {}", target.display());
    Ok(Extraction::Extracted)
}

/// Path of an archive entry as [tar::Entry::unpack_in] places it.
fn normalized_relative(entry_path: &Path) -> PathBuf {
    entry_path
        .components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .collect()
}

fn remove_empty_parents(relative: &Path, dest_dir: &Path) {
    for parent in relative.ancestors().skip(1) {
        if parent.as_os_str().is_empty() {
            break;
        }
        // fails on non-empty directories, which is intended
        if fs::remove_dir(dest_dir.join(parent)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn ts() -> SnapshotId {
        "20251108T184125Z".parse().unwrap()
    }

    /// Writes a gzipped tarball with the given `(path, content)` files.
    fn tarball(dir: &Path, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("test.tar.gz");
        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::fast());
        let mut builder = Builder::new(encoder);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn package_roots_archive_at_snapshot_id() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("dump");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("mysql.sql.gz"), b"mysql").unwrap();
        fs::write(source.join("nested/mongodb.archive.gz"), b"mongo").unwrap();

        let archive_path = package(&source, &ts(), dir.path()).unwrap();
        assert_eq!(archive_path, dir.path().join("20251108T184125Z.tar.gz"));

        let mut archive = open(&archive_path).unwrap();
        let mut paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .map(|p| p.trim_end_matches('/').to_string())
            .collect();
        paths.sort();

        assert_eq!(
            paths,
            [
                "20251108T184125Z",
                "20251108T184125Z/mysql.sql.gz",
                "20251108T184125Z/nested",
                "20251108T184125Z/nested/mongodb.archive.gz",
            ]
        );
    }

    #[test]
    fn package_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("dump");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("mysql.sql.gz"), b"mysql").unwrap();

        let first_dir = dir.path().join("first");
        let second_dir = dir.path().join("second");
        fs::create_dir_all(&first_dir).unwrap();
        fs::create_dir_all(&second_dir).unwrap();
        let first = package(&source, &ts(), &first_dir).unwrap();
        let second = package(&source, &ts(), &second_dir).unwrap();

        assert_eq!(
            locate(&first, "mysql.sql.gz").unwrap(),
            locate(&second, "mysql.sql.gz").unwrap()
        );
    }

    #[test]
    fn locate_at_any_depth() {
        let dir = tempfile::tempdir().unwrap();
        for internal in [
            "mysql.sql.gz",
            "20251108T184125Z/mysql.sql.gz",
            "20251108T184125Z/subdir/mysql.sql.gz",
        ] {
            let archive = tarball(dir.path(), &[("other.txt", b"x"), (internal, b"dump")]);
            assert_eq!(locate(&archive, "mysql.sql.gz").unwrap(), internal);
        }
    }

    #[test]
    fn locate_ignores_similar_names() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(
            dir.path(),
            &[("ts/old-mysql.sql.gz", b"x"), ("ts/mysql.sql.gz.bak", b"y")],
        );

        assert!(matches!(
            locate(&archive, "mysql.sql.gz"),
            Err(ArchiveError::PayloadNotFound { .. })
        ));
    }

    #[test]
    fn locate_takes_first_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(
            dir.path(),
            &[("ts/a/mysql.sql.gz", b"first"), ("ts/b/mysql.sql.gz", b"second")],
        );

        assert_eq!(locate(&archive, "mysql.sql.gz").unwrap(), "ts/a/mysql.sql.gz");
    }

    #[test]
    fn missing_payload_reports_bounded_listing() {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = (0..80).map(|i| format!("ts/file-{i:03}")).collect();
        let files: Vec<(&str, &[u8])> = names.iter().map(|n| (n.as_str(), &b"x"[..])).collect();
        let archive = tarball(dir.path(), &files);

        let err = locate(&archive, "mongodb.archive.gz").unwrap_err();
        let ArchiveError::PayloadNotFound { listing, total, .. } = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(*total, 80);
        assert_eq!(listing.len(), LISTING_LIMIT);
        assert_eq!(listing[0], "ts/file-000");
        assert!(err.to_string().contains("ts/file-049"));
        assert!(!err.to_string().contains("ts/file-050"));
    }

    #[test]
    fn extraction_normalizes_nested_payload() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(
            dir.path(),
            &[
                ("20251108T184125Z/subdir/mysql.sql.gz", b"dump"),
                ("20251108T184125Z/mongodb.archive.gz", b"mongo"),
            ],
        );
        let dest = dir.path().join("restore");

        let result = extract_and_normalize(
            &archive,
            "20251108T184125Z/subdir/mysql.sql.gz",
            &dest,
            "mysql.sql.gz",
            false,
        )
        .unwrap();

        assert_eq!(result, Extraction::Extracted);
        assert_eq!(fs::read(dest.join("mysql.sql.gz")).unwrap(), b"dump");
        assert!(!dest.join("20251108T184125Z").exists());
        assert!(!dest.join("mongodb.archive.gz").exists());
    }

    #[test]
    fn extraction_keeps_unrelated_directories() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(dir.path(), &[("ts/mysql.sql.gz", b"dump")]);
        let dest = dir.path().join("restore");
        fs::create_dir_all(dest.join("ts")).unwrap();
        fs::write(dest.join("ts/keep"), b"keep").unwrap();

        extract_and_normalize(&archive, "ts/mysql.sql.gz", &dest, "mysql.sql.gz", false).unwrap();

        assert!(dest.join("ts/keep").is_file());
        assert!(dest.join("mysql.sql.gz").is_file());
    }

    #[test]
    fn extraction_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(dir.path(), &[("ts/mysql.sql.gz", b"dump")]);
        let dest = dir.path().join("restore");

        let first =
            extract_and_normalize(&archive, "ts/mysql.sql.gz", &dest, "mysql.sql.gz", false);
        assert_eq!(first.unwrap(), Extraction::Extracted);
        let extracted = fs::read(dest.join("mysql.sql.gz")).unwrap();

        // a cache hit must not even open the archive
        fs::remove_file(&archive).unwrap();
        let second =
            extract_and_normalize(&archive, "ts/mysql.sql.gz", &dest, "mysql.sql.gz", false);
        assert_eq!(second.unwrap(), Extraction::Cached);
        assert_eq!(fs::read(dest.join("mysql.sql.gz")).unwrap(), extracted);
    }

    #[test]
    fn refresh_overwrites_cached_payload() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(dir.path(), &[("mysql.sql.gz", b"fresh")]);
        let dest = dir.path().join("restore");
        fs::create_dir_all(&dest).unwrap();
        File::create(dest.join("mysql.sql.gz"))
            .unwrap()
            .write_all(b"stale")
            .unwrap();

        let result = extract_and_normalize(&archive, "mysql.sql.gz", &dest, "mysql.sql.gz", true);

        assert_eq!(result.unwrap(), Extraction::Extracted);
        assert_eq!(fs::read(dest.join("mysql.sql.gz")).unwrap(), b"fresh");
    }

    #[test]
    fn extraction_of_unknown_entry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(dir.path(), &[("ts/mysql.sql.gz", b"dump")]);

        assert!(matches!(
            extract_and_normalize(&archive, "ts/other", dir.path(), "mysql.sql.gz", false),
            Err(ArchiveError::Extraction { .. })
        ));
    }
}
