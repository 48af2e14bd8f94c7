//! Detached SHA-256 checksum records of snapshot archives.
//!
//! A record is a single line compatible with `sha256sum`:
//! `<hex digest>  <file name>`.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};
use sha2::{Digest, Sha256};

/// Extension appended to the archive's file name.
pub const EXTENSION: &str = "sha256";

const DIGEST_HEX_LEN: usize = 64;

/// Parsed content of a checksum record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    /// Lowercase hex encoded SHA-256 digest.
    pub digest: String,
    /// File name the digest was computed for, if recorded.
    pub file_name: Option<String>,
}

impl ChecksumRecord {
    pub fn parse(content: &str) -> Option<Self> {
        let mut fields = content.split_whitespace();
        let digest = fields.next()?.to_ascii_lowercase();
        if digest.len() != DIGEST_HEX_LEN || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        // sha256sum marks binary mode with a leading '*'
        let file_name = fields
            .next()
            .map(|name| name.trim_start_matches('*').to_string());

        Some(Self { digest, file_name })
    }
}

impl std::fmt::Display for ChecksumRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file_name {
            Some(file_name) => write!(f, "{}  {file_name}", self.digest),
            None => f.write_str(&self.digest),
        }
    }
}

#[derive(Debug, Display, Error)]
/// Errors on verifying an archive against its checksum record.
pub enum ChecksumError {
    /// Reading the archive or the record failed.
    #[display("Reading {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    /// The record doesn't contain a SHA-256 digest.
    #[display("Checksum record {} is malformed", _0.display())]
    Malformed(#[error(ignore)] PathBuf),
    /// The archive doesn't match the recorded digest.
    #[display(
        "Checksum mismatch for {}: expected {expected}, computed {actual}",
        archive.display()
    )]
    Mismatch {
        archive: PathBuf,
        expected: String,
        actual: String,
    },
}

/// Path of the checksum record belonging to `archive`.
pub fn record_path(archive: &Path) -> PathBuf {
    let mut path = archive.as_os_str().to_owned();
    path.push(".");
    path.push(EXTENSION);
    PathBuf::from(path)
}

/// Streams the file at `path` through SHA-256.
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// Computes the digest of `archive` and writes it next to it.
///
/// Returns the path of the written record alongside its content.
pub fn write(archive: &Path) -> io::Result<(PathBuf, ChecksumRecord)> {
    let digest = digest_file(archive)?;
    let record = ChecksumRecord {
        digest,
        file_name: archive
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
    };

    let path = record_path(archive);
    fs::write(&path, format!("{record}\n"))?;
    log::debug!(target: "snapshot::checksum", "Wrote checksum record {}", path.display());

    Ok((path, record))
}

/// Verifies `archive` against the record stored at `record`.
///
/// Only the archive's bytes are considered; a deviating file name in the
/// record is reported but doesn't fail the verification.
pub fn verify(archive: &Path, record: &Path) -> Result<(), ChecksumError> {
    let content = fs::read_to_string(record).map_err(|source| ChecksumError::Io {
        path: record.to_path_buf(),
        source,
    })?;
    let expected =
        ChecksumRecord::parse(&content).ok_or_else(|| ChecksumError::Malformed(record.into()))?;

    let archive_name = archive.file_name().map(|name| name.to_string_lossy());
    if let (Some(recorded), Some(actual)) = (&expected.file_name, &archive_name) {
        if recorded != actual {
            log::warn!(
                target: "snapshot::checksum",
                "Checksum record names {recorded} but verifies {actual}"
            );
        }
    }

    let actual = digest_file(archive).map_err(|source| ChecksumError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    if actual != expected.digest {
        return Err(ChecksumError::Mismatch {
            archive: archive.to_path_buf(),
            expected: expected.digest,
            actual,
        });
    }

    log::info!(target: "snapshot::checksum", "Checksum of {} verified", archive.display());
    Ok(())
}
