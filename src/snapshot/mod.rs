//! Naming, packaging and verification of snapshots.
//!
//! A snapshot is the output of one backup run. It is addressed by a
//! [SnapshotId] and consists of a compressed tarball (see [`archive`]) and a
//! detached checksum record (see [`checksum`]).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use derive_more::{Display, Error};
use regex::Regex;

pub mod archive;
pub mod checksum;

/// Format of a [SnapshotId]: sortable UTC timestamp, e.g. `20251108T184125Z`.
pub const SNAPSHOT_ID_FORMAT: &str = "%Y%m%dT%H%M%SZ";

static SNAPSHOT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}T\d{6}Z$").expect("snapshot id pattern should compile"));

/// Identifier of a snapshot.
///
/// The string representation is lexicographically sortable, so the derived
/// [Ord] yields chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Create a [SnapshotId] from the current UTC time.
    pub fn generate() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(datetime: DateTime<Utc>) -> Self {
        Self(datetime.format(SNAPSHOT_ID_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the snapshot tarball: `<TS>.tar.gz`.
    pub fn archive_name(&self) -> String {
        format!("{}.tar.gz", self.0)
    }

    /// File name of the checksum record: `<TS>.tar.gz.sha256`.
    pub fn checksum_name(&self) -> String {
        format!("{}.{}", self.archive_name(), checksum::EXTENSION)
    }

    /// Local cache directory of this snapshot below `root`.
    pub fn workdir(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SnapshotId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The string isn't a valid [SnapshotId].
#[derive(Debug, Display, Error, PartialEq, Eq)]
#[display("Invalid snapshot id '{_0}', expected the format YYYYMMDDTHHMMSSZ")]
pub struct InvalidSnapshotId(#[error(ignore)] String);

impl FromStr for SnapshotId {
    type Err = InvalidSnapshotId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // chrono alone accepts variable width fields, hence the pattern check
        if !SNAPSHOT_ID_PATTERN.is_match(s)
            || NaiveDateTime::parse_from_str(s, SNAPSHOT_ID_FORMAT).is_err()
        {
            return Err(InvalidSnapshotId(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }
}

/// There are no snapshots to choose from.
#[derive(Debug, Display, Error, PartialEq, Eq)]
#[display("No snapshots available")]
pub struct NoSnapshots;

/// Returns the most recent [SnapshotId] of `candidates`.
pub fn latest<I>(candidates: I) -> Result<SnapshotId, NoSnapshots>
where
    I: IntoIterator<Item = SnapshotId>,
{
    candidates.into_iter().max().ok_or(NoSnapshots)
}
