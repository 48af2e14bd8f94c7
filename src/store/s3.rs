use std::path::Path;
use std::process::Command;

use crate::snapshot::SnapshotId;
use crate::util::process;

use super::{snapshot_ids, SnapshotStore, StoreError};

/// Snapshot store in an S3 bucket, accessed through the [`aws` CLI].
///
/// [`aws` CLI]: https://docs.aws.amazon.com/cli/latest/reference/s3/
#[derive(Debug, Clone)]
pub struct AwsCliStore {
    bucket: String,
    /// Key prefix without leading or trailing separators; may be empty.
    prefix: String,
    endpoint_url: Option<String>,
    profile: Option<String>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    common_prefixes: Option<Vec<CommonPrefix>>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommonPrefix {
    prefix: String,
}

impl AwsCliStore {
    pub fn new(bucket: &str, prefix: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            endpoint_url: None,
            profile: None,
        }
    }

    pub fn with_endpoint_url(mut self, endpoint_url: Option<String>) -> Self {
        self.endpoint_url = endpoint_url;
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// Prefix the snapshot prefixes are located at, with trailing separator.
    fn root(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }

    fn key(&self, ts: &SnapshotId, name: &str) -> String {
        format!("{}{ts}/{name}", self.root())
    }

    fn aws(&self) -> Command {
        let mut command = Command::new("aws");
        if let Some(profile) = &self.profile {
            command.arg("--profile").arg(profile);
        }
        if let Some(endpoint_url) = &self.endpoint_url {
            command.arg("--endpoint-url").arg(endpoint_url);
        }
        command
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let mut command = self.aws();
        command
            .arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg(from)
            .arg(to);
        process::output(&mut command, "store::s3")?;
        Ok(())
    }
}

/// Extracts the snapshot ids from the JSON output of `aws s3api list-objects-v2`.
fn parse_listing(stdout: &[u8], root: &str) -> Result<Vec<SnapshotId>, StoreError> {
    let stdout = String::from_utf8_lossy(stdout);
    // the CLI prints nothing at all for an empty bucket
    if stdout.trim().is_empty() || stdout.trim() == "null" {
        return Ok(Vec::new());
    }

    let listing: ListObjectsOutput =
        serde_json::from_str(&stdout).map_err(|e| StoreError::Listing(e.to_string()))?;
    let prefixes = listing.common_prefixes.unwrap_or_default();

    Ok(snapshot_ids(prefixes.iter().map(|common| {
        common.prefix.strip_prefix(root).unwrap_or(&common.prefix)
    })))
}

impl SnapshotStore for AwsCliStore {
    fn url(&self, ts: &SnapshotId, name: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.key(ts, name))
    }

    fn required_tools(&self) -> Vec<&str> {
        vec!["aws"]
    }

    fn list(&self) -> Result<Vec<SnapshotId>, StoreError> {
        let root = self.root();
        log::debug!(target: "store::s3", "Listing snapshots in s3://{}/{root}", self.bucket);

        let mut command = self.aws();
        command
            .arg("s3api")
            .arg("list-objects-v2")
            .arg("--bucket")
            .arg(&self.bucket)
            .arg("--delimiter")
            .arg("/")
            .arg("--output")
            .arg("json");
        if !root.is_empty() {
            command.arg("--prefix").arg(&root);
        }

        let output = process::output(&mut command, "store::s3")?;
        parse_listing(&output.stdout, &root)
    }

    fn upload(&self, local: &Path, ts: &SnapshotId, name: &str) -> Result<(), StoreError> {
        let remote = self.url(ts, name);
        log::info!(target: "store::s3", "Uploading {} to {remote}", local.display());
        self.copy(&local.to_string_lossy(), &remote)
    }

    fn fetch(&self, ts: &SnapshotId, name: &str, local: &Path) -> Result<(), StoreError> {
        self.copy(&self.url(ts, name), &local.to_string_lossy())
    }
}
