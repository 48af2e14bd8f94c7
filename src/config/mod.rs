//! Configuration of a backup or restore run.
//!
//! The configuration is assembled once at startup: defaults, overridden by
//! the TOML config file, overridden by environment variables and command line
//! flags (see [`Cli::apply_overrides`](crate::cli::Cli::apply_overrides)).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

use crate::backends::BackendsConfig;
use crate::platform::ComposeServices;
use crate::store::StoreConfig;

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/lms-backup/config.toml";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Configuration of all components.
pub struct Config {
    /// Directory dumps are packaged in.
    pub backup_dir: PathBuf,

    /// Directory downloaded snapshots are cached in.
    pub restore_dir: PathBuf,

    /// Delete the local archive and checksum once both were uploaded.
    pub delete_local: bool,

    /// Where snapshots are published.
    pub store: StoreConfig,

    /// Services stopped during a backup.
    pub services: ComposeServices,

    /// Connection settings of the datastores.
    #[serde(flatten)]
    pub backends: BackendsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_dir: "/var/backups/lms".into(),
            restore_dir: "/var/restore/lms".into(),
            delete_local: false,
            store: StoreConfig::default(),
            services: ComposeServices::default(),
            backends: BackendsConfig::default(),
        }
    }
}

#[derive(Debug, Display, Error)]
/// Errors on loading the config file.
pub enum ConfigError {
    /// The config file can't be read.
    #[display("Reading the config file {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    /// The config file isn't valid.
    #[display("Parsing the config file {} failed: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Config {
    /// Parses a configuration from TOML.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Loads the config file at `path`.
    ///
    /// A missing config file is created with the default configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Self::default();
                if let Err(e) = default_config.write_default(path) {
                    log::warn!("Writing default config to {} failed: {e}", path.display());
                }

                Ok(default_config)
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn write_default(&self, path: &Path) -> io::Result<()> {
        let config_str = toml::to_string_pretty(self).map_err(io::Error::other)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, config_str)
    }
}

#[cfg(test)]
mod tests {
    use crate::backends::ImportMode;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            backup_dir = "/srv/backups"

            [store]
            url = "s3://bucket/prefix"

            [mysql]
            host = "mysql"
            import_mode = "container"
            "#,
        )
        .unwrap();

        assert_eq!(config.backup_dir, PathBuf::from("/srv/backups"));
        assert_eq!(config.restore_dir, Config::default().restore_dir);
        assert_eq!(config.store.url, "s3://bucket/prefix");
        assert_eq!(config.backends.mysql.host, "mysql");
        assert_eq!(config.backends.mysql.port, 3306);
        assert_eq!(config.backends.mysql.import_mode, ImportMode::Container);
        assert_eq!(config.backends.mongodb, Default::default());
    }

    #[test]
    fn default_config_round_trips() {
        let content = toml::to_string_pretty(&Config::default()).unwrap();
        assert_eq!(Config::from_toml(&content).unwrap(), Config::default());
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/config.toml");

        assert_eq!(Config::load(&path).unwrap(), Config::default());
        assert!(path.is_file());
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "delete_local = \"maybe\"").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }
}
