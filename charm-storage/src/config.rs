// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing the charm's storage configuration file.

use crate::identity::{StorageIdentity, UnitName};
use crate::provision::ProvisioningTarget;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/charm-storage/config.toml";

/// Configuration of the storage charm.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Ceph-backed block storage. Absent if the unit uses none.
    pub ceph: Option<CephConfig>,
    /// The service directory which may move onto external storage.
    pub volume: Option<VolumeConfig>,
    #[serde(default)]
    pub commands: CommandsConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CephConfig {
    /// Name of the RBD image backing this unit.
    pub rbd_name: String,
    /// Size of the image, in gigabytes.
    pub block_size_gb: u64,
    /// Pool to create the image in; defaults to the service name.
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default = "default_replication_count")]
    pub replication_count: u32,
    #[serde(default = "default_fstype")]
    pub fstype: String,
    pub mount_point: Utf8PathBuf,
    /// Block device of the mapped image; defaults to the udev alias
    /// `/dev/rbd/<pool>/<image>`.
    #[serde(default)]
    pub device: Option<Utf8PathBuf>,
    /// Services which keep their data on this storage.
    #[serde(default)]
    pub dependent_services: Vec<String>,
}

fn default_replication_count() -> u32 {
    3
}

fn default_fstype() -> String {
    "ext4".to_string()
}

impl CephConfig {
    pub fn identity(&self, unit: &UnitName) -> StorageIdentity {
        let identity = StorageIdentity::new(unit.service(), &self.rbd_name);
        match &self.pool {
            Some(pool) => identity.with_pool(pool),
            None => identity,
        }
    }

    pub fn target(&self, identity: &StorageIdentity) -> ProvisioningTarget {
        let device = self.device.clone().unwrap_or_else(|| {
            Utf8PathBuf::from(format!(
                "/dev/rbd/{}/{}",
                identity.pool, identity.image
            ))
        });
        ProvisioningTarget {
            size_mb: self.block_size_gb.saturating_mul(1024),
            fstype: self.fstype.clone(),
            device,
            mount_point: self.mount_point.clone(),
            replicas: self.replication_count,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VolumeConfig {
    pub service_dir: Utf8PathBuf,
    /// The preserved directory is `<service_dir>.<saved_suffix>`.
    #[serde(default = "default_saved_suffix")]
    pub saved_suffix: String,
    /// Owner of everything on external storage.
    pub service_user: String,
    /// Stopped while the service directory changes.
    #[serde(default)]
    pub services: Vec<String>,
}

fn default_saved_suffix() -> String {
    "charm_saved".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandsConfig {
    /// Kill host commands running longer than this. Unbounded if unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandsConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    const EXAMPLE: &str = r#"
[ceph]
rbd_name = "mysql1"
block_size_gb = 5
replication_count = 2
mount_point = "/srv/ceph"
dependent_services = ["mysql"]

[volume]
service_dir = "/var/lib/solr"
service_user = "jetty"
services = ["jetty"]

[commands]
timeout_secs = 300
"#;

    fn write_config(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_example() {
        let dir = Utf8TempDir::new().unwrap();
        let config = Config::from_file(&write_config(&dir, EXAMPLE)).unwrap();

        let ceph = config.ceph.unwrap();
        assert_eq!(ceph.fstype, "ext4");
        let identity = ceph.identity(&"mysql/0".parse().unwrap());
        assert_eq!(identity, StorageIdentity::new("mysql", "mysql1"));

        let target = ceph.target(&identity);
        assert_eq!(target.size_mb, 5 * 1024);
        assert_eq!(target.replicas, 2);
        assert_eq!(target.device, "/dev/rbd/mysql/mysql1");

        let volume = config.volume.unwrap();
        assert_eq!(volume.saved_suffix, "charm_saved");
        assert_eq!(
            config.commands.timeout(),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_sections_are_optional() {
        let dir = Utf8TempDir::new().unwrap();
        let config = Config::from_file(&write_config(&dir, "")).unwrap();
        assert_eq!(config.ceph, None);
        assert_eq!(config.volume, None);
        assert_eq!(config.commands.timeout(), None);
    }

    #[test]
    fn test_load_errors_name_the_file() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(&dir, "[ceph]\nrbd_name = 3\n");
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
        assert!(err.to_string().contains(path.as_str()));

        let err =
            Config::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
